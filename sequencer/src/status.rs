//! Live device status as published by the instruments
//!
//! The sequencer never polls hardware itself: whatever feeds the actor's
//! keyword models writes into a [`StatusModel`], and preconditions and
//! procedures read snapshots of it.

use crate::bypass::Bypass;
use crate::message::Device;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Lamp bank with four elements and a transition time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LampReading {
    pub elements_on: [bool; 4],
    pub changed_at: Instant,
}

impl LampReading {
    pub fn new(on: bool, changed_at: Instant) -> Self {
        Self {
            elements_on: [on; 4],
            changed_at,
        }
    }

    /// On only when every element is on
    pub fn is_on(&self) -> bool {
        self.elements_on.iter().all(|e| *e)
    }

    pub fn time_since_transition(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.changed_at)
    }
}

/// Limit switches of one flat-field screen petal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PetalState {
    pub open: bool,
    pub closed: bool,
}

impl PetalState {
    pub const OPEN: PetalState = PetalState { open: true, closed: false };
    pub const CLOSED: PetalState = PetalState { open: false, closed: true };
}

/// Where the APOGEE gang connector is plugged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GangPosition {
    Unknown,
    Disconnected,
    Cartridge,
    Podium,
}

/// BOSS camera exposure state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BossExposureState {
    Idle,
    Integrating,
    Paused,
    Reading,
    Done,
    Aborted,
    Legible,
}

impl BossExposureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BossExposureState::Idle => "IDLE",
            BossExposureState::Integrating => "INTEGRATING",
            BossExposureState::Paused => "PAUSED",
            BossExposureState::Reading => "READING",
            BossExposureState::Done => "DONE",
            BossExposureState::Aborted => "ABORTED",
            BossExposureState::Legible => "LEGIBLE",
        }
    }

    /// States in which it is safe to start moving the telescope
    pub fn allows_slew(&self) -> bool {
        matches!(
            self,
            BossExposureState::Reading
                | BossExposureState::Idle
                | BossExposureState::Done
                | BossExposureState::Aborted
        )
    }
}

/// Telescope control status
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TccStatus {
    /// az, alt, rot in degrees
    pub axe_pos: [f64; 3],
    pub slewing: bool,
    pub halted: bool,
    pub bad_stat: bool,
}

impl Default for TccStatus {
    fn default() -> Self {
        Self {
            axe_pos: [121.0, 90.0, 0.0],
            slewing: false,
            halted: false,
            bad_stat: false,
        }
    }
}

/// Plate pointing centre
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pointing {
    pub ra: f64,
    pub dec: f64,
}

/// Snapshot of everything the sequencer consults
#[derive(Debug, Clone, PartialEq)]
pub struct Models {
    pub ff_lamp: Option<LampReading>,
    pub hgcd_lamp: Option<LampReading>,
    pub ne_lamp: Option<LampReading>,
    pub uv_commanded_on: Option<bool>,
    pub wht_commanded_on: Option<bool>,
    pub ffs_petals: Option<Vec<PetalState>>,
    pub ffs_commanded_open: Option<bool>,
    /// APOGEE cold shutter limit switches (open, closed)
    pub apogee_shutter: Option<(bool, bool)>,
    pub apogee_dither: Option<char>,
    pub gang: GangPosition,
    pub tcc: TccStatus,
    pub boss_exposure_state: BossExposureState,
    pub pointing: Option<Pointing>,
}

impl Default for Models {
    fn default() -> Self {
        Self {
            ff_lamp: None,
            hgcd_lamp: None,
            ne_lamp: None,
            uv_commanded_on: None,
            wht_commanded_on: None,
            ffs_petals: None,
            ffs_commanded_open: None,
            apogee_shutter: None,
            apogee_dither: None,
            gang: GangPosition::Unknown,
            tcc: TccStatus::default(),
            boss_exposure_state: BossExposureState::Idle,
            pointing: None,
        }
    }
}

impl Models {
    /// A quiescent telescope: lamps off long ago, screens open, shutter closed
    pub fn quiescent(now: Instant) -> Self {
        let long_ago = now.checked_sub(Duration::from_secs(3600)).unwrap_or(now);
        Self {
            ff_lamp: Some(LampReading::new(false, long_ago)),
            hgcd_lamp: Some(LampReading::new(false, long_ago)),
            ne_lamp: Some(LampReading::new(false, long_ago)),
            uv_commanded_on: Some(false),
            wht_commanded_on: Some(false),
            ffs_petals: Some(vec![PetalState::OPEN; 8]),
            ffs_commanded_open: Some(true),
            apogee_shutter: Some((false, true)),
            apogee_dither: Some('A'),
            gang: GangPosition::Podium,
            tcc: TccStatus::default(),
            boss_exposure_state: BossExposureState::Idle,
            pointing: Some(Pointing { ra: 150.0, dec: 30.0 }),
        }
    }

    pub fn lamp(&self, device: Device) -> Option<&LampReading> {
        match device {
            Device::FfLamp => self.ff_lamp.as_ref(),
            Device::HgCdLamp => self.hgcd_lamp.as_ref(),
            Device::NeLamp => self.ne_lamp.as_ref(),
            _ => None,
        }
    }

    /// Record a lamp switch at `now`
    pub fn set_lamp(&mut self, device: Device, on: bool, now: Instant) {
        let reading = Some(LampReading::new(on, now));
        match device {
            Device::FfLamp => self.ff_lamp = reading,
            Device::HgCdLamp => self.hgcd_lamp = reading,
            Device::NeLamp => self.ne_lamp = reading,
            Device::UvLamp => self.uv_commanded_on = Some(on),
            Device::WhtLamp => self.wht_commanded_on = Some(on),
            _ => {}
        }
    }

    pub fn set_ffs(&mut self, open: bool) {
        let petal = if open { PetalState::OPEN } else { PetalState::CLOSED };
        self.ffs_petals = Some(vec![petal; 8]);
        self.ffs_commanded_open = Some(open);
    }

    pub fn set_apogee_shutter(&mut self, open: bool) {
        self.apogee_shutter = Some((open, !open));
    }

    /// Gang connector at the cartridge, honouring the gang bypasses
    pub fn gang_at_cartridge(&self, bypass: &Bypass) -> bool {
        if bypass.get("gangCart") {
            return true;
        }
        if bypass.get("gangPodium") {
            return false;
        }
        self.gang == GangPosition::Cartridge
    }
}

/// Shared, updatable device status
#[derive(Debug, Default)]
pub struct StatusModel {
    models: RwLock<Models>,
}

pub type SharedStatus = Arc<StatusModel>;

impl StatusModel {
    pub fn new(models: Models) -> Self {
        Self {
            models: RwLock::new(models),
        }
    }

    pub fn snapshot(&self) -> Models {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update<F>(&self, updater: F)
    where
        F: FnOnce(&mut Models),
    {
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        updater(&mut models);
    }
}
