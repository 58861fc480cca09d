//! Device Operations Trait
//!
//! This module defines the interface the device workers use to command the
//! instruments. Formatting and sending the actual device commands is up to
//! the implementation; the sequencer only sees success or a failure reason.

use crate::message::{Device, Exposure, SlewTarget, Spectrograph};
use crate::status::SharedStatus;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Result type for device operations; `Err` carries the failure reason
pub type DeviceResult<T> = Result<T, String>;

/// Trait defining all device operations needed by the sequencer
///
/// Every call is bounded by `time_limit`; implementations must give up and
/// return `Err` once it has passed.
#[async_trait]
pub trait DeviceOps: Send + Sync {
    // =========================================================================
    // LAMPS AND FLAT-FIELD SCREEN
    // =========================================================================

    /// Switch a calibration lamp bank
    async fn lamp_switch(&self, lamp: Device, on: bool, time_limit: Duration) -> DeviceResult<()>;

    /// Open or close the flat-field screen petals
    async fn ffs_move(&self, open: bool, time_limit: Duration) -> DeviceResult<()>;

    // =========================================================================
    // BOSS SPECTROGRAPHS
    // =========================================================================

    /// Take (or read out) a BOSS exposure
    async fn boss_expose(&self, exposure: &Exposure, time_limit: Duration) -> DeviceResult<()>;

    /// Stop the running exposure and read it out
    async fn boss_stop_exposure(&self, time_limit: Duration) -> DeviceResult<()>;

    /// Run the Hartmann collimation sequence
    async fn boss_hartmann(&self, time_limit: Duration) -> DeviceResult<()>;

    /// Move a collimator by the given piston ticks
    async fn boss_move_collimator(
        &self,
        spectrograph: Spectrograph,
        a: i32,
        b: i32,
        c: i32,
        time_limit: Duration,
    ) -> DeviceResult<()>;

    // =========================================================================
    // GUIDER
    // =========================================================================

    async fn guider_start(&self, exp_time: f64, clear_corrections: bool, time_limit: Duration) -> DeviceResult<()>;

    async fn guider_stop(&self, time_limit: Duration) -> DeviceResult<()>;

    async fn guider_flat(&self, exp_time: f64, time_limit: Duration) -> DeviceResult<()>;

    // =========================================================================
    // TELESCOPE
    // =========================================================================

    /// Start tracking/slewing to a target; returns once the move is commanded
    async fn tcc_track(&self, target: &SlewTarget, time_limit: Duration) -> DeviceResult<()>;

    async fn tcc_axis_stop(&self, time_limit: Duration) -> DeviceResult<()>;

    /// Offset the boresight in degrees on the sky
    async fn tcc_offset(&self, ra_deg: f64, dec_deg: f64, time_limit: Duration) -> DeviceResult<()>;

    // =========================================================================
    // APOGEE
    // =========================================================================

    async fn apogee_dither(&self, position: char, time_limit: Duration) -> DeviceResult<()>;

    async fn apogee_expose(&self, exposure: &Exposure, time_limit: Duration) -> DeviceResult<()>;

    async fn apogee_stop_exposure(&self, time_limit: Duration) -> DeviceResult<()>;

    async fn apogee_shutter(&self, open: bool, time_limit: Duration) -> DeviceResult<()>;
}

/// Shared handle to a device operations implementation
pub type SharedDeviceOps = Arc<dyn DeviceOps>;

/// Simulated instruments
///
/// Every operation succeeds immediately and its effect is written into the
/// status model, so preconditions see the telescope change state. Individual
/// operations can be made to fail, to hang past their time limit, or to
/// wait for [`release`](SimulatedDeviceOps::release) before succeeding.
pub struct SimulatedDeviceOps {
    status: SharedStatus,
    fail_on: Mutex<HashSet<String>>,
    hang_on: Mutex<HashSet<String>>,
    hold_on: Mutex<HashSet<String>>,
    released: Notify,
    calls: Mutex<Vec<String>>,
}

impl SimulatedDeviceOps {
    pub fn new(status: SharedStatus) -> Self {
        Self {
            status,
            fail_on: Mutex::new(HashSet::new()),
            hang_on: Mutex::new(HashSet::new()),
            hold_on: Mutex::new(HashSet::new()),
            released: Notify::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Make every call whose record starts with `prefix` fail
    pub fn fail_on(&self, prefix: impl Into<String>) {
        self.fail_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(prefix.into());
    }

    /// Make every call whose record starts with `prefix` sleep out its time limit
    pub fn hang_on(&self, prefix: impl Into<String>) {
        self.hang_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(prefix.into());
    }

    /// Hold every call whose record starts with `prefix` until released
    ///
    /// A held call still gives up once its time limit has passed.
    pub fn hold_on(&self, prefix: impl Into<String>) {
        self.hold_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(prefix.into());
    }

    /// Let held calls matching `prefix` succeed, now and later
    pub fn release(&self, prefix: &str) {
        self.hold_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(prefix);
        self.released.notify_waiters();
    }

    pub fn clear_faults(&self) {
        self.fail_on.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.hang_on.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.hold_on.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.released.notify_waiters();
    }

    async fn wait_for_release(&self, call: &str, time_limit: Duration) -> DeviceResult<()> {
        let deadline = Instant::now() + time_limit;
        loop {
            let released = self.released.notified();
            if !Self::matches(&self.hold_on, call) {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(format!("{} timed out after {:.1}s", call, time_limit.as_secs_f64()));
            }
        }
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn matches(set: &Mutex<HashSet<String>>, call: &str) -> bool {
        set.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|prefix| call.starts_with(prefix.as_str()))
    }

    /// Record the call and apply injected faults
    async fn call(&self, call: String, time_limit: Duration) -> DeviceResult<()> {
        tracing::info!("[SIM] {}", call);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.clone());

        if Self::matches(&self.hang_on, &call) {
            tokio::time::sleep(time_limit).await;
            return Err(format!("{} timed out after {:.1}s", call, time_limit.as_secs_f64()));
        }
        if Self::matches(&self.fail_on, &call) {
            return Err(format!("{} failed", call));
        }
        self.wait_for_release(&call, time_limit).await
    }
}

fn exposure_record(prefix: &str, exposure: &Exposure) -> String {
    if exposure.is_readout_only() {
        return format!("{} readout", prefix);
    }
    let mut record = format!("{} {} itime={}", prefix, exposure.exp_type, exposure.exp_time);
    if let Some(screen) = exposure.hartmann {
        record.push_str(&format!(" hartmann={}", screen.as_str()));
    }
    if !exposure.readout {
        record.push_str(" noreadout");
    }
    record
}

#[async_trait]
impl DeviceOps for SimulatedDeviceOps {
    async fn lamp_switch(&self, lamp: Device, on: bool, time_limit: Duration) -> DeviceResult<()> {
        self.call(format!("{}.{}", lamp.name(), if on { "on" } else { "off" }), time_limit)
            .await?;
        self.status.update(|m| m.set_lamp(lamp, on, Instant::now()));
        Ok(())
    }

    async fn ffs_move(&self, open: bool, time_limit: Duration) -> DeviceResult<()> {
        self.call(format!("ffs.{}", if open { "open" } else { "close" }), time_limit)
            .await?;
        self.status.update(|m| m.set_ffs(open));
        Ok(())
    }

    async fn boss_expose(&self, exposure: &Exposure, time_limit: Duration) -> DeviceResult<()> {
        self.call(exposure_record("boss exposure", exposure), time_limit).await
    }

    async fn boss_stop_exposure(&self, time_limit: Duration) -> DeviceResult<()> {
        self.call("boss exposure stop".to_string(), time_limit).await
    }

    async fn boss_hartmann(&self, time_limit: Duration) -> DeviceResult<()> {
        self.call("boss hartmann".to_string(), time_limit).await
    }

    async fn boss_move_collimator(
        &self,
        spectrograph: Spectrograph,
        a: i32,
        b: i32,
        c: i32,
        time_limit: Duration,
    ) -> DeviceResult<()> {
        self.call(
            format!("boss moveColl spec={} a={} b={} c={}", spectrograph.as_str(), a, b, c),
            time_limit,
        )
        .await
    }

    async fn guider_start(&self, exp_time: f64, clear_corrections: bool, time_limit: Duration) -> DeviceResult<()> {
        let clear = if clear_corrections { " clearCorrections" } else { "" };
        self.call(format!("guider on time={}{}", exp_time, clear), time_limit)
            .await
    }

    async fn guider_stop(&self, time_limit: Duration) -> DeviceResult<()> {
        self.call("guider off".to_string(), time_limit).await
    }

    async fn guider_flat(&self, exp_time: f64, time_limit: Duration) -> DeviceResult<()> {
        self.call(format!("guider flat time={}", exp_time), time_limit).await
    }

    async fn tcc_track(&self, target: &SlewTarget, time_limit: Duration) -> DeviceResult<()> {
        let record = match target {
            SlewTarget::Sky { ra, dec, rot, keep_offsets } => format!(
                "tcc track {}, {} icrs /rottype=object/rotang={}{}",
                ra,
                dec,
                rot,
                if *keep_offsets { " /keep" } else { "" }
            ),
            SlewTarget::Mount { az, alt, rot } => {
                format!("tcc track {}, {} mount/rottype=mount/rotangle={}", az, alt, rot)
            }
        };
        self.call(record, time_limit).await?;
        let target = *target;
        self.status.update(|m| {
            if let SlewTarget::Mount { az, alt, rot } = target {
                m.tcc.axe_pos = [az, alt, rot];
            }
            m.tcc.slewing = false;
            m.tcc.halted = false;
        });
        Ok(())
    }

    async fn tcc_axis_stop(&self, time_limit: Duration) -> DeviceResult<()> {
        self.call("tcc axis stop".to_string(), time_limit).await?;
        self.status.update(|m| m.tcc.slewing = false);
        Ok(())
    }

    async fn tcc_offset(&self, ra_deg: f64, dec_deg: f64, time_limit: Duration) -> DeviceResult<()> {
        self.call(format!("tcc offset arc {},{}", ra_deg, dec_deg), time_limit)
            .await
    }

    async fn apogee_dither(&self, position: char, time_limit: Duration) -> DeviceResult<()> {
        self.call(format!("apogee dither namedpos={}", position), time_limit)
            .await?;
        self.status.update(|m| m.apogee_dither = Some(position));
        Ok(())
    }

    async fn apogee_expose(&self, exposure: &Exposure, time_limit: Duration) -> DeviceResult<()> {
        let mut record = format!("apogee expose time={} object={}", exposure.exp_time, exposure.exp_type);
        if !exposure.comment.is_empty() {
            record.push_str(&format!(" comment={:?}", exposure.comment));
        }
        self.call(record, time_limit).await
    }

    async fn apogee_stop_exposure(&self, time_limit: Duration) -> DeviceResult<()> {
        self.call("apogee expose stop".to_string(), time_limit).await
    }

    async fn apogee_shutter(&self, open: bool, time_limit: Duration) -> DeviceResult<()> {
        self.call(format!("apogee shutter {}", if open { "open" } else { "close" }), time_limit)
            .await?;
        self.status.update(|m| m.set_apogee_shutter(open));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ExposureType;
    use crate::status::{Models, StatusModel};

    fn ops() -> (SharedStatus, SimulatedDeviceOps) {
        let status = Arc::new(StatusModel::new(Models::quiescent(Instant::now())));
        let ops = SimulatedDeviceOps::new(status.clone());
        (status, ops)
    }

    #[tokio::test]
    async fn test_lamp_switch_updates_status() {
        let (status, ops) = ops();
        ops.lamp_switch(Device::HgCdLamp, true, Duration::from_secs(1))
            .await
            .unwrap();
        let models = status.snapshot();
        assert!(models.hgcd_lamp.unwrap().is_on());
        assert_eq!(ops.calls(), vec!["hgcd.on".to_string()]);
    }

    #[tokio::test]
    async fn test_fail_on_prefix() {
        let (status, ops) = ops();
        ops.fail_on("ffs.close");
        assert!(ops.ffs_move(false, Duration::from_secs(1)).await.is_err());
        // Failed move leaves the screen alone
        assert_eq!(status.snapshot().ffs_commanded_open, Some(true));
        assert!(ops.ffs_move(true, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_hang_on_waits_out_time_limit() {
        let (_status, ops) = ops();
        ops.hang_on("boss exposure");
        let started = Instant::now();
        let result = ops
            .boss_expose(&Exposure::new(ExposureType::Bias, 0.0), Duration::from_millis(30))
            .await;
        assert!(result.is_err());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_held_call_succeeds_once_released() {
        let (_status, ops) = ops();
        let ops = Arc::new(ops);
        ops.hold_on("boss exposure arc");

        let held = {
            let ops = ops.clone();
            tokio::spawn(async move {
                ops.boss_expose(&Exposure::new(ExposureType::Arc, 4.0), Duration::from_secs(10))
                    .await
            })
        };
        while ops.count_calls("boss exposure arc") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!held.is_finished());

        ops.release("boss exposure arc");
        let result = tokio::time::timeout(Duration::from_secs(5), held).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_held_call_times_out() {
        let (_status, ops) = ops();
        ops.hold_on("apogee expose");
        let result = ops
            .apogee_expose(&Exposure::new(ExposureType::Dark, 1.0), Duration::from_millis(30))
            .await;
        assert!(result.unwrap_err().contains("timed out"));
    }

    #[test]
    fn test_exposure_records() {
        let arc = Exposure::new(ExposureType::Arc, 4.0).without_readout();
        assert_eq!(exposure_record("boss exposure", &arc), "boss exposure arc itime=4 noreadout");
        assert_eq!(
            exposure_record("boss exposure", &Exposure::pending_readout()),
            "boss exposure readout"
        );
    }
}
