//! Skip-if-already-satisfied wrappers around coordinator entries
//!
//! A [`Precondition`] is evaluated against a fresh status snapshot just
//! before its batch is submitted. Unknown state is never taken as
//! satisfied, with one exception: the APOGEE shutter, whose contradictory
//! limit switches are a hard error.

use crate::config::WarmupTimes;
use crate::error::{SopError, SopResult};
use crate::message::{Device, MessageKind};
use crate::status::Models;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct Precondition {
    pub device: Device,
    pub kind: MessageKind,
    pub timeout: Option<Duration>,
}

impl Precondition {
    pub fn new(device: Device, kind: MessageKind) -> Self {
        Self {
            device,
            kind,
            timeout: None,
        }
    }

    pub fn lamp(device: Device, on: bool) -> Self {
        Self::new(device, MessageKind::LampOn { on, delay: None })
    }

    pub fn ffs(open: bool) -> Self {
        Self::new(Device::Ffs, MessageKind::FfsMove { open })
    }

    pub fn apogee_shutter(open: bool) -> Self {
        Self::new(Device::Apogee, MessageKind::ApogeeShutter { open })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether the wrapped message must be sent
    ///
    /// For lamps being switched on this also writes the remaining warm-up
    /// into the message's `delay`.
    pub fn required(&mut self, models: &Models, warmup: &WarmupTimes, now: Instant) -> SopResult<bool> {
        match (&mut self.kind, self.device) {
            (MessageKind::LampOn { on, delay }, device) if device.is_lamp() => {
                let warmup = warmup.for_lamp(device).unwrap_or(Duration::ZERO);
                let (is_on, since) = match lamp_is_on(models, device, now) {
                    Some(reading) => reading,
                    None => {
                        tracing::debug!("{} lamp status unknown; switching anyway", device);
                        if *on && !warmup.is_zero() {
                            *delay = Some(round_up_secs(warmup));
                        }
                        return Ok(true);
                    }
                };

                if !*on {
                    return Ok(is_on);
                }

                let since = if is_on { since } else { Duration::ZERO };
                let remaining = warmup.saturating_sub(since);
                if remaining.is_zero() {
                    return Ok(!is_on);
                }
                *delay = Some(round_up_secs(remaining));
                Ok(true)
            }
            (MessageKind::FfsMove { open }, Device::Ffs) => Ok(match ffs_are_open(models) {
                Some(current) => current != *open,
                None => true,
            }),
            (MessageKind::ApogeeShutter { open }, Device::Apogee) => {
                Ok(apogee_shutter_is_open(models)? != *open)
            }
            (kind, device) => Err(SopError::InvalidPrecondition {
                device,
                kind: kind.name().to_string(),
            }),
        }
    }
}

fn round_up_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs_f64().ceil() as u64)
}

/// Lamp state and time since its last transition
///
/// UV and WHT lamps only report their commanded state, with no transition time.
pub fn lamp_is_on(models: &Models, device: Device, now: Instant) -> Option<(bool, Duration)> {
    match device {
        Device::UvLamp => models.uv_commanded_on.map(|on| (on, Duration::ZERO)),
        Device::WhtLamp => models.wht_commanded_on.map(|on| (on, Duration::ZERO)),
        _ => models
            .lamp(device)
            .map(|reading| (reading.is_on(), reading.time_since_transition(now))),
    }
}

/// `Some(true)` if all petals are open, `Some(false)` if all are closed,
/// `None` if indeterminate or unknown
pub fn ffs_are_open(models: &Models) -> Option<bool> {
    let petals = models.ffs_petals.as_ref()?;
    if petals.is_empty() {
        return None;
    }
    let open = petals.iter().filter(|p| p.open && !p.closed).count();
    let closed = petals.iter().filter(|p| p.closed && !p.open).count();
    if open == petals.len() {
        Some(true)
    } else if closed == petals.len() {
        Some(false)
    } else {
        None
    }
}

pub fn apogee_shutter_is_open(models: &Models) -> SopResult<bool> {
    match models.apogee_shutter {
        Some((true, false)) => Ok(true),
        Some((false, true)) => Ok(false),
        Some((open, closed)) => Err(SopError::IndeterminateState {
            device: Device::Apogee,
            detail: format!("shutter limit switches read open={} closed={}", open, closed),
        }),
        None => Err(SopError::IndeterminateState {
            device: Device::Apogee,
            detail: "shutter limit switches unavailable".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{LampReading, PetalState};

    fn lamp_delay(p: &Precondition) -> Option<Duration> {
        match p.kind {
            MessageKind::LampOn { delay, .. } => delay,
            _ => None,
        }
    }

    fn warmup(hgcd: f64) -> WarmupTimes {
        WarmupTimes {
            hgcd,
            ..WarmupTimes::default()
        }
    }

    #[test]
    fn test_lamp_warming_up_injects_remaining_delay() {
        let now = Instant::now();
        let mut models = Models::default();
        models.hgcd_lamp = Some(LampReading::new(true, now - Duration::from_secs(5)));

        let mut p = Precondition::lamp(Device::HgCdLamp, true);
        assert!(p.required(&models, &warmup(30.0), now).unwrap());
        assert_eq!(lamp_delay(&p), Some(Duration::from_secs(25)));
    }

    #[test]
    fn test_warm_lamp_is_satisfied() {
        let now = Instant::now();
        let mut models = Models::default();
        models.hgcd_lamp = Some(LampReading::new(true, now - Duration::from_secs(45)));

        let mut p = Precondition::lamp(Device::HgCdLamp, true);
        assert!(!p.required(&models, &warmup(30.0), now).unwrap());
        assert_eq!(lamp_delay(&p), None);
    }

    #[test]
    fn test_off_lamp_being_turned_on_waits_full_warmup() {
        let now = Instant::now();
        let mut models = Models::default();
        models.ne_lamp = Some(LampReading::new(false, now - Duration::from_secs(600)));

        let mut p = Precondition::lamp(Device::NeLamp, true);
        assert!(p.required(&models, &WarmupTimes::default(), now).unwrap());
        assert_eq!(lamp_delay(&p), Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_lamp_off_required_only_when_on() {
        let now = Instant::now();
        let mut models = Models::default();
        models.ff_lamp = Some(LampReading::new(false, now));
        models.wht_commanded_on = Some(true);

        assert!(!Precondition::lamp(Device::FfLamp, false)
            .required(&models, &WarmupTimes::default(), now)
            .unwrap());
        assert!(Precondition::lamp(Device::WhtLamp, false)
            .required(&models, &WarmupTimes::default(), now)
            .unwrap());
    }

    #[test]
    fn test_partially_lit_lamp_is_off() {
        let now = Instant::now();
        let mut models = Models::default();
        let mut reading = LampReading::new(true, now - Duration::from_secs(500));
        reading.elements_on[0] = false;
        models.ff_lamp = Some(reading);

        let mut p = Precondition::lamp(Device::FfLamp, true);
        assert!(p.required(&models, &WarmupTimes::default(), now).unwrap());
        assert_eq!(lamp_delay(&p), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_unknown_lamp_always_required() {
        let now = Instant::now();
        let models = Models::default();
        assert!(Precondition::lamp(Device::HgCdLamp, false)
            .required(&models, &WarmupTimes::default(), now)
            .unwrap());
        assert!(Precondition::lamp(Device::UvLamp, true)
            .required(&models, &WarmupTimes::default(), now)
            .unwrap());
    }

    #[test]
    fn test_indeterminate_ffs_requires_move() {
        let now = Instant::now();
        let mut models = Models::default();
        let mut petals = vec![PetalState::OPEN; 4];
        petals.extend(vec![PetalState::CLOSED; 4]);
        models.ffs_petals = Some(petals);

        assert_eq!(ffs_are_open(&models), None);
        assert!(Precondition::ffs(true)
            .required(&models, &WarmupTimes::default(), now)
            .unwrap());
        assert!(Precondition::ffs(false)
            .required(&models, &WarmupTimes::default(), now)
            .unwrap());
    }

    #[test]
    fn test_ffs_in_desired_state_not_required() {
        let now = Instant::now();
        let mut models = Models::default();
        models.set_ffs(false);
        assert!(!Precondition::ffs(false)
            .required(&models, &WarmupTimes::default(), now)
            .unwrap());
        assert!(Precondition::ffs(true)
            .required(&models, &WarmupTimes::default(), now)
            .unwrap());
    }

    #[test]
    fn test_conflicting_shutter_is_an_error() {
        let now = Instant::now();
        let mut models = Models::default();
        models.apogee_shutter = Some((true, true));
        let err = Precondition::apogee_shutter(false)
            .required(&models, &WarmupTimes::default(), now)
            .unwrap_err();
        assert!(matches!(err, SopError::IndeterminateState { device: Device::Apogee, .. }));

        models.set_apogee_shutter(true);
        assert!(Precondition::apogee_shutter(false)
            .required(&models, &WarmupTimes::default(), now)
            .unwrap());
    }

    #[test]
    fn test_mismatched_kind_rejected() {
        let now = Instant::now();
        let mut p = Precondition::new(Device::Boss, MessageKind::FfsMove { open: true });
        assert!(matches!(
            p.required(&Models::default(), &WarmupTimes::default(), now),
            Err(SopError::InvalidPrecondition { .. })
        ));
    }
}
