//! Timing and default-parameter configuration

use crate::message::Device;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lamp warm-up times in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupTimes {
    pub ff: f64,
    pub hgcd: f64,
    pub ne: f64,
    pub uv: f64,
    pub wht: f64,
}

impl Default for WarmupTimes {
    fn default() -> Self {
        Self {
            ff: 60.0,
            hgcd: 120.0,
            ne: 20.0,
            uv: 0.0,
            wht: 0.0,
        }
    }
}

impl WarmupTimes {
    /// Warm-up for a lamp device; `None` for anything that is not a lamp
    pub fn for_lamp(&self, device: Device) -> Option<Duration> {
        let secs = match device {
            Device::FfLamp => self.ff,
            Device::HgCdLamp => self.hgcd,
            Device::NeLamp => self.ne,
            Device::UvLamp => self.uv,
            Device::WhtLamp => self.wht,
            _ => return None,
        };
        Some(secs_to_duration(secs))
    }
}

/// Default values for user command keywords
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandDefaults {
    pub arc_time: f64,
    pub flat_time: f64,
    pub guider_flat_time: f64,
    pub guider_time: f64,
    pub science_exp_time: f64,
    pub science_nexp: u32,
    pub apogee_exp_time: f64,
    pub apogee_dither_seq: String,
    pub apogee_seq_count: u32,
    pub sky_flat_exp_time: f64,
    pub dithered_flat_n_step: u32,
    pub dithered_flat_n_tick: i32,
    pub dithered_flat_exp_time: f64,
    pub gang_change_alt: f64,
}

impl Default for CommandDefaults {
    fn default() -> Self {
        Self {
            arc_time: 4.0,
            flat_time: 30.0,
            guider_flat_time: 0.5,
            guider_time: 5.0,
            science_exp_time: 900.0,
            science_nexp: 1,
            apogee_exp_time: 600.0,
            apogee_dither_seq: "ABBA".to_string(),
            apogee_seq_count: 2,
            sky_flat_exp_time: 150.0,
            dithered_flat_n_step: 22,
            dithered_flat_n_tick: 62,
            dithered_flat_exp_time: 30.0,
            gang_change_alt: 45.0,
        }
    }
}

/// Sequencer configuration
///
/// All times are seconds. `timeout_secs` is the general actor timeout: the
/// worker heartbeat interval and the slack added to every batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SopConfig {
    pub timeout_secs: f64,
    pub ffs_duration_secs: f64,
    pub flush_duration_secs: f64,
    pub readout_duration_secs: f64,
    pub guider_readout_secs: f64,
    pub hartmann_duration_secs: f64,
    /// Per-exposure overhead for directly commanded BOSS exposures
    pub exposure_overhead_secs: f64,
    pub slew_timeout_secs: f64,
    pub hartmann_delay_secs: f64,
    pub guider_delay_secs: f64,
    pub gang_change_slew_secs: f64,
    pub position_slew_secs: f64,
    pub apogee_dither_secs: f64,
    pub apogee_dome_flat_secs: f64,
    /// Poll interval while waiting for a slew to end
    pub slew_poll_secs: f64,
    /// How long a status fan-out waits for every worker
    pub status_timeout_secs: f64,
    pub warmup: WarmupTimes,
    pub defaults: CommandDefaults,
}

impl Default for SopConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10.0,
            ffs_duration_secs: 10.0,
            flush_duration_secs: 25.0,
            readout_duration_secs: 90.0,
            guider_readout_secs: 1.0,
            hartmann_duration_secs: 240.0,
            exposure_overhead_secs: 150.0,
            slew_timeout_secs: 180.0,
            hartmann_delay_secs: 210.0,
            guider_delay_secs: 20.0,
            gang_change_slew_secs: 60.0,
            position_slew_secs: 210.0,
            apogee_dither_secs: 30.0,
            apogee_dome_flat_secs: 50.0,
            slew_poll_secs: 1.0,
            status_timeout_secs: 5.0,
            warmup: WarmupTimes::default(),
            defaults: CommandDefaults::default(),
        }
    }
}

impl SopConfig {
    pub fn timeout(&self) -> Duration {
        secs_to_duration(self.timeout_secs)
    }

    /// Actor timeout plus `extra` seconds
    pub fn timeout_plus(&self, extra: f64) -> Duration {
        secs_to_duration(self.timeout_secs + extra)
    }

    pub fn readout_duration(&self) -> Duration {
        secs_to_duration(self.readout_duration_secs)
    }

    pub fn slew_poll(&self) -> Duration {
        secs_to_duration(self.slew_poll_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        secs_to_duration(self.status_timeout_secs)
    }
}

/// Seconds to Duration, clamping negative and non-finite values to zero
pub fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_lookup() {
        let warmup = WarmupTimes::default();
        assert_eq!(warmup.for_lamp(Device::HgCdLamp), Some(Duration::from_secs(120)));
        assert_eq!(warmup.for_lamp(Device::UvLamp), Some(Duration::ZERO));
        assert_eq!(warmup.for_lamp(Device::Boss), None);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SopConfig =
            serde_json::from_str(r#"{"timeout_secs": 2.5, "warmup": {"hgcd": 30}}"#).unwrap();
        assert_eq!(config.timeout(), Duration::from_millis(2500));
        assert_eq!(config.warmup.hgcd, 30.0);
        assert_eq!(config.warmup.ff, 60.0);
        assert_eq!(config.readout_duration_secs, 90.0);
        assert_eq!(config.defaults.apogee_dither_seq, "ABBA");
    }

    #[test]
    fn test_secs_to_duration_clamps() {
        assert_eq!(secs_to_duration(-1.0), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::NAN), Duration::ZERO);
        assert_eq!(secs_to_duration(1.5), Duration::from_millis(1500));
    }
}
