//! # Motor Executable Parameters

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::Deserialize;
use std::time::Duration;

use util::time::seconds_to_std;

use crate::cmd_queue::FollowerParams;
use crate::gpio::PinMap;
use crate::hw_prog::pigpio::DEFAULT_ADDRESS;
use crate::impulse::StepGeometry;
use crate::profile::ProfileConfig;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MotorExecParams {
    /// BCM numbers of the driver lines
    pub pins: PinMap,

    pub geometry: StepGeometry,

    pub profile: ProfileConfig,

    /// Limits used when following the orientation stream
    pub follower: FollowerParams,

    /// How step pulses are timed
    pub timing: TimingMode,

    /// Address of the pigpio daemon, only used with hardware timing
    #[serde(default = "default_pigpiod_address")]
    pub pigpiod_address: String,

    /// Longest wait for the command queue to drain on shutdown.
    ///
    /// Units: seconds
    pub drain_timeout_s: f64,

    /// Longest wait for a hardware run to halt before the next one is started.
    ///
    /// Units: seconds
    pub hw_run_timeout_s: f64,

    /// Keep generated impulse sequences for reuse
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimingMode {
    /// Pulses generated on the host and written by the emitter
    Software,

    /// Pulses generated by the timing program running in the pigpio daemon
    Hardware,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl MotorExecParams {
    pub fn drain_timeout(&self) -> Duration {
        seconds_to_std(self.drain_timeout_s)
    }

    pub fn hw_run_timeout(&self) -> Duration {
        seconds_to_std(self.hw_run_timeout_s)
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn default_pigpiod_address() -> String {
    DEFAULT_ADDRESS.to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gpio::{MicrostepResolution, PinRole};

    #[test]
    fn test_shipped_params_parse() {
        let params: MotorExecParams =
            util::params::from_str(include_str!("../../params/motor_exec.toml")).unwrap();

        assert_eq!(params.pins.gpio(PinRole::Step), Some(24));
        assert_eq!(params.pins.gpio(PinRole::Slp), None);
        assert_eq!(params.geometry.full_steps_per_rev, 200);
        assert_eq!(params.profile.resolution, MicrostepResolution::Sixteenth);
        assert_eq!(params.follower.resolution, MicrostepResolution::Sixteenth);
        assert_eq!(params.timing, TimingMode::Software);
        assert!(params.cache_enabled);
        assert!(params.drain_timeout() > Duration::from_secs(0));
    }

    #[test]
    fn test_optional_fields_default() {
        let src = r#"
            timing = "hardware"
            drain_timeout_s = 1.0
            hw_run_timeout_s = 1.0

            [pins]
            step = 24
            dir = 23
            en = 4
            m1 = 17
            m2 = 27
            m3 = 22
            rst = 5

            [geometry]
            full_steps_per_rev = 400

            [profile]
            inertia_ratio = 1.0
            phase_switch_frequency = 200.0
            resolution = "eighth"

            [follower]
            message_interval_s = 0.1
            min_frequency_hz = 300.0
            max_frequency_hz = 15000.0
            max_acceleration = 50.0
            resolution = "sixteenth"
        "#;

        let params: MotorExecParams = util::params::from_str(src).unwrap();
        assert_eq!(params.timing, TimingMode::Hardware);
        assert_eq!(params.pigpiod_address, DEFAULT_ADDRESS);
        assert_eq!(params.pins.gpio(PinRole::Rst), Some(5));
        assert!(params.cache_enabled);
    }

    #[test]
    fn test_unknown_timing_mode_rejected() {
        let src = include_str!("../../params/motor_exec.toml")
            .replace("timing = \"software\"", "timing = \"dma\"");
        assert!(util::params::from_str::<MotorExecParams>(&src).is_err());
    }
}
