//! # Hardware timing program
//!
//! The ramp recurrence re-expressed in fixed point as a program for the pigpio daemon's script
//! engine. Once started the engine toggles the STEP line itself, so the pulse timing is immune to
//! host scheduling jitter.
//!
//! The program computes `t = 1 / (a + b * S)` where `S` is the time elapsed since the start of the
//! ramp. This is the same sequence as [`crate::impulse::impulse_durations`] seeded with `1/a` and
//! `k = b`.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod engine;
pub mod fixed;
pub mod interp;
pub mod isa;
pub mod pigpio;
pub mod program;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::Serialize;

use crate::impulse::{impulse_durations, ImpulseError, StepPeriodSequence, StopRule};
use interp::{Interpreter, NullSink, ShiftModel};
use isa::{Reg, Tag};
use program::{param, var, Program};

pub use engine::{EngineError, ProgramId, RunState, SimEngine, TimingEngine};
pub use interp::InterpError;
pub use pigpio::PigpioEngine;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Lowest frequency the program may run at. Below this the Q10 frequency no longer resolves the
/// impulse duration to within a quarter of a Q20 step.
///
/// Units: Hz
pub const MIN_FREQUENCY_HZ: f64 = 64.0;

/// Highest frequency the program may reach. Impulses stay at least 8 Q20 steps long, so the
/// rounding carried by each term keeps the pulse count of a long ramp within 0.1 % of the
/// floating point sequence, and each half impulse lasts at least 3 us.
///
/// Units: Hz
pub const MAX_FREQUENCY_HZ: f64 = (1u32 << 17) as f64;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// The five integer parameters of the ramp program, in the order the program expects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HwProgParams {
    /// Start frequency.
    ///
    /// Units: Hz
    pub start_frequency: i32,

    /// Frequency rate.
    ///
    /// Units: Q12 Hz/s
    pub accel_q12: i32,

    /// Ramp duration.
    ///
    /// Units: Q20 s
    pub duration_q20: i32,

    /// First impulse duration, `1/a` rounded.
    ///
    /// Units: Q20 s
    pub t0_q20: i32,

    /// GPIO number of the STEP line.
    pub gpio: i32,
}

/// Wrapper around the assembled ramp program.
#[derive(Debug, Clone)]
pub struct HardwareTimingProgram {
    program: Program,
}

/// One pulse observed while simulating the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SimulatedPulse {
    /// Impulse duration.
    ///
    /// Units: Q20 s
    pub t_q20: i32,

    /// Delay used for each half of the impulse.
    ///
    /// Units: microseconds
    pub half_us: i32,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProgramError {
    #[error("Program is empty")]
    Empty,

    #[error("Tag {0} is defined more than once")]
    DuplicateTag(Tag),

    #[error("Tag {0} is used but never defined")]
    UndefinedTag(Tag),

    #[error("Register {0} does not exist")]
    RegisterOutOfRange(Reg),

    #[error("Start frequency {0} Hz is outside [64, 131072] Hz")]
    StartFrequencyOutOfRange(f64),

    #[error("Ramp ends at {0} Hz, outside [64, 131072] Hz")]
    EndFrequencyOutOfRange(f64),

    #[error("Frequency rate {0} Hz/s cannot be represented in Q12")]
    RateOutOfRange(f64),

    #[error("Duration {0} s must be positive and representable in Q20")]
    DurationOutOfRange(f64),

    #[error("Invalid GPIO number {0}")]
    InvalidGpio(u32),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl HwProgParams {
    /// Encode a ramp for the program.
    ///
    /// ## Arguments
    /// - `start_frequency` - Pulse frequency at the start of the ramp (Hz), rounded to an integer
    /// - `k` - Rate of change of the pulse frequency (Hz/s)
    /// - `duration` - Ramp duration (s)
    /// - `gpio` - STEP line GPIO number
    pub fn new(
        start_frequency: f64,
        k: f64,
        duration: f64,
        gpio: u32,
    ) -> Result<Self, ProgramError> {
        let a = start_frequency.round();
        if !(a >= MIN_FREQUENCY_HZ && a <= MAX_FREQUENCY_HZ) {
            return Err(ProgramError::StartFrequencyOutOfRange(start_frequency));
        }

        let accel_q12 = fixed::to_q12(k).ok_or(ProgramError::RateOutOfRange(k))?;

        let duration_q20 = match fixed::to_q20(duration) {
            Some(d) if d > 0 => d,
            _ => return Err(ProgramError::DurationOutOfRange(duration)),
        };

        // Frequency is linear in elapsed time, so checking the end covers the whole ramp
        let end = a + fixed::from_q12(accel_q12) * fixed::from_q20(duration_q20);
        if !(end >= MIN_FREQUENCY_HZ && end <= MAX_FREQUENCY_HZ) {
            return Err(ProgramError::EndFrequencyOutOfRange(end));
        }

        if gpio > i32::MAX as u32 {
            return Err(ProgramError::InvalidGpio(gpio));
        }

        Ok(Self {
            start_frequency: a as i32,
            accel_q12,
            duration_q20,
            t0_q20: (fixed::Q20_ONE / a).round() as i32,
            gpio: gpio as i32,
        })
    }

    /// Parameters in program order.
    pub fn to_array(&self) -> [i32; 5] {
        let mut out = [0; 5];
        out[param::A as usize] = self.start_frequency;
        out[param::B as usize] = self.accel_q12;
        out[param::DURATION as usize] = self.duration_q20;
        out[param::T0 as usize] = self.t0_q20;
        out[param::GPIO as usize] = self.gpio;
        out
    }

    /// Frequency rate actually encoded.
    ///
    /// Units: Hz/s
    pub fn k(&self) -> f64 {
        fixed::from_q12(self.accel_q12)
    }

    /// Ramp duration actually encoded.
    ///
    /// Units: s
    pub fn duration(&self) -> f64 {
        fixed::from_q20(self.duration_q20)
    }

    /// Floating point sequence the program approximates.
    pub fn reference_sequence(&self) -> Result<StepPeriodSequence, ImpulseError> {
        impulse_durations(
            self.k(),
            1.0 / self.start_frequency as f64,
            StopRule::Duration(self.duration()),
        )
    }
}

impl HardwareTimingProgram {
    pub fn new() -> Result<Self, ProgramError> {
        Ok(Self {
            program: program::ramp_program()?,
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Script text to hand to the daemon.
    pub fn script(&self) -> String {
        self.program.to_script()
    }

    /// Run the program in the interpreter and collect every pulse it would emit.
    pub fn simulate(
        &self,
        params: &HwProgParams,
        shifts: ShiftModel,
    ) -> Result<Vec<SimulatedPulse>, InterpError> {
        let mut pulses = Vec::new();

        Interpreter::new(&self.program)
            .with_shifts(shifts)
            .run_probed(&params.to_array(), &mut NullSink, |m, _, high| {
                if high {
                    pulses.push(SimulatedPulse {
                        t_q20: m.v[var::T as usize],
                        half_us: m.v[var::HALF_US as usize],
                    })
                }
            })?;

        Ok(pulses)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn check_against_reference(start_frequency: f64, k: f64, duration: f64) {
        let prog = HardwareTimingProgram::new().unwrap();
        let params = HwProgParams::new(start_frequency, k, duration, 18).unwrap();
        let reference = params.reference_sequence().unwrap();

        for shifts in [ShiftModel::Rotate, ShiftModel::SignedShift].iter() {
            let pulses = prog.simulate(&params, *shifts).unwrap();

            let len_diff = (pulses.len() as i64 - reference.len() as i64).abs();
            assert!(
                len_diff <= 1,
                "{} pulses vs {} reference terms",
                pulses.len(),
                reference.len()
            );

            for (i, (p, r)) in pulses.iter().zip(reference.iter()).enumerate() {
                let err = (fixed::from_q20(p.t_q20) - r).abs() * fixed::Q20_ONE;
                assert!(
                    err <= 1.0,
                    "term {}: {} vs {} ({} Q20 steps)",
                    i,
                    fixed::from_q20(p.t_q20),
                    r,
                    err
                );

                // Half impulse delay is the Q20 impulse in microseconds, halved and truncated
                let expected_us = (p.t_q20 as i64 * 1_000_000) >> 21;
                assert_eq!(p.half_us as i64, expected_us);
            }
        }
    }

    #[test]
    fn test_acceleration_matches_reference() {
        check_against_reference(300.0, 6000.0, 0.25);
        check_against_reference(100.0, 200.0, 1.0);
        check_against_reference(500.0, 20000.0, 0.5);
    }

    #[test]
    fn test_deceleration_matches_reference() {
        check_against_reference(2000.0, -3000.0, 0.3);
    }

    #[test]
    fn test_long_ramp_pulse_count_drift() {
        let prog = HardwareTimingProgram::new().unwrap();

        for &(k, duration) in [(25465.0, 2.0), (100_000.0, 1.0)].iter() {
            let params = HwProgParams::new(300.0, k, duration, 18).unwrap();
            let reference = params.reference_sequence().unwrap().len() as f64;
            let pulses = prog
                .simulate(&params, ShiftModel::SignedShift)
                .unwrap()
                .len() as f64;

            assert!(
                (pulses - reference).abs() <= 1e-3 * reference,
                "{} Hz/s for {} s: {} pulses vs {} reference terms",
                k,
                duration,
                pulses,
                reference
            );
        }
    }

    #[test]
    fn test_constant_frequency() {
        let prog = HardwareTimingProgram::new().unwrap();
        let params = HwProgParams::new(100.0, 0.0, 0.5, 18).unwrap();
        let pulses = prog.simulate(&params, ShiftModel::SignedShift).unwrap();

        assert!(pulses.len() == 50 || pulses.len() == 51);
        assert!(pulses.iter().all(|p| p.t_q20 == params.t0_q20));
    }

    #[test]
    fn test_parameter_encoding() {
        let params = HwProgParams::new(300.0, -1.5, 0.25, 18).unwrap();
        assert_eq!(params.to_array(), [300, -6144, 1 << 18, 3495, 18]);
    }

    #[test]
    fn test_parameter_validation() {
        assert!(matches!(
            HwProgParams::new(10.0, 0.0, 1.0, 18),
            Err(ProgramError::StartFrequencyOutOfRange(_))
        ));
        assert!(matches!(
            HwProgParams::new(100.0, -100.0, 1.0, 18),
            Err(ProgramError::EndFrequencyOutOfRange(_))
        ));
        assert!(matches!(
            HwProgParams::new(300.0, 140_000.0, 1.0, 18),
            Err(ProgramError::EndFrequencyOutOfRange(_))
        ));
        assert!(matches!(
            HwProgParams::new(200_000.0, 0.0, 1.0, 18),
            Err(ProgramError::StartFrequencyOutOfRange(_))
        ));
        assert!(matches!(
            HwProgParams::new(100.0, 10.0, 0.0, 18),
            Err(ProgramError::DurationOutOfRange(_))
        ));
        assert!(matches!(
            HwProgParams::new(100.0, 10.0, 5000.0, 18),
            Err(ProgramError::DurationOutOfRange(_))
        ));
    }
}
