//! # Step pulse emitter
//!
//! Software-timed path: toggles the STEP line once per impulse of a [`StepPeriodSequence`],
//! blocking the calling thread until the whole sequence has been emitted.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{trace, warn};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::gpio::{GpioError, Level, MotorPins, PinRole};
use crate::impulse::StepPeriodSequence;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepPulseEmitter {
    pacing: Pacing,
}

/// Summary of one emitted sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EmitReport {
    pub pulses: usize,

    /// Sum of the emitted impulse durations.
    ///
    /// Units: seconds
    pub planned_s: f64,

    /// Wall-clock time taken.
    ///
    /// Units: seconds
    pub elapsed_s: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// How the emitter spaces the line transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pacing {
    /// Sleep until each transition's deadline.
    RealTime,

    /// Write the transitions back to back, used for dry runs against simulated pins.
    Unpaced,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl StepPulseEmitter {
    pub fn new(pacing: Pacing) -> Self {
        Self { pacing }
    }

    pub fn pacing(&self) -> Pacing {
        self.pacing
    }

    /// Emit a whole sequence.
    ///
    /// Deadlines are measured from the start of the sequence so that a late wake-up does not
    /// delay every following pulse. A failed write aborts the remaining sequence, the STEP line
    /// is returned low if possible and the error is passed to the caller.
    pub fn emit<P: MotorPins + ?Sized>(
        &self,
        pins: &mut P,
        sequence: &StepPeriodSequence,
    ) -> Result<EmitReport, GpioError> {
        let start = Instant::now();
        let mut deadline = 0.0;
        let mut pulses = 0;

        for &period in sequence {
            let half = period / 2.0;

            if let Err(e) = self.half_pulse(pins, Level::High, start, &mut deadline, half) {
                self.abort(pins, pulses);
                return Err(e);
            }
            if let Err(e) = self.half_pulse(pins, Level::Low, start, &mut deadline, half) {
                self.abort(pins, pulses);
                return Err(e);
            }

            pulses += 1;
        }

        let report = EmitReport {
            pulses,
            planned_s: sequence.total_duration(),
            elapsed_s: start.elapsed().as_secs_f64(),
        };

        trace!("Emitted {:?}", report);

        Ok(report)
    }

    fn half_pulse<P: MotorPins + ?Sized>(
        &self,
        pins: &mut P,
        level: Level,
        start: Instant,
        deadline: &mut f64,
        half: f64,
    ) -> Result<(), GpioError> {
        pins.write(PinRole::Step, level)?;
        *deadline += half;

        if self.pacing == Pacing::RealTime {
            sleep_until(start + Duration::from_secs_f64(*deadline));
        }

        Ok(())
    }

    fn abort<P: MotorPins + ?Sized>(&self, pins: &mut P, pulses: usize) {
        warn!("Pulse emission aborted after {} pulses", pulses);
        if let Err(e) = pins.write(PinRole::Step, Level::Low) {
            warn!("Could not return STEP low after fault: {}", e);
        }
    }
}

impl Default for StepPulseEmitter {
    fn default() -> Self {
        Self::new(Pacing::RealTime)
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

pub(crate) fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        std::thread::sleep(deadline - now);
    }
}
