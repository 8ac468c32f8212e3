//! # Motion executors
//!
//! Two ways of carrying out a [`MotionCommand`]: generate the impulse sequence on the host and
//! emit it with the software-timed emitter, or hand the ramp to the hardware timing program.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::debug;
use std::sync::Arc;
use std::time::Duration;

use super::{MotionCommand, MotionExecutor};
use crate::emitter::StepPulseEmitter;
use crate::gpio::{MicrostepResolution, MotorPins};
use crate::hw_prog::HwProgParams;
use crate::impulse::{ImpulseCache, StepGeometry, StopRule};
use crate::motor::{Motor, MotorError};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Executes commands through the software-timed emitter.
pub struct EmitterExecutor<P: MotorPins> {
    motor: Motor<P>,
    geometry: StepGeometry,
    resolution: MicrostepResolution,
    cache: Arc<ImpulseCache>,
    emitter: StepPulseEmitter,
}

/// Executes commands on the hardware timing program.
pub struct HardwareExecutor<P: MotorPins> {
    motor: Motor<P>,
    geometry: StepGeometry,
    resolution: MicrostepResolution,

    /// Longest time to wait for the previous run to halt.
    run_timeout: Duration,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<P: MotorPins> EmitterExecutor<P> {
    /// Prepare the motor for following: driver enabled at the given resolution.
    pub fn new(
        mut motor: Motor<P>,
        geometry: StepGeometry,
        resolution: MicrostepResolution,
        cache: Arc<ImpulseCache>,
        emitter: StepPulseEmitter,
    ) -> Result<Self, MotorError> {
        motor.set_resolution(resolution)?;
        motor.enable()?;

        Ok(Self {
            motor,
            geometry,
            resolution,
            cache,
            emitter,
        })
    }

    pub fn motor(&self) -> &Motor<P> {
        &self.motor
    }

    pub fn into_motor(self) -> Motor<P> {
        self.motor
    }
}

impl<P: MotorPins> MotionExecutor for EmitterExecutor<P> {
    fn execute(&mut self, command: &MotionCommand) -> Result<(), MotorError> {
        let k = self.geometry.k(command.acceleration, self.resolution);
        let sequence = self.cache.get_or_generate(
            k,
            1.0 / command.start_frequency,
            StopRule::Duration(command.duration),
        )?;

        if self.motor.state().direction != command.direction {
            self.motor.set_direction(command.direction)?;
        }

        let report = self.motor.emit(&self.emitter, &sequence)?;
        debug!(
            "Emitted {} pulses in {:.4} s (planned {:.4} s)",
            report.pulses, report.elapsed_s, report.planned_s
        );

        Ok(())
    }
}

impl<P: MotorPins> HardwareExecutor<P> {
    /// The motor must already have a timing engine attached.
    pub fn new(
        mut motor: Motor<P>,
        geometry: StepGeometry,
        resolution: MicrostepResolution,
        run_timeout: Duration,
    ) -> Result<Self, MotorError> {
        if !motor.has_engine() {
            return Err(MotorError::NoEngine);
        }
        motor.enable()?;

        Ok(Self {
            motor,
            geometry,
            resolution,
            run_timeout,
        })
    }

    pub fn motor(&self) -> &Motor<P> {
        &self.motor
    }

    pub fn into_motor(self) -> Motor<P> {
        self.motor
    }
}

impl<P: MotorPins> MotionExecutor for HardwareExecutor<P> {
    fn execute(&mut self, command: &MotionCommand) -> Result<(), MotorError> {
        // Runs must never overlap on the STEP line
        self.motor.wait_hardware(self.run_timeout)?;

        let k = self.geometry.k(command.acceleration, self.resolution);
        let params = HwProgParams::new(
            command.start_frequency,
            k,
            command.duration,
            self.motor.step_gpio(),
        )?;

        self.motor
            .run_hardware(&params, command.direction, self.resolution)
    }

    fn finish(&mut self) -> Result<(), MotorError> {
        self.motor.wait_hardware(self.run_timeout)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cmd_queue::MotionCommandQueue;
    use crate::emitter::Pacing;
    use crate::gpio::{Direction, Level, PinRole, SimPins};
    use crate::hw_prog::interp::ShiftModel;
    use crate::hw_prog::{HardwareTimingProgram, SimEngine};
    use crate::impulse::impulse_durations;

    fn command(direction: Direction, acceleration: f64, duration: f64) -> MotionCommand {
        MotionCommand {
            direction,
            acceleration,
            start_frequency: 300.0,
            duration,
        }
    }

    #[test]
    fn test_emitter_executor_through_queue() {
        let pins = SimPins::new();
        let rec = pins.recorder();
        let motor = Motor::new(pins, 24).unwrap();
        let geometry = StepGeometry::default();
        let res = MicrostepResolution::Sixteenth;

        let exec = EmitterExecutor::new(
            motor,
            geometry,
            res,
            Arc::new(ImpulseCache::new()),
            StepPulseEmitter::new(Pacing::Unpaced),
        )
        .unwrap();
        rec.clear();

        let a = command(Direction::Forward, 20.0, 0.07);
        let b = command(Direction::Reverse, 5.0, 0.05);

        let mut q = MotionCommandQueue::new(exec, None);
        q.submit(1, vec![a]).unwrap();
        q.submit(2, vec![b]).unwrap();
        let report = q.shutdown(Duration::from_secs(2)).unwrap();
        assert_eq!(report.executed, 2);

        let expected: usize = [a, b]
            .iter()
            .map(|c| {
                impulse_durations(
                    geometry.k(c.acceleration, res),
                    1.0 / c.start_frequency,
                    StopRule::Duration(c.duration),
                )
                .unwrap()
                .len()
            })
            .sum();
        assert_eq!(rec.step_pulses(), expected);
        assert_eq!(rec.last_level(PinRole::Dir), Some(Level::High));

        let motor = report.executor.into_motor();
        assert_eq!(motor.state().direction, Direction::Reverse);
        assert!(motor.state().enabled);
    }

    #[test]
    fn test_hardware_executor_serialises_runs() {
        let mut motor = Motor::new(SimPins::new(), 24).unwrap();
        let prog = HardwareTimingProgram::new().unwrap();
        let engine = SimEngine::new(true);
        let log = engine.log();
        motor.attach_engine(Box::new(engine), &prog).unwrap();

        let geometry = StepGeometry::default();
        let res = MicrostepResolution::Sixteenth;
        let mut exec =
            HardwareExecutor::new(motor, geometry, res, Duration::from_secs(2)).unwrap();

        let a = command(Direction::Forward, 0.5, 0.05);
        let b = command(Direction::Reverse, -0.5, 0.05);
        exec.execute(&a).unwrap();
        exec.execute(&b).unwrap();
        exec.finish().unwrap();

        let expected: usize = [a, b]
            .iter()
            .map(|c| {
                let p = HwProgParams::new(
                    c.start_frequency,
                    geometry.k(c.acceleration, res),
                    c.duration,
                    24,
                )
                .unwrap();
                prog.simulate(&p, ShiftModel::SignedShift).unwrap().len()
            })
            .sum();

        let events = log.lock().unwrap().clone();
        assert_eq!(events.iter().filter(|e| e.high).count(), expected);

        // Each run's clock restarts at zero, so the runs did not interleave if it does so once
        let restarts = events
            .windows(2)
            .filter(|w| w[1].at_us < w[0].at_us)
            .count();
        assert_eq!(restarts, 1);

        assert_eq!(exec.motor().state().direction, Direction::Reverse);
        assert!(!exec.motor().state().active);
    }

    #[test]
    fn test_hardware_executor_needs_engine() {
        let motor = Motor::new(SimPins::new(), 24).unwrap();
        assert!(matches!(
            HardwareExecutor::new(
                motor,
                StepGeometry::default(),
                MicrostepResolution::Full,
                Duration::from_secs(1)
            ),
            Err(MotorError::NoEngine)
        ));
    }
}
