//! # Motor
//!
//! Single owner of the stepper driver. The pins live inside the [`ContinuousRotationController`]
//! and every other way of driving the STEP line (a profiled move through the emitter or a run of
//! the hardware timing program) has to acquire them first. Acquisition is refused while
//! continuous rotation runs or while a hardware run has not yet halted.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{debug, info, warn};
use serde::Serialize;
use std::time::Duration;

use crate::emitter::{EmitReport, StepPulseEmitter};
use crate::gpio::{
    self, Direction, GpioError, Level, MicrostepResolution, MotorPins, PinRole,
};
use crate::hw_prog::{
    engine::wait_until_idle, EngineError, HardwareTimingProgram, HwProgParams, ProgramError,
    ProgramId, RunState, TimingEngine,
};
use crate::impulse::{ImpulseError, StepPeriodSequence};
use crate::rotator::{ContinuousRotationController, RotationSummary, RotatorError};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Interval between status polls of the timing engine.
const HW_POLL_INTERVAL: Duration = Duration::from_millis(2);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct Motor<P: MotorPins> {
    rotator: ContinuousRotationController<P>,

    /// GPIO number of the STEP line, handed to the hardware timing program.
    step_gpio: u32,

    engine: Option<HardwareSlot>,

    state: MotorRuntimeState,
}

/// Timing engine together with the ramp program stored in it.
struct HardwareSlot {
    engine: Box<dyn TimingEngine>,
    program: ProgramId,

    /// Whether a run has been started since the last time the program was seen halted.
    outstanding: bool,
}

/// Observable state of the motor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotorRuntimeState {
    /// Pulse frequency of the running rotation, or the one reached at the end of the last move.
    ///
    /// Units: Hz
    pub current_frequency: f64,

    /// Whether something is currently driving the STEP line.
    pub active: bool,

    pub direction: Direction,

    pub resolution: MicrostepResolution,

    /// Whether the driver outputs are enabled.
    pub enabled: bool,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// What currently holds the motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MotorOwner {
    ContinuousRotation,
    HardwareProgram,
}

#[derive(Debug, thiserror::Error)]
pub enum MotorError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("A {duration} s move is too short, the resolution phases alone need {needed} s")]
    UnsatisfiableMove { duration: f64, needed: f64 },

    #[error(
        "A {requested} rad shaft move is too small for its duration, the resolution phases and \
         the handover speed already cover {minimum} rad"
    )]
    UnreachableAngle { requested: f64, minimum: f64 },

    #[error("The motor is already driven by {0:?}")]
    ConcurrencyViolation(MotorOwner),

    #[error("Hardware fault: {0}")]
    HardwareFault(GpioError),

    #[error("Could not generate the impulse sequence: {0}")]
    Impulse(#[from] ImpulseError),

    #[error("Could not encode the hardware program: {0}")]
    Program(#[from] ProgramError),

    #[error("Timing engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Continuous rotation error: {0}")]
    Rotation(RotatorError),

    #[error("No timing engine is attached to the motor")]
    NoEngine,

    #[error("The hardware run did not halt within {0} s")]
    HardwareTimeout(f64),

    #[error("The hardware run of program {0} failed")]
    HardwareRunFailed(ProgramId),

    #[error("The motor pins were lost when the rotation worker panicked")]
    PinsLost,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl From<GpioError> for MotorError {
    /// A resolution pattern outside the table is bad input rather than a failed line.
    fn from(e: GpioError) -> Self {
        match e {
            GpioError::UnknownResolution(levels) => MotorError::InvalidInput(format!(
                "microstep lines read {:?}, which is not a known resolution",
                levels
            )),
            e => MotorError::HardwareFault(e),
        }
    }
}

impl From<RotatorError> for MotorError {
    fn from(e: RotatorError) -> Self {
        match e {
            RotatorError::AlreadyRunning => {
                MotorError::ConcurrencyViolation(MotorOwner::ContinuousRotation)
            }
            RotatorError::Fault(g) => MotorError::from(g),
            RotatorError::WorkerPanicked => MotorError::PinsLost,
            e => MotorError::Rotation(e),
        }
    }
}

impl<P: MotorPins> Motor<P> {
    /// Take ownership of the pins, leaving the driver disabled in full step mode facing forward.
    pub fn new(mut pins: P, step_gpio: u32) -> Result<Self, MotorError> {
        pins.write(PinRole::En, Level::High)?;
        pins.write(PinRole::Step, Level::Low)?;
        pins.write(PinRole::Dir, Direction::Forward.dir_level())?;
        gpio::set_resolution(&mut pins, MicrostepResolution::Full)?;

        Ok(Self {
            rotator: ContinuousRotationController::new(pins),
            step_gpio,
            engine: None,
            state: MotorRuntimeState {
                current_frequency: 0.0,
                active: false,
                direction: Direction::Forward,
                resolution: MicrostepResolution::Full,
                enabled: false,
            },
        })
    }

    /// Attach a timing engine, storing the ramp program in it.
    pub fn attach_engine(
        &mut self,
        mut engine: Box<dyn TimingEngine>,
        program: &HardwareTimingProgram,
    ) -> Result<(), MotorError> {
        self.detach_engine()?;

        let id = engine.store(program.program())?;
        info!("Hardware timing program stored as {}", id);

        self.engine = Some(HardwareSlot {
            engine,
            program: id,
            outstanding: false,
        });

        Ok(())
    }

    /// Remove the timing engine, deleting the stored program.
    ///
    /// Fails with a concurrency violation if a run is still going.
    pub fn detach_engine(&mut self) -> Result<Option<Box<dyn TimingEngine>>, MotorError> {
        if self.hardware_busy()? {
            return Err(MotorError::ConcurrencyViolation(
                MotorOwner::HardwareProgram,
            ));
        }

        match self.engine.take() {
            Some(mut slot) => {
                slot.engine.delete(slot.program)?;
                Ok(Some(slot.engine))
            }
            None => Ok(None),
        }
    }

    pub fn has_engine(&self) -> bool {
        self.engine.is_some()
    }

    pub fn step_gpio(&self) -> u32 {
        self.step_gpio
    }

    pub fn state(&self) -> MotorRuntimeState {
        let mut state = self.state;
        if self.rotator.is_running() {
            state.current_frequency = self.rotator.frequency();
            state.active = true;
        }
        state
    }

    /// Whether a hardware run is still driving the STEP line.
    pub fn hardware_busy(&mut self) -> Result<bool, MotorError> {
        let slot = match self.engine.as_mut() {
            Some(s) if s.outstanding => s,
            _ => return Ok(false),
        };

        let busy = slot.engine.status(slot.program)?.is_busy();
        if !busy {
            slot.outstanding = false;
            self.state.active = false;
        }

        Ok(busy)
    }

    /// Who holds the motor right now, `None` if it is free.
    pub fn owner(&mut self) -> Result<Option<MotorOwner>, MotorError> {
        if self.rotator.is_running() {
            Ok(Some(MotorOwner::ContinuousRotation))
        } else if self.hardware_busy()? {
            Ok(Some(MotorOwner::HardwareProgram))
        } else {
            Ok(None)
        }
    }

    fn ensure_free(&mut self) -> Result<(), MotorError> {
        match self.owner()? {
            Some(owner) => Err(MotorError::ConcurrencyViolation(owner)),
            None => Ok(()),
        }
    }

    /// Get exclusive access to the pins for a move.
    fn acquire(&mut self) -> Result<&mut P, MotorError> {
        self.ensure_free()?;
        self.rotator.pins_mut().ok_or(MotorError::PinsLost)
    }

    pub fn enable(&mut self) -> Result<(), MotorError> {
        self.acquire()?.write(PinRole::En, Level::Low)?;
        self.state.enabled = true;
        debug!("Driver enabled");
        Ok(())
    }

    pub fn disable(&mut self) -> Result<(), MotorError> {
        self.acquire()?.write(PinRole::En, Level::High)?;
        self.state.enabled = false;
        debug!("Driver disabled");
        Ok(())
    }

    pub fn set_direction(&mut self, direction: Direction) -> Result<(), MotorError> {
        self.acquire()?.write(PinRole::Dir, direction.dir_level())?;
        self.state.direction = direction;
        Ok(())
    }

    /// Select a microstep resolution, verifying it on the lines.
    pub fn set_resolution(&mut self, resolution: MicrostepResolution) -> Result<(), MotorError> {
        gpio::set_resolution(self.acquire()?, resolution)?;
        self.state.resolution = resolution;
        Ok(())
    }

    /// Read the resolution currently selected on the lines.
    pub fn read_resolution(&mut self) -> Result<MicrostepResolution, MotorError> {
        Ok(gpio::read_resolution(self.acquire()?)?)
    }

    /// Emit a sequence through the software-timed emitter, blocking until it is done.
    pub fn emit(
        &mut self,
        emitter: &StepPulseEmitter,
        sequence: &StepPeriodSequence,
    ) -> Result<EmitReport, MotorError> {
        self.ensure_free()?;

        self.state.active = true;
        let result = match self.rotator.pins_mut() {
            Some(pins) => emitter.emit(pins, sequence).map_err(MotorError::from),
            None => Err(MotorError::PinsLost),
        };
        self.state.active = false;

        let report = result?;
        if let Some(f) = sequence.final_frequency() {
            self.state.current_frequency = f;
        }

        Ok(report)
    }

    /// Start continuous rotation at the given pulse frequency.
    pub fn start_rotation(&mut self, frequency: f64) -> Result<(), MotorError> {
        self.ensure_free()?;
        self.rotator.start(frequency)?;
        Ok(())
    }

    /// Stop continuous rotation, blocking until the worker has returned the pins.
    pub fn stop_rotation(&mut self) -> Result<RotationSummary, MotorError> {
        let frequency = self.rotator.frequency();
        let summary = self.rotator.stop()?;
        if frequency > 0.0 {
            self.state.current_frequency = frequency;
        }
        Ok(summary)
    }

    /// Set the continuous rotation frequency.
    ///
    /// Zero or below stops the rotation, otherwise a running rotation is retuned and a stopped
    /// one is started.
    pub fn set_frequency(&mut self, frequency: f64) -> Result<(), MotorError> {
        if frequency <= 0.0 {
            return self.stop_rotation().map(|_| ());
        }

        if self.rotator.is_running() {
            self.rotator.set_frequency(frequency)?;
            Ok(())
        } else {
            self.start_rotation(frequency)
        }
    }

    pub fn is_rotating(&self) -> bool {
        self.rotator.is_running()
    }

    /// Start a run of the hardware timing program and return without waiting for it.
    pub fn run_hardware(
        &mut self,
        params: &HwProgParams,
        direction: Direction,
        resolution: MicrostepResolution,
    ) -> Result<(), MotorError> {
        if self.engine.is_none() {
            return Err(MotorError::NoEngine);
        }
        if params.gpio as u32 != self.step_gpio {
            return Err(MotorError::InvalidInput(format!(
                "program would pulse GPIO {} but STEP is GPIO {}",
                params.gpio, self.step_gpio
            )));
        }

        self.set_direction(direction)?;
        self.set_resolution(resolution)?;

        let slot = self.engine.as_mut().ok_or(MotorError::NoEngine)?;
        slot.engine.run(slot.program, &params.to_array())?;
        slot.outstanding = true;

        self.state.active = true;
        self.state.current_frequency =
            params.start_frequency as f64 + params.k() * params.duration();

        debug!("Hardware run started: {:?}", params);

        Ok(())
    }

    /// Block until the outstanding hardware run has halted.
    pub fn wait_hardware(&mut self, timeout: Duration) -> Result<(), MotorError> {
        let slot = match self.engine.as_mut() {
            Some(s) if s.outstanding => s,
            _ => return Ok(()),
        };

        let state = wait_until_idle(
            &mut *slot.engine,
            slot.program,
            timeout,
            HW_POLL_INTERVAL,
        )?;

        match state {
            RunState::Halted => {
                slot.outstanding = false;
                self.state.active = false;
                Ok(())
            }
            RunState::Failed => {
                slot.outstanding = false;
                self.state.active = false;
                Err(MotorError::HardwareRunFailed(slot.program))
            }
            _ => Err(MotorError::HardwareTimeout(timeout.as_secs_f64())),
        }
    }

    /// Stop everything, disable the driver and give the pins back.
    pub fn shutdown(mut self, timeout: Duration) -> Result<P, MotorError> {
        if self.rotator.is_running() {
            if let Err(e) = self.stop_rotation() {
                warn!("Error stopping rotation during shutdown: {}", e);
            }
        }

        self.wait_hardware(timeout)?;
        self.detach_engine()?;
        self.disable()?;

        info!("Motor shut down");

        self.rotator.into_pins().ok_or(MotorError::PinsLost)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::emitter::Pacing;
    use crate::gpio::SimPins;
    use crate::hw_prog::SimEngine;

    fn motor() -> (Motor<SimPins>, crate::gpio::SimRecorder) {
        let pins = SimPins::new();
        let rec = pins.recorder();
        (Motor::new(pins, 24).unwrap(), rec)
    }

    #[test]
    fn test_new_leaves_driver_disabled() {
        let (mut m, rec) = motor();

        assert_eq!(rec.last_level(PinRole::En), Some(Level::High));
        assert!(!m.state().enabled);
        assert_eq!(m.read_resolution().unwrap(), MicrostepResolution::Full);

        m.enable().unwrap();
        assert_eq!(rec.last_level(PinRole::En), Some(Level::Low));
        assert!(m.state().enabled);
    }

    #[test]
    fn test_unknown_resolution_fails_fast() {
        let pins = SimPins::new().with_stuck(PinRole::M3, Level::High);
        match Motor::new(pins, 24) {
            Err(MotorError::InvalidInput(msg)) => assert!(msg.contains("not a known resolution")),
            Err(e) => panic!("Expected invalid input, got {}", e),
            Ok(_) => panic!("Expected invalid input, got a motor"),
        }

        // Other line failures stay hardware faults
        assert!(matches!(
            MotorError::from(GpioError::NotConnected(PinRole::M1)),
            MotorError::HardwareFault(GpioError::NotConnected(PinRole::M1))
        ));
    }

    #[test]
    fn test_moves_refused_while_rotating() {
        let (mut m, _) = motor();
        let seq = StepPeriodSequence::from_periods(vec![0.001; 10]);
        let emitter = StepPulseEmitter::new(Pacing::Unpaced);

        m.set_frequency(500.0).unwrap();
        assert!(m.is_rotating());
        assert!(m.state().active);
        assert!((m.state().current_frequency - 500.0).abs() < 1e-6);

        assert!(matches!(
            m.emit(&emitter, &seq),
            Err(MotorError::ConcurrencyViolation(
                MotorOwner::ContinuousRotation
            ))
        ));
        assert!(matches!(
            m.set_direction(Direction::Reverse),
            Err(MotorError::ConcurrencyViolation(_))
        ));

        // Retune then stop via a zero frequency
        m.set_frequency(800.0).unwrap();
        m.set_frequency(0.0).unwrap();
        assert!(!m.is_rotating());

        let report = m.emit(&emitter, &seq).unwrap();
        assert_eq!(report.pulses, 10);
        assert!((m.state().current_frequency - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_emit_fault_is_hardware_fault() {
        let pins = SimPins::new().with_step_fault_after(5);
        let mut m = Motor::new(pins, 24).unwrap();
        let seq = StepPeriodSequence::from_periods(vec![0.001; 10]);

        // One STEP write was used by construction
        let res = m.emit(&StepPulseEmitter::new(Pacing::Unpaced), &seq);
        assert!(matches!(res, Err(MotorError::HardwareFault(_))));
        assert!(!m.state().active);
    }

    #[test]
    fn test_hardware_run_owns_motor_until_halted() {
        let (mut m, rec) = motor();
        let prog = HardwareTimingProgram::new().unwrap();
        let params = HwProgParams::new(200.0, 0.0, 0.1, 24).unwrap();

        assert!(matches!(
            m.run_hardware(&params, Direction::Reverse, MicrostepResolution::Half),
            Err(MotorError::NoEngine)
        ));

        m.attach_engine(Box::new(SimEngine::new(true)), &prog)
            .unwrap();
        m.run_hardware(&params, Direction::Reverse, MicrostepResolution::Half)
            .unwrap();

        assert_eq!(rec.last_level(PinRole::Dir), Some(Level::High));
        assert_eq!(m.state().resolution, MicrostepResolution::Half);
        assert!(matches!(
            m.start_rotation(100.0),
            Err(MotorError::ConcurrencyViolation(MotorOwner::HardwareProgram))
        ));

        m.wait_hardware(Duration::from_secs(2)).unwrap();
        assert!(!m.state().active);
        assert_eq!(m.owner().unwrap(), None);

        let pins = m.shutdown(Duration::from_secs(1)).unwrap();
        drop(pins);
        assert_eq!(rec.last_level(PinRole::En), Some(Level::High));
    }

    #[test]
    fn test_hardware_gpio_must_match_step() {
        let (mut m, _) = motor();
        let prog = HardwareTimingProgram::new().unwrap();
        m.attach_engine(Box::new(SimEngine::new(false)), &prog)
            .unwrap();

        let params = HwProgParams::new(200.0, 0.0, 0.1, 18).unwrap();
        assert!(matches!(
            m.run_hardware(&params, Direction::Forward, MicrostepResolution::Full),
            Err(MotorError::InvalidInput(_))
        ));
    }
}
