//! # Continuous rotation controller
//!
//! Holds the motor at a constant pulse frequency from a background thread until told to stop.
//!
//! The controller owns the motor pins. While rotating they are moved into the worker thread,
//! which hands them back when it is joined, so nothing else can drive the STEP line while the
//! worker runs.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::emitter::sleep_until;
use crate::gpio::{GpioError, Level, MotorPins, PinRole};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct ContinuousRotationController<P: MotorPins> {
    /// Pins, `None` while the worker holds them.
    pins: Option<P>,

    shared: Arc<Shared>,

    worker: Option<JoinHandle<WorkerExit<P>>>,
}

/// State shared between the controller and its worker.
#[derive(Debug, Default)]
struct Shared {
    active: AtomicBool,

    /// Half of the pulse period in nanoseconds.
    half_period_ns: AtomicU64,

    pulses: AtomicU64,

    exited: AtomicBool,
}

struct WorkerExit<P> {
    pins: P,
    fault: Option<GpioError>,
}

/// Summary of a finished rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationSummary {
    pub pulses: u64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RotatorError {
    #[error("Continuous rotation is already running")]
    AlreadyRunning,

    #[error("Continuous rotation is not running")]
    NotRunning,

    #[error("Frequency must be positive and finite (got {0} Hz)")]
    InvalidFrequency(f64),

    #[error("The rotation worker panicked and the pins were lost")]
    WorkerPanicked,

    #[error("The rotation worker stopped on a GPIO fault: {0}")]
    Fault(GpioError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<P: MotorPins> ContinuousRotationController<P> {
    pub fn new(pins: P) -> Self {
        Self {
            pins: Some(pins),
            shared: Arc::new(Shared::default()),
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Current pulse frequency, zero when stopped.
    ///
    /// Units: Hz
    pub fn frequency(&self) -> f64 {
        if !self.is_running() {
            return 0.0;
        }

        let half_ns = self.shared.half_period_ns.load(Ordering::SeqCst);
        if half_ns == 0 {
            0.0
        } else {
            1e9 / (2.0 * half_ns as f64)
        }
    }

    /// Number of pulses emitted by the current (or last) rotation.
    pub fn pulses(&self) -> u64 {
        self.shared.pulses.load(Ordering::SeqCst)
    }

    /// Mutable access to the pins, only available while stopped.
    pub fn pins_mut(&mut self) -> Option<&mut P> {
        self.pins.as_mut()
    }

    /// Start rotating at the given pulse frequency.
    pub fn start(&mut self, frequency: f64) -> Result<(), RotatorError> {
        if self.is_running() {
            return Err(RotatorError::AlreadyRunning);
        }

        let half_ns = half_period_ns(frequency)?;

        let pins = match self.pins.take() {
            Some(p) => p,
            None => return Err(RotatorError::WorkerPanicked),
        };

        // Fresh shared state for each run
        self.shared = Arc::new(Shared::default());
        self.shared.half_period_ns.store(half_ns, Ordering::SeqCst);
        self.shared.active.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        self.worker = Some(thread::spawn(move || rotation_worker(pins, shared)));

        info!("Continuous rotation started at {:.1} Hz", frequency);

        Ok(())
    }

    /// Change the frequency of a running rotation, taking effect from the next half period.
    ///
    /// A frequency of zero or below stops the rotation.
    pub fn set_frequency(&mut self, frequency: f64) -> Result<(), RotatorError> {
        if frequency <= 0.0 {
            return self.stop().map(|_| ());
        }

        if !self.is_running() {
            return Err(RotatorError::NotRunning);
        }

        let half_ns = half_period_ns(frequency)?;
        self.shared.half_period_ns.store(half_ns, Ordering::SeqCst);

        debug!("Continuous rotation retuned to {:.1} Hz", frequency);

        Ok(())
    }

    /// Stop rotating, blocking until the worker has exited and returned the pins.
    ///
    /// Stopping an already stopped controller is a no-op.
    pub fn stop(&mut self) -> Result<RotationSummary, RotatorError> {
        let worker = match self.worker.take() {
            Some(w) => w,
            None => {
                return Ok(RotationSummary {
                    pulses: self.pulses(),
                })
            }
        };

        self.shared.active.store(false, Ordering::SeqCst);

        let exit = worker.join().map_err(|_| RotatorError::WorkerPanicked)?;
        self.pins = Some(exit.pins);

        let summary = RotationSummary {
            pulses: self.pulses(),
        };

        info!(
            "Continuous rotation stopped after {} pulses",
            summary.pulses
        );

        match exit.fault {
            Some(e) => Err(RotatorError::Fault(e)),
            None => Ok(summary),
        }
    }

    /// Whether the last worker has observed the stop request and returned.
    pub fn worker_exited(&self) -> bool {
        self.shared.exited.load(Ordering::SeqCst)
    }

    /// Stop any rotation and give the pins back.
    pub fn into_pins(mut self) -> Option<P> {
        if let Err(e) = self.stop() {
            warn!("Error stopping rotation: {}", e);
        }
        self.pins.take()
    }
}

impl<P: MotorPins> Drop for ContinuousRotationController<P> {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                warn!("Error stopping rotation on drop: {}", e);
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn half_period_ns(frequency: f64) -> Result<u64, RotatorError> {
    if !(frequency.is_finite() && frequency > 0.0) {
        return Err(RotatorError::InvalidFrequency(frequency));
    }

    let ns = (1e9 / (2.0 * frequency)).round();
    if ns < 1.0 {
        return Err(RotatorError::InvalidFrequency(frequency));
    }

    Ok(ns as u64)
}

fn rotation_worker<P: MotorPins>(mut pins: P, shared: Arc<Shared>) -> WorkerExit<P> {
    let mut deadline = Instant::now();
    let mut fault = None;

    'outer: while shared.active.load(Ordering::SeqCst) {
        for &level in [Level::High, Level::Low].iter() {
            if let Err(e) = pins.write(PinRole::Step, level) {
                fault = Some(e);
                break 'outer;
            }

            deadline += Duration::from_nanos(shared.half_period_ns.load(Ordering::SeqCst));
            sleep_until(deadline);

            // Stop within one half period, leaving the line low
            if level == Level::High && !shared.active.load(Ordering::SeqCst) {
                if let Err(e) = pins.write(PinRole::Step, Level::Low) {
                    fault = Some(e);
                }
                shared.pulses.fetch_add(1, Ordering::SeqCst);
                break 'outer;
            }
        }

        shared.pulses.fetch_add(1, Ordering::SeqCst);

        // Resynchronise after an oversleep rather than bursting to catch up
        let now = Instant::now();
        if now > deadline {
            deadline = now;
        }
    }

    if fault.is_some() {
        shared.active.store(false, Ordering::SeqCst);
    }
    shared.exited.store(true, Ordering::SeqCst);

    WorkerExit { pins, fault }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gpio::SimPins;

    #[test]
    fn test_start_stop_joins_worker() {
        let pins = SimPins::new();
        let rec = pins.recorder();
        let mut ctrl = ContinuousRotationController::new(pins);

        ctrl.start(100.0).unwrap();
        assert!(ctrl.is_running());
        assert!(ctrl.pins_mut().is_none());

        thread::sleep(Duration::from_millis(50));

        let summary = ctrl.stop().unwrap();

        assert!(!ctrl.is_running());
        assert!(ctrl.worker_exited());
        assert!(ctrl.pins_mut().is_some());
        assert!(summary.pulses >= 1);
        assert_eq!(rec.last_level(PinRole::Step), Some(Level::Low));

        // No more transitions once stopped
        let n = rec.events().len();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(rec.events().len(), n);
    }

    #[test]
    fn test_second_start_rejected() {
        let mut ctrl = ContinuousRotationController::new(SimPins::new());
        ctrl.start(200.0).unwrap();
        assert!(matches!(ctrl.start(300.0), Err(RotatorError::AlreadyRunning)));
        ctrl.stop().unwrap();
    }

    #[test]
    fn test_set_frequency() {
        let mut ctrl = ContinuousRotationController::new(SimPins::new());

        assert!(matches!(
            ctrl.set_frequency(100.0),
            Err(RotatorError::NotRunning)
        ));

        ctrl.start(100.0).unwrap();
        ctrl.set_frequency(400.0).unwrap();
        assert!((ctrl.frequency() - 400.0).abs() < 1e-6);

        // Non-positive frequency stops
        ctrl.set_frequency(0.0).unwrap();
        assert!(!ctrl.is_running());
        assert_eq!(ctrl.frequency(), 0.0);
    }

    #[test]
    fn test_invalid_frequency() {
        let mut ctrl = ContinuousRotationController::new(SimPins::new());
        assert!(matches!(
            ctrl.start(-5.0),
            Err(RotatorError::InvalidFrequency(_))
        ));
        assert!(matches!(
            ctrl.start(f64::INFINITY),
            Err(RotatorError::InvalidFrequency(_))
        ));
        assert!(!ctrl.is_running());
    }

    #[test]
    fn test_fault_ends_rotation() {
        let mut ctrl = ContinuousRotationController::new(SimPins::new().with_step_fault_after(4));
        ctrl.start(1000.0).unwrap();

        thread::sleep(Duration::from_millis(30));
        assert!(ctrl.worker_exited());

        assert!(matches!(ctrl.stop(), Err(RotatorError::Fault(_))));
        assert!(ctrl.pins_mut().is_some());
    }
}
