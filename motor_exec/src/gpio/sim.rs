//! # Simulated pins
//!
//! Lines are held in memory and every transition is recorded so that tests can inspect what a
//! controller did after the pins have been moved into a worker thread.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{GpioError, Level, MotorPins, PinRole};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// In-memory implementation of [`MotorPins`].
#[derive(Debug)]
pub struct SimPins {
    levels: HashMap<PinRole, Level>,

    stuck: HashMap<PinRole, Level>,

    /// Number of successful STEP writes after which every further STEP write fails.
    fail_step_after: Option<usize>,

    step_writes: usize,

    recorder: SimRecorder,
}

/// Shared handle onto the transitions recorded by a [`SimPins`].
#[derive(Debug, Clone, Default)]
pub struct SimRecorder {
    events: Arc<Mutex<Vec<(PinRole, Level)>>>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SimPins {
    /// All lines start low, which means the driver is enabled in full step mode.
    pub fn new() -> Self {
        let levels = [
            PinRole::Step,
            PinRole::Dir,
            PinRole::En,
            PinRole::M1,
            PinRole::M2,
            PinRole::M3,
        ]
        .iter()
        .map(|r| (*r, Level::Low))
        .collect();

        Self {
            levels,
            stuck: HashMap::new(),
            fail_step_after: None,
            step_writes: 0,
            recorder: SimRecorder::default(),
        }
    }

    /// Hold a line at a fixed level regardless of what is written to it.
    pub fn with_stuck(mut self, role: PinRole, level: Level) -> Self {
        self.stuck.insert(role, level);
        self.levels.insert(role, level);
        self
    }

    /// Make STEP writes fail once `writes` of them have succeeded.
    pub fn with_step_fault_after(mut self, writes: usize) -> Self {
        self.fail_step_after = Some(writes);
        self
    }

    /// Handle for inspecting the recorded transitions.
    pub fn recorder(&self) -> SimRecorder {
        self.recorder.clone()
    }
}

impl Default for SimPins {
    fn default() -> Self {
        Self::new()
    }
}

impl MotorPins for SimPins {
    fn write(&mut self, role: PinRole, level: Level) -> Result<(), GpioError> {
        if !self.levels.contains_key(&role) {
            return Err(GpioError::NotConnected(role));
        }

        if role == PinRole::Step {
            if let Some(max) = self.fail_step_after {
                if self.step_writes >= max {
                    return Err(GpioError::WriteFailed {
                        role,
                        level,
                        reason: "injected fault".into(),
                    });
                }
            }
            self.step_writes += 1;
        }

        let level = *self.stuck.get(&role).unwrap_or(&level);
        self.levels.insert(role, level);
        self.recorder.push(role, level);

        Ok(())
    }

    fn read(&mut self, role: PinRole) -> Result<Level, GpioError> {
        self.levels
            .get(&role)
            .copied()
            .ok_or(GpioError::NotConnected(role))
    }
}

impl SimRecorder {
    fn push(&self, role: PinRole, level: Level) {
        if let Ok(mut events) = self.events.lock() {
            events.push((role, level));
        }
    }

    /// Every recorded transition, in order.
    pub fn events(&self) -> Vec<(PinRole, Level)> {
        match self.events.lock() {
            Ok(e) => e.clone(),
            Err(_) => Vec::new(),
        }
    }

    /// Number of times the line was driven high.
    pub fn rising_edges(&self, role: PinRole) -> usize {
        self.events()
            .iter()
            .filter(|(r, l)| *r == role && *l == Level::High)
            .count()
    }

    /// Number of completed STEP pulses.
    pub fn step_pulses(&self) -> usize {
        self.rising_edges(PinRole::Step)
    }

    /// Last level written to the line, if any.
    pub fn last_level(&self, role: PinRole) -> Option<Level> {
        self.events()
            .iter()
            .rev()
            .find(|(r, _)| *r == role)
            .map(|(_, l)| *l)
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_records_transitions() {
        let mut pins = SimPins::new();
        let rec = pins.recorder();

        pins.write(PinRole::Step, Level::High).unwrap();
        pins.write(PinRole::Step, Level::Low).unwrap();
        pins.write(PinRole::Dir, Level::High).unwrap();

        assert_eq!(rec.step_pulses(), 1);
        assert_eq!(rec.last_level(PinRole::Dir), Some(Level::High));
        assert_eq!(rec.events().len(), 3);
    }

    #[test]
    fn test_optional_lines_not_connected() {
        let mut pins = SimPins::new();
        assert!(!pins.has(PinRole::Slp));
        assert!(matches!(
            pins.write(PinRole::Rst, Level::High),
            Err(GpioError::NotConnected(PinRole::Rst))
        ));
    }

    #[test]
    fn test_step_fault_injection() {
        let mut pins = SimPins::new().with_step_fault_after(2);
        pins.write(PinRole::Step, Level::High).unwrap();
        pins.write(PinRole::Step, Level::Low).unwrap();
        assert!(pins.write(PinRole::Step, Level::High).is_err());
    }
}
