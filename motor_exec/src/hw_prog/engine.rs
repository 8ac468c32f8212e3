//! # Timing engines
//!
//! A timing engine stores programs and runs them autonomously. Starting a run never blocks, the
//! caller polls [`TimingEngine::status`] to find out when it has finished.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::interp::{InterpError, Interpreter, PulseSink, ShiftModel};
use super::program::Program;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Identifier of a stored program.
pub type ProgramId = u32;

pub trait TimingEngine: Send {
    /// Store a program, returning its identifier.
    fn store(&mut self, program: &Program) -> Result<ProgramId, EngineError>;

    /// Start a stored program with the given parameters and return immediately.
    fn run(&mut self, id: ProgramId, params: &[i32]) -> Result<(), EngineError>;

    fn status(&mut self, id: ProgramId) -> Result<RunState, EngineError>;

    /// Remove a stored program.
    fn delete(&mut self, id: ProgramId) -> Result<(), EngineError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Engine running programs in the interpreter on a background thread.
pub struct SimEngine {
    programs: HashMap<ProgramId, Arc<Program>>,
    runs: HashMap<ProgramId, SimRun>,
    next_id: ProgramId,
    realtime: bool,
    log: Arc<Mutex<Vec<SimEvent>>>,
}

struct SimRun {
    state: Arc<AtomicU8>,
    handle: Option<JoinHandle<()>>,
}

/// GPIO write recorded by the [`SimEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SimEvent {
    pub program: ProgramId,
    pub gpio: u32,
    pub high: bool,

    /// Time since the start of the run according to the program's delays.
    ///
    /// Units: microseconds
    pub at_us: u64,
}

struct SimSink {
    program: ProgramId,
    realtime: bool,
    start: Instant,
    elapsed_us: u64,
    log: Arc<Mutex<Vec<SimEvent>>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Status of a stored program, numbered as the pigpio daemon reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Initialising = 0,
    Halted = 1,
    Running = 2,
    Waiting = 3,
    Failed = 4,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("No program with id {0}")]
    UnknownProgram(ProgramId),

    #[error("Program {0} is already running")]
    AlreadyRunning(ProgramId),

    #[error("Too many parameters ({0})")]
    TooManyParams(usize),

    #[error("Could not communicate with the daemon: {0}")]
    Io(#[from] std::io::Error),

    #[error("Daemon rejected command {cmd} with error code {code}")]
    Daemon { cmd: u32, code: i32 },

    #[error("Daemon reported unknown program status {0}")]
    UnknownStatus(i32),

    #[error("Program {0} did not finish initialising")]
    InitTimeout(ProgramId),

    #[error("Simulated run failed: {0}")]
    Interp(#[from] InterpError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl RunState {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(RunState::Initialising),
            1 => Some(RunState::Halted),
            2 => Some(RunState::Running),
            3 => Some(RunState::Waiting),
            4 => Some(RunState::Failed),
            _ => None,
        }
    }

    /// Whether the program is still driving its outputs.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            RunState::Initialising | RunState::Running | RunState::Waiting
        )
    }
}

impl SimEngine {
    /// Create an engine, `realtime` makes each run honour the program's delays.
    pub fn new(realtime: bool) -> Self {
        Self {
            programs: HashMap::new(),
            runs: HashMap::new(),
            next_id: 0,
            realtime,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle onto every GPIO write made by any run.
    pub fn log(&self) -> Arc<Mutex<Vec<SimEvent>>> {
        self.log.clone()
    }

    /// Block until the run of the given program has finished.
    pub fn join(&mut self, id: ProgramId) -> Result<RunState, EngineError> {
        if let Some(run) = self.runs.get_mut(&id) {
            if let Some(h) = run.handle.take() {
                if h.join().is_err() {
                    warn!("Simulated run of program {} panicked", id);
                    run.state.store(RunState::Failed as u8, Ordering::SeqCst);
                }
            }
        }
        self.status(id)
    }
}

impl TimingEngine for SimEngine {
    fn store(&mut self, program: &Program) -> Result<ProgramId, EngineError> {
        let id = self.next_id;
        self.next_id += 1;
        self.programs.insert(id, Arc::new(program.clone()));

        debug!("Stored simulated program {}", id);

        Ok(id)
    }

    fn run(&mut self, id: ProgramId, params: &[i32]) -> Result<(), EngineError> {
        let program = self
            .programs
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownProgram(id))?;

        if self.status(id)?.is_busy() {
            return Err(EngineError::AlreadyRunning(id));
        }

        // Reap the previous run's thread
        if let Some(mut old) = self.runs.remove(&id) {
            if let Some(h) = old.handle.take() {
                let _ = h.join();
            }
        }

        let state = Arc::new(AtomicU8::new(RunState::Running as u8));
        let params = params.to_vec();
        let mut sink = SimSink {
            program: id,
            realtime: self.realtime,
            start: Instant::now(),
            elapsed_us: 0,
            log: self.log.clone(),
        };

        let thread_state = state.clone();
        let handle = thread::spawn(move || {
            let result = Interpreter::new(&program)
                .with_shifts(ShiftModel::SignedShift)
                .run(&params, &mut sink);

            let end = match result {
                Ok(_) => RunState::Halted,
                Err(e) => {
                    warn!("Simulated program {} failed: {}", id, e);
                    RunState::Failed
                }
            };
            thread_state.store(end as u8, Ordering::SeqCst);
        });

        self.runs.insert(
            id,
            SimRun {
                state,
                handle: Some(handle),
            },
        );

        Ok(())
    }

    fn status(&mut self, id: ProgramId) -> Result<RunState, EngineError> {
        if !self.programs.contains_key(&id) {
            return Err(EngineError::UnknownProgram(id));
        }

        match self.runs.get(&id) {
            Some(run) => RunState::from_code(run.state.load(Ordering::SeqCst) as i32)
                .ok_or(EngineError::UnknownStatus(-1)),
            None => Ok(RunState::Halted),
        }
    }

    fn delete(&mut self, id: ProgramId) -> Result<(), EngineError> {
        if self.status(id)?.is_busy() {
            return Err(EngineError::AlreadyRunning(id));
        }

        self.join(id)?;
        self.runs.remove(&id);
        self.programs.remove(&id);

        Ok(())
    }
}

impl PulseSink for SimSink {
    fn write(&mut self, gpio: u32, high: bool) {
        if let Ok(mut log) = self.log.lock() {
            log.push(SimEvent {
                program: self.program,
                gpio,
                high,
                at_us: self.elapsed_us,
            });
        }
    }

    fn delay_us(&mut self, micros: u32) {
        self.elapsed_us += micros as u64;

        if self.realtime {
            crate::emitter::sleep_until(self.start + Duration::from_micros(self.elapsed_us));
        }
    }
}

/// Poll an engine until the program is no longer busy or the timeout expires.
///
/// Returns the last observed state.
pub fn wait_until_idle<E: TimingEngine + ?Sized>(
    engine: &mut E,
    id: ProgramId,
    timeout: Duration,
    poll: Duration,
) -> Result<RunState, EngineError> {
    let deadline = Instant::now() + timeout;

    loop {
        let state = engine.status(id)?;
        if !state.is_busy() || Instant::now() >= deadline {
            return Ok(state);
        }
        thread::sleep(poll);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hw_prog::{HardwareTimingProgram, HwProgParams};

    #[test]
    fn test_sim_engine_runs_ramp() {
        let prog = HardwareTimingProgram::new().unwrap();
        let mut engine = SimEngine::new(false);
        let log = engine.log();

        let id = engine.store(prog.program()).unwrap();
        assert_eq!(engine.status(id).unwrap(), RunState::Halted);

        let params = HwProgParams::new(200.0, 400.0, 0.2, 24).unwrap();
        engine.run(id, &params.to_array()).unwrap();

        assert_eq!(engine.join(id).unwrap(), RunState::Halted);

        let events = log.lock().unwrap().clone();
        let pulses = events.iter().filter(|e| e.high).count();
        let expected = prog.simulate(&params, ShiftModel::SignedShift).unwrap().len();

        assert_eq!(pulses, expected);
        assert!(events.iter().all(|e| e.gpio == 24));
        assert!(!events.last().unwrap().high);

        // Pulses are spaced by the program's own delays, totalling about the ramp duration
        let total_us = events.last().unwrap().at_us as f64;
        assert!((total_us * 1e-6 - 0.2).abs() < 0.01);

        engine.delete(id).unwrap();
        assert!(matches!(
            engine.status(id),
            Err(EngineError::UnknownProgram(_))
        ));
    }

    #[test]
    fn test_sim_engine_rejects_overlapping_runs() {
        let prog = HardwareTimingProgram::new().unwrap();
        let mut engine = SimEngine::new(true);
        let id = engine.store(prog.program()).unwrap();

        let params = HwProgParams::new(200.0, 0.0, 0.1, 24).unwrap();
        engine.run(id, &params.to_array()).unwrap();

        assert!(matches!(
            engine.run(id, &params.to_array()),
            Err(EngineError::AlreadyRunning(_))
        ));

        let state = wait_until_idle(
            &mut engine,
            id,
            Duration::from_secs(2),
            Duration::from_millis(5),
        )
        .unwrap();
        assert_eq!(state, RunState::Halted);
    }

    #[test]
    fn test_unknown_program() {
        let mut engine = SimEngine::new(false);
        assert!(matches!(
            engine.run(3, &[]),
            Err(EngineError::UnknownProgram(3))
        ));
    }
}
