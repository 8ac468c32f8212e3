//! # Motion command queue
//!
//! Commands derived from the orientation stream are handed to a single worker thread which
//! executes them one at a time, strictly in the order they were submitted. Submissions are
//! tagged with the sequence number of the orientation update they came from, and an update that
//! is not newer than the last accepted one is dropped.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod executor;
pub mod follower;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{error, info, trace, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use util::archive::Archiver;

use crate::gpio::Direction;
use crate::motor::MotorError;

pub use executor::{EmitterExecutor, HardwareExecutor};
pub use follower::{FollowerParams, OrientationFollower};

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Something able to carry out motion commands.
pub trait MotionExecutor: Send + 'static {
    fn execute(&mut self, command: &MotionCommand) -> Result<(), MotorError>;

    /// Called once when the worker exits.
    fn finish(&mut self) -> Result<(), MotorError> {
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// One physically continuous ramp of the motor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotionCommand {
    pub direction: Direction,

    /// Shaft acceleration, positive speeds the motor up in `direction`.
    ///
    /// Units: rad/s^2
    pub acceleration: f64,

    /// Units: Hz
    pub start_frequency: f64,

    /// Units: seconds
    pub duration: f64,
}

pub struct MotionCommandQueue<E: MotionExecutor> {
    tx: Sender<QueueItem>,
    done_rx: Receiver<()>,
    worker: JoinHandle<DrainReport<E>>,
    last_seq: Option<u64>,
    pending: Arc<AtomicUsize>,
}

/// What the worker hands back once it has exited.
pub struct DrainReport<E> {
    pub executor: E,

    /// Number of commands executed successfully.
    pub executed: usize,

    /// The hardware fault which ended the worker early, if any.
    pub fault: Option<MotorError>,
}

/// Archived record of one executed command.
#[derive(Debug, Clone, Copy, Serialize)]
struct CommandRecord {
    time_s: f64,
    seq: u64,
    direction: Direction,
    acceleration: f64,
    start_frequency: f64,
    duration: f64,
    exec_s: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueueItem {
    Move { seq: u64, command: MotionCommand },

    /// Sentinel telling the worker to exit.
    Shutdown,
}

/// Outcome of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The batch was queued, holding this many commands.
    Accepted(usize),

    /// The update was not newer than the last accepted one and was dropped.
    Stale { seq: u64, last: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("The queue worker has exited")]
    WorkerGone,

    #[error("The queue did not drain within {0} s")]
    DrainTimeout(f64),

    #[error("The queue worker panicked")]
    WorkerPanicked,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<E: MotionExecutor> MotionCommandQueue<E> {
    /// Start the worker. Executed commands are archived if an archiver is given.
    pub fn new(executor: E, archiver: Option<Archiver>) -> Self {
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_pending = pending.clone();
        let worker = thread::spawn(move || {
            let report = queue_worker(executor, rx, worker_pending, archiver);
            done_tx.send(()).ok();
            report
        });

        Self {
            tx,
            done_rx,
            worker,
            last_seq: None,
            pending,
        }
    }

    /// Whether an update with this sequence number would be accepted.
    pub fn admits(&self, seq: u64) -> bool {
        self.last_seq.map_or(true, |last| seq > last)
    }

    /// Sequence number of the last accepted update.
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Number of commands waiting for the worker.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Queue the commands derived from update `seq`.
    ///
    /// Stale updates are logged and dropped, this is not an error.
    pub fn submit(
        &mut self,
        seq: u64,
        batch: Vec<MotionCommand>,
    ) -> Result<Admission, QueueError> {
        if let Some(last) = self.last_seq {
            if seq <= last {
                warn!("Dropping out of order update {} (last accepted {})", seq, last);
                return Ok(Admission::Stale { seq, last });
            }
        }
        self.last_seq = Some(seq);

        let n = batch.len();
        for command in batch {
            self.pending.fetch_add(1, Ordering::SeqCst);
            if self.tx.send(QueueItem::Move { seq, command }).is_err() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                return Err(QueueError::WorkerGone);
            }
        }

        Ok(Admission::Accepted(n))
    }

    /// Send the shutdown sentinel and wait, at most `timeout`, for the worker to drain the queue
    /// and exit.
    ///
    /// On a timeout the worker is left to finish on its own.
    pub fn shutdown(self, timeout: Duration) -> Result<DrainReport<E>, QueueError> {
        // The worker may already be gone after a fault
        self.tx.send(QueueItem::Shutdown).ok();

        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => (),
            Err(RecvTimeoutError::Timeout) => {
                return Err(QueueError::DrainTimeout(timeout.as_secs_f64()))
            }
        }

        self.worker.join().map_err(|_| QueueError::WorkerPanicked)
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn queue_worker<E: MotionExecutor>(
    mut executor: E,
    rx: Receiver<QueueItem>,
    pending: Arc<AtomicUsize>,
    mut archiver: Option<Archiver>,
) -> DrainReport<E> {
    let start = Instant::now();
    let mut executed = 0;
    let mut fault = None;

    while let Ok(item) = rx.recv() {
        let (seq, command) = match item {
            QueueItem::Move { seq, command } => (seq, command),
            QueueItem::Shutdown => {
                info!("Queue worker received shutdown");
                break;
            }
        };
        pending.fetch_sub(1, Ordering::SeqCst);

        trace!("Executing {:?} from update {}", command, seq);

        let t0 = start.elapsed().as_secs_f64();
        match executor.execute(&command) {
            Ok(()) => {
                executed += 1;

                if let Some(a) = archiver.as_mut() {
                    let record = CommandRecord {
                        time_s: t0,
                        seq,
                        direction: command.direction,
                        acceleration: command.acceleration,
                        start_frequency: command.start_frequency,
                        duration: command.duration,
                        exec_s: start.elapsed().as_secs_f64() - t0,
                    };
                    if let Err(e) = a.serialise(record) {
                        warn!("Could not archive command: {}", e);
                    }
                }
            }
            Err(MotorError::HardwareFault(e)) => {
                error!("Hardware fault executing command from update {}: {}", seq, e);
                fault = Some(MotorError::HardwareFault(e));
                break;
            }
            Err(e) => warn!("Skipping command from update {}: {}", seq, e),
        }
    }

    if let Err(e) = executor.finish() {
        warn!("Executor did not finish cleanly: {}", e);
    }

    info!("Queue worker exiting after {} commands", executed);

    DrainReport {
        executor,
        executed,
        fault,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gpio::GpioError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        log: Arc<Mutex<Vec<u64>>>,
        delay: Duration,
        fail_on: Option<u64>,
    }

    impl MotionExecutor for Recording {
        fn execute(&mut self, command: &MotionCommand) -> Result<(), MotorError> {
            thread::sleep(self.delay);

            // Tests encode an identifier in the duration
            let id = command.duration as u64;
            if self.fail_on == Some(id) {
                return Err(MotorError::HardwareFault(GpioError::Init("injected".into())));
            }

            self.log.lock().unwrap().push(id);
            Ok(())
        }
    }

    fn cmd(id: u64) -> MotionCommand {
        MotionCommand {
            direction: Direction::Forward,
            acceleration: 0.0,
            start_frequency: 300.0,
            duration: id as f64,
        }
    }

    #[test]
    fn test_stale_updates_are_dropped() {
        let exec = Recording::default();
        let log = exec.log.clone();
        let mut q = MotionCommandQueue::new(exec, None);

        assert_eq!(q.submit(1, vec![cmd(1)]).unwrap(), Admission::Accepted(1));
        assert_eq!(q.submit(2, vec![cmd(2)]).unwrap(), Admission::Accepted(1));
        assert_eq!(q.submit(3, vec![cmd(3)]).unwrap(), Admission::Accepted(1));
        assert_eq!(
            q.submit(2, vec![cmd(20)]).unwrap(),
            Admission::Stale { seq: 2, last: 3 }
        );
        assert!(!q.admits(3));
        assert!(q.admits(4));

        let report = q.shutdown(Duration::from_secs(2)).unwrap();
        assert_eq!(report.executed, 3);
        assert!(report.fault.is_none());
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_batches_keep_order() {
        let exec = Recording {
            delay: Duration::from_millis(2),
            ..Default::default()
        };
        let log = exec.log.clone();
        let mut q = MotionCommandQueue::new(exec, None);

        q.submit(10, vec![cmd(1), cmd(2)]).unwrap();
        q.submit(11, vec![]).unwrap();
        q.submit(12, vec![cmd(3), cmd(4), cmd(5)]).unwrap();

        let report = q.shutdown(Duration::from_secs(2)).unwrap();
        assert_eq!(report.executed, 5);
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_hardware_fault_stops_worker() {
        let exec = Recording {
            fail_on: Some(2),
            ..Default::default()
        };
        let log = exec.log.clone();
        let mut q = MotionCommandQueue::new(exec, None);

        q.submit(1, vec![cmd(1), cmd(2), cmd(3)]).unwrap();

        // Later submissions fail once the worker has gone
        let mut gone = false;
        for seq in 2..200 {
            if let Err(QueueError::WorkerGone) = q.submit(seq, vec![cmd(9)]) {
                gone = true;
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(gone);

        let report = q.shutdown(Duration::from_secs(1)).unwrap();
        assert_eq!(report.executed, 1);
        assert!(matches!(report.fault, Some(MotorError::HardwareFault(_))));
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_shutdown_is_bounded() {
        let exec = Recording {
            delay: Duration::from_millis(300),
            ..Default::default()
        };
        let mut q = MotionCommandQueue::new(exec, None);
        q.submit(1, vec![cmd(1), cmd(2)]).unwrap();

        assert!(matches!(
            q.shutdown(Duration::from_millis(20)),
            Err(QueueError::DrainTimeout(_))
        ));
    }
}
