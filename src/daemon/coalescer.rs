//! Debounced, single-flight refresh scheduling.
//!
//! Requests move a small state machine guarded by one mutex:
//!
//! ```text
//! Idle ──request──▶ Scheduled ──timer──▶ Running ──done──▶ Idle
//!                   ▲   │ request                │ request
//!                   │   └─(reset timer)          ▼
//!                   └────────done──────── RunningWithPending
//! ```
//!
//! A single driver task owns the timer and runs the refresh job. The lock is
//! never held while the job runs, so requests are accepted during a refresh
//! and only flip `Running` to `RunningWithPending`.

use crate::daemon::assembler::QueryExecutionError;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use log::{debug, error, info};
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error(transparent)]
    Query(#[from] QueryExecutionError),
    #[error("engine is shutting down")]
    ShuttingDown,
    #[error("refresh panicked: {0}")]
    Panicked(String),
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The work performed once per coalesced burst of requests.
pub trait RefreshJob: Send + Sync + 'static {
    /// `version` is the version to stamp on a snapshot published by this run.
    fn refresh(&self, version: u64) -> BoxFuture<'_, Result<(), RefreshError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Scheduled { deadline: Instant },
    Running,
    RunningWithPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PhaseKind {
    Idle,
    Scheduled,
    Running,
    RunningWithPending,
}

impl From<Phase> for PhaseKind {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Idle => Self::Idle,
            Phase::Scheduled { .. } => Self::Scheduled,
            Phase::Running => Self::Running,
            Phase::RunningWithPending => Self::RunningWithPending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshState {
    pub phase: PhaseKind,
    pub last_version: u64,
    pub completed_runs: u64,
    pub failed_runs: u64,
}

impl RefreshState {
    pub fn pending(&self) -> bool {
        matches!(
            self.phase,
            PhaseKind::Scheduled | PhaseKind::RunningWithPending
        )
    }

    pub fn running(&self) -> bool {
        matches!(self.phase, PhaseKind::Running | PhaseKind::RunningWithPending)
    }
}

struct State {
    phase: Phase,
    last_version: u64,
    completed_runs: u64,
    failed_runs: u64,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    wake: Notify,
    debounce: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scheduled_deadline(&self) -> Option<Instant> {
        match self.lock().phase {
            Phase::Scheduled { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Moves `Scheduled` to `Running` once the deadline has passed and returns
    /// the version the run should publish.
    fn begin_run(&self) -> Option<u64> {
        let mut state = self.lock();
        match state.phase {
            Phase::Scheduled { deadline } if deadline <= Instant::now() && !state.closed => {
                state.phase = Phase::Running;
                Some(state.last_version + 1)
            }
            _ => None,
        }
    }

    fn finish_run(&self, version: u64, outcome: &Result<(), RefreshError>) {
        let mut state = self.lock();
        state.completed_runs += 1;
        match outcome {
            Ok(()) => state.last_version = version,
            Err(_) => state.failed_runs += 1,
        }
        state.phase = match state.phase {
            Phase::RunningWithPending if !state.closed => Phase::Scheduled {
                deadline: Instant::now() + self.debounce,
            },
            _ => Phase::Idle,
        };
    }
}

/// Handle used to request refreshes. Cloning shares the same state machine.
#[derive(Clone)]
pub struct RefreshCoalescer {
    shared: Arc<Shared>,
}

impl RefreshCoalescer {
    /// Starts the driver task on the current tokio runtime.
    pub fn spawn<J: RefreshJob>(debounce: Duration, job: Arc<J>) -> (Self, JoinHandle<()>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                phase: Phase::Idle,
                last_version: 0,
                completed_runs: 0,
                failed_runs: 0,
                closed: false,
            }),
            wake: Notify::new(),
            debounce,
            shutdown_tx,
        });
        let driver = tokio::spawn(drive(Arc::clone(&shared), job, shutdown_rx));
        (Self { shared }, driver)
    }

    /// Records that something changed. Never blocks beyond taking the lock.
    pub fn request(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        match state.phase {
            Phase::Idle | Phase::Scheduled { .. } => {
                state.phase = Phase::Scheduled {
                    deadline: Instant::now() + self.shared.debounce,
                };
                drop(state);
                self.shared.wake.notify_one();
            }
            Phase::Running => state.phase = Phase::RunningWithPending,
            Phase::RunningWithPending => {}
        }
    }

    pub fn state(&self) -> RefreshState {
        let state = self.shared.lock();
        RefreshState {
            phase: state.phase.into(),
            last_version: state.last_version,
            completed_runs: state.completed_runs,
            failed_runs: state.failed_runs,
        }
    }

    pub fn debounce(&self) -> Duration {
        self.shared.debounce
    }

    /// Rejects new requests and stops the driver once any in-flight run ends.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        if matches!(state.phase, Phase::Scheduled { .. }) {
            state.phase = Phase::Idle;
        }
        drop(state);
        let _ = self.shared.shutdown_tx.send(true);
    }
}

async fn drive<J: RefreshJob>(shared: Arc<Shared>, job: Arc<J>, mut shutdown: watch::Receiver<bool>) {
    debug!("Refresh driver started (debounce {:?})", shared.debounce);
    loop {
        if *shutdown.borrow() {
            break;
        }
        match shared.scheduled_deadline() {
            None => {
                tokio::select! {
                    _ = shared.wake.notified() => continue,
                    _ = shutdown.changed() => break,
                }
            }
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = shared.wake.notified() => continue,
                    _ = shutdown.changed() => break,
                }
            }
        }

        // A request may have pushed the deadline out while we slept.
        let Some(version) = shared.begin_run() else {
            continue;
        };
        info!("Starting refresh (v{})", version);
        // A panicking job counts as a failed run so the phase never sticks at Running.
        let outcome = match AssertUnwindSafe(job.refresh(version)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(RefreshError::Panicked(panic_message(panic.as_ref()))),
        };
        match &outcome {
            Ok(()) => info!("Refresh v{} published", version),
            Err(RefreshError::ShuttingDown) => debug!("Refresh v{} discarded during shutdown", version),
            Err(e) => error!("Refresh v{} failed, keeping previous snapshot: {}", version, e),
        }
        shared.finish_run(version, &outcome);
    }
    debug!("Refresh driver stopped");
}
