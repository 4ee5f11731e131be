//! The stepping scheduler.
//!
//! A [`Scheduler`] keeps a table of registered units and runs them in rounds:
//! [`Scheduler::run_round`] submits one task per unit to a bounded worker pool
//! and returns only once every task of the round has finished. Tasks of one
//! round run in no particular order relative to each other.
//!
//! A task that fails does not fail the round. Its error (or panic) is handed
//! to the scheduler's [`FailureHandler`], and the other tasks of the round
//! run to completion.
//!
//! # Concurrency setting
//!
//! | setting | mode |
//! |---------|------|
//! | `0`     | one dedicated worker thread ([`ExecutionMode::SingleWorker`]) |
//! | `< 0`   | pool of one worker |
//! | `n > 0` | pool of `n` workers |

use crate::failure::{self, FailureCause, FailureHandler, TaskFailure};
use crate::id::UnitId;
use crate::unit::{Steppable, StepError, UnitHandle};
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// A unit's per-round work. `Ok(false)` reports that the unit halted.
pub type Task = Arc<dyn Fn() -> Result<bool, StepError> + Send + Sync>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How tasks are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Every unit runs on one dedicated thread, one after another.
    SingleWorker,
    /// A fixed pool of this many workers.
    Pool(usize),
}

impl ExecutionMode {
    pub fn from_concurrency(concurrency: i32) -> Self {
        match concurrency {
            0 => ExecutionMode::SingleWorker,
            n if n < 0 => ExecutionMode::Pool(1),
            n => ExecutionMode::Pool(n as usize),
        }
    }

    pub fn workers(self) -> usize {
        match self {
            ExecutionMode::SingleWorker => 1,
            ExecutionMode::Pool(n) => n,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// See the module docs for how this maps to an [`ExecutionMode`].
    pub concurrency: i32,
    /// Handler for task failures. `None` uses the process-wide handler.
    pub failure_handler: Option<Arc<dyn FailureHandler>>,
    /// Worker threads are named `{thread_name}-{i}`.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 0,
            failure_handler: None,
            thread_name: "stepback-worker".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler has been disposed")]
    Disposed,
    #[error("failed to start worker pool: {0}")]
    PoolBuild(String),
}

// ---------------------------------------------------------------------------
// Round results
// ---------------------------------------------------------------------------

/// Summary of a completed round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    /// Sequence number of the round, starting at 1.
    pub round: u64,
    pub submitted: usize,
    /// Units whose task reported that they halted.
    pub halted: Vec<UnitId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Every task of the round finished.
    Completed(RoundReport),
    /// The wait was interrupted with `pending` tasks still unfinished. They
    /// keep running; the scheduler stays usable.
    Interrupted { pending: usize },
}

// ---------------------------------------------------------------------------
// Round latch
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LatchState {
    remaining: usize,
    interrupted: bool,
}

/// Counts down the tasks of one round.
#[derive(Debug)]
struct RoundLatch {
    state: Mutex<LatchState>,
    changed: Condvar,
}

enum LatchWait {
    Done,
    Interrupted { pending: usize },
}

impl RoundLatch {
    fn new(tasks: usize) -> Self {
        Self {
            state: Mutex::new(LatchState {
                remaining: tasks,
                interrupted: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn count_down(&self) {
        let mut state = self.state.lock();
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            self.changed.notify_all();
        }
    }

    fn interrupt(&self) {
        self.state.lock().interrupted = true;
        self.changed.notify_all();
    }

    fn wait(&self) -> LatchWait {
        let mut state = self.state.lock();
        loop {
            if state.remaining == 0 {
                return LatchWait::Done;
            }
            if state.interrupted {
                return LatchWait::Interrupted {
                    pending: state.remaining,
                };
            }
            self.changed.wait(&mut state);
        }
    }
}

type CurrentRound = Arc<Mutex<Option<Arc<RoundLatch>>>>;

/// Interrupts a scheduler's in-progress round wait from another thread.
#[derive(Debug, Clone)]
pub struct Interrupter {
    current: CurrentRound,
}

impl Interrupter {
    /// Wake the thread blocked in [`Scheduler::run_round`]. Returns `false`
    /// when no round is in progress.
    pub fn interrupt(&self) -> bool {
        match self.current.lock().as_ref() {
            Some(latch) => {
                latch.interrupt();
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker side
// ---------------------------------------------------------------------------

/// State shared between the scheduler and its running tasks.
#[derive(Debug)]
struct WorkerShared {
    busy: AtomicUsize,
    disposed: AtomicBool,
    handler: Option<Arc<dyn FailureHandler>>,
}

impl WorkerShared {
    fn report(&self, unit: UnitId, cause: FailureCause) {
        let failure = TaskFailure { unit, cause };
        match &self.handler {
            Some(handler) => handler.on_failure(&failure),
            None => failure::global_handler().on_failure(&failure),
        }
    }
}

/// Run one task, routing every failure to the handler.
fn execute(shared: &WorkerShared, unit: UnitId, task: &Task, halted: &Mutex<Vec<UnitId>>) {
    if shared.disposed.load(Ordering::Acquire) {
        shared.report(unit, FailureCause::Cancelled);
        return;
    }
    shared.busy.fetch_add(1, Ordering::AcqRel);
    let result = catch_unwind(AssertUnwindSafe(|| task()));
    shared.busy.fetch_sub(1, Ordering::AcqRel);
    match result {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => halted.lock().push(unit),
        Ok(Err(e)) => shared.report(unit, FailureCause::Error(e)),
        Err(payload) => shared.report(unit, FailureCause::Panic(failure::panic_message(payload.as_ref()))),
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    mode: ExecutionMode,
    table: IndexMap<UnitId, Task>,
    pool: Option<ThreadPool>,
    shared: Arc<WorkerShared>,
    current: CurrentRound,
    rounds: AtomicU64,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("mode", &self.mode)
            .field("units", &self.table.len())
            .field("disposed", &self.pool.is_none())
            .field("rounds", &self.rounds.load(Ordering::Relaxed))
            .finish()
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let mode = ExecutionMode::from_concurrency(config.concurrency);
        let prefix = config.thread_name;
        let pool = ThreadPoolBuilder::new()
            .num_threads(mode.workers())
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()
            .map_err(|e| SchedulerError::PoolBuild(e.to_string()))?;
        debug!(?mode, "scheduler started");
        Ok(Self {
            mode,
            table: IndexMap::new(),
            pool: Some(pool),
            shared: Arc::new(WorkerShared {
                busy: AtomicUsize::new(0),
                disposed: AtomicBool::new(false),
                handler: config.failure_handler,
            }),
            current: Arc::new(Mutex::new(None)),
            rounds: AtomicU64::new(0),
        })
    }

    /// A scheduler with the given concurrency and the process-wide failure
    /// handler.
    pub fn with_concurrency(concurrency: i32) -> Result<Self, SchedulerError> {
        Self::new(SchedulerConfig {
            concurrency,
            ..SchedulerConfig::default()
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Register a unit with its default task: advance by one cycle. Replaces
    /// any task already registered for the unit.
    pub fn register<S: Steppable + 'static>(&mut self, unit: &UnitHandle<S>) {
        let handle = unit.clone();
        self.register_task(unit.id(), move || handle.advance());
    }

    /// Register a caller-supplied task for `unit`. Replaces any task already
    /// registered for the unit.
    pub fn register_task<F>(&mut self, unit: UnitId, task: F)
    where
        F: Fn() -> Result<bool, StepError> + Send + Sync + 'static,
    {
        if self.table.insert(unit, Arc::new(task)).is_some() {
            debug!(%unit, "task replaced");
        }
    }

    /// Remove a unit from the table. Returns `false` if it was not registered.
    pub fn unregister(&mut self, unit: UnitId) -> bool {
        self.table.shift_remove(&unit).is_some()
    }

    pub fn has_units(&self) -> bool {
        !self.table.is_empty()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Registered units in registration order.
    pub fn units(&self) -> Vec<UnitId> {
        self.table.keys().copied().collect()
    }

    pub fn is_disposed(&self) -> bool {
        self.pool.is_none()
    }

    pub fn rounds_completed(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// A handle that can interrupt this scheduler's round wait.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            current: Arc::clone(&self.current),
        }
    }

    /// Workers currently running a task, capped at the pool size. Always 1
    /// in single-worker mode.
    pub fn active_worker_estimate(&self) -> usize {
        match self.mode {
            ExecutionMode::SingleWorker => 1,
            ExecutionMode::Pool(n) => self.shared.busy.load(Ordering::Acquire).min(n),
        }
    }

    /// Run every registered task once and wait for all of them.
    pub fn run_round(&self) -> Result<RoundOutcome, SchedulerError> {
        let pool = self.pool.as_ref().ok_or(SchedulerError::Disposed)?;
        let started = Instant::now();
        let tasks: Vec<(UnitId, Task)> = self
            .table
            .iter()
            .map(|(id, task)| (*id, Arc::clone(task)))
            .collect();
        let submitted = tasks.len();
        let halted = Arc::new(Mutex::new(Vec::new()));

        if submitted > 0 {
            let latch = Arc::new(RoundLatch::new(submitted));
            *self.current.lock() = Some(Arc::clone(&latch));
            for (unit, task) in tasks {
                let latch = Arc::clone(&latch);
                let shared = Arc::clone(&self.shared);
                let halted = Arc::clone(&halted);
                pool.spawn(move || {
                    execute(&shared, unit, &task, &halted);
                    latch.count_down();
                });
            }
            let waited = latch.wait();
            *self.current.lock() = None;
            if let LatchWait::Interrupted { pending } = waited {
                warn!(pending, "round wait interrupted");
                return Ok(RoundOutcome::Interrupted { pending });
            }
        }

        let round = self.rounds.fetch_add(1, Ordering::AcqRel) + 1;
        let halted = std::mem::take(&mut *halted.lock());
        debug!(
            round,
            submitted,
            halted = halted.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "round complete"
        );
        Ok(RoundOutcome::Completed(RoundReport {
            round,
            submitted,
            halted,
        }))
    }

    /// Clear the table and shut the pool down. Tasks still queued are
    /// reported as cancelled if they get to run at all; tasks already running
    /// finish on their own.
    pub fn dispose(&mut self) {
        self.shared.disposed.store(true, Ordering::Release);
        self.table.clear();
        if self.pool.take().is_some() {
            info!(rounds = self.rounds_completed(), "scheduler disposed");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use std::sync::mpsc;

    fn scheduler(concurrency: i32, handler: &Arc<CollectingHandler>) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            concurrency,
            failure_handler: Some(handler.clone() as Arc<dyn FailureHandler>),
            ..SchedulerConfig::default()
        })
        .unwrap()
    }

    fn completed(outcome: RoundOutcome) -> RoundReport {
        match outcome {
            RoundOutcome::Completed(report) => report,
            other => panic!("expected Completed, got: {other:?}"),
        }
    }

    #[test]
    fn concurrency_mapping() {
        assert_eq!(ExecutionMode::from_concurrency(0), ExecutionMode::SingleWorker);
        assert_eq!(ExecutionMode::from_concurrency(-3), ExecutionMode::Pool(1));
        assert_eq!(ExecutionMode::from_concurrency(6), ExecutionMode::Pool(6));
        assert_eq!(ExecutionMode::SingleWorker.workers(), 1);
    }

    #[test]
    fn round_advances_every_unit_once() {
        for concurrency in [0, 1, 4] {
            let handler = Arc::new(CollectingHandler::default());
            let mut s = scheduler(concurrency, &handler);
            let units: Vec<_> = (0..3).map(|_| UnitHandle::new(CountingUnit::default())).collect();
            for u in &units {
                s.register(u);
            }
            let report = completed(s.run_round().unwrap());
            assert_eq!(report.submitted, 3);
            assert_eq!(report.round, 1);
            for u in &units {
                assert_eq!(u.lock().count, 1, "concurrency {concurrency}");
            }
            assert!(handler.failures().is_empty());
        }
    }

    #[test]
    fn empty_round_completes() {
        let handler = Arc::new(CollectingHandler::default());
        let s = scheduler(2, &handler);
        assert!(!s.has_units());
        assert_eq!(completed(s.run_round().unwrap()).submitted, 0);
    }

    #[test]
    fn failing_task_is_reported_once_and_round_completes() {
        let handler = Arc::new(CollectingHandler::default());
        let mut s = scheduler(3, &handler);
        let good: Vec<_> = (0..4).map(|_| UnitHandle::new(CountingUnit::default())).collect();
        for u in &good {
            s.register(u);
        }
        let bad = UnitId::next();
        s.register_task(bad, || Err(StepError::msg("broken")));

        completed(s.run_round().unwrap());
        for u in &good {
            assert_eq!(u.lock().count, 1);
        }
        let failures = handler.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].unit, bad);
        assert_eq!(failures[0].cause, FailureCause::Error(StepError::msg("broken")));
    }

    #[test]
    fn panicking_task_is_reported() {
        let handler = Arc::new(CollectingHandler::default());
        let mut s = scheduler(0, &handler);
        let unit = UnitId::next();
        s.register_task(unit, || panic!("task exploded"));
        completed(s.run_round().unwrap());
        match &handler.failures()[..] {
            [TaskFailure { cause: FailureCause::Panic(msg), .. }] => assert_eq!(msg, "task exploded"),
            other => panic!("expected one panic failure, got: {other:?}"),
        }
        // The worker survived the panic.
        completed(s.run_round().unwrap());
        assert_eq!(handler.failures().len(), 2);
    }

    #[test]
    fn halted_units_are_reported() {
        let handler = Arc::new(CollectingHandler::default());
        let mut s = scheduler(2, &handler);
        let stays = UnitId::next();
        let stops = UnitId::next();
        s.register_task(stays, || Ok(true));
        s.register_task(stops, || Ok(false));
        let report = completed(s.run_round().unwrap());
        assert_eq!(report.halted, vec![stops]);
    }

    #[test]
    fn reregistration_replaces_task() {
        let handler = Arc::new(CollectingHandler::default());
        let mut s = scheduler(1, &handler);
        let unit = UnitId::next();
        s.register_task(unit, || Err(StepError::msg("old")));
        s.register_task(unit, || Ok(true));
        assert_eq!(s.len(), 1);
        completed(s.run_round().unwrap());
        assert!(handler.failures().is_empty());
    }

    #[test]
    fn unregister_is_safe_when_absent() {
        let handler = Arc::new(CollectingHandler::default());
        let mut s = scheduler(1, &handler);
        let unit = UnitHandle::new(CountingUnit::default());
        s.register(&unit);
        assert!(s.unregister(unit.id()));
        assert!(!s.unregister(unit.id()));
        assert!(!s.unregister(UnitId::next()));
        assert_eq!(completed(s.run_round().unwrap()).submitted, 0);
        assert_eq!(unit.lock().count, 0);
    }

    #[test]
    fn interrupt_aborts_wait_and_pool_stays_usable() {
        let handler = Arc::new(CollectingHandler::default());
        let mut s = scheduler(2, &handler);
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let release_rx = Mutex::new(release_rx);
        let blocker = UnitId::next();
        s.register_task(blocker, move || {
            let _ = started_tx.lock().send(());
            let _ = release_rx.lock().recv();
            Ok(true)
        });

        let interrupter = s.interrupter();
        assert!(!interrupter.interrupt());
        let waker = std::thread::spawn(move || {
            started_rx.recv().unwrap();
            assert!(interrupter.interrupt());
        });
        match s.run_round().unwrap() {
            RoundOutcome::Interrupted { pending } => assert_eq!(pending, 1),
            other => panic!("expected Interrupted, got: {other:?}"),
        }
        waker.join().unwrap();
        release_tx.send(()).unwrap();

        s.unregister(blocker);
        let unit = UnitHandle::new(CountingUnit::default());
        s.register(&unit);
        completed(s.run_round().unwrap());
        assert_eq!(unit.lock().count, 1);
    }

    #[test]
    fn active_worker_estimate_is_capped() {
        let handler = Arc::new(CollectingHandler::default());
        let single = scheduler(0, &handler);
        assert_eq!(single.active_worker_estimate(), 1);
        let pool = scheduler(3, &handler);
        assert_eq!(pool.active_worker_estimate(), 0);
        pool.shared.busy.store(10, Ordering::Release);
        assert_eq!(pool.active_worker_estimate(), 3);
        pool.shared.busy.store(0, Ordering::Release);
    }

    #[test]
    fn dispose_clears_table_and_rejects_rounds() {
        let handler = Arc::new(CollectingHandler::default());
        let mut s = scheduler(2, &handler);
        s.register(&UnitHandle::new(CountingUnit::default()));
        s.dispose();
        assert!(!s.has_units());
        assert!(s.is_disposed());
        assert!(matches!(s.run_round(), Err(SchedulerError::Disposed)));
        s.dispose();
    }

    #[test]
    fn tasks_run_after_dispose_are_cancelled() {
        let handler = Arc::new(CollectingHandler::default());
        let shared = WorkerShared {
            busy: AtomicUsize::new(0),
            disposed: AtomicBool::new(true),
            handler: Some(handler.clone() as Arc<dyn FailureHandler>),
        };
        let unit = UnitId::next();
        let task: Task = Arc::new(|| Ok(true));
        execute(&shared, unit, &task, &Mutex::new(Vec::new()));
        assert_eq!(
            handler.failures(),
            vec![TaskFailure { unit, cause: FailureCause::Cancelled }]
        );
    }
}
