//! Stepping and rollback over a set of simulations.
//!
//! The [`Controller`] owns a [`Scheduler`] and a [`Recorder`] and drives both:
//! `step(n)` runs `n` rounds, recording every unit after each round when
//! history is enabled; `step_back(n)` restores every unit `n` times. Either
//! can run on the calling thread or on a background thread.
//!
//! Stepping and rolling back are serialized by the scheduler lock, so a
//! rollback never observes a half-finished round.

use crate::codec::CodecRegistry;
use crate::compress::Compressor;
use crate::config::RuntimeConfig;
use crate::failure::FailureHandler;
use crate::history::{HistoryError, Recorder, Restore};
use crate::id::UnitId;
use crate::scheduler::{Interrupter, RoundOutcome, Scheduler, SchedulerConfig, SchedulerError};
use crate::sim::Simulation;
use crate::unit::UnitHandle;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Errors and reports
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("history operation failed for {unit}: {source}")]
    History {
        unit: UnitId,
        #[source]
        source: HistoryError,
    },
    #[error("background step thread failed: {0}")]
    Worker(String),
}

/// What a `step` or `step_back` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Rounds run (for `step`) or rollbacks performed (for `step_back`).
    pub rounds: u32,
    /// Units that halted and were taken out of future rounds.
    pub halted: Vec<UnitId>,
    /// Units restored, with the cycle each was restored to.
    pub restored: Vec<(UnitId, u64)>,
    /// A round wait was interrupted and stepping stopped early.
    pub interrupted: bool,
}

/// Result of a `step` or `step_back` call.
#[derive(Debug)]
pub enum Completion {
    /// The work ran on the calling thread.
    Done(StepReport),
    /// The work is running on a background thread.
    Pending(JoinHandle<Result<StepReport, ControllerError>>),
}

impl Completion {
    /// Wait for the work to finish.
    pub fn wait(self) -> Result<StepReport, ControllerError> {
        match self {
            Completion::Done(report) => Ok(report),
            Completion::Pending(handle) => handle
                .join()
                .map_err(|payload| ControllerError::Worker(crate::failure::panic_message(payload.as_ref())))?,
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Controller {
    scheduler: Mutex<Scheduler>,
    interrupter: Interrupter,
    units: RwLock<IndexMap<UnitId, UnitHandle<Simulation>>>,
    recorder: Recorder,
    record_each_round: bool,
}

impl Controller {
    /// Build a controller from runtime settings, failures going to the
    /// process-wide handler.
    pub fn new(config: &RuntimeConfig, codecs: &CodecRegistry) -> Result<Arc<Self>, ControllerError> {
        Self::build(config, codecs, None)
    }

    /// Like [`Controller::new`], with a dedicated failure handler.
    pub fn with_failure_handler(
        config: &RuntimeConfig,
        codecs: &CodecRegistry,
        handler: Arc<dyn FailureHandler>,
    ) -> Result<Arc<Self>, ControllerError> {
        Self::build(config, codecs, Some(handler))
    }

    fn build(
        config: &RuntimeConfig,
        codecs: &CodecRegistry,
        failure_handler: Option<Arc<dyn FailureHandler>>,
    ) -> Result<Arc<Self>, ControllerError> {
        let scheduler = Scheduler::new(SchedulerConfig {
            concurrency: config.concurrency,
            failure_handler,
            ..SchedulerConfig::default()
        })?;
        if !codecs.contains(&config.codec) {
            warn!(codec = %config.codec, "unknown codec, falling back to binary");
        }
        let mut recorder = Recorder::new(codecs.by_name(&config.codec)).with_max_depth(config.history.max_depth);
        if config.history.compress {
            recorder = recorder.with_compression(Compressor::new(config.history.compression_level));
        }
        info!(
            mode = ?scheduler.mode(),
            codec = recorder.codec().format_name(),
            record = config.history.enabled,
            compress = config.history.compress,
            "controller ready"
        );
        Ok(Arc::new(Self {
            interrupter: scheduler.interrupter(),
            scheduler: Mutex::new(scheduler),
            units: RwLock::new(IndexMap::new()),
            recorder,
            record_each_round: config.history.enabled,
        }))
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Handle that interrupts the round currently being waited on.
    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    /// Add a simulation and schedule it. When history is enabled its initial
    /// state is recorded immediately, so the first step can be rolled back.
    pub fn add(&self, sim: Simulation) -> Result<UnitHandle<Simulation>, ControllerError> {
        let handle = UnitHandle::new(sim);
        if self.record_each_round {
            self.recorder
                .record(&mut *handle.lock())
                .map_err(|source| ControllerError::History {
                    unit: handle.id(),
                    source,
                })?;
        }
        self.scheduler.lock().register(&handle);
        self.units.write().insert(handle.id(), handle.clone());
        debug!(unit = %handle.id(), "simulation added");
        Ok(handle)
    }

    /// Remove a simulation. Returns `None` if it was not part of this
    /// controller.
    pub fn remove(&self, unit: UnitId) -> Option<UnitHandle<Simulation>> {
        self.scheduler.lock().unregister(unit);
        self.units.write().shift_remove(&unit)
    }

    pub fn unit(&self, unit: UnitId) -> Option<UnitHandle<Simulation>> {
        self.units.read().get(&unit).cloned()
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.units.read().keys().copied().collect()
    }

    /// Units still taking part in rounds.
    pub fn scheduled(&self) -> Vec<UnitId> {
        self.scheduler.lock().units()
    }

    /// Run `n` rounds.
    pub fn step(self: &Arc<Self>, n: u32, synchronous: bool) -> Result<Completion, ControllerError> {
        if synchronous {
            return Ok(Completion::Done(self.run_steps(n)?));
        }
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("stepback-step".to_string())
            .spawn(move || this.run_steps(n))
            .map_err(|e| ControllerError::Worker(e.to_string()))?;
        Ok(Completion::Pending(handle))
    }

    /// Roll every unit back `n` times.
    pub fn step_back(self: &Arc<Self>, n: u32, synchronous: bool) -> Result<Completion, ControllerError> {
        if synchronous {
            return Ok(Completion::Done(self.run_step_back(n)?));
        }
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("stepback-back".to_string())
            .spawn(move || this.run_step_back(n))
            .map_err(|e| ControllerError::Worker(e.to_string()))?;
        Ok(Completion::Pending(handle))
    }

    /// Record every unit now. Returns the number of units recorded.
    pub fn record_now(&self) -> Result<usize, ControllerError> {
        let _round_guard = self.scheduler.lock();
        self.record_all()
    }

    /// Restore every unit once.
    pub fn restore_now(&self) -> Result<Vec<(UnitId, Restore)>, ControllerError> {
        let mut scheduler = self.scheduler.lock();
        let units: Vec<_> = self.units.read().values().cloned().collect();
        let mut outcomes = Vec::with_capacity(units.len());
        for unit in units {
            let outcome = self
                .recorder
                .restore(&mut *unit.lock())
                .map_err(|source| ControllerError::History {
                    unit: unit.id(),
                    source,
                })?;
            if let Restore::Restored { .. } = outcome {
                scheduler.register(&unit);
            }
            outcomes.push((unit.id(), outcome));
        }
        Ok(outcomes)
    }

    /// Dispose the scheduler. Units stay accessible but no further rounds
    /// can run.
    pub fn dispose(&self) {
        self.scheduler.lock().dispose();
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn record_all(&self) -> Result<usize, ControllerError> {
        let units: Vec<_> = self.units.read().values().cloned().collect();
        for unit in &units {
            self.recorder
                .record(&mut *unit.lock())
                .map_err(|source| ControllerError::History {
                    unit: unit.id(),
                    source,
                })?;
        }
        Ok(units.len())
    }

    fn run_steps(&self, n: u32) -> Result<StepReport, ControllerError> {
        let mut report = StepReport::default();
        for _ in 0..n {
            let mut scheduler = self.scheduler.lock();
            match scheduler.run_round()? {
                RoundOutcome::Completed(round) => {
                    for unit in &round.halted {
                        scheduler.unregister(*unit);
                        info!(%unit, "simulation halted");
                    }
                    report.halted.extend(round.halted);
                    report.rounds += 1;
                }
                RoundOutcome::Interrupted { pending } => {
                    debug!(pending, "stepping interrupted");
                    report.interrupted = true;
                    return Ok(report);
                }
            }
            if self.record_each_round {
                self.record_all()?;
            }
        }
        Ok(report)
    }

    fn run_step_back(&self, n: u32) -> Result<StepReport, ControllerError> {
        let mut report = StepReport::default();
        for _ in 0..n {
            let mut scheduler = self.scheduler.lock();
            let units: Vec<_> = self.units.read().values().cloned().collect();
            let mut any = false;
            for unit in units {
                let mut sim = unit.lock();
                if !self.recorder.can_step_back(&*sim) {
                    continue;
                }
                let outcome = self
                    .recorder
                    .restore(&mut *sim)
                    .map_err(|source| ControllerError::History {
                        unit: unit.id(),
                        source,
                    })?;
                drop(sim);
                if let Restore::Restored { cycle } = outcome {
                    scheduler.register(&unit);
                    report.restored.push((unit.id(), cycle));
                    any = true;
                }
            }
            if !any {
                break;
            }
            report.rounds += 1;
        }
        Ok(report)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
