//! Concurrency Coordinator: a bounded worker pool over one stage's units.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use clip_core::{ClipError, CommitOutcome, FailedUnit, PipelineConfig, RunReport, Store, WorkUnit};

use crate::handlers::StageHandler;

/// Runs work units across a fixed number of workers.
///
/// Each unit is claimed before its collaborator call, so two runs sharing
/// this coordinator (clones share claims) never compute the same unit at
/// once. A unit's failure is recorded in the report and never stops the
/// other units.
#[derive(Debug, Clone)]
pub struct Coordinator {
    workers: usize,
    unit_timeout: Duration,
    cancel: Arc<AtomicBool>,
    claims: Arc<Mutex<HashSet<String>>>,
}

impl Coordinator {
    pub fn new(workers: usize, unit_timeout: Duration) -> Self {
        Self {
            workers: workers.max(1),
            unit_timeout,
            cancel: Arc::new(AtomicBool::new(false)),
            claims: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.workers,
            Duration::from_secs(config.unit_timeout_secs),
        )
    }

    /// Share an externally owned cancellation flag.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Flag checked between units; setting it stops workers after their
    /// current unit.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn unit_timeout(&self) -> Duration {
        self.unit_timeout
    }

    /// Process `units` with `handler`, returning the stage's run report.
    pub async fn run<S, H>(&self, store: Arc<S>, handler: Arc<H>, units: Vec<WorkUnit>) -> RunReport
    where
        S: Store + ?Sized + 'static,
        H: StageHandler + 'static,
    {
        let stage = handler.stage();
        let mut report = RunReport::begin(stage);

        let mut seen = HashSet::new();
        let mut queue = VecDeque::with_capacity(units.len());
        for unit in units {
            if seen.insert(unit.key()) {
                queue.push_back(unit);
            } else {
                report.skipped += 1;
            }
        }

        if queue.is_empty() {
            info!(stage = %stage, "Nothing pending");
            return report.finish();
        }

        let workers = self.workers.min(queue.len());
        info!(stage = %stage, units = queue.len(), workers, "Starting stage");

        let queue = Arc::new(Mutex::new(queue));
        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            let worker = Worker {
                id: worker_id,
                store: Arc::clone(&store),
                handler: Arc::clone(&handler),
                queue: Arc::clone(&queue),
                cancel: Arc::clone(&self.cancel),
                claims: Arc::clone(&self.claims),
                unit_timeout: self.unit_timeout,
            };
            set.spawn(worker.run());
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(tally) => {
                    report.processed += tally.processed;
                    report.skipped += tally.skipped;
                    report.failed.extend(tally.failed);
                }
                Err(e) => {
                    error!(stage = %stage, "Worker task failed: {}", e);
                    report.failed.push(FailedUnit {
                        key: format!("{}:worker", stage),
                        code: "INTERNAL_ERROR".to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let remaining = queue.lock().map(|q| q.len()).unwrap_or(0);
        if remaining > 0 {
            warn!(stage = %stage, remaining, "Stage interrupted");
            report.interrupted = true;
        }

        let report = report.finish();
        info!("{}", report);
        report
    }
}

#[derive(Default)]
struct Tally {
    processed: u64,
    skipped: u64,
    failed: Vec<FailedUnit>,
}

impl Tally {
    fn fail(&mut self, key: String, error: ClipError) {
        warn!(unit = %key, code = error.error_code(), "Unit failed: {}", error);
        self.failed.push(FailedUnit {
            key,
            code: error.error_code().to_string(),
            message: error.to_string(),
        });
    }
}

/// Releases a unit claim when dropped.
struct Claim {
    claims: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Claim {
    fn acquire(claims: &Arc<Mutex<HashSet<String>>>, key: &str) -> Option<Self> {
        let mut held = claims.lock().ok()?;
        if !held.insert(key.to_string()) {
            return None;
        }
        Some(Self {
            claims: Arc::clone(claims),
            key: key.to_string(),
        })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Ok(mut held) = self.claims.lock() {
            held.remove(&self.key);
        }
    }
}

struct Worker<S: ?Sized, H> {
    id: usize,
    store: Arc<S>,
    handler: Arc<H>,
    queue: Arc<Mutex<VecDeque<WorkUnit>>>,
    cancel: Arc<AtomicBool>,
    claims: Arc<Mutex<HashSet<String>>>,
    unit_timeout: Duration,
}

impl<S, H> Worker<S, H>
where
    S: Store + ?Sized + 'static,
    H: StageHandler + 'static,
{
    async fn run(self) -> Tally {
        let mut tally = Tally::default();

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                debug!(worker = self.id, "Cancelled");
                break;
            }

            let next = self.queue.lock().ok().and_then(|mut q| q.pop_front());
            let Some(unit) = next else { break };

            self.process(unit, &mut tally).await;
        }

        tally
    }

    async fn process(&self, unit: WorkUnit, tally: &mut Tally) {
        let key = unit.key();

        let Some(_claim) = Claim::acquire(&self.claims, &key) else {
            debug!(unit = %key, "Unit claimed by another run");
            tally.skipped += 1;
            return;
        };

        match self.store.is_complete(&unit).await {
            Ok(true) => {
                debug!(unit = %key, "Already complete");
                tally.skipped += 1;
                return;
            }
            Ok(false) => {}
            Err(e) => return tally.fail(key, e),
        }

        let output = match tokio::time::timeout(self.unit_timeout, self.handler.compute(&unit)).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return tally.fail(key, e),
            Err(_) => {
                let seconds = self.unit_timeout.as_secs();
                return tally.fail(key.clone(), ClipError::Timeout { unit: key, seconds });
            }
        };

        match self.handler.commit(&unit, output).await {
            Ok(CommitOutcome::Created) => {
                debug!(worker = self.id, unit = %key, "Committed");
                tally.processed += 1;
            }
            Ok(CommitOutcome::Duplicate) => {
                debug!(worker = self.id, unit = %key, "Result already recorded, discarded");
                tally.skipped += 1;
            }
            Err(e) if e.is_duplicate() => {
                debug!(worker = self.id, unit = %key, "Lost write race, discarded");
                tally.skipped += 1;
            }
            Err(e) => tally.fail(key, e),
        }
    }
}
