//! Runs scheduler instances on the shared runtime.
//!
//! Each instance lives in its own task and is the only owner of its state,
//! so ticks for one instance are strictly sequential while different
//! instances interleave freely. A failed or stuck tick only delays its own
//! instance.

use crate::scheduler::{Scheduler, TickOutcome};
use chrono::Utc;
use kiln_core::ids::SchedulerId;
use kiln_core::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Default upper bound on how long an instance sleeps between ticks.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(60);

struct Registered {
    id: SchedulerId,
    wakeup: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Wakes a fixed set of scheduler tasks; handed to change feeds that outlive
/// a borrow of the service.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    wakeups: Vec<Arc<Notify>>,
}

impl ChangeNotifier {
    pub fn notify(&self) {
        for wakeup in &self.wakeups {
            wakeup.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.wakeups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wakeups.is_empty()
    }
}

/// Owns the tasks driving every registered scheduler.
pub struct SchedulerService {
    idle_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    schedulers: Vec<Registered>,
    ids: HashSet<SchedulerId>,
}

impl SchedulerService {
    pub fn new(idle_interval: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            idle_interval,
            shutdown_tx,
            schedulers: Vec::new(),
            ids: HashSet::new(),
        }
    }

    /// Spawn a task for `scheduler`. Ids must be unique across the service.
    pub fn register(&mut self, scheduler: Box<dyn Scheduler>) -> Result<()> {
        let id = scheduler.id().clone();
        if !self.ids.insert(id.clone()) {
            return Err(Error::InvalidConfig(format!(
                "scheduler {id} is registered twice"
            )));
        }

        let wakeup = Arc::new(Notify::new());
        let handle = tokio::spawn(run_scheduler(
            scheduler,
            wakeup.clone(),
            self.shutdown_tx.subscribe(),
            self.idle_interval,
        ));

        info!(scheduler = %id, "Registered scheduler");
        self.schedulers.push(Registered { id, wakeup, handle });
        Ok(())
    }

    pub fn scheduler_ids(&self) -> Vec<SchedulerId> {
        self.schedulers.iter().map(|s| s.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.schedulers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.is_empty()
    }

    /// Wake every instance so new changes are classified without waiting
    /// for the idle interval.
    pub fn notify_changes(&self) {
        self.change_notifier().notify();
    }

    /// A notifier for the instances registered so far.
    pub fn change_notifier(&self) -> ChangeNotifier {
        ChangeNotifier {
            wakeups: self.schedulers.iter().map(|s| s.wakeup.clone()).collect(),
        }
    }

    /// Wake a single instance.
    pub fn notify(&self, id: &SchedulerId) -> Result<()> {
        let scheduler = self
            .schedulers
            .iter()
            .find(|s| &s.id == id)
            .ok_or_else(|| Error::SchedulerNotFound(id.to_string()))?;
        scheduler.wakeup.notify_one();
        Ok(())
    }

    /// Ask every task to stop after its current tick.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for every task to finish.
    pub async fn join(self) {
        for scheduler in self.schedulers {
            if let Err(e) = scheduler.handle.await {
                error!(scheduler = %scheduler.id, error = %e, "Scheduler task panicked");
            }
        }
    }
}

impl Default for SchedulerService {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_INTERVAL)
    }
}

async fn run_scheduler(
    mut scheduler: Box<dyn Scheduler>,
    wakeup: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    idle_interval: Duration,
) {
    let id = scheduler.id().clone();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let wake_at = match scheduler.tick(Utc::now()).await {
            Ok(outcome) => {
                log_outcome(&id, &outcome);
                outcome.wake_at()
            }
            Err(e) => {
                debug!(
                    scheduler = %id,
                    error = %e,
                    transient = e.is_transient(),
                    "Scheduler tick failed"
                );
                None
            }
        };

        let sleep_for = wake_at
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .map_or(idle_interval, |d| d.min(idle_interval));

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = wakeup.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!(scheduler = %id, "Scheduler stopped");
}

fn log_outcome(id: &SchedulerId, outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Scheduled {
            submissions,
            retired,
        } => info!(scheduler = %id, submissions, retired, "Tick scheduled builds"),
        TickOutcome::Reconciled {
            submissions,
            next_poll,
        } if *submissions > 0 => {
            info!(scheduler = %id, submissions, next_poll = %next_poll, "Tick topped up floor")
        }
        other => debug!(scheduler = %id, outcome = ?other, "Tick finished"),
    }
}
