use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::pipeline::{JobOutcome, Orchestrator};

/// Result of one scheduler tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// A job is still in flight; nothing was fetched.
    Busy,
    /// The source had no job, or could not be reached.
    Idle,
    /// A job was fetched and is being processed on its own task.
    Started(JoinHandle<JobOutcome>),
}

/// Asks the job source for work on a cron schedule, one job at a time.
///
/// The single in-flight slot is a one-permit semaphore. The spawned job task
/// owns the permit, so the slot frees itself however the task ends.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    slot: Arc<Semaphore>,
    schedule: Schedule,
}

impl Scheduler {
    pub fn new(orchestrator: Orchestrator, schedule: &str) -> anyhow::Result<Self> {
        let schedule =
            Schedule::from_str(schedule).with_context(|| format!("invalid schedule expression `{schedule}`"))?;
        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            slot: Arc::new(Semaphore::new(1)),
            schedule,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }

    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickOutcome {
        let Ok(permit) = self.slot.clone().try_acquire_owned() else {
            debug!("job in flight, skipping tick");
            return TickOutcome::Busy;
        };

        let job = match self.orchestrator.source().fetch().await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!("no job available");
                return TickOutcome::Idle;
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch job");
                return TickOutcome::Idle;
            }
        };

        info!(job = %job, "job received");
        let orchestrator = self.orchestrator.clone();
        TickOutcome::Started(tokio::spawn(async move {
            let _permit = permit;
            orchestrator.process(job).await
        }))
    }

    /// Time until the schedule next fires, from now.
    pub fn until_next_fire(&self) -> Option<Duration> {
        self.until_next_fire_from(Utc::now())
    }

    fn until_next_fire_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        let next = self.schedule.after(&now).next()?;
        (next - now).to_std().ok()
    }

    /// Tick immediately, then on every fire time until `shutdown` resolves.
    /// Returns once the in-flight job, if any, has finished.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.tick().await;

        loop {
            let Some(wait) = self.until_next_fire() else {
                warn!("schedule has no upcoming fire time, stopping");
                break;
            };
            debug!(wait_secs = wait.as_secs(), "waiting for next tick");

            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(wait) => {
                    self.tick().await;
                }
            }
        }

        self.drain().await;
    }

    /// Process at most one job and wait for it.
    pub async fn run_once(&self) -> Option<JobOutcome> {
        match self.tick().await {
            TickOutcome::Started(handle) => match handle.await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!(error = %e, "job task failed");
                    None
                }
            },
            TickOutcome::Busy | TickOutcome::Idle => None,
        }
    }

    /// Wait for the in-flight job to release the slot.
    pub async fn drain(&self) {
        if self.is_busy() {
            info!("waiting for in-flight job to finish");
        }
        // The semaphore is never closed, so this only waits.
        let _ = self.slot.acquire().await;
    }
}
