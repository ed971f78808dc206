use crate::server::ServerId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Periodic background jobs attached to a running server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitorJob {
    /// Crash detection
    CrashWatch,
    /// Per-server stats recording
    StatsPoll,
}

struct JobSlot {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Periodic job slots of one server.
///
/// Each job runs on its own task and is stopped through a flag rather than
/// aborted, so a job may cancel itself from inside its own tick.
pub struct ServerMonitor {
    server_id: ServerId,
    jobs: Mutex<HashMap<MonitorJob, JobSlot>>,
}

impl ServerMonitor {
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `tick` every `period`, replacing any job already in the slot.
    ///
    /// The first tick happens one period after scheduling.
    pub fn schedule<F, Fut>(&self, job: MonitorJob, period: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, mut stop_rx) = watch::channel(false);
        let server_id = self.server_id;

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        tick().await;
                    }
                }
            }
            tracing::debug!(server_id = %server_id, job = ?job, "Monitor job stopped");
        });

        let previous = match self.jobs.lock() {
            Ok(mut jobs) => jobs.insert(job, JobSlot { stop, handle }),
            Err(_) => {
                tracing::error!(server_id = %self.server_id, "Failed to lock monitor jobs");
                None
            }
        };
        if let Some(previous) = previous {
            let _ = previous.stop.send(true);
        }
        tracing::debug!(server_id = %self.server_id, job = ?job, period = ?period, "Monitor job scheduled");
    }

    /// Stops the job in `job`'s slot. Returns whether one was scheduled.
    pub fn cancel(&self, job: MonitorJob) -> bool {
        let slot = match self.jobs.lock() {
            Ok(mut jobs) => jobs.remove(&job),
            Err(_) => None,
        };
        match slot {
            Some(slot) => {
                let _ = slot.stop.send(true);
                tracing::debug!(server_id = %self.server_id, job = ?job, "Monitor job cancelled");
                true
            }
            None => false,
        }
    }

    /// Stops every job of this server.
    pub fn cancel_all(&self) {
        let slots: Vec<JobSlot> = match self.jobs.lock() {
            Ok(mut jobs) => jobs.drain().map(|(_, slot)| slot).collect(),
            Err(_) => Vec::new(),
        };
        for slot in slots {
            let _ = slot.stop.send(true);
        }
    }

    /// Whether a live job occupies the slot.
    pub fn is_scheduled(&self, job: MonitorJob) -> bool {
        self.jobs
            .lock()
            .map(|jobs| jobs.get(&job).is_some_and(|slot| !slot.handle.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for ServerMonitor {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_job_ticks_until_cancelled() {
        let monitor = ServerMonitor::new(ServerId(1));
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = ticks.clone();
        monitor.schedule(MonitorJob::StatsPoll, Duration::from_secs(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(monitor.is_scheduled(MonitorJob::StatsPoll));

        time::sleep(Duration::from_secs(16)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        assert!(monitor.cancel(MonitorJob::StatsPoll));
        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(!monitor.is_scheduled(MonitorJob::StatsPoll));
        assert!(!monitor.cancel(MonitorJob::StatsPoll));
    }
}
