//! Background work shared by every server.
//!
//! * `scheduler` - Cron and interval triggers that enqueue lifecycle intents
//! * `queue` - The persisted command queue and its drain loop
//! * `realtime` - Periodic push of live stats to subscribers
//! * `maintenance` - Host stats recording, log pruning and cache refresh
//!
//! [`TaskManager`] owns the long-running loops and stops them together.

pub mod maintenance;
pub mod queue;
pub mod realtime;
pub mod scheduler;
pub mod types;

pub use maintenance::{MaintenanceHook, NoopMaintenance, prune_old_logs, record_host_stats};
pub use queue::CommandQueue;
pub use realtime::{RealtimeLoop, ServerDetails, TickReport};
pub use scheduler::{TaskScheduler, cron_expression, schedule_for};
pub use types::{
    CommandAction, CommandId, CommandQueueEntry, IntervalSpec, IntervalUnit, JobEvent, JobSpec,
    NewCommand, ScheduledTask, TaskId, Trigger,
};

use crate::config::Settings;
use crate::error::Result;
use crate::server::ServerRegistry;
use crate::stats::StatsCollector;
use crate::store::Store;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Starts and stops the runner-wide loops.
pub struct TaskManager {
    settings: Arc<Settings>,
    store: Arc<dyn Store>,
    stats: Arc<StatsCollector>,
    registry: Arc<ServerRegistry>,
    scheduler: Arc<TaskScheduler>,
    queue: Arc<CommandQueue>,
    realtime: Arc<RealtimeLoop>,
    hook: Arc<dyn MaintenanceHook>,
    stop: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskManager {
    pub fn new(registry: Arc<ServerRegistry>, hook: Arc<dyn MaintenanceHook>) -> Self {
        let ctx = registry.context().clone();
        let (stop, _) = watch::channel(false);
        Self {
            scheduler: TaskScheduler::new(ctx.store.clone()),
            queue: Arc::new(CommandQueue::new(ctx.store.clone(), registry.clone())),
            realtime: Arc::new(RealtimeLoop::new(
                registry.clone(),
                ctx.broadcaster.clone(),
                ctx.stats.clone(),
            )),
            settings: ctx.settings,
            store: ctx.store,
            stats: ctx.stats,
            registry,
            hook,
            stop,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn realtime(&self) -> &Arc<RealtimeLoop> {
        &self.realtime
    }

    /// Loads persisted schedules and spawns every loop.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        self.stop.send_replace(false);
        self.scheduler.load_from_store().await?;

        let mut handles = Vec::new();

        let queue = self.queue.clone();
        let poll = self.settings.command_poll_interval();
        let stop_rx = self.stop.subscribe();
        handles.push(tokio::spawn(async move { queue.run(poll, stop_rx).await }));

        let realtime = self.realtime.clone();
        let period = self.settings.realtime_interval();
        let stop_rx = self.stop.subscribe();
        handles.push(tokio::spawn(async move { realtime.run(period, stop_rx).await }));

        let store = self.store.clone();
        let stats = self.stats.clone();
        let max_age = self.settings.history_max_age();
        handles.push(self.spawn_periodic(
            "host_stats",
            self.settings.stats_update_frequency(),
            move || {
                let store = store.clone();
                let stats = stats.clone();
                async move { record_host_stats(store.as_ref(), &stats, max_age).await.map(|_| ()) }
            },
        ));

        let registry = self.registry.clone();
        let settings = self.settings.clone();
        handles.push(self.spawn_periodic("log_prune", self.settings.log_prune_interval(), move || {
            let registry = registry.clone();
            let settings = settings.clone();
            async move { prune_all_logs(&registry, &settings).await }
        }));

        let hook = self.hook.clone();
        handles.push(self.spawn_periodic(
            "cache_refresh",
            self.settings.cache_refresh_interval(),
            move || {
                let hook = hook.clone();
                async move { hook.refresh_cache().await }
            },
        ));

        match self.handles.lock() {
            Ok(mut slot) => slot.extend(handles),
            Err(_) => tracing::error!("Failed to lock task handles"),
        }
        tracing::info!("Background tasks started");
        Ok(())
    }

    /// Stops every loop and trigger and waits for the loops to finish.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        self.scheduler.shutdown();

        let handles: Vec<JoinHandle<()>> = match self.handles.lock() {
            Ok(mut slot) => slot.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Background tasks stopped");
    }

    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, job: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = job().await {
                            tracing::error!(task = name, error = %e, "Periodic task failed");
                        }
                    }
                }
            }
            tracing::debug!(task = name, "Periodic task stopped");
        })
    }
}

async fn prune_all_logs(registry: &ServerRegistry, settings: &Settings) -> Result<()> {
    let mut dirs: Vec<PathBuf> = settings.log_dir.iter().cloned().collect();
    for supervisor in registry.all() {
        if let Some(dir) = supervisor.config().await.log_path {
            dirs.push(dir);
        }
    }

    let retention = settings.log_retention();
    let deleted = tokio::task::spawn_blocking(move || {
        let mut deleted = 0;
        for dir in dirs {
            match prune_old_logs(&dir, retention) {
                Ok(n) => deleted += n,
                Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "Failed to prune logs"),
            }
        }
        deleted
    })
    .await
    .map_err(|e| crate::error::Error::Other(format!("Log pruning panicked: {}", e)))?;

    if deleted > 0 {
        tracing::info!(deleted, "Pruned old log files");
    }
    Ok(())
}
