/*!
 # Game Runner

 A Rust library for supervising long-running game server processes.

 ## Overview

 Game Runner provides functionality to:
 - Start, stop, kill and restart game server processes
 - Capture console output into a bounded virtual terminal
 - Detect crashes and restart crashed servers a bounded number of times
 - Take compressed, pruned backups and swap server executables with rollback
 - Collect host and per-server stats, including game protocol status pings
 - Schedule lifecycle actions with cron expressions or simple interval rules
 - Serialize every lifecycle intent through a persisted command queue
 - Push live updates to connected viewers through a publish/subscribe hub

 ## Basic Usage

 ```no_run
 use game_runner::{CommandAction, GameRunner, Issuer, Result, ServerId};

 #[tokio::main]
 async fn main() -> Result<()> {
     // Create a runner from a config file
     let runner = GameRunner::from_config_file("runner.json")?;

     // Spawn the command queue, realtime loop, scheduler and housekeeping
     runner.start().await?;

     // Ask for a start through the command queue
     runner
         .enqueue(ServerId(1), Issuer::User(7), CommandAction::StartServer)
         .await?;

     // Or drive the supervisor directly
     let supervisor = runner.supervisor(ServerId(1))?;
     println!("running: {}", supervisor.is_running().await);

     runner.shutdown().await?;
     Ok(())
 }
 ```

 ## Features

 - **Process Supervision**: Graceful stop with kill escalation, crash recovery
 - **Console Capture**: ANSI-stripped, HTML-escaped lines published as they arrive
 - **Scheduling**: Cron and interval triggers, one-time tasks
 - **Configuration**: Configure servers through JSON or YAML files
 - **Async Support**: Full async/await support on Tokio
*/

pub mod broadcast;
pub mod config;
pub mod error;
pub mod server;
pub mod stats;
pub mod store;
pub mod tasks;

pub use broadcast::{Broadcaster, Hub, Subscriber, Topic};
pub use config::{RunnerConfig, ServerConfig, Settings};
pub use error::{Error, Result, StartupError};
pub use server::{
    Issuer, ServerId, ServerRegistry, ServerStatus, ServerSupervisor, SupervisorContext,
    SupervisorSnapshot,
};
pub use store::{MemoryStore, Store};
pub use tasks::{CommandAction, CommandQueueEntry, JobSpec, ScheduledTask, TaskId, Trigger};

use server::{Downloader, HttpDownloader, ServerLifecycleManager};
use stats::StatsCollector;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tasks::{CommandQueue, MaintenanceHook, NoopMaintenance, TaskManager, TaskScheduler};

/// Supervise a fleet of game servers
///
/// This struct is the main entry point. It wires supervisors to the store,
/// broadcaster and downloader, and owns the background loops.
/// All public methods are instrumented with `tracing` spans.
pub struct GameRunner {
    /// Supervisors keyed by server id
    registry: Arc<ServerRegistry>,
    /// Background loops and the scheduler
    tasks: TaskManager,
}

impl GameRunner {
    /// Create a new runner from a configuration file path
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(path), fields(config_path = ?path.as_ref()))]
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        tracing::info!("Loading configuration from file");
        let config = RunnerConfig::from_file(path)?;
        Self::new(config)
    }

    /// Create a new runner from a JSON configuration string
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(config))]
    pub fn from_config_str(config: &str) -> Result<Self> {
        tracing::info!("Loading configuration from string");
        let config = RunnerConfig::parse_from_str(config)?;
        Self::new(config)
    }

    /// Create a new runner with an in-memory store, an in-process hub and
    /// an HTTP downloader
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(config), fields(num_servers = config.servers.len()))]
    pub fn new(config: RunnerConfig) -> Result<Self> {
        let store = Arc::new(MemoryStore::from_config(&config));
        Self::connect(
            config,
            store,
            Arc::new(Hub::default()),
            Arc::new(HttpDownloader::new()),
            Arc::new(NoopMaintenance),
        )
    }

    /// Create a new runner on top of caller-supplied collaborators
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip_all, fields(num_servers = config.servers.len()))]
    pub fn connect(
        config: RunnerConfig,
        store: Arc<dyn Store>,
        broadcaster: Arc<dyn Broadcaster>,
        downloader: Arc<dyn Downloader>,
        hook: Arc<dyn MaintenanceHook>,
    ) -> Result<Self> {
        crate::config::validate_config(&config)?;
        tracing::info!("Creating new GameRunner");

        let ctx = SupervisorContext {
            settings: Arc::new(config.settings.clone()),
            store,
            broadcaster,
            stats: Arc::new(StatsCollector::new()),
            downloader,
            lifecycle: Arc::new(ServerLifecycleManager::new()),
        };
        let registry = Arc::new(ServerRegistry::new(ctx));
        for server in config.servers {
            registry.register(server)?;
        }
        let tasks = TaskManager::new(registry.clone(), hook);

        Ok(Self { registry, tasks })
    }

    /// Start the background loops, load persisted schedules and start
    /// every server marked for automatic start after its delay
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        self.tasks.start().await?;

        for supervisor in self.registry.all() {
            let config = supervisor.config().await;
            if !config.auto_start {
                continue;
            }
            let delay = Duration::from_secs(config.auto_start_delay_secs);
            tracing::info!(server_id = %config.id, ?delay, "Scheduling automatic start");
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = supervisor.start(Issuer::System).await {
                    tracing::error!(server_id = %supervisor.id(), error = %e, "Automatic start failed");
                }
            });
        }

        tracing::info!("Game runner started");
        Ok(())
    }

    /// Stop the background loops and every running server
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        self.tasks.shutdown().await;
        self.stop_all_servers().await
    }

    /// Get the supervisor of a server
    pub fn supervisor(&self, id: ServerId) -> Result<Arc<ServerSupervisor>> {
        self.registry.get(id)
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        self.tasks.scheduler()
    }

    pub fn command_queue(&self) -> &Arc<CommandQueue> {
        self.tasks.queue()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.registry.context().store.clone()
    }

    pub fn broadcaster(&self) -> Arc<dyn Broadcaster> {
        self.registry.context().broadcaster.clone()
    }

    /// Queue a lifecycle intent for a server
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(server_id = %target_id))]
    pub async fn enqueue(
        &self,
        target_id: ServerId,
        issuer: Issuer,
        action: CommandAction,
    ) -> Result<CommandQueueEntry> {
        self.registry.get(target_id)?;
        self.tasks.queue().enqueue(target_id, issuer, action).await
    }

    /// Persist and register a scheduled task
    pub async fn schedule_job(&self, spec: JobSpec) -> Result<ScheduledTask> {
        self.registry.get(spec.target_id)?;
        self.scheduler().schedule_job(spec).await
    }

    /// Unregister and delete a scheduled task
    pub async fn remove_job(&self, id: TaskId) -> Result<()> {
        self.scheduler().remove_job(id).await
    }

    /// Replace a scheduled task
    pub async fn update_job(&self, id: TaskId, spec: JobSpec) -> Result<ScheduledTask> {
        self.scheduler().update_job(id, spec).await
    }

    /// Snapshot of every supervised server, ordered by id
    pub async fn server_statuses(&self) -> Vec<SupervisorSnapshot> {
        let mut statuses = Vec::new();
        for supervisor in self.registry.all() {
            statuses.push(supervisor.snapshot().await);
        }
        statuses
    }

    /// Stop every running server
    ///
    /// Collects all errors. A single failure is returned as is, several are
    /// merged into one.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub async fn stop_all_servers(&self) -> Result<()> {
        tracing::info!("Stopping all servers");
        let mut errors = Vec::new();

        for supervisor in self.registry.all() {
            if !supervisor.is_running().await {
                continue;
            }
            if let Err(e) = supervisor.stop(Issuer::System).await {
                tracing::error!(server_id = %supervisor.id(), error = %e, "Failed to stop server");
                errors.push((supervisor.id(), e));
            }
        }

        match errors.len() {
            0 => {
                tracing::info!("All servers stopped successfully");
                Ok(())
            }
            1 => Err(errors.remove(0).1),
            _ => {
                let error_msg = errors
                    .iter()
                    .map(|(id, e)| format!("{}: {}", id, e))
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(Error::Other(format!(
                    "Multiple servers failed to stop: {}",
                    error_msg
                )))
            }
        }
    }
}
