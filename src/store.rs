//! Persistence collaborator.
//!
//! The core keeps no durable state of its own. Server settings, flags,
//! stats history, scheduled tasks and the command queue all live behind
//! the [`Store`] trait so the embedding application can back them with
//! its own database. [`MemoryStore`] keeps everything in process memory.

use crate::config::{RunnerConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::server::ServerId;
use crate::stats::{HostStats, ServerStats};
use crate::tasks::{CommandId, CommandQueueEntry, JobSpec, NewCommand, ScheduledTask, TaskId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// Durable state consumed by supervisors, the scheduler and the command queue.
#[async_trait]
pub trait Store: Send + Sync {
    /// Current settings of a server.
    async fn server_config(&self, id: ServerId) -> Result<ServerConfig>;

    /// Every known server.
    async fn list_servers(&self) -> Result<Vec<ServerConfig>>;

    async fn set_crash_flag(&self, id: ServerId, crashed: bool) -> Result<()>;

    async fn set_updating_flag(&self, id: ServerId, updating: bool) -> Result<()>;

    async fn is_updating(&self, id: ServerId) -> Result<bool>;

    async fn insert_server_stats(&self, stats: ServerStats) -> Result<()>;

    async fn insert_host_stats(&self, stats: HostStats) -> Result<()>;

    async fn latest_host_stats(&self) -> Result<Option<HostStats>>;

    /// Deletes host and server stats recorded more than `max_age` ago.
    /// Returns the number of deleted rows.
    async fn prune_stats_older_than(&self, max_age: chrono::Duration) -> Result<usize>;

    async fn enabled_schedules(&self) -> Result<Vec<ScheduledTask>>;

    async fn get_schedule(&self, id: TaskId) -> Result<Option<ScheduledTask>>;

    async fn create_schedule(&self, spec: JobSpec) -> Result<ScheduledTask>;

    async fn update_schedule(&self, task: &ScheduledTask) -> Result<()>;

    async fn delete_schedule(&self, id: TaskId) -> Result<()>;

    async fn enqueue_command(&self, command: NewCommand) -> Result<CommandQueueEntry>;

    /// Entries not yet completed, in enqueue order.
    async fn pending_commands(&self) -> Result<Vec<CommandQueueEntry>>;

    async fn mark_command_complete(&self, id: CommandId) -> Result<()>;

    async fn command(&self, id: CommandId) -> Result<Option<CommandQueueEntry>>;

    /// Appends a human-readable entry to a server's audit log.
    async fn add_audit_entry(&self, server_id: ServerId, message: &str) -> Result<()>;
}

/// One audit log line.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub server_id: ServerId,
    pub message: String,
    pub created: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    servers: BTreeMap<ServerId, ServerConfig>,
    crashed: HashSet<ServerId>,
    updating: HashSet<ServerId>,
    server_stats: Vec<ServerStats>,
    host_stats: Vec<HostStats>,
    schedules: BTreeMap<TaskId, ScheduledTask>,
    next_schedule_id: TaskId,
    commands: BTreeMap<CommandId, CommandQueueEntry>,
    next_command_id: CommandId,
    audit: Vec<AuditEntry>,
}

/// In-memory [`Store`].
///
/// # Examples
///
/// ```
/// use game_runner::config::ServerConfig;
/// use game_runner::store::{MemoryStore, Store};
/// use game_runner::server::ServerId;
///
/// # tokio_test_block_on(async {
/// let store = MemoryStore::new();
/// store.insert_server(ServerConfig::new(1, "lobby", "/srv/lobby", "server.jar", "java -jar server.jar"));
/// assert_eq!(store.server_config(ServerId(1)).await.unwrap().name, "lobby");
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding every server of a configuration.
    pub fn from_config(config: &RunnerConfig) -> Self {
        let store = Self::new();
        for server in &config.servers {
            store.insert_server(server.clone());
        }
        store
    }

    /// Adds or replaces a server.
    pub fn insert_server(&self, config: ServerConfig) {
        match self.state.lock() {
            Ok(mut state) => {
                state.servers.insert(config.id, config);
            }
            Err(_) => tracing::error!("Failed to lock memory store"),
        }
    }

    /// Whether the server is flagged as crashed.
    pub fn is_crashed(&self, id: ServerId) -> bool {
        self.state
            .lock()
            .map(|state| state.crashed.contains(&id))
            .unwrap_or(false)
    }

    /// Recorded stats of one server, oldest first.
    pub fn server_stats_history(&self, id: ServerId) -> Vec<ServerStats> {
        self.state
            .lock()
            .map(|state| {
                state
                    .server_stats
                    .iter()
                    .filter(|s| s.server_id == id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of recorded host snapshots.
    pub fn host_stats_count(&self) -> usize {
        self.state.lock().map(|state| state.host_stats.len()).unwrap_or(0)
    }

    /// Audit entries of one server, oldest first.
    pub fn audit_log(&self, id: ServerId) -> Vec<AuditEntry> {
        self.state
            .lock()
            .map(|state| state.audit.iter().filter(|e| e.server_id == id).cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Store("Failed to lock memory store".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn server_config(&self, id: ServerId) -> Result<ServerConfig> {
        self.lock()?
            .servers
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::ServerNotFound(id.to_string()))
    }

    async fn list_servers(&self) -> Result<Vec<ServerConfig>> {
        Ok(self.lock()?.servers.values().cloned().collect())
    }

    async fn set_crash_flag(&self, id: ServerId, crashed: bool) -> Result<()> {
        let mut state = self.lock()?;
        if crashed {
            state.crashed.insert(id);
        } else {
            state.crashed.remove(&id);
        }
        Ok(())
    }

    async fn set_updating_flag(&self, id: ServerId, updating: bool) -> Result<()> {
        let mut state = self.lock()?;
        if updating {
            state.updating.insert(id);
        } else {
            state.updating.remove(&id);
        }
        Ok(())
    }

    async fn is_updating(&self, id: ServerId) -> Result<bool> {
        Ok(self.lock()?.updating.contains(&id))
    }

    async fn insert_server_stats(&self, stats: ServerStats) -> Result<()> {
        self.lock()?.server_stats.push(stats);
        Ok(())
    }

    async fn insert_host_stats(&self, stats: HostStats) -> Result<()> {
        self.lock()?.host_stats.push(stats);
        Ok(())
    }

    async fn latest_host_stats(&self) -> Result<Option<HostStats>> {
        Ok(self.lock()?.host_stats.last().cloned())
    }

    async fn prune_stats_older_than(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let mut state = self.lock()?;
        let before = state.host_stats.len() + state.server_stats.len();
        state.host_stats.retain(|s| s.recorded_at >= cutoff);
        state.server_stats.retain(|s| s.recorded_at >= cutoff);
        Ok(before - state.host_stats.len() - state.server_stats.len())
    }

    async fn enabled_schedules(&self) -> Result<Vec<ScheduledTask>> {
        Ok(self
            .lock()?
            .schedules
            .values()
            .filter(|task| task.enabled)
            .cloned()
            .collect())
    }

    async fn get_schedule(&self, id: TaskId) -> Result<Option<ScheduledTask>> {
        Ok(self.lock()?.schedules.get(&id).cloned())
    }

    async fn create_schedule(&self, spec: JobSpec) -> Result<ScheduledTask> {
        let mut state = self.lock()?;
        state.next_schedule_id += 1;
        let task = ScheduledTask::from_spec(state.next_schedule_id, spec);
        state.schedules.insert(task.id, task.clone());
        Ok(task)
    }

    async fn update_schedule(&self, task: &ScheduledTask) -> Result<()> {
        let mut state = self.lock()?;
        match state.schedules.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(Error::Store(format!("Schedule {} does not exist", task.id))),
        }
    }

    async fn delete_schedule(&self, id: TaskId) -> Result<()> {
        self.lock()?.schedules.remove(&id);
        Ok(())
    }

    async fn enqueue_command(&self, command: NewCommand) -> Result<CommandQueueEntry> {
        let mut state = self.lock()?;
        state.next_command_id += 1;
        let entry = CommandQueueEntry {
            id: state.next_command_id,
            target_id: command.target_id,
            issuer: command.issuer,
            action: command.action,
            enqueued_at: Utc::now(),
            completed: false,
        };
        state.commands.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn pending_commands(&self) -> Result<Vec<CommandQueueEntry>> {
        Ok(self
            .lock()?
            .commands
            .values()
            .filter(|entry| !entry.completed)
            .cloned()
            .collect())
    }

    async fn mark_command_complete(&self, id: CommandId) -> Result<()> {
        let mut state = self.lock()?;
        match state.commands.get_mut(&id) {
            Some(entry) => {
                entry.completed = true;
                Ok(())
            }
            None => Err(Error::Store(format!("Command {} does not exist", id))),
        }
    }

    async fn command(&self, id: CommandId) -> Result<Option<CommandQueueEntry>> {
        Ok(self.lock()?.commands.get(&id).cloned())
    }

    async fn add_audit_entry(&self, server_id: ServerId, message: &str) -> Result<()> {
        self.lock()?.audit.push(AuditEntry {
            server_id,
            message: message.to_string(),
            created: Utc::now(),
        });
        Ok(())
    }
}
