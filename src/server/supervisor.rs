use crate::broadcast::{Broadcaster, Topic, UserId};
use crate::config::{ServerConfig, ServerType, Settings};
use crate::error::{Error, Result, StartupError};
use crate::server::backup::{self, BackupArchive, BackupJob, BackupProgress, BackupTracker};
use crate::server::lifecycle::{ServerEvent, ServerLifecycleEvent, ServerLifecycleManager};
use crate::server::monitor::{MonitorJob, ServerMonitor};
use crate::server::output::{OutputStreamBuffer, SharedTerminal, VirtualTerminal};
use crate::server::process::{self, ProcessHandle};
use crate::server::update::{self, Downloader};
use crate::server::{ServerId, ServerStatus};
use crate::stats::{ServerProbe, ServerStats, StatsCollector};
use crate::store::Store;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Crash restarts attempted before giving up.
pub const MAX_CRASH_RESTARTS: u32 = 3;

const IMMEDIATE_EXIT_CHECK: Duration = Duration::from_millis(200);

/// Who asked for a lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Issuer {
    /// Scheduler, crash recovery or the runner itself.
    System,
    /// A user of the web layer.
    User(UserId),
}

/// Shared collaborators handed to every supervisor.
#[derive(Clone)]
pub struct SupervisorContext {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn Store>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub stats: Arc<StatsCollector>,
    pub downloader: Arc<dyn Downloader>,
    pub lifecycle: Arc<ServerLifecycleManager>,
}

/// Outcome of one crash check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashCheck {
    /// The process is running.
    Alive,
    /// Nothing to check: the server was never started or was stopped.
    NotStarted,
    /// The process exited with code 0. The watcher is cancelled.
    CleanExit,
    /// The server crashed and was started again.
    Restarted { attempt: u32 },
    /// The server crashed and starting it again failed.
    RestartFailed,
    /// The restart budget is spent. No further starts are attempted.
    GaveUp,
}

/// Point-in-time view of a supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSnapshot {
    pub id: ServerId,
    pub name: String,
    pub status: ServerStatus,
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub is_crashed: bool,
    pub is_backing_up: bool,
    pub is_updating: bool,
    pub crash_detection: bool,
    pub last_exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartReason {
    Manual,
    CrashRecovery,
}

struct SupervisorState {
    config: ServerConfig,
    process: Option<ProcessHandle>,
    restart_count: u32,
    is_crashed: bool,
    last_exit_code: Option<i32>,
    status: ServerStatus,
}

impl SupervisorState {
    fn is_running(&mut self) -> bool {
        self.process.as_mut().is_some_and(|p| p.is_alive())
    }
}

/// Clears an operation flag when dropped.
struct FlagGuard(Arc<AtomicBool>);

impl FlagGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for FlagGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the full lifecycle of one game server process.
///
/// Every mutation of the process handle, restart counter and crash flag
/// happens under one per-server lock. Backup and update are guarded by
/// their own atomic flags so a second request is refused instead of
/// queued.
pub struct ServerSupervisor {
    id: ServerId,
    state: Mutex<SupervisorState>,
    is_backing_up: Arc<AtomicBool>,
    is_updating: Arc<AtomicBool>,
    backup_tracker: Arc<BackupTracker>,
    backup_progress: StdMutex<BackupProgress>,
    last_stats: StdMutex<Option<ServerStats>>,
    terminal: SharedTerminal,
    monitor: ServerMonitor,
    ctx: SupervisorContext,
}

impl ServerSupervisor {
    pub fn new(config: ServerConfig, ctx: SupervisorContext) -> Arc<Self> {
        let id = config.id;
        let terminal = Arc::new(StdMutex::new(VirtualTerminal::new(
            ctx.settings.virtual_terminal_lines,
        )));
        Arc::new(Self {
            id,
            state: Mutex::new(SupervisorState {
                config,
                process: None,
                restart_count: 0,
                is_crashed: false,
                last_exit_code: None,
                status: ServerStatus::Stopped,
            }),
            is_backing_up: Arc::new(AtomicBool::new(false)),
            is_updating: Arc::new(AtomicBool::new(false)),
            backup_tracker: Arc::new(BackupTracker::new()),
            backup_progress: StdMutex::new(BackupProgress::default()),
            last_stats: StdMutex::new(None),
            terminal,
            monitor: ServerMonitor::new(id),
            ctx,
        })
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    /// Starts the server process.
    ///
    /// Settings are reloaded from the store first. A successful manual
    /// start clears the crash state and the restart counter.
    #[tracing::instrument(skip(self), fields(server_id = %self.id))]
    pub async fn start(self: &Arc<Self>, issuer: Issuer) -> Result<()> {
        let mut state = self.state.lock().await;
        match self.ctx.store.server_config(self.id).await {
            Ok(config) => state.config = config,
            Err(e) => tracing::warn!(error = %e, "Using cached server settings"),
        }
        self.start_locked(&mut state, issuer, StartReason::Manual).await
    }

    async fn start_locked(
        self: &Arc<Self>,
        state: &mut SupervisorState,
        issuer: Issuer,
        reason: StartReason,
    ) -> Result<()> {
        if let Err(e) = self.check_startable(state).await {
            tracing::warn!(error = %e, "Server refused to start");
            match &e {
                StartupError::LicenseNotAccepted(_) => {
                    self.notify_issuer(issuer, "send_eula_bootbox", json!({ "id": self.id }));
                }
                other => {
                    self.notify_issuer(issuer, "send_start_error", json!({ "error": other.to_string() }));
                }
            }
            return Err(e.into());
        }

        tracing::info!(name = %state.config.name, ?reason, "Starting server");
        state.status = ServerStatus::Starting;

        let (mut handle, output) = match ProcessHandle::spawn(&state.config) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn server");
                state.status = match reason {
                    StartReason::Manual => ServerStatus::Stopped,
                    StartReason::CrashRecovery => ServerStatus::Crashed,
                };
                self.notify_issuer(issuer, "send_start_error", json!({ "error": e.to_string() }));
                return Err(e);
            }
        };

        if let Some(stdout) = output.stdout {
            let buffer = OutputStreamBuffer::new(self.id, self.terminal.clone(), self.ctx.broadcaster.clone());
            tokio::spawn(buffer.pump(stdout));
        }
        if let Some(stderr) = output.stderr {
            let buffer = OutputStreamBuffer::new(self.id, self.terminal.clone(), self.ctx.broadcaster.clone());
            tokio::spawn(buffer.pump(stderr));
        }

        tokio::time::sleep(IMMEDIATE_EXIT_CHECK).await;
        if let Ok(Some(status)) = handle.try_exit() {
            tracing::warn!(
                exit_code = ?status.code(),
                command = ?handle.command(),
                "Server exited right after launch, check its launch command"
            );
        }

        tracing::info!(pid = handle.pid(), "Server started");
        state.process = Some(handle);
        state.status = ServerStatus::Running;

        if reason == StartReason::Manual {
            state.restart_count = 0;
            state.is_crashed = false;
            if let Err(e) = self.ctx.store.set_crash_flag(self.id, false).await {
                tracing::warn!(error = %e, "Failed to clear crash flag");
            }
        }

        if state.config.crash_detection {
            self.watch_for_crashes();
        }
        let weak = Arc::downgrade(self);
        self.monitor.schedule(
            MonitorJob::StatsPoll,
            self.ctx.settings.stats_poll_interval(),
            move || stats_poll_tick(weak.clone()),
        );

        let event = match reason {
            StartReason::Manual => ServerLifecycleEvent::Started,
            StartReason::CrashRecovery => ServerLifecycleEvent::Restarted,
        };
        self.record_event(&state.config.name, event, None);
        self.ctx
            .broadcaster
            .publish_to_server_users(self.id, "send_start_reload", json!({ "id": self.id }));
        self.spawn_record_stats();

        Ok(())
    }

    async fn check_startable(&self, state: &mut SupervisorState) -> std::result::Result<(), StartupError> {
        if state.process.is_some() {
            if state.is_running() {
                return Err(StartupError::AlreadyRunning);
            }
            state.process = None;
        }

        let updating_in_store = self.ctx.store.is_updating(self.id).await.unwrap_or(false);
        if self.is_updating.load(Ordering::SeqCst) || updating_in_store {
            return Err(StartupError::UpdateInProgress);
        }

        let config = &state.config;
        if !config.path.is_dir() {
            return Err(StartupError::PathMissing(config.path.clone()));
        }
        if tempfile::NamedTempFile::new_in(&config.path).is_err() {
            return Err(StartupError::PathNotWritable(config.path.clone()));
        }
        let executable = config.executable_path();
        if !executable.exists() {
            return Err(StartupError::ExecutableMissing(executable));
        }
        if config.server_type == ServerType::MinecraftJava && !process::license_accepted(&config.path) {
            return Err(StartupError::LicenseNotAccepted(config.path.join(process::LICENSE_FILE)));
        }

        Ok(())
    }

    /// Stops the server, escalating to a kill when it does not exit in time.
    ///
    /// Stopping a server that is not running only resets its crash state.
    #[tracing::instrument(skip(self), fields(server_id = %self.id))]
    pub async fn stop(self: &Arc<Self>, issuer: Issuer) -> Result<()> {
        tracing::debug!(?issuer, "Stop requested");
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state).await
    }

    async fn stop_locked(self: &Arc<Self>, state: &mut SupervisorState) -> Result<()> {
        self.monitor.cancel(MonitorJob::CrashWatch);

        let Some(mut handle) = state.process.take() else {
            tracing::debug!("Server is not running");
            self.reset_after_stop(state, None).await;
            return Ok(());
        };

        state.status = ServerStatus::Stopping;
        tracing::info!(name = %state.config.name, pid = handle.pid(), "Stopping server");

        let graceful = match &state.config.stop_command {
            Some(command) => handle.write_line(command).await,
            None => handle.terminate(),
        };
        if let Err(e) = graceful {
            tracing::warn!(error = %e, "Graceful stop failed, sending terminate signal");
            if let Err(e) = handle.terminate() {
                tracing::warn!(error = %e, "Terminate signal failed");
            }
        }

        let mut exit = None;
        for _ in 0..self.ctx.settings.stop_max_polls {
            if let Ok(Some(status)) = handle.try_exit() {
                exit = Some(status);
                break;
            }
            tokio::time::sleep(self.ctx.settings.stop_poll_interval()).await;
        }
        if exit.is_none() {
            exit = handle.try_exit().ok().flatten();
        }

        let exit_code = match exit {
            Some(status) => status.code(),
            None => {
                tracing::warn!(pid = handle.pid(), "Server did not stop in time, killing it");
                if let Err(e) = handle.kill_tree() {
                    state.process = Some(handle);
                    state.status = ServerStatus::Running;
                    return Err(e);
                }
                handle.wait().await.ok().and_then(|status| status.code())
            }
        };

        self.reset_after_stop(state, exit_code).await;
        self.record_event(&state.config.name, ServerLifecycleEvent::Stopped, None);
        self.ctx
            .broadcaster
            .publish_to_server_users(self.id, "send_start_reload", json!({ "id": self.id }));
        self.spawn_record_stats();
        tracing::info!("Server stopped");
        Ok(())
    }

    async fn reset_after_stop(&self, state: &mut SupervisorState, exit_code: Option<i32>) {
        self.monitor.cancel(MonitorJob::StatsPoll);
        state.process = None;
        state.status = ServerStatus::Stopped;
        state.restart_count = 0;
        if exit_code.is_some() {
            state.last_exit_code = exit_code;
        }
        if state.is_crashed {
            state.is_crashed = false;
            if let Err(e) = self.ctx.store.set_crash_flag(self.id, false).await {
                tracing::warn!(error = %e, "Failed to clear crash flag");
            }
        }
    }

    /// Force-kills the server and every process it spawned, children first.
    #[tracing::instrument(skip(self), fields(server_id = %self.id))]
    pub async fn kill(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.monitor.cancel(MonitorJob::CrashWatch);

        let Some(mut handle) = state.process.take() else {
            return Err(Error::NotRunning);
        };

        tracing::warn!(pid = handle.pid(), "Killing server process tree");
        if let Err(e) = handle.kill_tree() {
            state.process = Some(handle);
            return Err(e);
        }
        let exit_code = handle.wait().await.ok().and_then(|status| status.code());

        self.reset_after_stop(&mut state, exit_code).await;
        self.record_event(&state.config.name, ServerLifecycleEvent::Killed, None);
        self.ctx
            .broadcaster
            .publish_to_server_users(self.id, "send_start_reload", json!({ "id": self.id }));
        Ok(())
    }

    /// Stops the server if it runs, waits the settle delay, then starts it.
    #[tracing::instrument(skip(self), fields(server_id = %self.id))]
    pub async fn restart(self: &Arc<Self>, issuer: Issuer) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_running() {
            self.stop_locked(&mut state).await?;
            tokio::time::sleep(self.ctx.settings.restart_settle()).await;
        }
        self.start_locked(&mut state, issuer, StartReason::Manual).await
    }

    /// Checks the process once and applies the bounded restart policy.
    #[tracing::instrument(skip(self), fields(server_id = %self.id))]
    pub async fn detect_crash(self: &Arc<Self>) -> Result<CrashCheck> {
        let mut state = self.state.lock().await;

        let exit = match state.process.as_mut() {
            Some(handle) => match handle.try_exit()? {
                None => return Ok(CrashCheck::Alive),
                exited => exited,
            },
            None => None,
        };

        match exit {
            Some(status) => {
                state.process = None;
                state.last_exit_code = status.code();
                if status.success() {
                    tracing::info!("Server exited cleanly");
                    self.monitor.cancel(MonitorJob::CrashWatch);
                    self.reset_after_stop(&mut state, status.code()).await;
                    self.record_event(
                        &state.config.name,
                        ServerLifecycleEvent::Stopped,
                        Some("clean exit".to_string()),
                    );
                    return Ok(CrashCheck::CleanExit);
                }
            }
            // A failed crash restart leaves no process behind, so keep retrying.
            None if state.is_crashed => {}
            None => return Ok(CrashCheck::NotStarted),
        }

        if !state.is_crashed {
            state.is_crashed = true;
            if let Err(e) = self.ctx.store.set_crash_flag(self.id, true).await {
                tracing::warn!(error = %e, "Failed to set crash flag");
            }
        }
        state.status = ServerStatus::Crashed;
        self.monitor.cancel(MonitorJob::StatsPoll);

        if state.restart_count > MAX_CRASH_RESTARTS {
            tracing::error!(attempts = state.restart_count, "Server keeps crashing, giving up");
            self.monitor.cancel(MonitorJob::CrashWatch);
            self.record_event(&state.config.name, ServerLifecycleEvent::GaveUp, None);
            self.ctx.broadcaster.publish_to_server_users(
                self.id,
                "notification",
                json!({ "message": format!("{} crashed too many times and will not be restarted", state.config.name) }),
            );
            return Ok(CrashCheck::GaveUp);
        }

        // Every attempt counts, a restart that fails to launch included.
        state.restart_count += 1;
        let attempt = state.restart_count;
        tracing::warn!(exit_code = ?state.last_exit_code, attempt, "Server crashed, restarting");
        self.record_event(
            &state.config.name,
            ServerLifecycleEvent::Crashed,
            Some(format!("exit code {:?}", state.last_exit_code)),
        );

        match self.start_locked(&mut state, Issuer::System, StartReason::CrashRecovery).await {
            Ok(()) => Ok(CrashCheck::Restarted { attempt }),
            Err(e) => {
                tracing::error!(error = %e, "Crash restart failed");
                state.status = ServerStatus::Crashed;
                Ok(CrashCheck::RestartFailed)
            }
        }
    }

    /// Turns crash detection on or off, applying it to the running process.
    pub async fn set_crash_detection(self: &Arc<Self>, enabled: bool) {
        let mut state = self.state.lock().await;
        state.config.crash_detection = enabled;
        if enabled && state.is_running() {
            self.watch_for_crashes();
        } else {
            self.monitor.cancel(MonitorJob::CrashWatch);
        }
    }

    fn watch_for_crashes(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.monitor.schedule(
            MonitorJob::CrashWatch,
            self.ctx.settings.crash_check_interval(),
            move || crash_watch_tick(weak.clone()),
        );
    }

    /// Whether the crash watcher is active.
    pub fn is_watching_for_crashes(&self) -> bool {
        self.monitor.is_scheduled(MonitorJob::CrashWatch)
    }

    /// Writes a console command to the server.
    pub async fn send_command(&self, command: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.is_running() {
            return Err(Error::NotRunning);
        }
        tracing::debug!(server_id = %self.id, command = %command, "Sending console command");
        match state.process.as_mut() {
            Some(handle) => handle.write_line(command).await,
            None => Err(Error::NotRunning),
        }
    }

    /// Accepts the license on the user's behalf and starts the server.
    pub async fn accept_license(self: &Arc<Self>, issuer: Issuer) -> Result<()> {
        let path = self.state.lock().await.config.path.clone();
        process::accept_license(&path)?;
        tracing::info!(server_id = %self.id, "License accepted");
        self.start(issuer).await
    }

    /// Starts a backup in the background.
    ///
    /// Refused when no backup path is configured or a backup of this
    /// server is already running. The returned handle resolves to the
    /// archive path.
    #[tracing::instrument(skip(self), fields(server_id = %self.id))]
    pub async fn backup(self: &Arc<Self>) -> Result<JoinHandle<Result<PathBuf>>> {
        let (job, guard) = self.prepare_backup().await?;
        let supervisor = Arc::clone(self);
        Ok(tokio::spawn(async move { supervisor.run_backup(job, guard).await }))
    }

    async fn prepare_backup(&self) -> Result<(BackupJob, FlagGuard)> {
        let guard = FlagGuard::acquire(&self.is_backing_up)
            .ok_or_else(|| Error::Backup(format!("A backup of server {} is already running", self.id)))?;
        let config = self.state.lock().await.config.clone();
        let job = BackupJob::from_config(&config)?;
        Ok((job, guard))
    }

    async fn run_backup(self: Arc<Self>, job: BackupJob, _guard: FlagGuard) -> Result<PathBuf> {
        tracing::info!(server_id = %self.id, dest = %job.backup_dir.display(), "Starting backup");
        self.ctx
            .broadcaster
            .publish_to_server_users(self.id, "notification", json!({ "message": "Backup started" }));

        let reporter = {
            let supervisor = Arc::clone(&self);
            let period = self.ctx.settings.backup_progress_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    supervisor.publish_backup_progress();
                }
            })
        };

        let tracker = self.backup_tracker.clone();
        let result = tokio::task::spawn_blocking(move || job.run(&tracker))
            .await
            .map_err(|e| Error::Backup(format!("Backup worker panicked: {}", e)))
            .and_then(|r| r);

        reporter.abort();
        self.publish_backup_progress();

        match &result {
            Ok(archive) => {
                tracing::info!(server_id = %self.id, archive = %archive.display(), "Backup finished");
                self.audit(&format!("Backup created: {}", archive.display())).await;
                self.ctx
                    .broadcaster
                    .publish_to_server_users(self.id, "backup_reload", json!({ "id": self.id }));
            }
            Err(e) => {
                tracing::error!(server_id = %self.id, error = %e, "Backup failed");
                self.ctx.broadcaster.publish_to_server_users(
                    self.id,
                    "notification",
                    json!({ "message": format!("Backup failed: {}", e) }),
                );
            }
        }
        result
    }

    fn publish_backup_progress(&self) {
        let progress = self.backup_tracker.snapshot();
        if let Ok(mut last) = self.backup_progress.lock() {
            *last = progress;
        }
        self.ctx.broadcaster.publish_to_topic(
            Topic::ServerDetail(self.id),
            "backup_status",
            json!({
                "percent": progress.percent,
                "total_files": progress.total_files,
                "current_files": progress.current_files,
            }),
        );
    }

    /// Replaces the server executable with a freshly downloaded one.
    ///
    /// Runs in the background: backup, stop, save the old executable,
    /// download, then restart if the server was running. A failed download
    /// restores the old executable and is not retried.
    #[tracing::instrument(skip(self), fields(server_id = %self.id))]
    pub async fn update_executable(self: &Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        let guard = FlagGuard::acquire(&self.is_updating)
            .ok_or_else(|| Error::Update(format!("Server {} is already updating", self.id)))?;

        let config = self.state.lock().await.config.clone();
        let url = config
            .executable_update_url
            .clone()
            .ok_or_else(|| Error::Update(format!("Server {} has no executable update URL", self.id)))?;

        self.ctx.store.set_updating_flag(self.id, true).await?;
        self.publish_update_status(true);

        let supervisor = Arc::clone(self);
        Ok(tokio::spawn(async move {
            supervisor.run_update(config, url, guard).await
        }))
    }

    async fn run_update(self: Arc<Self>, config: ServerConfig, url: String, guard: FlagGuard) -> Result<()> {
        let was_running = self.is_running().await;

        self.wait_for_backup().await;
        match self.prepare_backup().await {
            Ok((job, backup_guard)) => {
                if let Err(e) = Arc::clone(&self).run_backup(job, backup_guard).await {
                    tracing::warn!(server_id = %self.id, error = %e, "Pre-update backup failed, updating anyway");
                }
            }
            Err(e) => tracing::warn!(server_id = %self.id, error = %e, "Skipping pre-update backup"),
        }

        if was_running {
            if let Err(e) = self.stop(Issuer::System).await {
                self.finish_update(guard).await;
                return Err(e);
            }
        }

        let outcome = match update::backup_executable(&config) {
            Ok(_) => {
                self.ctx
                    .downloader
                    .download(&url, &config.executable_path())
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            tracing::error!(server_id = %self.id, error = %e, "Executable update failed");
            if let Err(restore) = update::restore_executable(&config) {
                tracing::error!(server_id = %self.id, error = %restore, "Failed to restore previous executable");
            }
            self.finish_update(guard).await;
            self.ctx.broadcaster.publish_to_server_users(
                self.id,
                "notification",
                json!({ "message": format!("Executable update failed: {}", e) }),
            );
            self.audit(&format!("Executable update failed: {}", e)).await;
            if was_running {
                if let Err(start_err) = self.start(Issuer::System).await {
                    tracing::error!(server_id = %self.id, error = %start_err, "Failed to start server after failed update");
                }
            }
            return Err(e);
        }

        self.wait_for_backup().await;
        self.finish_update(guard).await;
        self.audit("Executable update finished").await;
        self.ctx.broadcaster.publish_to_server_users(
            self.id,
            "notification",
            json!({ "message": "Executable update finished" }),
        );
        tracing::info!(server_id = %self.id, "Executable updated");

        if was_running {
            self.start(Issuer::System).await?;
        }
        Ok(())
    }

    async fn wait_for_backup(&self) {
        while self.is_backing_up.load(Ordering::SeqCst) {
            tokio::time::sleep(self.ctx.settings.backup_progress_interval()).await;
        }
    }

    async fn finish_update(&self, guard: FlagGuard) {
        drop(guard);
        if let Err(e) = self.ctx.store.set_updating_flag(self.id, false).await {
            tracing::warn!(server_id = %self.id, error = %e, "Failed to clear updating flag");
        }
        self.publish_update_status(false);
    }

    fn publish_update_status(&self, updating: bool) {
        self.ctx.broadcaster.publish_to_server_users(
            self.id,
            "update_button_status",
            json!({ "server_id": self.id, "isUpdating": updating }),
        );
    }

    /// Whether the process is alive.
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_running()
    }

    pub async fn status(&self) -> ServerStatus {
        self.state.lock().await.status
    }

    pub async fn restart_count(&self) -> u32 {
        self.state.lock().await.restart_count
    }

    pub async fn is_crashed(&self) -> bool {
        self.state.lock().await.is_crashed
    }

    pub async fn pid(&self) -> Option<u32> {
        let mut state = self.state.lock().await;
        if state.is_running() {
            state.process.as_ref().map(|p| p.pid())
        } else {
            None
        }
    }

    pub async fn config(&self) -> ServerConfig {
        self.state.lock().await.config.clone()
    }

    pub fn is_backing_up(&self) -> bool {
        self.is_backing_up.load(Ordering::SeqCst)
    }

    pub fn is_updating(&self) -> bool {
        self.is_updating.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> SupervisorSnapshot {
        let mut state = self.state.lock().await;
        let running = state.is_running();
        let (pid, started_at) = match state.process.as_ref() {
            Some(p) if running => (Some(p.pid()), Some(p.started_at())),
            _ => (None, None),
        };
        SupervisorSnapshot {
            id: self.id,
            name: state.config.name.clone(),
            status: state.status,
            running,
            pid,
            started_at,
            restart_count: state.restart_count,
            is_crashed: state.is_crashed,
            is_backing_up: self.is_backing_up(),
            is_updating: self.is_updating(),
            crash_detection: state.config.crash_detection,
            last_exit_code: state.last_exit_code,
        }
    }

    /// Recent console lines, oldest first.
    pub fn terminal_lines(&self) -> Vec<String> {
        self.terminal.lock().map(|t| t.lines()).unwrap_or_default()
    }

    /// Last reported backup progress.
    pub fn backup_status(&self) -> BackupProgress {
        self.backup_progress.lock().map(|p| *p).unwrap_or_default()
    }

    /// Archives in the backup directory, oldest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupArchive>> {
        let config = self.config().await;
        let dir = config
            .backup_path
            .ok_or_else(|| Error::Backup(format!("Server {} has no backup path", self.id)))?;
        Ok(backup::list_backups(&dir)?)
    }

    /// Lifecycle events of this server, newest first.
    pub fn events(&self, limit: Option<usize>) -> Result<Vec<ServerEvent>> {
        self.ctx.lifecycle.get_server_events(self.id, limit)
    }

    /// Fresh stats snapshot, including a status ping when running.
    pub async fn live_stats(&self) -> ServerStats {
        let probe = {
            let mut state = self.state.lock().await;
            let running = state.is_running();
            let (pid, started_at) = match state.process.as_ref() {
                Some(p) if running => (Some(p.pid()), Some(p.started_at())),
                _ => (None, None),
            };
            ServerProbe::from_config(&state.config, pid, started_at)
        };
        let stats = self.ctx.stats.server_stats(&probe).await;
        if let Ok(mut last) = self.last_stats.lock() {
            *last = Some(stats.clone());
        }
        stats
    }

    /// Persists a stats snapshot and prunes history past its maximum age.
    pub async fn record_stats(&self) -> Result<()> {
        let stats = self.live_stats().await;
        self.ctx.store.insert_server_stats(stats).await?;
        self.ctx
            .store
            .prune_stats_older_than(self.ctx.settings.history_max_age())
            .await?;
        Ok(())
    }

    fn spawn_record_stats(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(stats_poll_tick(weak));
    }

    /// Player names from the most recent ping.
    pub fn players(&self) -> Vec<String> {
        self.last_stats
            .lock()
            .ok()
            .and_then(|last| last.as_ref().map(ServerStats::players))
            .unwrap_or_default()
    }

    fn record_event(&self, name: &str, event: ServerLifecycleEvent, details: Option<String>) {
        if let Err(e) = self
            .ctx
            .lifecycle
            .record_event(self.id, name.to_string(), event, details)
        {
            tracing::warn!(server_id = %self.id, error = %e, "Failed to record lifecycle event");
        }
    }

    fn notify_issuer(&self, issuer: Issuer, event: &str, payload: serde_json::Value) {
        if let Issuer::User(user_id) = issuer {
            self.ctx.broadcaster.publish_to_user(user_id, event, payload);
        }
    }

    async fn audit(&self, message: &str) {
        if let Err(e) = self.ctx.store.add_audit_entry(self.id, message).await {
            tracing::warn!(server_id = %self.id, error = %e, "Failed to write audit entry");
        }
    }
}

fn crash_watch_tick(weak: Weak<ServerSupervisor>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let Some(supervisor) = weak.upgrade() else {
            return;
        };
        match supervisor.detect_crash().await {
            Ok(check) => tracing::trace!(server_id = %supervisor.id(), ?check, "Crash check"),
            Err(e) => tracing::error!(server_id = %supervisor.id(), error = %e, "Crash check failed"),
        }
    })
}

fn stats_poll_tick(weak: Weak<ServerSupervisor>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let Some(supervisor) = weak.upgrade() else {
            return;
        };
        if let Err(e) = supervisor.record_stats().await {
            tracing::warn!(server_id = %supervisor.id(), error = %e, "Failed to record server stats");
        }
    })
}
