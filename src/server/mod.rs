/// Server management module for Game Runner.
///
/// This module owns everything that touches a game server process: spawning
/// and stopping it, capturing its console, detecting crashes, and running
/// backups and executable updates. All public components are instrumented
/// with `tracing` spans.
///
/// # Components
///
/// * `supervisor` - Lifecycle of one server, crash recovery, backup and update orchestration
/// * `process` - Spawning, signalling and killing the OS process
/// * `output` - Byte-by-byte console parsing into a bounded virtual terminal
/// * `lifecycle` - History of lifecycle events
/// * `monitor` - Periodic crash checks and stats polling per server
/// * `backup` - Staged, archived and pruned backups
/// * `update` - Executable download and rollback
/// * `registry` - Supervisors keyed by server id
///
/// # Examples
///
/// Recording lifecycle events:
///
/// ```
/// use game_runner::server::{ServerId, ServerLifecycleEvent, ServerLifecycleManager};
///
/// let manager = ServerLifecycleManager::new();
/// manager
///     .record_event(ServerId(1), "lobby".to_string(), ServerLifecycleEvent::Started, None)
///     .unwrap();
/// assert_eq!(manager.get_server_events(ServerId(1), Some(1)).unwrap().len(), 1);
/// ```
///
/// Feeding console output through the line parser:
///
/// ```
/// use game_runner::broadcast::Hub;
/// use game_runner::server::{OutputStreamBuffer, ServerId, VirtualTerminal};
/// use std::sync::{Arc, Mutex};
///
/// let terminal = Arc::new(Mutex::new(VirtualTerminal::new(70)));
/// let mut parser = OutputStreamBuffer::with_terminator(
///     ServerId(1),
///     terminal.clone(),
///     Arc::new(Hub::default()),
///     b"\n",
/// );
/// parser.process(b"[Server thread/INFO]: Done (3.2s)!\n");
/// assert_eq!(terminal.lock().unwrap().lines(), vec!["[Server thread/INFO]: Done (3.2s)!"]);
/// ```
pub mod backup;
pub mod lifecycle;
pub mod monitor;
pub mod output;
mod process;
pub mod registry;
pub mod supervisor;
pub mod update;

pub use backup::{BackupArchive, BackupJob, BackupProgress};
pub use lifecycle::{ServerEvent, ServerLifecycleEvent, ServerLifecycleManager};
pub use monitor::{MonitorJob, ServerMonitor};
pub use output::{OutputStreamBuffer, VirtualTerminal, sanitize_line};
pub use process::{
    LICENSE_FILE, LaunchVariant, ProcessHandle, ServerId, ServerStatus, license_accepted,
    parse_command,
};
pub use registry::ServerRegistry;
pub use supervisor::{
    CrashCheck, Issuer, MAX_CRASH_RESTARTS, ServerSupervisor, SupervisorContext, SupervisorSnapshot,
};
pub use update::{Downloader, HttpDownloader};
