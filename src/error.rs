/// Error handling module for Game Runner.
///
/// This module defines the error types used throughout the library.
/// Every lifecycle, maintenance and scheduling operation returns one of
/// these errors instead of panicking, so background loops can log the
/// failure and keep running.
///
/// # Example
///
/// ```
/// use game_runner::error::{Error, Result, StartupError};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(_) => println!("Operation succeeded"),
///         Err(Error::Startup(StartupError::AlreadyRunning)) => println!("Server is already up"),
///         Err(Error::Startup(e)) => println!("Server could not start: {}", e),
///         Err(Error::ServerNotFound(id)) => println!("No server with id {}", id),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
use std::path::PathBuf;
use thiserror::Error;

/// Reasons a server process refused to start.
///
/// These are reported back to the issuer of the start request and never
/// take the supervisor down.
#[derive(Error, Debug)]
pub enum StartupError {
    /// The server process is already running.
    #[error("Server is already running")]
    AlreadyRunning,

    /// An executable update is in progress for this server.
    #[error("Server is updating")]
    UpdateInProgress,

    /// The configured executable does not exist inside the server directory.
    #[error("Server executable {0} does not exist")]
    ExecutableMissing(PathBuf),

    /// The server working directory does not exist.
    #[error("Server path {0} does not exist")]
    PathMissing(PathBuf),

    /// The server working directory cannot be written to.
    #[error("Server path {0} is not writable")]
    PathNotWritable(PathBuf),

    /// The end-user license file is missing or not accepted.
    #[error("License at {0} has not been accepted")]
    LicenseNotAccepted(PathBuf),

    /// The launch command is empty or could not be split into arguments.
    #[error("Invalid launch command: {0}")]
    InvalidCommand(String),

    /// The operating system refused to spawn the process.
    #[error("Failed to spawn server process: {0}")]
    Spawn(String),
}

/// Errors that can occur in the game-runner library.
///
/// Each variant includes context information to help diagnose and handle
/// the error appropriately.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to parse configuration from a file or string.
    ///
    /// This error occurs when:
    /// - The configuration JSON or YAML is malformed
    /// - Required fields are missing
    /// - Field types are incorrect
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration parsed but contains invalid values.
    ///
    /// This error occurs when:
    /// - A launch command is empty
    /// - Two servers share an id
    /// - An interval or capacity is zero
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A server could not be started.
    #[error("Startup error: {0}")]
    Startup(#[from] StartupError),

    /// A crash was detected and could not be recovered from.
    #[error("Crash error: {0}")]
    Crash(String),

    /// A backup could not be started or did not complete.
    ///
    /// This error occurs when:
    /// - No backup path is configured
    /// - A backup is already running for the server
    /// - Copying or archiving the server directory failed
    #[error("Backup error: {0}")]
    Backup(String),

    /// An executable update could not be started or did not complete.
    #[error("Update error: {0}")]
    Update(String),

    /// A scheduled job could not be registered or changed.
    ///
    /// This error occurs when:
    /// - A cron expression is malformed
    /// - An interval rule has a zero period or an invalid time of day
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// A command queue entry could not be executed.
    #[error("Command queue error: {0}")]
    CommandQueue(String),

    /// Error while signalling, writing to, or polling a server process.
    #[error("Server process error: {0}")]
    Process(String),

    /// Requested server was not found.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// The server is not running.
    ///
    /// This error occurs when:
    /// - Sending a console command to a stopped server
    #[error("Not running")]
    NotRunning,

    /// The persistence collaborator failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Filesystem or socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error not covered by the above categories.
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for game-runner operations.
///
/// This is a convenience type alias for `std::result::Result` with the `Error` type
/// from this module.
pub type Result<T> = std::result::Result<T, Error>;
