//! Type definitions for scheduled jobs and the command queue.

use crate::server::{Issuer, ServerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a persisted scheduled task.
pub type TaskId = i64;

/// Identifier of a persisted command queue entry.
pub type CommandId = i64;

/// A lifecycle intent addressed to one server.
///
/// Anything that is not one of the named actions is a console command
/// written verbatim to the server's input.
///
/// # Examples
///
/// ```
/// use game_runner::tasks::CommandAction;
///
/// assert_eq!(CommandAction::parse("stop_server"), CommandAction::StopServer);
/// assert_eq!(
///     CommandAction::parse("say hello"),
///     CommandAction::Console("say hello".to_string())
/// );
/// assert_eq!(CommandAction::BackupServer.to_string(), "backup_server");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandAction {
    StartServer,
    StopServer,
    RestartServer,
    BackupServer,
    UpdateExecutable,
    /// Raw console command.
    Console(String),
}

impl CommandAction {
    /// Parses the wire name of an action, falling back to a console command.
    pub fn parse(action: &str) -> Self {
        match action {
            "start_server" => CommandAction::StartServer,
            "stop_server" => CommandAction::StopServer,
            "restart_server" => CommandAction::RestartServer,
            "backup_server" => CommandAction::BackupServer,
            "update_executable" => CommandAction::UpdateExecutable,
            other => CommandAction::Console(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CommandAction::StartServer => "start_server",
            CommandAction::StopServer => "stop_server",
            CommandAction::RestartServer => "restart_server",
            CommandAction::BackupServer => "backup_server",
            CommandAction::UpdateExecutable => "update_executable",
            CommandAction::Console(command) => command,
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for CommandAction {
    fn from(value: String) -> Self {
        CommandAction::parse(&value)
    }
}

impl From<CommandAction> for String {
    fn from(value: CommandAction) -> Self {
        value.as_str().to_string()
    }
}

/// Unit of a simple interval rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

/// "Every N units" rule. Day rules fire at `at_time` (`HH:MM`, local time).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalSpec {
    pub unit: IntervalUnit,
    pub every: u32,
    #[serde(default)]
    pub at_time: Option<String>,
}

/// When a scheduled task fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// Standard five-field cron expression (`m h dom mon dow`).
    Cron(String),
    Interval(IntervalSpec),
}

/// Everything needed to create or replace a scheduled task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub target_id: ServerId,
    pub action: CommandAction,
    pub trigger: Trigger,
    pub enabled: bool,
    /// Delete the task after its first successful firing.
    #[serde(default)]
    pub one_time: bool,
}

/// A persisted scheduled task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: TaskId,
    pub target_id: ServerId,
    pub action: CommandAction,
    pub trigger: Trigger,
    pub enabled: bool,
    pub one_time: bool,
}

impl ScheduledTask {
    pub fn from_spec(id: TaskId, spec: JobSpec) -> Self {
        Self {
            id,
            target_id: spec.target_id,
            action: spec.action,
            trigger: spec.trigger,
            enabled: spec.enabled,
            one_time: spec.one_time,
        }
    }
}

/// A request to add an entry to the command queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCommand {
    pub target_id: ServerId,
    pub issuer: Issuer,
    pub action: CommandAction,
}

/// A persisted command queue entry. Completed entries are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandQueueEntry {
    pub id: CommandId,
    pub target_id: ServerId,
    pub issuer: Issuer,
    pub action: CommandAction,
    pub enqueued_at: DateTime<Utc>,
    pub completed: bool,
}

/// Result of one trigger firing, fed back to the scheduler.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub task_id: TaskId,
    pub outcome: std::result::Result<CommandId, String>,
}
