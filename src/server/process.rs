// src/server/process.rs
use crate::config::{ServerConfig, ServerType};
use crate::error::{Error, Result, StartupError};
use async_process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use chrono::{DateTime, Utc};
use futures_lite::AsyncWriteExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};

/// Name of the end-user license file inside a server directory.
pub const LICENSE_FILE: &str = "eula.txt";

/// Unique identifier for a supervised server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub i64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a supervised server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Server has stopped
    Stopped,
    /// Server is starting
    Starting,
    /// Server is running
    Running,
    /// Server is stopping
    Stopping,
    /// Server died unexpectedly
    Crashed,
}

/// How the process environment is prepared before spawning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchVariant {
    /// Inherit the environment unchanged.
    Standard,
    /// Point the dynamic loader at the server directory so bundled native
    /// libraries resolve.
    NativeLibraryPath,
}

impl LaunchVariant {
    /// Picks the launch variant for a server type on the current host.
    pub fn for_server(server_type: ServerType) -> Self {
        match server_type {
            ServerType::MinecraftBedrock if cfg!(unix) => LaunchVariant::NativeLibraryPath,
            _ => LaunchVariant::Standard,
        }
    }
}

/// A spawned server process
pub struct ProcessHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    pid: u32,
    working_dir: PathBuf,
    command: Vec<String>,
    started_at: DateTime<Utc>,
}

/// Output pipes handed to the output readers.
pub struct ProcessOutput {
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

impl ProcessHandle {
    /// Spawns the server described by `config` with all standard streams piped.
    pub fn spawn(config: &ServerConfig) -> Result<(Self, ProcessOutput)> {
        let command = parse_command(&config.execution_command)?;
        let (program, args) = command
            .split_first()
            .ok_or_else(|| StartupError::InvalidCommand(config.execution_command.clone()))?;

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&config.path);

        if LaunchVariant::for_server(config.server_type) == LaunchVariant::NativeLibraryPath {
            cmd.env("LD_LIBRARY_PATH", &config.path);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| StartupError::Spawn(format!("{}: {}", program, e)))?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let output = ProcessOutput {
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        };

        tracing::debug!(pid, program = %program, cwd = %config.path.display(), "Spawned server process");

        Ok((
            Self {
                child,
                stdin,
                pid,
                working_dir: config.path.clone(),
                command,
                started_at: Utc::now(),
            },
            output,
        ))
    }

    /// OS process id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Directory the process runs in
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Launch command split into arguments
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// When the process was spawned
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Returns the exit status if the process has exited, without blocking.
    pub fn try_exit(&mut self) -> Result<Option<ExitStatus>> {
        self.child
            .try_status()
            .map_err(|e| Error::Process(format!("Failed to poll process {}: {}", self.pid, e)))
    }

    /// Whether the process is still alive.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.try_exit(), Ok(None))
    }

    /// Writes one console line to the process input.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Process("Process stdin is closed".to_string()))?;

        let mut payload = line.as_bytes().to_vec();
        payload.push(b'\n');
        stdin
            .write_all(&payload)
            .await
            .map_err(|e| Error::Process(format!("Failed to write to stdin: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Process(format!("Failed to flush stdin: {}", e)))
    }

    /// Asks the process to exit.
    #[cfg(unix)]
    pub fn terminate(&mut self) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::Process(format!(
                "Failed to send SIGTERM to {}: {}",
                self.pid, e
            ))),
        }
    }

    /// Asks the process to exit.
    #[cfg(not(unix))]
    pub fn terminate(&mut self) -> Result<()> {
        self.child
            .kill()
            .map_err(|e| Error::Process(format!("Failed to terminate {}: {}", self.pid, e)))
    }

    /// Force-kills every descendant, deepest first, then the process itself.
    pub fn kill_tree(&mut self) -> Result<()> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        for pid in descendants(&system, self.pid).into_iter().rev() {
            if let Some(process) = system.process(SysPid::from_u32(pid)) {
                tracing::debug!(pid, parent = self.pid, "Killing child process");
                if !process.kill() {
                    tracing::warn!(pid, "Failed to kill child process");
                }
            }
        }

        match self.child.kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(Error::Process(format!("Failed to kill {}: {}", self.pid, e))),
        }
    }

    /// Waits for the process to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child
            .status()
            .await
            .map_err(|e| Error::Process(format!("Failed to wait for {}: {}", self.pid, e)))
    }
}

/// Breadth-first list of the descendants of `root`, nearest first.
fn descendants(system: &System, root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).map(Vec::as_slice).unwrap_or_default() {
            if !found.contains(&child) {
                found.push(child);
                queue.push_back(child);
            }
        }
    }
    found
}

/// Splits a launch command with shell quoting rules.
pub fn parse_command(command: &str) -> Result<Vec<String>> {
    match shlex::split(command) {
        Some(parts) if !parts.is_empty() => Ok(parts),
        _ => Err(StartupError::InvalidCommand(command.to_string()).into()),
    }
}

/// Whether the license file in `server_dir` has been accepted.
///
/// Only the first line counts. Case and spaces around `=` are ignored, so
/// `eula=true`, `EULA = TRUE` and `eula= true` are all accepted.
pub fn license_accepted(server_dir: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(server_dir.join(LICENSE_FILE)) else {
        return false;
    };
    let first_line = content.lines().next().unwrap_or_default();
    let normalized: String = first_line
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    normalized == "eula=true"
}

/// Marks the license in `server_dir` as accepted.
pub fn accept_license(server_dir: &Path) -> std::io::Result<()> {
    std::fs::write(server_dir.join(LICENSE_FILE), "eula=true\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_license_forms() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!license_accepted(dir.path()));

        for accepted in ["eula=true", "EULA = TRUE", "eula= true\n# trailing", "eula =true"] {
            std::fs::write(dir.path().join(LICENSE_FILE), accepted).unwrap();
            assert!(license_accepted(dir.path()), "{accepted:?} should be accepted");
        }

        for rejected in ["eula=false", "# comment\neula=true", ""] {
            std::fs::write(dir.path().join(LICENSE_FILE), rejected).unwrap();
            assert!(!license_accepted(dir.path()), "{rejected:?} should be rejected");
        }
    }

    #[test]
    fn test_parse_command_quoting() {
        let parts = parse_command(r#"java -Xmx2G -jar "my server.jar" nogui"#).unwrap();
        assert_eq!(parts, vec!["java", "-Xmx2G", "-jar", "my server.jar", "nogui"]);

        assert!(parse_command("   ").is_err());
        assert!(parse_command(r#"java "unterminated"#).is_err());
    }

    #[test]
    fn test_launch_variant_by_server_type() {
        assert_eq!(
            LaunchVariant::for_server(ServerType::MinecraftJava),
            LaunchVariant::Standard
        );
        let expected = if cfg!(unix) {
            LaunchVariant::NativeLibraryPath
        } else {
            LaunchVariant::Standard
        };
        assert_eq!(LaunchVariant::for_server(ServerType::MinecraftBedrock), expected);
    }
}
