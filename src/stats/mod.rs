//! Resource and status telemetry.
//!
//! [`StatsCollector`] reads host and per-process usage through `sysinfo`,
//! measures world saves on disk and pings servers over their game
//! protocol. Nothing here fails its caller: lookups that go wrong are
//! logged and reported as zeroed or unreachable values.

pub mod ping;

pub use ping::{PingOutcome, PingProtocol, PingReply};

use crate::config::{ServerConfig, ServerType};
use crate::server::ServerId;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Disks, Pid as SysPid, ProcessesToUpdate, System};
use walkdir::WalkDir;

/// How long a ping result is reused before the server is pinged again.
pub const DEFAULT_PING_TTL: Duration = Duration::from_secs(10);
/// How long a single ping may take.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(3);

const SERVER_PROPERTIES: &str = "server.properties";
const DEFAULT_LEVEL_NAME: &str = "world";

/// CPU and memory usage of one process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    /// Share of total host CPU, 0 to 100.
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Usage of one mounted volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub device: String,
    pub mount: PathBuf,
    pub fs: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent_used: u8,
}

/// Host-wide snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStats {
    pub recorded_at: DateTime<Utc>,
    pub boot_time: DateTime<Utc>,
    pub cpu_usage: f32,
    pub cpu_cores: usize,
    /// Current CPU frequency in MHz.
    pub cpu_cur_freq: u64,
    pub mem_percent: f32,
    pub mem_usage: u64,
    pub mem_total: u64,
    pub disks: Vec<DiskUsage>,
}

/// Per-server snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStats {
    pub recorded_at: DateTime<Utc>,
    pub server_id: ServerId,
    pub started: Option<DateTime<Utc>>,
    pub running: bool,
    pub cpu: f32,
    pub mem: u64,
    pub world_name: String,
    pub world_size: u64,
    pub server_port: u16,
    pub ping: PingOutcome,
}

impl ServerStats {
    /// Player names reported by the last ping.
    pub fn players(&self) -> Vec<String> {
        self.ping.reply().map(|r| r.players.clone()).unwrap_or_default()
    }
}

/// What the collector needs to know about a server to snapshot it.
#[derive(Debug, Clone)]
pub struct ServerProbe {
    pub server_id: ServerId,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub path: PathBuf,
    pub server_ip: String,
    pub server_port: u16,
    pub protocol: PingProtocol,
}

impl ServerProbe {
    pub fn from_config(
        config: &ServerConfig,
        pid: Option<u32>,
        started_at: Option<DateTime<Utc>>,
    ) -> Self {
        let protocol = match config.server_type {
            ServerType::MinecraftJava => PingProtocol::Java,
            ServerType::MinecraftBedrock => PingProtocol::Bedrock,
        };
        Self {
            server_id: config.id,
            pid,
            started_at,
            path: config.path.clone(),
            server_ip: config.server_ip.clone(),
            server_port: config.server_port,
            protocol,
        }
    }
}

type PingKey = (String, u16, PingProtocol);

/// Read-side telemetry with a short-lived ping cache.
pub struct StatsCollector {
    system: Mutex<System>,
    ping_cache: Mutex<HashMap<PingKey, (Instant, PingOutcome)>>,
    ping_ttl: Duration,
    ping_timeout: Duration,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::with_ping_settings(DEFAULT_PING_TTL, DEFAULT_PING_TIMEOUT)
    }

    pub fn with_ping_settings(ping_ttl: Duration, ping_timeout: Duration) -> Self {
        Self {
            system: Mutex::new(System::new()),
            ping_cache: Mutex::new(HashMap::new()),
            ping_ttl,
            ping_timeout,
        }
    }

    /// CPU and memory of `pid`. Zeroed when there is no pid or it cannot be read.
    pub async fn process_stats(&self, pid: Option<u32>) -> ProcessStats {
        let Some(pid) = pid else {
            return ProcessStats::default();
        };
        let sys_pid = SysPid::from_u32(pid);

        // CPU usage is a delta between two refreshes.
        if !self.refresh_process(sys_pid) {
            tracing::error!(pid, "Unable to get process details");
            return ProcessStats::default();
        }
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        if !self.refresh_process(sys_pid) {
            tracing::error!(pid, "Process disappeared while reading its stats");
            return ProcessStats::default();
        }

        let Ok(system) = self.system.lock() else {
            tracing::error!("Failed to lock system info");
            return ProcessStats::default();
        };
        let cores = system.cpus().len().max(1) as f32;
        match system.process(sys_pid) {
            Some(process) => ProcessStats {
                cpu_percent: round2(process.cpu_usage() / cores),
                memory_bytes: process.memory(),
            },
            None => ProcessStats::default(),
        }
    }

    fn refresh_process(&self, pid: SysPid) -> bool {
        match self.system.lock() {
            Ok(mut system) => {
                if system.cpus().is_empty() {
                    system.refresh_cpu_all();
                }
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                system.process(pid).is_some()
            }
            Err(_) => false,
        }
    }

    /// Host CPU, memory, disks and boot time.
    pub async fn host_stats(&self) -> HostStats {
        if let Ok(mut system) = self.system.lock() {
            system.refresh_cpu_usage();
        }
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;

        let (cpu_usage, cpu_cores, cpu_cur_freq, mem_total, mem_usage) = match self.system.lock() {
            Ok(mut system) => {
                system.refresh_cpu_all();
                system.refresh_memory();
                let freq = system.cpus().first().map(|cpu| cpu.frequency()).unwrap_or(0);
                (
                    round2(system.global_cpu_usage()),
                    system.cpus().len(),
                    freq,
                    system.total_memory(),
                    system.used_memory(),
                )
            }
            Err(_) => {
                tracing::error!("Failed to lock system info");
                (0.0, 0, 0, 0, 0)
            }
        };

        let mem_percent = if mem_total == 0 {
            0.0
        } else {
            round2(mem_usage as f32 / mem_total as f32 * 100.0)
        };

        HostStats {
            recorded_at: Utc::now(),
            boot_time: Utc
                .timestamp_opt(System::boot_time() as i64, 0)
                .single()
                .unwrap_or_default(),
            cpu_usage,
            cpu_cores,
            cpu_cur_freq,
            mem_percent,
            mem_usage,
            mem_total,
            disks: disk_usage(),
        }
    }

    /// Pings a server, reusing a recent result when one is cached.
    pub async fn ping(&self, host: &str, port: u16, protocol: PingProtocol) -> PingOutcome {
        let key = (host.to_string(), port, protocol);
        if let Ok(cache) = self.ping_cache.lock() {
            if let Some((at, outcome)) = cache.get(&key) {
                if at.elapsed() < self.ping_ttl {
                    return outcome.clone();
                }
            }
        }

        tracing::debug!(host = %host, port, ?protocol, "Pinging server");
        let outcome = ping::ping(host, port, protocol, self.ping_timeout).await;

        if let Ok(mut cache) = self.ping_cache.lock() {
            cache.insert(key, (Instant::now(), outcome.clone()));
        }
        outcome
    }

    /// Drops every cached ping result.
    pub fn clear_ping_cache(&self) {
        if let Ok(mut cache) = self.ping_cache.lock() {
            cache.clear();
        }
    }

    /// Full snapshot of one server. Stopped servers are not pinged.
    pub async fn server_stats(&self, probe: &ServerProbe) -> ServerStats {
        let running = probe.pid.is_some();
        let process = self.process_stats(probe.pid).await;

        let world_name = level_name(&probe.path);
        let world_path = probe.path.join(&world_name);
        let world_size = tokio::task::spawn_blocking(move || world_size(&world_path))
            .await
            .unwrap_or(0);

        let ping = if running {
            self.ping(&probe.server_ip, probe.server_port, probe.protocol).await
        } else {
            PingOutcome::Unreachable
        };

        ServerStats {
            recorded_at: Utc::now(),
            server_id: probe.server_id,
            started: probe.started_at,
            running,
            cpu: process.cpu_percent,
            mem: process.memory_bytes,
            world_name,
            world_size,
            server_port: probe.server_port,
            ping,
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn disk_usage() -> Vec<DiskUsage> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| disk.total_space() > 0)
        .map(|disk| {
            let total = disk.total_space();
            let free = disk.available_space();
            let used = total.saturating_sub(free);
            DiskUsage {
                device: disk.name().to_string_lossy().into_owned(),
                mount: disk.mount_point().to_path_buf(),
                fs: disk.file_system().to_string_lossy().into_owned(),
                total,
                used,
                free,
                percent_used: ((used as f64 / total as f64) * 100.0) as u8,
            }
        })
        .collect()
}

/// Sums every directory named `region` below `path`.
///
/// Regions nested inside another region directory are counted once.
pub fn world_size(path: &Path) -> u64 {
    let mut total = 0;
    let mut walker = WalkDir::new(path).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let Ok(entry) = entry else { continue };
        if entry.file_type().is_dir() && entry.file_name() == "region" {
            tracing::debug!(path = %entry.path().display(), "Measuring region directory");
            total += dir_size(entry.path());
            walker.skip_current_dir();
        }
    }
    total
}

/// Total size of the files below `path`.
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

/// Reads `server.properties` from a server directory.
pub fn read_server_properties(server_dir: &Path) -> HashMap<String, String> {
    let Ok(content) = std::fs::read_to_string(server_dir.join(SERVER_PROPERTIES)) else {
        return HashMap::new();
    };
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

/// World directory name, from `level-name` in `server.properties`.
pub fn level_name(server_dir: &Path) -> String {
    read_server_properties(server_dir)
        .remove("level-name")
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_LEVEL_NAME.to_string())
}

/// Formats a byte count with binary units, e.g. `1.5 KiB`.
pub fn human_readable_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_readable_size() {
        assert_eq!(human_readable_size(0), "0 B");
        assert_eq!(human_readable_size(1023), "1023 B");
        assert_eq!(human_readable_size(1536), "1.5 KiB");
        assert_eq!(human_readable_size(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn test_level_name_from_properties() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(level_name(dir.path()), "world");

        std::fs::write(
            dir.path().join(SERVER_PROPERTIES),
            "#Minecraft server properties\nlevel-name=survival\nserver-port=25566\n",
        )
        .unwrap();
        assert_eq!(level_name(dir.path()), "survival");
        assert_eq!(read_server_properties(dir.path())["server-port"], "25566");
    }

    #[tokio::test]
    async fn test_process_stats_without_pid_is_zero() {
        let collector = StatsCollector::new();
        assert_eq!(collector.process_stats(None).await, ProcessStats::default());
        assert_eq!(collector.process_stats(Some(u32::MAX - 1)).await, ProcessStats::default());
    }
}
