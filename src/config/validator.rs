use crate::config::{RunnerConfig, ServerConfig, Settings};
use crate::error::{Error, Result};
use std::collections::HashSet;

/// Validates a server configuration
pub fn validate_server_config(config: &ServerConfig) -> Result<()> {
    if config.execution_command.trim().is_empty() {
        return Err(Error::ConfigInvalid(format!(
            "Server '{}' has empty execution command",
            config.name
        )));
    }

    if config.executable.trim().is_empty() {
        return Err(Error::ConfigInvalid(format!(
            "Server '{}' has empty executable",
            config.name
        )));
    }

    if shlex::split(&config.execution_command).is_none() {
        return Err(Error::ConfigInvalid(format!(
            "Server '{}' has unbalanced quotes in its execution command",
            config.name
        )));
    }

    if config.stop_command.as_deref().is_some_and(|cmd| cmd.trim().is_empty()) {
        return Err(Error::ConfigInvalid(format!(
            "Server '{}' has an empty stop command; omit it to stop with a signal",
            config.name
        )));
    }

    Ok(())
}

/// Validates runner-wide settings
pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.virtual_terminal_lines == 0 {
        return Err(Error::ConfigInvalid(
            "virtualTerminalLines must be greater than zero".to_string(),
        ));
    }

    let intervals = [
        ("commandPollIntervalMs", settings.command_poll_interval_ms),
        ("realtimeIntervalMs", settings.realtime_interval_ms),
        ("crashCheckIntervalSecs", settings.crash_check_interval_secs),
        ("statsPollIntervalSecs", settings.stats_poll_interval_secs),
        ("statsUpdateFrequencySecs", settings.stats_update_frequency_secs),
        ("stopPollIntervalMs", settings.stop_poll_interval_ms),
        ("backupProgressIntervalMs", settings.backup_progress_interval_ms),
        ("logPruneIntervalHours", settings.log_prune_interval_hours),
        ("cacheRefreshIntervalHours", settings.cache_refresh_interval_hours),
    ];
    for (name, value) in intervals {
        if value == 0 {
            return Err(Error::ConfigInvalid(format!("{} must be greater than zero", name)));
        }
    }

    Ok(())
}

/// Full configuration validation
pub fn validate_config(config: &RunnerConfig) -> Result<()> {
    validate_settings(&config.settings)?;

    let mut seen = HashSet::new();
    for server in &config.servers {
        if !seen.insert(server.id) {
            return Err(Error::ConfigInvalid(format!(
                "Server id {} is used more than once",
                server.id
            )));
        }
        validate_server_config(server)?;
    }

    Ok(())
}
