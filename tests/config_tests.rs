use game_runner::config::{RunnerConfig, ServerConfig, ServerType, Settings};
use game_runner::error::{Error, Result};
use game_runner::server::ServerId;
use std::path::PathBuf;

#[test]
fn test_parse_config() -> Result<()> {
    let config_str = r#"{
        "settings": {
            "virtualTerminalLines": 200,
            "crashCheckIntervalSecs": 15,
            "logDir": "/var/log/game-runner"
        },
        "servers": [
            {
                "id": 1,
                "name": "survival",
                "path": "/srv/survival",
                "executable": "server.jar",
                "executionCommand": "java -Xmx4G -jar server.jar nogui",
                "stopCommand": "stop",
                "crashDetection": true,
                "backupPath": "/srv/backups/survival",
                "backup": {
                    "compress": true,
                    "maxBackups": 7,
                    "excludedPaths": ["logs", "/srv/survival/cache"]
                },
                "env": { "JAVA_HOME": "/opt/jdk-21" }
            },
            {
                "id": 2,
                "name": "bedrock",
                "path": "/srv/bedrock",
                "executable": "bedrock_server",
                "executionCommand": "./bedrock_server",
                "serverType": "minecraft-bedrock",
                "serverPort": 19132,
                "autoStart": true,
                "autoStartDelaySecs": 10
            }
        ]
    }"#;

    let config = RunnerConfig::parse_from_str(config_str)?;

    assert_eq!(config.settings.virtual_terminal_lines, 200);
    assert_eq!(config.settings.crash_check_interval_secs, 15);
    assert_eq!(config.settings.log_dir, Some(PathBuf::from("/var/log/game-runner")));
    assert_eq!(config.settings.stop_max_polls, Settings::default().stop_max_polls);
    assert_eq!(config.servers.len(), 2);

    let survival = config.server(ServerId(1)).unwrap();
    assert_eq!(survival.stop_command.as_deref(), Some("stop"));
    assert!(survival.crash_detection);
    assert_eq!(survival.server_type, ServerType::MinecraftJava);
    assert_eq!(survival.server_port, 25565);
    assert!(survival.backup.compress);
    assert_eq!(survival.backup.max_backups, 7);
    assert_eq!(
        survival.backup.excluded_paths,
        vec![PathBuf::from("logs"), PathBuf::from("/srv/survival/cache")]
    );
    assert_eq!(survival.env.get("JAVA_HOME"), Some(&"/opt/jdk-21".to_string()));
    assert_eq!(survival.executable_path(), PathBuf::from("/srv/survival/server.jar"));

    let bedrock = config.server(ServerId(2)).unwrap();
    assert_eq!(bedrock.server_type, ServerType::MinecraftBedrock);
    assert_eq!(bedrock.server_port, 19132);
    assert!(bedrock.auto_start);
    assert_eq!(bedrock.auto_start_delay_secs, 10);

    Ok(())
}

#[test]
fn test_validate_config() -> Result<()> {
    use game_runner::config::validate_config;

    let mut config = RunnerConfig {
        settings: Settings::default(),
        servers: vec![
            ServerConfig::new(1, "lobby", "/srv/lobby", "server.jar", "java -jar server.jar"),
            ServerConfig::new(2, "survival", "/srv/survival", "server.jar", "java -jar server.jar"),
        ],
    };
    validate_config(&config)?;

    // Unbalanced quotes cannot be split into arguments
    config.servers[1].execution_command = "java -jar 'server.jar".to_string();
    assert!(matches!(validate_config(&config), Err(Error::ConfigInvalid(_))));
    config.servers[1].execution_command = "java -jar server.jar".to_string();

    // Duplicate ids
    config.servers[1].id = ServerId(1);
    assert!(matches!(validate_config(&config), Err(Error::ConfigInvalid(_))));
    config.servers[1].id = ServerId(2);

    // Empty stop command
    config.servers[0].stop_command = Some("  ".to_string());
    assert!(validate_config(&config).is_err());
    config.servers[0].stop_command = None;

    // Zero intervals
    config.settings.command_poll_interval_ms = 0;
    assert!(validate_config(&config).is_err());

    Ok(())
}

#[test]
fn test_parse_yaml_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("runner.yaml");
    std::fs::write(
        &path,
        "servers:\n  - id: 4\n    name: modded\n    path: /srv/modded\n    executable: forge.jar\n    executionCommand: java -jar forge.jar\n",
    )?;

    let config = RunnerConfig::from_file(&path)?;

    assert_eq!(config.servers[0].name, "modded");
    assert_eq!(config.settings, Settings::default());
    Ok(())
}

#[test]
fn test_parse_errors() {
    assert!(matches!(
        RunnerConfig::parse_from_str("{ not json"),
        Err(Error::ConfigParse(_))
    ));
    assert!(matches!(
        RunnerConfig::from_file("/definitely/not/here.json"),
        Err(Error::ConfigParse(_))
    ));
}
