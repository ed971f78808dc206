//! Configuration module for Game Runner.
//!
//! This module handles parsing, validation, and access to configuration
//! settings for supervised game servers. It supports loading configurations
//! from JSON or YAML files or strings.
//!
//! # Examples
//!
//! Loading a configuration from a file:
//!
//! ```no_run
//! use game_runner::config::RunnerConfig;
//!
//! let config = RunnerConfig::from_file("runner.json").unwrap();
//! println!("Loaded configuration with {} servers", config.servers.len());
//! ```
//!
//! Creating a configuration programmatically:
//! ```
//! use game_runner::config::{RunnerConfig, ServerConfig, Settings, validate_config};
//!
//! let mut server = ServerConfig::new(1, "survival", "/srv/survival", "server.jar", "java -jar server.jar nogui");
//! server.stop_command = Some("stop".to_string());
//! server.crash_detection = true;
//!
//! let config = RunnerConfig {
//!     settings: Settings::default(),
//!     servers: vec![server],
//! };
//! validate_config(&config).unwrap();
//! ```
mod parser;
pub mod validator;

pub use parser::{BackupConfig, RunnerConfig, ServerConfig, ServerType, Settings};
pub use validator::validate_config;
