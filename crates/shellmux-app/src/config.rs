//! Runtime settings: CLI flags and environment over an optional TOML file
//! over built-in defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use shellmux_llm_api::parse_model_spec;
use shellmux_terminal::RegistryConfig;
use shellmux_types::{
    IdlePolicy, DEFAULT_CLEANUP_INTERVAL_SECS, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_QUEUE_CAPACITY,
    MAX_CONCURRENT_SESSIONS,
};

use crate::cli::{Cli, LogFormat};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_ASSIST_MODEL: &str = "gpt-4o-mini@openai";
pub const DEFAULT_ASSIST_TIMEOUT_SECS: u64 = 60;

/// Contents of the optional TOML config file. Keys mirror the long CLI flags
/// with underscores.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub max_sessions: Option<usize>,
    pub idle_timeout: Option<u64>,
    pub cleanup_interval: Option<u64>,
    pub idle_policy: Option<IdlePolicy>,
    pub shell: Option<String>,
    pub queue_capacity: Option<usize>,
    pub replay_last_chunk: Option<bool>,
    pub assist_model: Option<String>,
    pub fallback_model: Option<String>,
    pub assist_timeout: Option<u64>,
    pub log_format: Option<LogFormat>,
    pub llm_log_dir: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// Fully resolved settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub bind: IpAddr,
    pub port: u16,
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
    pub idle_policy: IdlePolicy,
    pub shell: String,
    pub queue_capacity: usize,
    pub replay_last_chunk: bool,
    /// `None` when the assistant is disabled
    pub assist_model: Option<String>,
    pub fallback_model: Option<String>,
    pub api_key: Option<String>,
    pub fallback_api_key: Option<String>,
    pub assist_timeout: Duration,
    pub log_format: LogFormat,
    pub llm_log_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            max_sessions: MAX_CONCURRENT_SESSIONS,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            idle_policy: IdlePolicy::default(),
            shell: default_shell(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            replay_last_chunk: false,
            assist_model: Some(DEFAULT_ASSIST_MODEL.to_string()),
            fallback_model: None,
            api_key: None,
            fallback_api_key: None,
            assist_timeout: Duration::from_secs(DEFAULT_ASSIST_TIMEOUT_SECS),
            log_format: LogFormat::default(),
            llm_log_dir: None,
        }
    }
}

/// `$SHELL`, else `/bin/bash`
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.trim().is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

impl Settings {
    /// Load the config file named on the command line (if any) and resolve
    pub fn load(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, file)
    }

    /// Merge with precedence CLI flag / env var > file > defaults, then validate
    pub fn resolve(cli: &Cli, file: FileConfig) -> Result<Self> {
        let defaults = Settings::default();

        let assist_model = if cli.no_assist {
            None
        } else {
            cli.assist_model.clone().or(file.assist_model).or(defaults.assist_model)
        };

        let settings = Settings {
            bind: cli.bind.or(file.bind).unwrap_or(defaults.bind),
            port: cli.port.or(file.port).unwrap_or(defaults.port),
            max_sessions: cli.max_sessions.or(file.max_sessions).unwrap_or(defaults.max_sessions),
            idle_timeout: cli
                .idle_timeout
                .or(file.idle_timeout)
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            cleanup_interval: cli
                .cleanup_interval
                .or(file.cleanup_interval)
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_interval),
            idle_policy: cli.idle_policy.or(file.idle_policy).unwrap_or(defaults.idle_policy),
            shell: cli.shell.clone().or(file.shell).unwrap_or(defaults.shell),
            queue_capacity: cli.queue_capacity.or(file.queue_capacity).unwrap_or(defaults.queue_capacity),
            replay_last_chunk: cli.replay_last_chunk || file.replay_last_chunk.unwrap_or(defaults.replay_last_chunk),
            assist_model,
            fallback_model: if cli.no_assist {
                None
            } else {
                cli.fallback_model.clone().or(file.fallback_model)
            },
            api_key: cli.api_key.clone(),
            fallback_api_key: cli.fallback_api_key.clone(),
            assist_timeout: cli
                .assist_timeout
                .or(file.assist_timeout)
                .map(Duration::from_secs)
                .unwrap_or(defaults.assist_timeout),
            log_format: cli.log_format.or(file.log_format).unwrap_or(defaults.log_format),
            llm_log_dir: cli.llm_log_dir.clone().or(file.llm_log_dir),
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            bail!("max_sessions must be at least 1");
        }
        if self.idle_timeout.is_zero() {
            bail!("idle_timeout must be at least 1 second");
        }
        if self.cleanup_interval.is_zero() {
            bail!("cleanup_interval must be at least 1 second");
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        if self.assist_timeout.is_zero() {
            bail!("assist_timeout must be at least 1 second");
        }
        if self.shell.trim().is_empty() {
            bail!("shell must not be empty");
        }
        for spec in self.assist_model.iter().chain(self.fallback_model.iter()) {
            parse_model_spec(spec).map_err(anyhow::Error::msg)?;
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_sessions: self.max_sessions,
            idle_timeout: self.idle_timeout,
            cleanup_interval: self.cleanup_interval,
            idle_policy: self.idle_policy,
            queue_capacity: self.queue_capacity,
            replay_last_chunk: self.replay_last_chunk,
        }
    }
}
