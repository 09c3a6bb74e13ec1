use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use shellmux_types::IdlePolicy;

/// CLI arguments for shellmux.
///
/// Every option is optional so that a TOML config file can supply it;
/// see [`crate::config::Settings::resolve`] for precedence.
#[derive(Parser, Debug, Default)]
#[command(name = "shellmux")]
#[command(about = "Shared terminal sessions over WebSocket, with an optional LLM assistant")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to a TOML config file
    #[arg(long, short = 'c', value_name = "PATH", env = "SHELLMUX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, value_name = "ADDR", env = "SHELLMUX_BIND")]
    pub bind: Option<IpAddr>,

    /// Port to listen on
    #[arg(long, short = 'p', env = "SHELLMUX_PORT")]
    pub port: Option<u16>,

    /// Maximum number of live sessions
    #[arg(long, env = "SHELLMUX_MAX_SESSIONS")]
    pub max_sessions: Option<usize>,

    /// Seconds without input or output before a session is reaped
    #[arg(long, value_name = "SECS", env = "SHELLMUX_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Seconds between idle sweeps
    #[arg(long, value_name = "SECS", env = "SHELLMUX_CLEANUP_INTERVAL")]
    pub cleanup_interval: Option<u64>,

    /// Whether attached connections keep a session alive (keystroke_only, connection_presence)
    #[arg(long, value_name = "POLICY", env = "SHELLMUX_IDLE_POLICY")]
    pub idle_policy: Option<IdlePolicy>,

    /// Command spawned when a create request names none
    #[arg(long, value_name = "COMMAND", env = "SHELLMUX_SHELL")]
    pub shell: Option<String>,

    /// Output chunks buffered per connection before the oldest are dropped
    #[arg(long, value_name = "N")]
    pub queue_capacity: Option<usize>,

    /// Send the most recent output chunk to newly attached connections
    #[arg(long)]
    pub replay_last_chunk: bool,

    /// Primary assistance model, e.g. gpt-4o-mini@openai or llama3@llama(http://localhost:8080)
    #[arg(long, value_name = "SPEC", env = "SHELLMUX_ASSIST_MODEL")]
    pub assist_model: Option<String>,

    /// Fallback assistance model, tried when the primary fails
    #[arg(long, value_name = "SPEC", env = "SHELLMUX_FALLBACK_MODEL")]
    pub fallback_model: Option<String>,

    /// API key for the primary model (defaults to the backend's environment variable)
    #[arg(long, value_name = "KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// API key for the fallback model
    #[arg(long, value_name = "KEY", hide_env_values = true)]
    pub fallback_api_key: Option<String>,

    /// Seconds before an assistance request gives up
    #[arg(long, value_name = "SECS", env = "SHELLMUX_ASSIST_TIMEOUT")]
    pub assist_timeout: Option<u64>,

    /// Disable the assistant entirely
    #[arg(long)]
    pub no_assist: bool,

    /// Log output format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Write every assistance request and response to this directory
    #[arg(long, value_name = "DIR")]
    pub llm_log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the server (the default)
    Serve,
    /// Print shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}
