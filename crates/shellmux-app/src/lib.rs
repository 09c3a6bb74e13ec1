//! shellmux server: configuration, logging, and the web surface (REST
//! routes plus the WebSocket [`web::ConnectionGateway`]) over the terminal
//! engine and assistance adapter.

pub mod app;
pub mod cli;
pub mod config;
pub mod logging;
pub mod web;

pub use cli::{Cli, Commands, LogFormat};
pub use config::{FileConfig, Settings};
