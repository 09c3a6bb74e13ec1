use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use shellmux_assist::AssistanceAdapter;
use shellmux_llm_api::{ClientFactory, LlmClient, RequestLogger};
use shellmux_terminal::{SessionEvent, SessionRegistry};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::web::{AppState, WebServer};

/// Registry wired to log every lifecycle event
pub fn build_registry(settings: &Settings) -> Arc<SessionRegistry> {
    let registry = SessionRegistry::new(settings.registry_config()).with_observer(Box::new(log_session_event));
    Arc::new(registry)
}

fn log_session_event(event: &SessionEvent) {
    match event {
        SessionEvent::Created(snapshot) => debug!(
            session_id = %snapshot.id,
            command = %snapshot.command,
            rows = snapshot.rows,
            cols = snapshot.cols,
            "lifecycle: created"
        ),
        SessionEvent::Resized { id, rows, cols } => debug!(session_id = %id, rows, cols, "lifecycle: resized"),
        SessionEvent::Exited { id, exit_code } => debug!(session_id = %id, ?exit_code, "lifecycle: exited"),
        SessionEvent::Closed { id, reason } => debug!(session_id = %id, ?reason, "lifecycle: closed"),
    }
}

/// Build clients from the configured model specs and probe them. A bad or
/// unreachable model disables that capability, never the server.
pub async fn build_adapter(settings: &Settings) -> Result<AssistanceAdapter> {
    let mut adapter = AssistanceAdapter::new(settings.assist_timeout);

    let logger = match &settings.llm_log_dir {
        Some(dir) => Some(RequestLogger::new(dir).context("failed to set up LLM request logging")?),
        None => None,
    };

    let primary = make_client(
        settings.assist_model.as_deref(),
        settings.api_key.clone(),
        "primary",
        logger.clone(),
    );
    let fallback = make_client(
        settings.fallback_model.as_deref(),
        settings.fallback_api_key.clone(),
        "fallback",
        logger,
    );

    if primary.is_none() && fallback.is_none() {
        info!("assistance disabled");
        return Ok(adapter);
    }

    adapter.initialize(primary, fallback).await;
    Ok(adapter)
}

fn make_client(
    spec: Option<&str>,
    api_key: Option<String>,
    name: &str,
    logger: Option<RequestLogger>,
) -> Option<Arc<dyn LlmClient>> {
    let spec = spec?;
    match ClientFactory::from_spec(spec, api_key, name, logger) {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(capability = name, %spec, error = %e, "cannot create assistance client");
            None
        }
    }
}

fn print_banner(settings: &Settings, addr: std::net::SocketAddr, adapter: &AssistanceAdapter) {
    println!("{}", "shellmux".bright_cyan().bold());
    println!("  {} http://{addr}", "listening".green());
    println!("  {} {}", "shell".green(), settings.shell);
    println!(
        "  {} {} (idle timeout {}s, {})",
        "sessions".green(),
        settings.max_sessions,
        settings.idle_timeout.as_secs(),
        settings.idle_policy
    );
    if adapter.is_enabled() {
        println!("  {} {}", "assistant".green(), adapter.capability_names().join(", "));
    } else {
        println!("  {} {}", "assistant".yellow(), "disabled".dimmed());
    }
}

/// Run the server until Ctrl-C, then close every session
pub async fn run(settings: Settings) -> Result<()> {
    let registry = build_registry(&settings);
    let cleanup = registry.spawn_cleanup_loop();

    let adapter = Arc::new(build_adapter(&settings).await?);
    let server = WebServer::bind(
        settings.socket_addr(),
        AppState::new(registry.clone(), adapter.clone(), settings.clone()),
    )
    .await?;
    print_banner(&settings, server.local_addr()?, &adapter);

    // Closing the sessions ends their WebSocket connections, which lets the
    // graceful shutdown complete.
    let shutdown_registry = registry.clone();
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
        shutdown_registry.shutdown().await;
    };

    server.run(shutdown).await?;

    registry.shutdown().await;
    if let Err(e) = cleanup.await {
        warn!(error = %e, "cleanup loop ended abnormally");
    }
    info!("shellmux stopped");
    Ok(())
}
