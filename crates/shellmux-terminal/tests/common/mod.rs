use std::sync::Arc;
use std::time::Duration;

use shellmux_terminal::{OutputSubscription, RegistryConfig, SessionRegistry};
use shellmux_types::{SessionId, SessionSnapshot};
use tokio::time::Instant;

/// Registry with a small, fast configuration for tests
pub fn test_registry(config: RegistryConfig) -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(config))
}

pub fn fast_config() -> RegistryConfig {
    RegistryConfig {
        max_sessions: 4,
        idle_timeout: Duration::from_secs(60),
        cleanup_interval: Duration::from_secs(60),
        queue_capacity: 64,
        ..RegistryConfig::default()
    }
}

/// Read from `sub` until the accumulated output contains `needle`
pub async fn read_until(sub: &OutputSubscription, needle: &str, limit: Duration) -> String {
    let deadline = Instant::now() + limit;
    let mut collected = String::new();
    while !collected.contains(needle) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, sub.recv()).await {
            Ok(Some(delivery)) => collected.push_str(&String::from_utf8_lossy(&delivery.data)),
            Ok(None) | Err(_) => break,
        }
    }
    collected.replace("\r\n", "\n")
}

/// Everything the subscription yields until it ends, or until `limit`
pub async fn read_to_end(sub: &OutputSubscription, limit: Duration) -> String {
    let deadline = Instant::now() + limit;
    let mut collected = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, sub.recv()).await {
            Ok(Some(delivery)) => collected.extend_from_slice(&delivery.data),
            Ok(None) | Err(_) => break,
        }
    }
    String::from_utf8_lossy(&collected).replace("\r\n", "\n")
}

/// Poll until the session's process is reported gone
pub async fn wait_for_exit(registry: &SessionRegistry, id: SessionId) -> SessionSnapshot {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = registry.get(id).await.expect("session should still be registered");
        if !snapshot.alive || Instant::now() >= deadline {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
