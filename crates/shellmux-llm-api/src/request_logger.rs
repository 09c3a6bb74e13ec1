use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::safe_truncate;

/// Longest body written to a single log file
const MAX_LOGGED_CHARS: usize = 20_000;

/// Writes each assistance request and response to its own timestamped file.
/// A debug aid for provider issues; failures are reported to the caller and
/// never affect the request itself.
#[derive(Debug, Clone)]
pub struct RequestLogger {
    dir: PathBuf,
    sequence: Arc<AtomicU64>,
}

impl RequestLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        Ok(Self {
            dir,
            sequence: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Log an outgoing request body
    pub fn log_request(&self, client: &str, url: &str, body: &serde_json::Value) -> Result<PathBuf> {
        let pretty = serde_json::to_string_pretty(body).context("Failed to serialize request")?;

        let mut log_content = String::new();
        log_content.push_str("HTTP REQUEST LOG\n");
        log_content.push_str("================\n\n");
        log_content.push_str(&format!("Timestamp: {}\n", Utc::now().to_rfc3339()));
        log_content.push_str(&format!("Client: {client}\n"));
        log_content.push_str(&format!("URL: {url}\n\n"));
        log_content.push_str("Request Body:\n");
        log_content.push_str(&safe_truncate(&pretty, MAX_LOGGED_CHARS));
        log_content.push('\n');

        self.write("req", client, &log_content)
    }

    /// Log a response body, or the accumulated text of a stream
    pub fn log_response(&self, client: &str, body: &str) -> Result<PathBuf> {
        let mut log_content = String::new();
        log_content.push_str("HTTP RESPONSE LOG\n");
        log_content.push_str("=================\n\n");
        log_content.push_str(&format!("Timestamp: {}\n", Utc::now().to_rfc3339()));
        log_content.push_str(&format!("Client: {client}\n\n"));
        log_content.push_str(&safe_truncate(body, MAX_LOGGED_CHARS));
        log_content.push('\n');

        self.write("resp", client, &log_content)
    }

    fn write(&self, kind: &str, client: &str, content: &str) -> Result<PathBuf> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let filename = format!(
            "{kind}-{}-{sequence:04}-{}.txt",
            Utc::now().format("%Y%m%dT%H%M%S"),
            client.replace(['/', ' '], "-")
        );
        let path = self.dir.join(filename);
        fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}
