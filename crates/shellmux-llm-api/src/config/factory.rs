use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::client::{LlmClient, OpenAiCompatClient};
use crate::config::{get_default_url_for_backend, normalize_api_url, parse_model_spec, BackendType};
use crate::request_logger::RequestLogger;

/// Client factory for creating LLM clients
pub struct ClientFactory;

impl ClientFactory {
    /// Create an LLM client based on the specified backend type
    ///
    /// # Arguments
    /// * `backend` - The backend type to use (OpenAI, Groq, Llama)
    /// * `api_key` - API key; falls back to the backend's environment variable
    /// * `model` - Model name to use
    /// * `api_url` - Optional custom API URL (required for llama.cpp)
    /// * `name` - Label used in logs
    pub fn create(
        backend: BackendType,
        api_key: Option<String>,
        model: String,
        api_url: Option<String>,
        name: &str,
    ) -> Result<OpenAiCompatClient> {
        let url = match api_url {
            Some(url) => normalize_api_url(&url),
            None => get_default_url_for_backend(backend)
                .with_context(|| format!("{backend} backend requires an explicit URL, e.g. model@llama(http://localhost:8080)"))?,
        };

        let key = api_key
            .or_else(|| backend.api_key_env().and_then(|var| env::var(var).ok()))
            .unwrap_or_default();

        debug!(client = name, %backend, %url, %model, "creating assistance client");
        Ok(OpenAiCompatClient::new(name, url, key, model))
    }

    /// Create a client from a `model@backend(url)` spec
    pub fn from_spec(
        spec: &str,
        api_key: Option<String>,
        name: &str,
        logger: Option<RequestLogger>,
    ) -> Result<Arc<dyn LlmClient>> {
        let parsed = parse_model_spec(spec).map_err(anyhow::Error::msg)?;
        let backend = parsed.resolved_backend();

        let client = Self::create(backend, api_key, parsed.model, parsed.api_url, name)?;
        Ok(match logger {
            Some(logger) => Arc::new(client.with_logger(logger)),
            None => Arc::new(client),
        })
    }
}
