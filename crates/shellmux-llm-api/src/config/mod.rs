use std::fmt;
use std::str::FromStr;

pub mod factory;
pub use factory::ClientFactory;

/// Backend type for assistance models
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    OpenAI,
    Groq,
    Llama,
}

impl BackendType {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Groq => "groq",
            Self::Llama => "llama",
        }
    }

    /// Environment variable consulted for the API key when none is given
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::OpenAI => Some("OPENAI_API_KEY"),
            Self::Groq => Some("GROQ_API_KEY"),
            Self::Llama => None,
        }
    }
}

impl FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "groq" => Ok(Self::Groq),
            "llama" | "llamacpp" | "llama.cpp" | "llama-cpp" => Ok(Self::Llama),
            other => Err(format!("unknown backend '{other}' (expected openai, groq or llama)")),
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default Groq API URL
pub const GROQ_API_URL: &str = "https://api.groq.com/openai/v1/chat/completions";

/// Default OpenAI API URL
pub const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Get the default URL for a given backend type
pub fn get_default_url_for_backend(backend: BackendType) -> Option<String> {
    match backend {
        BackendType::OpenAI => Some(OPENAI_API_URL.to_string()),
        BackendType::Groq => Some(GROQ_API_URL.to_string()),
        BackendType::Llama => None, // llama.cpp servers have no canonical URL
    }
}

/// A parsed `model@backend(url)` model spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub model: String,
    pub backend: Option<BackendType>,
    pub api_url: Option<String>,
}

impl ModelSpec {
    /// Backend to use: the explicit one, else llama for a bare URL, else OpenAI
    pub fn resolved_backend(&self) -> BackendType {
        match (self.backend, &self.api_url) {
            (Some(backend), _) => backend,
            (None, Some(_)) => BackendType::Llama,
            (None, None) => BackendType::OpenAI,
        }
    }
}

/// Parse a model spec in format "model@backend(api_url)", "model@backend" or "model".
///
/// Only the first `@` separates model from backend, so model names may not
/// contain one but URLs may.
pub fn parse_model_spec(spec: &str) -> Result<ModelSpec, String> {
    let spec = spec.trim();
    let (model, backend_part) = match spec.split_once('@') {
        Some((model, rest)) => (model, Some(rest)),
        None => (spec, None),
    };

    if model.is_empty() {
        return Err(format!("model spec '{spec}' has no model name"));
    }

    let mut backend = None;
    let mut api_url = None;
    if let Some(backend_part) = backend_part {
        let backend_name = match backend_part.find('(') {
            Some(pos) => {
                let url = backend_part[pos + 1..]
                    .strip_suffix(')')
                    .ok_or_else(|| format!("model spec '{spec}' is missing a closing parenthesis"))?;
                if url.is_empty() {
                    return Err(format!("model spec '{spec}' has an empty URL"));
                }
                api_url = Some(url.to_string());
                &backend_part[..pos]
            }
            None => backend_part,
        };
        if !backend_name.is_empty() {
            backend = Some(backend_name.parse()?);
        }
    }

    Ok(ModelSpec {
        model: model.to_string(),
        backend,
        api_url,
    })
}

/// Normalize API URL by ensuring it has the correct path for OpenAI-compatible endpoints
pub fn normalize_api_url(url: &str) -> String {
    // If URL already contains a path with "completions", use it as-is
    if url.contains("/completions") {
        return url.to_string();
    }

    let base = url.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}
