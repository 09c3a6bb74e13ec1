use crate::config::{
    get_default_url_for_backend, normalize_api_url, parse_model_spec, BackendType, ModelSpec,
    GROQ_API_URL, OPENAI_API_URL,
};
use crate::safe_truncate;
use pretty_assertions::assert_eq;

#[test]
fn test_parse_model_full_format() {
    let spec = parse_model_spec("llama3@llama(http://localhost:8080)").unwrap();

    assert_eq!(
        spec,
        ModelSpec {
            model: "llama3".to_string(),
            backend: Some(BackendType::Llama),
            api_url: Some("http://localhost:8080".to_string()),
        }
    );
}

#[test]
fn test_parse_model_backend_only() {
    let spec = parse_model_spec("gpt-4o@openai").unwrap();

    assert_eq!(spec.model, "gpt-4o");
    assert_eq!(spec.backend, Some(BackendType::OpenAI));
    assert_eq!(spec.api_url, None); // URL should be None for backend-only format
}

#[test]
fn test_parse_model_only() {
    let spec = parse_model_spec("gpt-4o-mini").unwrap();

    assert_eq!(spec.model, "gpt-4o-mini");
    assert_eq!(spec.backend, None);
    assert_eq!(spec.resolved_backend(), BackendType::OpenAI);
}

#[test]
fn test_parse_model_url_without_backend_name() {
    let spec = parse_model_spec("qwen@(http://10.0.0.2:8000/v1)").unwrap();

    assert_eq!(spec.backend, None);
    assert_eq!(spec.api_url.as_deref(), Some("http://10.0.0.2:8000/v1"));
    assert_eq!(spec.resolved_backend(), BackendType::Llama);
}

#[test]
fn test_parse_model_url_containing_at_sign() {
    let spec = parse_model_spec("m@llama(http://user@host:8080)").unwrap();
    assert_eq!(spec.api_url.as_deref(), Some("http://user@host:8080"));
}

#[test]
fn test_parse_model_errors() {
    assert!(parse_model_spec("@groq").is_err());
    assert!(parse_model_spec("m@nonsense").is_err());
    assert!(parse_model_spec("m@llama(http://localhost").is_err());
    assert!(parse_model_spec("m@llama()").is_err());
}

#[test]
fn test_backend_aliases() {
    assert_eq!("GROQ".parse::<BackendType>(), Ok(BackendType::Groq));
    assert_eq!("llama.cpp".parse::<BackendType>(), Ok(BackendType::Llama));
    assert_eq!(BackendType::OpenAI.to_string(), "openai");
}

#[test]
fn test_default_urls() {
    assert_eq!(get_default_url_for_backend(BackendType::OpenAI).as_deref(), Some(OPENAI_API_URL));
    assert_eq!(get_default_url_for_backend(BackendType::Groq).as_deref(), Some(GROQ_API_URL));
    assert_eq!(get_default_url_for_backend(BackendType::Llama), None);
}

#[test]
fn test_normalize_api_url() {
    assert_eq!(normalize_api_url("http://localhost:8080"), "http://localhost:8080/v1/chat/completions");
    assert_eq!(normalize_api_url("http://localhost:8080/"), "http://localhost:8080/v1/chat/completions");
    assert_eq!(normalize_api_url("http://localhost:8080/v1"), "http://localhost:8080/v1/chat/completions");
    assert_eq!(normalize_api_url(OPENAI_API_URL), OPENAI_API_URL);
}

#[test]
fn test_safe_truncate_respects_char_boundaries() {
    assert_eq!(safe_truncate("short", 10), "short");
    assert_eq!(safe_truncate("ééééééé", 5), "éé...");
}
