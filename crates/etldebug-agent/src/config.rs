//! Configuration resolution.
//!
//! Every setting resolves the same way:
//! 1) explicit value (CLI flag)
//! 2) environment variable
//! 3) built-in default
//!
//! An environment variable that is set but empty counts as unset. A value
//! that does not parse is an error, never silently replaced by the default.

use std::time::Duration;

pub const DEFAULT_MODEL: &str = "qwen2.5-coder:7b";
pub const DEFAULT_DIAGNOSE_MAX_STEPS: usize = 10;
pub const DEFAULT_EVAL_MAX_STEPS: usize = 15;
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_OBSERVATION_CHARS: usize = 4000;
pub const DEFAULT_OLLAMA_HOST: &str = "http://127.0.0.1:11434";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";

pub const ETLDEBUG_BACKEND_ENV: &str = "ETLDEBUG_BACKEND";
pub const ETLDEBUG_MODEL_ENV: &str = "ETLDEBUG_MODEL";
pub const ETLDEBUG_MAX_STEPS_ENV: &str = "ETLDEBUG_MAX_STEPS";
pub const ETLDEBUG_LLM_TIMEOUT_SECS_ENV: &str = "ETLDEBUG_LLM_TIMEOUT_SECS";
pub const ETLDEBUG_MAX_OBSERVATION_CHARS_ENV: &str = "ETLDEBUG_MAX_OBSERVATION_CHARS";
pub const OLLAMA_HOST_ENV: &str = "OLLAMA_HOST";
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const OPENAI_BASE_URL_ENV: &str = "OPENAI_BASE_URL";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {name}={value:?} (expected {expected})")]
    Invalid {
        name: String,
        value: String,
        expected: String,
    },
    #[error("failed to read {name}: {message}")]
    Unreadable { name: String, message: String },
    #[error("{0}")]
    Missing(String),
}

/// Non-empty, trimmed value of `name`, if set.
pub fn env_value(name: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.trim();
            Ok((!v.is_empty()).then(|| v.to_string()))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::Unreadable {
            name: name.to_string(),
            message: e.to_string(),
        }),
    }
}

fn parse_usize(name: &str, raw: &str) -> Result<usize, ConfigError> {
    raw.parse::<usize>().map_err(|_| ConfigError::Invalid {
        name: name.to_string(),
        value: raw.to_string(),
        expected: "non-negative integer".to_string(),
    })
}

pub fn resolve_model(flag: Option<&str>) -> Result<String, ConfigError> {
    if let Some(m) = flag.map(str::trim).filter(|m| !m.is_empty()) {
        return Ok(m.to_string());
    }
    Ok(env_value(ETLDEBUG_MODEL_ENV)?.unwrap_or_else(|| DEFAULT_MODEL.to_string()))
}

/// Step ceiling for one session; never below 1.
pub fn resolve_max_steps(flag: Option<usize>, default: usize) -> Result<usize, ConfigError> {
    let steps = match flag {
        Some(n) => n,
        None => match env_value(ETLDEBUG_MAX_STEPS_ENV)? {
            Some(raw) => parse_usize(ETLDEBUG_MAX_STEPS_ENV, &raw)?,
            None => default,
        },
    };
    Ok(steps.max(1))
}

/// Per-request timeout for model calls. `0` disables the timeout.
pub fn llm_timeout(flag_secs: Option<u64>) -> Result<Option<Duration>, ConfigError> {
    let secs = match flag_secs {
        Some(v) => v,
        None => match env_value(ETLDEBUG_LLM_TIMEOUT_SECS_ENV)? {
            Some(raw) => raw.parse::<u64>().map_err(|_| ConfigError::Invalid {
                name: ETLDEBUG_LLM_TIMEOUT_SECS_ENV.to_string(),
                value: raw.clone(),
                expected: "integer seconds; 0 disables".to_string(),
            })?,
            None => DEFAULT_LLM_TIMEOUT_SECS,
        },
    };
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}

/// Cap on a single tool observation appended to the conversation (min 200).
pub fn max_observation_chars() -> Result<usize, ConfigError> {
    Ok(match env_value(ETLDEBUG_MAX_OBSERVATION_CHARS_ENV)? {
        Some(raw) => parse_usize(ETLDEBUG_MAX_OBSERVATION_CHARS_ENV, &raw)?.max(200),
        None => DEFAULT_MAX_OBSERVATION_CHARS,
    })
}

pub fn normalize_ollama_host(host: &str) -> String {
    let mut host = host.trim().to_string();
    if host.is_empty() {
        // IPv4 loopback: `localhost` may resolve to ::1 where Ollama is not listening.
        host = DEFAULT_OLLAMA_HOST.to_string();
    }
    if !host.starts_with("http://") && !host.starts_with("https://") {
        host = format!("http://{host}");
    }
    host.trim_end_matches('/').to_string()
}

pub fn resolve_ollama_host(flag: Option<&str>) -> Result<String, ConfigError> {
    let raw = match flag.map(str::trim).filter(|h| !h.is_empty()) {
        Some(h) => h.to_string(),
        None => env_value(OLLAMA_HOST_ENV)?.unwrap_or_default(),
    };
    Ok(normalize_ollama_host(&raw))
}

pub fn resolve_openai_base_url(flag: Option<&str>) -> Result<String, ConfigError> {
    let raw = match flag.map(str::trim).filter(|h| !h.is_empty()) {
        Some(h) => h.to_string(),
        None => env_value(OPENAI_BASE_URL_ENV)?
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
    };
    Ok(raw.trim_end_matches('/').to_string())
}

pub fn openai_api_key() -> Result<Option<String>, ConfigError> {
    env_value(OPENAI_API_KEY_ENV)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_values_win() {
        assert_eq!(resolve_model(Some(" llama3 ")).expect("model"), "llama3");
        assert_eq!(resolve_max_steps(Some(3), 10).expect("steps"), 3);
        assert_eq!(resolve_max_steps(Some(0), 10).expect("steps"), 1);
        assert_eq!(
            llm_timeout(Some(5)).expect("timeout"),
            Some(Duration::from_secs(5))
        );
        assert_eq!(llm_timeout(Some(0)).expect("timeout"), None);
    }

    #[test]
    fn normalizes_hosts() {
        assert_eq!(normalize_ollama_host(""), "http://127.0.0.1:11434");
        assert_eq!(normalize_ollama_host("gpu-box:11434/"), "http://gpu-box:11434");
        assert_eq!(
            normalize_ollama_host("https://ollama.internal"),
            "https://ollama.internal"
        );
        assert_eq!(
            resolve_openai_base_url(Some("http://localhost:8080/")).expect("url"),
            "http://localhost:8080"
        );
    }

    #[test]
    fn invalid_numbers_are_errors() {
        let err = parse_usize(ETLDEBUG_MAX_STEPS_ENV, "ten").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid ETLDEBUG_MAX_STEPS=\"ten\" (expected non-negative integer)"
        );
    }
}
