use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("No usable provider found. Set one of:\n\
- ANTHROPIC_API_KEY (+ optional ANTHROPIC_MODEL)\n\
- OLLAMA_MODEL (+ optional OLLAMA_HOST)\n\
- GROQ_API_KEY and GROQ_MODEL\n\
- OPENROUTER_API_KEY and OPENROUTER_MODEL\n\
- OPENAI_API_KEY and OPENAI_MODEL\n\
Optionally set TACTICLOOPS_PROVIDER_ORDER.")]
    NotConfigured,

    #[error("missing {0}")]
    MissingKey(&'static str),

    #[error("invalid header: {0}")]
    Header(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider {provider} returned {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("invalid chat response: {0}")]
    Response(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResult {
    pub provider: String,
    pub model: String,
    pub content: String,
    pub raw: Value,
}

/// Per-request knobs.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout: Duration,
    /// Overrides the provider's model env var when set.
    pub model: Option<String>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            temperature: 0.2,
            timeout: Duration::from_secs(60),
            model: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    /// `POST <base>/chat/completions`
    OpenAi,
    /// `POST <base>/v1/messages`
    Anthropic,
}

#[derive(Debug, Clone)]
struct Provider {
    name: &'static str,
    base_url: String,
    api_key_env: Option<&'static str>,
    model_env: &'static str,
    default_model: Option<&'static str>,
    wire: Wire,
}

fn env_url(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
        .trim_end_matches('/')
        .to_string()
}

fn providers_from_env() -> Vec<Provider> {
    vec![
        Provider {
            name: "anthropic",
            base_url: env_url("ANTHROPIC_BASE_URL", "https://api.anthropic.com"),
            api_key_env: Some("ANTHROPIC_API_KEY"),
            model_env: "ANTHROPIC_MODEL",
            default_model: Some("claude-3-5-haiku-latest"),
            wire: Wire::Anthropic,
        },
        Provider {
            name: "ollama",
            base_url: format!("{}/v1", env_url("OLLAMA_HOST", "http://localhost:11434")),
            api_key_env: None,
            model_env: "OLLAMA_MODEL",
            default_model: None,
            wire: Wire::OpenAi,
        },
        Provider {
            name: "groq",
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key_env: Some("GROQ_API_KEY"),
            model_env: "GROQ_MODEL",
            default_model: None,
            wire: Wire::OpenAi,
        },
        Provider {
            name: "openrouter",
            base_url: env_url("OPENROUTER_BASE_URL", "https://openrouter.ai/api/v1"),
            api_key_env: Some("OPENROUTER_API_KEY"),
            model_env: "OPENROUTER_MODEL",
            default_model: None,
            wire: Wire::OpenAi,
        },
        Provider {
            name: "openai",
            base_url: env_url("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            api_key_env: Some("OPENAI_API_KEY"),
            model_env: "OPENAI_MODEL",
            default_model: None,
            wire: Wire::OpenAi,
        },
    ]
}

fn provider_order() -> Vec<String> {
    if let Ok(v) = std::env::var("TACTICLOOPS_PROVIDER_ORDER") {
        let v = v.trim().to_string();
        if !v.is_empty() {
            return v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
    vec![
        "anthropic".into(),
        "ollama".into(),
        "groq".into(),
        "openrouter".into(),
    ]
}

fn env_nonempty(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .as_deref()
        .unwrap_or("")
        .trim()
        .len()
        > 0
}

pub(crate) fn has_any_llm_key() -> bool {
    ["ANTHROPIC_API_KEY", "OPENROUTER_API_KEY", "OPENAI_API_KEY", "GROQ_API_KEY"]
        .iter()
        .any(|k| env_nonempty(k))
}

async fn is_ollama_reachable(base_url: &str, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(_) => return false,
    };
    let host = base_url.strip_suffix("/v1").unwrap_or(base_url);
    let candidates = [format!("{host}/v1/models"), format!("{host}/api/tags")];
    for u in candidates {
        if let Ok(resp) = client.get(u).send().await {
            // Any of these means something is listening.
            if matches!(resp.status().as_u16(), 200 | 401 | 404) {
                return true;
            }
        }
    }
    false
}

async fn select_provider(
    model_override: Option<&str>,
    timeout: Duration,
) -> Result<(Provider, String), LlmError> {
    let provs = providers_from_env();
    for name in provider_order() {
        let Some(p) = provs.iter().find(|pp| pp.name == name).cloned() else {
            continue;
        };
        if let Some(k) = p.api_key_env {
            if !env_nonempty(k) {
                continue;
            }
        }
        let model = model_override
            .map(str::to_string)
            .filter(|m| !m.trim().is_empty())
            .or_else(|| std::env::var(p.model_env).ok().filter(|m| !m.trim().is_empty()))
            .or_else(|| p.default_model.map(str::to_string));
        let Some(model) = model else {
            continue;
        };
        if p.name == "ollama" && !is_ollama_reachable(&p.base_url, timeout).await {
            continue;
        }
        return Ok((p, model.trim().to_string()));
    }
    Err(LlmError::NotConfigured)
}

fn bearer_headers(provider: &Provider) -> Result<reqwest::header::HeaderMap, LlmError> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        reqwest::header::HeaderValue::from_static("application/json"),
    );
    if let Some(k) = provider.api_key_env {
        let key = std::env::var(k).ok().unwrap_or_default();
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(LlmError::MissingKey(k));
        }
        match provider.wire {
            Wire::Anthropic => {
                let hv = reqwest::header::HeaderValue::from_str(&key)
                    .map_err(|e| LlmError::Header(e.to_string()))?;
                headers.insert("x-api-key", hv);
                headers.insert(
                    "anthropic-version",
                    reqwest::header::HeaderValue::from_static("2023-06-01"),
                );
            }
            Wire::OpenAi => {
                let hv = reqwest::header::HeaderValue::from_str(&format!("Bearer {key}"))
                    .map_err(|e| LlmError::Header(e.to_string()))?;
                headers.insert(reqwest::header::AUTHORIZATION, hv);
            }
        }
    }
    if provider.name == "openrouter" {
        for (env, header) in [("OPENROUTER_SITE_URL", "HTTP-Referer"), ("OPENROUTER_APP_NAME", "X-Title")] {
            let v = std::env::var(env).ok().unwrap_or_default();
            let v = v.trim();
            if !v.is_empty() {
                if let Ok(hv) = reqwest::header::HeaderValue::from_str(v) {
                    headers.insert(header, hv);
                }
            }
        }
    }
    Ok(headers)
}

fn request_payload(provider: &Provider, model: &str, system: &str, user: &str, opts: &ChatOptions) -> Value {
    match provider.wire {
        Wire::Anthropic => serde_json::json!({
            "model": model,
            "max_tokens": opts.max_tokens,
            "temperature": opts.temperature,
            "system": [
                { "type": "text", "text": system, "cache_control": { "type": "ephemeral" } }
            ],
            "messages": [ { "role": "user", "content": user } ]
        }),
        Wire::OpenAi => serde_json::json!({
            "model": model,
            "max_tokens": opts.max_tokens,
            "temperature": opts.temperature,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ]
        }),
    }
}

/// Pull the assistant text out of either wire format.
fn response_text(wire: Wire, raw: &Value) -> Result<String, LlmError> {
    match wire {
        Wire::Anthropic => {
            let blocks = raw
                .get("content")
                .and_then(|v| v.as_array())
                .ok_or_else(|| LlmError::Response("missing content".to_string()))?;
            Ok(blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(""))
        }
        Wire::OpenAi => raw
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.as_object())
            .map(|m| {
                m.get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            })
            .ok_or_else(|| LlmError::Response("missing choices[0].message".to_string())),
    }
}

/// One-shot chat completion with provider selection from the environment.
///
/// Invariants (should not change lightly):
/// - OpenAI-compatible providers: `POST <base_url>/chat/completions`, `Authorization: Bearer`
/// - anthropic: `POST <base_url>/v1/messages`, `x-api-key`, system prompt marked cacheable
pub async fn chat_completion(
    system: &str,
    user: &str,
    opts: &ChatOptions,
) -> Result<ChatCompletionResult, LlmError> {
    let (provider, model) = select_provider(opts.model.as_deref(), Duration::from_secs(3)).await?;
    let headers = bearer_headers(&provider)?;
    let payload = request_payload(&provider, &model, system, user, opts);
    let url = match provider.wire {
        Wire::Anthropic => format!("{}/v1/messages", provider.base_url),
        Wire::OpenAi => format!("{}/chat/completions", provider.base_url),
    };

    let client = reqwest::Client::builder()
        .timeout(opts.timeout)
        .default_headers(headers)
        .build()?;
    tracing::debug!(provider = provider.name, %model, "chat completion request");
    let resp = client.post(url).json(&payload).send().await?;

    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        return Err(LlmError::Status {
            provider: provider.name.to_string(),
            status: status.as_u16(),
            body: text,
        });
    }
    let raw: Value = serde_json::from_str(&text)
        .map_err(|e| LlmError::Response(format!("invalid json: {e}")))?;
    let content = response_text(provider.wire, &raw)?;

    Ok(ChatCompletionResult {
        provider: provider.name.to_string(),
        model,
        content,
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{env_lock, EnvGuard};

    const KEYS: &[&str] = &[
        "TACTICLOOPS_PROVIDER_ORDER",
        "ANTHROPIC_API_KEY",
        "ANTHROPIC_MODEL",
        "OLLAMA_MODEL",
        "GROQ_API_KEY",
        "GROQ_MODEL",
        "OPENROUTER_API_KEY",
        "OPENROUTER_MODEL",
        "OPENAI_API_KEY",
        "OPENAI_MODEL",
    ];

    fn clear_all() {
        for k in KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn provider_order_default() {
        let _lock = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        let _g = EnvGuard::new(KEYS);
        std::env::remove_var("TACTICLOOPS_PROVIDER_ORDER");
        assert_eq!(
            provider_order(),
            vec![
                "anthropic".to_string(),
                "ollama".to_string(),
                "groq".to_string(),
                "openrouter".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn anthropic_uses_default_model_when_unset() {
        let _lock = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        let _g = EnvGuard::new(KEYS);
        clear_all();
        std::env::set_var("TACTICLOOPS_PROVIDER_ORDER", "anthropic");
        std::env::set_var("ANTHROPIC_API_KEY", "test_key");

        let (p, model) = select_provider(None, Duration::from_millis(10))
            .await
            .expect("expected provider");
        assert_eq!(p.name, "anthropic");
        assert_eq!(model, "claude-3-5-haiku-latest");
    }

    #[tokio::test]
    async fn model_override_wins_over_env() {
        let _lock = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        let _g = EnvGuard::new(KEYS);
        clear_all();
        std::env::set_var("TACTICLOOPS_PROVIDER_ORDER", "openai");
        std::env::set_var("OPENAI_API_KEY", "test_key");
        std::env::set_var("OPENAI_MODEL", "gpt-4o-mini");

        let (p, model) = select_provider(Some("gpt-4o"), Duration::from_millis(10))
            .await
            .expect("expected provider");
        assert_eq!(p.name, "openai");
        assert_eq!(model, "gpt-4o");
    }

    #[tokio::test]
    async fn select_provider_errors_when_unconfigured() {
        let _lock = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        let _g = EnvGuard::new(KEYS);
        clear_all();
        std::env::set_var("TACTICLOOPS_PROVIDER_ORDER", "anthropic,openrouter,openai,groq");

        let err = select_provider(None, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, LlmError::NotConfigured));
        assert!(err.to_string().contains("No usable provider found"));
    }

    #[test]
    fn response_text_reads_both_wires() {
        let a = serde_json::json!({"content": [{"type": "text", "text": "<tactic>simp</tactic>"}]});
        assert_eq!(response_text(Wire::Anthropic, &a).unwrap(), "<tactic>simp</tactic>");
        let o = serde_json::json!({"choices": [{"message": {"content": "omega"}}]});
        assert_eq!(response_text(Wire::OpenAi, &o).unwrap(), "omega");
        let bad = serde_json::json!({"choices": []});
        assert!(response_text(Wire::OpenAi, &bad).is_err());
    }
}
