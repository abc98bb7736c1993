// llm.rs — LLM Oracle client (spec.md §6.2).
//
// Grounded on the teacher's LiveExchange::post_info/post_exchange wrapper
// methods: build request, send, map network errors, inspect the response
// body for embedded error fields before handing back the payload.

use crate::error::LlmError;
use async_trait::async_trait;
use serde_json::json;

#[async_trait]
pub trait LlmOracle: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

pub struct HttpLlmOracle {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl HttpLlmOracle {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            api_key: api_key.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }
}

/// Accepts a `baseUrl` with or without a trailing `/v1` or
/// `/chat/completions` and normalizes to a bare root.
fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/chat/completions").unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("/v1").unwrap_or(trimmed);
    trimmed.to_string()
}

#[async_trait]
impl LlmOracle for HttpLlmOracle {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let payload = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| LlmError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(LlmError::Http { status: status.as_u16(), body: text });
        }

        let data: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| LlmError::Network(e.to_string()))?;

        data["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::Network("response missing choices[0].message.content".to_string()))
    }
}

/// Test double that always returns a fixed reply, regardless of prompt.
pub struct FixedReplyOracle {
    pub reply: String,
}

impl FixedReplyOracle {
    pub fn new(reply: impl Into<String>) -> Self {
        Self { reply: reply.into() }
    }
}

#[async_trait]
impl LlmOracle for FixedReplyOracle {
    async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
        Ok(self.reply.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_base_url_with_trailing_v1() {
        assert_eq!(normalize_base_url("https://api.example.com/v1"), "https://api.example.com");
    }

    #[test]
    fn normalizes_base_url_with_full_endpoint() {
        assert_eq!(
            normalize_base_url("https://api.example.com/v1/chat/completions"),
            "https://api.example.com"
        );
    }

    #[test]
    fn normalizes_bare_base_url_unchanged() {
        assert_eq!(normalize_base_url("https://api.example.com"), "https://api.example.com");
    }

    #[test]
    fn normalizes_trailing_slash() {
        assert_eq!(normalize_base_url("https://api.example.com/"), "https://api.example.com");
    }

    #[tokio::test]
    async fn fixed_reply_oracle_ignores_prompt() {
        let oracle = FixedReplyOracle::new("hold steady");
        assert_eq!(oracle.complete("anything").await.unwrap(), "hold steady");
        assert_eq!(oracle.complete("something else").await.unwrap(), "hold steady");
    }
}
