//! Message generators used by daily check-ins and high-urgency nudges.

use async_trait::async_trait;
use nudgeclaw_core::config::GeneratorConfig;
use nudgeclaw_core::error::{NudgeClawError, Result};
use nudgeclaw_core::traits::MessageGenerator;
use serde_json::{Value, json};

const SYSTEM_PROMPT: &str = "You are a friendly personal assistant. Reply with a single short \
message addressed directly to the user. No preamble, no quotes.";

/// Generator for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiGenerator {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn from_config(config: &GeneratorConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_secs))
                .build()
                .unwrap_or_default(),
        }
    }

    fn extract_text(body: &Value) -> Option<String> {
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

#[async_trait]
impl MessageGenerator for OpenAiGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, owner_id: &str, prompt_hint: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(&url).json(&json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt_hint},
            ],
            "user": owner_id,
            "max_tokens": 200,
        }));
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| NudgeClawError::Http(format!("generator request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NudgeClawError::Generation(format!("API error {status}: {body}")));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| NudgeClawError::Generation(format!("bad response body: {e}")))?;
        Self::extract_text(&body)
            .ok_or_else(|| NudgeClawError::Generation("empty completion".into()))
    }
}

/// Fixed-text generator used when no model is configured.
pub struct StaticGenerator {
    text: String,
}

impl StaticGenerator {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }
}

impl Default for StaticGenerator {
    fn default() -> Self {
        Self::new("👋 Hi! Just checking in. How is your day going?")
    }
}

#[async_trait]
impl MessageGenerator for StaticGenerator {
    fn name(&self) -> &str {
        "static"
    }

    async fn generate(&self, _owner_id: &str, _prompt_hint: &str) -> Result<String> {
        Ok(self.text.clone())
    }
}
