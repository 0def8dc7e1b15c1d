use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Pass-through parameters for a model call. Unset fields are left to the
/// provider's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Endpoint override, e.g. `http://localhost:8000/v1`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_retries: Option<u32>,
    /// Extra fields copied verbatim into the request body.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ModelParams {
    /// Field-wise merge: values set in `overrides` win.
    pub fn merged(&self, overrides: &ModelParams) -> ModelParams {
        let mut extra = self.extra.clone();
        extra.extend(overrides.extra.clone());
        ModelParams {
            temperature: overrides.temperature.or(self.temperature),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            top_p: overrides.top_p.or(self.top_p),
            timeout_secs: overrides.timeout_secs.or(self.timeout_secs),
            api_base: overrides.api_base.clone().or_else(|| self.api_base.clone()),
            api_key: overrides.api_key.clone().or_else(|| self.api_key.clone()),
            num_retries: overrides.num_retries.or(self.num_retries),
            extra,
        }
    }
}

/// One call to the model-call collaborator.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub params: &'a ModelParams,
}

/// Opaque transport to a language model: messages in, text out.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<String>;
}

/// OpenAI-compatible chat completions client.
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl LlmClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }

    pub fn from_env() -> Result<Self> {
        let base_url = dotenv::var("RLM_API_BASE")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = dotenv::var("RLM_API_KEY")
            .or_else(|_| dotenv::var("OPENAI_API_KEY"))
            .ok()
            .filter(|k| !k.is_empty());
        Self::new(base_url, api_key)
    }

    /// Resolve the chat completions endpoint from the base URL.
    fn endpoint(base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        }
    }

    fn body(request: &ModelRequest<'_>) -> serde_json::Value {
        let params = request.params;
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
        });
        if let Some(obj) = body.as_object_mut() {
            if let Some(t) = params.temperature {
                obj.insert("temperature".into(), t.into());
            }
            if let Some(n) = params.max_tokens {
                obj.insert("max_tokens".into(), n.into());
            }
            if let Some(p) = params.top_p {
                obj.insert("top_p".into(), p.into());
            }
            for (k, v) in &params.extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        body
    }

    async fn send_once(&self, request: &ModelRequest<'_>) -> Result<String> {
        let base = request.params.api_base.as_deref().unwrap_or(&self.base_url);
        let mut req = self
            .client
            .post(Self::endpoint(base))
            .json(&Self::body(request));
        if let Some(key) = request.params.api_key.as_ref().or(self.api_key.as_ref()) {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        if let Some(secs) = request.params.timeout_secs {
            req = req.timeout(Duration::from_secs(secs));
        }

        let resp = req.send().await.context("LLM request failed")?;
        let status = resp.status();
        let text = resp.text().await.context("Failed to read LLM response")?;
        if !status.is_success() {
            anyhow::bail!("LLM returned {}: {}", status, text);
        }
        let json: serde_json::Value =
            serde_json::from_str(&text).context("Failed to parse LLM JSON")?;

        // choices[0].message.content may be null
        let content = json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .unwrap_or("")
            .to_string();

        Ok(content)
    }
}

#[async_trait]
impl ModelClient for LlmClient {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<String> {
        let retries = request.params.num_retries.unwrap_or(0);
        let mut attempt = 0;
        loop {
            match self.send_once(&request).await {
                Ok(content) => {
                    debug!(model = request.model, len = content.len(), "LLM call complete");
                    return Ok(content);
                }
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(model = request.model, attempt, "LLM call failed, retrying: {:#}", e);
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// A request as seen by [`ScriptedModel`].
    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        pub model: String,
        pub messages: Vec<Message>,
        pub params: ModelParams,
    }

    /// Replies with canned responses in order, repeating the last one once
    /// the script runs out. Records every request.
    pub struct ScriptedModel {
        script: Mutex<VecDeque<String>>,
        last: Mutex<String>,
        pub calls: Mutex<Vec<RecordedCall>>,
    }

    impl ScriptedModel {
        pub fn new<I, S>(responses: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                script: Mutex::new(responses.into_iter().map(Into::into).collect()),
                last: Mutex::new(String::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn complete(&self, request: ModelRequest<'_>) -> Result<String> {
            self.calls.lock().unwrap().push(RecordedCall {
                model: request.model.to_string(),
                messages: request.messages.to_vec(),
                params: request.params.clone(),
            });
            let next = self.script.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            if let Some(next) = next {
                *last = next;
            }
            Ok(last.clone())
        }
    }

    /// Always fails, for exercising collaborator faults.
    pub struct FailingModel;

    #[async_trait]
    impl ModelClient for FailingModel {
        async fn complete(&self, _request: ModelRequest<'_>) -> Result<String> {
            anyhow::bail!("connection refused")
        }
    }
}
