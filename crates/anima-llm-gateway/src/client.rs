//! Raw HTTP bindings to the Ollama backend: chat, embed, availability.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use anima_types::config::OllamaConfig;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    num_predict: u32,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

/// Pooled HTTP client bound to one Ollama server.
#[derive(Debug)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    chat_model: String,
    embed_model: String,
}

impl OllamaClient {
    /// Build a client with a connection pool and the configured per-request
    /// timeout.
    pub fn new(cfg: &OllamaConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_sec))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            chat_model: cfg.strategy_model.clone(),
            embed_model: cfg.embed_model.clone(),
        })
    }

    /// One chat completion. Errors carry the transport or status failure for
    /// the retry layer to classify.
    pub async fn chat_raw(&self, prompt: &str, system: &str) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if !system.is_empty() {
            messages.push(ChatMessage { role: "system", content: system });
        }
        messages.push(ChatMessage { role: "user", content: prompt });

        let request = ChatRequest {
            model: &self.chat_model,
            messages,
            stream: false,
            options: ChatOptions { num_predict: 512 },
        };

        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .context("chat connection failed")?
            .error_for_status()
            .context("chat request rejected")?;

        let parsed: ChatResponse = response.json().await.context("chat response malformed")?;
        Ok(parsed.message.content)
    }

    /// One embedding. Returns an empty vector when the backend answers with
    /// no embeddings.
    pub async fn embed_raw(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbedRequest { model: &self.embed_model, input: text };
        let response = self
            .http
            .post(format!("{}/api/embed", self.base_url))
            .json(&request)
            .send()
            .await
            .context("embed connection failed")?
            .error_for_status()
            .context("embed request rejected")?;

        let parsed: EmbedResponse = response.json().await.context("embed response malformed")?;
        Ok(parsed.embeddings.into_iter().next().unwrap_or_default())
    }

    /// Cheap availability probe against the model listing endpoint.
    pub async fn ping(&self) -> bool {
        match self.http.get(format!("{}/api/tags", self.base_url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
