//! Text generation capability and its Ollama implementation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use super::retry::Retryable;
use crate::config::OllamaConfig;
use crate::error::ErrorKind;
use crate::model::Tone;

#[derive(Debug, Clone)]
pub struct TextRequest {
    pub prompt: String,
    pub tone: Tone,
    pub max_tokens: u32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TextGenError {
    #[error("text provider rate limited")]
    RateLimited,

    #[error("text provider timed out")]
    Timeout,

    #[error("text provider rejected the prompt: {0}")]
    ContentRejected(String),

    #[error("text provider unavailable: {0}")]
    Unavailable(String),

    #[error("text provider returned an unusable response: {0}")]
    InvalidResponse(String),
}

impl TextGenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ContentRejected(_) => ErrorKind::ContentInvalid,
            _ => ErrorKind::Transient,
        }
    }
}

impl Retryable for TextGenError {
    fn is_transient(&self) -> bool {
        self.kind().is_retryable()
    }

    fn timed_out() -> Self {
        Self::Timeout
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &TextRequest) -> Result<String, TextGenError>;

    fn provider_name(&self) -> &str {
        "unknown"
    }
}

const SYSTEM_PROMPT: &str = "You write short spoken wake-up messages. \
Speak directly to the listener in second person. \
Output ONLY the message text, with no quotes, headings or stage directions.";

pub struct OllamaTextGenerator {
    model: String,
    host: String,
    temperature: f32,
    client: Client,
}

impl OllamaTextGenerator {
    pub fn new(config: &OllamaConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            model: config.model.clone(),
            host: config.host.trim_end_matches('/').to_string(),
            temperature: config.temperature,
            client,
        })
    }
}

fn classify_status(status: StatusCode, body: String) -> TextGenError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => TextGenError::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => TextGenError::Timeout,
        s if s.is_server_error() => TextGenError::Unavailable(format!("status {s}")),
        s => TextGenError::ContentRejected(format!("status {s}: {body}")),
    }
}

#[async_trait]
impl TextGenerator for OllamaTextGenerator {
    async fn generate(&self, request: &TextRequest) -> Result<String, TextGenError> {
        let t_start = Instant::now();

        let body = json!({
            "model": self.model,
            "system": SYSTEM_PROMPT,
            "prompt": request.prompt,
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_predict": request.max_tokens
            }
        });

        let url = format!("{}/api/generate", self.host);
        let resp = self.client.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                TextGenError::Timeout
            } else {
                TextGenError::Unavailable(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let data = resp
            .json::<serde_json::Value>()
            .await
            .map_err(|e| TextGenError::InvalidResponse(e.to_string()))?;
        let text = data["response"].as_str().unwrap_or("").trim().to_string();
        if text.is_empty() {
            return Err(TextGenError::InvalidResponse("empty response".into()));
        }

        let latency_ms = t_start.elapsed().as_secs_f64() * 1000.0;
        info!(
            "Generated {} chars of {} text ({latency_ms:.0}ms)",
            text.len(),
            request.tone
        );
        debug!("Generated text: {text}");
        Ok(text)
    }

    fn provider_name(&self) -> &str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            TextGenError::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, String::new()),
            TextGenError::Timeout
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, String::new()),
            TextGenError::Unavailable(_)
        ));
        let rejected = classify_status(StatusCode::BAD_REQUEST, "bad prompt".into());
        assert_eq!(rejected.kind(), ErrorKind::ContentInvalid);
        assert!(!rejected.is_transient());
    }

    #[tokio::test]
    async fn unreachable_host_is_unavailable() {
        let config = OllamaConfig {
            host: "http://127.0.0.1:9".into(),
            ..OllamaConfig::default()
        };
        let generator = OllamaTextGenerator::new(&config, Duration::from_secs(2)).unwrap();
        let err = generator
            .generate(&TextRequest {
                prompt: "hello".into(),
                tone: Tone::Calm,
                max_tokens: 10,
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
