//! Speech synthesis capability and an HTTP implementation.
//!
//! The HTTP synthesizer speaks the OpenAI-style `/v1/audio/speech` dialect
//! served by Kokoro-FastAPI and similar local servers. Providers that wrap
//! audio in JSON (`{"audioContent": "<base64>"}`) are handled too.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use reqwest::{header, Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use super::retry::Retryable;
use crate::audio::AudioFormat;
use crate::config::SpeechConfig;
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    #[default]
    Standard,
    High,
}

impl std::str::FromStr for QualityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "high" => Ok(Self::High),
            other => Err(format!("unknown quality tier: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: String,
    pub quality: QualityTier,
}

#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Bytes,
    /// What the provider claims the payload is, if it said anything.
    pub declared_format: Option<AudioFormat>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("speech quota exceeded")]
    QuotaExceeded,

    #[error("invalid voice: {0}")]
    InvalidVoice(String),

    #[error("speech provider rate limited")]
    RateLimited,

    #[error("speech provider timed out")]
    Timeout,

    #[error("speech provider unavailable: {0}")]
    Unavailable(String),

    #[error("speech provider returned an unusable response: {0}")]
    InvalidResponse(String),
}

impl SynthesisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::QuotaExceeded => ErrorKind::ResourceExhausted,
            Self::InvalidVoice(_) => ErrorKind::FatalConfiguration,
            Self::RateLimited | Self::Timeout | Self::Unavailable(_) | Self::InvalidResponse(_) => {
                ErrorKind::Transient
            }
        }
    }
}

impl Retryable for SynthesisError {
    fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    fn timed_out() -> Self {
        Self::Timeout
    }
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<SynthesizedAudio, SynthesisError>;

    fn provider_name(&self) -> &str {
        "unknown"
    }
}

pub struct HttpSpeechSynthesizer {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    format: String,
    speed: f32,
    client: Client,
}

impl HttpSpeechSynthesizer {
    pub fn new(config: &SpeechConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            format: config.format.clone(),
            speed: config.speed,
            client,
        })
    }
}

fn classify_status(status: StatusCode, body: &str) -> SynthesisError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => SynthesisError::RateLimited,
        StatusCode::PAYMENT_REQUIRED | StatusCode::FORBIDDEN => SynthesisError::QuotaExceeded,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => SynthesisError::Timeout,
        s if s.is_server_error() => SynthesisError::Unavailable(format!("status {s}")),
        s if body.to_ascii_lowercase().contains("voice") => {
            SynthesisError::InvalidVoice(format!("status {s}: {body}"))
        }
        s => SynthesisError::InvalidResponse(format!("status {s}: {body}")),
    }
}

/// Decode a `{"audioContent": "<base64>"}` envelope.
fn decode_envelope(body: &[u8]) -> Result<Bytes, SynthesisError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| SynthesisError::InvalidResponse(format!("bad JSON envelope: {e}")))?;
    let encoded = value["audioContent"]
        .as_str()
        .ok_or_else(|| SynthesisError::InvalidResponse("missing audioContent".into()))?;
    STANDARD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(|e| SynthesisError::InvalidResponse(format!("bad base64 audio: {e}")))
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<SynthesizedAudio, SynthesisError> {
        let t_start = Instant::now();

        let body = serde_json::json!({
            "model": self.model,
            "input": request.text,
            "voice": request.voice,
            "response_format": self.format,
            "speed": self.speed,
            "quality": request.quality,
        });

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                SynthesisError::Timeout
            } else {
                SynthesisError::Unavailable(e.to_string())
            }
        })?;

        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let payload = resp
            .bytes()
            .await
            .map_err(|e| SynthesisError::InvalidResponse(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status, &String::from_utf8_lossy(&payload)));
        }

        let (bytes, declared_format) = if content_type.starts_with("application/json") {
            (decode_envelope(&payload)?, AudioFormat::from_declared(&self.format))
        } else {
            let declared = AudioFormat::from_declared(&content_type)
                .or_else(|| AudioFormat::from_declared(&self.format));
            (payload, declared)
        };

        let latency_ms = t_start.elapsed().as_secs_f64() * 1000.0;
        info!(
            "Synthesized {} bytes with voice {} ({latency_ms:.0}ms)",
            bytes.len(),
            request.voice
        );

        Ok(SynthesizedAudio {
            bytes,
            declared_format,
        })
    }

    fn provider_name(&self) -> &str {
        "http"
    }
}
