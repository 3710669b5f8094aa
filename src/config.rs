//! Configuration management for daybreak.
//!
//! Loads config from YAML files in standard locations. Every section has
//! defaults, so an empty or missing file yields a working daemon.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::cache::{CacheLimits, HealthThresholds};
use crate::error::ErrorKind;
use crate::model::Tone;

const MB: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::FatalConfiguration
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
    /// "json" or "memory"
    pub backend: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            backend: "json".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: Option<PathBuf>,
    pub max_size_mb: u64,
    pub ttl_hours: u64,
    pub memory_tier_mb: u64,
    pub warning_ratio: f64,
    pub critical_ratio: f64,
    pub min_hit_rate: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_size_mb: 150,
            ttl_hours: 72,
            memory_tier_mb: 32,
            warning_ratio: 0.8,
            critical_ratio: 0.95,
            min_hit_rate: 0.25,
        }
    }
}

impl CacheConfig {
    pub fn limits(&self) -> CacheLimits {
        CacheLimits {
            max_bytes: self.max_size_mb * MB,
            default_ttl: chrono::Duration::hours(self.ttl_hours as i64),
            memory_bytes: self.memory_tier_mb * MB,
            thresholds: HealthThresholds {
                warning_ratio: self.warning_ratio,
                critical_ratio: self.critical_ratio,
                min_hit_rate: self.min_hit_rate,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub lookahead_hours: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub call_timeout_secs: u64,
    pub workers: usize,
    pub max_tokens: u32,
    pub min_text_chars: usize,
    pub max_text_chars: usize,
    pub min_motivational_hits: usize,
    pub blocked_words: Vec<String>,
    pub min_audio_bytes: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            lookahead_hours: 24,
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8000,
            call_timeout_secs: 30,
            workers: 2,
            max_tokens: 200,
            min_text_chars: 40,
            max_text_chars: 600,
            min_motivational_hits: 2,
            blocked_words: vec![
                "damn".into(),
                "hell".into(),
                "stupid".into(),
                "idiot".into(),
                "hate".into(),
                "kill".into(),
            ],
            min_audio_bytes: 1024,
        }
    }
}

impl GenerationConfig {
    pub fn lookahead(&self) -> chrono::Duration {
        chrono::Duration::hours(self.lookahead_hours as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub model: String,
    pub host: String,
    pub temperature: f32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            model: "llama3.2:3b".into(),
            host: "http://localhost:11434".into(),
            temperature: 0.8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// OpenAI-style `/v1/audio/speech` endpoint (Kokoro-FastAPI and friends).
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub format: String,
    /// "standard" or "high"
    pub quality: String,
    pub speed: f32,
    pub voices: HashMap<Tone, String>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        let voices = [
            (Tone::Energetic, "am_adam"),
            (Tone::Calm, "af_sky"),
            (Tone::Gentle, "af_heart"),
            (Tone::Motivational, "am_michael"),
            (Tone::Humorous, "af_bella"),
        ]
        .into_iter()
        .map(|(tone, voice)| (tone, voice.to_string()))
        .collect();

        Self {
            endpoint: "http://localhost:8880/v1/audio/speech".into(),
            api_key: None,
            model: "kokoro".into(),
            format: "mp3".into(),
            quality: "standard".into(),
            speed: 1.0,
            voices,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub conflict_tolerance_secs: u64,
    pub misfire_grace_secs: u64,
    pub tick_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    /// IANA zone used when the system zone cannot be determined.
    pub default_timezone: String,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            conflict_tolerance_secs: 60,
            misfire_grace_secs: 300,
            tick_interval_secs: 30,
            reconcile_interval_secs: 300,
            default_timezone: "UTC".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub max_concurrent: usize,
    pub call_timeout_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            call_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DismissalConfig {
    pub keywords: Vec<String>,
    pub max_distance: usize,
    pub voice_window_secs: u64,
    pub hard_timeout_secs: u64,
    pub snooze_minutes: u64,
}

impl Default for DismissalConfig {
    fn default() -> Self {
        Self {
            keywords: vec![
                "i'm up".into(),
                "i am up".into(),
                "i'm awake".into(),
                "awake".into(),
                "stop alarm".into(),
                "good morning".into(),
            ],
            max_distance: 2,
            voice_window_secs: 10,
            hard_timeout_secs: 300,
            snooze_minutes: 9,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntentsConfig {
    pub max_age_hours: u64,
}

impl Default for IntentsConfig {
    fn default() -> Self {
        Self { max_age_hours: 168 }
    }
}

impl IntentsConfig {
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_age_hours as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".into(),
            port: 8787,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SounderConfig {
    pub enabled: bool,
    /// Player argv; the ringtone path is appended.
    pub command: Vec<String>,
}

impl Default for SounderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: vec![
                "ffplay".into(),
                "-nodisp".into(),
                "-autoexit".into(),
                "-loglevel".into(),
                "quiet".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub generation: GenerationConfig,
    pub ollama: OllamaConfig,
    pub speech: SpeechConfig,
    pub scheduling: SchedulingConfig,
    pub host: HostConfig,
    pub dismissal: DismissalConfig,
    pub intents: IntentsConfig,
    pub api: ApiConfig,
    pub sounder: SounderConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./daybreak.yaml
    /// 2. ~/.config/daybreak/config.yaml
    /// 3. /etc/daybreak/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("daybreak.yaml")),
                dirs::home_dir().map(|h| h.join(".config/daybreak/config.yaml")),
                Some(PathBuf::from("/etc/daybreak/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::from_yaml(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.cache.max_size_mb == 0 {
            return invalid("cache.max_size_mb must be positive");
        }
        if self.cache.warning_ratio > self.cache.critical_ratio {
            return invalid("cache.warning_ratio must not exceed cache.critical_ratio");
        }
        if self.generation.max_attempts == 0 {
            return invalid("generation.max_attempts must be at least 1");
        }
        if self.generation.workers == 0 {
            return invalid("generation.workers must be at least 1");
        }
        if self.generation.min_text_chars >= self.generation.max_text_chars {
            return invalid("generation.min_text_chars must be below max_text_chars");
        }
        if self.host.max_concurrent == 0 {
            return invalid("host.max_concurrent must be positive");
        }
        if self.dismissal.keywords.iter().all(|k| k.trim().is_empty()) {
            return invalid("dismissal.keywords must contain at least one keyword");
        }
        if self.dismissal.voice_window_secs > self.dismissal.hard_timeout_secs {
            return invalid("dismissal.voice_window_secs must not exceed hard_timeout_secs");
        }
        if self.dismissal.snooze_minutes == 0 {
            return invalid("dismissal.snooze_minutes must be positive");
        }
        if self.scheduling.default_timezone.parse::<chrono_tz::Tz>().is_err() {
            return invalid("scheduling.default_timezone is not a known IANA zone");
        }
        if !matches!(self.storage.backend.as_str(), "json" | "memory") {
            return invalid("storage.backend must be \"json\" or \"memory\"");
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|d| d.join("daybreak"))
                .unwrap_or_else(|| PathBuf::from("daybreak-data"))
        })
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache.dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .map(|d| d.join("daybreak"))
                .unwrap_or_else(|| self.data_dir().join("cache"))
        })
    }

    pub fn history_dir(&self) -> PathBuf {
        self.data_dir().join("history")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.cache.limits().max_bytes, 150 * MB);
        assert_eq!(config.dismissal.snooze_minutes, 9);
        assert_eq!(config.speech.voices.len(), Tone::ALL.len());
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let config = Config::from_yaml(
            "cache:\n  max_size_mb: 20\nspeech:\n  voices:\n    energetic: am_puck\n",
        )
        .unwrap();
        assert_eq!(config.cache.max_size_mb, 20);
        assert_eq!(config.cache.ttl_hours, 72);
        assert_eq!(config.speech.voices.get(&Tone::Energetic).map(String::as_str), Some("am_puck"));
        assert_eq!(config.generation.max_attempts, 3);
    }

    #[test]
    fn rejects_impossible_values() {
        let mut config = Config::default();
        config.generation.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache.max_size_mb = 0;
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::FatalConfiguration);

        let mut config = Config::default();
        config.scheduling.default_timezone = "Mars/Olympus".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/daybreak.yaml")));
        assert_eq!(config.api.port, 8787);
    }
}
