//! Content generation orchestrator.
//!
//! One pipeline run per alarm at a time: the first request leads and
//! every concurrent request for the same alarm awaits the leader's result
//! through a watch channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::intent::{build_prompt, resolve_intent, ResolvedIntent, VoiceTable};
use super::retry::{with_retries, RetryPolicy};
use super::speech::{QualityTier, SpeechRequest, SpeechSynthesizer};
use super::text::{TextGenerator, TextRequest};
use super::validate::TextValidator;
use super::{GenerationError, GenerationStatus};
use crate::audio::{validate_audio, AudioFormat};
use crate::cache::{content_key, AudioCache, PayloadKind};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::error::ErrorKind;
use crate::events::{CoreEvent, EventBus};
use crate::model::{Alarm, AlarmId, GeneratedContent, IntentId};
use crate::repository::AlarmRepository;
use crate::scheduling::time::next_fire;

type RunResult = Result<GeneratedContent, GenerationError>;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    pub validator: TextValidator,
    pub voices: VoiceTable,
    pub quality: QualityTier,
    pub max_tokens: u32,
    pub min_audio_bytes: usize,
    pub intent_max_age: chrono::Duration,
    pub lookahead: chrono::Duration,
    pub workers: usize,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        let quality = config.speech.quality.parse().unwrap_or_else(|e| {
            warn!("{e}, using standard quality");
            QualityTier::Standard
        });

        Self {
            retry: RetryPolicy::from(&config.generation),
            validator: TextValidator::from(&config.generation),
            voices: VoiceTable::from(&config.speech),
            quality,
            max_tokens: config.generation.max_tokens,
            min_audio_bytes: config.generation.min_audio_bytes,
            intent_max_age: config.intents.max_age(),
            lookahead: config.generation.lookahead(),
            workers: config.generation.workers.max(1),
        }
    }
}

struct InFlight {
    run: u64,
    result: watch::Receiver<Option<RunResult>>,
    discarded: Arc<AtomicBool>,
}

pub struct ContentOrchestrator {
    repo: Arc<AlarmRepository>,
    cache: Arc<AudioCache>,
    text: Arc<dyn TextGenerator>,
    speech: Arc<dyn SpeechSynthesizer>,
    events: Arc<EventBus>,
    clock: SharedClock,
    settings: OrchestratorSettings,
    in_flight: Mutex<HashMap<AlarmId, InFlight>>,
    next_run: AtomicU64,
    statuses: RwLock<HashMap<AlarmId, GenerationStatus>>,
}

impl ContentOrchestrator {
    pub fn new(
        repo: Arc<AlarmRepository>,
        cache: Arc<AudioCache>,
        text: Arc<dyn TextGenerator>,
        speech: Arc<dyn SpeechSynthesizer>,
        events: Arc<EventBus>,
        clock: SharedClock,
        settings: OrchestratorSettings,
    ) -> Self {
        info!(
            "Content orchestrator ready (text: {}, speech: {})",
            text.provider_name(),
            speech.provider_name()
        );
        Self {
            repo,
            cache,
            text,
            speech,
            events,
            clock,
            settings,
            in_flight: Mutex::new(HashMap::new()),
            next_run: AtomicU64::new(1),
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// Generate content for an alarm, joining any live run already in
    /// flight. A discarded run is never joined; a fresh run replaces it.
    pub async fn generate(self: &Arc<Self>, alarm_id: AlarmId, intent_id: Option<IntentId>) -> RunResult {
        let mut result = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&alarm_id) {
                Some(live) if !live.discarded.load(Ordering::SeqCst) => {
                    debug!("Joining in-flight generation for {alarm_id}");
                    live.result.clone()
                }
                _ => {
                    let run = self.next_run.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    let discarded = Arc::new(AtomicBool::new(false));
                    in_flight.insert(
                        alarm_id,
                        InFlight {
                            run,
                            result: rx.clone(),
                            discarded: discarded.clone(),
                        },
                    );

                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        let outcome = this.run_pipeline(alarm_id, intent_id, &discarded).await;
                        let current = {
                            let mut in_flight = this.in_flight.lock();
                            let current = in_flight.get(&alarm_id).is_some_and(|f| f.run == run);
                            if current {
                                in_flight.remove(&alarm_id);
                            }
                            current
                        };
                        // A superseded run must not overwrite its successor's status.
                        if current {
                            this.finish(alarm_id, &outcome);
                        } else {
                            debug!("Superseded generation run {run} for {alarm_id} settled");
                        }
                        let _ = tx.send(Some(outcome));
                    });
                    rx
                }
            }
        };

        let settled = result
            .wait_for(Option::is_some)
            .await
            .map_err(|_| GenerationError::Abandoned)?;
        settled.clone().unwrap_or(Err(GenerationError::Abandoned))
    }

    /// Mark the run for `alarm_id` as discarded. Its result is dropped and
    /// any cache write it made is invalidated. Returns whether a run was
    /// in flight.
    pub fn discard_in_flight(&self, alarm_id: AlarmId) -> bool {
        match self.in_flight.lock().get(&alarm_id) {
            Some(run) => {
                run.discarded.store(true, Ordering::SeqCst);
                info!("Discarding in-flight generation for {alarm_id}");
                true
            }
            None => false,
        }
    }

    pub fn is_in_flight(&self, alarm_id: AlarmId) -> bool {
        self.in_flight.lock().contains_key(&alarm_id)
    }

    pub fn status(&self, alarm_id: AlarmId) -> Option<GenerationStatus> {
        self.statuses.read().get(&alarm_id).cloned()
    }

    pub fn forget(&self, alarm_id: AlarmId) {
        self.statuses.write().remove(&alarm_id);
    }

    /// True when the alarm has no content or its audio is gone from the cache.
    pub fn needs_content(&self, alarm: &Alarm) -> bool {
        !alarm.content_key().is_some_and(|key| self.cache.contains(key))
    }

    /// Generate for every enabled alarm firing within the lookahead window
    /// that lacks usable content. Returns how many runs succeeded.
    pub async fn pregenerate_window(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let horizon = now + self.settings.lookahead;
        let due: Vec<AlarmId> = self
            .repo
            .list()
            .await
            .into_iter()
            .filter(|a| a.enabled)
            .filter(|a| next_fire(a, now).is_some_and(|at| at <= horizon))
            .filter(|a| self.needs_content(a))
            .map(|a| a.id)
            .collect();

        if due.is_empty() {
            return 0;
        }
        info!("Pre-generating content for {} alarm(s)", due.len());

        let permits = Arc::new(Semaphore::new(self.settings.workers));
        let mut tasks = JoinSet::new();
        for alarm_id in due {
            let this = Arc::clone(self);
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                this.generate(alarm_id, None).await
            });
        }

        let mut generated = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(_)) => generated += 1,
                Ok(Err(e)) => debug!("Pre-generation run failed: {e}"),
                Err(e) => warn!("Pre-generation task panicked: {e}"),
            }
        }
        generated
    }

    fn set_status(&self, alarm_id: AlarmId, status: GenerationStatus) {
        self.statuses.write().insert(alarm_id, status.clone());
        self.events.publish(CoreEvent::Generation { alarm_id, status });
    }

    fn finish(&self, alarm_id: AlarmId, outcome: &RunResult) {
        let status = match outcome {
            Ok(_) => GenerationStatus::Complete,
            Err(GenerationError::Discarded) => GenerationStatus::Discarded,
            Err(e) => GenerationStatus::Failed {
                reason: e.to_string(),
            },
        };
        match outcome {
            Ok(content) => info!("Content ready for {alarm_id} ({})", content.cache_key),
            Err(GenerationError::Discarded) => {}
            Err(e) => warn!("Generation for {alarm_id} failed ({}): {e}", e.kind()),
        }
        self.set_status(alarm_id, status);
    }

    async fn run_pipeline(
        &self,
        alarm_id: AlarmId,
        intent_id: Option<IntentId>,
        discarded: &AtomicBool,
    ) -> RunResult {
        self.set_status(alarm_id, GenerationStatus::Pending);
        let alarm = self.repo.get(alarm_id).await.ok_or(GenerationError::AlarmNotFound)?;

        let intents = self.repo.intents().await;
        let resolved = resolve_intent(
            &intents,
            intent_id.or(alarm.intent_id),
            alarm.tone,
            self.clock.now(),
            self.settings.intent_max_age,
        );

        self.set_status(alarm_id, GenerationStatus::GeneratingText);
        let text = self.generate_text(&alarm, &resolved).await?;
        if discarded.load(Ordering::SeqCst) {
            return Err(GenerationError::Discarded);
        }

        self.set_status(alarm_id, GenerationStatus::GeneratingAudio);
        let voice = self.settings.voices.voice_for(alarm.tone).to_string();
        let (audio, format) = self.synthesize(&text, &voice).await?;
        if discarded.load(Ordering::SeqCst) {
            return Err(GenerationError::Discarded);
        }

        let key = content_key(&alarm_id.to_string(), &audio);
        let size_bytes = audio.len() as u64;
        self.cache
            .put(&key, audio, PayloadKind::Audio, None)
            .await
            .map_err(|e| GenerationError::Cache {
                kind: e.kind(),
                message: e.to_string(),
            })?;
        if discarded.load(Ordering::SeqCst) {
            // A successor run may produce the same bytes.
            let successor = self
                .in_flight
                .lock()
                .get(&alarm_id)
                .is_some_and(|f| !f.discarded.load(Ordering::SeqCst));
            if !successor && self.repo.content_references(&key).await == 0 {
                self.release(&key).await;
            }
            return Err(GenerationError::Discarded);
        }

        let content = GeneratedContent {
            text,
            cache_key: key.clone(),
            voice,
            format,
            size_bytes,
            generated_at: self.clock.now(),
            intent_id: resolved.id,
        };

        let previous = self
            .repo
            .get(alarm_id)
            .await
            .and_then(|a| a.content.map(|c| c.cache_key));
        let attached = content.clone();
        match self.repo.update(alarm_id, move |a| a.content = Some(attached)).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                self.release(&key).await;
                return Err(GenerationError::Discarded);
            }
            Err(e) => {
                self.release(&key).await;
                return Err(GenerationError::Storage(e.to_string()));
            }
        }

        if let Some(old) = previous.filter(|old| *old != key) {
            if self.repo.content_references(&old).await == 0 {
                self.release(&old).await;
            }
        }
        Ok(content)
    }

    async fn generate_text(&self, alarm: &Alarm, resolved: &ResolvedIntent) -> Result<String, GenerationError> {
        let label = format!("Text generation for {}", alarm.id);
        let mut last_rejection = String::new();

        for strict in [false, true] {
            let request = TextRequest {
                prompt: build_prompt(resolved, &alarm.label, alarm.time, strict),
                tone: alarm.tone,
                max_tokens: self.settings.max_tokens,
            };

            let draft = match with_retries(&self.settings.retry, &label, |_| self.text.generate(&request)).await {
                Ok(draft) => draft,
                Err(e) if e.kind() == ErrorKind::ContentInvalid && !strict => {
                    warn!("Prompt for {} rejected ({e}), retrying with a stricter prompt", alarm.id);
                    last_rejection = e.to_string();
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::ContentInvalid => {
                    return Err(GenerationError::ContentInvalid(e.to_string()));
                }
                Err(e) => return Err(e.into()),
            };

            match self.settings.validator.validate(&draft) {
                Ok(text) => return Ok(text),
                Err(rejection) => {
                    warn!("Generated text for {} rejected: {rejection}", alarm.id);
                    last_rejection = rejection.to_string();
                }
            }
        }
        Err(GenerationError::ContentInvalid(last_rejection))
    }

    async fn synthesize(&self, text: &str, voice: &str) -> Result<(bytes::Bytes, AudioFormat), GenerationError> {
        let request = SpeechRequest {
            text: text.to_string(),
            voice: voice.to_string(),
            quality: self.settings.quality,
        };
        let mut last_rejection = String::new();

        for attempt in 1..=2 {
            let audio = with_retries(&self.settings.retry, "Speech synthesis", |_| {
                self.speech.synthesize(&request)
            })
            .await?;

            match validate_audio(&audio.bytes, audio.declared_format, self.settings.min_audio_bytes) {
                Ok(format) => return Ok((audio.bytes, format)),
                Err(e) => {
                    warn!("Synthesized audio rejected (attempt {attempt}/2): {e}");
                    last_rejection = e.to_string();
                }
            }
        }
        Err(GenerationError::AudioInvalid(last_rejection))
    }

    async fn release(&self, key: &str) {
        if let Err(e) = self.cache.invalidate(key).await {
            warn!("Failed to release cache entry {key}: {e}");
        }
    }
}
