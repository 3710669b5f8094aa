//! Test doubles and a fully wired in-memory core.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::audio::{encode_wav, fallback_chime, AudioFormat};
use crate::cache::AudioCache;
use crate::clock::{Clock, SharedClock};
use crate::config::Config;
use crate::dismissal::{DismissalCoordinator, DismissalTiming, VoiceMatcher};
use crate::events::EventBus;
use crate::generation::{
    ContentOrchestrator, OrchestratorSettings, SpeechRequest, SpeechSynthesizer, SynthesisError, SynthesizedAudio,
    TextGenError, TextGenerator, TextRequest,
};
use crate::history::HistoryLog;
use crate::model::{Alarm, AlarmId, HostAlarmConfig, Recurrence, RepeatDays, ScheduleState, Tone};
use crate::reconcile::{
    AuthorizationStatus, CancelOutcome, FireEvent, HostEntry, HostEntryState, HostError, HostScheduler,
    ReconciliationManager,
};
use crate::repository::AlarmRepository;
use crate::scheduling::{SchedulingService, SchedulingSettings, TimezoneProbe, TimezoneWatcher};
use crate::sounder::{Ringtone, Sounder, SounderError};
use crate::storage::MemoryStore;

/// Passes the default text validator unchanged.
pub const GOOD_TEXT: &str = "Good morning! Today is a fresh start, so rise and go after your goal with energy.";

/// Clock pinned to Monday 2025-06-02 05:00 UTC until moved.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc.with_ymd_and_hms(2025, 6, 2, 5, 0, 0).unwrap())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

pub struct FixedTimezone {
    zone: Mutex<Tz>,
}

impl FixedTimezone {
    pub fn new(zone: Tz) -> Self {
        Self { zone: Mutex::new(zone) }
    }

    pub fn set(&self, zone: Tz) {
        *self.zone.lock() = zone;
    }
}

impl TimezoneProbe for FixedTimezone {
    fn current(&self) -> Tz {
        *self.zone.lock()
    }
}

/// Weekly every day at 07:00 UTC, energetic, enabled.
pub fn sample_alarm(label: &str) -> Alarm {
    Alarm {
        id: AlarmId::new(),
        label: label.to_string(),
        time: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
        timezone: chrono_tz::UTC,
        recurrence: Recurrence::Weekly {
            days: RepeatDays::new([
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ]),
        },
        tone: Tone::Energetic,
        enabled: true,
        intent_id: None,
        content: None,
        handle: None,
        schedule_state: ScheduleState::Unscheduled,
        created_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        last_fired_at: None,
        snooze_count: 0,
        last_outcome: None,
        derived_from: None,
    }
}

/// A quarter second sine tone at 16 kHz.
pub fn sample_wav(freq: f32) -> Bytes {
    let rate = 16_000;
    let samples: Vec<f32> = (0..rate / 4)
        .map(|i| (i as f32 * freq * std::f32::consts::TAU / rate as f32).sin() * 0.5)
        .collect();
    encode_wav(&samples, rate).unwrap()
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub struct ScriptedTextGenerator {
    script: Mutex<VecDeque<Result<String, TextGenError>>>,
    otherwise: Result<String, TextGenError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedTextGenerator {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            otherwise: Ok(GOOD_TEXT.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(err: TextGenError) -> Self {
        Self {
            otherwise: Err(err),
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_script(self, script: Vec<Result<String, TextGenError>>) -> Self {
        *self.script.lock() = script.into();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedTextGenerator {
    async fn generate(&self, request: &TextRequest) -> Result<String, TextGenError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(request.prompt.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.otherwise.clone())
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }
}

pub struct ScriptedSpeech {
    script: Mutex<VecDeque<Result<SynthesizedAudio, SynthesisError>>>,
    otherwise: Result<SynthesizedAudio, SynthesisError>,
    calls: AtomicUsize,
}

impl ScriptedSpeech {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            otherwise: Ok(SynthesizedAudio {
                bytes: sample_wav(440.0),
                declared_format: Some(AudioFormat::Wav),
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: SynthesisError) -> Self {
        Self {
            otherwise: Err(err),
            ..Self::new()
        }
    }

    pub fn with_script(self, script: Vec<Result<SynthesizedAudio, SynthesisError>>) -> Self {
        *self.script.lock() = script.into();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSpeech {
    async fn synthesize(&self, _request: &SpeechRequest) -> Result<SynthesizedAudio, SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.otherwise.clone())
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }
}

/// Host double with no timers: entries fire only when a test says so.
pub struct FakeHost {
    entries: Mutex<BTreeMap<String, HostEntry>>,
    max: usize,
    next_id: AtomicU64,
    /// `false` fails the matching schedule call; empty means succeed.
    schedule_script: Mutex<VecDeque<bool>>,
    cancel_calls: AtomicUsize,
    denied: AtomicBool,
    fire_tx: mpsc::UnboundedSender<FireEvent>,
    fire_rx: Mutex<Option<mpsc::UnboundedReceiver<FireEvent>>>,
}

impl FakeHost {
    pub fn new(max: usize) -> Self {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        Self {
            entries: Mutex::new(BTreeMap::new()),
            max,
            next_id: AtomicU64::new(1),
            schedule_script: Mutex::new(VecDeque::new()),
            cancel_calls: AtomicUsize::new(0),
            denied: AtomicBool::new(false),
            fire_tx,
            fire_rx: Mutex::new(Some(fire_rx)),
        }
    }

    fn allocate_id(&self) -> String {
        format!("fake-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Flip an entry to alerting and emit its fire event.
    pub fn fire(&self, host_id: &str) -> Option<FireEvent> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(host_id)?;
        entry.state = HostEntryState::Alerting;
        let event = FireEvent {
            host_id: host_id.to_string(),
            alarm_id: entry.config.alarm_id,
            fired_at: entry.config.fire_at,
        };
        let _ = self.fire_tx.send(event.clone());
        Some(event)
    }

    /// Drop an entry without telling anyone, as a host restart would.
    pub fn forget(&self, host_id: &str) {
        self.entries.lock().remove(host_id);
    }

    pub fn inject_orphan(&self, fire_at: DateTime<Utc>) -> String {
        let id = self.allocate_id();
        self.entries.lock().insert(
            id.clone(),
            HostEntry {
                id: id.clone(),
                config: HostAlarmConfig {
                    alarm_id: AlarmId::new(),
                    fire_at,
                    label: "orphan".into(),
                },
                state: HostEntryState::Pending,
            },
        );
        id
    }

    pub fn entries(&self) -> Vec<HostEntry> {
        self.entries.lock().values().cloned().collect()
    }

    /// Calls to `cancel` and `dismiss_active` combined.
    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn fail_schedules(&self, n: usize) {
        self.schedule_script.lock().extend(std::iter::repeat(false).take(n));
    }

    /// Let `k` schedule calls succeed, then fail one.
    pub fn fail_schedules_after(&self, k: usize) {
        let mut script = self.schedule_script.lock();
        script.extend(std::iter::repeat(true).take(k));
        script.push_back(false);
    }

    pub fn deny_authorization(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl HostScheduler for FakeHost {
    async fn request_authorization(&self) -> Result<AuthorizationStatus, HostError> {
        if self.denied.load(Ordering::SeqCst) {
            Ok(AuthorizationStatus::Denied)
        } else {
            Ok(AuthorizationStatus::Granted)
        }
    }

    async fn schedule(&self, config: &HostAlarmConfig) -> Result<String, HostError> {
        if self.schedule_script.lock().pop_front() == Some(false) {
            return Err(HostError::Unavailable("scripted failure".into()));
        }
        let mut entries = self.entries.lock();
        if entries.len() >= self.max {
            return Err(HostError::LimitReached { max: self.max });
        }
        let id = self.allocate_id();
        entries.insert(
            id.clone(),
            HostEntry {
                id: id.clone(),
                config: config.clone(),
                state: HostEntryState::Pending,
            },
        );
        Ok(id)
    }

    async fn cancel(&self, host_id: &str) -> Result<CancelOutcome, HostError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock();
        match entries.get(host_id).map(|e| e.state) {
            None => Ok(CancelOutcome::NotFound),
            Some(HostEntryState::Alerting) => Err(HostError::EntryActive(host_id.to_string())),
            Some(HostEntryState::Pending) => {
                entries.remove(host_id);
                Ok(CancelOutcome::Cancelled)
            }
        }
    }

    async fn dismiss_active(&self, host_id: &str) -> Result<CancelOutcome, HostError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock();
        match entries.get(host_id).map(|e| e.state) {
            None => Ok(CancelOutcome::NotFound),
            Some(HostEntryState::Pending) => Err(HostError::NotAlerting(host_id.to_string())),
            Some(HostEntryState::Alerting) => {
                entries.remove(host_id);
                Ok(CancelOutcome::Cancelled)
            }
        }
    }

    async fn list_active(&self) -> Result<Vec<HostEntry>, HostError> {
        Ok(self.entries())
    }

    fn take_fire_events(&self) -> Option<mpsc::UnboundedReceiver<FireEvent>> {
        self.fire_rx.lock().take()
    }

    fn max_concurrent(&self) -> usize {
        self.max
    }

    fn name(&self) -> &str {
        "fake"
    }
}

#[derive(Default)]
pub struct RecordingSounder {
    started: Mutex<Vec<Ringtone>>,
    stopped: Mutex<Vec<AlarmId>>,
}

impl RecordingSounder {
    pub fn started(&self) -> Vec<Ringtone> {
        self.started.lock().clone()
    }

    pub fn stopped(&self) -> Vec<AlarmId> {
        self.stopped.lock().clone()
    }
}

#[async_trait]
impl Sounder for RecordingSounder {
    async fn start(&self, ringtone: &Ringtone) -> Result<(), SounderError> {
        self.started.lock().push(ringtone.clone());
        Ok(())
    }

    async fn stop(&self, alarm_id: AlarmId) {
        self.stopped.lock().push(alarm_id);
    }
}

/// Every component wired together over an in-memory store, a temp-dir
/// cache, a manual clock and the fake host.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub events: Arc<EventBus>,
    pub repo: Arc<AlarmRepository>,
    pub cache: Arc<AudioCache>,
    pub orchestrator: Arc<ContentOrchestrator>,
    pub host: Arc<FakeHost>,
    pub reconciler: Arc<ReconciliationManager>,
    pub timezone: Arc<FixedTimezone>,
    pub service: Arc<SchedulingService>,
    pub sounder: Arc<RecordingSounder>,
    pub history: Arc<HistoryLog>,
    pub coordinator: Arc<DismissalCoordinator>,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(
            Arc::new(ScriptedTextGenerator::new()),
            Arc::new(ScriptedSpeech::new()),
            FakeHost::new(64),
        )
        .await
    }

    pub async fn with_providers(text: Arc<dyn TextGenerator>, speech: Arc<dyn SpeechSynthesizer>) -> Self {
        Self::build(text, speech, FakeHost::new(64)).await
    }

    pub async fn with_host(host: FakeHost) -> Self {
        Self::build(
            Arc::new(ScriptedTextGenerator::new()),
            Arc::new(ScriptedSpeech::new()),
            host,
        )
        .await
    }

    async fn build(text: Arc<dyn TextGenerator>, speech: Arc<dyn SpeechSynthesizer>, host: FakeHost) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.generation.base_delay_ms = 5;
        config.generation.max_delay_ms = 20;

        let clock = Arc::new(ManualClock::default());
        let shared: SharedClock = clock.clone();
        let events = Arc::new(EventBus::default());
        let repo = Arc::new(
            AlarmRepository::load(Arc::new(MemoryStore::new()), events.clone())
                .await
                .unwrap(),
        );
        let cache = Arc::new(
            AudioCache::open(dir.path().join("cache"), config.cache.limits(), shared.clone())
                .await
                .unwrap(),
        );
        let orchestrator = Arc::new(ContentOrchestrator::new(
            repo.clone(),
            cache.clone(),
            text,
            speech,
            events.clone(),
            shared.clone(),
            OrchestratorSettings::from_config(&config),
        ));

        let host = Arc::new(host);
        let reconciler = Arc::new(ReconciliationManager::new(
            host.clone(),
            repo.clone(),
            shared.clone(),
            Duration::from_secs(2),
        ));
        let timezone = Arc::new(FixedTimezone::new(chrono_tz::UTC));
        let service = Arc::new(SchedulingService::new(
            repo.clone(),
            reconciler.clone(),
            orchestrator.clone(),
            cache.clone(),
            events.clone(),
            shared.clone(),
            TimezoneWatcher::new(timezone.clone()),
            SchedulingSettings::from_config(&config),
        ));

        let sounder = Arc::new(RecordingSounder::default());
        let history = Arc::new(HistoryLog::new(dir.path().join("history")));
        let timing = DismissalTiming {
            voice_window: Duration::from_millis(300),
            hard_timeout: Duration::from_millis(1000),
        };
        let coordinator = Arc::new(DismissalCoordinator::new(
            service.clone(),
            cache.clone(),
            reconciler.clone(),
            events.clone(),
            sounder.clone(),
            history.clone(),
            shared,
            VoiceMatcher::from(&config.dismissal),
            timing,
            fallback_chime().unwrap(),
        ));

        Self {
            clock,
            events,
            repo,
            cache,
            orchestrator,
            host,
            reconciler,
            timezone,
            service,
            sounder,
            history,
            coordinator,
            _dir: dir,
        }
    }
}
