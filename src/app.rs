//! Process wiring: builds every component once, then runs the background
//! loops (fire events, housekeeping tick, periodic reconciliation).

use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audio::fallback_chime;
use crate::cache::{AudioCache, CacheError};
use crate::clock::{Clock, SharedClock, SystemClock};
use crate::config::{Config, ConfigError};
use crate::dismissal::{DismissalCoordinator, DismissalTiming, VoiceMatcher};
use crate::error::ErrorKind;
use crate::events::EventBus;
use crate::generation::{
    ContentOrchestrator, HttpSpeechSynthesizer, OllamaTextGenerator, OrchestratorSettings, SpeechSynthesizer,
    TextGenerator,
};
use crate::history::HistoryLog;
use crate::reconcile::{HostScheduler, LocalHostScheduler, ReconciliationManager};
use crate::repository::AlarmRepository;
use crate::scheduling::{SchedulingService, SchedulingSettings, SystemTimezone, TimezoneProbe, TimezoneWatcher};
use crate::sounder::{CommandSounder, SilentSounder, Sounder};
use crate::storage::{JsonFileStore, KeyValueStore, MemoryStore, StorageError};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to synthesize fallback tone: {0}")]
    FallbackTone(#[from] hound::Error),
}

impl BuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(e) => e.kind(),
            Self::Cache(e) => e.kind(),
            _ => ErrorKind::FatalConfiguration,
        }
    }
}

/// External collaborators. `Daybreak::build` fills these from config;
/// embedders and tests can supply their own.
pub struct Providers {
    pub clock: SharedClock,
    pub store: Arc<dyn KeyValueStore>,
    pub text: Arc<dyn TextGenerator>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub host: Arc<dyn HostScheduler>,
    pub sounder: Arc<dyn Sounder>,
    pub timezone: Arc<dyn TimezoneProbe>,
}

impl Providers {
    pub async fn from_config(config: &Config) -> Result<Self, BuildError> {
        let clock: SharedClock = Arc::new(SystemClock);
        let data_dir = config.data_dir();

        let store: Arc<dyn KeyValueStore> = match config.storage.backend.as_str() {
            "memory" => {
                warn!("Using in-memory storage, alarms will not survive a restart");
                Arc::new(MemoryStore::new())
            }
            _ => Arc::new(JsonFileStore::open(data_dir.join("alarms.json")).await?),
        };

        let call_timeout = Duration::from_secs(config.generation.call_timeout_secs);
        let text = Arc::new(OllamaTextGenerator::new(&config.ollama, call_timeout)?);
        let speech = Arc::new(HttpSpeechSynthesizer::new(&config.speech, call_timeout)?);
        let host = Arc::new(LocalHostScheduler::new(config.host.max_concurrent, clock.clone()));

        let sounder: Arc<dyn Sounder> = if config.sounder.enabled {
            Arc::new(CommandSounder::new(data_dir.join("ringing"), &config.sounder))
        } else {
            Arc::new(SilentSounder)
        };

        let fallback_zone: Tz = config
            .scheduling
            .default_timezone
            .parse()
            .map_err(|_| ConfigError::Invalid("scheduling.default_timezone".into()))?;

        Ok(Self {
            clock,
            store,
            text,
            speech,
            host,
            sounder,
            timezone: Arc::new(SystemTimezone::new(fallback_zone)),
        })
    }
}

pub struct Daybreak {
    pub config: Config,
    pub events: Arc<EventBus>,
    pub repo: Arc<AlarmRepository>,
    pub cache: Arc<AudioCache>,
    pub orchestrator: Arc<ContentOrchestrator>,
    pub reconciler: Arc<ReconciliationManager>,
    pub scheduling: Arc<SchedulingService>,
    pub coordinator: Arc<DismissalCoordinator>,
    pub history: Arc<HistoryLog>,
    clock: SharedClock,
    ready: watch::Sender<bool>,
}

impl Daybreak {
    pub async fn build(config: Config) -> Result<Arc<Self>, BuildError> {
        config.validate()?;
        let providers = Providers::from_config(&config).await?;
        Self::build_with(config, providers).await
    }

    pub async fn build_with(config: Config, providers: Providers) -> Result<Arc<Self>, BuildError> {
        let Providers {
            clock,
            store,
            text,
            speech,
            host,
            sounder,
            timezone,
        } = providers;

        let events = Arc::new(EventBus::default());
        let repo = Arc::new(AlarmRepository::load(store, events.clone()).await?);
        let cache = Arc::new(AudioCache::open(config.cache_dir(), config.cache.limits(), clock.clone()).await?);

        let orchestrator = Arc::new(ContentOrchestrator::new(
            repo.clone(),
            cache.clone(),
            text,
            speech,
            events.clone(),
            clock.clone(),
            OrchestratorSettings::from_config(&config),
        ));
        let reconciler = Arc::new(ReconciliationManager::new(
            host,
            repo.clone(),
            clock.clone(),
            Duration::from_secs(config.host.call_timeout_secs),
        ));
        let scheduling = Arc::new(SchedulingService::new(
            repo.clone(),
            reconciler.clone(),
            orchestrator.clone(),
            cache.clone(),
            events.clone(),
            clock.clone(),
            TimezoneWatcher::new(timezone),
            SchedulingSettings::from_config(&config),
        ));

        let history = Arc::new(HistoryLog::new(config.history_dir()));
        let coordinator = Arc::new(DismissalCoordinator::new(
            scheduling.clone(),
            cache.clone(),
            reconciler.clone(),
            events.clone(),
            sounder,
            history.clone(),
            clock.clone(),
            VoiceMatcher::from(&config.dismissal),
            DismissalTiming::from(&config.dismissal),
            fallback_chime()?,
        ));

        let (ready, _) = watch::channel(false);
        info!(
            "Daybreak core built ({} alarms, {} cached artifacts)",
            repo.list().await.len(),
            cache.entry_count()
        );
        Ok(Arc::new(Self {
            config,
            events,
            repo,
            cache,
            orchestrator,
            reconciler,
            scheduling,
            coordinator,
            history,
            clock,
            ready,
        }))
    }

    pub fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    /// Resolves to `true` once the start-up reconciliation has run.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Reconcile once, then spawn the background loops. Each loop waits
    /// for the ready signal before touching any component.
    pub async fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        match self.reconciler.take_fire_events() {
            Some(fires) => {
                let coordinator = self.coordinator.clone();
                let mut ready = self.ready();
                tasks.push(tokio::spawn(async move {
                    if ready.wait_for(|r| *r).await.is_ok() {
                        coordinator.run(fires).await;
                    }
                }));
            }
            None => warn!("Host fire events already taken; firings will not ring"),
        }

        let tick = Duration::from_secs(self.config.scheduling.tick_interval_secs.max(1));
        let this = self.clone();
        let mut ready = self.ready();
        tasks.push(tokio::spawn(async move {
            if ready.wait_for(|r| *r).await.is_err() {
                return;
            }
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                let report = this.scheduling.tick().await;
                if report.misfired > 0 || report.rescheduled > 0 {
                    info!("Tick: {report:?}");
                }
            }
        }));

        let every = Duration::from_secs(self.config.scheduling.reconcile_interval_secs.max(1));
        let this = self.clone();
        let mut ready = self.ready();
        tasks.push(tokio::spawn(async move {
            if ready.wait_for(|r| *r).await.is_err() {
                return;
            }
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately and start() already reconciled.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = this.reconciler.reconcile_all().await {
                    warn!("Periodic reconciliation failed: {e}");
                }
            }
        }));

        if let Err(e) = self.reconciler.authorize().await {
            warn!("Host scheduler authorization: {e}");
        }
        match self.reconciler.reconcile_all().await {
            Ok(report) => info!("Start-up reconciliation: {report:?}"),
            Err(e) => warn!("Start-up reconciliation failed: {e}"),
        }
        let pregenerated = self.orchestrator.pregenerate_window(self.clock.now()).await;
        if pregenerated > 0 {
            info!("Pre-generated content for {pregenerated} alarm(s)");
        }

        self.ready.send_replace(true);
        info!("Daybreak ready");
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScheduleState;
    use crate::scheduling::NewAlarm;
    use crate::testing::{
        sample_alarm, wait_until, FakeHost, FixedTimezone, ManualClock, RecordingSounder, ScriptedSpeech,
        ScriptedTextGenerator,
    };

    fn providers(clock: Arc<ManualClock>, host: Arc<FakeHost>, store: Arc<dyn KeyValueStore>) -> Providers {
        Providers {
            clock,
            store,
            text: Arc::new(ScriptedTextGenerator::new()),
            speech: Arc::new(ScriptedSpeech::new()),
            host,
            sounder: Arc::new(RecordingSounder::default()),
            timezone: Arc::new(FixedTimezone::new(chrono_tz::UTC)),
        }
    }

    fn config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = Some(dir.join("data"));
        config.cache.dir = Some(dir.join("cache"));
        config
    }

    #[tokio::test]
    async fn start_reconciles_stored_alarms_before_ready() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let alarm = sample_alarm("Stored");
        store
            .put(&format!("alarm/{}", alarm.id), serde_json::to_value(&alarm).unwrap())
            .await
            .unwrap();

        let clock = Arc::new(ManualClock::default());
        let host = Arc::new(FakeHost::new(8));
        let app = Daybreak::build_with(config(dir.path()), providers(clock, host.clone(), store))
            .await
            .unwrap();
        let ready = app.ready();
        assert!(!*ready.borrow());

        let tasks = app.start().await;
        assert!(*ready.borrow());
        assert_eq!(host.entries().len(), 1);
        let stored = app.repo.get(alarm.id).await.unwrap();
        assert_eq!(stored.schedule_state, ScheduleState::Scheduled);
        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test]
    async fn fire_events_reach_the_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let host = Arc::new(FakeHost::new(8));
        let app = Daybreak::build_with(
            config(dir.path()),
            providers(clock.clone(), host.clone(), Arc::new(MemoryStore::new())),
        )
        .await
        .unwrap();
        let tasks = app.start().await;

        let request: NewAlarm = serde_json::from_value(serde_json::json!({
            "label": "Wired",
            "time": "07:00:00",
            "timezone": "UTC",
            "repeat": ["Mon"],
        }))
        .unwrap();
        let alarm = app.scheduling.create_alarm(request).await.unwrap();
        let handle = alarm.valid_handle().unwrap().clone();
        clock.set(handle.pushed.fire_at);
        host.fire(&handle.host_id).unwrap();

        let coordinator = app.coordinator.clone();
        wait_until(|| {
            let coordinator = coordinator.clone();
            async move { coordinator.session_state(alarm.id).is_some() }
        })
        .await;
        app.coordinator.dismiss(alarm.id).await.unwrap();

        let repo = app.repo.clone();
        wait_until(|| {
            let repo = repo.clone();
            async move { repo.get(alarm.id).await.is_some_and(|a| a.last_outcome.is_some()) }
        })
        .await;
        for task in tasks {
            task.abort();
        }
    }
}
