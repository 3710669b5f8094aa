//! Alarm data model: alarms, intents, generated content and host handles.
//!
//! Alarms and content only ever hold cache *keys*. Payload bytes live in the
//! audio cache, so eviction can never corrupt an alarm record.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audio::AudioFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlarmId(pub Uuid);

impl AlarmId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AlarmId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AlarmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentId(pub Uuid);

impl IntentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IntentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for IntentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Persona used for both the generated text and the synthesis voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Energetic,
    Calm,
    #[default]
    Gentle,
    Motivational,
    Humorous,
}

impl Tone {
    pub const ALL: [Tone; 5] = [
        Tone::Energetic,
        Tone::Calm,
        Tone::Gentle,
        Tone::Motivational,
        Tone::Humorous,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Energetic => "energetic",
            Self::Calm => "calm",
            Self::Gentle => "gentle",
            Self::Motivational => "motivational",
            Self::Humorous => "humorous",
        }
    }
}

impl std::fmt::Display for Tone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tone::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown tone: {s}"))
    }
}

/// Normalized set of weekdays (sorted Monday-first, no duplicates).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepeatDays(Vec<Weekday>);

impl RepeatDays {
    pub fn new(days: impl IntoIterator<Item = Weekday>) -> Self {
        let mut days: Vec<Weekday> = days.into_iter().collect();
        days.sort_by_key(|d| d.num_days_from_monday());
        days.dedup();
        Self(days)
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0.contains(&day)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn days(&self) -> &[Weekday] {
        &self.0
    }
}

/// One-shot alarms carry an absolute local date; recurring alarms carry
/// only weekdays. The two are mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    Once { date: NaiveDate },
    Weekly { days: RepeatDays },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    #[default]
    Unscheduled,
    Validating,
    Scheduled,
    Active,
    Misfired,
    Cancelled,
}

impl std::fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unscheduled => "UNSCHEDULED",
            Self::Validating => "VALIDATING",
            Self::Scheduled => "SCHEDULED",
            Self::Active => "ACTIVE",
            Self::Misfired => "MISFIRED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Immutable result of one generation run. Regeneration replaces the whole
/// record; it is never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub text: String,
    pub cache_key: String,
    pub voice: String,
    pub format: AudioFormat,
    pub size_bytes: u64,
    pub generated_at: DateTime<Utc>,
    /// `None` when the generic template was used.
    pub intent_id: Option<IntentId>,
}

/// Configuration as pushed to the host scheduler. A copy is kept on the
/// handle so reconciliation can detect drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAlarmConfig {
    pub alarm_id: AlarmId,
    pub fire_at: DateTime<Utc>,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleStatus {
    /// Pushed, not yet observed in a host listing.
    Pending,
    /// Observed in a host listing.
    Live,
    /// Host has no matching entry; kept for diagnostics, never cancelled.
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSchedulerHandle {
    pub host_id: String,
    pub pushed: HostAlarmConfig,
    pub status: HandleStatus,
    pub pushed_at: DateTime<Utc>,
}

impl ExternalSchedulerHandle {
    pub fn is_valid(&self) -> bool {
        self.status != HandleStatus::Invalid
    }

    pub fn invalidated(mut self) -> Self {
        self.status = HandleStatus::Invalid;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DismissMethod {
    Explicit,
    Voice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Dismissed,
    Snoozed,
    Expired,
    /// The host never fired the alarm.
    Missed,
}

/// How a firing ended, kept on the alarm for analytics consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DismissalRecord {
    pub outcome: OutcomeKind,
    pub method: Option<DismissMethod>,
    pub latency_ms: u64,
    pub fired_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
    pub used_fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: AlarmId,
    pub label: String,
    /// Local wall-clock time in `timezone`.
    pub time: NaiveTime,
    pub timezone: Tz,
    pub recurrence: Recurrence,
    pub tone: Tone,
    pub enabled: bool,
    #[serde(default)]
    pub intent_id: Option<IntentId>,
    #[serde(default)]
    pub content: Option<GeneratedContent>,
    #[serde(default)]
    pub handle: Option<ExternalSchedulerHandle>,
    #[serde(default)]
    pub schedule_state: ScheduleState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub snooze_count: u32,
    #[serde(default)]
    pub last_outcome: Option<DismissalRecord>,
    /// Set on short-lived snooze alarms, pointing at the alarm that rang.
    #[serde(default)]
    pub derived_from: Option<AlarmId>,
}

impl Alarm {
    pub fn is_recurring(&self) -> bool {
        matches!(self.recurrence, Recurrence::Weekly { .. })
    }

    pub fn valid_handle(&self) -> Option<&ExternalSchedulerHandle> {
        self.handle.as_ref().filter(|h| h.is_valid())
    }

    pub fn content_key(&self) -> Option<&str> {
        self.content.as_ref().map(|c| c.cache_key.as_str())
    }
}

/// User-authored goal/context used to personalize generated speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: IntentId,
    pub text: String,
    pub tone: Tone,
    /// Situational hint such as "big presentation at 9".
    #[serde(default)]
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Intent {
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now - self.created_at > max_age
    }
}
