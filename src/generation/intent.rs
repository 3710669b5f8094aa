//! Intent resolution, prompt building and the tone→voice table.

use std::collections::HashMap;

use chrono::{DateTime, NaiveTime, Timelike, Utc};

use crate::config::SpeechConfig;
use crate::model::{Intent, IntentId, Tone};

const DEFAULT_VOICE: &str = "af_heart";

/// The intent a generation run is built from. `id` is `None` when the
/// generic per-tone template stood in for a user intent.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedIntent {
    pub id: Option<IntentId>,
    pub text: String,
    pub tone: Tone,
    pub context: Option<String>,
}

impl From<&Intent> for ResolvedIntent {
    fn from(intent: &Intent) -> Self {
        Self {
            id: Some(intent.id),
            text: intent.text.clone(),
            tone: intent.tone,
            context: intent.context.clone(),
        }
    }
}

fn generic_intent(tone: Tone) -> &'static str {
    match tone {
        Tone::Energetic => "Get up and make today count with real energy",
        Tone::Calm => "Wake slowly and start the day with a clear, steady mind",
        Tone::Gentle => "Ease into a fresh new morning, one small step at a time",
        Tone::Motivational => "Rise and move toward your goals today",
        Tone::Humorous => "Beat the snooze button and win the morning",
    }
}

fn tone_guidance(tone: Tone) -> &'static str {
    match tone {
        Tone::Energetic => "upbeat, punchy and full of energy",
        Tone::Calm => "calm, slow and reassuring",
        Tone::Gentle => "soft, warm and kind",
        Tone::Motivational => "confident and inspiring, like a coach",
        Tone::Humorous => "playful and light, with one small joke",
    }
}

fn time_of_day(local: NaiveTime) -> &'static str {
    match local.hour() {
        0..=4 => "before dawn",
        5..=11 => "in the morning",
        12..=16 => "in the afternoon",
        _ => "in the evening",
    }
}

/// Pick the intent for a run: the explicit one if still fresh, then the
/// newest fresh intent in the alarm's tone, then the newest fresh intent
/// of any tone, then the generic template.
pub fn resolve_intent(
    intents: &[Intent],
    explicit: Option<IntentId>,
    tone: Tone,
    now: DateTime<Utc>,
    max_age: chrono::Duration,
) -> ResolvedIntent {
    let fresh = || intents.iter().filter(|i| !i.is_expired(now, max_age));

    let chosen = explicit
        .and_then(|id| fresh().find(|i| i.id == id))
        .or_else(|| fresh().filter(|i| i.tone == tone).max_by_key(|i| i.created_at))
        .or_else(|| fresh().max_by_key(|i| i.created_at));

    match chosen {
        Some(intent) => ResolvedIntent {
            // The alarm's tone wins over the intent's when they differ.
            tone,
            ..ResolvedIntent::from(intent)
        },
        None => ResolvedIntent {
            id: None,
            text: generic_intent(tone).to_string(),
            tone,
            context: None,
        },
    }
}

/// Prompt for the text generator. `strict` is used for the single
/// regeneration after a rejected draft.
pub fn build_prompt(intent: &ResolvedIntent, label: &str, local_time: NaiveTime, strict: bool) -> String {
    let mut prompt = format!(
        "Write a wake-up message to be read aloud {} ({}). Alarm: \"{}\".\n\
         Tone: {}.\n\
         The listener's goal: {}.\n",
        time_of_day(local_time),
        local_time.format("%H:%M"),
        label,
        tone_guidance(intent.tone),
        intent.text.trim(),
    );
    if let Some(context) = intent.context.as_deref().filter(|c| !c.trim().is_empty()) {
        prompt.push_str(&format!("Context for today: {}.\n", context.trim()));
    }
    prompt.push_str("Keep it to 2-4 sentences.");
    if strict {
        prompt.push_str(
            " Use only friendly, family-safe words. Stay between 40 and 400 characters. \
             Mention today, the morning and the goal explicitly, and end with an encouraging call to get up.",
        );
    }
    prompt
}

/// Voice per tone, with a single default for tones not configured.
#[derive(Debug, Clone)]
pub struct VoiceTable {
    voices: HashMap<Tone, String>,
    default_voice: String,
}

impl VoiceTable {
    pub fn voice_for(&self, tone: Tone) -> &str {
        self.voices.get(&tone).map_or(self.default_voice.as_str(), String::as_str)
    }
}

impl From<&SpeechConfig> for VoiceTable {
    fn from(config: &SpeechConfig) -> Self {
        Self {
            voices: config.voices.clone(),
            default_voice: DEFAULT_VOICE.to_string(),
        }
    }
}
