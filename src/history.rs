//! Dismissal history and reliability reporting.
//!
//! Every resolved firing is appended to a daily JSONL file under
//! `<data_dir>/history/`; the report summarises one day as Markdown.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::model::{Alarm, AlarmId, DismissMethod, DismissalRecord, OutcomeKind, Tone};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub alarm_id: AlarmId,
    pub label: String,
    pub tone: Tone,
    pub outcome: OutcomeKind,
    pub method: Option<DismissMethod>,
    pub latency_ms: u64,
    pub used_fallback: bool,
    pub snoozed_before: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heard: Option<String>,
}

impl HistoryEntry {
    pub fn new(alarm: &Alarm, record: &DismissalRecord, heard: Option<String>) -> Self {
        Self {
            timestamp: record.resolved_at,
            alarm_id: alarm.id,
            label: alarm.label.clone(),
            tone: alarm.tone,
            outcome: record.outcome,
            method: record.method,
            latency_ms: record.latency_ms,
            used_fallback: record.used_fallback,
            snoozed_before: alarm.snooze_count,
            heard,
        }
    }
}

fn day_of(instant: DateTime<Utc>) -> String {
    instant.with_timezone(&Local).format("%Y-%m-%d").to_string()
}

fn resolve_date(date: &str) -> String {
    if date == "today" {
        Local::now().format("%Y-%m-%d").to_string()
    } else {
        date.to_string()
    }
}

pub struct HistoryLog {
    dir: PathBuf,
}

impl HistoryLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", resolve_date(date)))
    }

    /// Append one entry to the file for the day it resolved on. Failures
    /// are logged; history never blocks a dismissal.
    pub fn append(&self, entry: &HistoryEntry) {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            error!("Failed to create history dir: {e}");
            return;
        }
        let path = self.file_for(&day_of(entry.timestamp));
        let line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize history entry: {e}");
                return;
            }
        };
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(mut file) => match writeln!(file, "{line}") {
                Ok(()) => debug!("Saved dismissal record to {}", path.display()),
                Err(e) => error!("Failed to write history entry: {e}"),
            },
            Err(e) => error!("Failed to open history file: {e}"),
        }
    }

    pub fn load(&self, date: &str) -> Vec<HistoryEntry> {
        let Ok(contents) = std::fs::read_to_string(self.file_for(date)) else {
            return Vec::new();
        };
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!("Skipping malformed history line: {e}");
                    None
                }
            })
            .collect()
    }

    /// Dates with history, newest first.
    pub fn available_dates(&self) -> Vec<String> {
        let mut dates: Vec<String> = std::fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .filter_map(|entry| {
                let name = entry.ok()?.file_name().to_string_lossy().to_string();
                name.strip_suffix(".jsonl").map(str::to_string)
            })
            .collect();
        dates.sort_by(|a, b| b.cmp(a));
        dates
    }

    /// Markdown reliability report for one day.
    pub fn report(&self, date: &str) -> String {
        render_report(&resolve_date(date), &self.load(date))
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

pub fn render_report(date: &str, entries: &[HistoryEntry]) -> String {
    if entries.is_empty() {
        return format!("# Daybreak Report - {date}\n\nNo alarms fired.");
    }

    let total = entries.len();
    let count = |outcome: OutcomeKind| entries.iter().filter(|e| e.outcome == outcome).count();
    let dismissed = count(OutcomeKind::Dismissed);
    let snoozed = count(OutcomeKind::Snoozed);
    let expired = count(OutcomeKind::Expired);
    let by_voice = entries
        .iter()
        .filter(|e| e.outcome == OutcomeKind::Dismissed && e.method == Some(DismissMethod::Voice))
        .count();
    let fallback = entries.iter().filter(|e| e.used_fallback).count();

    let answered: Vec<u64> = entries
        .iter()
        .filter(|e| !matches!(e.outcome, OutcomeKind::Expired | OutcomeKind::Missed))
        .map(|e| e.latency_ms)
        .collect();
    let avg_latency = if answered.is_empty() {
        0.0
    } else {
        answered.iter().sum::<u64>() as f64 / answered.len() as f64 / 1000.0
    };

    let mut lines = vec![
        format!("# Daybreak Report - {date}"),
        String::new(),
        "## Summary".to_string(),
        format!("- **Firings**: {total}"),
        format!("- **Dismissed**: {dismissed} ({by_voice} by voice)"),
        format!("- **Snoozed**: {snoozed}"),
        format!("- **Expired**: {expired} ({:.0}%)", percent(expired, total)),
        format!("- **Fallback tone**: {:.0}% of firings", percent(fallback, total)),
        format!("- **Average response**: {avg_latency:.1}s"),
        String::new(),
        "## Log".to_string(),
        String::new(),
        "| Time | Alarm | Outcome | Method | Response | Audio |".to_string(),
        "|------|-------|---------|--------|----------|-------|".to_string(),
    ];

    for e in entries {
        let time = e.timestamp.with_timezone(&Local).format("%H:%M:%S");
        let outcome = match e.outcome {
            OutcomeKind::Dismissed => "dismissed",
            OutcomeKind::Snoozed => "snoozed",
            OutcomeKind::Expired => "expired",
            OutcomeKind::Missed => "missed",
        };
        let method = match e.method {
            Some(DismissMethod::Voice) => "voice",
            Some(DismissMethod::Explicit) => "explicit",
            None => "-",
        };
        let audio = if e.used_fallback { "fallback" } else { "generated" };
        lines.push(format!(
            "| {time} | {} | {outcome} | {method} | {:.1}s | {audio} |",
            truncate(&e.label, 24),
            e.latency_ms as f64 / 1000.0
        ));
    }

    lines.join("\n")
}
