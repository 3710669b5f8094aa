//! Device timezone detection and change tracking.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::time::utc_offset_at;

pub trait TimezoneProbe: Send + Sync {
    fn current(&self) -> Tz;
}

/// Reads `TZ`, then `/etc/timezone`, then the `/etc/localtime` symlink.
pub struct SystemTimezone {
    fallback: Tz,
}

impl SystemTimezone {
    pub fn new(fallback: Tz) -> Self {
        Self { fallback }
    }

    fn detect() -> Option<Tz> {
        if let Ok(tz) = std::env::var("TZ") {
            if let Ok(zone) = tz.trim_start_matches(':').parse() {
                return Some(zone);
            }
        }
        if let Ok(contents) = std::fs::read_to_string("/etc/timezone") {
            if let Ok(zone) = contents.trim().parse() {
                return Some(zone);
            }
        }
        let target = std::fs::read_link(Path::new("/etc/localtime")).ok()?;
        let target = target.to_string_lossy();
        let (_, name) = target.split_once("zoneinfo/")?;
        name.parse().ok()
    }
}

impl TimezoneProbe for SystemTimezone {
    fn current(&self) -> Tz {
        Self::detect().unwrap_or(self.fallback)
    }
}

/// A zone switch or a UTC-offset change within the same zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeChange {
    pub previous: Tz,
    pub current: Tz,
    pub previous_offset: i32,
    pub current_offset: i32,
}

impl TimeChange {
    pub fn zone_changed(&self) -> bool {
        self.previous != self.current
    }
}

pub struct TimezoneWatcher {
    probe: Arc<dyn TimezoneProbe>,
    last: Mutex<Option<(Tz, i32)>>,
}

impl TimezoneWatcher {
    pub fn new(probe: Arc<dyn TimezoneProbe>) -> Self {
        Self {
            probe,
            last: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Tz {
        self.probe.current()
    }

    /// Compare against the previous observation. The first call only
    /// records a baseline.
    pub fn check(&self, now: DateTime<Utc>) -> Option<TimeChange> {
        let zone = self.probe.current();
        let offset = utc_offset_at(zone, now);
        let mut last = self.last.lock();
        let previous = last.replace((zone, offset));

        match previous {
            Some((prev_zone, prev_offset)) if prev_zone != zone || prev_offset != offset => {
                info!(
                    "Time change detected: {prev_zone} ({prev_offset}s) -> {zone} ({offset}s)"
                );
                Some(TimeChange {
                    previous: prev_zone,
                    current: zone,
                    previous_offset: prev_offset,
                    current_offset: offset,
                })
            }
            Some(_) => None,
            None => {
                debug!("Timezone baseline: {zone} ({offset}s)");
                None
            }
        }
    }
}
