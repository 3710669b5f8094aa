//! Alarm scheduling: fire-time arithmetic, timezone tracking and the
//! create/toggle/delete service.

pub mod service;
pub mod time;
pub mod timezone;

pub use service::{NewAlarm, SchedulingError, SchedulingService, SchedulingSettings, TickReport, ValidationError};
pub use time::{next_fire, resolve_local};
pub use timezone::{SystemTimezone, TimeChange, TimezoneProbe, TimezoneWatcher};
