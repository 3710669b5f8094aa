//! Timezone-aware fire-time arithmetic.
//!
//! Alarms are stored as a local wall-clock time plus an IANA zone, never as
//! a fixed UTC instant, so a 07:00 alarm stays at 07:00 local across
//! daylight-saving transitions.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::{Alarm, Recurrence};

/// Longest gap any zone has skipped in one transition.
const MAX_GAP_MINUTES: i64 = 180;

/// Map a local date and time to an instant. Times that fall in a DST gap
/// move forward to the first valid minute; repeated times take the earlier
/// of the two instants.
pub fn resolve_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let local = date.and_time(time);
    for minutes in 0..=MAX_GAP_MINUTES {
        let candidate = local + Duration::minutes(minutes);
        if let Some(instant) = tz.from_local_datetime(&candidate).earliest() {
            return instant.with_timezone(&Utc);
        }
    }
    // No zone has a gap this long; read the wall time as UTC.
    Utc.from_utc_datetime(&local)
}

/// First fire instant strictly after `after`, or `None` when the alarm has
/// no future occurrence.
pub fn next_fire(alarm: &Alarm, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    next_fire_for(&alarm.recurrence, alarm.time, alarm.timezone, after)
}

pub fn next_fire_for(
    recurrence: &Recurrence,
    time: NaiveTime,
    tz: Tz,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match recurrence {
        Recurrence::Once { date } => {
            let instant = resolve_local(tz, *date, time);
            (instant > after).then_some(instant)
        }
        Recurrence::Weekly { days } => {
            if days.is_empty() {
                return None;
            }
            // Start a day early so a late-evening UTC `after` still sees
            // today's local occurrence in zones ahead of UTC.
            let start = after.with_timezone(&tz).date_naive() - Duration::days(1);
            (0..=8)
                .map(|offset| start + Duration::days(offset))
                .filter(|date| days.contains(date.weekday()))
                .map(|date| resolve_local(tz, date, time))
                .find(|instant| *instant > after)
        }
    }
}

/// Seconds east of UTC for `tz` at `instant`.
pub fn utc_offset_at(tz: Tz, instant: DateTime<Utc>) -> i32 {
    tz.offset_from_utc_datetime(&instant.naive_utc())
        .fix()
        .local_minus_utc()
}

pub fn local_time_at(tz: Tz, instant: DateTime<Utc>) -> NaiveTime {
    instant.with_timezone(&tz).time()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RepeatDays;
    use chrono::{Timelike, Weekday};
    use chrono_tz::America::New_York;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn seven() -> NaiveTime {
        NaiveTime::from_hms_opt(7, 0, 0).unwrap()
    }

    fn daily() -> Recurrence {
        Recurrence::Weekly {
            days: RepeatDays::new([
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ]),
        }
    }

    #[test]
    fn seven_am_stays_seven_am_across_spring_forward() {
        // DST starts 2025-03-09 in New York (EST -5 → EDT -4).
        let before = next_fire_for(&daily(), seven(), New_York, utc(2025, 3, 8, 0, 0)).unwrap();
        let after = next_fire_for(&daily(), seven(), New_York, before).unwrap();

        assert_eq!(before, utc(2025, 3, 8, 12, 0));
        assert_eq!(after, utc(2025, 3, 9, 11, 0));
        for instant in [before, after] {
            assert_eq!(local_time_at(New_York, instant).hour(), 7);
        }
    }

    #[test]
    fn seven_am_stays_seven_am_across_fall_back() {
        // DST ends 2025-11-02 in New York.
        let sat = next_fire_for(&daily(), seven(), New_York, utc(2025, 11, 1, 0, 0)).unwrap();
        let sun = next_fire_for(&daily(), seven(), New_York, sat).unwrap();
        assert_eq!(sat, utc(2025, 11, 1, 11, 0));
        assert_eq!(sun, utc(2025, 11, 2, 12, 0));
        assert_eq!(sun - sat, Duration::hours(25));
    }

    #[test]
    fn gap_times_shift_forward_and_repeated_times_take_the_first() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        let gap = NaiveTime::from_hms_opt(2, 30, 0).unwrap();
        assert_eq!(resolve_local(New_York, date, gap), utc(2025, 3, 9, 7, 0));

        let date = NaiveDate::from_ymd_opt(2025, 11, 2).unwrap();
        let repeated = NaiveTime::from_hms_opt(1, 30, 0).unwrap();
        assert_eq!(resolve_local(New_York, date, repeated), utc(2025, 11, 2, 5, 30));
    }

    #[test]
    fn one_shot_in_the_past_has_no_next_fire() {
        let once = Recurrence::Once {
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        };
        assert!(next_fire_for(&once, seven(), New_York, utc(2025, 6, 2, 0, 0)).is_none());
        assert_eq!(
            next_fire_for(&once, seven(), New_York, utc(2025, 5, 31, 0, 0)),
            Some(utc(2025, 6, 1, 11, 0))
        );
    }

    #[test]
    fn weekly_skips_unselected_days() {
        let mondays = Recurrence::Weekly {
            days: RepeatDays::new([Weekday::Mon]),
        };
        // 2025-06-04 is a Wednesday.
        let next = next_fire_for(&mondays, seven(), chrono_tz::UTC, utc(2025, 6, 4, 8, 0)).unwrap();
        assert_eq!(next, utc(2025, 6, 9, 7, 0));
    }

    #[test]
    fn offsets_reflect_dst() {
        assert_eq!(utc_offset_at(New_York, utc(2025, 1, 15, 12, 0)), -5 * 3600);
        assert_eq!(utc_offset_at(New_York, utc(2025, 7, 15, 12, 0)), -4 * 3600);
    }
}
