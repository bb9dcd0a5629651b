//! Time utilities: clocks, time zone localization and window sampling.
//!
//! All stored instants are UTC. Local wall-clock time is only used to derive
//! day-local windows such as "19:00 in the user's zone".

use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use rand::Rng;

use crate::SchedulerError;

/// How far past a DST gap we look for the first valid local time.
const MAX_GAP_MINUTES: i64 = 180;

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Current instant from the system clock.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Parse an IANA zone name such as `Europe/Paris`.
pub fn parse_time_zone(name: &str) -> Result<Tz, SchedulerError> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimeZone(name.to_string()))
}

/// Wall-clock representation of `instant` in `tz`.
pub fn localize(instant: DateTime<Utc>, tz: Tz) -> DateTime<Tz> {
    instant.with_timezone(&tz)
}

/// The absolute instant of `hour:minute` local time on the local date of `day`.
///
/// Ambiguous times (clocks falling back) resolve to the earlier instant;
/// times inside a DST gap resolve to the first valid minute after it.
pub fn local_time_on(
    day: DateTime<Utc>,
    tz: Tz,
    hour: u32,
    minute: u32,
) -> Result<DateTime<Utc>, SchedulerError> {
    let naive = localize(day, tz)
        .date_naive()
        .and_hms_opt(hour, minute, 0)
        .ok_or_else(|| {
            SchedulerError::InvalidConfig(format!("invalid local time {hour:02}:{minute:02}"))
        })?;

    resolve_local(tz, naive).ok_or_else(|| {
        SchedulerError::InvalidTimeZone(format!("{tz}: no valid local time near {naive}"))
    })
}

fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    (0..=MAX_GAP_MINUTES).find_map(|offset| {
        tz.from_local_datetime(&(naive + Duration::minutes(offset)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

/// Uniformly sample an instant in `[start, end)` at millisecond resolution.
///
/// Returns `start` when the range is empty.
pub fn random_instant_between(start: DateTime<Utc>, end: DateTime<Utc>) -> DateTime<Utc> {
    let span = (end - start).num_milliseconds();
    if span <= 0 {
        return start;
    }
    let offset = rand::thread_rng().gen_range(0..span);
    start + Duration::milliseconds(offset)
}

/// Whether `instant` is strictly before the current system time.
pub fn has_passed(instant: DateTime<Utc>) -> bool {
    has_passed_at(instant, now())
}

/// Whether `instant` is strictly before `now`.
pub fn has_passed_at(instant: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    instant < now
}

/// ISO-8601 UTC string with millisecond precision, e.g. `2024-01-01T00:02:00.000Z`.
pub fn to_iso_string(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Truncate to whole milliseconds, the resolution instants are stored at.
pub fn truncate_millis(instant: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(instant.timestamp_millis()).unwrap_or(instant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use proptest::prelude::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_parse_time_zone() {
        assert!(parse_time_zone("UTC").is_ok());
        assert!(parse_time_zone("America/New_York").is_ok());
        assert!(matches!(
            parse_time_zone("Mars/Olympus_Mons"),
            Err(SchedulerError::InvalidTimeZone(_))
        ));
    }

    #[test]
    fn test_localize_keeps_instant() {
        let instant = utc("2024-06-01T12:00:00Z");
        let paris = localize(instant, chrono_tz::Europe::Paris);
        assert_eq!(paris.hour(), 14);
        assert_eq!(paris.with_timezone(&Utc), instant);
    }

    #[test]
    fn test_local_time_on_uses_local_date() {
        // 02:00 UTC on June 2nd is still June 1st in Los Angeles.
        let day = utc("2024-06-02T02:00:00Z");
        let at = local_time_on(day, chrono_tz::America::Los_Angeles, 19, 0).unwrap();
        assert_eq!(at, utc("2024-06-02T02:00:00Z"));

        let at = local_time_on(day, chrono_tz::UTC, 19, 0).unwrap();
        assert_eq!(at, utc("2024-06-02T19:00:00Z"));
    }

    #[test]
    fn test_local_time_on_dst_gap() {
        // 02:30 does not exist in New York on 2024-03-10.
        let day = utc("2024-03-10T12:00:00Z");
        let at = local_time_on(day, chrono_tz::America::New_York, 2, 30).unwrap();
        assert_eq!(at, utc("2024-03-10T07:00:00Z"));
    }

    #[test]
    fn test_local_time_on_rejects_bad_hour() {
        let day = utc("2024-03-10T12:00:00Z");
        assert!(matches!(
            local_time_on(day, chrono_tz::UTC, 24, 0),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_random_instant_empty_range() {
        let start = utc("2024-01-01T19:00:00Z");
        assert_eq!(random_instant_between(start, start), start);
        assert_eq!(
            random_instant_between(start, start - Duration::hours(1)),
            start
        );
    }

    #[test]
    fn test_random_instant_spreads() {
        let start = utc("2024-01-01T19:00:00Z");
        let end = utc("2024-01-01T21:00:00Z");
        let samples: std::collections::HashSet<_> =
            (0..50).map(|_| random_instant_between(start, end)).collect();
        assert!(samples.len() > 1, "samples should not collide");
    }

    #[test]
    fn test_has_passed() {
        let now = utc("2024-01-01T12:00:00Z");
        assert!(has_passed_at(now - Duration::milliseconds(1), now));
        assert!(!has_passed_at(now, now));
        assert!(!has_passed_at(now + Duration::seconds(1), now));
        assert!(has_passed(Utc::now() - Duration::hours(1)));
    }

    #[test]
    fn test_iso_string() {
        let instant = utc("2024-01-01T00:02:00Z");
        assert_eq!(to_iso_string(instant), "2024-01-01T00:02:00.000Z");
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(utc("2024-01-01T00:00:00Z"));
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), utc("2024-01-01T00:01:30Z"));
        clock.set(utc("2025-01-01T00:00:00Z"));
        assert_eq!(clock.now(), utc("2025-01-01T00:00:00Z"));
    }

    proptest! {
        #[test]
        fn random_instant_within_range(start_ms in 0i64..4_000_000_000_000, span_ms in 1i64..86_400_000) {
            let start = DateTime::from_timestamp_millis(start_ms).unwrap();
            let end = start + Duration::milliseconds(span_ms);
            let sample = random_instant_between(start, end);
            prop_assert!(sample >= start);
            prop_assert!(sample < end);
        }

        #[test]
        fn local_time_on_is_same_local_day(ts in 0i64..4_000_000_000, hour in 0u32..24) {
            let day = DateTime::from_timestamp(ts, 0).unwrap();
            let tz = chrono_tz::Europe::Berlin;
            let at = local_time_on(day, tz, hour, 0).unwrap();
            prop_assert_eq!(localize(at, tz).date_naive(), localize(day, tz).date_naive());
        }
    }
}
