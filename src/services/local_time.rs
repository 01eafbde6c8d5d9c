//! Timezone resolution and localization of naive weather-file timestamps.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tzf_rs::DefaultFinder;

use crate::errors::{PipelineError, Result};

pub const LOCAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";
pub const UTC_FORMAT: &str = "%Y-%m-%d %H:%M:%S+00:00";

static TZF_FINDER: OnceLock<DefaultFinder> = OnceLock::new();

/// IANA zone at the given coordinates.
pub fn resolve_timezone(lat: f64, lon: f64) -> Result<Tz> {
    let finder = TZF_FINDER.get_or_init(DefaultFinder::new);
    let tzid = finder.get_tz_name(lon, lat);
    tzid.parse::<Tz>().map_err(|_| PipelineError::TimezoneLookup { lat, lon })
}

/// Attaches `tz` to a wall-clock time. Ambiguous times take the earlier
/// (daylight) instant; times inside a spring-forward gap move forward to the
/// first valid minute.
pub fn localize(tz: &Tz, naive: NaiveDateTime) -> Result<DateTime<Tz>> {
    let mut candidate = naive;
    for _ in 0..=24 * 60 {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(t) => return Ok(t),
            LocalResult::Ambiguous(earliest, _) => return Ok(earliest),
            LocalResult::None => candidate += Duration::minutes(1),
        }
    }
    Err(PipelineError::UnparseableTimestamp(naive.to_string()))
}

pub fn format_local(t: &DateTime<Tz>) -> String {
    t.format(LOCAL_FORMAT).to_string()
}

pub fn format_utc(t: &DateTime<Utc>) -> String {
    t.format(UTC_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn naive(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, min, 0).unwrap()
    }

    #[test]
    fn test_resolves_eastern_zones() {
        assert_eq!(resolve_timezone(40.7128, -74.0060).unwrap(), Tz::America__New_York);
        assert_eq!(resolve_timezone(42.33, -83.05).unwrap(), Tz::America__Detroit);
    }

    #[test]
    fn test_standard_time_offset() {
        let tz = Tz::America__New_York;
        let t = localize(&tz, naive(2022, 1, 1, 0, 30)).unwrap();
        assert_eq!(format_local(&t), "2022-01-01 00:30:00 -0500");
        assert_eq!(format_utc(&t.with_timezone(&Utc)), "2022-01-01 05:30:00+00:00");
    }

    #[test]
    fn test_nonexistent_time_shifts_forward() {
        let tz = Tz::America__New_York;
        let t = localize(&tz, naive(2022, 3, 13, 2, 30)).unwrap();
        assert_eq!(format_local(&t), "2022-03-13 03:00:00 -0400");
        assert_eq!(format_utc(&t.with_timezone(&Utc)), "2022-03-13 07:00:00+00:00");
    }

    #[test]
    fn test_ambiguous_time_takes_daylight_instant() {
        let tz = Tz::America__New_York;
        let t = localize(&tz, naive(2022, 11, 6, 1, 30)).unwrap();
        assert_eq!(format_local(&t), "2022-11-06 01:30:00 -0400");
        assert_eq!(format_utc(&t.with_timezone(&Utc)), "2022-11-06 05:30:00+00:00");
    }
}
