//! Wire-format codec for dates, times, timestamps, and durations
//!
//! Every value that crosses the HTTP surface, a template file, or a vendor
//! query string goes through these functions, so the formats live in exactly
//! one place.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Wire date format
pub const DFMT: &str = "%Y-%m-%d";
/// Wire time format
pub const TFMT: &str = "%H:%M:%S";
/// Wire timestamp format
pub const DTFMT: &str = "%Y-%m-%dT%H:%M:%S";

const DURATION_RE: &str = r"(?x)
    ^P
    (?:(?P<years>\d+)Y)?
    (?:(?P<months>\d+)M)?
    (?:(?P<weeks>\d+)W)?
    (?:(?P<days>\d+)D)?
    (?:T
        (?:(?P<hours>\d+)H)?
        (?:(?P<minutes>\d+)M)?
        (?:(?P<seconds>\d+(?:\.\d+)?)S)?
    )?$
";

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DURATION_RE).expect("duration regex is valid"))
}

/// Current wall-clock timestamp (UTC, naive)
pub fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DFMT).map_err(|e| Error::Codec(format!("date `{s}`: {e}")))
}

pub fn format_date(d: NaiveDate) -> String {
    d.format(DFMT).to_string()
}

pub fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, TFMT).map_err(|e| Error::Codec(format!("time `{s}`: {e}")))
}

pub fn format_time(t: NaiveTime) -> String {
    t.format(TFMT).to_string()
}

pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, DTFMT) {
        return Ok(dt);
    }
    // Bare dates are accepted and promoted to midnight
    parse_date(s)
        .map(|d| d.and_hms_opt(0, 0, 0).unwrap())
        .map_err(|_| Error::Codec(format!("timestamp `{s}`")))
}

pub fn format_timestamp(dt: NaiveDateTime) -> String {
    dt.format(DTFMT).to_string()
}

/// Parse an ISO-8601 duration (`P[nY][nM][nW][nD][T[nH][nM][nS]]`)
///
/// Calendar units are fixed-width: a year is 365 days and a month 30 days.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let caps = duration_re()
        .captures(s)
        .ok_or_else(|| Error::Codec(format!("duration `{s}`")))?;

    let group = |name: &str| -> i64 {
        caps.name(name)
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .unwrap_or(0)
    };

    let mut out = Duration::days(group("years") * 365)
        + Duration::days(group("months") * 30)
        + Duration::weeks(group("weeks"))
        + Duration::days(group("days"))
        + Duration::hours(group("hours"))
        + Duration::minutes(group("minutes"));

    if let Some(secs) = caps.name("seconds") {
        let secs: f64 = secs
            .as_str()
            .parse()
            .map_err(|_| Error::Codec(format!("duration `{s}`")))?;
        out += Duration::milliseconds((secs * 1e3).round() as i64);
    }

    if out == Duration::zero() && !s.contains('0') {
        // "P" or "PT" alone carry no designators
        return Err(Error::Codec(format!("duration `{s}`")));
    }
    Ok(out)
}

/// Emit the canonical form of a duration: days plus an optional time part
///
/// The canonical form never uses year/month/week designators, so
/// `parse_duration(format_duration(d)) == d` for any non-negative duration
/// with whole-millisecond precision.
pub fn format_duration(d: Duration) -> String {
    let mut out = String::from("P");
    let days = d.num_days();
    let mut rest = d - Duration::days(days);

    if days > 0 {
        out.push_str(&format!("{days}D"));
    }
    if rest > Duration::zero() {
        out.push('T');
        let hours = rest.num_hours();
        rest -= Duration::hours(hours);
        let minutes = rest.num_minutes();
        rest -= Duration::minutes(minutes);
        let millis = rest.num_milliseconds();
        if hours > 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes > 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if millis > 0 {
            if millis % 1000 == 0 {
                out.push_str(&format!("{}S", millis / 1000));
            } else {
                out.push_str(&format!("{}S", millis as f64 / 1e3));
            }
        }
    } else if days == 0 {
        out.push_str("T0S");
    }
    out
}

/// Parse an offset-of-day (`HH:MM:SS`) into a duration since midnight
pub fn parse_day_offset(s: &str) -> Result<Duration> {
    let t = parse_time(s)?;
    Ok(t.signed_duration_since(NaiveTime::from_hms_opt(0, 0, 0).unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_round_trip() {
        for s in ["2020-01-01T00:00:00", "2023-06-30T15:45:59"] {
            assert_eq!(format_timestamp(parse_timestamp(s).unwrap()), s);
        }
    }

    #[test]
    fn bare_date_promotes_to_midnight() {
        let dt = parse_timestamp("2020-01-01").unwrap();
        assert_eq!(format_timestamp(dt), "2020-01-01T00:00:00");
    }

    #[test]
    fn duration_grammar() {
        assert_eq!(parse_duration("P1D").unwrap(), Duration::days(1));
        assert_eq!(parse_duration("PT1M").unwrap(), Duration::minutes(1));
        assert_eq!(parse_duration("PT15M").unwrap(), Duration::minutes(15));
        assert_eq!(parse_duration("P1W").unwrap(), Duration::days(7));
        assert_eq!(parse_duration("P1Y").unwrap(), Duration::days(365));
        assert_eq!(
            parse_duration("P1DT2H30M").unwrap(),
            Duration::days(1) + Duration::hours(2) + Duration::minutes(30)
        );
        assert_eq!(parse_duration("PT0.5S").unwrap(), Duration::milliseconds(500));
        assert!(parse_duration("1D").is_err());
        assert!(parse_duration("P").is_err());
    }

    #[test]
    fn duration_round_trip_on_canonical_values() {
        for d in [
            Duration::minutes(1),
            Duration::hours(6),
            Duration::days(1),
            Duration::days(7),
            Duration::days(1) + Duration::hours(2) + Duration::minutes(30),
            Duration::seconds(90),
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }

    #[test]
    fn day_offsets() {
        assert_eq!(
            parse_day_offset("09:30:00").unwrap(),
            Duration::hours(9) + Duration::minutes(30)
        );
        assert_eq!(parse_day_offset("00:00:00").unwrap(), Duration::zero());
    }
}
