//! Timestamp handling.
//!
//! Every timestamp the store persists goes through [`format_ts`], which emits
//! fixed-width UTC (`YYYY-MM-DDTHH:MM:SS.mmmZ`). With a single fixed width,
//! string comparison in SQL and in Rust matches chronological order.

use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime, UtcOffset};

/// Watermark reported for sessions the store has never seen.
pub const EPOCH: &str = "1970-01-01T00:00:00.000Z";

pub fn format_ts(dt: OffsetDateTime) -> String {
    let dt = dt.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        dt.year(),
        u8::from(dt.month()),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second(),
        dt.millisecond()
    )
}

pub fn parse_ts(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s.trim(), &Rfc3339).ok()
}

/// Parse an RFC 3339 timestamp and re-emit it in canonical form.
pub fn normalize_ts(s: &str) -> Option<String> {
    parse_ts(s).map(format_ts)
}

pub fn now_ts() -> String {
    format_ts(OffsetDateTime::now_utc())
}

/// Canonical timestamp `days` days before now.
pub fn days_ago(days: u32) -> String {
    format_ts(OffsetDateTime::now_utc() - Duration::days(i64::from(days)))
}

pub fn from_unix(secs: i64) -> Option<String> {
    OffsetDateTime::from_unix_timestamp(secs).ok().map(format_ts)
}

/// Whole seconds elapsed between `ts` and `now`, clamped at zero.
pub fn age_secs(ts: &str, now: OffsetDateTime) -> Option<u64> {
    let then = parse_ts(ts)?;
    let secs = (now - then).whole_seconds();
    Some(secs.max(0) as u64)
}
