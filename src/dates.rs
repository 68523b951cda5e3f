use chrono::{FixedOffset, NaiveDate, Utc};

/// Fixed UTC+1 offset for the target locale. The upstream publishes one
/// archive per calendar date, so DST is ignored; at a DST boundary "today"
/// can differ from wall-clock by at most one day.
const LOCAL_OFFSET_SECS: i32 = 3600;

/// Today's date in the target locale as `YYYY-MM-DD`.
pub fn today() -> String {
    let offset = FixedOffset::east_opt(LOCAL_OFFSET_SECS).expect("offset in range");
    Utc::now()
        .with_timezone(&offset)
        .date_naive()
        .format("%Y-%m-%d")
        .to_string()
}

/// Whether `s` is a well-formed `YYYY-MM-DD` calendar date.
///
/// Dates are kept as strings throughout and compared lexically; this is the
/// only place that validates the shape.
pub fn is_valid(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

/// Epoch seconds for `ingested_at` timestamps.
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}
