//! Duty window arithmetic.
//!
//! A duty roster covers 24h starting 08:00 Istanbul time. Turkey has stayed
//! on UTC+3 all year since 2016, so a fixed offset is enough.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use once_cell::sync::Lazy;

/// Local hour at which the roster rolls over to the next duty date.
pub const ROLLOVER_HOUR: u32 = 8;

static ISTANBUL: Lazy<FixedOffset> = Lazy::new(|| FixedOffset::east_opt(3 * 3600).unwrap());

pub fn istanbul() -> FixedOffset {
    *ISTANBUL
}

pub fn to_istanbul(now: DateTime<Utc>) -> DateTime<FixedOffset> {
    now.with_timezone(&istanbul())
}

/// Duty date active at `now`: before 08:00 local it is still yesterday's roster.
pub fn active_duty_date(now: DateTime<Utc>) -> NaiveDate {
    let local = to_istanbul(now);
    let today = local.date_naive();
    if local.hour() < ROLLOVER_HOUR {
        today.pred_opt().unwrap_or(today)
    } else {
        today
    }
}

/// Dates a scraped page may legitimately describe at `now`.
///
/// Always the local calendar date; before the rollover also yesterday,
/// because the previous roster is still on duty.
pub fn accepted_dates(now: DateTime<Utc>) -> Vec<NaiveDate> {
    let local = to_istanbul(now);
    let today = local.date_naive();
    let mut out = vec![today];
    if local.hour() < ROLLOVER_HOUR {
        if let Some(y) = today.pred_opt() {
            out.push(y);
        }
    }
    out
}

/// `[start, end)` of the duty window for `date`, in UTC.
pub fn window_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let rollover = NaiveTime::from_hms_opt(ROLLOVER_HOUR, 0, 0).unwrap_or(NaiveTime::MIN);
    let local_start = date.and_time(rollover);
    let start = istanbul()
        .from_local_datetime(&local_start)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&local_start));
    (start, start + Duration::hours(24))
}

/// Canonical timestamp text used in every persisted column.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
