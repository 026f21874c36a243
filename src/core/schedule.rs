//! Schedule matching for the maintenance gate service.
//!
//! This module evaluates one-off gating windows and recurring rules
//! against the current time, across configurable timezones.

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use log::debug;

use crate::core::settings::{Frequency, RecurringRule};

/// Sentinel timezone name meaning "use the site default".
const SITE_TIMEZONE: &str = "site";

/// Whether a one-off window is active at `now` (UTC timestamp).
///
/// Both bounds present is the inclusive interval `[start, end]`; a single
/// bound makes the window open-ended on the other side; no bounds at all
/// means the window never activates.
pub fn is_window_active(now: i64, start: Option<i64>, end: Option<i64>) -> bool {
    match (start, end) {
        (Some(start), Some(end)) => now >= start && now <= end,
        (Some(start), None) => now >= start,
        (None, Some(end)) => now <= end,
        (None, None) => false,
    }
}

/// Parse a strict `H:MM` / `HH:MM` time-of-day into a minute of the day
/// (0..=1439). Anything else is unparseable.
pub fn parse_minute_of_day(value: &str) -> Option<u32> {
    let (hours, minutes) = value.split_once(':')?;
    if hours.is_empty() || hours.len() > 2 || minutes.len() != 2 {
        return None;
    }
    if !hours.bytes().all(|b| b.is_ascii_digit()) || !minutes.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let h: u32 = hours.parse().ok()?;
    let m: u32 = minutes.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Minute-of-day range membership, wraparound-aware.
///
/// `start == end` is a degenerate range and never matches. `start > end`
/// wraps past midnight, e.g. 22:00-06:00 covers late evening and early
/// morning.
pub fn minute_in_range(now: u32, start: u32, end: u32) -> bool {
    if start == end {
        false
    } else if start < end {
        now >= start && now <= end
    } else {
        now >= start || now <= end
    }
}

/// Resolve a timezone name. An explicit IANA name is honored; the "site"
/// sentinel, an empty name, or an unparseable name falls back to the site
/// default (itself falling back to UTC).
pub fn resolve_timezone(name: &str, site_default: &str) -> Tz {
    let trimmed = name.trim();
    if !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case(SITE_TIMEZONE) {
        if let Ok(tz) = trimmed.parse::<Tz>() {
            return tz;
        }
        debug!("unknown timezone {:?}, using site default", trimmed);
    }
    site_default.trim().parse::<Tz>().unwrap_or(Tz::UTC)
}

/// Whether a recurring rule is active at `now_utc`.
///
/// The current time is converted into the rule's zone (or the site
/// default), checked against the rule's minute range, and then against the
/// frequency-specific day restriction.
pub fn is_recurring_active(rule: &RecurringRule, now_utc: DateTime<Utc>, site_timezone: &str) -> bool {
    let (start, end) = match (
        parse_minute_of_day(&rule.start_time),
        parse_minute_of_day(&rule.end_time),
    ) {
        (Some(start), Some(end)) => (start, end),
        _ => return false,
    };

    let tz = resolve_timezone(&rule.timezone, site_timezone);
    let local = now_utc.with_timezone(&tz);
    let now_minutes = local.hour() * 60 + local.minute();

    if !minute_in_range(now_minutes, start, end) {
        return false;
    }

    match rule.frequency {
        Frequency::Daily => true,
        Frequency::Weekly => {
            let iso_day = local.weekday().number_from_monday() as u8;
            rule.days_of_week.contains(&iso_day)
        }
        Frequency::Monthly => rule.days_of_month.contains(&(local.day() as u8)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn rule(frequency: Frequency, tz: &str, start: &str, end: &str) -> RecurringRule {
        RecurringRule {
            frequency,
            timezone: tz.to_string(),
            start_time: start.to_string(),
            end_time: end.to_string(),
            days_of_week: BTreeSet::new(),
            days_of_month: BTreeSet::new(),
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn window_with_both_bounds_is_inclusive() {
        assert!(!is_window_active(99, Some(100), Some(200)));
        assert!(is_window_active(100, Some(100), Some(200)));
        assert!(is_window_active(200, Some(100), Some(200)));
        assert!(!is_window_active(201, Some(100), Some(200)));
    }

    #[test]
    fn one_sided_windows_are_open_ended() {
        assert!(is_window_active(i64::MAX, Some(100), None));
        assert!(!is_window_active(99, Some(100), None));
        assert!(is_window_active(i64::MIN, None, Some(200)));
        assert!(!is_window_active(201, None, Some(200)));
    }

    #[test]
    fn window_without_bounds_is_inactive() {
        assert!(!is_window_active(0, None, None));
    }

    #[test]
    fn minute_parsing_is_strict() {
        assert_eq!(parse_minute_of_day("0:00"), Some(0));
        assert_eq!(parse_minute_of_day("9:05"), Some(545));
        assert_eq!(parse_minute_of_day("23:59"), Some(1439));
        assert_eq!(parse_minute_of_day("24:00"), None);
        assert_eq!(parse_minute_of_day("12:60"), None);
        assert_eq!(parse_minute_of_day("12:5"), None);
        assert_eq!(parse_minute_of_day("12"), None);
        assert_eq!(parse_minute_of_day("ab:cd"), None);
        assert_eq!(parse_minute_of_day(""), None);
        assert_eq!(parse_minute_of_day("-1:30"), None);
    }

    #[test]
    fn degenerate_minute_range_never_matches() {
        assert!(!minute_in_range(600, 600, 600));
        assert!(!minute_in_range(599, 600, 600));
    }

    #[test]
    fn wraparound_daily_rule_covers_both_sides_of_midnight() {
        let r = rule(Frequency::Daily, "UTC", "22:00", "06:00");
        // 23:30 local
        assert!(is_recurring_active(&r, utc(2024, 1, 2, 23, 30), "UTC"));
        // 02:00 local
        assert!(is_recurring_active(&r, utc(2024, 1, 3, 2, 0), "UTC"));
        // 12:00 local
        assert!(!is_recurring_active(&r, utc(2024, 1, 3, 12, 0), "UTC"));
    }

    #[test]
    fn weekly_rule_requires_day_match() {
        let mut r = rule(Frequency::Weekly, "UTC", "00:00", "23:59");
        r.days_of_week = [6u8, 7].iter().copied().collect();

        // 2024-01-03 is a Wednesday, 2024-01-06 a Saturday.
        assert!(!is_recurring_active(&r, utc(2024, 1, 3, 10, 0), "UTC"));
        assert!(is_recurring_active(&r, utc(2024, 1, 6, 10, 0), "UTC"));
        assert!(is_recurring_active(&r, utc(2024, 1, 7, 10, 0), "UTC"));
    }

    #[test]
    fn monthly_rule_requires_day_of_month_match() {
        let mut r = rule(Frequency::Monthly, "UTC", "08:00", "18:00");
        r.days_of_month = [1u8, 15].iter().copied().collect();

        assert!(is_recurring_active(&r, utc(2024, 1, 15, 9, 0), "UTC"));
        assert!(!is_recurring_active(&r, utc(2024, 1, 16, 9, 0), "UTC"));
        // Day matches but time does not.
        assert!(!is_recurring_active(&r, utc(2024, 1, 15, 7, 0), "UTC"));
    }

    #[test]
    fn rule_is_evaluated_in_its_own_timezone() {
        let r = rule(Frequency::Daily, "America/New_York", "20:00", "22:00");
        // 02:00 UTC on Jan 3 is 21:00 on Jan 2 in New York (UTC-5).
        assert!(is_recurring_active(&r, utc(2024, 1, 3, 2, 0), "UTC"));
        assert!(!is_recurring_active(&r, utc(2024, 1, 3, 12, 0), "UTC"));
    }

    #[test]
    fn weekly_day_follows_local_date_not_utc() {
        let mut r = rule(Frequency::Weekly, "America/New_York", "00:00", "23:59");
        r.days_of_week = [3u8].iter().copied().collect(); // Wednesday only

        // 2024-01-04 01:00 UTC is still Wednesday Jan 3 in New York.
        assert!(is_recurring_active(&r, utc(2024, 1, 4, 1, 0), "UTC"));
        // Midday UTC on Thursday is Thursday in New York too.
        assert!(!is_recurring_active(&r, utc(2024, 1, 4, 17, 0), "UTC"));
    }

    #[test]
    fn timezone_resolution_falls_back_to_site_default() {
        assert_eq!(resolve_timezone("Europe/Berlin", "UTC"), chrono_tz::Europe::Berlin);
        assert_eq!(resolve_timezone("site", "Europe/Berlin"), chrono_tz::Europe::Berlin);
        assert_eq!(resolve_timezone("", "Europe/Berlin"), chrono_tz::Europe::Berlin);
        assert_eq!(resolve_timezone("Not/AZone", "Europe/Berlin"), chrono_tz::Europe::Berlin);
        assert_eq!(resolve_timezone("Not/AZone", "also-bad"), Tz::UTC);
    }

    #[test]
    fn unparseable_rule_times_skip_the_rule() {
        let r = rule(Frequency::Daily, "UTC", "22:00", "6pm");
        assert!(!is_recurring_active(&r, utc(2024, 1, 2, 23, 0), "UTC"));
    }
}
