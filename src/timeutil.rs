//! Timezone-aware parsing and window checks for heterogeneous event time strings.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;

use crate::error::CoreError;

const TBA_MARKERS: [&str; 7] = ["tba", "to be announced", "待定", "—", "-", "", "na"];
const QUIET_DELIMS: [&str; 3] = ["-", "–", "—"];

/// Resolves an IANA timezone name, rejecting anything chrono-tz doesn't know.
pub fn get_timezone(name: &str) -> Result<Tz, CoreError> {
    name.parse::<Tz>()
        .map_err(|_| CoreError::InvalidTimezone(name.to_string()))
}

pub fn now_in_tz(tz: Tz) -> DateTime<Tz> {
    chrono::Utc::now().with_timezone(&tz)
}

fn is_tba(value: &str) -> bool {
    let lowered = value.trim().to_ascii_lowercase();
    TBA_MARKERS.contains(&lowered.as_str()) || lowered == "n/a"
}

/// Scans for the first `H:MM` or `HH:MM` occurrence, validating ranges.
fn find_hhmm(value: &str) -> Option<(u32, u32)> {
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b':' {
            let mut h_start = i;
            let mut h_digits = 0;
            while h_start > 0 && bytes[h_start - 1].is_ascii_digit() && h_digits < 2 {
                h_start -= 1;
                h_digits += 1;
            }
            let m_start = i + 1;
            let mut m_digits = 0;
            while m_start + m_digits < bytes.len()
                && bytes[m_start + m_digits].is_ascii_digit()
                && m_digits < 2
            {
                m_digits += 1;
            }
            if h_digits >= 1 && m_digits == 2 {
                let before_is_digit = h_start > 0 && bytes[h_start - 1].is_ascii_digit();
                let after_is_digit =
                    m_start + m_digits < bytes.len() && bytes[m_start + m_digits].is_ascii_digit();
                if !before_is_digit && !after_is_digit {
                    if let (Ok(h), Ok(m)) = (
                        value[h_start..i].parse::<u32>(),
                        value[m_start..m_start + m_digits].parse::<u32>(),
                    ) {
                        if h <= 23 && m <= 59 {
                            return Some((h, m));
                        }
                    }
                }
            }
        }
        i += 1;
    }
    None
}

/// Scans for the first `YYYY-MM-DD` occurrence.
fn find_date(value: &str) -> Option<NaiveDate> {
    let bytes = value.as_bytes();
    if bytes.len() < 10 {
        return None;
    }
    for start in 0..=(bytes.len() - 10) {
        let slice = &value[start..start + 10];
        if slice.as_bytes()[4] == b'-' && slice.as_bytes()[7] == b'-' {
            if let Ok(date) = NaiveDate::parse_from_str(slice, "%Y-%m-%d") {
                return Some(date);
            }
        }
    }
    None
}

fn parse_iso(value: &str, tz: Tz) -> Option<DateTime<Tz>> {
    let normalized = if let Some(stripped) = value.strip_suffix('Z') {
        format!("{stripped}+00:00")
    } else {
        value.to_string()
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt.with_timezone(&tz));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(&normalized, fmt) {
            if let Some(dt) = tz.from_local_datetime(&naive).single() {
                return Some(dt);
            }
        }
    }
    None
}

/// Parses a heterogeneous `raw_time` string relative to `reference`.
///
/// Tries, in order: an ISO-8601 datetime, an `HH:MM` clock time (rolled
/// forward a day if it would otherwise land more than an hour in the past),
/// then a bare `YYYY-MM-DD` date. Returns `None` for TBA markers, blanks, and
/// anything none of the three strategies can make sense of.
pub fn parse_event_time(
    raw_time: &str,
    tz: Tz,
    reference: DateTime<Tz>,
) -> Option<DateTime<Tz>> {
    let trimmed = raw_time.trim();
    if trimmed.is_empty() || is_tba(trimmed) {
        return None;
    }
    if let Some(dt) = parse_iso(trimmed, tz) {
        return Some(dt);
    }
    if let Some((h, m)) = find_hhmm(trimmed) {
        let naive_time = NaiveTime::from_hms_opt(h, m, 0)?;
        let candidate_naive = reference.date_naive().and_time(naive_time);
        let candidate = tz.from_local_datetime(&candidate_naive).single()?;
        if candidate < reference - Duration::hours(1) {
            return Some(candidate + Duration::days(1));
        }
        return Some(candidate);
    }
    if let Some(date) = find_date(trimmed) {
        return tz.from_local_datetime(&date.and_hms_opt(0, 0, 0)?).single();
    }
    None
}

/// True if `value` contains a recognizable `HH:MM` clock time anywhere in it.
pub fn has_clock_time(value: &str) -> bool {
    find_hhmm(value).is_some()
}

/// `event_time` has not yet passed and lands within `ahead_minutes` of `now`.
pub fn is_within_window(
    event_time: Option<DateTime<Tz>>,
    now: DateTime<Tz>,
    ahead_minutes: i64,
) -> bool {
    let Some(et) = event_time else {
        return false;
    };
    if et < now {
        return false;
    }
    (et - now) <= Duration::minutes(ahead_minutes)
}

fn parse_hhmm_time(value: &str) -> Option<NaiveTime> {
    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.len() != 2 {
        return None;
    }
    let h: u32 = parts[0].trim().parse().ok()?;
    let m: u32 = parts[1].trim().parse().ok()?;
    NaiveTime::from_hms_opt(h, m, 0)
}

/// Parses a `"HH:MM-HH:MM"` style quiet-hours window, trying several
/// delimiters before falling back to a plain whitespace split.
pub fn parse_quiet_hours(text: &str) -> Option<(NaiveTime, NaiveTime)> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    for delim in QUIET_DELIMS {
        if let Some(idx) = trimmed.find(delim) {
            let (left, right) = (&trimmed[..idx], &trimmed[idx + delim.len()..]);
            if let (Some(start), Some(end)) = (parse_hhmm_time(left), parse_hhmm_time(right)) {
                return Some((start, end));
            }
        }
    }
    if trimmed.to_ascii_lowercase().contains(" to ") {
        if let Some(idx) = trimmed.to_ascii_lowercase().find(" to ") {
            let (left, right) = (&trimmed[..idx], &trimmed[idx + 4..]);
            if let (Some(start), Some(end)) = (parse_hhmm_time(left), parse_hhmm_time(right)) {
                return Some((start, end));
            }
        }
    }
    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    if parts.len() == 2 {
        if let (Some(start), Some(end)) = (parse_hhmm_time(parts[0]), parse_hhmm_time(parts[1])) {
            return Some((start, end));
        }
    }
    None
}

/// `[start, end)`, wrapping past midnight when `start > end`.
pub fn in_quiet_hours(now: DateTime<Tz>, window: Option<(NaiveTime, NaiveTime)>) -> bool {
    let Some((start, end)) = window else {
        return false;
    };
    let now_time = now.time();
    if start <= end {
        now_time >= start && now_time < end
    } else {
        now_time >= start || now_time < end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use chrono::Timelike;
    use chrono_tz::Asia::Taipei;

    fn at(y: i32, m: u32, d: u32, h: u32, mi: u32) -> DateTime<Tz> {
        Taipei
            .from_local_datetime(
                &NaiveDate::from_ymd_opt(y, m, d)
                    .unwrap()
                    .and_hms_opt(h, mi, 0)
                    .unwrap(),
            )
            .single()
            .unwrap()
    }

    #[test]
    fn parse_event_time_hhmm_rolls_over_midnight() {
        let reference = at(2024, 5, 26, 23, 30);
        let parsed = parse_event_time("00:15", Taipei, reference).unwrap();
        assert_eq!(parsed.date_naive().day(), 27);
        assert_eq!(parsed.time().hour(), 0);
        assert_eq!(parsed.time().minute(), 15);
    }

    #[test]
    fn parse_event_time_hhmm_same_day_when_recent_past() {
        let reference = at(2024, 5, 26, 10, 0);
        let parsed = parse_event_time("09:30", Taipei, reference).unwrap();
        assert_eq!(parsed.date_naive().day(), 26);
        assert_eq!(parsed.time().hour(), 9);
    }

    #[test]
    fn parse_event_time_recognizes_tba() {
        let reference = at(2024, 5, 26, 10, 0);
        assert!(parse_event_time("TBA", Taipei, reference).is_none());
        assert!(parse_event_time("待定", Taipei, reference).is_none());
        assert!(parse_event_time("", Taipei, reference).is_none());
    }

    #[test]
    fn parse_quiet_hours_handles_wraparound() {
        let (start, end) = parse_quiet_hours("22:00-07:30").unwrap();
        assert_eq!(start.hour(), 22);
        assert_eq!(end.hour(), 7);
        assert_eq!(end.minute(), 30);
    }

    #[test]
    fn in_quiet_hours_wraps_past_midnight() {
        let window = parse_quiet_hours("22:00-07:30");
        assert!(in_quiet_hours(at(2024, 5, 26, 23, 0), window));
        assert!(in_quiet_hours(at(2024, 5, 26, 3, 0), window));
        assert!(!in_quiet_hours(at(2024, 5, 26, 12, 0), window));
    }

    #[test]
    fn is_within_window_excludes_past_events() {
        let now = at(2024, 5, 26, 10, 0);
        let event_time = at(2024, 5, 26, 9, 59);
        assert!(!is_within_window(Some(event_time), now, 30));
    }

    #[test]
    fn is_within_window_accepts_near_future() {
        let now = at(2024, 5, 26, 10, 0);
        let event_time = at(2024, 5, 26, 10, 29);
        assert!(is_within_window(Some(event_time), now, 30));
    }
}
