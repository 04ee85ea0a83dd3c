//! Shared data types passed between the extractor, repository, and notifier.

use chrono::{DateTime, NaiveDateTime};
use chrono_tz::Tz;
use serde_json::Value;

/// Free-form per-event attributes (amount, points, date, or anything else a
/// source happens to expose) that don't have a dedicated column.
pub type Details = serde_json::Map<String, Value>;

/// Which listing board an event was scraped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Today,
    Upcoming,
    Unknown,
}

impl Section {
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Today => "today",
            Section::Upcoming => "upcoming",
            Section::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Section {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "today" => Ok(Section::Today),
            "upcoming" => Ok(Section::Upcoming),
            _ => Ok(Section::Unknown),
        }
    }
}

/// Which extraction pathway produced an event, used to resolve collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Json,
    Dom,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Json => "json",
            EventSource::Dom => "dom",
        }
    }
}

/// A single airdrop/listing entry as scraped, before it gets a database id.
#[derive(Debug, Clone)]
pub struct Event {
    pub token: String,
    pub section: Section,
    pub raw_time: String,
    pub start_time: Option<DateTime<Tz>>,
    pub details: Details,
    pub source: EventSource,
    pub url: Option<String>,
}

impl Event {
    /// Identity used for merge/dedup: two events with the same section,
    /// token, and raw time string refer to the same listing entry.
    pub fn identity_key(&self) -> (Section, String, String) {
        (self.section, self.token.clone(), self.raw_time.clone())
    }
}

/// Looks up the first present key among `keys`, trying the value as-is,
/// capitalized, upper-cased, and lower-cased, mirroring the collector's
/// permissive field-name matching.
pub fn first_present<'a>(details: &'a Details, keys: &[&str]) -> Option<&'a Value> {
    for key in keys {
        for variant in [
            key.to_string(),
            capitalize(key),
            key.to_ascii_uppercase(),
            key.to_ascii_lowercase(),
        ] {
            if let Some(v) = details.get(&variant) {
                return Some(v);
            }
        }
    }
    None
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// A persisted notification row joined with its parent event, as read back
/// for dispatch.
#[derive(Debug, Clone)]
pub struct NotificationTask {
    pub id: i64,
    pub event_id: i64,
    pub token: String,
    pub section: Section,
    pub start_time: Option<NaiveDateTime>,
    pub raw_time: Option<String>,
    pub offset_minutes: Option<i64>,
    pub channel: String,
    pub remind_at: NaiveDateTime,
    pub attempts: i32,
    pub details: Details,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }
}
