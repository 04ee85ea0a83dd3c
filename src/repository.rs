//! Upsert, notification materialization, and dispatch queries.
//!
//! Grounded on the collector's repository module, with one deliberate fix:
//! the update statement there has a trailing comma before its `WHERE`
//! clause that makes it an invalid statement. It is rewritten correctly here.

use chrono::{DateTime, NaiveDateTime};
use chrono_tz::Tz;
use serde_json::{json, Value};
use sqlx::types::Json as SqlxJson;
use sqlx::{FromRow, MySqlPool};

use crate::error::CoreError;
use crate::model::{first_present, Details, Event, NotificationStatus, NotificationTask, Section};
use crate::store::Store;
use crate::timeutil;

const AMOUNT_KEYS: [&str; 4] = ["amount", "数量", "allocation", "supply"];
const POINTS_KEYS: [&str; 3] = ["points", "积分", "score"];

#[derive(Debug, FromRow)]
struct EventIdRow {
    id: i64,
}

#[derive(Debug, FromRow)]
struct NotificationTaskRow {
    id: i64,
    event_id: i64,
    token: String,
    section: String,
    start_time: Option<NaiveDateTime>,
    raw_time: String,
    offset_minutes: Option<i64>,
    channel: String,
    remind_at: NaiveDateTime,
    attempts: i32,
    details_json: SqlxJson<Value>,
}

fn extract_detail_fields(details: &Details) -> (Option<String>, Option<String>) {
    let amount = first_present(details, &AMOUNT_KEYS).and_then(value_as_string);
    let points = first_present(details, &POINTS_KEYS).and_then(value_as_string);
    (amount, points)
}

fn value_as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn today_matches(details: &Details, today: &str) -> bool {
    match first_present(details, &["date"]).and_then(value_as_string) {
        Some(date) => date == today,
        None => true,
    }
}

fn truncate_reason(reason: &str) -> String {
    reason.chars().take(255).collect()
}

/// Data-access layer backing the collector/notifier pipeline.
pub struct Repository {
    pool: MySqlPool,
}

impl Repository {
    pub async fn new(store: &Store) -> Result<Self, CoreError> {
        Ok(Repository {
            pool: store.pool().await?.clone(),
        })
    }

    /// Inserts new events and updates existing ones, keyed on `(token,
    /// raw_time)`. Events whose `details.date` names a day other than
    /// `now`'s, or whose `raw_time` has no recognizable clock time, are
    /// silently skipped and simply absent from the returned list; callers
    /// must not assume index alignment with the input.
    pub async fn upsert_events(
        &self,
        events: Vec<Event>,
        now: DateTime<Tz>,
    ) -> Result<Vec<(Event, i64)>, CoreError> {
        let today = now.format("%Y-%m-%d").to_string();
        let mut out = Vec::new();

        for event in events {
            if !today_matches(&event.details, &today) {
                continue;
            }
            if !timeutil::has_clock_time(&event.raw_time) {
                continue;
            }

            let (amount, points) = extract_detail_fields(&event.details);
            let details_json = Value::Object(event.details.clone());
            let start_time_naive = event.start_time.map(|dt| dt.naive_local());

            let existing: Option<EventIdRow> = sqlx::query_as(
                "SELECT id FROM alpha_events WHERE token = ? AND raw_time = ?",
            )
            .bind(&event.token)
            .bind(&event.raw_time)
            .fetch_optional(&self.pool)
            .await?;

            let id = if let Some(row) = existing {
                sqlx::query(
                    "UPDATE alpha_events \
                     SET start_time = ?, raw_time = ?, amount = ?, points = ?, details_json = ? \
                     WHERE id = ?",
                )
                .bind(start_time_naive)
                .bind(&event.raw_time)
                .bind(&amount)
                .bind(&points)
                .bind(SqlxJson(details_json))
                .bind(row.id)
                .execute(&self.pool)
                .await?;
                row.id
            } else {
                let result = sqlx::query(
                    "INSERT INTO alpha_events \
                     (token, section, raw_time, start_time, amount, points, details_json, source) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&event.token)
                .bind(event.section.as_str())
                .bind(&event.raw_time)
                .bind(start_time_naive)
                .bind(&amount)
                .bind(&points)
                .bind(SqlxJson(details_json))
                .bind(event.source.as_str())
                .execute(&self.pool)
                .await?;
                result.last_insert_id() as i64
            };

            out.push((event, id));
        }

        Ok(out)
    }

    /// Materializes a pending 30-minute-before reminder for every upserted
    /// event that still has time to send one, ignoring duplicates via the
    /// schema's `(event_id, offset_minutes)` unique key.
    pub async fn ensure_notifications(
        &self,
        paired: &[(Event, i64)],
        channel: &str,
        now: DateTime<Tz>,
    ) -> Result<(), CoreError> {
        for (event, id) in paired {
            let Some(start_time) = event.start_time else {
                continue;
            };
            if now - start_time >= chrono::Duration::minutes(30) {
                continue;
            }
            let remind_at = (start_time - chrono::Duration::minutes(30)).naive_local();
            let display_name = first_present(&event.details, &["display_name"])
                .and_then(value_as_string)
                .unwrap_or_else(|| event.token.clone());
            let metadata = json!({
                "token": event.token,
                "display_name": display_name,
                "section": event.section.as_str(),
            });

            sqlx::query(
                "INSERT IGNORE INTO alpha_notifications \
                 (event_id, offset_minutes, channel, remind_at, metadata) \
                 VALUES (?, 30, ?, ?, ?)",
            )
            .bind(id)
            .bind(channel)
            .bind(remind_at)
            .bind(SqlxJson(metadata))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn fetch_due_notifications(
        &self,
        now: DateTime<Tz>,
    ) -> Result<Vec<NotificationTask>, CoreError> {
        let rows: Vec<NotificationTaskRow> = sqlx::query_as(
            "SELECT n.id, n.event_id, e.token, e.section, e.start_time, e.raw_time, \
                    n.offset_minutes, n.channel, n.remind_at, n.attempts, e.details_json \
             FROM alpha_notifications n \
             JOIN alpha_events e ON e.id = n.event_id \
             WHERE n.status = 'pending' AND n.remind_at <= ? \
             ORDER BY n.remind_at ASC",
        )
        .bind(now.naive_local())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| NotificationTask {
                id: r.id,
                event_id: r.event_id,
                token: r.token,
                section: r.section.parse().unwrap_or(Section::Unknown),
                start_time: r.start_time,
                raw_time: Some(r.raw_time),
                offset_minutes: r.offset_minutes,
                channel: r.channel,
                remind_at: r.remind_at,
                attempts: r.attempts,
                details: r.details_json.0.as_object().cloned().unwrap_or_default(),
            })
            .collect())
    }

    pub async fn mark_notification_sent(
        &self,
        id: i64,
        status: NotificationStatus,
        fail_reason: Option<&str>,
    ) -> Result<(), CoreError> {
        let truncated = fail_reason.map(truncate_reason);
        sqlx::query(
            "UPDATE alpha_notifications \
             SET status = ?, \
                 sent_at = CASE WHEN ? = 'sent' THEN NOW() ELSE sent_at END, \
                 fail_reason = ?, \
                 attempts = attempts + 1 \
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(status.as_str())
        .bind(truncated)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn log_notification_attempt(
        &self,
        notification_id: i64,
        attempt_no: i32,
        endpoint: &str,
        payload: &Value,
        response_code: Option<i32>,
        response_body: Option<&Value>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO alpha_notification_logs \
             (notification_id, attempt_no, endpoint, payload, response_code, response_body) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(notification_id)
        .bind(attempt_no)
        .bind(endpoint)
        .bind(SqlxJson(payload.clone()))
        .bind(response_code)
        .bind(response_body.cloned().map(SqlxJson))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_reason_respects_char_count_not_bytes() {
        let long = "é".repeat(300);
        let truncated = truncate_reason(&long);
        assert_eq!(truncated.chars().count(), 255);
    }

    #[test]
    fn today_matches_allows_missing_date_field() {
        let details = Details::new();
        assert!(today_matches(&details, "2024-05-26"));
    }

    #[test]
    fn today_matches_rejects_stale_date_field() {
        let mut details = Details::new();
        details.insert("date".to_string(), Value::String("2024-05-25".to_string()));
        assert!(!today_matches(&details, "2024-05-26"));
    }
}
