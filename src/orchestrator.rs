//! Ties extraction, persistence, and notification dispatch into a single
//! tick, combining the collector's ingest pass and the notifier's dispatch
//! pass into the one worker loop this deployment runs.

use chrono::TimeZone;
use chrono_tz::Tz;
use serde_json::json;

use crate::config::Config;
use crate::error::CoreError;
use crate::extractor::{self, BrowserSession};
use crate::model::{Event, NotificationStatus, Section};
use crate::notifier::{Notifier, ReminderContext};
use crate::repository::Repository;
use crate::timeutil;

pub struct Orchestrator {
    config: Config,
    tz: Tz,
    repository: Repository,
    notifier: Notifier,
    session: Box<dyn BrowserSession>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        tz: Tz,
        repository: Repository,
        notifier: Notifier,
        session: Box<dyn BrowserSession>,
    ) -> Self {
        Orchestrator {
            config,
            tz,
            repository,
            notifier,
            session,
        }
    }

    /// Runs one ingest-then-dispatch cycle. Extraction failures are logged
    /// and swallowed here so a single bad navigation never aborts the
    /// worker loop; persistence and dispatch errors propagate, since those
    /// indicate the database itself is unreachable.
    pub async fn tick(&self) -> Result<(), CoreError> {
        let now = timeutil::now_in_tz(self.tz);

        let events = match extractor::fetch_events(self.session.as_ref(), now.date_naive()).await {
            Ok(events) => events,
            Err(err) => {
                tracing::error!(error = %err, "extraction failed, skipping this tick's ingest");
                Vec::new()
            }
        };

        if !events.is_empty() {
            self.ingest(events, now).await?;
        }

        self.dispatch(now).await?;
        Ok(())
    }

    async fn ingest(&self, mut events: Vec<Event>, now: chrono::DateTime<Tz>) -> Result<(), CoreError> {
        for event in &mut events {
            event.start_time = timeutil::parse_event_time(&event.raw_time, self.tz, now);
        }

        let today = now.date_naive();
        let survivors: Vec<Event> = events
            .into_iter()
            .filter(|e| matches!(e.start_time, Some(st) if st.date_naive() == today))
            .map(|mut e| {
                e.section = Section::Today;
                e
            })
            .collect();

        if survivors.is_empty() {
            return Ok(());
        }

        let paired = self.repository.upsert_events(survivors, now).await?;
        tracing::info!(count = paired.len(), "upserted events");
        self.repository
            .ensure_notifications(&paired, &self.config.spug_channel, now)
            .await?;
        Ok(())
    }

    async fn dispatch(&self, now: chrono::DateTime<Tz>) -> Result<(), CoreError> {
        let quiet = timeutil::in_quiet_hours(now, self.config.quiet_hours);
        let tasks = self.repository.fetch_due_notifications(now).await?;
        if !tasks.is_empty() {
            tracing::info!(count = tasks.len(), quiet, "dispatching due notifications");
        }

        for task in tasks {
            let event_time = task.start_time.map(|naive| {
                self.tz
                    .from_local_datetime(&naive)
                    .single()
                    .unwrap_or_else(|| now)
            });

            if let Some(event_time) = event_time {
                if event_time > now {
                    self.fail_task(&task, "event_time_in_future").await?;
                    continue;
                }
            }

            let ctx = ReminderContext {
                token: task.token.clone(),
                section: task.section,
                start_time: event_time,
                raw_time: task.raw_time.clone(),
                offset_minutes: task.offset_minutes,
                details: task.details.clone(),
            };

            let attempt_no = task.attempts + 1;
            match self.notifier.send(&ctx, quiet).await {
                Ok(result) => {
                    tracing::info!(token = %task.token, notification_id = task.id, "notification sent");
                    self.repository
                        .log_notification_attempt(
                            task.id,
                            attempt_no,
                            &result.endpoint,
                            &result.payload,
                            result.status_code.map(|s| s as i32),
                            result.response_body.as_ref(),
                        )
                        .await?;
                    self.repository
                        .mark_notification_sent(task.id, NotificationStatus::Sent, None)
                        .await?;
                }
                Err(CoreError::Transport { status, body }) => {
                    tracing::warn!(token = %task.token, notification_id = task.id, status = ?status, "notification send failed after retries");
                    self.repository
                        .log_notification_attempt(
                            task.id,
                            attempt_no,
                            "/error",
                            &json!({"token": task.token, "reason": body}),
                            status.map(|s| s as i32),
                            Some(&json!({"error": body})),
                        )
                        .await?;
                    self.repository
                        .mark_notification_sent(task.id, NotificationStatus::Failed, Some(&body))
                        .await?;
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    async fn fail_task(
        &self,
        task: &crate::model::NotificationTask,
        reason: &str,
    ) -> Result<(), CoreError> {
        self.repository
            .log_notification_attempt(
                task.id,
                task.attempts + 1,
                "/error",
                &json!({"token": task.token, "reason": reason}),
                None,
                Some(&json!({"error": reason})),
            )
            .await?;
        self.repository
            .mark_notification_sent(task.id, NotificationStatus::Failed, Some(reason))
            .await
    }
}
