//! Alert evaluation and scheduling.
//!
//! A recurring tick walks the armed alert rules, computes each task's
//! cumulative tracked time, and fires a notification when the elapsed
//! time crosses the rule's threshold. The rule is disarmed only after
//! the sink confirms delivery -- at-most-once per arm cycle. A sink
//! failure leaves the rule armed and the next tick retries.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;

use crate::accounting::time_in_tracked;
use crate::alert::format_elapsed;
use crate::error::{CoreError, Result, SinkError};
use crate::storage::Database;

/// Grace period subtracted from the threshold so a tick landing just
/// short of the boundary still fires, absorbing scheduler jitter.
pub const DEFAULT_TOLERANCE_SECS: u64 = 30;

/// What gets handed to the notification sink when a rule fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Sink-defined destination from the alert rule.
    pub destination: String,
    pub task_id: String,
    pub task_name: String,
    /// Elapsed tracked time at fire, in whole seconds.
    pub elapsed_secs: u64,
    /// Elapsed time as presented to a human ("2 hours and 5 minutes").
    pub elapsed_human: String,
    pub deep_link: Option<String>,
}

/// Delivers fired notifications. The transport is the implementation's
/// concern; the evaluator only needs confirmed success or failure.
pub trait NotificationSink: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<(), SinkError>;
}

/// Summary of one evaluation tick.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TickSummary {
    /// Armed rules examined.
    pub evaluated: usize,
    /// Rules skipped because the task is not currently tracked, or is
    /// in the unrepaired cold-start state.
    pub skipped: usize,
    /// Notifications delivered and rules disarmed.
    pub fired: usize,
    /// Sink failures; those rules stay armed for the next tick.
    pub failures: usize,
}

/// Periodic and on-demand alert evaluation over armed rules.
pub struct Evaluator {
    db: Arc<Database>,
    sink: Box<dyn NotificationSink>,
    tolerance_secs: u64,
}

impl Evaluator {
    pub fn new(db: Arc<Database>, sink: Box<dyn NotificationSink>) -> Self {
        Self {
            db,
            sink,
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    /// Override the jitter tolerance (seconds).
    pub fn with_tolerance(mut self, tolerance_secs: u64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    /// Evaluate every armed rule once.
    ///
    /// Storage read failures abort the tick; sink failures are counted
    /// and the affected rules stay armed.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let mut summary = TickSummary::default();

        for alert in self.db.armed_alerts()? {
            summary.evaluated += 1;

            // The measurement only applies while the task is tracked.
            if !alert.task_status_class.is_tracked() {
                summary.skipped += 1;
                continue;
            }

            let history = self.db.transition_history(&alert.rule.task_id)?;
            let time = time_in_tracked(&history, true);
            if time.open_session_start.is_none() {
                // Unrepaired cold start: zero elapsed until the next
                // ingestion backfills the entry. Skip this tick.
                summary.skipped += 1;
                continue;
            }

            let elapsed = time.elapsed_at(now);
            let threshold = alert.rule.threshold_secs;
            if elapsed + self.tolerance_secs < threshold {
                continue;
            }

            let notification = Notification {
                destination: alert.rule.destination.clone(),
                task_id: alert.rule.task_id.clone(),
                task_name: alert.task_name.clone(),
                elapsed_secs: elapsed,
                elapsed_human: format_elapsed(elapsed),
                deep_link: alert.deep_link.clone(),
            };

            match self.sink.send(&notification) {
                Ok(()) => {
                    // Disarm only after confirmed delivery. If this
                    // write fails, the worst case is a duplicate
                    // notification next tick -- acceptable; the
                    // reverse (disarmed without delivery) is not.
                    self.db.disarm_alert(&alert.rule.task_id, now)?;
                    summary.fired += 1;
                }
                Err(_) => {
                    summary.failures += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Run the recurring evaluation loop.
    ///
    /// Ticks never overlap: each tick runs to completion before the
    /// next is scheduled, and a missed deadline delays rather than
    /// bursts. The tick itself does synchronous I/O (SQLite, blocking
    /// sinks), so it runs on the blocking pool and never stalls the
    /// timer driver. Tick errors are reported through `on_tick` along
    /// with summaries; the loop itself never exits.
    pub async fn run<F>(self: Arc<Self>, period: StdDuration, mut on_tick: F)
    where
        F: FnMut(Result<TickSummary>),
    {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let this = Arc::clone(&self);
            let result = match tokio::task::spawn_blocking(move || this.tick(Utc::now())).await {
                Ok(result) => result,
                Err(e) => Err(CoreError::Custom(format!("evaluation tick panicked: {e}"))),
            };
            on_tick(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusClass;
    use crate::task::TaskRecord;
    use chrono::Duration;
    use std::sync::Mutex;

    struct RecordingSink {
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl NotificationSink for Arc<RecordingSink> {
        fn send(&self, notification: &Notification) -> Result<(), SinkError> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    struct FailingSink;

    impl NotificationSink for FailingSink {
        fn send(&self, _notification: &Notification) -> Result<(), SinkError> {
            Err(SinkError::DeliveryFailed("connection refused".to_string()))
        }
    }

    fn tracked_task(db: &Database, id: &str, entered_at: DateTime<Utc>) {
        db.upsert_task(&TaskRecord {
            id: id.to_string(),
            name: format!("Task {id}"),
            status_label: "in progress".to_string(),
            status_class: StatusClass::InProgress,
            deep_link: Some(format!("https://upstream.example/t/{id}")),
            updated_at: Some(entered_at),
            last_ingested_at: entered_at,
        })
        .unwrap();
        db.record_transition(id, None, "in progress", StatusClass::InProgress, entered_at)
            .unwrap();
    }

    #[test]
    fn fires_past_threshold_and_disarms() {
        let db = Arc::new(Database::open_memory().unwrap());
        let now = Utc::now();
        // Entered tracked 90 minutes ago, threshold 60 minutes
        tracked_task(&db, "t1", now - Duration::minutes(90));
        db.upsert_alert_rule("t1", true, "https://hooks.example/x", 1, 0)
            .unwrap();

        let sink = RecordingSink::new();
        let evaluator = Evaluator::new(Arc::clone(&db), Box::new(Arc::clone(&sink)));

        let summary = evaluator.tick(now).unwrap();
        assert_eq!(summary.fired, 1);

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].task_id, "t1");
        assert_eq!(sent[0].elapsed_human, "1 hours and 30 minutes");
        assert!(sent[0].elapsed_secs >= 90 * 60);

        let rule = db.alert_rule("t1").unwrap().unwrap();
        assert!(!rule.armed);
        assert!(rule.last_fired_at.is_some());
    }

    #[test]
    fn never_fires_twice_for_same_arm_cycle() {
        let db = Arc::new(Database::open_memory().unwrap());
        let now = Utc::now();
        tracked_task(&db, "t1", now - Duration::minutes(90));
        db.upsert_alert_rule("t1", true, "https://hooks.example/x", 1, 0)
            .unwrap();

        let sink = RecordingSink::new();
        let evaluator = Evaluator::new(Arc::clone(&db), Box::new(Arc::clone(&sink)));

        evaluator.tick(now).unwrap();
        let second = evaluator.tick(now + Duration::minutes(5)).unwrap();
        assert_eq!(second.evaluated, 0);
        assert_eq!(sink.sent().len(), 1);
    }

    #[test]
    fn below_threshold_stays_armed_and_silent() {
        let db = Arc::new(Database::open_memory().unwrap());
        let now = Utc::now();
        tracked_task(&db, "t1", now - Duration::minutes(20));
        db.upsert_alert_rule("t1", true, "https://hooks.example/x", 1, 0)
            .unwrap();

        let sink = RecordingSink::new();
        let evaluator = Evaluator::new(Arc::clone(&db), Box::new(Arc::clone(&sink)));

        let summary = evaluator.tick(now).unwrap();
        assert_eq!(summary.fired, 0);
        assert_eq!(summary.skipped, 0);
        assert!(sink.sent().is_empty());
        assert!(db.alert_rule("t1").unwrap().unwrap().armed);
    }

    #[test]
    fn tolerance_absorbs_scheduling_jitter() {
        let db = Arc::new(Database::open_memory().unwrap());
        let now = Utc::now();
        // 15 seconds short of the one-hour threshold
        tracked_task(&db, "t1", now - Duration::seconds(3600 - 15));
        db.upsert_alert_rule("t1", true, "https://hooks.example/x", 1, 0)
            .unwrap();

        let sink = RecordingSink::new();
        let evaluator = Evaluator::new(Arc::clone(&db), Box::new(Arc::clone(&sink)))
            .with_tolerance(30);

        let summary = evaluator.tick(now).unwrap();
        assert_eq!(summary.fired, 1);
    }

    #[test]
    fn untracked_task_is_skipped_and_rule_stays_armed() {
        let db = Arc::new(Database::open_memory().unwrap());
        let now = Utc::now();
        // Tracked for 45 minutes, then done
        tracked_task(&db, "t1", now - Duration::minutes(60));
        db.record_transition("t1", Some("in progress"), "closed", StatusClass::Done, now - Duration::minutes(15))
            .unwrap();
        db.upsert_task(&TaskRecord {
            id: "t1".to_string(),
            name: "Task t1".to_string(),
            status_label: "closed".to_string(),
            status_class: StatusClass::Done,
            deep_link: None,
            updated_at: Some(now),
            last_ingested_at: now,
        })
        .unwrap();
        db.upsert_alert_rule("t1", true, "https://hooks.example/x", 1, 0)
            .unwrap();

        let sink = RecordingSink::new();
        let evaluator = Evaluator::new(Arc::clone(&db), Box::new(Arc::clone(&sink)));

        // 45 minutes elapsed < 60 threshold, and the task is no longer
        // tracked: never fires, stays armed
        let summary = evaluator.tick(now).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.fired, 0);
        assert!(db.alert_rule("t1").unwrap().unwrap().armed);

        let later = evaluator.tick(now + Duration::hours(3)).unwrap();
        assert_eq!(later.fired, 0);
        assert!(sink.sent().is_empty());
    }

    #[test]
    fn unrepaired_cold_start_is_skipped() {
        let db = Arc::new(Database::open_memory().unwrap());
        let now = Utc::now();
        // Tracked task with an empty transition log
        db.upsert_task(&TaskRecord {
            id: "t1".to_string(),
            name: "Task t1".to_string(),
            status_label: "in progress".to_string(),
            status_class: StatusClass::InProgress,
            deep_link: None,
            updated_at: Some(now - Duration::hours(5)),
            last_ingested_at: now,
        })
        .unwrap();
        db.upsert_alert_rule("t1", true, "https://hooks.example/x", 0, 5)
            .unwrap();

        let sink = RecordingSink::new();
        let evaluator = Evaluator::new(Arc::clone(&db), Box::new(Arc::clone(&sink)));

        let summary = evaluator.tick(now).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.fired, 0);
        assert!(db.alert_rule("t1").unwrap().unwrap().armed);
    }

    #[test]
    fn sink_failure_keeps_rule_armed_for_retry() {
        let db = Arc::new(Database::open_memory().unwrap());
        let now = Utc::now();
        tracked_task(&db, "t1", now - Duration::minutes(90));
        db.upsert_alert_rule("t1", true, "https://hooks.example/x", 1, 0)
            .unwrap();

        let evaluator = Evaluator::new(Arc::clone(&db), Box::new(FailingSink));
        let summary = evaluator.tick(now).unwrap();
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.fired, 0);
        assert!(db.alert_rule("t1").unwrap().unwrap().armed);

        // Next tick retries and can fire once the sink recovers
        let sink = RecordingSink::new();
        let evaluator = Evaluator::new(Arc::clone(&db), Box::new(Arc::clone(&sink)));
        let retry = evaluator.tick(now + Duration::minutes(5)).unwrap();
        assert_eq!(retry.fired, 1);
        assert!(!db.alert_rule("t1").unwrap().unwrap().armed);
    }

    #[test]
    fn closed_intervals_count_toward_elapsed() {
        let db = Arc::new(Database::open_memory().unwrap());
        let now = Utc::now();
        // 40 closed minutes, then re-entered 25 minutes ago: 65 total
        tracked_task(&db, "t1", now - Duration::minutes(120));
        db.record_transition("t1", Some("in progress"), "to do", StatusClass::Pending, now - Duration::minutes(80))
            .unwrap();
        db.record_transition("t1", Some("to do"), "in progress", StatusClass::InProgress, now - Duration::minutes(25))
            .unwrap();
        db.upsert_alert_rule("t1", true, "https://hooks.example/x", 1, 0)
            .unwrap();

        let sink = RecordingSink::new();
        let evaluator = Evaluator::new(Arc::clone(&db), Box::new(Arc::clone(&sink)));
        let summary = evaluator.tick(now).unwrap();
        assert_eq!(summary.fired, 1);
        let sent = sink.sent();
        assert!(sent[0].elapsed_secs >= 65 * 60);
        assert!(sent[0].elapsed_secs < 66 * 60);
    }
}
