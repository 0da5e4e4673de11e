//! Event reconciliation.
//!
//! Translates externally observed task snapshots (push callbacks,
//! polling refreshes) into transition-log appends and task record
//! updates, exactly once per logical state change.
//!
//! Reconciliation is safe to run concurrently for the same task from
//! two sources arriving near-simultaneously: a per-task lock
//! serializes each ingest, and the store's conditional append is the
//! backstop against duplicate entry transitions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result, SnapshotError, UpstreamError};
use crate::status::{classify, Classifier, StatusClass};
use crate::storage::Database;
use crate::task::{TaskRecord, TaskSnapshot};

/// Supplies the vendor's "time already spent in current state" hint.
///
/// Implementations own their transport and must bound the request with
/// a timeout; the reconciler treats any error (including timeouts) as
/// "no hint" and falls back to the next timestamp source.
pub trait HintSource: Send + Sync {
    /// Seconds the task has already spent in its current state, or
    /// None if the vendor has no data for it.
    fn time_in_current_state(&self, task_id: &str) -> Result<Option<i64>, UpstreamError>;
}

/// Supplies task snapshots from the upstream service (poll transport).
pub trait SnapshotSource {
    fn fetch_snapshots(&self) -> Result<Vec<TaskSnapshot>, UpstreamError>;
}

/// What a single ingest did.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IngestOutcome {
    /// A state-change transition was appended.
    pub transition_recorded: bool,
    /// A synthetic cold-start entry transition was appended.
    pub backfilled: bool,
}

/// Summary of a batch ingest from a [`SnapshotSource`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IngestSummary {
    pub ingested: usize,
    pub transitions: usize,
    pub backfilled: usize,
    /// Snapshots rejected as malformed (no task id). Rejection skips
    /// the snapshot entirely; no partial mutation happens.
    pub rejected: usize,
}

/// Reconciles upstream snapshots against local state.
pub struct Reconciler {
    db: Arc<Database>,
    classifier: Classifier,
    hints: Option<Box<dyn HintSource>>,
    task_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Reconciler {
    /// Create a reconciler with the default keyword classifier and no
    /// hint source.
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            classifier: classify,
            hints: None,
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the status classification function.
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Attach a vendor hint source for tracked-entry start times.
    pub fn with_hint_source(mut self, hints: Box<dyn HintSource>) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    fn task_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.task_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Ingest one snapshot.
    ///
    /// Steps, per logical state change:
    /// 1. look up the last known classification,
    /// 2. classify the snapshot's label,
    /// 3. on change, append a transition (timestamp priority: event
    ///    timestamp, then -- entering the tracked state only -- the
    ///    vendor hint converted to an absolute start, then the
    ///    snapshot's update time, then ingestion wall clock),
    /// 4. repair a tracked task whose log has no entry transition by
    ///    appending a synthetic one,
    /// 5. always upsert the task record.
    ///
    /// # Errors
    /// [`SnapshotError::MissingTaskId`] if the snapshot has no task id
    /// (nothing is mutated); [`crate::error::StorageError`] if an
    /// append or upsert fails -- the caller must not report success
    /// upstream in that case.
    pub fn ingest(&self, snapshot: &TaskSnapshot) -> Result<IngestOutcome> {
        if snapshot.task_id.trim().is_empty() {
            return Err(SnapshotError::MissingTaskId.into());
        }

        let lock = self.task_lock(&snapshot.task_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let now = Utc::now();
        let previous = self.db.task(&snapshot.task_id)?;
        let old_class = previous.as_ref().map(|t| t.status_class);
        let new_class = (self.classifier)(&snapshot.status_label);

        let record = TaskRecord {
            id: snapshot.task_id.clone(),
            name: snapshot.name.clone(),
            status_label: snapshot.status_label.clone(),
            status_class: new_class,
            deep_link: snapshot.deep_link.clone(),
            updated_at: snapshot.updated_at,
            last_ingested_at: now,
        };

        let mut outcome = IngestOutcome::default();

        if old_class != Some(new_class) {
            // Record update and append commit together: a failed
            // append must not advance the cached classification, or
            // the retry would see old == new and never re-attempt the
            // transition.
            let changed_at = self.change_timestamp(snapshot, new_class, now);
            let old_label = previous.as_ref().map(|t| t.status_label.as_str());
            let appended = self
                .db
                .upsert_task_with_transition(&record, old_label, changed_at)?;
            outcome.transition_recorded = appended.is_some();
        } else if new_class.is_tracked() && !self.db.has_tracked_entry(&snapshot.task_id)? {
            // Cold start: tracked all along, but history never saw the
            // entry. Backfill a synthetic entry so accounting is
            // well-formed. Best-effort approximation when the real
            // entry time is unknown.
            let changed_at = self.entry_timestamp(snapshot, now);
            let appended = self
                .db
                .upsert_task_with_transition(&record, None, changed_at)?;
            outcome.backfilled = appended.is_some();
        } else {
            self.db.upsert_task(&record)?;
        }

        Ok(outcome)
    }

    /// Ingest one snapshot with an audit-log record around it.
    ///
    /// The event is logged before processing; the outcome (or the
    /// rejection reason) is recorded after. Storage failures still
    /// propagate to the caller.
    pub fn ingest_logged(&self, event_type: &str, snapshot: &TaskSnapshot) -> Result<IngestOutcome> {
        let task_id = if snapshot.task_id.trim().is_empty() {
            None
        } else {
            Some(snapshot.task_id.as_str())
        };
        let payload = serde_json::to_value(snapshot)?;
        let log_id = self.db.log_webhook(event_type, task_id, &payload)?;

        match self.ingest(snapshot) {
            Ok(outcome) => {
                self.db.mark_webhook_processed(log_id, None)?;
                Ok(outcome)
            }
            Err(err) => {
                self.db.mark_webhook_processed(log_id, Some(&err.to_string()))?;
                Err(err)
            }
        }
    }

    /// Ingest every snapshot a source currently reports.
    ///
    /// Malformed snapshots are counted and skipped; storage failures
    /// abort the batch.
    pub fn ingest_all(&self, source: &dyn SnapshotSource) -> Result<IngestSummary> {
        let snapshots = source.fetch_snapshots().map_err(CoreError::from)?;
        let mut summary = IngestSummary::default();

        for snapshot in &snapshots {
            match self.ingest(snapshot) {
                Ok(outcome) => {
                    summary.ingested += 1;
                    if outcome.transition_recorded {
                        summary.transitions += 1;
                    }
                    if outcome.backfilled {
                        summary.backfilled += 1;
                    }
                }
                Err(CoreError::Snapshot(_)) => summary.rejected += 1,
                Err(err) => return Err(err),
            }
        }

        Ok(summary)
    }

    /// Handle an explicit upstream deletion event.
    ///
    /// Also evicts the task's lock entry so the map stays bounded by
    /// the live task set. A snapshot racing the delete may recreate
    /// both; the store's conditional append remains the dedup backstop.
    pub fn delete(&self, task_id: &str) -> Result<bool> {
        let lock = self.task_lock(task_id);
        let deleted = {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            self.db.delete_task(task_id)?
        };
        let mut locks = self.task_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(task_id);
        Ok(deleted)
    }

    /// Timestamp for a recorded state change, highest priority first:
    /// authoritative event timestamp, hint-derived start (entering the
    /// tracked state only), snapshot update time, ingestion wall clock.
    fn change_timestamp(
        &self,
        snapshot: &TaskSnapshot,
        new_class: StatusClass,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        if let Some(event_at) = snapshot.event_at {
            return event_at;
        }
        if new_class.is_tracked() {
            if let Some(start) = self.hinted_start(snapshot, now) {
                return start;
            }
        }
        snapshot.updated_at.unwrap_or(now)
    }

    /// Timestamp for a synthetic cold-start entry: same priority order
    /// minus the (absent) event timestamp.
    fn entry_timestamp(&self, snapshot: &TaskSnapshot, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(start) = self.hinted_start(snapshot, now) {
            return start;
        }
        snapshot.updated_at.unwrap_or(now)
    }

    /// Convert the vendor's "time already in current state" hint to an
    /// absolute start time. Snapshot-borne hints win over the hint
    /// source; hint-source failures degrade to None.
    fn hinted_start(&self, snapshot: &TaskSnapshot, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let secs = match snapshot.time_in_state_secs {
            Some(secs) => Some(secs),
            None => match &self.hints {
                Some(hints) => match hints.time_in_current_state(&snapshot.task_id) {
                    Ok(hint) => hint,
                    Err(e) => {
                        eprintln!("Warning: hint fetch failed for {}: {e}", snapshot.task_id);
                        None
                    }
                },
                None => None,
            },
        }?;
        if secs < 0 {
            return None;
        }
        Some(now - Duration::seconds(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reconciler() -> Reconciler {
        Reconciler::new(Arc::new(Database::open_memory().unwrap()))
    }

    fn snapshot(task_id: &str, label: &str) -> TaskSnapshot {
        let mut s = TaskSnapshot::new(task_id, format!("Task {task_id}"), label);
        s.updated_at = Some(Utc::now());
        s.deep_link = Some(format!("https://upstream.example/t/{task_id}"));
        s
    }

    struct FixedHints(Option<i64>);

    impl HintSource for FixedHints {
        fn time_in_current_state(&self, _task_id: &str) -> Result<Option<i64>, UpstreamError> {
            Ok(self.0)
        }
    }

    struct FailingHints;

    impl HintSource for FailingHints {
        fn time_in_current_state(&self, _task_id: &str) -> Result<Option<i64>, UpstreamError> {
            Err(UpstreamError::RequestFailed("connection reset".to_string()))
        }
    }

    #[test]
    fn missing_task_id_is_rejected_without_mutation() {
        let r = reconciler();
        let result = r.ingest(&snapshot("", "in progress"));
        assert!(matches!(
            result,
            Err(CoreError::Snapshot(SnapshotError::MissingTaskId))
        ));
        assert!(r.db().tasks().unwrap().is_empty());
    }

    #[test]
    fn first_snapshot_creates_task_and_transition() {
        let r = reconciler();
        let outcome = r.ingest(&snapshot("t1", "to do")).unwrap();
        assert!(outcome.transition_recorded);
        assert!(!outcome.backfilled);

        let task = r.db().task("t1").unwrap().unwrap();
        assert_eq!(task.status_class, StatusClass::Pending);

        let history = r.db().transition_history("t1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].old_label, None);
        assert_eq!(history[0].new_label, "to do");
    }

    #[test]
    fn reingest_identical_snapshot_is_idempotent() {
        let r = reconciler();
        let snap = snapshot("t1", "in progress");
        assert!(r.ingest(&snap).unwrap().transition_recorded);
        let second = r.ingest(&snap).unwrap();
        assert!(!second.transition_recorded);
        assert!(!second.backfilled);
        assert_eq!(r.db().transition_history("t1").unwrap().len(), 1);
    }

    #[test]
    fn relabel_within_same_class_records_no_transition() {
        let r = reconciler();
        r.ingest(&snapshot("t1", "in progress")).unwrap();
        let outcome = r.ingest(&snapshot("t1", "in review")).unwrap();
        assert!(!outcome.transition_recorded);

        // The task record still picks up the new label
        let task = r.db().task("t1").unwrap().unwrap();
        assert_eq!(task.status_label, "in review");
        assert_eq!(r.db().transition_history("t1").unwrap().len(), 1);
    }

    #[test]
    fn class_change_appends_with_previous_label() {
        let r = reconciler();
        r.ingest(&snapshot("t1", "to do")).unwrap();
        r.ingest(&snapshot("t1", "in progress")).unwrap();
        r.ingest(&snapshot("t1", "closed")).unwrap();

        let history = r.db().transition_history("t1").unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].old_label.as_deref(), Some("to do"));
        assert_eq!(history[1].new_class, StatusClass::InProgress);
        assert_eq!(history[2].old_label.as_deref(), Some("in progress"));
        assert_eq!(history[2].new_class, StatusClass::Done);
    }

    #[test]
    fn event_timestamp_takes_priority() {
        let r = reconciler();
        let event_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut snap = snapshot("t1", "in progress");
        snap.event_at = Some(event_at);
        snap.time_in_state_secs = Some(3600);

        r.ingest(&snap).unwrap();
        let history = r.db().transition_history("t1").unwrap();
        assert_eq!(history[0].changed_at, event_at);
    }

    #[test]
    fn hint_converts_to_absolute_start_when_entering_tracked() {
        let r = reconciler();
        let mut snap = snapshot("t1", "in progress");
        snap.time_in_state_secs = Some(1800);

        let before = Utc::now();
        r.ingest(&snap).unwrap();
        let after = Utc::now();

        let history = r.db().transition_history("t1").unwrap();
        let changed_at = history[0].changed_at;
        assert!(changed_at >= before - Duration::seconds(1801));
        assert!(changed_at <= after - Duration::seconds(1799));
    }

    #[test]
    fn hint_is_ignored_when_not_entering_tracked() {
        let r = reconciler();
        let updated_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut snap = snapshot("t1", "to do");
        snap.updated_at = Some(updated_at);
        snap.time_in_state_secs = Some(3600);

        r.ingest(&snap).unwrap();
        let history = r.db().transition_history("t1").unwrap();
        assert_eq!(history[0].changed_at, updated_at);
    }

    #[test]
    fn hint_source_is_consulted_when_snapshot_has_none() {
        let db = Arc::new(Database::open_memory().unwrap());
        let r = Reconciler::new(db).with_hint_source(Box::new(FixedHints(Some(600))));

        let mut snap = snapshot("t1", "in progress");
        snap.updated_at = None;
        let before = Utc::now();
        r.ingest(&snap).unwrap();

        let history = r.db().transition_history("t1").unwrap();
        assert!(history[0].changed_at <= before - Duration::seconds(599));
    }

    #[test]
    fn hint_source_failure_degrades_to_update_time() {
        let db = Arc::new(Database::open_memory().unwrap());
        let r = Reconciler::new(db).with_hint_source(Box::new(FailingHints));

        let updated_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut snap = snapshot("t1", "in progress");
        snap.updated_at = Some(updated_at);

        r.ingest(&snap).unwrap();
        let history = r.db().transition_history("t1").unwrap();
        assert_eq!(history[0].changed_at, updated_at);
    }

    #[test]
    fn cold_start_backfills_synthetic_entry() {
        let r = reconciler();
        // Task record says tracked, but the log never saw the entry
        // (e.g. the record predates transition logging).
        r.db()
            .upsert_task(&TaskRecord {
                id: "t1".to_string(),
                name: "Task t1".to_string(),
                status_label: "in progress".to_string(),
                status_class: StatusClass::InProgress,
                deep_link: None,
                updated_at: Some(Utc::now() - Duration::hours(2)),
                last_ingested_at: Utc::now() - Duration::hours(2),
            })
            .unwrap();
        assert!(!r.db().has_tracked_entry("t1").unwrap());

        let mut snap = snapshot("t1", "in progress");
        let updated_at = Utc::now() - Duration::hours(2);
        snap.updated_at = Some(updated_at);

        let outcome = r.ingest(&snap).unwrap();
        assert!(outcome.backfilled);
        assert!(!outcome.transition_recorded);

        let history = r.db().transition_history("t1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].old_label, None);
        assert_eq!(history[0].changed_at, updated_at);
        assert!(r.db().has_tracked_entry("t1").unwrap());

        // Repair runs once; the next identical snapshot is a no-op
        let again = r.ingest(&snap).unwrap();
        assert!(!again.backfilled);
        assert_eq!(r.db().transition_history("t1").unwrap().len(), 1);
    }

    #[test]
    fn racing_ingests_record_one_transition() {
        let db = Arc::new(Database::open_memory().unwrap());
        let r = Arc::new(Reconciler::new(db));
        let snap = snapshot("t1", "in progress");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&r);
                let snap = snap.clone();
                std::thread::spawn(move || r.ingest(&snap).unwrap())
            })
            .collect();

        let recorded = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| o.transition_recorded)
            .count();
        assert_eq!(recorded, 1);
        assert_eq!(r.db().transition_history("t1").unwrap().len(), 1);
    }

    #[test]
    fn delete_removes_task_log_and_rule() {
        let r = reconciler();
        r.ingest(&snapshot("t1", "in progress")).unwrap();
        r.db()
            .upsert_alert_rule("t1", true, "https://hooks.example/x", 1, 0)
            .unwrap();

        assert!(r.delete("t1").unwrap());
        assert!(r.db().task("t1").unwrap().is_none());
        assert!(r.db().transition_history("t1").unwrap().is_empty());
    }

    #[test]
    fn delete_evicts_per_task_lock() {
        let r = reconciler();
        r.ingest(&snapshot("t1", "in progress")).unwrap();
        r.ingest(&snapshot("t2", "to do")).unwrap();
        assert_eq!(r.task_locks.lock().unwrap().len(), 2);

        r.delete("t1").unwrap();
        assert_eq!(r.task_locks.lock().unwrap().len(), 1);
        // Deleting an unknown id still clears any stale entry
        r.delete("t1").unwrap();
        assert_eq!(r.task_locks.lock().unwrap().len(), 1);

        // A re-ingested task gets a fresh lock and works as before
        r.ingest(&snapshot("t1", "in progress")).unwrap();
        assert_eq!(r.task_locks.lock().unwrap().len(), 2);
    }

    #[test]
    fn ingest_logged_records_audit_trail() {
        let r = reconciler();
        r.ingest_logged("taskStatusUpdated", &snapshot("t1", "in progress"))
            .unwrap();
        let _ = r.ingest_logged("taskStatusUpdated", &snapshot("", "in progress"));

        let stats = r.db().webhook_stats().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total, 2);
        assert_eq!(stats[0].errors, 1);
    }

    #[test]
    fn batch_ingest_skips_malformed_and_counts() {
        struct FakeSource;
        impl SnapshotSource for FakeSource {
            fn fetch_snapshots(&self) -> Result<Vec<TaskSnapshot>, UpstreamError> {
                Ok(vec![
                    TaskSnapshot::new("a", "Task a", "in progress"),
                    TaskSnapshot::new("", "nameless", "to do"),
                    TaskSnapshot::new("b", "Task b", "closed"),
                ])
            }
        }

        let r = reconciler();
        let summary = r.ingest_all(&FakeSource).unwrap();
        assert_eq!(summary.ingested, 2);
        assert_eq!(summary.transitions, 2);
        assert_eq!(summary.rejected, 1);
        assert_eq!(r.db().tasks().unwrap().len(), 2);
    }

    #[test]
    fn batch_ingest_surfaces_upstream_failure() {
        struct TimedOutSource;
        impl SnapshotSource for TimedOutSource {
            fn fetch_snapshots(&self) -> Result<Vec<TaskSnapshot>, UpstreamError> {
                Err(UpstreamError::Timeout { timeout_secs: 10 })
            }
        }

        let r = reconciler();
        let err = r.ingest_all(&TimedOutSource).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Upstream(UpstreamError::Timeout { .. })
        ));
    }

    #[test]
    fn custom_classifier_is_used() {
        fn everything_tracked(_label: &str) -> StatusClass {
            StatusClass::InProgress
        }

        let db = Arc::new(Database::open_memory().unwrap());
        let r = Reconciler::new(db).with_classifier(everything_tracked);
        r.ingest(&snapshot("t1", "whatever")).unwrap();

        let task = r.db().task("t1").unwrap().unwrap();
        assert_eq!(task.status_class, StatusClass::InProgress);
    }
}
