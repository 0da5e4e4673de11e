//! Task data types: upstream snapshots, the cached task record, and
//! state-transition log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::StatusClass;

/// An externally observed task snapshot, as delivered by a push
/// notification or a polling refresh.
///
/// This is the only shape the core requires from upstream; the
/// transport (webhook, API pull) lives outside the library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Opaque upstream task id.
    pub task_id: String,
    /// Display name.
    pub name: String,
    /// Raw free-text status label (e.g. "In Progress").
    pub status_label: String,
    /// Last-update timestamp reported by upstream.
    pub updated_at: Option<DateTime<Utc>>,
    /// Deep link into the upstream UI.
    pub deep_link: Option<String>,
    /// Authoritative timestamp of the specific change this snapshot
    /// announces, if the transport provides one (push events do,
    /// polls don't).
    #[serde(default)]
    pub event_at: Option<DateTime<Utc>>,
    /// Vendor hint: seconds the task has already spent in its current
    /// state. Only consulted when transitioning into the tracked state.
    #[serde(default)]
    pub time_in_state_secs: Option<i64>,
}

impl TaskSnapshot {
    pub fn new(task_id: impl Into<String>, name: impl Into<String>, status_label: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            name: name.into(),
            status_label: status_label.into(),
            updated_at: None,
            deep_link: None,
            event_at: None,
            time_in_state_secs: None,
        }
    }
}

/// The locally cached task record. One row per upstream task, upserted
/// on every ingested snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    /// Raw label as last reported.
    pub status_label: String,
    /// Classification of `status_label` at ingestion time.
    pub status_class: StatusClass,
    pub deep_link: Option<String>,
    /// Upstream last-update timestamp.
    pub updated_at: Option<DateTime<Utc>>,
    /// When we last ingested a snapshot for this task.
    pub last_ingested_at: DateTime<Utc>,
}

/// An immutable state-transition log record.
///
/// Created only by the reconciler; never mutated. `id` is the
/// insertion-order rowid and serves as the tie-break when two
/// transitions carry the same timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub id: i64,
    pub task_id: String,
    /// Label before the change. None for the first recorded transition
    /// (including synthetic cold-start backfills).
    pub old_label: Option<String>,
    pub new_label: String,
    /// Classification of `new_label` at the time it was recorded.
    pub new_class: StatusClass,
    pub changed_at: DateTime<Utc>,
}
