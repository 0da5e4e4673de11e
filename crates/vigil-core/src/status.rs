//! Status label classification.
//!
//! Upstream services report task status as free text ("In Progress",
//! "Code Review", "Blocked", ...). Everything downstream only cares
//! about three buckets, so the mapping lives here as a single
//! pluggable function. Labels that match no keyword default to
//! [`StatusClass::Pending`] -- upstream may introduce new labels at
//! any time and they must not break ingestion.

use serde::{Deserialize, Serialize};

/// The three logical states a task can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    /// Not started, blocked, or any unrecognized label.
    Pending,
    /// Actively worked on. This is the state whose duration is measured.
    InProgress,
    /// Finished.
    Done,
}

impl StatusClass {
    /// Whether time spent in this state is accounted.
    pub fn is_tracked(self) -> bool {
        matches!(self, StatusClass::InProgress)
    }

    /// Stable string form for database storage.
    pub fn as_str(self) -> &'static str {
        match self {
            StatusClass::Pending => "pending",
            StatusClass::InProgress => "in_progress",
            StatusClass::Done => "done",
        }
    }

    /// Parse the database string form. Unknown strings map to Pending.
    pub fn parse(s: &str) -> Self {
        match s {
            "in_progress" => StatusClass::InProgress,
            "done" => StatusClass::Done,
            _ => StatusClass::Pending,
        }
    }
}

impl std::fmt::Display for StatusClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classification function from raw status label to [`StatusClass`].
///
/// The reconciler takes one of these so the keyword heuristic can be
/// swapped out or tested in isolation.
pub type Classifier = fn(&str) -> StatusClass;

/// Default keyword classification, case-insensitive.
///
/// - "complete", "closed", "completed" (exact) -> Done
/// - label containing "progress", "review", or "doing" -> InProgress
/// - everything else -> Pending
pub fn classify(label: &str) -> StatusClass {
    let label = label.to_lowercase();
    if matches!(label.as_str(), "complete" | "closed" | "completed") {
        return StatusClass::Done;
    }
    if label.contains("progress") || label.contains("review") || label.contains("doing") {
        return StatusClass::InProgress;
    }
    StatusClass::Pending
}
