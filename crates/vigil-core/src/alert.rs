//! Alert rule types.
//!
//! One rule per task, keyed by task id. Rules are created and updated
//! by the operator surface; the evaluator is the only writer of the
//! armed flag (armed -> false on confirmed delivery). A disarmed rule
//! never fires again until the operator re-arms it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::StatusClass;

/// Per-task alert configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub task_id: String,
    /// Whether the rule may fire. Cleared atomically on delivery.
    pub armed: bool,
    /// Where the notification goes (webhook URL, address -- sink-defined).
    pub destination: String,
    /// Threshold, normalized to whole seconds.
    pub threshold_secs: u64,
    /// When the rule last fired. None if it never has.
    pub last_fired_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AlertRule {
    /// Normalize an hours + minutes operator input to seconds.
    pub fn threshold_from(hours: u32, minutes: u32) -> u64 {
        u64::from(hours) * 3600 + u64::from(minutes) * 60
    }
}

/// An armed rule joined with the current state of its task, as the
/// evaluator consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmedAlert {
    pub rule: AlertRule,
    pub task_name: String,
    pub task_status_class: StatusClass,
    pub deep_link: Option<String>,
}

/// Format a duration in seconds the way notifications present it.
pub fn format_elapsed(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    format!("{hours} hours and {minutes} minutes")
}
