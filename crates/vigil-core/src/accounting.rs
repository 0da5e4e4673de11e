//! Status-time accounting.
//!
//! Pure computation over a task's transition log: how many seconds the
//! task has cumulatively spent in the tracked state, plus the start of
//! the currently open interval if one exists. No side effects, safe to
//! call concurrently, idempotent on re-computation.
//!
//! The engine deliberately does not look at "now": the closed sum is a
//! function of the log alone. Callers that want a live total add
//! `(now - open_session_start)` on top.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::Transition;

/// Result of walking a task's transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInState {
    /// Sum of all closed tracked intervals, in whole seconds.
    pub total_closed_seconds: u64,
    /// Start of the currently open tracked interval, if any.
    ///
    /// None with `is_open = true` is the degenerate cold-start case:
    /// the task is currently tracked but the log holds no entry
    /// transition. The reconciler repairs this on the next ingestion;
    /// until then the task simply reports zero elapsed time.
    pub open_session_start: Option<DateTime<Utc>>,
    /// Whether the task is currently in the tracked state.
    pub is_open: bool,
}

impl TimeInState {
    /// Live total including the open interval, in whole seconds.
    ///
    /// Negative open tails (clock skew between the entry timestamp and
    /// `now`) count as zero.
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> u64 {
        let open_tail = match (self.is_open, self.open_session_start) {
            (true, Some(start)) => (now - start).num_seconds().max(0) as u64,
            _ => 0,
        };
        self.total_closed_seconds + open_tail
    }
}

/// Compute cumulative tracked time from a task's transition log.
///
/// `transitions` may arrive in any order; they are re-sorted into the
/// canonical `(changed_at, id)` order before the walk, so out-of-order
/// persistence yields the same result as in-order.
///
/// `currently_tracked` is the task record's current classification
/// flag. The log alone cannot answer "is the task tracked right now"
/// when history is incomplete, which is exactly the cold-start case
/// this flag covers.
pub fn time_in_tracked(transitions: &[Transition], currently_tracked: bool) -> TimeInState {
    let mut ordered: Vec<&Transition> = transitions.iter().collect();
    ordered.sort_by_key(|t| (t.changed_at, t.id));

    let mut total_closed_seconds: u64 = 0;
    let mut open_start: Option<DateTime<Utc>> = None;

    for t in ordered {
        if t.new_class.is_tracked() {
            // A duplicate entry event must never overwrite an already
            // open cursor, or the earlier part of the interval is lost.
            if open_start.is_none() {
                open_start = Some(t.changed_at);
            }
        } else if let Some(start) = open_start.take() {
            // num_seconds truncates toward zero; negatives from
            // out-of-order data count as zero, never reduce the total.
            let delta = (t.changed_at - start).num_seconds();
            if delta < 0 {
                eprintln!(
                    "Warning: negative interval for task {} ({start} .. {}), counting as zero",
                    t.task_id, t.changed_at
                );
            }
            total_closed_seconds += delta.max(0) as u64;
        }
    }

    if currently_tracked {
        TimeInState {
            total_closed_seconds,
            open_session_start: open_start,
            is_open: true,
        }
    } else {
        // A dangling open cursor with the task no longer tracked means
        // the closing transition was never observed; the open interval
        // is not counted (we have no end timestamp to close it with).
        TimeInState {
            total_closed_seconds,
            open_session_start: None,
            is_open: false,
        }
    }
}
