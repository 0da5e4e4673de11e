//! # Vigil Core Library
//!
//! Core business logic for Vigil, a dashboard that mirrors tasks from
//! an external project-management service and raises an alert when a
//! task has spent too long in progress. The interesting part lives
//! here: reconstructing cumulative status time from a possibly
//! incomplete, concurrently updated transition log, and evaluating
//! per-task threshold alerts with at-most-once delivery per arm cycle.
//!
//! ## Architecture
//!
//! - **Storage**: SQLite-backed task cache, append-only transition
//!   log, alert rules, and an ingestion audit log
//! - **Accounting**: a pure function from transition log to cumulative
//!   tracked seconds plus the open session, independent of "now"
//! - **Reconciler**: turns upstream snapshots into log appends,
//!   exactly once per logical state change, with cold-start repair
//! - **Evaluator**: the recurring tick that fires and disarms alerts
//!
//! ## Key Components
//!
//! - [`Database`]: persistence for all durable state
//! - [`time_in_tracked`]: the status-time accounting engine
//! - [`Reconciler`]: snapshot ingestion
//! - [`Evaluator`]: threshold evaluation and scheduling

pub mod accounting;
pub mod alert;
pub mod error;
pub mod evaluator;
pub mod reconcile;
pub mod sink;
pub mod status;
pub mod storage;
pub mod task;

pub use accounting::{time_in_tracked, TimeInState};
pub use alert::{format_elapsed, AlertRule, ArmedAlert};
pub use error::{CoreError, SinkError, SnapshotError, StorageError, UpstreamError};
pub use evaluator::{Evaluator, Notification, NotificationSink, TickSummary};
pub use reconcile::{HintSource, IngestOutcome, IngestSummary, Reconciler, SnapshotSource};
pub use sink::WebhookSink;
pub use status::{classify, Classifier, StatusClass};
pub use storage::{Config, Database, WebhookStat};
pub use task::{TaskRecord, TaskSnapshot, Transition};
