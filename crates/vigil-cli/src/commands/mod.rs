pub mod alert;
pub mod config;
pub mod ingest;
pub mod task;
pub mod watch;
pub mod webhooks;
