//! Snapshot ingestion from a file or stdin.

use std::io::Read;
use std::sync::Arc;

use clap::Args;
use vigil_core::storage::Database;
use vigil_core::{Config, Evaluator, Reconciler, TaskSnapshot, WebhookSink};

#[derive(Args)]
pub struct IngestArgs {
    /// Path to a JSON snapshot (object or array); reads stdin if omitted
    pub file: Option<String>,

    /// Event type recorded in the ingestion audit log
    #[arg(long, default_value = "manual")]
    pub event_type: String,

    /// Run one alert evaluation tick after ingesting
    #[arg(long)]
    pub evaluate: bool,
}

pub fn run(args: IngestArgs) -> Result<(), Box<dyn std::error::Error>> {
    let raw = match &args.file {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let snapshots: Vec<TaskSnapshot> = match serde_json::from_str::<Vec<TaskSnapshot>>(&raw) {
        Ok(many) => many,
        Err(_) => vec![serde_json::from_str::<TaskSnapshot>(&raw)?],
    };

    let db = Arc::new(Database::open()?);
    let reconciler = Reconciler::new(Arc::clone(&db));

    let mut transitions = 0usize;
    let mut backfilled = 0usize;
    for snapshot in &snapshots {
        let outcome = reconciler.ingest_logged(&args.event_type, snapshot)?;
        if outcome.transition_recorded {
            transitions += 1;
        }
        if outcome.backfilled {
            backfilled += 1;
        }
    }

    println!(
        "Ingested {} snapshot(s): {} transition(s), {} backfilled",
        snapshots.len(),
        transitions,
        backfilled
    );

    if args.evaluate {
        let config = Config::load()?;
        let sink = WebhookSink::new()?;
        let evaluator =
            Evaluator::new(db, Box::new(sink)).with_tolerance(config.watch.tolerance_secs);
        let summary = evaluator.tick(chrono::Utc::now())?;
        println!(
            "Evaluated {} rule(s): {} fired, {} failed, {} skipped",
            summary.evaluated, summary.fired, summary.failures, summary.skipped
        );
    }
    Ok(())
}
