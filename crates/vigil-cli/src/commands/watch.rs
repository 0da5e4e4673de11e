//! The recurring alert evaluation loop.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use vigil_core::storage::Database;
use vigil_core::{Config, Evaluator, WebhookSink};

#[derive(Args)]
pub struct WatchArgs {
    /// Seconds between evaluation ticks (default from config)
    #[arg(long)]
    pub interval_secs: Option<u64>,

    /// Early-fire tolerance subtracted from thresholds, in seconds
    /// (default from config)
    #[arg(long)]
    pub tolerance_secs: Option<u64>,
}

pub fn run(args: WatchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let interval_secs = args.interval_secs.unwrap_or(config.watch.interval_secs);
    let tolerance_secs = args.tolerance_secs.unwrap_or(config.watch.tolerance_secs);

    let db = Arc::new(Database::open()?);
    let sink = WebhookSink::new()?;
    let evaluator = Arc::new(Evaluator::new(db, Box::new(sink)).with_tolerance(tolerance_secs));

    println!("Watching armed alerts every {interval_secs}s (tolerance {tolerance_secs}s); Ctrl-C to stop");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    runtime.block_on(evaluator.run(Duration::from_secs(interval_secs), |tick| match tick {
        Ok(summary) => {
            if summary.fired > 0 || summary.failures > 0 {
                println!(
                    "tick: {} evaluated, {} fired, {} failed, {} skipped",
                    summary.evaluated, summary.fired, summary.failures, summary.skipped
                );
            }
        }
        Err(e) => eprintln!("tick error: {e}"),
    }));
    Ok(())
}
