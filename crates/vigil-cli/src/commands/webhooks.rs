//! Ingestion audit log statistics.

use vigil_core::storage::Database;

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open()?;
    let stats = db.webhook_stats()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
