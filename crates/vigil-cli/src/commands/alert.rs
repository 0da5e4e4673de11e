//! Alert rule management commands.

use clap::Subcommand;
use vigil_core::storage::Database;

#[derive(Subcommand)]
pub enum AlertAction {
    /// Create or update the alert rule for a task
    Set {
        /// Task ID
        task_id: String,
        /// Notification destination (webhook URL); falls back to
        /// notify.default_destination from config
        destination: Option<String>,
        /// Threshold hours
        #[arg(long, default_value = "0")]
        hours: u32,
        /// Threshold minutes
        #[arg(long, default_value = "0")]
        minutes: u32,
        /// Create the rule disarmed
        #[arg(long)]
        disarmed: bool,
    },
    /// Get the alert rule for a task
    Get {
        /// Task ID
        task_id: String,
    },
    /// List all armed rules joined with task state
    List,
    /// Manually disarm a rule
    Disarm {
        /// Task ID
        task_id: String,
    },
}

pub fn run(action: AlertAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open()?;

    match action {
        AlertAction::Set {
            task_id,
            destination,
            hours,
            minutes,
            disarmed,
        } => {
            // Rules hang off mirrored tasks; ingest the task first.
            if db.task(&task_id)?.is_none() {
                println!("No task {task_id}; ingest it before setting an alert rule");
                return Ok(());
            }
            let destination = match destination {
                Some(dest) => dest,
                None => vigil_core::Config::load()?
                    .notify
                    .default_destination
                    .ok_or("no destination given and notify.default_destination is unset")?,
            };
            db.upsert_alert_rule(&task_id, !disarmed, &destination, hours, minutes)?;
            let state = if disarmed { "disarmed" } else { "armed" };
            println!("Alert rule saved for {task_id} ({state}, {hours}h {minutes}m)");
        }
        AlertAction::Get { task_id } => match db.alert_rule(&task_id)? {
            Some(rule) => println!("{}", serde_json::to_string_pretty(&rule)?),
            None => println!("No alert rule for {task_id}"),
        },
        AlertAction::List => {
            let armed = db.armed_alerts()?;
            println!("{}", serde_json::to_string_pretty(&armed)?);
        }
        AlertAction::Disarm { task_id } => {
            if db.disarm_alert(&task_id, chrono::Utc::now())? {
                println!("Alert rule for {task_id} disarmed");
            } else {
                println!("Alert rule for {task_id} was not armed");
            }
        }
    }
    Ok(())
}
