//! Mirrored task inspection commands.

use clap::Subcommand;
use vigil_core::storage::Database;
use vigil_core::{format_elapsed, time_in_tracked};

#[derive(Subcommand)]
pub enum TaskAction {
    /// List all mirrored tasks
    List,
    /// List tasks currently in a tracked state
    Tracked,
    /// Show one task
    Show {
        /// Task ID
        task_id: String,
    },
    /// Show the transition history of a task
    History {
        /// Task ID
        task_id: String,
    },
    /// Show cumulative tracked time for a task
    Time {
        /// Task ID
        task_id: String,
    },
    /// Delete a task and its transitions and alert rule
    Delete {
        /// Task ID
        task_id: String,
    },
}

pub fn run(action: TaskAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open()?;

    match action {
        TaskAction::List => {
            let tasks = db.tasks()?;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }
        TaskAction::Tracked => {
            let tasks = db.tracked_tasks()?;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }
        TaskAction::Show { task_id } => match db.task(&task_id)? {
            Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
            None => println!("No task {task_id}"),
        },
        TaskAction::History { task_id } => {
            let history = db.transition_history(&task_id)?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        TaskAction::Time { task_id } => {
            let tracked = db
                .task(&task_id)?
                .map(|t| t.status_class.is_tracked())
                .unwrap_or(false);
            let history = db.transition_history(&task_id)?;
            let time = time_in_tracked(&history, tracked);
            let now = chrono::Utc::now();
            println!(
                "{}: {} ({} including the open session)",
                task_id,
                format_elapsed(time.total_closed_seconds),
                format_elapsed(time.elapsed_at(now)),
            );
            if let Some(start) = time.open_session_start {
                println!("open session since {start}");
            } else if time.is_open {
                println!("open session with unknown start (awaiting repair)");
            }
        }
        TaskAction::Delete { task_id } => {
            if db.delete_task(&task_id)? {
                println!("Deleted {task_id}");
            } else {
                println!("No task {task_id}");
            }
        }
    }
    Ok(())
}
