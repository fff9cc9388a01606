//! Task management commands for CLI.

use chrono::{DateTime, Duration, Utc};
use clap::Subcommand;
use tasksync_core::{SyncOrchestrator, Task};

use super::{open_node, runtime, CliResult};

#[derive(Subcommand)]
pub enum TaskAction {
    /// Create a new task
    Add {
        /// Task title
        title: String,
        /// Owner of the task
        #[arg(long)]
        user: Option<String>,
        /// Task description
        #[arg(long)]
        description: Option<String>,
        /// Due date (RFC3339)
        #[arg(long)]
        due: Option<String>,
        /// Tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Priority (0-100)
        #[arg(long)]
        priority: Option<i32>,
    },
    /// List tasks
    List {
        /// Filter by owner
        #[arg(long)]
        user: Option<String>,
        /// Filter by originating device
        #[arg(long)]
        device: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mark a task as done
    Done {
        /// Task ID
        id: String,
    },
    /// Snooze a task
    Snooze {
        /// Task ID
        id: String,
        /// Minutes to snooze for
        #[arg(long, default_value = "30")]
        minutes: i64,
    },
    /// Return a snoozed task to ready
    Resume {
        /// Task ID
        id: String,
    },
    /// Delete a task
    Delete {
        /// Task ID
        id: String,
    },
}

fn parse_due(value: &str) -> CliResult<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .map_err(|e| format!("invalid --due '{value}': {e}"))?;
    Ok(parsed.with_timezone(&Utc))
}

pub fn run(action: TaskAction) -> CliResult {
    let rt = runtime()?;
    let node = open_node()?;
    rt.block_on(execute(node, action))
}

async fn execute(node: SyncOrchestrator, action: TaskAction) -> CliResult {
    match action {
        TaskAction::Add {
            title,
            user,
            description,
            due,
            tags,
            priority,
        } => {
            let mut task = Task::new(title);
            task.user_id = user;
            task.description = description;
            task.due_at = due.as_deref().map(parse_due).transpose()?;
            task.tags = tags;
            task.priority = priority;

            let task = node.add_task(task).await?;
            println!("Task created: {}", task.id);
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskAction::List { user, device, json } => {
            let tasks = node.get_tasks(user.as_deref(), device.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else if tasks.is_empty() {
                println!("No tasks.");
            } else {
                for task in &tasks {
                    println!(
                        "{}  {:<8} v{:<3} {}",
                        task.id,
                        task.state.as_str(),
                        task.event_version,
                        task.title
                    );
                }
            }
        }
        TaskAction::Done { id } => {
            let task = node.mark_done(&id).await?;
            println!("Task done: {}", task.id);
        }
        TaskAction::Snooze { id, minutes } => {
            let until = Duration::try_minutes(minutes)
                .and_then(|d| Utc::now().checked_add_signed(d))
                .ok_or("--minutes is out of range")?;
            let task = node.snooze(&id, until).await?;
            println!("Task snoozed until {}: {}", until.to_rfc3339(), task.id);
        }
        TaskAction::Resume { id } => {
            let task = node.resume(&id).await?;
            println!("Task resumed: {}", task.id);
        }
        TaskAction::Delete { id } => {
            node.delete_task(&id).await?;
            println!("Task deleted: {id}");
        }
    }

    let pending = node.pending_count().await;
    if pending > 0 {
        tracing::debug!(pending, "changes waiting for a peer");
    }
    Ok(())
}
