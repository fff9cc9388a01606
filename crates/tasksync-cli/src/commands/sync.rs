//! Sync node commands.

use clap::Subcommand;
use tasksync_core::{ChangeOrigin, SyncOrchestrator};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use super::{open_node, runtime, CliResult};

#[derive(Subcommand)]
pub enum SyncAction {
    /// Run a sync node until Ctrl-C
    Run,
    /// Show node status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the local manifest as JSON
    Manifest {
        /// Restrict to one owner
        #[arg(long)]
        user: Option<String>,
    },
}

pub fn run(action: SyncAction) -> CliResult {
    let rt = runtime()?;
    let node = open_node()?;
    rt.block_on(execute(node, action))
}

async fn execute(node: SyncOrchestrator, action: SyncAction) -> CliResult {
    match action {
        SyncAction::Run => {
            if !node.config().enabled {
                println!("Sync is disabled (sync.enabled = false or TASKSYNC_SYNC_DISABLED).");
                return Ok(());
            }

            let cancel = CancellationToken::new();
            let mut changes = node.subscribe();
            let addr = node.start(cancel.clone()).await?;
            println!("Node {} listening on {addr}", node.device_id());
            for peer in &node.config().peers {
                println!("  peer: {peer}");
            }

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                tokio::select! {
                    _ = &mut ctrl_c => break,
                    change = changes.recv() => match change {
                        Ok(change) => {
                            if let ChangeOrigin::Remote { device_id } = &change.origin {
                                tracing::info!(
                                    from = %device_id,
                                    event = change.event.type_name(),
                                    task_id = change.event.task_id().unwrap_or("-"),
                                    "applied remote change"
                                );
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "change feed lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            cancel.cancel();
            node.shutdown().await;
            println!("Stopped.");
        }
        SyncAction::Status { json } => {
            let status = node.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Device:     {}", status.device_id);
                println!("Connection: {}", status.connection);
                println!("Pending:    {}", status.pending_count);
                match status.last_sync_at {
                    Some(at) => println!("Last sync:  {}", at.to_rfc3339()),
                    None => println!("Last sync:  never"),
                }
            }
        }
        SyncAction::Manifest { user } => {
            let entries = node.manifest(user.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }
    Ok(())
}
