use crate::error::{Error, Result};
use crate::server::{Issuer, ServerId, ServerRegistry};
use crate::store::Store;
use crate::tasks::types::{CommandAction, CommandId, CommandQueueEntry, NewCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Persisted FIFO of lifecycle intents.
///
/// Every user or scheduler request for a lifecycle change lands here
/// first. A single drain loop executes the entries in enqueue order, so
/// two intents for the same server never run concurrently.
pub struct CommandQueue {
    store: Arc<dyn Store>,
    registry: Arc<ServerRegistry>,
}

impl CommandQueue {
    pub fn new(store: Arc<dyn Store>, registry: Arc<ServerRegistry>) -> Self {
        Self { store, registry }
    }

    /// Appends an intent to the queue.
    #[tracing::instrument(skip(self), fields(action = %action))]
    pub async fn enqueue(
        &self,
        target_id: ServerId,
        issuer: Issuer,
        action: CommandAction,
    ) -> Result<CommandQueueEntry> {
        let entry = self
            .store
            .enqueue_command(NewCommand {
                target_id,
                issuer,
                action,
            })
            .await?;
        tracing::debug!(command_id = entry.id, "Enqueued command");
        Ok(entry)
    }

    /// Executes every pending entry once, in enqueue order.
    ///
    /// Each entry is marked complete whatever the outcome of its action.
    /// Returns the ids of the processed entries.
    pub async fn drain_once(&self) -> Result<Vec<CommandId>> {
        let pending = self.store.pending_commands().await?;
        let mut processed = Vec::with_capacity(pending.len());

        for entry in pending {
            if let Err(e) = self.dispatch(&entry).await {
                tracing::error!(
                    command_id = entry.id,
                    server_id = %entry.target_id,
                    action = %entry.action,
                    error = %e,
                    "Queued command failed"
                );
            }
            self.store.mark_command_complete(entry.id).await?;
            processed.push(entry.id);
        }

        Ok(processed)
    }

    /// Polls the queue until the stop flag is raised.
    pub async fn run(&self, poll_interval: Duration, mut stop_rx: watch::Receiver<bool>) {
        tracing::info!(?poll_interval, "Command queue started");
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.drain_once().await {
                        tracing::error!(error = %e, "Failed to drain command queue");
                    }
                }
            }
        }
        tracing::info!("Command queue stopped");
    }

    #[tracing::instrument(skip(self, entry), fields(command_id = entry.id, server_id = %entry.target_id))]
    async fn dispatch(&self, entry: &CommandQueueEntry) -> Result<()> {
        let supervisor = self.registry.get(entry.target_id).map_err(|e| {
            Error::CommandQueue(format!(
                "Cannot run '{}' for server {}: {}",
                entry.action, entry.target_id, e
            ))
        })?;
        tracing::info!(action = %entry.action, issuer = ?entry.issuer, "Executing queued command");

        match &entry.action {
            CommandAction::StartServer => supervisor.start(entry.issuer).await,
            CommandAction::StopServer => supervisor.stop(entry.issuer).await,
            CommandAction::RestartServer => supervisor.restart(entry.issuer).await,
            // Backups and updates keep running in the background.
            CommandAction::BackupServer => supervisor.backup().await.map(|_| ()),
            CommandAction::UpdateExecutable => supervisor.update_executable().await.map(|_| ()),
            CommandAction::Console(command) => supervisor.send_command(command).await,
        }
    }
}
