//! Remote command queue (`commands/`)
//!
//! Operators push `{command, timestamp, user_id, status: "pending"}` entries.
//! Each pending entry is executed once and patched with its outcome and
//! `processed_at`. Relay changes still go through the safety-gated apply path.

use crate::error::AgentError;
use crate::reconcile::{publish_snapshot, DesiredState, ReconciliationLoop};
use crate::recovery::FaultRecovery;
use crate::relay::RelayBank;
use crate::remote::{DevicePaths, RemoteStateClient, StoreTransport};
use serde_json::{json, Value};
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    AllOff,
    ToggleAll,
    Sync,
    Restart,
    Unsupported(String),
}

impl DeviceCommand {
    pub fn parse(name: &str) -> Self {
        match name {
            "all_off" | "emergency_stop" => DeviceCommand::AllOff,
            "toggle_all" => DeviceCommand::ToggleAll,
            "sync" => DeviceCommand::Sync,
            "restart" | "reboot" => DeviceCommand::Restart,
            other => DeviceCommand::Unsupported(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Completed,
    Failed,
    Unsupported,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub id: String,
    pub command: DeviceCommand,
    pub user_id: Option<String>,
}

/// Pending entries of a `commands` document, oldest key first
pub fn pending_commands(doc: Option<&Value>) -> Vec<PendingCommand> {
    let Some(Value::Object(entries)) = doc else {
        return Vec::new();
    };

    let mut pending: Vec<PendingCommand> = entries
        .iter()
        .filter(|(_, entry)| entry.get("status").and_then(Value::as_str) == Some("pending"))
        .filter_map(|(id, entry)| {
            let name = entry.get("command")?.as_str()?;
            Some(PendingCommand {
                id: id.clone(),
                command: DeviceCommand::parse(name),
                user_id: entry.get("user_id").and_then(Value::as_str).map(str::to_string),
            })
        })
        .collect();
    // Push keys sort chronologically
    pending.sort_by(|a, b| a.id.cmp(&b.id));
    pending
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub id: String,
    pub command: DeviceCommand,
    pub status: CommandStatus,
}

pub struct CommandProcessor {
    paths: DevicePaths,
    processed: u64,
}

impl CommandProcessor {
    pub fn new(paths: DevicePaths) -> Self {
        Self { paths, processed: 0 }
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Fetch and run every pending command. Errs only when the queue cannot be read.
    pub async fn poll<T: StoreTransport>(
        &mut self,
        client: &mut RemoteStateClient<T>,
        bank: &mut RelayBank,
        reconciler: &mut ReconciliationLoop,
        recovery: &mut FaultRecovery,
    ) -> Result<Vec<CommandResult>, AgentError> {
        let doc = client.get(&self.paths.commands()).await?;
        let pending = pending_commands(doc.as_ref());
        let mut results = Vec::with_capacity(pending.len());

        for cmd in pending {
            info!(
                "Command {} ({:?}) from {}",
                cmd.id,
                cmd.command,
                cmd.user_id.as_deref().unwrap_or("unknown")
            );

            self.processed += 1;
            if cmd.command == DeviceCommand::Restart {
                // Acknowledge before going down, or the restart would replay
                self.mark(client, &cmd.id, CommandStatus::Completed).await;
                let by = cmd.user_id.as_deref().unwrap_or("operator");
                recovery.restart_on_request(client, bank, by).await;
                results.push(CommandResult {
                    id: cmd.id,
                    command: cmd.command,
                    status: CommandStatus::Completed,
                });
                // Anything queued behind a restart waits for the next process
                break;
            }

            let revision = bank.revision();
            let status = self.execute(&cmd.command, client, bank, reconciler).await;
            if bank.revision() != revision && status != CommandStatus::Completed {
                reconciler.mark_unpublished();
            }
            self.mark(client, &cmd.id, status).await;
            results.push(CommandResult {
                id: cmd.id,
                command: cmd.command,
                status,
            });
        }
        Ok(results)
    }

    async fn execute<T: StoreTransport>(
        &self,
        command: &DeviceCommand,
        client: &mut RemoteStateClient<T>,
        bank: &mut RelayBank,
        reconciler: &ReconciliationLoop,
    ) -> CommandStatus {
        let result = match command {
            DeviceCommand::AllOff => {
                let report = bank.all_off();
                let published = publish_snapshot(client, &self.paths, bank).await;
                match (report.is_clean(), published) {
                    (true, Ok(())) => Ok(()),
                    (false, _) => Err(format!("{} relay(s) failed to switch off", report.failed.len())),
                    (true, Err(e)) => Err(e.to_string()),
                }
            }
            DeviceCommand::ToggleAll => {
                let desired = DesiredState::from(bank.toggle_all());
                match reconciler.apply_desired(&desired, bank) {
                    Ok(report) => {
                        if !report.refused.is_empty() {
                            info!("toggle_all: {} relay(s) held by safety policy", report.refused.len());
                        }
                        publish_snapshot(client, &self.paths, bank).await.map_err(|e| e.to_string())
                    }
                    Err(fault) => Err(fault.to_string()),
                }
            }
            DeviceCommand::Sync => publish_snapshot(client, &self.paths, bank).await.map_err(|e| e.to_string()),
            DeviceCommand::Unsupported(name) => {
                warn!("Unsupported command: {}", name);
                return CommandStatus::Unsupported;
            }
            DeviceCommand::Restart => Ok(()),
        };

        match result {
            Ok(()) => CommandStatus::Completed,
            Err(reason) => {
                warn!("Command {:?} failed: {}", command, reason);
                CommandStatus::Failed
            }
        }
    }

    async fn mark<T: StoreTransport>(&self, client: &mut RemoteStateClient<T>, id: &str, status: CommandStatus) {
        let outcome = json!({ "status": status.as_str(), "processed_at": crate::now_timestamp() });
        if let Err(e) = client.patch(&self.paths.command(id), outcome).await {
            warn!("Could not mark command {} as {}: {}", id, status, e);
        }
    }
}
