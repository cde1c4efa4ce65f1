//! Fault recovery
//!
//! Once the fault counter hits its ceiling the agent drops to a safe state
//! (every relay OFF, device flagged offline, best effort) and restarts the
//! process. Remote calls on this path are bounded so a dead network can
//! never hold the relays energised or block the restart.

use crate::config::RestartMode;
use crate::relay::{AllOffReport, RelayBank};
use crate::remote::{DevicePaths, LogEntry, RemoteStateClient, StoreTransport};
use serde_json::json;
use std::ffi::CString;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Exit code used when leaving the restart to a supervisor
pub const RESTART_EXIT_CODE: i32 = 75;

pub trait Restarter: Send {
    /// Replace or end the current process. Returns only when it could not.
    fn restart(&mut self, reason: &str);
}

/// Restarts the running binary, in place or through the supervisor
pub struct ProcessRestarter {
    mode: RestartMode,
}

impl ProcessRestarter {
    pub fn new(mode: RestartMode) -> Self {
        Self { mode }
    }

    fn exec_self() -> Result<(), String> {
        let exe = std::env::current_exe().map_err(|e| e.to_string())?;
        let path = CString::new(exe.to_string_lossy().into_owned()).map_err(|e| e.to_string())?;
        let args = std::env::args()
            .map(CString::new)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        nix::unistd::execv(&path, &args).map_err(|e| e.to_string())?;
        Ok(())
    }
}

impl Restarter for ProcessRestarter {
    fn restart(&mut self, reason: &str) {
        warn!("Restarting process: {}", reason);
        if self.mode == RestartMode::Exec {
            if let Err(e) = Self::exec_self() {
                error!("In-place restart failed ({}), exiting for supervisor", e);
            }
        }
        std::process::exit(RESTART_EXIT_CODE);
    }
}

/// What the safe-state path managed to do
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub all_off: AllOffReport,
    pub diagnostic_logged: bool,
    pub offline_published: bool,
}

pub struct FaultRecovery {
    paths: DevicePaths,
    restarter: Box<dyn Restarter>,
    min_backoff: Duration,
    remote_timeout: Duration,
    process_started: Instant,
    escalations: u32,
}

impl FaultRecovery {
    pub fn new(
        paths: DevicePaths,
        restarter: Box<dyn Restarter>,
        min_backoff: Duration,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            paths,
            restarter,
            min_backoff,
            remote_timeout,
            process_started: Instant::now(),
            escalations: 0,
        }
    }

    pub fn escalations(&self) -> u32 {
        self.escalations
    }

    /// All relays OFF, diagnostic event and offline flag, each remote step bounded
    pub async fn safe_state<T: StoreTransport>(
        &self,
        client: &mut RemoteStateClient<T>,
        bank: &mut RelayBank,
        event: &str,
        message: &str,
    ) -> RecoveryReport {
        let all_off = bank.all_off();
        if !all_off.is_clean() {
            error!("{} relay(s) could not be switched off", all_off.failed.len());
        }

        let entry = LogEntry::new("critical", format!("{}: {}", event, message));
        let diagnostic_logged = match serde_json::to_value(&entry) {
            Ok(doc) => client
                .push_within(self.remote_timeout, &self.paths.logs(), doc)
                .await
                .map_err(|e| warn!("Diagnostic event not delivered: {}", e))
                .is_ok(),
            Err(_) => false,
        };

        let offline = json!({ "online": false, "last_update": crate::now_timestamp() });
        let offline_published = client
            .patch_within(self.remote_timeout, self.paths.device(), offline)
            .await
            .map_err(|e| warn!("Offline status not delivered: {}", e))
            .is_ok();

        RecoveryReport {
            all_off,
            diagnostic_logged,
            offline_published,
        }
    }

    /// Terminal escalation: safe state, backoff, restart
    pub async fn escalate<T: StoreTransport>(
        &mut self,
        client: &mut RemoteStateClient<T>,
        bank: &mut RelayBank,
        faults: u32,
    ) -> RecoveryReport {
        self.escalations += 1;
        let reason = format!("{} consecutive faults", faults);
        error!("Max errors reached ({}), entering safe state and restarting", reason);

        let report = self.safe_state(client, bank, "fault_restart", &reason).await;

        let wait = self.min_backoff.saturating_sub(self.process_started.elapsed());
        if !wait.is_zero() {
            info!("Waiting {:?} before restart", wait);
            tokio::time::sleep(wait).await;
        }

        self.restarter.restart(&reason);
        report
    }

    /// Operator-requested restart (command queue), same safe path
    pub async fn restart_on_request<T: StoreTransport>(
        &mut self,
        client: &mut RemoteStateClient<T>,
        bank: &mut RelayBank,
        requested_by: &str,
    ) -> RecoveryReport {
        let reason = format!("restart requested by {}", requested_by);
        let report = self.safe_state(client, bank, "restart", &reason).await;

        let wait = self.min_backoff.saturating_sub(self.process_started.elapsed());
        tokio::time::sleep(wait).await;
        self.restarter.restart(&reason);
        report
    }
}
