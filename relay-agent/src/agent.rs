//! Device agent: one cooperative scheduler over sync, heartbeat and commands
//!
//! Every relay mutation happens inside a tick on this task, so reconciliation,
//! telemetry and command handling never interleave on the bank.

use crate::commands::{CommandProcessor, DeviceCommand};
use crate::config::AgentConfig;
use crate::discovery::DeviceIdentity;
use crate::error::AgentError;
use crate::reconcile::{CycleOutcome, FaultCounter, ReconciliationLoop};
use crate::recovery::{FaultRecovery, RecoveryReport, Restarter};
use crate::relay::{RelayBank, RelayId};
use crate::remote::{DevicePaths, LogEntry, RemoteStateClient, StoreTransport};
use crate::safety::SafetyPolicy;
use crate::telemetry::{HealthProbe, TelemetryReporter};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Whether the scheduler keeps going after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Restart,
}

#[derive(Debug, Clone, Copy)]
enum Tick {
    Sync,
    Heartbeat,
    Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Shutdown signal: relays OFF, device offline
    Shutdown,
    /// Restart was requested but the restarter returned
    Restarted,
}

struct Cadence {
    sync: Duration,
    heartbeat: Duration,
    commands: Duration,
}

pub struct DeviceAgent<T: StoreTransport> {
    client: RemoteStateClient<T>,
    bank: RelayBank,
    reconciler: ReconciliationLoop,
    telemetry: TelemetryReporter,
    commands: CommandProcessor,
    recovery: FaultRecovery,
    identity: DeviceIdentity,
    paths: DevicePaths,
    device_name: String,
    device_type: String,
    firmware_version: String,
    cadence: Cadence,
    last_cycle: Option<CycleOutcome>,
}

impl<T: StoreTransport> DeviceAgent<T> {
    pub fn new(
        config: &AgentConfig,
        client: RemoteStateClient<T>,
        bank: RelayBank,
        probe: Box<dyn HealthProbe>,
        restarter: Box<dyn Restarter>,
        identity: DeviceIdentity,
    ) -> Self {
        let paths = DevicePaths::new(&config.device.device_id);
        let reconciler = ReconciliationLoop::new(
            paths.clone(),
            SafetyPolicy::from_config(&config.safety),
            FaultCounter::new(config.recovery.max_faults),
        );
        let recovery = FaultRecovery::new(
            paths.clone(),
            restarter,
            Duration::from_millis(config.recovery.min_restart_backoff_ms),
            config.remote.shutdown_timeout(),
        );

        Self {
            client,
            bank,
            reconciler,
            telemetry: TelemetryReporter::new(paths.clone(), probe),
            commands: CommandProcessor::new(paths.clone()),
            recovery,
            identity,
            device_name: config.device_name(),
            device_type: config.device.device_type.clone(),
            firmware_version: config.device.firmware_version.clone(),
            cadence: Cadence {
                sync: Duration::from_millis(config.schedule.sync_interval_ms),
                heartbeat: Duration::from_millis(config.schedule.heartbeat_interval_ms),
                commands: Duration::from_millis(config.schedule.command_interval_ms),
            },
            paths,
            last_cycle: None,
        }
    }

    pub fn bank(&self) -> &RelayBank {
        &self.bank
    }

    pub fn bank_mut(&mut self) -> &mut RelayBank {
        &mut self.bank
    }

    pub fn client(&self) -> &RemoteStateClient<T> {
        &self.client
    }

    pub fn reconciler(&self) -> &ReconciliationLoop {
        &self.reconciler
    }

    pub fn recovery(&self) -> &FaultRecovery {
        &self.recovery
    }

    pub fn telemetry(&self) -> &TelemetryReporter {
        &self.telemetry
    }

    pub fn last_cycle(&self) -> Option<&CycleOutcome> {
        self.last_cycle.as_ref()
    }

    /// Announce the device and restore wear counters from the last published state
    pub async fn register(&mut self) -> Result<(), AgentError> {
        if let Some(doc) = self.client.get(&self.paths.relays()).await? {
            self.restore_wear(&doc);
        }

        let mut relays = Map::new();
        for (relay_id, doc) in self.bank.documents() {
            relays.insert(relay_id.to_string(), serde_json::to_value(&doc)?);
        }

        let registration = json!({
            "name": self.device_name,
            "type": self.device_type,
            "firmware_version": self.firmware_version,
            "mac_address": self.identity.mac_address,
            "ip_address": self.identity.ip_address,
            "hostname": self.identity.hostname,
            "os": self.identity.os,
            "architecture": self.identity.architecture,
            "online": true,
            "last_update": crate::now_timestamp(),
            "uptime": 0,
            "safety_enabled": self.reconciler.policy().is_enabled(),
            "max_active_relays": self.reconciler.policy().max_active(),
            "relays": Value::Object(relays),
        });
        self.client.patch(self.paths.device(), registration).await?;

        info!("Device {} registered with {} relays", self.device_name, self.bank.lines().len());
        self.log_event("info", format!("Device online, firmware {}", self.firmware_version))
            .await;
        Ok(())
    }

    fn restore_wear(&mut self, doc: &Value) {
        let Value::Object(entries) = doc else {
            return;
        };
        for (key, entry) in entries {
            let Ok(relay_id) = key.parse::<RelayId>() else {
                continue;
            };
            let Some(count) = entry.get("switch_count").and_then(Value::as_u64) else {
                continue;
            };
            let count = u32::try_from(count).unwrap_or(u32::MAX);
            if self.bank.restore_switch_count(relay_id, count) {
                debug!("Restored {} switch count: {}", relay_id, count);
            }
        }
    }

    /// Push an entry to the device event log. Best effort.
    pub async fn log_event(&mut self, level: &str, message: impl Into<String>) {
        let entry = LogEntry::new(level, message);
        let pushed = match serde_json::to_value(&entry) {
            Ok(doc) => self.client.push(&self.paths.logs(), doc).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = pushed {
            warn!("Event log push failed: {}", e);
        }
    }

    pub async fn reconcile_tick(&mut self) -> Flow {
        let outcome = self.reconciler.run_cycle(&mut self.client, &mut self.bank).await;
        if let CycleOutcome::Faulted {
            error: AgentError::Hardware(fault),
            ..
        } = &outcome
        {
            let message = format!("Hardware fault: {}", fault);
            self.log_event("error", message).await;
        }
        self.last_cycle = Some(outcome);
        self.escalate_if_exhausted().await
    }

    pub async fn telemetry_tick(&mut self) -> Flow {
        let result = self
            .telemetry
            .report(&mut self.client, &self.bank, self.reconciler.policy(), self.reconciler.faults())
            .await;
        if let Err(e) = result {
            warn!("Heartbeat failed: {}", e);
            self.reconciler.faults_mut().record();
        }
        self.escalate_if_exhausted().await
    }

    pub async fn command_tick(&mut self) -> Flow {
        let polled = self
            .commands
            .poll(&mut self.client, &mut self.bank, &mut self.reconciler, &mut self.recovery)
            .await;
        match polled {
            Ok(results) => {
                if results.iter().any(|r| r.command == DeviceCommand::Restart) {
                    return Flow::Restart;
                }
            }
            Err(e) => {
                warn!("Command queue unavailable: {}", e);
                self.reconciler.faults_mut().record();
            }
        }
        self.escalate_if_exhausted().await
    }

    async fn escalate_if_exhausted(&mut self) -> Flow {
        if !self.reconciler.faults().is_exhausted() {
            return Flow::Continue;
        }
        let count = self.reconciler.faults().count();
        self.recovery.escalate(&mut self.client, &mut self.bank, count).await;
        self.reconciler.faults_mut().reset();
        Flow::Restart
    }

    /// Emergency stop for a shutdown signal
    pub async fn shutdown(&mut self) -> RecoveryReport {
        info!("Shutdown requested, switching all relays off");
        self.recovery
            .safe_state(&mut self.client, &mut self.bank, "emergency_stop", "shutdown signal received")
            .await
    }

    async fn run_tick(&mut self, tick: Tick) -> Flow {
        match tick {
            Tick::Sync => self.reconcile_tick().await,
            Tick::Heartbeat => self.telemetry_tick().await,
            Tick::Commands => self.command_tick().await,
        }
    }

    /// Register, then tick until `shutdown` resolves or a restart is due
    pub async fn run<S>(&mut self, shutdown: S) -> RunExit
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if let Err(e) = self.register().await {
            error!("Registration failed: {}", e);
            self.reconciler.faults_mut().record();
        }

        let mut sync_timer = interval(self.cadence.sync);
        let mut heartbeat_timer = interval(self.cadence.heartbeat);
        let mut command_timer = interval(self.cadence.commands);
        for timer in [&mut sync_timer, &mut heartbeat_timer, &mut command_timer] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!(
            "Agent loop started: sync {:?}, heartbeat {:?}, commands {:?}",
            self.cadence.sync, self.cadence.heartbeat, self.cadence.commands
        );

        loop {
            let tick = tokio::select! {
                biased;

                _ = &mut shutdown => None,
                _ = sync_timer.tick() => Some(Tick::Sync),
                _ = heartbeat_timer.tick() => Some(Tick::Heartbeat),
                _ = command_timer.tick() => Some(Tick::Commands),
            };

            // a signal arriving mid-tick cancels the tick's in-flight I/O
            let flow = match tick {
                Some(tick) => tokio::select! {
                    biased;

                    _ = &mut shutdown => None,
                    flow = self.run_tick(tick) => Some(flow),
                },
                None => None,
            };

            match flow {
                None => {
                    self.shutdown().await;
                    return RunExit::Shutdown;
                }
                Some(Flow::Restart) => return RunExit::Restarted,
                Some(Flow::Continue) => {}
            }
        }
    }
}
