//! Device telemetry
//!
//! Heartbeat published on its own period: online flag, timestamp, uptime,
//! resource pressure, signal strength and the current fault count.

use crate::error::AgentError;
use crate::reconcile::FaultCounter;
use crate::relay::RelayBank;
use crate::remote::{DevicePaths, RemoteStateClient, StoreTransport};
use crate::safety::SafetyPolicy;
use serde::Serialize;
use sysinfo::System;
use tokio::time::Instant;
use tracing::{debug, info};

/// Point-in-time resource readings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSample {
    /// Memory pressure, 0-100
    pub memory_usage: f32,
    pub system_load: Option<f64>,
    /// dBm, when a wireless link exists
    pub wifi_strength: Option<i32>,
}

pub trait HealthProbe: Send {
    fn sample(&mut self) -> HealthSample;
}

/// Host probe backed by `sysinfo` and `/proc/net/wireless`
pub struct SystemProbe {
    sys: System,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthProbe for SystemProbe {
    fn sample(&mut self) -> HealthSample {
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        let memory_usage = if total > 0 {
            (self.sys.used_memory() as f64 / total as f64 * 100.0) as f32
        } else {
            0.0
        };

        let system_load = if cfg!(unix) {
            Some(System::load_average().one)
        } else {
            None
        };

        HealthSample {
            memory_usage: memory_usage.clamp(0.0, 100.0),
            system_load,
            wifi_strength: read_wifi_strength(),
        }
    }
}

fn read_wifi_strength() -> Option<i32> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(table) = std::fs::read_to_string("/proc/net/wireless") {
            return parse_wireless_table(&table);
        }
    }
    None
}

/// Signal level of the first interface in `/proc/net/wireless`
fn parse_wireless_table(table: &str) -> Option<i32> {
    table.lines().skip(2).find_map(|line| {
        let (_, stats) = line.split_once(':')?;
        let level = stats.split_whitespace().nth(2)?;
        level.trim_end_matches('.').parse::<f32>().ok().map(|v| v as i32)
    })
}

/// Document patched onto the device node
#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub online: bool,
    pub last_update: String,
    pub uptime: u64,
    pub memory_usage: f32,
    pub system_load: Option<f64>,
    pub wifi_strength: Option<i32>,
    pub error_count: u32,
    pub active_relays: usize,
    pub total_power_usage: f32,
    pub safety_enabled: bool,
    pub boot_id: String,
}

pub struct TelemetryReporter {
    paths: DevicePaths,
    probe: Box<dyn HealthProbe>,
    started: Instant,
    boot_id: String,
    sent: u64,
}

impl TelemetryReporter {
    pub fn new(paths: DevicePaths, probe: Box<dyn HealthProbe>) -> Self {
        Self {
            paths,
            probe,
            started: Instant::now(),
            boot_id: uuid::Uuid::new_v4().to_string(),
            sent: 0,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn boot_id(&self) -> &str {
        &self.boot_id
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn heartbeat(&mut self, bank: &RelayBank, policy: &SafetyPolicy, faults: &FaultCounter) -> Heartbeat {
        let sample = self.probe.sample();
        let status = bank.bank_status();
        Heartbeat {
            online: true,
            last_update: crate::now_timestamp(),
            uptime: self.uptime_secs(),
            memory_usage: (sample.memory_usage * 100.0).round() / 100.0,
            system_load: sample.system_load,
            wifi_strength: sample.wifi_strength,
            error_count: faults.count(),
            active_relays: status.active_relays,
            total_power_usage: status.total_power_usage,
            safety_enabled: policy.is_enabled(),
            boot_id: self.boot_id.clone(),
        }
    }

    /// Publish one heartbeat. The caller counts failures.
    pub async fn report<T: StoreTransport>(
        &mut self,
        client: &mut RemoteStateClient<T>,
        bank: &RelayBank,
        policy: &SafetyPolicy,
        faults: &FaultCounter,
    ) -> Result<(), AgentError> {
        let heartbeat = self.heartbeat(bank, policy, faults);
        let doc = serde_json::to_value(&heartbeat)?;
        client.patch(self.paths.device(), doc).await?;

        self.sent += 1;
        if self.sent == 1 || self.sent % 10 == 0 {
            info!(
                "Heartbeat sent - Uptime: {}s, Memory: {:.1}%, Faults: {}",
                heartbeat.uptime, heartbeat.memory_usage, heartbeat.error_count
            );
        } else {
            debug!("Heartbeat sent");
        }
        Ok(())
    }
}
