/*!
Test harness for the relay agent

Wires a `DeviceAgent` to the in-memory store, a recording GPIO driver, a
fixed health probe and a restarter that only counts. Handles stay with the
harness so tests can seed remote documents and inspect what happened.
*/

use crate::memory_store::MemoryStore;
use crate::mock_gpio::RecordingDriver;
use parking_lot::Mutex;
use relayhub_agent::config::AgentConfig;
use relayhub_agent::discovery::DeviceIdentity;
use relayhub_agent::recovery::Restarter;
use relayhub_agent::relay::PowerRatings;
use relayhub_agent::remote::DevicePaths;
use relayhub_agent::telemetry::{HealthProbe, HealthSample};
use relayhub_agent::{DeviceAgent, RelayBank, RelayId, RemoteStateClient};
use serde_json::{json, Value};
use std::sync::Arc;

pub const TEST_DEVICE: &str = "test_device";

/// Probe returning the same sample every time
#[derive(Debug, Clone)]
pub struct FixedProbe(pub HealthSample);

impl Default for FixedProbe {
    fn default() -> Self {
        Self(HealthSample {
            memory_usage: 35.5,
            system_load: Some(0.25),
            wifi_strength: Some(-55),
        })
    }
}

impl HealthProbe for FixedProbe {
    fn sample(&mut self) -> HealthSample {
        self.0.clone()
    }
}

/// Restarter that records reasons instead of replacing the process
#[derive(Clone, Default)]
pub struct RecordingRestarter {
    reasons: Arc<Mutex<Vec<String>>>,
}

impl RecordingRestarter {
    pub fn count(&self) -> usize {
        self.reasons.lock().len()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().clone()
    }
}

impl Restarter for RecordingRestarter {
    fn restart(&mut self, reason: &str) {
        log::info!("[MOCK] Restart requested: {}", reason);
        self.reasons.lock().push(reason.to_string());
    }
}

pub struct TestHarness {
    pub store: MemoryStore,
    pub driver: RecordingDriver,
    pub restarter: RecordingRestarter,
    pub config: AgentConfig,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok();

        let mut config = AgentConfig::default();
        config.device.device_id = TEST_DEVICE.to_string();
        config.remote.database_url = "https://relayhub-test.example.com".to_string();
        config.remote.api_key = "test-key".to_string();
        config.remote.device_email = "device@example.com".to_string();
        config.remote.device_password = Some("secret".to_string());
        config.recovery.min_restart_backoff_ms = 0;

        Self {
            store: MemoryStore::new(),
            driver: RecordingDriver::new(),
            restarter: RecordingRestarter::default(),
            config,
        }
    }

    pub fn with_config(mut self, adjust: impl FnOnce(&mut AgentConfig)) -> Self {
        adjust(&mut self.config);
        self
    }

    pub fn paths(&self) -> DevicePaths {
        DevicePaths::new(&self.config.device.device_id)
    }

    pub fn client(&self) -> RemoteStateClient<MemoryStore> {
        let credentials = self.config.credentials().expect("test credentials");
        RemoteStateClient::new(self.store.clone(), credentials, self.config.remote.request_timeout())
    }

    pub fn bank(&self) -> RelayBank {
        let ratings = self.config.power_ratings().unwrap_or_else(|_| PowerRatings::default());
        RelayBank::new(&self.config.relays.pins, ratings, self.driver.boxed()).expect("bank init")
    }

    pub fn agent(&self) -> DeviceAgent<MemoryStore> {
        DeviceAgent::new(
            &self.config,
            self.client(),
            self.bank(),
            Box::new(FixedProbe::default()),
            Box::new(self.restarter.clone()),
            DeviceIdentity {
                hostname: "test-host".to_string(),
                os: "linux".to_string(),
                architecture: "aarch64".to_string(),
                mac_address: Some("28:cd:c1:00:00:01".to_string()),
                ip_address: Some("192.168.1.50".to_string()),
            },
        )
    }

    /// Write a desired status the way an operator would
    pub fn set_desired(&self, relay: u8, status: bool) {
        let path = format!("{}/relays/relay_{}/status", self.paths().device(), relay);
        self.store.write(&path, json!(status));
    }

    pub fn set_desired_all(&self, status: bool) {
        for n in 1..=self.config.relays.pins.len() {
            self.set_desired(n as u8, status);
        }
    }

    /// Queue a pending command, returning its key
    pub fn push_command(&self, command: &str) -> String {
        let paths = self.paths();
        let key = format!("-Ncmd{:04}", self.store.pushed(&paths.commands()).len() + 1);
        self.store.write(
            &paths.command(&key),
            json!({
                "command": command,
                "timestamp": "2025-01-01T00:00:00Z",
                "user_id": "operator-1",
                "status": "pending"
            }),
        );
        key
    }

    /// Published document of one relay
    pub fn remote_relay(&self, relay: u8) -> Value {
        let id = RelayId::new(relay).expect("relay id");
        self.store.read(&self.paths().relay(id))
    }

    pub fn remote_device(&self) -> Value {
        self.store.read(self.paths().device())
    }

    pub fn log_messages(&self) -> Vec<String> {
        self.store
            .pushed(&self.paths().logs())
            .iter()
            .filter_map(|entry| entry.get("message").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
