//! RelayHub Agent - relay controller kept in sync with a remote document store
//!
//! The device side of RelayHub:
//! - Pulls desired relay state and reconciles it against the physical relays
//! - Gates every actuation through a hardware safety policy
//! - Publishes actual state atomically, plus periodic health telemetry
//! - Escalates persistent faults to a safe-state restart

pub mod agent;
pub mod commands;
pub mod config;
pub mod discovery;
pub mod error;
pub mod reconcile;
pub mod recovery;
pub mod relay;
pub mod remote;
pub mod safety;
pub mod telemetry;

pub use agent::DeviceAgent;
pub use config::AgentConfig;
pub use error::{AgentError, AuthError, ConfigurationFault, HardwareFault, TransportError};
pub use reconcile::{DesiredState, FaultCounter, ReconciliationLoop};
pub use recovery::{FaultRecovery, Restarter};
pub use relay::{RelayBank, RelayId};
pub use remote::{RemoteStateClient, StoreTransport};
pub use safety::SafetyPolicy;
pub use telemetry::TelemetryReporter;

use chrono::{DateTime, SecondsFormat, Utc};

/// Timestamp format used for every published time (RFC 3339, UTC, microseconds)
pub fn wall_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_timestamp() -> String {
    wall_timestamp(Utc::now())
}
