//! Error taxonomy for the relay agent
//!
//! Every failure that leaves a component is one of:
//! - `AuthError`: credential exchange rejected or identity endpoint unreachable
//! - `TransportError`: network, timeout or non-2xx answer from the document store
//! - `HardwareFault`: a GPIO write failed
//! - `ConfigurationFault`: invalid settings, fatal at startup
//!
//! Safety refusals are not errors, see `crate::safety::SafetyRefusal`.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("credentials rejected by identity endpoint: {0}")]
    Rejected(String),

    #[error("identity endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("malformed token grant: {0}")]
    MalformedGrant(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("store answered {status} for {path}")]
    Status { status: u16, path: String },

    #[error("session token refused by store")]
    Unauthorized,

    #[error("network error: {0}")]
    Network(String),

    #[error("undecodable response: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Decode(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("GPIO pin {pin} failed to actuate: {reason}")]
pub struct HardwareFault {
    pub pin: u32,
    pub reason: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationFault {
    #[error("invalid pin mapping: {0}")]
    InvalidPinMapping(String),

    #[error("missing required setting: {0}")]
    MissingSetting(&'static str),

    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("could not read configuration: {0}")]
    Unreadable(String),
}

/// Union of everything a cycle can fail with
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Hardware(#[from] HardwareFault),

    #[error(transparent)]
    Configuration(#[from] ConfigurationFault),
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Transport(e.into())
    }
}
