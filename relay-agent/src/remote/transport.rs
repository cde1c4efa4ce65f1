use crate::config::DeviceCredentials;
use crate::error::{AuthError, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// One operation against the remote document tree
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Get,
    /// Merge children; keys may be slash-separated paths, applied all-or-nothing
    Patch(Value),
    /// Append under a store-generated key; answers `{"name": <key>}`
    Post(Value),
}

impl StoreOp {
    pub fn method(&self) -> &'static str {
        match self {
            StoreOp::Get => "GET",
            StoreOp::Patch(_) => "PATCH",
            StoreOp::Post(_) => "POST",
        }
    }
}

/// Bearer token issued by the identity endpoint
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub id_token: String,
    pub expires_in: Duration,
}

/// Wire access to the identity endpoint and the document store.
///
/// Implementations map every library error into the agent taxonomy;
/// nothing else may escape.
#[async_trait]
pub trait StoreTransport: Send + Sync {
    async fn sign_in(&self, credentials: &DeviceCredentials) -> Result<TokenGrant, AuthError>;

    /// `path` is slash-separated without leading slash; empty means the root
    async fn execute(&self, token: &str, path: &str, op: StoreOp) -> Result<Value, TransportError>;
}
