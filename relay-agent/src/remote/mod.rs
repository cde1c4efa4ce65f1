//! Authenticated access to the remote document store
//!
//! `RemoteStateClient` owns the device session: it signs in on first use,
//! refreshes ahead of expiry, re-authenticates once when the store refuses
//! the token, and bounds every call with a timeout. Callers only ever see
//! `AuthError` / `TransportError` through `AgentError`.

pub mod firebase;
pub mod transport;

pub use firebase::FirebaseTransport;
pub use transport::{StoreOp, StoreTransport, TokenGrant};

use crate::config::DeviceCredentials;
use crate::error::{AgentError, AuthError, TransportError};
use crate::relay::RelayId;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Bearer token with its refresh deadline
pub struct Session {
    token: SecretString,
    refresh_at: Instant,
}

impl Session {
    fn new(grant: TokenGrant, margin: Duration, now: Instant) -> Self {
        Self {
            token: SecretString::new(grant.id_token.into_boxed_str()),
            refresh_at: now + grant.expires_in.saturating_sub(margin),
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.refresh_at
    }
}

pub struct RemoteStateClient<T> {
    transport: T,
    credentials: DeviceCredentials,
    session: Option<Session>,
    refresh_margin: Duration,
    call_timeout: Duration,
    last_success: Option<Instant>,
}

impl<T: StoreTransport> RemoteStateClient<T> {
    pub fn new(transport: T, credentials: DeviceCredentials, call_timeout: Duration) -> Self {
        Self {
            transport,
            credentials,
            session: None,
            refresh_margin: Duration::from_secs(300),
            call_timeout,
            last_success: None,
        }
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Last successful store call, diagnostics only
    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Make sure a fresh session exists, signing in if needed
    pub async fn authenticate(&mut self) -> Result<&Session, AuthError> {
        let now = Instant::now();
        let fresh = self.session.as_ref().is_some_and(|s| s.is_fresh(now));

        if !fresh {
            info!("Authenticating device {}", self.credentials.email);
            let grant = match timeout(self.call_timeout, self.transport.sign_in(&self.credentials)).await {
                Ok(Ok(grant)) => grant,
                Ok(Err(e)) => {
                    self.session = None;
                    warn!("Authentication failed: {}", e);
                    return Err(e);
                }
                Err(_) => {
                    self.session = None;
                    return Err(AuthError::Unreachable(format!(
                        "sign-in timed out after {:?}",
                        self.call_timeout
                    )));
                }
            };
            debug!("Session granted for {:?}", grant.expires_in);
            self.session = Some(Session::new(grant, self.refresh_margin, now));
        }

        self.session
            .as_ref()
            .ok_or_else(|| AuthError::MalformedGrant("session missing after sign-in".to_string()))
    }

    pub fn invalidate_session(&mut self) {
        self.session = None;
    }

    async fn send_once(&mut self, path: &str, op: StoreOp) -> Result<Value, AgentError> {
        let token = self.authenticate().await?.token.expose_secret().to_string();
        match self.transport.execute(&token, path, op.clone()).await {
            Err(TransportError::Unauthorized) => {
                debug!("Token refused for {} {}, re-authenticating", op.method(), path);
                self.invalidate_session();
                let token = self.authenticate().await?.token.expose_secret().to_string();
                Ok(self.transport.execute(&token, path, op).await?)
            }
            other => Ok(other?),
        }
    }

    async fn request_within(&mut self, limit: Duration, path: &str, op: StoreOp) -> Result<Value, AgentError> {
        let method = op.method();
        match timeout(limit, self.send_once(path, op)).await {
            Ok(Ok(value)) => {
                self.last_success = Some(Instant::now());
                Ok(value)
            }
            Ok(Err(e)) => {
                debug!("{} {} failed: {}", method, path, e);
                Err(e)
            }
            Err(_) => Err(TransportError::Timeout(limit).into()),
        }
    }

    /// `Ok(None)` when nothing is stored at `path`
    pub async fn get(&mut self, path: &str) -> Result<Option<Value>, AgentError> {
        let value = self.request_within(self.call_timeout, path, StoreOp::Get).await?;
        Ok((!value.is_null()).then_some(value))
    }

    pub async fn patch(&mut self, path: &str, partial: Value) -> Result<(), AgentError> {
        self.patch_within(self.call_timeout, path, partial).await
    }

    pub async fn patch_within(&mut self, limit: Duration, path: &str, partial: Value) -> Result<(), AgentError> {
        self.request_within(limit, path, StoreOp::Patch(partial)).await.map(|_| ())
    }

    /// Append a document, returning the generated key
    pub async fn push(&mut self, path: &str, doc: Value) -> Result<String, AgentError> {
        self.push_within(self.call_timeout, path, doc).await
    }

    pub async fn push_within(&mut self, limit: Duration, path: &str, doc: Value) -> Result<String, AgentError> {
        let reply = self.request_within(limit, path, StoreOp::Post(doc)).await?;
        reply
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TransportError::Decode(format!("push reply without name: {}", reply)).into())
    }

    /// Write every path in one all-or-nothing update at the store root
    pub async fn put_atomic(&mut self, updates: BTreeMap<String, Value>) -> Result<(), AgentError> {
        let body: Map<String, Value> = updates.into_iter().collect();
        self.request_within(self.call_timeout, "", StoreOp::Patch(Value::Object(body)))
            .await
            .map(|_| ())
    }
}

/// Key paths of one device under `home_automation/devices`
#[derive(Debug, Clone)]
pub struct DevicePaths {
    root: String,
}

impl DevicePaths {
    pub fn new(device_id: &str) -> Self {
        Self {
            root: format!("home_automation/devices/{}", device_id),
        }
    }

    pub fn device(&self) -> &str {
        &self.root
    }

    pub fn relays(&self) -> String {
        format!("{}/relays", self.root)
    }

    pub fn relay(&self, relay_id: RelayId) -> String {
        format!("{}/relays/{}", self.root, relay_id)
    }

    pub fn last_update(&self) -> String {
        format!("{}/last_update", self.root)
    }

    pub fn logs(&self) -> String {
        format!("{}/logs", self.root)
    }

    pub fn commands(&self) -> String {
        format!("{}/commands", self.root)
    }

    pub fn command(&self, command_id: &str) -> String {
        format!("{}/commands/{}", self.root, command_id)
    }
}

/// Entry under `logs/`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
    pub source: String,
}

impl LogEntry {
    pub fn new(level: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: crate::now_timestamp(),
            level: level.to_string(),
            message: message.into(),
            source: "device".to_string(),
        }
    }
}
