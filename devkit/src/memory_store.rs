/*!
In-memory document store for tests without a remote backend

Implements `StoreTransport` over a JSON tree behind one lock, so a multi-path
PATCH is applied all-or-nothing exactly like the real store. Every call is
logged, and failures can be injected per store or per path.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use relayhub_agent::config::DeviceCredentials;
use relayhub_agent::remote::{StoreOp, StoreTransport, TokenGrant};
use relayhub_agent::{AuthError, TransportError};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// One request seen by the store, successful or not
#[derive(Debug, Clone, PartialEq)]
pub struct StoreCall {
    pub method: &'static str,
    pub path: String,
    pub body: Option<Value>,
}

#[derive(Default)]
struct StoreState {
    root: Value,
    calls: Vec<StoreCall>,
    sign_ins: u32,
    next_key: u64,
    fail_all: bool,
    fail_prefixes: Vec<String>,
    fail_calls: Vec<(&'static str, String)>,
    stall_prefixes: Vec<String>,
    reject_auth: bool,
}

/// Shared handle: clones see the same tree
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn join(base: &str, key: &str) -> String {
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), key)
    }
}

fn read_at(root: &Value, path: &str) -> Value {
    let mut node = root;
    for seg in segments(path) {
        match node.get(seg) {
            Some(child) => node = child,
            None => return Value::Null,
        }
    }
    node.clone()
}

/// Store `value` at `path`; null removes the node
fn write_at(root: &mut Value, path: &str, value: Value) {
    let segs: Vec<&str> = segments(path).collect();
    let Some((last, parents)) = segs.split_last() else {
        *root = value;
        return;
    };

    let mut node = root;
    for seg in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = match node {
            Value::Object(map) => map.entry(seg.to_string()).or_insert_with(|| Value::Object(Map::new())),
            _ => return,
        };
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        if value.is_null() {
            map.remove(*last);
        } else {
            map.insert(last.to_string(), value);
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current document at `path`, `Null` when absent
    pub fn read(&self, path: &str) -> Value {
        read_at(&self.state.lock().root, path)
    }

    /// Seed or overwrite a document without going through the call log
    pub fn write(&self, path: &str, value: Value) {
        write_at(&mut self.state.lock().root, path, value);
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().calls.clone()
    }

    pub fn calls_matching(&self, method: &str, path: &str) -> Vec<StoreCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn sign_ins(&self) -> u32 {
        self.state.lock().sign_ins
    }

    /// Every request fails with a network error until cleared
    pub fn set_fail_all(&self, fail: bool) {
        self.state.lock().fail_all = fail;
        log::info!("[MOCK] Store fail_all = {}", fail);
    }

    /// Requests whose path starts with `prefix` fail
    pub fn fail_path(&self, prefix: &str) {
        self.state.lock().fail_prefixes.push(prefix.to_string());
    }

    /// Requests with exactly this method and path fail
    pub fn fail_call(&self, method: &'static str, path: &str) {
        self.state.lock().fail_calls.push((method, path.to_string()));
    }

    /// Requests whose path starts with `prefix` never answer
    pub fn stall_path(&self, prefix: &str) {
        self.state.lock().stall_prefixes.push(prefix.to_string());
    }

    /// Drop every injected failure and stall
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.fail_all = false;
        state.fail_prefixes.clear();
        state.fail_calls.clear();
        state.stall_prefixes.clear();
        state.reject_auth = false;
    }

    pub fn set_reject_auth(&self, reject: bool) {
        self.state.lock().reject_auth = reject;
    }

    /// Entries pushed under `path`, oldest first
    pub fn pushed(&self, path: &str) -> Vec<Value> {
        match self.read(path) {
            Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl StoreTransport for MemoryStore {
    async fn sign_in(&self, credentials: &DeviceCredentials) -> Result<TokenGrant, AuthError> {
        let mut state = self.state.lock();
        if state.reject_auth {
            return Err(AuthError::Rejected("INVALID_LOGIN_CREDENTIALS".to_string()));
        }
        if state.fail_all {
            return Err(AuthError::Unreachable("injected failure".to_string()));
        }
        state.sign_ins += 1;
        log::debug!("[MOCK] Signed in {}", credentials.email);
        Ok(TokenGrant {
            id_token: format!("mock-token-{}", state.sign_ins),
            expires_in: Duration::from_secs(3600),
        })
    }

    async fn execute(&self, _token: &str, path: &str, op: StoreOp) -> Result<Value, TransportError> {
        let stalled = self
            .state
            .lock()
            .stall_prefixes
            .iter()
            .any(|p| path.starts_with(p.as_str()));
        if stalled {
            log::debug!("[MOCK] Stalling {} {}", op.method(), path);
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        let body = match &op {
            StoreOp::Patch(v) | StoreOp::Post(v) => Some(v.clone()),
            StoreOp::Get => None,
        };
        state.calls.push(StoreCall {
            method: op.method(),
            path: path.to_string(),
            body,
        });

        let method = op.method();
        if state.fail_all
            || state.fail_prefixes.iter().any(|p| path.starts_with(p.as_str()))
            || state.fail_calls.iter().any(|(m, p)| *m == method && p == path)
        {
            return Err(TransportError::Network("injected failure".to_string()));
        }

        match op {
            StoreOp::Get => Ok(read_at(&state.root, path)),
            StoreOp::Patch(Value::Object(children)) => {
                // One lock for the whole update: readers see all of it or none
                for (key, value) in &children {
                    write_at(&mut state.root, &join(path, key), value.clone());
                }
                Ok(Value::Object(children))
            }
            StoreOp::Patch(other) => Err(TransportError::Status {
                status: 400,
                path: format!("{} (patch body {} is not an object)", path, other),
            }),
            StoreOp::Post(value) => {
                state.next_key += 1;
                let key = format!("-Nmock{:010}", state.next_key);
                write_at(&mut state.root, &join(path, &key), value);
                Ok(json!({ "name": key }))
            }
        }
    }
}
