//! REST transport for a Firebase-style realtime database
//!
//! - Sign-in: `POST {identity_url}?key={api_key}` with email/password
//! - Documents: `{database_url}/{path}.json?auth={token}`
//! - Multi-path atomic update: `PATCH {database_url}/.json` with slash-path keys

use super::transport::{StoreOp, StoreTransport, TokenGrant};
use crate::config::{DeviceCredentials, RemoteConfig};
use crate::error::{AuthError, ConfigurationFault, TransportError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub struct FirebaseTransport {
    http: Client,
    database_url: String,
    identity_url: String,
    api_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInRequest<'a> {
    email: &'a str,
    password: &'a str,
    return_secure_token: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    id_token: String,
    expires_in: Option<String>,
}

#[derive(Deserialize)]
struct IdentityErrorBody {
    error: IdentityError,
}

#[derive(Deserialize)]
struct IdentityError {
    message: String,
}

impl FirebaseTransport {
    pub fn new(config: &RemoteConfig) -> Result<Self, ConfigurationFault> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("relayhub-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigurationFault::InvalidSetting {
                key: "remote",
                reason: format!("HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            database_url: config.database_url.trim_end_matches('/').to_string(),
            identity_url: config.identity_url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn document_url(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        if path.is_empty() {
            format!("{}/.json", self.database_url)
        } else {
            format!("{}/{}.json", self.database_url, path)
        }
    }
}

fn network_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(Duration::ZERO)
    } else {
        TransportError::Network(e.to_string())
    }
}

#[async_trait]
impl StoreTransport for FirebaseTransport {
    async fn sign_in(&self, credentials: &DeviceCredentials) -> Result<TokenGrant, AuthError> {
        debug!("Signing in as {}", credentials.email);
        let body = SignInRequest {
            email: &credentials.email,
            password: credentials.password.expose_secret(),
            return_secure_token: true,
        };

        let response = self
            .http
            .post(&self.identity_url)
            .query(&[("key", &self.api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let grant: SignInResponse = response
                .json()
                .await
                .map_err(|e| AuthError::MalformedGrant(e.to_string()))?;
            let expires_in = match grant.expires_in {
                Some(secs) => secs
                    .parse::<u64>()
                    .map_err(|e| AuthError::MalformedGrant(format!("expiresIn: {}", e)))?,
                None => 3600,
            };
            return Ok(TokenGrant {
                id_token: grant.id_token,
                expires_in: Duration::from_secs(expires_in),
            });
        }

        if status.is_client_error() {
            let reason = response
                .json::<IdentityErrorBody>()
                .await
                .map(|b| b.error.message)
                .unwrap_or_else(|_| status.to_string());
            Err(AuthError::Rejected(reason))
        } else {
            Err(AuthError::Unreachable(format!("identity endpoint answered {}", status)))
        }
    }

    async fn execute(&self, token: &str, path: &str, op: StoreOp) -> Result<Value, TransportError> {
        let url = self.document_url(path);
        let request = match &op {
            StoreOp::Get => self.http.get(&url),
            StoreOp::Patch(body) => self.http.patch(&url).json(body),
            StoreOp::Post(body) => self.http.post(&url).json(body),
        };

        let response = request
            .query(&[("auth", token)])
            .send()
            .await
            .map_err(network_error)?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(TransportError::Unauthorized),
            status if status.is_success() => response
                .json::<Value>()
                .await
                .map_err(|e| TransportError::Decode(e.to_string())),
            status => Err(TransportError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            }),
        }
    }
}
