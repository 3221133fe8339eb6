use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::error::ApiError;
use super::types::{SERVER_ONLINE_KEY, ServerOnlineState};
use crate::layout::ClientInstance;
use crate::state::RemoteStateReader;
use crate::sync::RemoteStatus;

/// HTTP client for the API every agent in the fleet exposes.
#[derive(Debug, Clone)]
pub struct AgentClient {
    client: Client,
}

impl AgentClient {
    /// Builds a client whose calls give up after `request_timeout`.
    pub fn new(request_timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// `GET /api/heartbeat`. Any success status means the agent is alive.
    pub async fn heartbeat(&self, peer: &ClientInstance) -> Result<bool, ApiError> {
        let url = format!("{}/api/heartbeat", peer.base_url());
        let response = self.client.get(&url).send().await?;
        Ok(response.status().is_success())
    }

    /// `GET /api/state/{key}`. Returns `None` when the peer has no such record.
    pub async fn get_state(
        &self,
        peer: &ClientInstance,
        key: &str,
    ) -> Result<Option<Value>, ApiError> {
        let url = format!("{}/api/state/{key}", peer.base_url());
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ApiError::Status {
                url,
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        let value = serde_json::from_str(&body).map_err(|e| ApiError::Decode {
            url,
            reason: e.to_string(),
        })?;
        Ok(Some(value))
    }

    /// Reads the peer's published online signal.
    pub async fn server_online(&self, peer: &ClientInstance) -> Result<bool, ApiError> {
        let Some(value) = self.get_state(peer, SERVER_ONLINE_KEY).await? else {
            return Ok(false);
        };
        let state: ServerOnlineState =
            serde_json::from_value(value).map_err(|e| ApiError::Decode {
                url: format!("{}/api/state/{SERVER_ONLINE_KEY}", peer.base_url()),
                reason: e.to_string(),
            })?;
        Ok(state.online)
    }
}

#[async_trait]
impl RemoteStatus for AgentClient {
    async fn heartbeat(&self, peer: &ClientInstance) -> Result<bool, ApiError> {
        AgentClient::heartbeat(self, peer).await
    }

    async fn online(&self, peer: &ClientInstance) -> Result<bool, ApiError> {
        self.server_online(peer).await
    }
}

#[async_trait]
impl RemoteStateReader for AgentClient {
    async fn read_state(
        &self,
        peer: &ClientInstance,
        key: &str,
    ) -> Result<Option<Value>, ApiError> {
        self.get_state(peer, key).await
    }
}
