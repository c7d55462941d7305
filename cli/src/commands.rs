//! CLI Commands

use meridian_consensus::{Alert, ProposeAck, ProtocolStatus, TxOutcome};
use meridian_core::ClientRequestId;
use meridian_state::{KvCommand, KvResponse};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// API Client for interacting with a MERIDIAN node
pub struct ApiClient {
    base_url: String,
    client: Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let resp: ApiResponse<T> = self.client.get(&url).send().await?.json().await?;
        resp.into_result()
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let resp: ApiResponse<T> = self.client.post(&url).json(body).send().await?.json().await?;
        resp.into_result()
    }

    /// Get node status
    pub async fn status(&self) -> Result<NodeStatus, ApiError> {
        self.get("/status").await
    }

    pub async fn group_status(&self, group: u32) -> Result<ProtocolStatus, ApiError> {
        self.get(&format!("/groups/{}/status", group)).await
    }

    pub async fn alerts(&self) -> Result<Vec<Alert>, ApiError> {
        self.get("/alerts").await
    }

    /// Submit a key-value command to one group
    pub async fn propose(
        &self,
        group: u32,
        command: &KvCommand,
        request_id: ClientRequestId,
    ) -> Result<ProposeAck, ApiError> {
        let data = command.encode().map_err(|e| ApiError::Encoding(e.to_string()))?;
        let body = ProposeRequest {
            data: hex::encode(data),
            request_id: Some(request_id.to_string()),
        };
        self.post(&format!("/groups/{}/propose", group), &body).await
    }

    pub async fn read(&self, group: u32, key: &str) -> Result<Option<String>, ApiError> {
        let value: ValueResponse = self.get(&format!("/groups/{}/kv/{}", group, key)).await?;
        Ok(value.value)
    }

    pub async fn transact(&self, writes: Vec<WriteRequest>) -> Result<TxOutcome, ApiError> {
        self.post("/transactions", &TransactionRequest { writes }).await
    }
}

/// API response wrapper
#[derive(Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T, ApiError> {
        if self.success {
            self.data.ok_or(ApiError::EmptyResponse)
        } else {
            Err(ApiError::Server(self.error.unwrap_or_default()))
        }
    }
}

/// Node status
#[derive(Debug, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub name: String,
    pub peer_count: usize,
    pub groups: Vec<ProtocolStatus>,
}

#[derive(Serialize)]
struct ProposeRequest {
    data: String,
    request_id: Option<String>,
}

#[derive(Deserialize)]
struct ValueResponse {
    value: Option<String>,
}

/// One write of a cross-shard transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteRequest {
    Put { key: String, value: String },
    Delete { key: String },
    Add { key: String, delta: i64 },
}

#[derive(Serialize)]
struct TransactionRequest {
    writes: Vec<WriteRequest>,
}

/// Parse `key=value`
pub fn parse_put(raw: &str) -> Result<WriteRequest, String> {
    let (key, value) = raw.split_once('=').ok_or_else(|| format!("expected key=value, got {}", raw))?;
    Ok(WriteRequest::Put {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Parse `key=delta` with a signed integer delta
pub fn parse_add(raw: &str) -> Result<WriteRequest, String> {
    let (key, delta) = raw.split_once('=').ok_or_else(|| format!("expected key=delta, got {}", raw))?;
    let delta = delta.parse::<i64>().map_err(|e| format!("bad delta {}: {}", delta, e))?;
    Ok(WriteRequest::Add {
        key: key.to_string(),
        delta,
    })
}

/// Human-readable state machine result of an ack
pub fn describe_response(ack: &ProposeAck) -> String {
    match &ack.response {
        Ok(bytes) => match KvResponse::decode(bytes) {
            Ok(KvResponse::Rejected(reason)) => format!("rejected: {}", reason),
            Ok(response) => format!("{:?}", response),
            Err(_) => hex::encode(bytes),
        },
        Err(e) => format!("failed: {}", e),
    }
}

/// API Error
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Empty response")]
    EmptyResponse,
}
