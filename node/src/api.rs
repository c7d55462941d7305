//! HTTP API for MERIDIAN node

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use meridian_consensus::{Alert, Envelope, ProposeAck, ProtocolStatus, TxOutcome};
use meridian_core::{ClientRequestId, GroupId, MeridianError};
use meridian_state::KvWrite;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use crate::runtime::NodeRuntime;
use crate::transport::ProposeRequest;

/// API state containing node runtime
pub type ApiState = Arc<NodeRuntime>;

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: impl ToString) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

/// Request failures mapped to status codes
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Engine(#[from] MeridianError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(e) => match e {
                MeridianError::GroupNotFound(_) | MeridianError::PeerNotFound(_) => StatusCode::NOT_FOUND,
                MeridianError::NotAMember(_) | MeridianError::InvalidMessage(_) => StatusCode::BAD_REQUEST,
                MeridianError::LockConflict(_) | MeridianError::TxAborted(_) => StatusCode::CONFLICT,
                MeridianError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
                MeridianError::Halted(_) | MeridianError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(ApiResponse::<()>::err(&self))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Node status response
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeStatusResponse {
    pub node_id: String,
    pub name: String,
    pub peer_count: usize,
    pub groups: Vec<ProtocolStatus>,
}

/// One write of a cross-shard transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteRequest {
    Put { key: String, value: String },
    Delete { key: String },
    Add { key: String, delta: i64 },
}

impl From<WriteRequest> for KvWrite {
    fn from(write: WriteRequest) -> Self {
        match write {
            WriteRequest::Put { key, value } => KvWrite::Put {
                key: key.into_bytes(),
                value: value.into_bytes(),
            },
            WriteRequest::Delete { key } => KvWrite::Delete { key: key.into_bytes() },
            WriteRequest::Add { key, delta } => KvWrite::Add {
                key: key.into_bytes(),
                delta,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub writes: Vec<WriteRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValueResponse {
    pub key: String,
    pub value: Option<String>,
}

/// Create API router
pub fn create_router(state: ApiState) -> Router {
    let enable_cors = state.config().api.enable_cors;
    let router = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/alerts", get(alerts))
        .route("/groups/:id/status", get(group_status))
        .route("/groups/:id/propose", post(propose))
        .route("/groups/:id/kv/:key", get(read_key))
        .route("/transactions", post(transact))
        .route("/consensus/message", post(consensus_message))
        .with_state(state);

    if enable_cors {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
        router.layer(cors)
    } else {
        router
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn status(State(runtime): State<ApiState>) -> impl IntoResponse {
    Json(ApiResponse::ok(NodeStatusResponse {
        node_id: runtime.node_id().to_hex(),
        name: runtime.config().name.clone(),
        peer_count: runtime.directory().len(),
        groups: runtime.statuses(),
    }))
}

async fn alerts(State(runtime): State<ApiState>) -> Json<ApiResponse<Vec<Alert>>> {
    Json(ApiResponse::ok(runtime.manager().alerts()))
}

async fn group_status(State(runtime): State<ApiState>, Path(id): Path<u32>) -> ApiResult<ProtocolStatus> {
    let status = runtime.manager().status(GroupId(id))?;
    Ok(Json(ApiResponse::ok(status)))
}

async fn propose(
    State(runtime): State<ApiState>,
    Path(id): Path<u32>,
    Json(req): Json<ProposeRequest>,
) -> ApiResult<ProposeAck> {
    let data = hex::decode(&req.data).map_err(|_| ApiError::BadRequest("data must be hex".into()))?;
    let request_id = match req.request_id.as_deref() {
        Some(raw) => {
            ClientRequestId::parse(raw).map_err(|_| ApiError::BadRequest("request_id must be a uuid".into()))?
        }
        None => ClientRequestId::new(),
    };
    let ack = runtime.propose(GroupId(id), data, request_id).await?;
    Ok(Json(ApiResponse::ok(ack)))
}

async fn read_key(State(runtime): State<ApiState>, Path((id, key)): Path<(u32, String)>) -> ApiResult<ValueResponse> {
    let value = runtime.read(GroupId(id), key.as_bytes())?;
    Ok(Json(ApiResponse::ok(ValueResponse {
        key,
        value: value.map(|v| String::from_utf8_lossy(&v).into_owned()),
    })))
}

async fn transact(State(runtime): State<ApiState>, Json(req): Json<TransactionRequest>) -> ApiResult<TxOutcome> {
    if req.writes.is_empty() {
        return Err(ApiError::BadRequest("a transaction needs at least one write".into()));
    }
    let writes = req.writes.into_iter().map(KvWrite::from).collect();
    let outcome = runtime.transact(writes).await?;
    Ok(Json(ApiResponse::ok(outcome)))
}

/// Inbound peer traffic; the body is a bincode `Envelope`
async fn consensus_message(State(runtime): State<ApiState>, body: Bytes) -> Result<StatusCode, ApiError> {
    let envelope: Envelope = bincode::deserialize(&body)
        .map_err(|e| ApiError::BadRequest(format!("undecodable envelope: {}", e)))?;
    debug!(group = %envelope.group, from = %envelope.from, kind = envelope.message.name(), "Inbound message");
    runtime.manager().route(envelope)?;
    Ok(StatusCode::ACCEPTED)
}

/// Start API server
pub async fn start_api_server(runtime: Arc<NodeRuntime>, listen_addr: &str) -> anyhow::Result<()> {
    let router = create_router(runtime);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("API server listening on {}", listen_addr);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::LogBackend;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use meridian_core::{GroupConfig, NodeConfig, ProtocolKind, Role};
    use meridian_crypto::KeyPair;
    use meridian_state::{KvCommand, KvResponse};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn runtime() -> ApiState {
        let key = KeyPair::from_seed(&[3; 32]);
        let mut config = NodeConfig::default();
        config.consensus.tick_interval_ms = 5;
        config.batching.max_wait_ticks = 0;
        config.groups = vec![GroupConfig {
            id: 1,
            kind: ProtocolKind::CrashFaultTolerant,
            members: vec![key.node_id().to_hex()],
        }];
        let runtime = Arc::new(NodeRuntime::new(config, key, LogBackend::Memory).unwrap());
        for _ in 0..200 {
            let status = runtime.manager().status(GroupId(1)).unwrap();
            if status.role == Role::Leader && status.commit_index >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        runtime
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let runtime = runtime().await;
        let app = create_router(runtime.clone());

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/groups/1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["role"], "Leader");
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_propose_then_read() {
        let runtime = runtime().await;
        let app = create_router(runtime.clone());

        let request = ProposeRequest {
            data: hex::encode(KvCommand::put("colour", "blue").encode().unwrap()),
            request_id: Some(ClientRequestId::from_u128(11).to_string()),
        };
        let response = app
            .clone()
            .oneshot(
                Request::post("/groups/1/propose")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&request).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let ack: ProposeAck = serde_json::from_value(json["data"].clone()).unwrap();
        assert_eq!(ack.request_id, ClientRequestId::from_u128(11));
        assert_eq!(KvResponse::decode(ack.response.as_ref().unwrap()).unwrap(), KvResponse::Applied);

        let response = app
            .oneshot(Request::get("/groups/1/kv/colour").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["data"]["value"], "blue");
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let runtime = runtime().await;
        let app = create_router(runtime.clone());

        let response = app
            .clone()
            .oneshot(Request::get("/groups/42/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["success"], false);

        let response = app
            .clone()
            .oneshot(
                Request::post("/groups/1/propose")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"data": "not hex"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(
                Request::post("/consensus/message")
                    .body(Body::from(vec![0xff, 0x01]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        runtime.shutdown().await;
    }

    #[test]
    fn test_write_request_json() {
        let writes: Vec<WriteRequest> = serde_json::from_str(
            r#"[{"op": "put", "key": "a", "value": "1"}, {"op": "add", "key": "b", "delta": -2}]"#,
        )
        .unwrap();
        let writes: Vec<KvWrite> = writes.into_iter().map(KvWrite::from).collect();
        assert_eq!(
            writes,
            vec![
                KvWrite::Put {
                    key: b"a".to_vec(),
                    value: b"1".to_vec()
                },
                KvWrite::Add {
                    key: b"b".to_vec(),
                    delta: -2
                },
            ]
        );
    }
}
