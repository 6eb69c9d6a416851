use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::errors::{ChainError, ChainResult};
use crate::network::PeerTipStatus;
use crate::node::{EpochStatus, NodeHandle, NodeStatus, PeerGuard};
use crate::storage::BlockSummary;
use crate::types::{
    Block, BlockAnnounce, BlockBroadcast, ExpiredTx, FinalizeEventTx, MedicalRecordSubmission,
    TransactionReceipt,
};

#[derive(Clone)]
struct AppState {
    node: NodeHandle,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(rename = "validatorDID")]
    validator_did: String,
}

#[derive(Serialize)]
struct ChainHeightResponse {
    #[serde(rename = "chainHeight")]
    chain_height: u64,
}

#[derive(Serialize)]
struct ChainTipResponse {
    #[serde(rename = "latestBlockID")]
    latest_block_id: String,
}

#[derive(Deserialize)]
struct BlockIdQuery {
    block_id: String,
}

#[derive(Deserialize)]
struct BlockIdBody {
    #[serde(rename = "blockID")]
    block_id: String,
}

#[derive(Deserialize)]
struct BlocksQuery {
    #[serde(default)]
    start: u64,
    end: Option<u64>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct ConnectPeerRequest {
    address: String,
}

#[derive(Deserialize)]
struct ResubmitRequest {
    #[serde(rename = "txID")]
    tx_id: String,
}

#[derive(Serialize)]
struct ResubmitResponse {
    #[serde(rename = "txID")]
    tx_id: String,
}

#[derive(Deserialize)]
struct FinalizeRequest {
    tx: FinalizeEventTx,
    #[serde(rename = "finalizerPubKey")]
    finalizer_pub_key: String,
}

pub async fn serve(node: NodeHandle, addr: SocketAddr) -> ChainResult<()> {
    let state = AppState { node };
    let router = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/chain_height", get(chain_height))
        .route("/get_chain_tip", get(chain_tip))
        .route("/request_block", get(request_block).post(request_block_post))
        .route("/blocks", get(blocks_range))
        .route("/list_blocks", get(list_blocks))
        .route("/announce_block", post(announce_block))
        .route("/broadcast_block", post(broadcast_block))
        .route("/gossip_tx", post(gossip_tx))
        .route("/mempool", get(mempool_ids))
        .route("/expired_records", get(expired_records))
        .route("/resubmit_record", post(resubmit_record))
        .route("/check_peers", get(check_peers))
        .route("/epoch/status", get(epoch_status))
        .route("/connect_peer", post(connect_peer))
        .route("/submit_record", post(submit_record))
        .route("/finalize_record", post(finalize_record))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "API server listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|err| ChainError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
}

/// Every peer-facing handler clears the ban list and rate limiter first.
fn guard(state: &AppState, remote: &SocketAddr) -> Result<(), ApiError> {
    match state.node.guard_peer(&remote.ip().to_string()) {
        Ok(()) => Ok(()),
        Err(PeerGuard::Banned) => Err((
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: "forbidden: banned".into(),
            }),
        )),
        Err(PeerGuard::RateLimited) => Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse {
                error: "rate limit exceeded".into(),
            }),
        )),
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        validator_did: state.node.status().validator_did,
    })
}

async fn status(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Result<Json<NodeStatus>, ApiError> {
    guard(&state, &remote)?;
    Ok(Json(state.node.status()))
}

async fn chain_height(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Result<Json<ChainHeightResponse>, ApiError> {
    guard(&state, &remote)?;
    Ok(Json(ChainHeightResponse {
        chain_height: state.node.chain_height(),
    }))
}

async fn chain_tip(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Result<Json<ChainTipResponse>, ApiError> {
    guard(&state, &remote)?;
    Ok(Json(ChainTipResponse {
        latest_block_id: state.node.chain_tip_hex(),
    }))
}

async fn request_block(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<BlockIdQuery>,
) -> Result<Vec<u8>, ApiError> {
    guard(&state, &remote)?;
    state.node.block_bytes(&query.block_id).map_err(to_http_error)
}

async fn request_block_post(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(body): Json<BlockIdBody>,
) -> Result<Vec<u8>, ApiError> {
    guard(&state, &remote)?;
    state.node.block_bytes(&body.block_id).map_err(to_http_error)
}

async fn blocks_range(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<BlocksQuery>,
) -> Result<Json<Vec<Block>>, ApiError> {
    guard(&state, &remote)?;
    let end = query.end.unwrap_or_else(|| state.node.chain_height());
    if end < query.start {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "invalid block range".into(),
            }),
        ));
    }
    let limit = query.limit.unwrap_or(100).min(100);
    Ok(Json(state.node.blocks_range(query.start, end, limit)))
}

async fn list_blocks(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Result<Json<Vec<BlockSummary>>, ApiError> {
    guard(&state, &remote)?;
    state.node.recent_blocks(10).map(Json).map_err(to_http_error)
}

async fn announce_block(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(announce): Json<BlockAnnounce>,
) -> Result<StatusCode, ApiError> {
    guard(&state, &remote)?;
    state
        .node
        .handle_announce(announce, remote.ip().to_string())
        .map(|_| StatusCode::OK)
        .map_err(to_http_error)
}

async fn broadcast_block(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(message): Json<BlockBroadcast>,
) -> Result<StatusCode, ApiError> {
    guard(&state, &remote)?;
    state
        .node
        .handle_broadcast(message)
        .map(|_| StatusCode::OK)
        .map_err(to_http_error)
}

async fn gossip_tx(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: axum::body::Bytes,
) -> Result<StatusCode, ApiError> {
    guard(&state, &remote)?;
    state
        .node
        .gossip_receive(&body)
        .map(|_| StatusCode::OK)
        .map_err(to_http_error)
}

async fn mempool_ids(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Result<Json<Vec<String>>, ApiError> {
    guard(&state, &remote)?;
    Ok(Json(state.node.mempool_tx_ids()))
}

async fn expired_records(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Result<Json<Vec<ExpiredTx>>, ApiError> {
    guard(&state, &remote)?;
    Ok(Json(state.node.expired_records()))
}

async fn resubmit_record(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(request): Json<ResubmitRequest>,
) -> Result<Json<ResubmitResponse>, ApiError> {
    guard(&state, &remote)?;
    state
        .node
        .resubmit_record(&request.tx_id)
        .map(|tx_id| Json(ResubmitResponse { tx_id }))
        .map_err(to_http_error)
}

async fn check_peers(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Result<Json<Vec<PeerTipStatus>>, ApiError> {
    guard(&state, &remote)?;
    Ok(Json(state.node.check_peers()))
}

async fn epoch_status(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Result<Json<EpochStatus>, ApiError> {
    guard(&state, &remote)?;
    Ok(Json(state.node.epoch_status()))
}

async fn connect_peer(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(request): Json<ConnectPeerRequest>,
) -> Result<StatusCode, ApiError> {
    guard(&state, &remote)?;
    state
        .node
        .connect_peer(&request.address)
        .await
        .map(|_| StatusCode::OK)
        .map_err(to_http_error)
}

async fn submit_record(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(submission): Json<MedicalRecordSubmission>,
) -> Result<Json<TransactionReceipt>, ApiError> {
    guard(&state, &remote)?;
    state
        .node
        .submit_record(submission)
        .await
        .map(Json)
        .map_err(to_http_error)
}

async fn finalize_record(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(request): Json<FinalizeRequest>,
) -> Result<Json<FinalizeEventTx>, ApiError> {
    guard(&state, &remote)?;
    state
        .node
        .finalize_record(request.tx, &request.finalizer_pub_key)
        .map(Json)
        .map_err(to_http_error)
}

fn to_http_error(err: ChainError) -> ApiError {
    let status = match err {
        ChainError::Transaction(_) | ChainError::Config(_) | ChainError::Serialization(_) => {
            StatusCode::BAD_REQUEST
        }
        ChainError::Crypto(_) => StatusCode::UNAUTHORIZED,
        ChainError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
