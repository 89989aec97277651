//! HTTP API Server
//!
//! REST API over one table replica: insert blocks, inspect the queue and
//! part set, and read the operator status surface.

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::config::ApiConfig;
use crate::engine::{InsertOutcome, ReplicatedTable};
use crate::error::{Error, Result};
use crate::part::Block;

/// Shared application state
struct AppState {
    table: Arc<ReplicatedTable>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, table: Arc<ReplicatedTable>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { table }),
        }
    }

    fn create_router(state: Arc<AppState>, cors: bool) -> Router {
        let router = Router::new()
            .route("/insert", post(handle_insert))
            .route("/status", get(handle_status))
            .route("/queue", get(handle_queue))
            .route("/parts", get(handle_parts))
            .route("/health", get(handle_health))
            .with_state(state);
        if cors {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server; runs until the listener fails
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state), self.config.cors_enabled);
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;
        Ok(())
    }
}

// ============ Request/Response Types ============

#[derive(Debug, Deserialize)]
struct InsertRequest {
    partition: String,
    rows: Vec<serde_json::Value>,
    #[serde(default)]
    quorum: Option<usize>,
}

#[derive(Debug, Serialize)]
struct InsertResponse {
    deduplicated: bool,
    part: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(error: Error) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &error {
        Error::Readonly | Error::StaleReplicaReadonly { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::QuorumBroken { .. } | Error::QuorumTimeout { .. } => StatusCode::ACCEPTED,
        Error::Config(_) | Error::InvalidPartName(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

// ============ Handlers ============

async fn handle_insert(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InsertRequest>,
) -> impl IntoResponse {
    let block = Block::new(request.partition, request.rows);
    match state.table.insert(block, request.quorum).await {
        Ok(InsertOutcome::Inserted { part }) => (
            StatusCode::OK,
            Json(InsertResponse {
                deduplicated: false,
                part: Some(part.to_string()),
            }),
        )
            .into_response(),
        Ok(InsertOutcome::Deduplicated { part }) => (
            StatusCode::OK,
            Json(InsertResponse {
                deduplicated: true,
                part: part.map(|p| p.to_string()),
            }),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.table.status().await)
}

async fn handle_queue(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.table.queue_summaries().await)
}

async fn handle_parts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.table.local_parts().await {
        Ok(parts) => Json(parts).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.table.is_readonly() {
        (StatusCode::SERVICE_UNAVAILABLE, "readonly")
    } else {
        (StatusCode::OK, "ok")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::{
        ApiConfig, CleanupConfig, ExchangeConfig, QueueConfig, QuorumConfig, ReplicaConfig,
        TimberlineConfig,
    };
    use crate::coordination::MemoryCoordination;
    use crate::storage::MemoryStore;

    async fn router() -> Router {
        let config = TimberlineConfig {
            replica: ReplicaConfig {
                table_path: "/tables/api".to_string(),
                replica_name: "r1".to_string(),
                max_suspicious_local_parts: 5,
            },
            coordination: Default::default(),
            queue: QueueConfig::default(),
            merges: Default::default(),
            quorum: QuorumConfig::default(),
            dedup: Default::default(),
            cleanup: CleanupConfig::default(),
            exchange: ExchangeConfig {
                bind_address: "127.0.0.1:0".to_string(),
                advertise_address: None,
                connect_timeout_ms: 1_000,
                fetch_timeout_ms: 5_000,
                compression: true,
            },
            api: ApiConfig::default(),
            logging: Default::default(),
        };
        let coord = MemoryCoordination::new();
        let table = ReplicatedTable::new(
            config,
            coord.session_factory(),
            Arc::new(MemoryStore::new()),
        )
        .await
        .unwrap();
        table.startup_manual().await.unwrap();
        HttpServer::create_router(Arc::new(AppState { table }), false)
    }

    #[tokio::test]
    async fn test_status_queue_and_insert_endpoints() {
        let app = router().await;

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/insert")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"partition":"p","rows":[{"id":1}]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/queue").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
