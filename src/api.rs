//! HTTP surface: the two status routes, the health/banner endpoints, and
//! the probe streaming endpoint.

use crate::orchestrate::{self, Controller};
use crate::session;
use crate::status::Protocol;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::any::Any;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{error, info};

pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
        .route("/v1/status/:server", get(direct))
        .route("/v1/distributed/:server", get(distributed))
        .route("/v1/stream", get(stream))
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(controller)
}

/// A panicking handler (a poisoned lock, a bug) must not tear down the
/// process or leave the client hanging; it becomes the generic 500.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(text) = err.downcast_ref::<String>() {
        text.as_str()
    } else if let Some(text) = err.downcast_ref::<&str>() {
        text
    } else {
        "non-string panic payload"
    };
    error!("request handler panicked: {detail}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "Internal server error"})),
    )
        .into_response()
}

pub async fn serve(controller: Arc<Controller>, host: &str, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("listening on {host}:{port}");
    axum::serve(listener, router(controller))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down");
        })
        .await
}

async fn banner() -> Json<serde_json::Value> {
    Json(json!({
        "service": "lodestone",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health(State(controller): State<Arc<Controller>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "probes": controller.registry.count(),
    }))
}

#[derive(Deserialize)]
struct StatusParams {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// The `type` query parameter is mandatory on both status routes.
fn required_protocol(params: &StatusParams) -> Result<Protocol, Response> {
    params
        .kind
        .as_deref()
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "Missing required parameter: type (java or bedrock)"
                })),
            )
                .into_response()
        })
}

async fn direct(
    Path(server): Path<String>,
    Query(params): Query<StatusParams>,
    State(controller): State<Arc<Controller>>,
) -> Response {
    let protocol = match required_protocol(&params) {
        Ok(protocol) => protocol,
        Err(response) => return response,
    };
    let status = orchestrate::direct_status(&controller, &server, protocol).await;
    Json(status).into_response()
}

async fn distributed(
    Path(server): Path<String>,
    Query(params): Query<StatusParams>,
    State(controller): State<Arc<Controller>>,
) -> Response {
    let protocol = match required_protocol(&params) {
        Ok(protocol) => protocol,
        Err(response) => return response,
    };
    match orchestrate::distributed_status(&controller, &server, protocol).await {
        Some(body) => Json(body).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "No probe nodes available"})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct StreamParams {
    id: Option<String>,
    region: Option<String>,
}

/// Probe streaming endpoint. Authentication happens after the upgrade so
/// refusals can use the stream's close codes (4001/4002).
async fn stream(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
    State(controller): State<Arc<Controller>>,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    ws.on_upgrade(move |socket| {
        session::run_session(
            controller.registry.clone(),
            controller.dispatcher.clone(),
            controller.credentials.clone(),
            params.id,
            params.region,
            authorization,
            socket,
        )
    })
}
