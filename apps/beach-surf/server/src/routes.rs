use std::{collections::BTreeMap, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use beach_surf_core::{HandshakeError, Session};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{connection, layout, protocol::FLASH_PARAM, state::AppState};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/live/websocket", get(ws_handler))
        .route("/live/:view", get(page_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: String,
}

#[derive(Debug, Serialize)]
struct RejectionBody {
    success: bool,
    reason: &'static str,
}

/// HTTP face of a failed handshake step.
pub struct HandshakeRejection(pub HandshakeError);

impl IntoResponse for HandshakeRejection {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            HandshakeError::Verification(_) => StatusCode::UNAUTHORIZED,
            HandshakeError::UnknownView(_) => StatusCode::NOT_FOUND,
            HandshakeError::Initialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
            HandshakeError::Render(_) | HandshakeError::Signing(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = RejectionBody {
            success: false,
            reason: self.0.metric_label(),
        };
        (status, Json(body)).into_response()
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "active_instances": state.active_instances() }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

/// Disconnected render. Query parameters become the session; `flash` is
/// reserved for the signed notice carried over from a redirect.
async fn page_handler(
    State(state): State<Arc<AppState>>,
    Path(view): Path<String>,
    Query(mut query): Query<BTreeMap<String, String>>,
) -> Response {
    let flash = query
        .remove(FLASH_PARAM)
        .map(|token| state.verify_flash(&token))
        .unwrap_or_default();
    let session = session_from_query(query);

    match state.endpoint().render_disconnected(&view, session).await {
        Ok(document) => {
            counter!("beach_surf_disconnected_renders_total", 1, "view" => view);
            Html(layout::page(&document, &flash)).into_response()
        }
        Err(err) => {
            warn!(view = %view, error = %err, "disconnected render failed");
            counter!(
                "beach_surf_disconnected_render_failures_total",
                1,
                "reason" => err.metric_label()
            );
            HandshakeRejection(err).into_response()
        }
    }
}

/// Verifies the token before agreeing to upgrade, so a bad token never gets
/// a socket.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let verified = match state.endpoint().verify(&query.token) {
        Ok(verified) => verified,
        Err(err) => {
            connection::record_handshake_failure(&err);
            return HandshakeRejection(err).into_response();
        }
    };

    match ws {
        Some(ws) => ws
            .on_upgrade(move |socket| connection::serve(socket, state, verified))
            .into_response(),
        None => (
            StatusCode::UPGRADE_REQUIRED,
            Json(RejectionBody {
                success: false,
                reason: "upgrade_required",
            }),
        )
            .into_response(),
    }
}

fn session_from_query(query: BTreeMap<String, String>) -> Session {
    query
        .into_iter()
        .map(|(key, raw)| {
            let value = if let Ok(number) = raw.parse::<i64>() {
                Value::from(number)
            } else if let Ok(flag) = raw.parse::<bool>() {
                Value::from(flag)
            } else {
                Value::from(raw)
            };
            (key, value)
        })
        .collect()
}
