//! Minimal HTTP control surface: one route to set or clear a dryer's
//! active preset, a liveness probe, and a per-dryer telemetry tap. This is
//! the thin entry point the teacher's much larger `api/` module (sessions,
//! OpenAPI generation, rate limiting, TLS) would sit in front of if this
//! crate ever grew a real web frontage - routing depth, schema validation,
//! auth, and WebSocket fan-out are all out of scope here.

use crate::error::DryerError;
use crate::logger::{LogBufHandle, dryer_logs_channel};
use crate::model::{DryerId, PresetId};
use crate::supervisor::SupervisorHandle;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub supervisor: SupervisorHandle,
    pub logs: LogBufHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/dryers/{id}/preset", post(set_preset))
        .route("/dryers/{id}/stream", get(stream_dryer_telemetry))
        .layer((TraceLayer::new_for_http(), TimeoutLayer::new(REQUEST_TIMEOUT)))
        .with_state(state)
}

/// Binds `addr` and serves `state` until `cancel` fires, then shuts down
/// gracefully (in-flight connections are given a chance to finish).
///
/// This doesn't use `axum::serve`: that helper `tokio::spawn`s each
/// connection, which requires a `Send` service, and `AppState` carries
/// `Rc`-based handles that deliberately aren't `Send` - this crate is
/// single-threaded throughout, same as the Moonraker client's own direct
/// `hyper`/`hyper-util` usage. Driving the HTTP/1 connection loop by hand
/// with `spawn_local` keeps the server on that same model.
pub async fn serve(addr: SocketAddr, state: AppState, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("HTTP control surface listening on {addr}");
    let app = router(state);

    loop {
        let (stream, _peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            () = cancel.cancelled() => break,
        };
        let io = TokioIo::new(stream);
        let service = TowerToHyperService::new(app.clone());
        let conn_cancel = cancel.clone();
        tokio::task::spawn_local(async move {
            let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);
            tokio::pin!(conn);
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        log::warn!("HTTP connection error: {e}");
                    }
                }
                () = conn_cancel.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    if let Err(e) = conn.await {
                        log::warn!("HTTP connection error during shutdown: {e}");
                    }
                }
            }
        });
    }
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Deserialize)]
struct SetPresetBody {
    preset_id: Option<PresetId>,
}

#[derive(Serialize)]
struct SuccessBody {
    success: bool,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

async fn set_preset(State(state): State<AppState>, Path(id): Path<DryerId>, Json(body): Json<SetPresetBody>) -> Response {
    match state.supervisor.set_preset(id, body.preset_id).await {
        Ok(()) => Json(SuccessBody {
            success: true,
            message: format!("dryer {id} preset updated"),
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: DryerError) -> Response {
    let status = match err {
        DryerError::NotFound(_) => StatusCode::NOT_FOUND,
        DryerError::InvalidState(_) | DryerError::ConfigMissing(_) => StatusCode::BAD_REQUEST,
        DryerError::Unreachable(_) | DryerError::Timeout(_) | DryerError::Upstream(_) => StatusCode::BAD_GATEWAY,
        DryerError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            success: false,
            message: err.to_string(),
        }),
    )
        .into_response()
}

/// Streams that dryer's telemetry broadcast channel as newline-delimited
/// JSON chunks - a stand-in for the WebSocket fan-out a real frontend would
/// use, sufficient to exercise the broadcast channel's fan-out itself.
/// A subscriber only ever sees rows appended after it connects.
async fn stream_dryer_telemetry(State(state): State<AppState>, Path(id): Path<DryerId>) -> Response {
    let receiver = state.logs.subscribe(&dryer_logs_channel(id));
    let chunks = BroadcastStream::new(receiver).map(|line| {
        let mut line = line.unwrap_or_default();
        line.push('\n');
        Ok::<_, Infallible>(Bytes::from(line))
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(chunks))
        .expect("static response parts are always valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let resp = error_response(DryerError::NotFound("dryer 9".into()));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn upstream_failures_map_to_bad_gateway() {
        for err in [
            DryerError::Unreachable("refused".into()),
            DryerError::Timeout(Duration::from_secs(10)),
            DryerError::Upstream("500".into()),
        ] {
            assert_eq!(error_response(err).status(), StatusCode::BAD_GATEWAY);
        }
    }

    #[test]
    fn fatal_maps_to_internal_server_error() {
        let resp = error_response(DryerError::Fatal("unexpected".into()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
