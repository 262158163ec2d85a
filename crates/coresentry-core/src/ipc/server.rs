//! Control API router.
//!
//! Maps HTTP routes onto the [`AuthGate`], the [`CoreSupervisor`] and the
//! [`SystemConfigurator`]. `/ping` is open; every other route sits behind
//! the signature check. Failures, authentication included, are rendered
//! as the `{status: "error", message}` envelope with HTTP 200.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use tracing::{info, warn};

use super::types::{ControlRequest, Response};
use crate::auth::{AuthGate, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::supervisor::CoreSupervisor;
use crate::sys::SystemConfigurator;

/// Shared state accessible to all route handlers.
pub struct ApiState {
    pub auth: Arc<AuthGate>,
    pub supervisor: CoreSupervisor,
    pub system: Arc<dyn SystemConfigurator>,
}

/// Build the axum router with all control routes.
pub fn router(state: Arc<ApiState>) -> axum::Router {
    let protected = axum::Router::new()
        .route("/test", get(handle_test))
        .route("/core", get(handle_core_status))
        .route("/core/health", get(handle_core_health))
        .route("/core/start", post(handle_core_start))
        .route("/core/stop", post(handle_core_stop))
        .route("/core/restart", post(handle_core_restart))
        .route("/sysproxy/status", get(handle_proxy_status))
        .route("/sysproxy/pac", post(handle_set_pac))
        .route("/sysproxy/proxy", post(handle_set_proxy))
        .route("/sysproxy/disable", post(handle_disable_proxy))
        .route("/sys/dns/set", post(handle_set_dns))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_signature,
        ));

    axum::Router::new()
        .route("/ping", get(handle_ping))
        .merge(protected)
        .with_state(state)
}

async fn require_signature(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> HttpResponse {
    let verdict = {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
        };
        state
            .auth
            .authenticate(header(TIMESTAMP_HEADER), header(SIGNATURE_HEADER))
    };

    match verdict {
        Ok(()) => next.run(request).await,
        Err(e) => {
            warn!(path = %request.uri().path(), error = %e, "Rejected control request");
            envelope_error(e)
        }
    }
}

fn envelope_error(err: impl std::fmt::Display) -> HttpResponse {
    Json(Response::error(err.to_string())).into_response()
}

fn envelope_success(message: &str) -> HttpResponse {
    Json(Response::success(message)).into_response()
}

fn decode(body: &Bytes) -> Result<ControlRequest, HttpResponse> {
    ControlRequest::from_body(body).map_err(|e| {
        warn!(error = %e, "Malformed control request body");
        envelope_error(format!("invalid request body: {e}"))
    })
}

// ── Route handlers ──────────────────────────────────────────────────────

async fn handle_ping() -> Json<Response> {
    Json(Response::new("", "pong"))
}

async fn handle_test() -> Json<Response> {
    Json(Response::new("", "auth success"))
}

async fn handle_core_status(State(state): State<Arc<ApiState>>) -> HttpResponse {
    match state.supervisor.process_info().await {
        Ok(info) => Json(info).into_response(),
        Err(e) => envelope_error(e),
    }
}

async fn handle_core_health(State(state): State<Arc<ApiState>>) -> HttpResponse {
    if state.supervisor.is_healthy().await {
        envelope_success("healthy")
    } else {
        envelope_error("unhealthy")
    }
}

async fn handle_core_start(State(state): State<Arc<ApiState>>) -> HttpResponse {
    info!("Core start requested");
    match state.supervisor.start().await {
        Ok(()) => envelope_success("core started"),
        Err(e) => envelope_error(e),
    }
}

async fn handle_core_stop(State(state): State<Arc<ApiState>>) -> HttpResponse {
    info!("Core stop requested");
    match state.supervisor.stop().await {
        Ok(()) => envelope_success("core stopped"),
        Err(e) => envelope_error(e),
    }
}

async fn handle_core_restart(State(state): State<Arc<ApiState>>) -> HttpResponse {
    info!("Core restart requested");
    match state.supervisor.restart().await {
        Ok(()) => envelope_success("core restarted"),
        Err(e) => envelope_error(e),
    }
}

async fn handle_proxy_status(State(state): State<Arc<ApiState>>) -> HttpResponse {
    let started = Instant::now();
    let result = state.system.proxy_status().await;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "Queried system proxy settings");
    match result {
        Ok(status) => Json(status).into_response(),
        Err(e) => envelope_error(e),
    }
}

async fn handle_set_pac(State(state): State<Arc<ApiState>>, body: Bytes) -> HttpResponse {
    let req = match decode(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let started = Instant::now();
    let result = state.system.set_pac(&req.url, &req.scope()).await;
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        url = %req.url,
        "Set PAC proxy"
    );
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => envelope_error(e),
    }
}

async fn handle_set_proxy(State(state): State<Arc<ApiState>>, body: Bytes) -> HttpResponse {
    let req = match decode(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let started = Instant::now();
    let result = state
        .system
        .set_proxy(&req.server, &req.bypass, &req.scope())
        .await;
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        server = %req.server,
        bypass = %req.bypass,
        "Set system proxy"
    );
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => envelope_error(e),
    }
}

async fn handle_disable_proxy(State(state): State<Arc<ApiState>>, body: Bytes) -> HttpResponse {
    let req = match decode(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let started = Instant::now();
    let result = state.system.disable_proxy(&req.scope()).await;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "Disabled system proxy");
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => envelope_error(e),
    }
}

async fn handle_set_dns(State(state): State<Arc<ApiState>>, body: Bytes) -> HttpResponse {
    let req = match decode(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let started = Instant::now();
    let result = state.system.set_dns(&req.device, &req.servers).await;
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        device = %req.device,
        servers = ?req.servers,
        "Set DNS servers"
    );
    match result {
        Ok(()) => envelope_success("DNS servers set"),
        Err(e) => envelope_error(e),
    }
}
