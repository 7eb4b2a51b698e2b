// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP surface: `POST /rpc` and `GET /health`.

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use super::{Response, RpcServer};
use crate::context::Context;
use crate::error::{Error, Result};

/// Shared by every handler. Requests run under children of `ctx`, so
/// shutting the server down cancels them.
#[derive(Clone)]
struct AppState {
    server: RpcServer,
    ctx: Context,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    devices: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        devices: state.server.registry().len(),
    })
}

/// Always answers 200; failures are inside the envelope.
async fn rpc(State(state): State<AppState>, body: Bytes) -> Json<Response> {
    let (_, response) = state.server.handle_bytes(&state.ctx.child(), &body).await;
    Json(response)
}

/// Builds the HTTP router. Cancelling `ctx` cancels in-flight requests.
pub fn router(server: RpcServer, ctx: Context) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rpc", post(rpc))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { server, ctx })
}

/// Serves the router on `listener` until `ctx` is cancelled.
///
/// # Errors
///
/// Returns [`Error::Config`] if the server fails.
pub async fn serve_http(listener: TcpListener, server: RpcServer, ctx: Context) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "HTTP server listening");
    }
    let app = router(server, ctx.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { ctx.cancelled().await })
        .await
        .map_err(|e| Error::Config(format!("HTTP server error: {e}")))
}
