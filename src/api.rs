//! HTTP API.
//!
//! Endpoints:
//! - `GET /info`: service name
//! - `GET /nodes`: inventory node list, proxied through one gateway round trip

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::context::ServiceContext;

/// Body returned with 504 when the inventory service does not answer in time.
pub const TIMEOUT_BODY: &str = "Request Timed Out";

/// Start the HTTP server on `addr`.
///
/// When the port is 0, the OS assigns an ephemeral port. The actual bound
/// address is always logged so it can be discovered.
pub async fn serve(
    ctx: ServiceContext,
    addr: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(ctx);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %listener.local_addr()?, "Starting Voyager HTTP API");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the axum router (separated for testing).
pub fn router(ctx: ServiceContext) -> Router {
    Router::new()
        .route("/info", get(service_info))
        .route("/nodes", get(nodes))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

#[derive(Serialize)]
struct InfoResponse {
    name: &'static str,
}

async fn service_info() -> Json<InfoResponse> {
    Json(InfoResponse { name: "voyager" })
}

async fn nodes(State(ctx): State<ServiceContext>) -> Response {
    match ctx.inventory.get_nodes().await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) if e.is_timeout() => {
            error!(error = %e, "Inventory request timed out");
            (StatusCode::GATEWAY_TIMEOUT, Json(TIMEOUT_BODY)).into_response()
        }
        Err(e) => {
            error!(error = %e, "Inventory request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
