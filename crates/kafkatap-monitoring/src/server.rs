//! Metrics HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tracing::info;

use kafkatap_common::Result;

use crate::registry::RelationRegistry;

/// Serves the current gauge and counter set in the prometheus text format.
pub struct MetricsServer {
    registry: Arc<RelationRegistry>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(registry: Arc<RelationRegistry>, addr: SocketAddr) -> Self {
        Self { registry, addr }
    }

    pub async fn run(self) -> Result<()> {
        let app = Router::new()
            .route("/metrics", get(serve_metrics))
            .with_state(self.registry);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "serving metrics");
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn serve_metrics(State(registry): State<Arc<RelationRegistry>>) -> Response {
    let mut buf = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut buf) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            buf,
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("encoding metrics: {err}"),
        )
            .into_response(),
    }
}
