//! HTTP host for the invocation handler.
//!
//! - `POST /invoke` takes a raw trigger event (storage notification, HTTP
//!   event or anything else) and answers with the handler's response
//! - `GET /health` reports liveness
//! - any other request is wrapped as an HTTP trigger and routed like one

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::core::Response;
use crate::domain::trigger::http_event;
use crate::handler::DocumentHandler;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether a pipeline run currently holds the lease
    pub busy: bool,
}

pub struct Server {
    handler: DocumentHandler,
}

impl Server {
    pub fn new(handler: DocumentHandler) -> Self {
        Self { handler }
    }

    /// Build the router with all routes and middleware
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/invoke", post(invoke))
            .fallback(http_call)
            .layer(TraceLayer::new_for_http())
            .with_state(self.handler.clone())
    }

    /// Serve until the process is stopped
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let router = self.router();

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        info!("Listening on {}", addr);

        axum::serve(listener, router)
            .await
            .context("Server error")?;

        Ok(())
    }
}

async fn health(State(handler): State<DocumentHandler>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        busy: handler.guard().is_held(),
    })
}

async fn invoke(State(handler): State<DocumentHandler>, body: Bytes) -> axum::response::Response {
    // A body that is not JSON is still an event; the router rejects it
    let raw = serde_json::from_slice(&body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));

    into_http(handler.handle(&raw).await)
}

async fn http_call(
    State(handler): State<DocumentHandler>,
    method: Method,
    uri: Uri,
    body: String,
) -> axum::response::Response {
    let body = (!body.is_empty()).then_some(body);
    let raw = http_event(method.as_str(), uri.path(), body);

    into_http(handler.handle(&raw).await)
}

/// Translate the handler's envelope into a real HTTP response
fn into_http(response: Response) -> axum::response::Response {
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut builder = axum::http::Response::builder().status(status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
