//! Smart HTTP bindings for the transfer protocol.
//!
//! Routes:
//!   - GET  /info/refs?service=git-upload-pack|git-receive-pack
//!   - POST /git-upload-pack
//!   - POST /git-receive-pack

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::pktline::PktWriter;
use crate::protocol::{advertise_refs, receive_pack, upload_pack};
use crate::repo::Repository;
use crate::{Error, Result};

/// The two smart HTTP services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(Service::UploadPack),
            "git-receive-pack" => Some(Service::ReceivePack),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }

    pub fn advertisement_type(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-advertisement",
            Service::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    pub fn result_type(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-result",
            Service::ReceivePack => "application/x-git-receive-pack-result",
        }
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct GitState {
    pub repo: Arc<dyn Repository>,
}

#[derive(Deserialize)]
pub struct InfoRefsQuery {
    service: String,
}

fn protocol_response(content_type: &'static str, body: Result<Vec<u8>>) -> Response {
    match body {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from(body))
            .unwrap(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// GET /info/refs?service=...
pub async fn info_refs(
    State(state): State<GitState>,
    Query(query): Query<InfoRefsQuery>,
) -> Response {
    let service = match Service::from_name(&query.service) {
        Some(service) => service,
        None => return (StatusCode::BAD_REQUEST, "unknown service").into_response(),
    };
    debug!(service = service.as_str(), "advertising over http");
    let body = advertise_refs(state.repo.as_ref()).and_then(|refs| {
        let mut out = PktWriter::new();
        out.write_text(&format!("# service={}", service.as_str()))?;
        out.flush();
        out.write_raw(&refs);
        Ok(out.into_bytes())
    });
    protocol_response(service.advertisement_type(), body)
}

/// POST /git-upload-pack (fetch)
pub async fn upload_pack_handler(State(state): State<GitState>, body: Bytes) -> Response {
    protocol_response(
        Service::UploadPack.result_type(),
        upload_pack(state.repo.as_ref(), &body),
    )
}

/// POST /git-receive-pack (push)
pub async fn receive_pack_handler(State(state): State<GitState>, body: Bytes) -> Response {
    protocol_response(
        Service::ReceivePack.result_type(),
        receive_pack(state.repo.as_ref(), &body),
    )
}

/// Build the smart HTTP router over a shared repository.
pub fn router(repo: Arc<dyn Repository>) -> Router {
    Router::new()
        .route("/info/refs", get(info_refs))
        .route("/git-upload-pack", post(upload_pack_handler))
        .route("/git-receive-pack", post(receive_pack_handler))
        .with_state(GitState { repo })
}

/// Server configuration, loadable from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "127.0.0.1:8418".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|err| Error::Config(err.to_string()))
    }
}

/// Serve the router until the listener fails.
pub async fn serve(config: &ServerConfig, repo: Arc<dyn Repository>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(addr = %config.bind_address, "serving git smart http");
    axum::serve(listener, router(repo)).await?;
    Ok(())
}
