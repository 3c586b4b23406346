//! Admin plane: tunnel provisioning and status endpoints.
//!
//! Creation routes optionally sit behind the HMAC middleware; the status API
//! is always open.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::error;

use crate::auth::{self, HmacAuthenticator};
use crate::config::ServerConfig;
use crate::error::Error;
use crate::ids;
use crate::manager::{ClientManager, Identifier};

const MAX_CLIENT_TOKEN_LEN: usize = 256;

#[derive(Clone)]
pub struct AdminState {
    pub manager: ClientManager,
    pub config: Arc<ServerConfig>,
    pub auth: Option<Arc<HmacAuthenticator>>,
}

pub fn router(state: AdminState) -> Router {
    let creation = Router::new()
        .route("/", get(root))
        .route("/{id}", get(create_named))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_hmac,
        ));

    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/tunnels/{id}/status", get(tunnel_status))
        .merge(creation)
        .with_state(state)
}

/// `GET /?new` mints a tunnel under a random id; a bare `GET /` redirects to
/// the landing page.
async fn root(
    State(state): State<AdminState>,
    Query(params): Query<HashMap<String, String>>,
    req: Request,
) -> Response {
    if params.contains_key("new") {
        let ctx = request_context(&state, &req);
        create_tunnel(&state, None, ctx).await
    } else {
        (
            StatusCode::FOUND,
            [(header::LOCATION, state.config.landing.clone())],
        )
            .into_response()
    }
}

async fn create_named(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    req: Request,
) -> Response {
    if !ids::is_valid_subdomain(&id) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "message": ids::INVALID_SUBDOMAIN_MESSAGE })),
        )
            .into_response();
    }
    let ctx = request_context(&state, &req);
    create_tunnel(&state, Some(id), ctx).await
}

struct RequestContext {
    ip: IpAddr,
    identifier: Identifier,
    host: Option<String>,
}

fn request_context(state: &AdminState, req: &Request) -> RequestContext {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let ip = source_ip(req.headers(), peer, state.config.trust_proxy);
    let identifier = client_identifier(req.headers(), ip);
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    RequestContext { ip, identifier, host }
}

async fn create_tunnel(state: &AdminState, requested: Option<String>, ctx: RequestContext) -> Response {
    let RequestContext { ip, identifier, host } = ctx;

    match state.manager.new_client(requested, identifier, ip).await {
        Ok(lease) => {
            let url = build_url(&lease.id, host.as_deref(), &state.config);
            Json(json!({
                "id": lease.id,
                "port": lease.port,
                "max_conn_count": lease.max_conn_count,
                "url": url,
            }))
            .into_response()
        }
        Err(Error::Reserved { id, remaining_secs }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "Subdomain reserved",
                "message": format!(
                    "Subdomain \"{id}\" is reserved by another client. \
                     Try again in {remaining_secs}s or use a different subdomain."
                ),
            })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "tunnel creation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Tunnel creation failed",
                    "message": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

async fn api_status(State(state): State<AdminState>) -> Response {
    Json(json!({
        "tunnels": state.manager.len(),
        "mem": mem_snapshot(),
    }))
    .into_response()
}

async fn tunnel_status(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.manager.get_client(&id) {
        Some(client) => Json(json!({ "connected_sockets": client.stats().connected })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Tunnel not found" })),
        )
            .into_response(),
    }
}

/// Public URL for a freshly created tunnel. The port suffix is dropped when
/// it matches the scheme default.
fn build_url(id: &str, host_header: Option<&str>, config: &ServerConfig) -> String {
    let scheme = if config.secure { "https" } else { "http" };
    let host = host_header
        .and_then(|h| h.split(':').next())
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .or_else(|| config.domain.clone())
        .unwrap_or_else(|| "localhost".to_string());

    let port = if config.secure {
        config.https_proxy_port.unwrap_or(config.port)
    } else {
        config.http_proxy_port.unwrap_or(config.port)
    };
    let default_port = if config.secure { 443 } else { 80 };

    if port == default_port {
        format!("{scheme}://{id}.{host}")
    } else {
        format!("{scheme}://{id}.{host}:{port}")
    }
}

/// Peer address, or the first forwarded hop when the deployment fronts this
/// server with a trusted proxy.
pub fn source_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> IpAddr {
    if trust_proxy {
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = forwarded.split(',').next() {
                if let Ok(ip) = first.trim().parse() {
                    return ip;
                }
            }
        }
        if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            if let Ok(ip) = real.trim().parse() {
                return ip;
            }
        }
    }
    peer.map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// A well-formed `X-LT-Client-Token` identifies the owner across IP changes;
/// anything else falls back to the source address.
pub fn client_identifier(headers: &HeaderMap, ip: IpAddr) -> Identifier {
    if let Some(token) = headers.get("x-lt-client-token").and_then(|v| v.to_str().ok()) {
        let token = token.trim();
        let well_formed = !token.is_empty()
            && token.len() <= MAX_CLIENT_TOKEN_LEN
            && token
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if well_formed {
            return Identifier::Token(token.to_string());
        }
    }
    Identifier::Ip(ip)
}

#[cfg(target_os = "linux")]
fn mem_snapshot() -> serde_json::Value {
    // /proc/self/statm reports pages; assume the common 4 KiB page
    const PAGE: u64 = 4096;
    let statm = std::fs::read_to_string("/proc/self/statm").unwrap_or_default();
    let mut fields = statm.split_whitespace().map(|f| f.parse::<u64>().unwrap_or(0));
    let vm = fields.next().unwrap_or(0) * PAGE;
    let rss = fields.next().unwrap_or(0) * PAGE;
    json!({ "rss_bytes": rss, "vm_bytes": vm })
}

#[cfg(not(target_os = "linux"))]
fn mem_snapshot() -> serde_json::Value {
    json!({ "rss_bytes": 0, "vm_bytes": 0 })
}
