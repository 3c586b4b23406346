//! Public plane: resolves the tunnel from the Host header and forwards
//! requests and upgrades, with 404/503 semantics around tunnel lifecycle.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower::ServiceExt;
use tracing::{debug, warn};

use crate::client::Client;
use crate::config::ServerConfig;
use crate::manager::ClientManager;

#[derive(Clone)]
pub struct PublicState {
    pub manager: ClientManager,
    pub config: Arc<ServerConfig>,
    pub admin: Router,
}

pub fn router(state: PublicState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .fallback(handle)
        .with_state(state)
}

async fn healthz() -> Response {
    Json(json!({ "status": "healthy" })).into_response()
}

async fn handle(State(state): State<PublicState>, req: Request) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let Some(host) = host else {
        return (StatusCode::BAD_REQUEST, "Host header is required").into_response();
    };

    let Some(subdomain) = subdomain_from_host(&host, state.config.domain.as_deref()) else {
        // single-port deployments: the bare domain serves the admin plane
        return match state.admin.clone().oneshot(req).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        };
    };

    let Some(client) = state.manager.get_client(&subdomain) else {
        debug!(subdomain = %subdomain, "no tunnel for host");
        return not_found();
    };

    if req.headers().contains_key(header::UPGRADE) {
        handle_upgrade(&state, client, req).await
    } else {
        handle_proxy(&state, client, req).await
    }
}

async fn handle_proxy(state: &PublicState, client: Client, req: Request) -> Response {
    if !client.is_online() {
        return match client.grace_period_remaining() {
            Some(remaining) => grace_unavailable(remaining),
            None => not_found(),
        };
    }
    if !client.has_available_sockets() {
        return service_unavailable(state.config.retry_after_secs);
    }
    match client.handle_request(req).await {
        Ok(response) => response,
        Err(e) => {
            warn!(subdomain = %client.id(), error = %e, "request forwarding failed");
            service_unavailable(state.config.retry_after_secs)
        }
    }
}

/// Upgrades get patience that plain requests do not: an offline tunnel is
/// awaited through its grace window, and a busy one is polled for a free
/// socket, both bounded by the websocket timeout.
async fn handle_upgrade(state: &PublicState, client: Client, req: Request) -> Response {
    let ws_timeout = state.config.websocket_timeout;

    if !client.is_online() {
        let Some(remaining) = client.grace_period_remaining() else {
            return not_found();
        };
        if !wait_online(&client, ws_timeout.min(remaining)).await {
            return match client.grace_period_remaining() {
                Some(remaining) => grace_unavailable(remaining),
                None => not_found(),
            };
        }
    }

    if !client.has_available_sockets()
        && !wait_available(&client, ws_timeout, state.config.socket_check_interval).await
    {
        return service_unavailable(state.config.retry_after_secs);
    }

    match client.handle_upgrade(req).await {
        Ok(response) => response,
        Err(e) => {
            warn!(subdomain = %client.id(), error = %e, "upgrade forwarding failed");
            service_unavailable(state.config.retry_after_secs)
        }
    }
}

async fn wait_online(client: &Client, limit: Duration) -> bool {
    let mut rx = client.online_watch();
    let outcome = tokio::time::timeout(limit, rx.wait_for(|online| *online)).await;
    match outcome {
        Ok(result) => result.is_ok(),
        Err(_) => false,
    }
}

async fn wait_available(client: &Client, limit: Duration, interval: Duration) -> bool {
    let poll = async {
        while !client.has_available_sockets() {
            tokio::time::sleep(interval).await;
        }
    };
    tokio::time::timeout(limit, poll).await.is_ok()
}

/// Derives the tunnel id from the Host header; `None` sends the request to
/// the admin plane.
fn subdomain_from_host(host: &str, base_domain: Option<&str>) -> Option<String> {
    let hostname = host.split(':').next().unwrap_or("");
    if hostname.is_empty() {
        return None;
    }
    match base_domain {
        Some(domain) => {
            let prefix = hostname.strip_suffix(domain)?.strip_suffix('.')?;
            if prefix.is_empty() {
                None
            } else {
                Some(prefix.to_string())
            }
        }
        None => {
            let labels: Vec<&str> = hostname.split('.').collect();
            if labels.len() > 2 {
                Some(labels[..labels.len() - 2].join("."))
            } else {
                None
            }
        }
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Tunnel Not Found").into_response()
}

fn grace_unavailable(remaining: Duration) -> Response {
    let secs = (remaining.as_millis() as u64).div_ceil(1000);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, secs.to_string())],
        "Service Temporarily Unavailable",
    )
        .into_response()
}

fn service_unavailable(retry_after_secs: u64) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, retry_after_secs.to_string())],
        "Service Unavailable",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    use crate::admin::{self, AdminState};
    use crate::manager::Identifier;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn test_state(mutate: impl FnOnce(&mut ServerConfig)) -> PublicState {
        let mut config = ServerConfig {
            address: LOCALHOST,
            domain: Some("example.com".to_string()),
            ..ServerConfig::default()
        };
        mutate(&mut config);
        let config = Arc::new(config);
        let manager = ClientManager::new(Arc::clone(&config));
        let admin = admin::router(AdminState {
            manager: manager.clone(),
            config: Arc::clone(&config),
            auth: None,
        });
        PublicState {
            manager,
            config,
            admin,
        }
    }

    fn public_request(host: Option<&str>, path: &str) -> Request {
        let mut builder = axum::http::Request::builder().uri(path);
        if let Some(host) = host {
            builder = builder.header(header::HOST, host);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(axum::extract::ConnectInfo(SocketAddr::from((
                [127, 0, 0, 1],
                44444,
            ))));
        req
    }

    async fn send(router: &Router, req: Request) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        (status, headers, body)
    }

    async fn wait_client_online(client: &Client) {
        let mut rx = client.online_watch();
        timeout(Duration::from_secs(2), rx.wait_for(|online| *online))
            .await
            .expect("client did not come online")
            .unwrap();
    }

    #[tokio::test]
    async fn test_healthz() {
        let router = router(test_state(|_| {}));
        let (status, _, body) = send(&router, public_request(None, "/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"].as_str().unwrap(), "healthy");
    }

    #[tokio::test]
    async fn test_missing_host_rejected() {
        let router = router(test_state(|_| {}));
        let (status, _, body) = send(&router, public_request(None, "/")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(&body[..], b"Host header is required");
    }

    #[tokio::test]
    async fn test_unknown_tunnel_is_404() {
        let router = router(test_state(|_| {}));
        let (status, _, body) =
            send(&router, public_request(Some("missing.example.com"), "/")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(&body[..], b"Tunnel Not Found");
    }

    #[tokio::test]
    async fn test_grace_period_503_with_retry_after() {
        let state = test_state(|_| {});
        let router = router(state.clone());

        state
            .manager
            .new_client(
                Some("myapp".to_string()),
                Identifier::Token("t".to_string()),
                LOCALHOST,
            )
            .await
            .unwrap();

        let (status, headers, body) =
            send(&router, public_request(Some("myapp.example.com"), "/")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(&body[..], b"Service Temporarily Unavailable");
        let retry: u64 = headers
            .get(header::RETRY_AFTER)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=30).contains(&retry));
        state.manager.remove_client("myapp");
    }

    #[tokio::test]
    async fn test_online_without_sockets_503() {
        let state = test_state(|_| {});
        let router = router(state.clone());

        let lease = state
            .manager
            .new_client(
                Some("myapp".to_string()),
                Identifier::Token("t".to_string()),
                LOCALHOST,
            )
            .await
            .unwrap();
        let client = state.manager.get_client("myapp").unwrap();

        let _socket = TcpStream::connect((LOCALHOST, lease.port)).await.unwrap();
        wait_client_online(&client).await;

        // loan out the only socket so the pool is empty
        let _loan = client.agent().create_connection().await.unwrap();

        let (status, headers, body) =
            send(&router, public_request(Some("myapp.example.com"), "/")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(&body[..], b"Service Unavailable");
        assert_eq!(headers.get(header::RETRY_AFTER).unwrap(), "5");
        state.manager.remove_client("myapp");
    }

    #[tokio::test]
    async fn test_bare_domain_delegates_to_admin() {
        let state = test_state(|_| {});
        let router = router(state.clone());

        let (status, _, body) =
            send(&router, public_request(Some("example.com"), "/api/status")).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["tunnels"].as_u64().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_proxies_through_tunnel_end_to_end() {
        let state = test_state(|_| {});
        let router = router(state.clone());

        let lease = state
            .manager
            .new_client(
                Some("myapp".to_string()),
                Identifier::Token("t".to_string()),
                LOCALHOST,
            )
            .await
            .unwrap();
        let client = state.manager.get_client("myapp").unwrap();

        tokio::spawn(async move {
            let mut socket = TcpStream::connect((LOCALHOST, lease.port)).await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
        });
        wait_client_online(&client).await;

        let (status, _, body) = send(
            &router,
            public_request(Some("myapp.example.com"), "/anything"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"ok");
        state.manager.remove_client("myapp");
    }

    /// Serves the router on a real loopback socket; upgrade tests need the
    /// full hyper connection machinery rather than `oneshot`.
    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    async fn read_head(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before header end");
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    async fn send_upgrade(addr: SocketAddr, host: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /ws HTTP/1.1\r\nHost: {host}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        stream
    }

    fn spawn_echo_tunnel(port: u16, delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut socket = TcpStream::connect((LOCALHOST, port)).await.unwrap();
            let _head = read_head(&mut socket).await;
            socket
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\n\
                      Upgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
                )
                .await
                .unwrap();
            let mut buf = [0u8; 256];
            loop {
                let n = match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if socket.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_upgrade_bridges_bytes_both_ways() {
        let state = test_state(|_| {});
        let addr = serve(router(state.clone())).await;

        let lease = state
            .manager
            .new_client(
                Some("myapp".to_string()),
                Identifier::Token("t".to_string()),
                LOCALHOST,
            )
            .await
            .unwrap();
        let client = state.manager.get_client("myapp").unwrap();
        spawn_echo_tunnel(lease.port, Duration::ZERO);
        wait_client_online(&client).await;

        let mut public_side = send_upgrade(addr, "myapp.example.com").await;
        let head = read_head(&mut public_side).await;
        assert!(head.starts_with("HTTP/1.1 101"), "got {head:?}");

        public_side.write_all(b"hello-through-tunnel").await.unwrap();
        let mut echoed = [0u8; 20];
        timeout(Duration::from_secs(2), public_side.read_exact(&mut echoed))
            .await
            .expect("no echo in time")
            .unwrap();
        assert_eq!(&echoed, b"hello-through-tunnel");
        state.manager.remove_client("myapp");
    }

    #[tokio::test]
    async fn test_upgrade_waits_for_tunnel_to_come_online() {
        let state = test_state(|_| {});
        let addr = serve(router(state.clone())).await;

        let lease = state
            .manager
            .new_client(
                Some("myapp".to_string()),
                Identifier::Token("t".to_string()),
                LOCALHOST,
            )
            .await
            .unwrap();
        // tunnel client shows up well after the upgrade request
        spawn_echo_tunnel(lease.port, Duration::from_millis(300));

        let mut public_side = send_upgrade(addr, "myapp.example.com").await;
        let head = read_head(&mut public_side).await;
        assert!(head.starts_with("HTTP/1.1 101"), "got {head:?}");
        state.manager.remove_client("myapp");
    }

    #[tokio::test]
    async fn test_upgrade_times_out_during_grace() {
        let state = test_state(|c| {
            c.websocket_timeout = Duration::from_millis(200);
            c.socket_check_interval = Duration::from_millis(50);
        });
        let addr = serve(router(state.clone())).await;

        state
            .manager
            .new_client(
                Some("myapp".to_string()),
                Identifier::Token("t".to_string()),
                LOCALHOST,
            )
            .await
            .unwrap();

        let mut public_side = send_upgrade(addr, "myapp.example.com").await;
        let head = read_head(&mut public_side).await;
        assert!(head.starts_with("HTTP/1.1 503"), "got {head:?}");
        assert!(head.to_lowercase().contains("retry-after"));
        state.manager.remove_client("myapp");
    }

    #[test]
    fn test_subdomain_from_host() {
        let domain = Some("example.com");
        assert_eq!(
            subdomain_from_host("myapp.example.com", domain),
            Some("myapp".to_string())
        );
        assert_eq!(
            subdomain_from_host("myapp.example.com:8080", domain),
            Some("myapp".to_string())
        );
        assert_eq!(subdomain_from_host("example.com", domain), None);
        assert_eq!(subdomain_from_host("other.org", domain), None);

        assert_eq!(
            subdomain_from_host("myapp.example.com", None),
            Some("myapp".to_string())
        );
        assert_eq!(subdomain_from_host("example.com", None), None);
    }
}
