//! Tunnel client session: online/offline lifecycle around one agent, plus
//! HTTP and WebSocket forwarding over its pooled sockets.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode, Version};
use hyper::client::conn::http1;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::{AgentEvent, AgentStats, TunnelAgent};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::manager::Identifier;

struct ClientInner {
    id: String,
    agent: TunnelAgent,
    identifier: Identifier,
    source_ip: IpAddr,
    created_at: Instant,
    config: Arc<ServerConfig>,
    online: watch::Sender<bool>,
    grace_deadline: Mutex<Option<Instant>>,
    closed: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn arm_grace(&self) -> Duration {
        let grace = self.config.grace_period();
        *self.grace_deadline.lock().unwrap() = Some(Instant::now() + grace);
        grace
    }

    fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.agent.destroy();
        info!(
            subdomain = %self.id,
            source_ip = %self.source_ip,
            uptime = ?self.created_at.elapsed(),
            "client closed"
        );
    }
}

/// One registered tunnel. Cheap to clone; the manager and front-ends share
/// the same session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(
        id: String,
        agent: TunnelAgent,
        events: mpsc::UnboundedReceiver<AgentEvent>,
        identifier: Identifier,
        source_ip: IpAddr,
        config: Arc<ServerConfig>,
    ) -> Self {
        let (online, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            id,
            agent,
            identifier,
            source_ip,
            created_at: Instant::now(),
            config,
            online,
            grace_deadline: Mutex::new(None),
            closed,
            driver: Mutex::new(None),
        });
        let driver = tokio::spawn(drive(Arc::clone(&inner), events));
        *inner.driver.lock().unwrap() = Some(driver);
        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn identifier(&self) -> &Identifier {
        &self.inner.identifier
    }

    pub fn agent(&self) -> &TunnelAgent {
        &self.inner.agent
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    pub fn online_watch(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    pub fn has_available_sockets(&self) -> bool {
        self.inner.agent.has_available_sockets()
    }

    pub fn stats(&self) -> AgentStats {
        self.inner.agent.stats()
    }

    /// Time left until the subdomain reservation lapses, when offline with
    /// the grace timer armed.
    pub fn grace_period_remaining(&self) -> Option<Duration> {
        if self.is_closed() {
            return None;
        }
        self.inner
            .grace_deadline
            .lock()
            .unwrap()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn same_instance(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Idempotent teardown: destroys the agent and fires the close signal.
    pub fn close(&self) {
        self.inner.close();
        if let Some(driver) = self.inner.driver.lock().unwrap().take() {
            driver.abort();
        }
    }

    /// Forwards one HTTP request over a pooled tunnel socket, bounded by the
    /// per-request timeout up to response headers.
    pub async fn handle_request(&self, mut req: Request<Body>) -> Result<Response<Body>> {
        *req.version_mut() = Version::HTTP_11;
        match tokio::time::timeout(self.inner.config.request_timeout, self.proxy(req)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(subdomain = %self.inner.id, "request timed out waiting on tunnel");
                Err(Error::Timeout)
            }
        }
    }

    async fn proxy(&self, req: Request<Body>) -> Result<Response<Body>> {
        let stream = self.inner.agent.create_connection().await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(upstream_err)?;
        let id = self.inner.id.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(subdomain = %id, error = %e, "tunnel connection ended");
            }
        });
        let response = sender.send_request(req).await.map_err(upstream_err)?;
        Ok(response.map(Body::new))
    }

    /// Forwards a connection upgrade. On an upstream `101` the two upgraded
    /// byte streams are bridged until either side closes.
    pub async fn handle_upgrade(&self, mut req: Request<Body>) -> Result<Response<Body>> {
        *req.version_mut() = Version::HTTP_11;
        let downstream = req.extensions_mut().remove::<OnUpgrade>();
        let ws_timeout = self.inner.config.websocket_timeout;

        let stream = tokio::time::timeout(ws_timeout, self.inner.agent.create_connection())
            .await
            .map_err(|_| Error::Timeout)??;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(upstream_err)?;
        let id = self.inner.id.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(subdomain = %id, error = %e, "tunnel upgrade connection ended");
            }
        });

        let mut response = tokio::time::timeout(ws_timeout, sender.send_request(req))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(upstream_err)?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let Some(downstream) = downstream else {
                return Err(Error::Upstream("request is not upgradeable".to_string()));
            };
            let upstream = hyper::upgrade::on(&mut response);
            let id = self.inner.id.clone();
            tokio::spawn(async move {
                let tunnel_io = match upstream.await {
                    Ok(io) => io,
                    Err(e) => {
                        debug!(subdomain = %id, error = %e, "tunnel-side upgrade failed");
                        return;
                    }
                };
                // If the public socket died while we were waiting, dropping
                // tunnel_io here closes the agent socket with it.
                let public_io = match downstream.await {
                    Ok(io) => io,
                    Err(e) => {
                        debug!(subdomain = %id, error = %e, "public-side upgrade failed");
                        return;
                    }
                };
                let mut tunnel_io = TokioIo::new(tunnel_io);
                let mut public_io = TokioIo::new(public_io);
                match tokio::io::copy_bidirectional(&mut public_io, &mut tunnel_io).await {
                    Ok((to_tunnel, to_public)) => {
                        debug!(subdomain = %id, to_tunnel, to_public, "upgrade bridge closed");
                    }
                    Err(e) => debug!(subdomain = %id, error = %e, "upgrade bridge failed"),
                }
            });
        }

        Ok(response.map(Body::new))
    }
}

fn upstream_err(e: hyper::Error) -> Error {
    Error::Upstream(e.to_string())
}

/// Consumes the agent's event stream and runs the session state machine:
/// pending-first-connect → online ↔ offline-with-grace → closed.
async fn drive(inner: Arc<ClientInner>, mut events: mpsc::UnboundedReceiver<AgentEvent>) {
    // A tunnel socket that attached before this task first polls is already
    // buffered in the channel, and the biased select sees it before the
    // grace timer can fire.
    inner.arm_grace();
    loop {
        let deadline = *inner.grace_deadline.lock().unwrap();
        let event = match deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    event = events.recv() => event,
                    _ = tokio::time::sleep_until(deadline) => {
                        info!(subdomain = %inner.id, "grace period elapsed");
                        break;
                    }
                }
            }
            None => events.recv().await,
        };
        match event {
            Some(AgentEvent::Online) => {
                *inner.grace_deadline.lock().unwrap() = None;
                inner.online.send_replace(true);
                info!(subdomain = %inner.id, "tunnel online");
            }
            Some(AgentEvent::Offline) => {
                inner.online.send_replace(false);
                let grace = inner.arm_grace();
                info!(
                    subdomain = %inner.id,
                    grace_ms = grace.as_millis() as u64,
                    "tunnel offline, grace period armed"
                );
            }
            None => break,
        }
    }
    inner.online.send_replace(false);
    inner.close();
}
