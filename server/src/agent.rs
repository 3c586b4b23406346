//! Per-tunnel TCP listener and socket pool.
//!
//! One agent serves one tunnel: it accepts raw TCP connections from the
//! remote tunnel client, parks them in an idle pool, and hands them out one
//! at a time to drive a single HTTP transaction each. Requests arriving while
//! the pool is empty queue as FIFO waiters.

use std::collections::VecDeque;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const REJECT_LOG_EVERY: u64 = 10;

/// Signals emitted at the 0↔1 connected-socket boundary. The owning session
/// consumes these; the agent holds no reference back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AgentStats {
    pub connected: usize,
    pub rejected: u64,
    pub available: usize,
    pub waiting: usize,
}

struct AgentState {
    pool: VecDeque<TcpStream>,
    waiters: VecDeque<oneshot::Sender<Result<TunnelStream>>>,
    connected: usize,
    rejected: u64,
    started: bool,
    closed: bool,
    accept_task: Option<JoinHandle<()>>,
    sweep_task: Option<JoinHandle<()>>,
}

struct AgentInner {
    id: String,
    max_sockets: usize,
    state: Mutex<AgentState>,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentInner {
    /// Must be called with the state lock held, after `connected` dropped.
    fn maybe_offline(&self, state: &AgentState) {
        if !state.closed && state.connected == 0 {
            let _ = self.events.send(AgentEvent::Offline);
        }
    }
}

/// A tunnel socket on loan to one HTTP transaction. Dropping it closes the
/// socket and adjusts the agent's counters.
pub struct TunnelStream {
    stream: Option<TcpStream>,
    inner: Arc<AgentInner>,
}

impl TunnelStream {
    fn new(stream: TcpStream, inner: Arc<AgentInner>) -> Self {
        Self {
            stream: Some(stream),
            inner,
        }
    }

    /// Takes the raw socket back without touching the connected counter.
    fn into_raw(mut self) -> TcpStream {
        self.stream.take().expect("stream present until drop")
    }

    fn get(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("stream present until drop")
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        if self.stream.is_none() {
            return;
        }
        let mut state = self.inner.state.lock().unwrap();
        state.connected = state.connected.saturating_sub(1);
        self.inner.maybe_offline(&state);
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(self.get()).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(self.get()).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get()).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get()).poll_shutdown(cx)
    }
}

#[derive(Clone)]
pub struct TunnelAgent {
    inner: Arc<AgentInner>,
}

impl TunnelAgent {
    pub fn new(id: &str, max_sockets: usize) -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let agent = Self {
            inner: Arc::new(AgentInner {
                id: id.to_string(),
                max_sockets,
                state: Mutex::new(AgentState {
                    pool: VecDeque::new(),
                    waiters: VecDeque::new(),
                    connected: 0,
                    rejected: 0,
                    started: false,
                    closed: false,
                    accept_task: None,
                    sweep_task: None,
                }),
                events,
            }),
        };
        (agent, events_rx)
    }

    /// Binds the tunnel listener (`port == 0` asks the OS for an ephemeral
    /// port) and starts the accept loop. A second call fails.
    pub async fn listen(&self, address: IpAddr, port: u16) -> Result<u16> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.started {
                return Err(Error::AlreadyStarted);
            }
            state.started = true;
        }

        let listener = TcpListener::bind((address, port)).await?;
        let bound = listener.local_addr()?.port();

        let accept = tokio::spawn(accept_loop(Arc::clone(&self.inner), listener));
        let sweep = tokio::spawn(sweep_loop(Arc::clone(&self.inner)));
        {
            let mut state = self.inner.state.lock().unwrap();
            state.accept_task = Some(accept);
            state.sweep_task = Some(sweep);
        }

        info!(subdomain = %self.inner.id, port = bound, "tunnel agent listening");
        Ok(bound)
    }

    /// Borrows an idle tunnel socket, queueing FIFO behind earlier requests
    /// when the pool is empty. Fails immediately once the agent is closed.
    pub async fn create_connection(&self) -> Result<TunnelStream> {
        let rx = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return Err(Error::AgentClosed);
            }
            loop {
                match state.pool.pop_front() {
                    Some(stream) if socket_is_live(&stream) => {
                        return Ok(TunnelStream::new(stream, Arc::clone(&self.inner)));
                    }
                    Some(_) => {
                        // died while idle; reap it here rather than waiting
                        // for the sweeper
                        state.connected = state.connected.saturating_sub(1);
                        self.inner.maybe_offline(&state);
                    }
                    None => break,
                }
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        rx.await.map_err(|_| Error::AgentClosed)?
    }

    pub fn stats(&self) -> AgentStats {
        let state = self.inner.state.lock().unwrap();
        AgentStats {
            connected: state.connected,
            rejected: state.rejected,
            available: state.pool.len(),
            waiting: state.waiters.len(),
        }
    }

    pub fn has_available_sockets(&self) -> bool {
        !self.inner.state.lock().unwrap().pool.is_empty()
    }

    /// Stops accepting tunnel sockets, fails queued waiters, and drops the
    /// idle pool. Sockets already handed out live until their transaction
    /// ends.
    pub fn destroy(&self) {
        let (waiters, pool, accept, sweep) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.connected = state.connected.saturating_sub(state.pool.len());
            (
                std::mem::take(&mut state.waiters),
                std::mem::take(&mut state.pool),
                state.accept_task.take(),
                state.sweep_task.take(),
            )
        };
        for waiter in waiters {
            let _ = waiter.send(Err(Error::AgentClosed));
        }
        drop(pool);
        if let Some(task) = accept {
            task.abort();
        }
        if let Some(task) = sweep {
            task.abort();
        }
        info!(subdomain = %self.inner.id, "tunnel agent destroyed");
    }
}

/// A pooled socket should never be readable: the tunnel client speaks only
/// when spoken to. EOF or unsolicited bytes both count as dead.
fn socket_is_live(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    matches!(stream.try_read(&mut buf), Err(ref e) if e.kind() == io::ErrorKind::WouldBlock)
}

async fn accept_loop(inner: Arc<AgentInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(subdomain = %inner.id, peer = %peer, "tunnel socket connected");
                handle_incoming(&inner, stream);
            }
            Err(e) => {
                warn!(subdomain = %inner.id, error = %e, "tunnel accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

fn handle_incoming(inner: &Arc<AgentInner>, stream: TcpStream) {
    let mut state = inner.state.lock().unwrap();
    if state.closed {
        return;
    }

    if state.connected >= inner.max_sockets {
        state.rejected += 1;
        let nth = state.rejected;
        let stats = AgentStats {
            connected: state.connected,
            rejected: nth,
            available: state.pool.len(),
            waiting: state.waiters.len(),
        };
        drop(state);
        if nth == 1 || nth % REJECT_LOG_EVERY == 0 {
            warn!(
                subdomain = %inner.id,
                rejected = nth,
                max_sockets = inner.max_sockets,
                "tunnel connection limit reached, rejecting socket"
            );
        }
        tokio::spawn(write_reject(stream, inner.max_sockets, stats));
        return;
    }

    state.connected += 1;
    let went_online = state.connected == 1;

    // Hand off to the oldest waiter still listening; otherwise pool the
    // socket. Keeps waiters and pool mutually exclusive.
    let mut stream = Some(stream);
    while let Some(raw) = stream.take() {
        let Some(waiter) = state.waiters.pop_front() else {
            state.pool.push_back(raw);
            break;
        };
        let loaned = TunnelStream::new(raw, Arc::clone(inner));
        if let Err(Ok(loaned)) = waiter.send(Ok(loaned)) {
            // receiver gave up; reclaim the socket and try the next waiter
            stream = Some(loaned.into_raw());
        }
    }

    if went_online {
        let _ = inner.events.send(AgentEvent::Online);
    }
}

async fn write_reject(mut stream: TcpStream, max_sockets: usize, stats: AgentStats) {
    let body = serde_json::json!({
        "error": "Too many connections",
        "max_sockets": max_sockets,
        "connected_sockets": stats.connected,
        "available_sockets": stats.available,
        "waiting_requests": stats.waiting,
    })
    .to_string();
    let response = format!(
        "HTTP/1.1 429 Too Many Connections\r\n\
         Content-Type: application/json\r\n\
         Connection: close\r\n\
         X-LT-Max-Sockets: {}\r\n\
         X-LT-Current-Sockets: {}\r\n\
         X-LT-Available-Sockets: {}\r\n\
         X-LT-Waiting-Requests: {}\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        max_sockets,
        stats.connected,
        stats.available,
        stats.waiting,
        body.len(),
        body,
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn sweep_loop(inner: Arc<AgentInner>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        sweep_idle(&inner);
    }
}

/// Reaps idle sockets the remote side has closed so the offline signal fires
/// without anyone asking for a connection.
fn sweep_idle(inner: &Arc<AgentInner>) {
    let mut state = inner.state.lock().unwrap();
    if state.closed {
        return;
    }
    let mut dropped = 0usize;
    let mut i = 0;
    while i < state.pool.len() {
        if socket_is_live(&state.pool[i]) {
            i += 1;
        } else {
            state.pool.remove(i);
            dropped += 1;
        }
    }
    if dropped > 0 {
        state.connected = state.connected.saturating_sub(dropped);
        debug!(subdomain = %inner.id, dropped, connected = state.connected, "reaped dead tunnel sockets");
        inner.maybe_offline(&state);
    }
}
