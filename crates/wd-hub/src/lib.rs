//! Agent-connection hub.
//!
//! Accepts authenticated full-duplex agent sessions on `/ws/agent`, runs a
//! read loop and a write loop per client, enforces the per-window heartbeat
//! rate limit, and provides non-blocking push-to-agent for the monitor
//! service. Backpressure sheds: a full outbound queue drops the frame and
//! counts it, never blocking the producer.

#![forbid(unsafe_code)]

pub mod metrics;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use wd_auth::{AgentAuth, AuthError};
use wd_monitor::{AgentPush, MonitorService};
use wd_proto::{AuthPayload, Envelope, HeartbeatPayload, MAX_FRAME_BYTES, frame};

pub use metrics::HubMetrics;

/// Read deadline; refreshed by every incoming pong.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping cadence: `(PONG_WAIT * 9) / 10`.
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Deadline applied to every transport write.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// How long a freshly accepted connection may take to present credentials.
pub const HANDSHAKE_WAIT: Duration = Duration::from_secs(10);

/// Capacity of the per-agent outbound queue.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Heartbeats accepted per ping window; excess frames are dropped at
/// ingress to cap insert storms from a misbehaving agent.
pub const MAX_HEARTBEATS_PER_WINDOW: u32 = 200;

/// Upgrade path agents must connect to.
pub const AGENT_WS_PATH: &str = "/ws/agent";

// ─── Client ──────────────────────────────────────────────────────────────────

/// One connected agent session: the outbound queue, close signal, and the
/// heartbeat counter reset each ping interval.
pub struct Client {
    pub agent_id: Uuid,
    session: Uuid,
    peer: SocketAddr,
    sender: mpsc::Sender<Message>,
    close: Notify,
    heartbeat_window: AtomicU32,
    metrics: Arc<HubMetrics>,
}

impl Client {
    fn new(
        agent_id: Uuid,
        peer: SocketAddr,
        sender: mpsc::Sender<Message>,
        metrics: Arc<HubMetrics>,
    ) -> Self {
        Self {
            agent_id,
            session: Uuid::new_v4(),
            peer,
            sender,
            close: Notify::new(),
            heartbeat_window: AtomicU32::new(0),
            metrics,
        }
    }

    /// Non-blocking enqueue of a protocol frame. Returns `true` iff queued;
    /// a full queue drops the frame and counts it.
    pub fn send(&self, frame: &Envelope) -> bool {
        let text = match serde_json::to_string(frame) {
            Ok(t) => t,
            Err(e) => {
                warn!(agent = %self.agent_id, error = %e, "failed to encode outbound frame");
                return false;
            }
        };
        self.send_raw(Message::Text(text))
    }

    fn send_raw(&self, msg: Message) -> bool {
        match self.sender.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.send_queue_drops.inc();
                warn!(agent = %self.agent_id, "outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the write loop to send a normal close frame and stop.
    pub fn begin_close(&self) {
        self.close.notify_one();
    }

    /// Rate-limit check: one call per inbound heartbeat frame.
    fn allow_heartbeat(&self) -> bool {
        self.heartbeat_window.fetch_add(1, Ordering::Relaxed) < MAX_HEARTBEATS_PER_WINDOW
    }

    fn reset_heartbeat_window(&self) {
        self.heartbeat_window.store(0, Ordering::Relaxed);
    }
}

// ─── Hub ─────────────────────────────────────────────────────────────────────

pub struct Hub {
    clients: RwLock<HashMap<Uuid, Arc<Client>>>,
    auth: Arc<AgentAuth>,
    monitors: Arc<MonitorService>,
    pub metrics: Arc<HubMetrics>,
    shutdown: watch::Sender<bool>,
    draining: AtomicBool,
}

impl Hub {
    pub fn new(auth: Arc<AgentAuth>, monitors: Arc<MonitorService>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            auth,
            monitors,
            metrics: Arc::new(HubMetrics::default()),
            shutdown,
            draining: AtomicBool::new(false),
        })
    }

    pub fn connected_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Accept loop. Runs until [`Hub::begin_shutdown`] is called, then
    /// closes all live sessions with a normal close frame.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let local = listener.local_addr().ok();
        info!(addr = ?local, path = AGENT_WS_PATH, "hub listening for agents");
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let hub = Arc::clone(&self);
                        tokio::spawn(async move { hub.handle_connection(stream, peer).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
            }
        }

        self.close_all();
        info!("hub stopped accepting connections");
    }

    /// Signal the accept loop to stop and all sessions to close.
    pub fn begin_shutdown(&self) {
        self.draining.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        self.close_all();
    }

    fn close_all(&self) {
        let clients: Vec<Arc<Client>> = self.clients.write().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.begin_close();
        }
        self.metrics.connected_agents.set(0);
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let config = WebSocketConfig {
            max_message_size: Some(MAX_FRAME_BYTES),
            max_frame_size: Some(MAX_FRAME_BYTES),
            ..Default::default()
        };
        let path_check = |req: &Request, resp: Response| {
            if req.uri().path() == AGENT_WS_PATH {
                Ok(resp)
            } else {
                let mut reject = ErrorResponse::new(Some("unknown path".to_string()));
                *reject.status_mut() = StatusCode::NOT_FOUND;
                Err(reject)
            }
        };

        let ws = match tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            path_check,
            Some(config),
        )
        .await
        {
            Ok(ws) => ws,
            Err(e) => {
                debug!(%peer, error = %e, "websocket upgrade failed");
                return;
            }
        };
        let (mut write, mut read) = ws.split();

        // Handshake: the first frame must carry credentials.
        let agent = match self.authenticate(&mut read).await {
            Ok(agent) => agent,
            Err(reason) => {
                debug!(%peer, reason, "agent handshake rejected");
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: reason.into(),
                }));
                let _ = timeout(WRITE_WAIT, write.send(close)).await;
                return;
            }
        };

        let (tx, rx) = mpsc::channel::<Message>(SEND_QUEUE_CAPACITY);
        let client = Arc::new(Client::new(agent.id, peer, tx, Arc::clone(&self.metrics)));
        self.register(Arc::clone(&client)).await;
        info!(agent = %agent.id, %peer, "agent session established");

        let writer = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { write_loop(client, rx, write).await })
        };

        self.read_loop(Arc::clone(&client), &mut read).await;

        self.unregister(&client).await;
        client.begin_close();
        let _ = writer.await;
        debug!(agent = %client.agent_id, %peer, "agent session ended");
    }

    async fn authenticate<S>(&self, read: &mut S) -> Result<wd_proto::Agent, &'static str>
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let first = match timeout(HANDSHAKE_WAIT, read.next()).await {
            Err(_) => return Err("handshake timeout"),
            Ok(None) => return Err("connection closed during handshake"),
            Ok(Some(Err(_))) => return Err("transport error during handshake"),
            Ok(Some(Ok(msg))) => msg,
        };
        let Message::Text(text) = first else {
            return Err("expected a text auth frame");
        };
        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(env) => env,
            Err(_) => return Err("malformed auth frame"),
        };
        if envelope.kind != frame::AUTH {
            return Err("first frame must be auth");
        }
        let payload: AuthPayload = match envelope.decode() {
            Ok(p) => p,
            Err(_) => return Err("malformed auth payload"),
        };

        match self.auth.validate(&payload.api_key).await {
            Ok(agent) => Ok(agent),
            Err(AuthError::Expired) => Err("api key expired"),
            Err(AuthError::Unauthenticated) => Err("unauthorized"),
            Err(e) => {
                warn!(error = %e, "auth backend failure during handshake");
                Err("authentication unavailable")
            }
        }
    }

    async fn register(&self, client: Arc<Client>) {
        let agent_id = client.agent_id;
        let replaced = self.clients.write().insert(agent_id, Arc::clone(&client));
        if let Some(old) = replaced {
            // One live session per agent; the newer one wins.
            info!(agent = %agent_id, "replacing existing agent session");
            self.metrics.sessions_replaced.inc();
            old.begin_close();
        }
        self.metrics.sessions_opened.inc();
        self.metrics
            .connected_agents
            .set(self.clients.read().len() as i64);

        match self.monitors.agent_connected(agent_id).await {
            Ok(monitors) => {
                for monitor in &monitors {
                    match Envelope::monitor_assign(monitor) {
                        Ok(frame) => {
                            client.send(&frame);
                        }
                        Err(e) => {
                            warn!(monitor = %monitor.id, error = %e, "failed to encode assignment")
                        }
                    }
                }
                debug!(agent = %agent_id, count = monitors.len(), "pushed monitor assignments");
            }
            Err(e) => warn!(agent = %agent_id, error = %e, "agent connect hook failed"),
        }
    }

    async fn unregister(&self, client: &Arc<Client>) {
        let agent_id = client.agent_id;
        let removed = {
            let mut clients = self.clients.write();
            match clients.get(&agent_id) {
                // Only the registered session unregisters; a replaced
                // session must not tear down its successor's state.
                Some(current) if current.session == client.session => {
                    clients.remove(&agent_id);
                    true
                }
                _ => false,
            }
        };
        self.metrics
            .connected_agents
            .set(self.clients.read().len() as i64);

        if removed {
            debug!(agent = %agent_id, peer = %client.peer, "session unregistered");
            if !self.draining.load(Ordering::SeqCst)
                && let Err(e) = self.monitors.agent_disconnected(agent_id).await
            {
                warn!(agent = %agent_id, error = %e, "agent disconnect hook failed");
            }
        }
    }

    async fn read_loop<S>(&self, client: Arc<Client>, read: &mut S)
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let agent_id = client.agent_id;
        let mut deadline = Instant::now() + PONG_WAIT;

        loop {
            let msg = match timeout_at(deadline, read.next()).await {
                Err(_) => {
                    info!(agent = %agent_id, "pong deadline missed, closing session");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(agent = %agent_id, error = %e, "transport read error");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Pong(_) => {
                    deadline = Instant::now() + PONG_WAIT;
                }
                Message::Ping(data) => {
                    client.send_raw(Message::Pong(data));
                }
                Message::Close(_) => {
                    debug!(agent = %agent_id, "peer closed session");
                    break;
                }
                Message::Text(text) => {
                    if text.len() > MAX_FRAME_BYTES {
                        warn!(agent = %agent_id, size = text.len(), "oversized frame, closing");
                        break;
                    }
                    self.handle_frame(&client, &text, &mut deadline).await;
                }
                Message::Binary(_) => {
                    debug!(agent = %agent_id, "dropping unexpected binary frame");
                }
                Message::Frame(_) => {}
            }
        }
    }

    async fn handle_frame(&self, client: &Arc<Client>, text: &str, deadline: &mut Instant) {
        let agent_id = client.agent_id;
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                // Decode errors skip the frame, they are not fatal.
                self.metrics.frames_undecodable.inc();
                debug!(agent = %agent_id, error = %e, "skipping undecodable frame");
                return;
            }
        };

        match envelope.kind.as_str() {
            frame::HEARTBEAT => {
                if !client.allow_heartbeat() {
                    self.metrics.heartbeats_rate_limited.inc();
                    return;
                }
                let payload: HeartbeatPayload = match envelope.decode() {
                    Ok(p) => p,
                    Err(e) => {
                        self.metrics.frames_undecodable.inc();
                        debug!(agent = %agent_id, error = %e, "skipping malformed heartbeat");
                        return;
                    }
                };
                self.metrics.heartbeats_total.inc();
                if let Err(e) = self.monitors.process_heartbeat(agent_id, payload).await {
                    warn!(agent = %agent_id, error = %e, "heartbeat rejected");
                }
            }
            frame::PONG => {
                *deadline = Instant::now() + PONG_WAIT;
            }
            other => {
                self.metrics.frames_unknown.inc();
                debug!(agent = %agent_id, kind = other, "dropping unknown frame type");
            }
        }
    }
}

async fn write_loop<W>(client: Arc<Client>, mut rx: mpsc::Receiver<Message>, mut write: W)
where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    let agent_id = client.agent_id;
    let mut ping = tokio::time::interval(PING_PERIOD);

    loop {
        tokio::select! {
            _ = client.close.notified() => {
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "hub closing session".into(),
                }));
                let _ = timeout(WRITE_WAIT, write.send(close)).await;
                break;
            }
            maybe = rx.recv() => match maybe {
                None => break,
                Some(msg) => match timeout(WRITE_WAIT, write.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(agent = %agent_id, error = %e, "transport write error");
                        break;
                    }
                    Err(_) => {
                        warn!(agent = %agent_id, "write deadline missed, closing session");
                        break;
                    }
                },
            },
            _ = ping.tick() => {
                client.reset_heartbeat_window();
                match timeout(WRITE_WAIT, write.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!(agent = %agent_id, "ping write failed, closing session");
                        break;
                    }
                }
            }
        }
    }
}

// ─── Push port ───────────────────────────────────────────────────────────────

impl AgentPush for Hub {
    fn push(&self, agent_id: Uuid, frame: Envelope) -> bool {
        match self.clients.read().get(&agent_id) {
            Some(client) => client.send(&frame),
            None => false,
        }
    }

    fn is_connected(&self, agent_id: Uuid) -> bool {
        self.clients.read().contains_key(&agent_id)
    }
}
