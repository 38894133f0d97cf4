//! Agent: the endpoint side of a PAMR tunnel.
//!
//! An [`Agent`] registers with the router, then multiplexes any number of
//! concurrent calls over its single tunnel. Each blocking call parks on a
//! oneshot channel stored in the waiter table under `(target, msg_id)`; the
//! tunnel read loop completes exactly that entry when the correlated reply
//! (or an error about it) comes back.
//!
//! Two tasks serve the tunnel: a writer fed by an unbounded queue, which
//! keeps the send order of each caller, and a reader which parses frames and
//! hands inbound requests to the [`MessageHandler`]. Neither runs
//! application code.
//!
//! When the tunnel breaks, every pending call fails at once and the reader
//! re-registers in the background with exponential backoff, keeping the
//! same agent id. Calls made while disconnected fail immediately.

use crate::backoff::ReconnectBackoff;
use crate::message::{
    read_message, write_message, DataMessage, ErrorCode, ErrorMessage, Message,
    RegistrationRequest, WireError, MAX_MESSAGE_SIZE,
};
use crate::registry;
use crate::socket::{self, BoxedStream, SocketFactory};
use crate::valve::Pipeline;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pamr_types::{AgentConfig, AgentId, MagicCookie, PamrError, PamrResult, RouterId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use url::Url;

/// A request received from another agent.
///
/// Not cloneable: [`Agent::send_reply`] consumes it, so a request is
/// answered at most once.
#[derive(Debug)]
pub struct InboundRequest {
    msg_id: u64,
    src: AgentId,
    one_way: bool,
    payload: Bytes,
}

impl InboundRequest {
    pub fn msg_id(&self) -> u64 {
        self.msg_id
    }

    pub fn source(&self) -> AgentId {
        self.src
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// Receives inbound requests from the tunnel read loop.
///
/// Called on the I/O path: implementations must hand the request off
/// without blocking.
pub trait MessageHandler: Send + Sync + 'static {
    fn push_message(&self, agent: Arc<Agent>, request: InboundRequest);
}

/// Snapshot of the current tunnel.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    /// `host:port` of the router.
    pub router: String,
    pub connected_at: DateTime<Utc>,
    /// Socket factory that opened the connection.
    pub transport: &'static str,
}

struct Tunnel {
    tx: mpsc::UnboundedSender<Message>,
    info: TunnelInfo,
}

/// Read side of an established tunnel, owned by the read loop.
struct Session {
    reader: ReadHalf<BoxedStream>,
    writer_failed: oneshot::Receiver<WireError>,
    read_timeout: Option<Duration>,
}

enum Served {
    Shutdown,
    Failed(String),
}

type Waiter = oneshot::Sender<PamrResult<Bytes>>;

/// Builder for [`Agent`].
pub struct AgentBuilder {
    config: AgentConfig,
    pipeline: Pipeline,
    factory: Option<Arc<dyn SocketFactory>>,
    backoff: ReconnectBackoff,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            pipeline: Pipeline::new(),
            factory: None,
            backoff: ReconnectBackoff::default(),
        }
    }

    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Override the socket factory selected by the configuration.
    pub fn socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Open the tunnel, register, and start the I/O tasks.
    pub async fn connect(self, handler: Arc<dyn MessageHandler>) -> PamrResult<Arc<Agent>> {
        self.config.validate()?;
        let factory = match self.factory {
            Some(factory) => factory,
            None => socket::from_config(&self.config)?,
        };
        let cookie = self.config.magic_cookie.unwrap_or_else(MagicCookie::random);
        let requested = self.config.reserved_agent_id();

        let (reply, session, tunnel) =
            open_tunnel(&self.config, &*factory, &self.pipeline, requested, None, cookie).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let agent = Arc::new(Agent {
            agent_id: reply.agent_id,
            router_id: AtomicU64::new(reply.router_id.0),
            cookie,
            config: self.config,
            factory,
            pipeline: self.pipeline,
            handler,
            backoff: self.backoff,
            waiters: DashMap::new(),
            next_msg_id: AtomicU64::new(1),
            tunnel: RwLock::new(Some(tunnel)),
            last_failure: RwLock::new(String::new()),
            closed: AtomicBool::new(false),
            shutdown: shutdown_tx,
        });
        info!(
            agent = %agent.agent_id,
            router = %agent.router_id(),
            "Agent registered with router"
        );

        tokio::spawn(Agent::run(Arc::downgrade(&agent), session, shutdown_rx));
        Ok(agent)
    }
}

/// Endpoint of the routing protocol.
pub struct Agent {
    agent_id: AgentId,
    /// Reserved agents follow the router across restarts, so this can
    /// change on reconnection.
    router_id: AtomicU64,
    cookie: MagicCookie,
    config: AgentConfig,
    factory: Arc<dyn SocketFactory>,
    pipeline: Pipeline,
    handler: Arc<dyn MessageHandler>,
    backoff: ReconnectBackoff,
    waiters: DashMap<(AgentId, u64), Waiter>,
    next_msg_id: AtomicU64,
    tunnel: RwLock<Option<Tunnel>>,
    /// Cause of the last tunnel failure, reported by calls made while
    /// disconnected.
    last_failure: RwLock<String>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Agent {
    /// Connect with the socket factory named in `config` and no valves.
    pub async fn connect(
        config: AgentConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> PamrResult<Arc<Agent>> {
        AgentBuilder::new(config).connect(handler).await
    }

    /// Id assigned by the router. Stable across reconnections.
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn router_id(&self) -> RouterId {
        RouterId(self.router_id.load(Ordering::SeqCst))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn is_connected(&self) -> bool {
        self.tunnel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn tunnel_info(&self) -> Option<TunnelInfo> {
        self.tunnel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|t| t.info.clone())
    }

    /// Calls currently waiting for a reply, as `(target, msg_id)`.
    pub fn blocked_callers(&self) -> Vec<(AgentId, u64)> {
        self.waiters.iter().map(|e| *e.key()).collect()
    }

    /// Send `data` to `target`.
    ///
    /// Unless `one_way` is set, waits for the correlated reply and returns
    /// its payload. One-way sends return an empty payload as soon as the
    /// message is queued.
    pub async fn send_msg(
        &self,
        target: AgentId,
        data: impl Into<Bytes>,
        one_way: bool,
    ) -> PamrResult<Bytes> {
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        let msg = Message::DataRequest(DataMessage {
            msg_id,
            src: self.agent_id,
            dst: target,
            one_way,
            payload: data.into(),
        });

        if one_way {
            if let Err(e) = self.transmit(msg) {
                warn!(agent = %self.agent_id, %target, error = %e, "One-way send failed");
                return Err(e);
            }
            return Ok(Bytes::new());
        }

        let key = (target, msg_id);
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(key, tx);
        if let Err(e) = self.transmit(msg) {
            self.waiters.remove(&key);
            return Err(e);
        }

        let outcome = match self.config.response_timeout() {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.waiters.remove(&key);
                    return Err(PamrError::Timeout {
                        agent: target,
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => rx.await,
        };
        outcome.unwrap_or(Err(PamrError::Shutdown))
    }

    /// Send to the agent owning a `pamr://<agent-id>/...` URI.
    pub async fn send_msg_to(
        &self,
        uri: &Url,
        data: impl Into<Bytes>,
        one_way: bool,
    ) -> PamrResult<Bytes> {
        let target = registry::agent_of(uri)?;
        self.send_msg(target, data, one_way).await
    }

    /// Answer an inbound request.
    pub fn send_reply(&self, request: InboundRequest, data: impl Into<Bytes>) -> PamrResult<()> {
        if request.one_way {
            return Err(PamrError::InvalidOperation(format!(
                "message {} from agent {} is one-way and takes no reply",
                request.msg_id, request.src
            )));
        }
        self.transmit(Message::DataReply(DataMessage {
            msg_id: request.msg_id,
            src: self.agent_id,
            dst: request.src,
            one_way: false,
            payload: data.into(),
        }))
    }

    /// Close the tunnel and fail every pending call.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        self.tunnel
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let failed = self.fail_waiters(|_| true, || PamrError::Shutdown);
        info!(agent = %self.agent_id, failed, "Agent shut down");
    }

    fn transmit(&self, msg: Message) -> PamrResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PamrError::Shutdown);
        }
        let msg = self.pipeline.outgoing(msg);
        let size = msg.encoded_len();
        if size > MAX_MESSAGE_SIZE as usize {
            return Err(PamrError::MessageTooLarge {
                size,
                max: MAX_MESSAGE_SIZE as usize,
            });
        }
        let guard = self.tunnel.read().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tunnel) => tunnel
                .tx
                .send(msg)
                .map_err(|_| PamrError::TunnelFailure("tunnel writer stopped".into())),
            None => Err(PamrError::NotConnected(self.last_failure())),
        }
    }

    fn last_failure(&self) -> String {
        let cause = self
            .last_failure
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if cause.is_empty() {
            "tunnel is down".to_string()
        } else {
            cause
        }
    }

    fn fail_waiters(
        &self,
        matches: impl Fn(&(AgentId, u64)) -> bool,
        error: impl Fn() -> PamrError,
    ) -> usize {
        let keys: Vec<(AgentId, u64)> = self
            .waiters
            .iter()
            .map(|e| *e.key())
            .filter(|k| matches(k))
            .collect();
        let mut failed = 0;
        for key in keys {
            if let Some((_, waiter)) = self.waiters.remove(&key) {
                let _ = waiter.send(Err(error()));
                failed += 1;
            }
        }
        failed
    }

    fn complete(&self, key: (AgentId, u64), outcome: PamrResult<Bytes>) -> bool {
        match self.waiters.remove(&key) {
            Some((_, waiter)) => {
                let _ = waiter.send(outcome);
                true
            }
            None => false,
        }
    }

    fn tunnel_failed(&self, cause: &str) {
        self.tunnel
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        *self.last_failure.write().unwrap_or_else(|e| e.into_inner()) = cause.to_string();
        let failed = self.fail_waiters(|_| true, || PamrError::TunnelFailure(cause.to_string()));
        warn!(agent = %self.agent_id, pending = failed, %cause, "Tunnel to router lost");
    }

    /// Handle one frame. An `Err` means the tunnel must be dropped.
    fn handle_frame(self: &Arc<Self>, msg: Message) -> Result<(), String> {
        match self.pipeline.incoming(msg) {
            Message::DataRequest(m) => {
                if m.dst != self.agent_id {
                    warn!(agent = %self.agent_id, dst = %m.dst, "Dropping request addressed to another agent");
                    return Ok(());
                }
                self.handler.push_message(
                    Arc::clone(self),
                    InboundRequest {
                        msg_id: m.msg_id,
                        src: m.src,
                        one_way: m.one_way,
                        payload: m.payload,
                    },
                );
            }
            Message::DataReply(m) => {
                if !self.complete((m.src, m.msg_id), Ok(m.payload)) {
                    debug!(
                        agent = %self.agent_id,
                        from = %m.src,
                        msg_id = m.msg_id,
                        "Reply for a call that is no longer waiting"
                    );
                }
            }
            Message::Error(e) => self.handle_error(e)?,
            Message::HeartbeatRouter { heartbeat_id } => {
                let reply = Message::HeartbeatClient {
                    heartbeat_id,
                    agent_id: self.agent_id,
                };
                if let Err(e) = self.transmit(reply) {
                    debug!(error = %e, "Could not answer heartbeat");
                }
            }
            other => {
                warn!(
                    agent = %self.agent_id,
                    kind = ?other.message_type(),
                    "Unexpected message from router"
                );
            }
        }
        Ok(())
    }

    fn handle_error(&self, e: ErrorMessage) -> Result<(), String> {
        match e.code {
            ErrorCode::DisconnectionBroadcast => {
                if let Some(dead) = e.faulty {
                    let failed = self.fail_waiters(
                        |(target, _)| *target == dead,
                        || PamrError::RemoteDisconnected(dead),
                    );
                    debug!(agent = %self.agent_id, %dead, failed, "Remote agent disconnected");
                }
            }
            ErrorCode::NotConnectedRecipient | ErrorCode::UnknownRecipient => {
                let Some(target) = e.faulty else {
                    warn!(msg_id = e.msg_id, "Delivery error without recipient");
                    return Ok(());
                };
                if e.about_reply {
                    warn!(
                        agent = %self.agent_id,
                        %target,
                        msg_id = e.msg_id,
                        "Reply could not be delivered"
                    );
                    return Ok(());
                }
                let err = if e.code == ErrorCode::UnknownRecipient {
                    PamrError::UnknownRecipient(target)
                } else {
                    PamrError::RecipientNotConnected(target)
                };
                if !self.complete((target, e.msg_id), Err(err)) {
                    debug!(%target, msg_id = e.msg_id, "Delivery error for a call that is no longer waiting");
                }
            }
            ErrorCode::MalformedMessage => {
                let msg_id = e.msg_id;
                let failed = match e.faulty {
                    Some(target) => {
                        usize::from(self.complete((target, msg_id), Err(PamrError::Corrupted { msg_id })))
                    }
                    None => self.fail_waiters(|(_, id)| *id == msg_id, || PamrError::Corrupted { msg_id }),
                };
                warn!(agent = %self.agent_id, msg_id, failed, "Router received a corrupted message");
            }
            ErrorCode::InvalidAgentId | ErrorCode::InvalidRouterId | ErrorCode::WrongMagicCookie => {
                return Err(format!("router revoked the registration ({:?})", e.code));
            }
        }
        Ok(())
    }

    /// Tunnel read loop. Owns the read half and reconnects on failure.
    async fn run(weak: Weak<Agent>, mut session: Session, mut shutdown: watch::Receiver<bool>) {
        loop {
            let cause = match Self::serve(&weak, &mut session, &mut shutdown).await {
                Served::Shutdown => return,
                Served::Failed(cause) => cause,
            };
            match weak.upgrade() {
                Some(agent) if !agent.closed.load(Ordering::SeqCst) => agent.tunnel_failed(&cause),
                _ => return,
            }
            match Self::reconnect(&weak, &mut shutdown).await {
                Some(next) => session = next,
                None => return,
            }
        }
    }

    async fn serve(
        weak: &Weak<Agent>,
        session: &mut Session,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Served {
        loop {
            if *shutdown.borrow() {
                return Served::Shutdown;
            }
            let frame = tokio::select! {
                _ = shutdown.changed() => return Served::Shutdown,
                failed = &mut session.writer_failed => {
                    return Served::Failed(match failed {
                        Ok(e) => format!("write failed: {e}"),
                        Err(_) => "tunnel writer stopped".to_string(),
                    });
                }
                frame = read_frame(&mut session.reader, session.read_timeout) => frame,
            };
            let Some(agent) = weak.upgrade() else {
                return Served::Shutdown;
            };
            let outcome = match frame {
                Ok(msg) => agent.handle_frame(msg),
                Err(cause) => Err(cause),
            };
            if let Err(cause) = outcome {
                return Served::Failed(cause);
            }
        }
    }

    async fn reconnect(
        weak: &Weak<Agent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Session> {
        let mut attempt: u32 = 0;
        loop {
            let delay = {
                let agent = weak.upgrade()?;
                let max = agent.config.max_reconnect_attempts;
                if max > 0 && attempt >= max {
                    let cause = format!(
                        "gave up reconnecting after {attempt} attempts: {}",
                        agent.last_failure()
                    );
                    error!(agent = %agent.agent_id, %cause, "Agent is offline");
                    *agent.last_failure.write().unwrap_or_else(|e| e.into_inner()) = cause;
                    return None;
                }
                agent.backoff.delay(attempt)
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return None,
            }

            let agent = weak.upgrade()?;
            if agent.closed.load(Ordering::SeqCst) {
                return None;
            }
            attempt += 1;
            match open_tunnel(
                &agent.config,
                &*agent.factory,
                &agent.pipeline,
                Some(agent.agent_id),
                Some(agent.router_id()),
                agent.cookie,
            )
            .await
            {
                Ok((reply, session, tunnel)) => {
                    let previous = agent.router_id();
                    if reply.router_id != previous {
                        info!(
                            agent = %agent.agent_id,
                            from = %previous,
                            to = %reply.router_id,
                            "Router restarted, keeping reserved id"
                        );
                        agent.router_id.store(reply.router_id.0, Ordering::SeqCst);
                    }
                    *agent.tunnel.write().unwrap_or_else(|e| e.into_inner()) = Some(tunnel);
                    info!(agent = %agent.agent_id, attempt, "Tunnel re-established");
                    return Some(session);
                }
                Err(e @ PamrError::RegistrationRefused(_)) => {
                    error!(agent = %agent.agent_id, error = %e, "Router refused reconnection");
                    *agent.last_failure.write().unwrap_or_else(|e| e.into_inner()) = e.to_string();
                    return None;
                }
                Err(e) => {
                    warn!(agent = %agent.agent_id, attempt, error = %e, "Reconnection attempt failed");
                    *agent.last_failure.write().unwrap_or_else(|e| e.into_inner()) = e.to_string();
                }
            }
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("agent_id", &self.agent_id)
            .field("router_id", &self.router_id())
            .field("connected", &self.is_connected())
            .field("pending", &self.waiters.len())
            .finish()
    }
}

async fn read_frame(
    reader: &mut ReadHalf<BoxedStream>,
    limit: Option<Duration>,
) -> Result<Message, String> {
    let read = read_message(reader);
    let result = match limit {
        Some(limit) => match tokio::time::timeout(limit, read).await {
            Ok(result) => result,
            Err(_) => {
                return Err(format!(
                    "no traffic from router for {} ms",
                    limit.as_millis()
                ))
            }
        },
        None => read.await,
    };
    result.map_err(|e| match e {
        WireError::ConnectionClosed => "router closed the tunnel".to_string(),
        other => other.to_string(),
    })
}

async fn write_loop(
    mut writer: WriteHalf<BoxedStream>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    failed: oneshot::Sender<WireError>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &msg).await {
            let _ = failed.send(e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn refusal(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::InvalidAgentId => "agent id cannot be granted",
        ErrorCode::InvalidRouterId => "router restarted since the agent registered",
        ErrorCode::WrongMagicCookie => "wrong magic cookie",
        ErrorCode::MalformedMessage => "router could not parse the registration",
        _ => "unexpected error during registration",
    }
}

/// Connect, register and start the writer task.
async fn open_tunnel(
    config: &AgentConfig,
    factory: &dyn SocketFactory,
    pipeline: &Pipeline,
    agent_id: Option<AgentId>,
    router_id: Option<RouterId>,
    cookie: MagicCookie,
) -> PamrResult<(crate::message::RegistrationReply, Session, Tunnel)> {
    let router = format!("{}:{}", config.router_address, config.router_port);
    let stream = factory
        .connect(&config.router_address, config.router_port)
        .await
        .map_err(|e| PamrError::NotConnected(format!("cannot reach router {router}: {e}")))?;
    let (mut reader, mut writer) = tokio::io::split(stream);

    let request = pipeline.outgoing(Message::RegistrationRequest(RegistrationRequest {
        msg_id: 0,
        agent_id,
        router_id,
        heartbeat_period_ms: 0,
        cookie,
        hostname: local_hostname(),
    }));
    write_message(&mut writer, &request).await?;

    let read = read_message(&mut reader);
    let answer = match config.connect_timeout() {
        Some(limit) => tokio::time::timeout(limit, read).await.map_err(|_| {
            PamrError::NotConnected(format!(
                "router {router} did not answer the registration within {} ms",
                limit.as_millis()
            ))
        })??,
        None => read.await?,
    };

    let reply = match pipeline.incoming(answer) {
        Message::RegistrationReply(reply) => reply,
        Message::Error(e) => {
            return Err(PamrError::RegistrationRefused(format!(
                "{} ({:?})",
                refusal(e.code),
                e.code
            )))
        }
        other => {
            return Err(PamrError::TunnelFailure(format!(
                "unexpected {:?} during registration",
                other.message_type()
            )))
        }
    };
    if let Some(wanted) = agent_id {
        if reply.agent_id != wanted {
            return Err(PamrError::RegistrationRefused(format!(
                "asked for agent id {wanted}, router granted {}",
                reply.agent_id
            )));
        }
    }
    // A reserved id is granted by any router holding it in its reserved
    // agents file, so only dynamic ids are tied to one router instance.
    let reserved = agent_id.is_some_and(|id| id.is_reserved());
    if let Some(known) = router_id {
        if reply.router_id != known && !reserved {
            return Err(PamrError::RegistrationRefused(format!(
                "router id changed from {known} to {}",
                reply.router_id
            )));
        }
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let (failed_tx, failed_rx) = oneshot::channel();
    tokio::spawn(write_loop(writer, rx, failed_tx));

    let read_timeout = match reply.heartbeat_period_ms {
        0 => None,
        ms => Some(Duration::from_millis(u64::from(ms))),
    };
    let session = Session {
        reader,
        writer_failed: failed_rx,
        read_timeout,
    };
    let tunnel = Tunnel {
        tx,
        info: TunnelInfo {
            router,
            connected_at: Utc::now(),
            transport: factory.name(),
        },
    };
    Ok((reply, session, tunnel))
}
