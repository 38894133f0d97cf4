//! Router: the central relay every agent keeps one tunnel to.
//!
//! The router hands out agent ids, remembers which tunnel each agent is
//! attached to and forwards data messages between tunnels without looking
//! at their payload. Anything it cannot deliver is answered with an ERROR
//! frame to the sender.
//!
//! Each accepted connection gets a relay task reading frames and a writer
//! task draining an unbounded queue. Other relay tasks push into that queue
//! to forward, so messages from one sender to one recipient keep their
//! order.

use crate::message::{
    read_message, write_message, DataMessage, ErrorCode, ErrorMessage, Message,
    RegistrationReply, RegistrationRequest, WireError,
};
use crate::valve::Pipeline;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pamr_types::{AgentId, MagicCookie, PamrError, PamrResult, RouterConfig, RouterId};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Log target of agent lifecycle events.
pub const ADMIN_TARGET: &str = "pamr::router::admin";

/// Contents of the reserved-agents file.
///
/// ```toml
/// configuration = "admin passphrase or 64 hex digits"
///
/// [agents]
/// 12 = "cookie of agent 12"
/// ```
#[derive(Debug, Clone, Default)]
pub struct ReservedAgents {
    /// Cookie authorizing RELOAD_CONFIGURATION.
    pub admin: Option<MagicCookie>,
    pub agents: HashMap<AgentId, MagicCookie>,
}

#[derive(Deserialize)]
struct ReservedFile {
    configuration: MagicCookie,
    #[serde(default)]
    agents: BTreeMap<String, MagicCookie>,
}

impl ReservedAgents {
    pub fn load(path: &Path) -> PamrResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PamrError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&text).map_err(|e| PamrError::Config(format!("{}: {e}", path.display())))
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let file: ReservedFile = toml::from_str(text).map_err(|e| e.to_string())?;
        let mut agents = HashMap::with_capacity(file.agents.len());
        for (key, cookie) in file.agents {
            let id: AgentId = key
                .parse()
                .map_err(|_| format!("agent id {key:?} is not a number"))?;
            if !id.is_reserved() {
                return Err(format!(
                    "agent id {id} is outside the reserved range (below {})",
                    AgentId::MIN_DYNAMIC
                ));
            }
            agents.insert(id, cookie);
        }
        Ok(Self {
            admin: Some(file.configuration),
            agents,
        })
    }
}

/// Snapshot of one known agent.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub agent_id: AgentId,
    pub hostname: String,
    pub reserved: bool,
    pub connected: bool,
    pub remote_addr: Option<SocketAddr>,
    /// Time of the last successful registration.
    pub connected_at: DateTime<Utc>,
}

#[derive(Clone)]
struct Attachment {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
    closer: Arc<Notify>,
    remote_addr: SocketAddr,
}

struct Client {
    cookie: MagicCookie,
    reserved: bool,
    hostname: String,
    attachment: Option<Attachment>,
    last_seen: Instant,
    connected_at: DateTime<Utc>,
    disconnected_at: Option<Instant>,
}

impl Client {
    fn new(cookie: MagicCookie, reserved: bool, hostname: String) -> Self {
        Self {
            cookie,
            reserved,
            hostname,
            attachment: None,
            last_seen: Instant::now(),
            connected_at: Utc::now(),
            disconnected_at: Some(Instant::now()),
        }
    }
}

/// The PAMR router.
pub struct Router {
    config: RouterConfig,
    router_id: RouterId,
    local_addr: SocketAddr,
    pipeline: Pipeline,
    clients: DashMap<AgentId, Client>,
    reserved: RwLock<ReservedAgents>,
    next_agent_id: AtomicU64,
    next_attachment: AtomicU64,
    next_heartbeat: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Router {
    /// Bind the listener and start serving.
    ///
    /// The handle completes once the router is stopped.
    pub async fn start(
        config: RouterConfig,
        pipeline: Pipeline,
    ) -> PamrResult<(Arc<Router>, JoinHandle<()>)> {
        config.validate()?;
        let reserved = match &config.reserved_agents_file {
            Some(path) => ReservedAgents::load(path)?,
            None => ReservedAgents::default(),
        };

        let listener = TcpListener::bind((config.bind_address.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);
        let router = Arc::new(Router {
            router_id: RouterId::random(),
            local_addr,
            pipeline,
            clients: DashMap::new(),
            reserved: RwLock::new(reserved),
            next_agent_id: AtomicU64::new(AgentId::MIN_DYNAMIC),
            next_attachment: AtomicU64::new(1),
            next_heartbeat: AtomicU64::new(1),
            shutdown,
            config,
        });
        info!(
            router = %router.router_id,
            addr = %local_addr,
            heartbeat_ms = router.config.heartbeat_timeout_ms,
            "Router listening"
        );

        tokio::spawn(Self::heartbeat_loop(
            Arc::downgrade(&router),
            router.shutdown.subscribe(),
        ));
        if let Some(timeout) = router.config.eviction_timeout() {
            tokio::spawn(Self::eviction_loop(
                Arc::downgrade(&router),
                timeout,
                router.shutdown.subscribe(),
            ));
        }

        let accept = Arc::clone(&router);
        let handle = tokio::spawn(async move { accept.accept_loop(listener).await });
        Ok((router, handle))
    }

    pub fn router_id(&self) -> RouterId {
        self.router_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Known agents, attached or not, sorted by id.
    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .clients
            .iter()
            .map(|entry| {
                let c = entry.value();
                ClientInfo {
                    agent_id: *entry.key(),
                    hostname: c.hostname.clone(),
                    reserved: c.reserved,
                    connected: c.attachment.is_some(),
                    remote_addr: c.attachment.as_ref().map(|a| a.remote_addr),
                    connected_at: c.connected_at,
                }
            })
            .collect();
        clients.sort_by_key(|c| c.agent_id);
        clients
    }

    pub fn is_connected(&self, agent: AgentId) -> bool {
        self.clients
            .get(&agent)
            .map(|c| c.attachment.is_some())
            .unwrap_or(false)
    }

    /// Stop accepting and close every tunnel.
    pub fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        for entry in self.clients.iter() {
            if let Some(attachment) = &entry.attachment {
                attachment.closer.notify_one();
            }
        }
        info!(router = %self.router_id, "Router stopped");
    }

    /// Re-read the reserved-agents file.
    ///
    /// Reserved agents no longer listed are disconnected and forgotten.
    /// Agents whose cookie changed are disconnected so they register again
    /// with the new one.
    pub fn reload_configuration(&self) -> PamrResult<()> {
        let path = self.config.reserved_agents_file.as_deref().ok_or_else(|| {
            PamrError::Config("router has no reserved agents file".to_string())
        })?;
        let fresh = ReservedAgents::load(path)?;

        let reserved_ids: Vec<AgentId> = self
            .clients
            .iter()
            .filter(|c| c.reserved)
            .map(|c| *c.key())
            .collect();
        for id in reserved_ids {
            match fresh.agents.get(&id) {
                None => {
                    if let Some((_, client)) = self.clients.remove(&id) {
                        info!(target: ADMIN_TARGET, agent = %id, "Reserved agent delisted");
                        if let Some(attachment) = client.attachment {
                            attachment.closer.notify_one();
                            self.broadcast_disconnection(id);
                        }
                    }
                }
                Some(cookie) => {
                    if let Some(mut client) = self.clients.get_mut(&id) {
                        if client.cookie != *cookie {
                            client.cookie = *cookie;
                            info!(target: ADMIN_TARGET, agent = %id, "Reserved agent cookie changed");
                            if let Some(attachment) = &client.attachment {
                                attachment.closer.notify_one();
                            }
                        }
                    }
                }
            }
        }

        let listed = fresh.agents.len();
        *self.reserved.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        info!(router = %self.router_id, reserved = listed, "Configuration reloaded");
        Ok(())
    }

    fn reload_authorized(&self, cookie: &MagicCookie) -> Result<(), ErrorCode> {
        let authorized = self
            .reserved
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .admin
            .map(|admin| admin.verify(cookie))
            .unwrap_or(false);
        if !authorized {
            warn!(target: ADMIN_TARGET, "Reload refused: wrong admin cookie");
            return Err(ErrorCode::WrongMagicCookie);
        }
        if let Err(e) = self.reload_configuration() {
            error!(error = %e, "Reload failed");
        }
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        let router = Arc::clone(&self);
                        tokio::spawn(async move { router.handle_connection(stream, addr).await });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!(router = %self.router_id, "Accept loop ended");
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (mut reader, mut writer) = stream.into_split();

        let first = match tokio::time::timeout(
            self.config.heartbeat_timeout(),
            read_message(&mut reader),
        )
        .await
        {
            Ok(Ok(msg)) => self.pipeline.incoming(msg),
            Ok(Err(e)) if e.is_protocol_violation() => {
                debug!(%addr, error = %e, "Malformed first frame");
                let msg_id = e.msg_id().unwrap_or(0);
                self.refuse(&mut writer, msg_id, None, ErrorCode::MalformedMessage)
                    .await;
                return;
            }
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "Connection closed before registration");
                return;
            }
            Err(_) => {
                debug!(%addr, "No registration received in time");
                return;
            }
        };

        match first {
            Message::RegistrationRequest(request) => {
                self.register(request, reader, writer, addr).await;
            }
            Message::ReloadConfiguration { msg_id, cookie } => {
                if let Err(code) = self.reload_authorized(&cookie) {
                    self.refuse(&mut writer, msg_id, None, code).await;
                }
                let _ = writer.shutdown().await;
            }
            other => {
                debug!(%addr, kind = ?other.message_type(), "Expected a registration");
                self.refuse(&mut writer, other.msg_id(), None, ErrorCode::MalformedMessage)
                    .await;
            }
        }
    }

    async fn refuse(
        &self,
        writer: &mut OwnedWriteHalf,
        msg_id: u64,
        faulty: Option<AgentId>,
        code: ErrorCode,
    ) {
        let msg = self.pipeline.outgoing(Message::Error(ErrorMessage {
            msg_id,
            faulty,
            recipient: faulty,
            code,
            about_reply: false,
        }));
        if let Err(e) = write_message(writer, &msg).await {
            debug!(error = %e, "Could not send refusal");
        }
        let _ = writer.shutdown().await;
    }

    /// Decide on a registration and queue the reply; the client map entry is
    /// only updated once the reply is first in the new queue.
    fn admit(
        &self,
        request: &RegistrationRequest,
        attachment: Attachment,
    ) -> Result<(AgentId, Option<Attachment>), ErrorCode> {
        let reply = |agent_id: AgentId| {
            self.pipeline.outgoing(Message::RegistrationReply(RegistrationReply {
                msg_id: request.msg_id,
                agent_id,
                router_id: self.router_id,
                heartbeat_period_ms: u32::try_from(self.config.heartbeat_timeout_ms)
                    .unwrap_or(u32::MAX),
                cookie: request.cookie,
            }))
        };

        let Some(id) = request.agent_id else {
            let id = AgentId(self.next_agent_id.fetch_add(1, Ordering::SeqCst));
            let _ = attachment.tx.send(reply(id));
            let mut client = Client::new(request.cookie, false, request.hostname.clone());
            client.attachment = Some(attachment);
            client.disconnected_at = None;
            self.clients.insert(id, client);
            return Ok((id, None));
        };

        let reserved = id.is_reserved();
        if reserved {
            let reserved_agents = self.reserved.read().unwrap_or_else(|e| e.into_inner());
            match reserved_agents.agents.get(&id) {
                None => return Err(ErrorCode::InvalidAgentId),
                Some(expected) if !expected.verify(&request.cookie) => {
                    return Err(ErrorCode::WrongMagicCookie)
                }
                Some(_) => {}
            }
        } else if request.router_id != Some(self.router_id) {
            return Err(ErrorCode::InvalidRouterId);
        }

        let mut client = match self.clients.entry(id) {
            Entry::Occupied(e) => e.into_ref(),
            Entry::Vacant(v) if reserved => {
                v.insert(Client::new(request.cookie, true, request.hostname.clone()))
            }
            Entry::Vacant(_) => return Err(ErrorCode::InvalidAgentId),
        };
        if !client.cookie.verify(&request.cookie) {
            return Err(ErrorCode::WrongMagicCookie);
        }

        let _ = attachment.tx.send(reply(id));
        let previous = client.attachment.replace(attachment);
        client.hostname = request.hostname.clone();
        client.last_seen = Instant::now();
        client.connected_at = Utc::now();
        client.disconnected_at = None;
        Ok((id, previous))
    }

    async fn register(
        self: Arc<Self>,
        request: RegistrationRequest,
        reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
        addr: SocketAddr,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let attachment = Attachment {
            id: self.next_attachment.fetch_add(1, Ordering::SeqCst),
            tx,
            closer: Arc::new(Notify::new()),
            remote_addr: addr,
        };

        let (id, previous) = match self.admit(&request, attachment.clone()) {
            Ok(admitted) => admitted,
            Err(code) => {
                warn!(
                    target: ADMIN_TARGET,
                    %addr,
                    requested = ?request.agent_id,
                    ?code,
                    "Registration refused"
                );
                drop(attachment);
                drop(rx);
                self.refuse(&mut writer, request.msg_id, request.agent_id, code)
                    .await;
                return;
            }
        };

        if let Some(previous) = previous {
            previous.closer.notify_one();
            info!(target: ADMIN_TARGET, agent = %id, %addr, host = %request.hostname, "Agent reconnected");
        } else if request.agent_id.is_some() {
            info!(target: ADMIN_TARGET, agent = %id, %addr, host = %request.hostname, "Agent reattached");
        } else {
            info!(target: ADMIN_TARGET, agent = %id, %addr, host = %request.hostname, "Agent connected");
        }

        tokio::spawn(write_loop(writer, rx, Arc::clone(&attachment.closer)));
        let reason = self.relay(id, &attachment, reader).await;
        self.detach(id, attachment.id, &reason);
    }

    /// Read frames from one tunnel until it ends. Returns why it ended.
    async fn relay(&self, id: AgentId, attachment: &Attachment, mut reader: OwnedReadHalf) -> String {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                return "router stopped".to_string();
            }
            let frame = tokio::select! {
                _ = attachment.closer.notified() => return "closed by router".to_string(),
                _ = shutdown.changed() => return "router stopped".to_string(),
                frame = read_message(&mut reader) => frame,
            };
            match frame {
                Ok(msg) => {
                    if let Err(reason) = self.on_frame(id, attachment, msg) {
                        return reason;
                    }
                }
                Err(e) if e.is_protocol_violation() => {
                    let msg_id = e.msg_id().unwrap_or(0);
                    self.send_error(attachment, msg_id, None, id, ErrorCode::MalformedMessage, false);
                    return format!("malformed frame: {e}");
                }
                Err(WireError::ConnectionClosed) => return "connection closed".to_string(),
                Err(e) => return e.to_string(),
            }
        }
    }

    fn on_frame(&self, id: AgentId, attachment: &Attachment, msg: Message) -> Result<(), String> {
        if let Some(mut client) = self.clients.get_mut(&id) {
            if client.attachment.as_ref().map(|a| a.id) == Some(attachment.id) {
                client.last_seen = Instant::now();
            }
        }

        match self.pipeline.incoming(msg) {
            Message::DataRequest(m) => self.forward(id, attachment, m, false),
            Message::DataReply(m) => self.forward(id, attachment, m, true),
            Message::HeartbeatClient { .. } => Ok(()),
            Message::ReloadConfiguration { msg_id, cookie } => {
                if let Err(code) = self.reload_authorized(&cookie) {
                    self.send_error(attachment, msg_id, None, id, code, false);
                }
                Ok(())
            }
            Message::RegistrationRequest(r) => {
                self.send_error(attachment, r.msg_id, None, id, ErrorCode::MalformedMessage, false);
                Err("registration on an established tunnel".to_string())
            }
            other => {
                warn!(agent = %id, kind = ?other.message_type(), "Ignoring unexpected frame");
                Ok(())
            }
        }
    }

    fn forward(
        &self,
        id: AgentId,
        attachment: &Attachment,
        m: DataMessage,
        is_reply: bool,
    ) -> Result<(), String> {
        if m.src != id {
            self.send_error(attachment, m.msg_id, None, id, ErrorCode::MalformedMessage, is_reply);
            return Err(format!("agent {id} claimed to be {}", m.src));
        }

        let (dst, msg_id) = (m.dst, m.msg_id);
        let target = self
            .clients
            .get(&dst)
            .map(|c| c.attachment.as_ref().map(|a| a.tx.clone()));
        let msg = if is_reply {
            Message::DataReply(m)
        } else {
            Message::DataRequest(m)
        };

        let code = match target {
            Some(Some(tx)) => match tx.send(self.pipeline.outgoing(msg)) {
                Ok(()) => return Ok(()),
                Err(_) => ErrorCode::NotConnectedRecipient,
            },
            Some(None) => ErrorCode::NotConnectedRecipient,
            None => ErrorCode::UnknownRecipient,
        };
        debug!(from = %id, to = %dst, msg_id, ?code, "Message not deliverable");
        self.send_error(attachment, msg_id, Some(dst), id, code, is_reply);
        Ok(())
    }

    fn send_error(
        &self,
        attachment: &Attachment,
        msg_id: u64,
        faulty: Option<AgentId>,
        recipient: AgentId,
        code: ErrorCode,
        about_reply: bool,
    ) {
        let msg = Message::Error(ErrorMessage {
            msg_id,
            faulty,
            recipient: Some(recipient),
            code,
            about_reply,
        });
        let _ = attachment.tx.send(self.pipeline.outgoing(msg));
    }

    /// Mark `id` detached if `attachment_id` is still its current tunnel.
    fn detach(&self, id: AgentId, attachment_id: u64, reason: &str) {
        let detached = match self.clients.get_mut(&id) {
            Some(mut client) if client.attachment.as_ref().map(|a| a.id) == Some(attachment_id) => {
                client.attachment = None;
                client.disconnected_at = Some(Instant::now());
                true
            }
            _ => false,
        };
        if detached {
            info!(target: ADMIN_TARGET, agent = %id, %reason, "Agent disconnected");
            self.broadcast_disconnection(id);
        } else {
            debug!(agent = %id, %reason, "Superseded tunnel closed");
        }
    }

    fn broadcast_disconnection(&self, lost: AgentId) {
        for entry in self.clients.iter() {
            if *entry.key() == lost {
                continue;
            }
            if let Some(attachment) = &entry.attachment {
                let msg = Message::Error(ErrorMessage {
                    msg_id: 0,
                    faulty: Some(lost),
                    recipient: Some(*entry.key()),
                    code: ErrorCode::DisconnectionBroadcast,
                    about_reply: false,
                });
                let _ = attachment.tx.send(self.pipeline.outgoing(msg));
            }
        }
    }

    /// Probe every attached agent and drop the silent ones.
    fn heartbeat_tick(&self) {
        let timeout = self.config.heartbeat_timeout();
        let heartbeat_id = self.next_heartbeat.fetch_add(1, Ordering::Relaxed);
        let mut stale = Vec::new();
        for entry in self.clients.iter() {
            let Some(attachment) = &entry.attachment else {
                continue;
            };
            if entry.last_seen.elapsed() > timeout {
                stale.push((*entry.key(), Arc::clone(&attachment.closer)));
            } else {
                let _ = attachment
                    .tx
                    .send(self.pipeline.outgoing(Message::HeartbeatRouter { heartbeat_id }));
            }
        }
        for (id, closer) in stale {
            warn!(target: ADMIN_TARGET, agent = %id, timeout_ms = timeout.as_millis() as u64, "Agent missed heartbeats");
            closer.notify_one();
        }
    }

    /// Forget non-reserved agents detached for longer than `timeout`.
    fn evict(&self, timeout: Duration) -> usize {
        let mut evicted = Vec::new();
        self.clients.retain(|id, client| {
            let expired = !client.reserved
                && client.attachment.is_none()
                && client
                    .disconnected_at
                    .map(|at| at.elapsed() > timeout)
                    .unwrap_or(false);
            if expired {
                evicted.push(*id);
            }
            !expired
        });
        for id in &evicted {
            info!(target: ADMIN_TARGET, agent = %id, "Agent evicted");
        }
        evicted.len()
    }

    async fn heartbeat_loop(router: Weak<Router>, mut shutdown: watch::Receiver<bool>) {
        let period = match router.upgrade() {
            Some(r) => (r.config.heartbeat_timeout() / 3).max(Duration::from_millis(1)),
            None => return,
        };
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            match router.upgrade() {
                Some(r) => r.heartbeat_tick(),
                None => return,
            }
        }
    }

    async fn eviction_loop(
        router: Weak<Router>,
        timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval((timeout / 3).max(Duration::from_millis(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            match router.upgrade() {
                Some(r) => {
                    r.evict(timeout);
                }
                None => return,
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("router_id", &self.router_id)
            .field("local_addr", &self.local_addr)
            .field("clients", &self.clients.len())
            .finish()
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Message>,
    closer: Arc<Notify>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &msg).await {
            debug!(error = %e, "Tunnel write failed");
            closer.notify_one();
            return;
        }
    }
    let _ = writer.shutdown().await;
}
