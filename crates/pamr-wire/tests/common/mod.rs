#![allow(dead_code)]

use pamr_types::{AgentConfig, AgentId, MagicCookie, RouterConfig, RouterId};
use pamr_wire::agent::{Agent, AgentBuilder, InboundRequest, MessageHandler};
use pamr_wire::message::{read_message, write_message, Message, RegistrationRequest};
use pamr_wire::{Pipeline, ReconnectBackoff, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn router_config() -> RouterConfig {
    RouterConfig {
        bind_address: "127.0.0.1".into(),
        port: 0,
        ..RouterConfig::default()
    }
}

pub async fn start_router() -> (Arc<Router>, JoinHandle<()>) {
    start_router_with(router_config()).await
}

pub async fn start_router_with(config: RouterConfig) -> (Arc<Router>, JoinHandle<()>) {
    Router::start(config, Pipeline::new())
        .await
        .expect("router starts")
}

pub fn agent_config(router: &Router) -> AgentConfig {
    AgentConfig::for_router("127.0.0.1", router.local_addr().port())
}

/// Backoff short enough for tests.
pub fn quick_backoff() -> ReconnectBackoff {
    ReconnectBackoff {
        min_delay_ms: 50,
        max_delay_ms: 200,
        tries_per_step: 3,
        jitter: 0.0,
    }
}

/// Answers every request with its own payload.
pub struct Echo;

impl MessageHandler for Echo {
    fn push_message(&self, agent: Arc<Agent>, request: InboundRequest) {
        if request.is_one_way() {
            return;
        }
        let payload = request.payload().clone();
        agent.send_reply(request, payload).expect("reply queued");
    }
}

/// Never answers; keeps nothing.
pub struct Silent;

impl MessageHandler for Silent {
    fn push_message(&self, _agent: Arc<Agent>, _request: InboundRequest) {}
}

/// Forwards every request to a channel.
pub struct Collect(pub mpsc::UnboundedSender<(Arc<Agent>, InboundRequest)>);

impl MessageHandler for Collect {
    fn push_message(&self, agent: Arc<Agent>, request: InboundRequest) {
        let _ = self.0.send((agent, request));
    }
}

pub async fn connect(router: &Router, handler: Arc<dyn MessageHandler>) -> Arc<Agent> {
    AgentBuilder::new(agent_config(router))
        .backoff(quick_backoff())
        .connect(handler)
        .await
        .expect("agent connects")
}

/// Poll `check` until it holds, for at most five seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Register over a bare socket and return it with the router's answer.
pub async fn raw_register(
    addr: SocketAddr,
    agent_id: Option<AgentId>,
    router_id: Option<RouterId>,
    cookie: MagicCookie,
) -> (TcpStream, Message) {
    let mut stream = TcpStream::connect(addr).await.expect("router reachable");
    let request = Message::RegistrationRequest(RegistrationRequest {
        msg_id: 0,
        agent_id,
        router_id,
        heartbeat_period_ms: 0,
        cookie,
        hostname: "raw-test".into(),
    });
    write_message(&mut stream, &request).await.expect("request sent");
    let answer = tokio::time::timeout(Duration::from_secs(5), read_message(&mut stream))
        .await
        .expect("router answers")
        .expect("valid frame");
    (stream, answer)
}

/// Read frames until one matches `pred`, skipping heartbeats.
pub async fn read_until(stream: &mut TcpStream, pred: impl Fn(&Message) -> bool) -> Message {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), read_message(stream))
            .await
            .expect("frame in time")
            .expect("valid frame");
        if pred(&msg) {
            return msg;
        }
    }
}
