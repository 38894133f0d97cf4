//! Inbound request processing.
//!
//! Every request handed over by the tunnel read loop runs in its own tokio
//! task. A request may issue nested calls through the same [`Agent`] and
//! wait for them; since tasks are not drawn from a bounded pool, a chain of
//! such calls can never starve the replies it is waiting for.

use crate::agent::{Agent, InboundRequest, MessageHandler};
use crate::protocol::{RemoteReply, RemoteRequest, Reply, Request};
use crate::registry::{self, agent_uri};
use crate::remote::AgentClassFetcher;

use async_trait::async_trait;
use pamr_codec::{ClassCatalog, CodecError, ObjectDecoder, ObjectEncoder};
use pamr_types::AgentId;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Executes decoded requests.
#[async_trait]
pub trait ExecutionHook: Send + Sync + 'static {
    async fn execute(
        &self,
        agent: &Arc<Agent>,
        source: AgentId,
        request: Request,
    ) -> Result<Reply, String>;
}

/// Task counters shared by a dispatcher and its observers.
#[derive(Debug, Default)]
pub struct DispatchStats {
    in_flight: AtomicUsize,
    completed: AtomicU64,
}

impl DispatchStats {
    /// Requests currently being processed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Requests processed since start, failed ones included.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }
}

/// Decrements `in_flight` when a task ends, panics included.
struct InFlight(Arc<DispatchStats>);

impl InFlight {
    fn enter(stats: &Arc<DispatchStats>) -> Self {
        stats.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(stats))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        // completed first: observers seeing in_flight at 0 see every count
        self.0.completed.fetch_add(1, Ordering::SeqCst);
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// [`MessageHandler`] running one task per inbound request.
pub struct Dispatcher {
    hook: Arc<dyn ExecutionHook>,
    catalog: Arc<ClassCatalog>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn new(hook: Arc<dyn ExecutionHook>, catalog: Arc<ClassCatalog>) -> Self {
        Self::with_stats(hook, catalog, Arc::new(DispatchStats::default()))
    }

    pub fn with_stats(
        hook: Arc<dyn ExecutionHook>,
        catalog: Arc<ClassCatalog>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            hook,
            catalog,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    pub fn in_flight(&self) -> usize {
        self.stats.in_flight()
    }

    pub fn completed(&self) -> u64 {
        self.stats.completed()
    }
}

impl MessageHandler for Dispatcher {
    fn push_message(&self, agent: Arc<Agent>, request: InboundRequest) {
        let hook = Arc::clone(&self.hook);
        let catalog = Arc::clone(&self.catalog);
        let guard = InFlight::enter(&self.stats);
        tokio::spawn(async move {
            let _guard = guard;
            process(hook, catalog, agent, request).await;
        });
    }
}

async fn process(
    hook: Arc<dyn ExecutionHook>,
    catalog: Arc<ClassCatalog>,
    agent: Arc<Agent>,
    request: InboundRequest,
) {
    let source = request.source();
    let msg_id = request.msg_id();

    let reply = match decode_request(&agent, &catalog, request.payload()).await {
        Ok(decoded) => {
            let kind = decoded.kind();
            debug!(agent = %agent.agent_id(), %source, msg_id, kind, "Executing request");
            match hook.execute(&agent, source, decoded).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(agent = %agent.agent_id(), %source, msg_id, kind, error = %e, "Request execution failed");
                    Reply::Failure(e)
                }
            }
        }
        Err(e) => {
            warn!(agent = %agent.agent_id(), %source, msg_id, error = %e, "Cannot decode request");
            Reply::Failure(format!("cannot decode request: {e}"))
        }
    };

    if request.is_one_way() {
        return;
    }

    let bytes = match encode_reply(&agent, &catalog, reply) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(agent = %agent.agent_id(), %source, msg_id, error = %e, "Cannot encode reply");
            match RemoteReply::Failure(format!("cannot encode reply: {e}")).to_bytes() {
                Ok(bytes) => bytes,
                Err(_) => return,
            }
        }
    };
    if let Err(e) = agent.send_reply(request, bytes) {
        warn!(agent = %agent.agent_id(), %source, msg_id, error = %e, "Reply not sent");
    }
}

async fn decode_request(
    agent: &Arc<Agent>,
    catalog: &Arc<ClassCatalog>,
    payload: &[u8],
) -> Result<Request, CodecError> {
    let request = match RemoteRequest::from_bytes(payload)? {
        RemoteRequest::Invoke { uri, argument } => {
            let uri = registry::parse_uri(&uri).map_err(|e| CodecError::Malformed(e.to_string()))?;
            let fetcher = Arc::new(AgentClassFetcher::new(Arc::clone(agent)));
            let argument = ObjectDecoder::with_fetcher(Arc::clone(catalog), fetcher)
                .decode(&argument)
                .await?;
            Request::Invoke { uri, argument }
        }
        RemoteRequest::Lookup { uri } => Request::Lookup {
            uri: registry::parse_uri(&uri).map_err(|e| CodecError::Malformed(e.to_string()))?,
        },
        RemoteRequest::List => Request::List,
        RemoteRequest::FetchClass { name } => Request::FetchClass { name },
    };
    Ok(request)
}

fn encode_reply(
    agent: &Agent,
    catalog: &Arc<ClassCatalog>,
    reply: Reply,
) -> Result<Vec<u8>, CodecError> {
    let wire = match reply {
        Reply::Invoked(None) => RemoteReply::Invoked(None),
        Reply::Invoked(Some(value)) => {
            let origin = agent_uri(agent.agent_id())
                .map_err(|e| CodecError::Malformed(e.to_string()))?;
            let stream = ObjectEncoder::new(Arc::clone(catalog), origin.as_str()).encode(&value)?;
            RemoteReply::Invoked(Some(stream))
        }
        Reply::Found(found) => RemoteReply::Found(found),
        Reply::Listed(uris) => RemoteReply::Listed(uris.iter().map(|u| u.to_string()).collect()),
        Reply::Class(bytes) => RemoteReply::Class(bytes),
        Reply::Failure(e) => RemoteReply::Failure(e),
    };
    wire.to_bytes()
}
