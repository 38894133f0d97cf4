//! Remote objects over a PAMR tunnel.
//!
//! A [`RemoteEndpoint`] owns one agent together with the registry of the
//! objects it exports and the class catalog its codec resolves against.
//! Calls to `pamr://<agent-id>/<name>` URIs are relayed by the router to the
//! owning agent, whose [`RegistryExecutor`] looks the object up and invokes
//! it.

use crate::agent::{Agent, AgentBuilder};
use crate::dispatcher::{DispatchStats, Dispatcher, ExecutionHook};
use crate::protocol::{RemoteReply, RemoteRequest, Reply, Request};
use crate::registry::{self, agent_uri, object_uri, RemoteObject, Registry};
use crate::valve::Pipeline;

use async_trait::async_trait;
use pamr_codec::{ClassCatalog, ClassDef, ClassFetcher, ObjectDecoder, ObjectEncoder, Value};
use pamr_types::{AgentConfig, AgentId, PamrError, PamrResult};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// What an invoked object knows about its caller.
pub struct CallContext {
    endpoint: RemoteEndpoint,
    source: AgentId,
    uri: Url,
}

impl CallContext {
    /// Agent that issued the call.
    pub fn source(&self) -> AgentId {
        self.source
    }

    /// URI the call was addressed to.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Endpoint serving the call, for nested calls.
    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }
}

/// Fetches class definitions from the agent named in a class origin.
pub struct AgentClassFetcher {
    agent: Arc<Agent>,
}

impl AgentClassFetcher {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl ClassFetcher for AgentClassFetcher {
    async fn fetch_class(&self, class: &str, origin: &str) -> Result<Vec<u8>, String> {
        let origin = Url::parse(origin).map_err(|e| format!("bad origin {origin}: {e}"))?;
        let owner = registry::agent_of(&origin).map_err(|e| e.to_string())?;
        if owner == self.agent.agent_id() {
            return Err(format!("{class} is not defined locally"));
        }
        debug!(agent = %self.agent.agent_id(), %owner, class, "Fetching class definition");

        let request = RemoteRequest::FetchClass {
            name: class.to_string(),
        }
        .to_bytes()
        .map_err(|e| e.to_string())?;
        let answer = self
            .agent
            .send_msg(owner, request, false)
            .await
            .map_err(|e| e.to_string())?;
        match RemoteReply::from_bytes(&answer).map_err(|e| e.to_string())? {
            RemoteReply::Class(bytes) => Ok(bytes),
            RemoteReply::Failure(e) => Err(e),
            other => Err(format!("unexpected answer to class fetch: {other:?}")),
        }
    }
}

/// Execution hook serving the requests of a [`RemoteEndpoint`].
pub struct RegistryExecutor {
    registry: Arc<Registry>,
    catalog: Arc<ClassCatalog>,
    stats: Arc<DispatchStats>,
}

impl RegistryExecutor {
    pub fn new(
        registry: Arc<Registry>,
        catalog: Arc<ClassCatalog>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            registry,
            catalog,
            stats,
        }
    }
}

#[async_trait]
impl ExecutionHook for RegistryExecutor {
    async fn execute(
        &self,
        agent: &Arc<Agent>,
        source: AgentId,
        request: Request,
    ) -> Result<Reply, String> {
        match request {
            Request::Invoke { uri, argument } => {
                let object = self
                    .registry
                    .lookup(&uri)
                    .ok_or_else(|| format!("nothing is bound at {uri}"))?;
                let ctx = CallContext {
                    endpoint: RemoteEndpoint {
                        agent: Arc::clone(agent),
                        registry: Arc::clone(&self.registry),
                        catalog: Arc::clone(&self.catalog),
                        stats: Arc::clone(&self.stats),
                    },
                    source,
                    uri,
                };
                Ok(Reply::Invoked(object.invoke(&ctx, argument).await?))
            }
            Request::Lookup { uri } => Ok(Reply::Found(self.registry.contains(&uri))),
            Request::List => Ok(Reply::Listed(self.registry.list())),
            Request::FetchClass { name } => match self.catalog.class_bytes(&name) {
                Some(bytes) => bytes.map(Reply::Class).map_err(|e| e.to_string()),
                None => Err(format!(
                    "class {name} is not defined on agent {}",
                    agent.agent_id()
                )),
            },
        }
    }
}

/// An agent exporting and calling remote objects.
#[derive(Clone)]
pub struct RemoteEndpoint {
    agent: Arc<Agent>,
    registry: Arc<Registry>,
    catalog: Arc<ClassCatalog>,
    stats: Arc<DispatchStats>,
}

impl RemoteEndpoint {
    pub async fn connect(config: AgentConfig) -> PamrResult<Self> {
        Self::with_builder(AgentBuilder::new(config)).await
    }

    pub async fn connect_with(config: AgentConfig, pipeline: Pipeline) -> PamrResult<Self> {
        Self::with_builder(AgentBuilder::new(config).pipeline(pipeline)).await
    }

    /// Connect through a customized agent builder.
    pub async fn with_builder(builder: AgentBuilder) -> PamrResult<Self> {
        let registry = Arc::new(Registry::new());
        let catalog = Arc::new(ClassCatalog::new());
        let stats = Arc::new(DispatchStats::default());
        let hook = Arc::new(RegistryExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&catalog),
            Arc::clone(&stats),
        ));
        let dispatcher = Arc::new(Dispatcher::with_stats(
            hook,
            Arc::clone(&catalog),
            Arc::clone(&stats),
        ));
        let agent = builder.connect(dispatcher).await?;
        Ok(Self {
            agent,
            registry,
            catalog,
            stats,
        })
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent.agent_id()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<ClassCatalog> {
        &self.catalog
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Origin annotation of classes defined by this endpoint.
    pub fn origin(&self) -> PamrResult<Url> {
        agent_uri(self.agent_id())
    }

    /// Make `def` known to this endpoint's codec.
    pub fn define_class(&self, def: ClassDef) {
        self.catalog.define(def);
    }

    /// Bind `object` as `pamr://<this-agent>/<name>`.
    pub fn export(&self, name: &str, object: Arc<dyn RemoteObject>) -> PamrResult<Url> {
        let uri = self.registry.bind(&object_uri(self.agent_id(), name)?, object)?;
        info!(uri = %uri, "Object exported");
        Ok(uri)
    }

    /// Like [`export`](Self::export), replacing any previous binding.
    pub fn rebind(&self, name: &str, object: Arc<dyn RemoteObject>) -> PamrResult<Url> {
        self.registry
            .rebind(&object_uri(self.agent_id(), name)?, object)
    }

    pub fn unexport(&self, uri: &Url) -> PamrResult<()> {
        self.registry.unbind(uri)?;
        info!(uri = %uri, "Object unexported");
        Ok(())
    }

    /// Whether something is bound at `uri` on its owning agent.
    pub async fn lookup(&self, uri: &Url) -> PamrResult<bool> {
        let uri = registry::normalize(uri)?;
        let owner = registry::agent_of(&uri)?;
        if owner == self.agent_id() {
            return Ok(self.registry.contains(&uri));
        }
        match self
            .call(owner, &RemoteRequest::Lookup { uri: uri.to_string() })
            .await?
        {
            RemoteReply::Found(found) => Ok(found),
            other => Err(unexpected(other)),
        }
    }

    /// URIs bound on the agent named by `agent` (any `pamr://<id>/...` URI).
    pub async fn list(&self, agent: &Url) -> PamrResult<Vec<Url>> {
        let owner = registry::agent_of(agent)?;
        if owner == self.agent_id() {
            return Ok(self.registry.list());
        }
        match self.call(owner, &RemoteRequest::List).await? {
            RemoteReply::Listed(uris) => uris
                .iter()
                .map(|u| registry::parse_uri(u))
                .collect::<PamrResult<Vec<Url>>>(),
            other => Err(unexpected(other)),
        }
    }

    /// Invoke the object bound at `uri`.
    ///
    /// One-way invocations return `Ok(None)` as soon as the request is sent.
    pub async fn invoke(&self, uri: &Url, argument: Value, one_way: bool) -> PamrResult<Option<Value>> {
        let uri = registry::normalize(uri)?;
        let owner = registry::agent_of(&uri)?;
        let origin = self.origin()?;
        let stream = ObjectEncoder::new(Arc::clone(&self.catalog), origin.as_str()).encode(&argument)?;
        let request = RemoteRequest::Invoke {
            uri: uri.to_string(),
            argument: stream,
        }
        .to_bytes()?;

        let answer = self.agent.send_msg(owner, request, one_way).await?;
        if one_way {
            return Ok(None);
        }
        match RemoteReply::from_bytes(&answer)? {
            RemoteReply::Invoked(None) => Ok(None),
            RemoteReply::Invoked(Some(result)) => {
                let fetcher = Arc::new(AgentClassFetcher::new(Arc::clone(&self.agent)));
                let value = ObjectDecoder::with_fetcher(Arc::clone(&self.catalog), fetcher)
                    .decode(&result)
                    .await?;
                Ok(Some(value))
            }
            RemoteReply::Failure(e) => Err(PamrError::Execution(e)),
            other => Err(unexpected(other)),
        }
    }

    pub fn shutdown(&self) {
        self.agent.shutdown();
    }

    async fn call(&self, target: AgentId, request: &RemoteRequest) -> PamrResult<RemoteReply> {
        let answer = self.agent.send_msg(target, request.to_bytes()?, false).await?;
        match RemoteReply::from_bytes(&answer)? {
            RemoteReply::Failure(e) => Err(PamrError::Execution(e)),
            reply => Ok(reply),
        }
    }
}

impl std::fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("agent", &self.agent)
            .field("exported", &self.registry.len())
            .field("classes", &self.catalog.len())
            .finish()
    }
}

fn unexpected(reply: RemoteReply) -> PamrError {
    PamrError::Codec(format!("unexpected reply {reply:?}"))
}
