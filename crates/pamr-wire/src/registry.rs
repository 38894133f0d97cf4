//! Registry of exported remote objects, keyed by `pamr://<agent-id>/<name>`.

use crate::remote::CallContext;
use async_trait::async_trait;
use dashmap::DashMap;
use pamr_codec::Value;
use pamr_types::{AgentId, PamrError, PamrResult};
use std::sync::Arc;
use url::Url;

/// URI scheme of PAMR object references.
pub const SCHEME: &str = "pamr";

/// An object reachable through the tunnel.
#[async_trait]
pub trait RemoteObject: Send + Sync + 'static {
    /// Handle one invocation. `Ok(None)` is a void result.
    async fn invoke(&self, ctx: &CallContext, argument: Value) -> Result<Option<Value>, String>;
}

/// URI of object `name` exported by `agent`.
pub fn object_uri(agent: AgentId, name: &str) -> PamrResult<Url> {
    let name = name.trim_start_matches('/');
    if name.is_empty() {
        return Err(PamrError::InvalidUri(format!(
            "empty object name for agent {agent}"
        )));
    }
    let raw = format!("{SCHEME}://{agent}/{name}");
    Url::parse(&raw).map_err(|e| PamrError::InvalidUri(format!("{raw}: {e}")))
}

/// URI naming an agent itself, used for listing its objects.
pub fn agent_uri(agent: AgentId) -> PamrResult<Url> {
    let raw = format!("{SCHEME}://{agent}/");
    Url::parse(&raw).map_err(|e| PamrError::InvalidUri(format!("{raw}: {e}")))
}

/// Agent owning `uri`.
pub fn agent_of(uri: &Url) -> PamrResult<AgentId> {
    if uri.scheme() != SCHEME {
        return Err(PamrError::InvalidUri(format!(
            "{uri}: scheme must be {SCHEME}"
        )));
    }
    uri.host_str()
        .ok_or_else(|| PamrError::InvalidUri(format!("{uri}: missing agent id")))?
        .parse::<AgentId>()
        .map_err(|_| PamrError::InvalidUri(format!("{uri}: host is not an agent id")))
}

/// Object name of `uri`, without the leading slash.
pub fn object_name(uri: &Url) -> PamrResult<&str> {
    let name = uri.path().trim_start_matches('/');
    if name.is_empty() {
        return Err(PamrError::InvalidUri(format!("{uri}: missing object name")));
    }
    Ok(name)
}

/// Canonical form of an object URI: no query, fragment, port or userinfo.
pub fn normalize(uri: &Url) -> PamrResult<Url> {
    let agent = agent_of(uri)?;
    object_uri(agent, object_name(uri)?)
}

/// Parse and normalize a textual object URI.
pub fn parse_uri(text: &str) -> PamrResult<Url> {
    let uri = Url::parse(text).map_err(|e| PamrError::InvalidUri(format!("{text}: {e}")))?;
    normalize(&uri)
}

/// Concurrent map of exported objects.
#[derive(Default)]
pub struct Registry {
    objects: DashMap<String, Arc<dyn RemoteObject>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `object` at `uri`. Fails if the URI is already bound.
    pub fn bind(&self, uri: &Url, object: Arc<dyn RemoteObject>) -> PamrResult<Url> {
        let uri = normalize(uri)?;
        match self.objects.entry(uri.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(PamrError::AlreadyBound(uri.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(object);
                Ok(uri)
            }
        }
    }

    /// Bind `object` at `uri`, replacing any previous binding.
    pub fn rebind(&self, uri: &Url, object: Arc<dyn RemoteObject>) -> PamrResult<Url> {
        let uri = normalize(uri)?;
        self.objects.insert(uri.to_string(), object);
        Ok(uri)
    }

    pub fn unbind(&self, uri: &Url) -> PamrResult<Arc<dyn RemoteObject>> {
        let uri = normalize(uri)?;
        self.objects
            .remove(uri.as_str())
            .map(|(_, object)| object)
            .ok_or_else(|| PamrError::NotBound(uri.to_string()))
    }

    pub fn lookup(&self, uri: &Url) -> Option<Arc<dyn RemoteObject>> {
        let uri = normalize(uri).ok()?;
        self.objects.get(uri.as_str()).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.lookup(uri).is_some()
    }

    /// Bound URIs, sorted.
    pub fn list(&self) -> Vec<Url> {
        let mut names: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|n| Url::parse(&n).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("objects", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl RemoteObject for Nop {
        async fn invoke(&self, _ctx: &CallContext, _argument: Value) -> Result<Option<Value>, String> {
            Ok(None)
        }
    }

    #[test]
    fn test_object_uri_roundtrip() {
        let uri = object_uri(AgentId(4100), "counter").unwrap();
        assert_eq!(uri.as_str(), "pamr://4100/counter");
        assert_eq!(agent_of(&uri).unwrap(), AgentId(4100));
        assert_eq!(object_name(&uri).unwrap(), "counter");
    }

    #[test]
    fn test_normalize_strips_extras() {
        let uri = Url::parse("pamr://4100/counter?x=1#frag").unwrap();
        assert_eq!(normalize(&uri).unwrap().as_str(), "pamr://4100/counter");
    }

    #[test]
    fn test_invalid_uris() {
        assert!(parse_uri("http://4100/counter").is_err());
        assert!(parse_uri("pamr://abc/counter").is_err());
        assert!(parse_uri("pamr://4100/").is_err());
        assert!(object_uri(AgentId(1), "").is_err());
    }

    #[test]
    fn test_agent_uri() {
        let uri = agent_uri(AgentId(9)).unwrap();
        assert_eq!(agent_of(&uri).unwrap(), AgentId(9));
        assert!(object_name(&uri).is_err());
    }

    #[test]
    fn test_bind_lookup_unbind() {
        let registry = Registry::new();
        let uri = object_uri(AgentId(4096), "a").unwrap();
        assert!(registry.lookup(&uri).is_none());

        registry.bind(&uri, Arc::new(Nop)).unwrap();
        assert!(registry.contains(&uri));
        assert_eq!(registry.list(), vec![uri.clone()]);

        registry.unbind(&uri).unwrap();
        assert!(registry.lookup(&uri).is_none());
        assert!(matches!(registry.unbind(&uri), Err(PamrError::NotBound(_))));
    }

    #[test]
    fn test_duplicate_bind_rejected_rebind_replaces() {
        let registry = Registry::new();
        let uri = object_uri(AgentId(4096), "a").unwrap();
        registry.bind(&uri, Arc::new(Nop)).unwrap();
        assert!(matches!(
            registry.bind(&uri, Arc::new(Nop)),
            Err(PamrError::AlreadyBound(_))
        ));
        registry.rebind(&uri, Arc::new(Nop)).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_sorted() {
        let registry = Registry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry
                .bind(&object_uri(AgentId(5000), name).unwrap(), Arc::new(Nop))
                .unwrap();
        }
        let names: Vec<String> = registry.list().iter().map(|u| u.to_string()).collect();
        assert_eq!(
            names,
            vec!["pamr://5000/alpha", "pamr://5000/mid", "pamr://5000/zeta"]
        );
    }
}
