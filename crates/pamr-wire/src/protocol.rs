//! Application messages carried in DATA_REQUEST / DATA_REPLY payloads.
//!
//! The envelope is a MessagePack-encoded enum. Object arguments and results
//! travel as nested object streams so the receiver can resolve their
//! classes against the sender.

use pamr_codec::{CodecResult, Value};
use serde::{Deserialize, Serialize};
use url::Url;

/// Request envelope as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteRequest {
    /// Call the object bound at `uri`. `argument` is an object stream.
    Invoke { uri: String, argument: Vec<u8> },
    /// Is anything bound at `uri`?
    Lookup { uri: String },
    /// URIs bound on the receiving agent.
    List,
    /// Class bytes of `name` from the receiver's catalog.
    FetchClass { name: String },
}

/// Reply envelope as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteReply {
    /// Result of an invocation, as an object stream. `None` is void.
    Invoked(Option<Vec<u8>>),
    Found(bool),
    Listed(Vec<String>),
    Class(Vec<u8>),
    /// The request could not be served.
    Failure(String),
}

impl RemoteRequest {
    pub fn to_bytes(&self) -> CodecResult<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl RemoteReply {
    pub fn to_bytes(&self) -> CodecResult<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// A request after its argument stream has been decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Invoke { uri: Url, argument: Value },
    Lookup { uri: Url },
    List,
    FetchClass { name: String },
}

/// A reply before its result is encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Invoked(Option<Value>),
    Found(bool),
    Listed(Vec<Url>),
    Class(Vec<u8>),
    Failure(String),
}

impl Request {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Invoke { .. } => "invoke",
            Request::Lookup { .. } => "lookup",
            Request::List => "list",
            Request::FetchClass { .. } => "fetch_class",
        }
    }
}
