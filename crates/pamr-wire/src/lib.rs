//! PAMR: message routing between endpoints through a central router.
//!
//! Endpoints that cannot reach each other directly each keep one TCP tunnel
//! to a router, which relays framed messages between them by agent id.
//!
//! ## Architecture
//!
//! - **Router**: accepts tunnels, assigns ids, forwards and reports delivery failures
//! - **Agent**: endpoint side of a tunnel, correlates requests with replies
//! - **Dispatcher**: runs each inbound request in its own task
//! - **Registry / RemoteEndpoint**: remote objects addressed as `pamr://<agent-id>/<name>`
//! - **Valve / Pipeline**: ordered processing applied to every message in transit
//! - **SocketFactory**: how the tunnel socket is opened (plain or through a gateway)

pub mod agent;
pub mod backoff;
pub mod dispatcher;
pub mod message;
pub mod protocol;
pub mod registry;
pub mod remote;
pub mod router;
pub mod socket;
pub mod valve;

pub use agent::{Agent, AgentBuilder, InboundRequest, MessageHandler, TunnelInfo};
pub use backoff::ReconnectBackoff;
pub use dispatcher::{DispatchStats, Dispatcher, ExecutionHook};
pub use message::{ErrorCode, Message, MessageType, WireError};
pub use protocol::{RemoteReply, RemoteRequest, Reply, Request};
pub use registry::{RemoteObject, Registry};
pub use remote::{AgentClassFetcher, CallContext, RegistryExecutor, RemoteEndpoint};
pub use router::{ClientInfo, ReservedAgents, Router, ADMIN_TARGET};
pub use socket::{PlainSocketFactory, SocketFactory, TunneledSocketFactory};
pub use valve::{Pipeline, StatsValve, TraceValve, Valve};
