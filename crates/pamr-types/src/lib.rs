//! Core types shared by every PAMR crate.
//!
//! This crate has no I/O. It defines the identities exchanged on the wire
//! ([`AgentId`], [`RouterId`], [`MagicCookie`]), the configuration surface of
//! agents and routers, and the top-level [`PamrError`].

pub mod config;
pub mod error;
pub mod id;

pub use config::{AgentConfig, PamrConfig, RouterConfig, SocketFactoryKind, TunnelConfig};
pub use error::{PamrError, PamrResult};
pub use id::{AgentId, MagicCookie, RouterId};
