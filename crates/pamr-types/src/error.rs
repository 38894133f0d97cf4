//! Top-level error type for the PAMR subsystem.

use crate::id::AgentId;
use thiserror::Error;

/// Errors surfaced to PAMR callers.
///
/// The routing variants (see [`PamrError::is_routing`]) mean the message
/// never got a reply because the tunnel could not deliver it. They are kept
/// apart from class resolution and remote execution failures so callers can
/// decide whether a retry makes sense.
#[derive(Error, Debug)]
pub enum PamrError {
    /// The router has never heard of the recipient.
    #[error("Unknown recipient: agent {0}")]
    UnknownRecipient(AgentId),

    /// The recipient is known to the router but has no live tunnel.
    #[error("Recipient not connected: agent {0}")]
    RecipientNotConnected(AgentId),

    /// The remote agent disconnected while a reply was pending.
    #[error("Remote agent {0} disconnected")]
    RemoteDisconnected(AgentId),

    /// The local tunnel to the router broke.
    #[error("Tunnel failure: {0}")]
    TunnelFailure(String),

    /// No tunnel is currently established.
    #[error("Not connected to the router: {0}")]
    NotConnected(String),

    /// No reply arrived within the response timeout.
    #[error("No reply from agent {agent} after {timeout_ms} ms")]
    Timeout {
        /// Agent the request was addressed to.
        agent: AgentId,
        /// Configured response timeout.
        timeout_ms: u64,
    },

    /// The router reported a corrupted copy of one of our messages.
    #[error("Message {msg_id} was corrupted in transit")]
    Corrupted {
        /// Correlation id of the damaged message.
        msg_id: u64,
    },

    /// A class could not be resolved locally nor fetched from its origin.
    #[error("Class '{class}' not found (origin tried: {origin})")]
    ClassNotFound {
        /// Name of the class.
        class: String,
        /// Origin URL that was asked for the definition.
        origin: String,
    },

    /// Any other object-stream encoding or decoding problem.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The remote side failed to execute the request.
    #[error("Remote execution failed: {0}")]
    Execution(String),

    /// The registry already holds a binding for this URI.
    #[error("Already bound: {0}")]
    AlreadyBound(String),

    /// No binding exists for this URI.
    #[error("Not bound: {0}")]
    NotBound(String),

    /// A URI that does not denote a PAMR object.
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// The router refused to register this agent.
    #[error("Registration refused: {0}")]
    RegistrationRefused(String),

    /// The message does not fit in one frame. Nothing was sent.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// An operation that makes no sense in the current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The agent was shut down.
    #[error("Agent is shut down")]
    Shutdown,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PamrError {
    /// Whether this error means the tunnel could not deliver the message.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            PamrError::UnknownRecipient(_)
                | PamrError::RecipientNotConnected(_)
                | PamrError::RemoteDisconnected(_)
                | PamrError::TunnelFailure(_)
                | PamrError::NotConnected(_)
                | PamrError::Timeout { .. }
                | PamrError::Corrupted { .. }
        )
    }
}

/// Alias for Result with PamrError.
pub type PamrResult<T> = Result<T, PamrError>;
