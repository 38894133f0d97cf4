//! Valves: ordered message-processing steps applied to every message in transit.
//!
//! A [`Pipeline`] is an ordered list of [`Valve`]s. Agents and routers pass
//! every message they receive through [`Pipeline::incoming`] and every
//! message they send through [`Pipeline::outgoing`]. Both directions run the
//! valves in configuration order.

use crate::message::{Message, MessageType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// A message-processing step.
///
/// Valves run on the I/O path and must not block. They are shared between
/// tasks and synchronize their own state.
pub trait Valve: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Process a message that was just received.
    fn invoke_incoming(&self, msg: Message) -> Message {
        msg
    }

    /// Process a message about to be sent.
    fn invoke_outgoing(&self, msg: Message) -> Message {
        msg
    }
}

/// Ordered chain of valves.
#[derive(Clone, Default)]
pub struct Pipeline {
    valves: Vec<Arc<dyn Valve>>,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a valve at the end of the chain.
    pub fn with(mut self, valve: Arc<dyn Valve>) -> Self {
        self.valves.push(valve);
        self
    }

    pub fn push(&mut self, valve: Arc<dyn Valve>) {
        self.valves.push(valve);
    }

    pub fn len(&self) -> usize {
        self.valves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valves.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.valves.iter().map(|v| v.name().to_string()).collect()
    }

    pub fn incoming(&self, msg: Message) -> Message {
        self.valves
            .iter()
            .fold(msg, |msg, valve| valve.invoke_incoming(msg))
    }

    pub fn outgoing(&self, msg: Message) -> Message {
        self.valves
            .iter()
            .fold(msg, |msg, valve| valve.invoke_outgoing(msg))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Logs every message at TRACE level.
pub struct TraceValve {
    label: String,
}

impl TraceValve {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Valve for TraceValve {
    fn name(&self) -> &str {
        "trace"
    }

    fn invoke_incoming(&self, msg: Message) -> Message {
        trace!(
            endpoint = %self.label,
            kind = ?msg.message_type(),
            msg_id = msg.msg_id(),
            bytes = msg.payload_len(),
            "<- received"
        );
        msg
    }

    fn invoke_outgoing(&self, msg: Message) -> Message {
        trace!(
            endpoint = %self.label,
            kind = ?msg.message_type(),
            msg_id = msg.msg_id(),
            bytes = msg.payload_len(),
            "-> sending"
        );
        msg
    }
}

/// Counters of one traffic direction.
#[derive(Debug, Default)]
pub struct DirectionStats {
    pub frames: AtomicU64,
    pub data_frames: AtomicU64,
    pub payload_bytes: AtomicU64,
}

impl DirectionStats {
    fn record(&self, msg: &Message) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        if matches!(
            msg.message_type(),
            MessageType::DataRequest | MessageType::DataReply
        ) {
            self.data_frames.fetch_add(1, Ordering::Relaxed);
            self.payload_bytes
                .fetch_add(msg.payload_len() as u64, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of [`StatsValve`] counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub data_in: u64,
    pub data_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Counts frames and payload bytes in both directions.
#[derive(Debug, Default)]
pub struct StatsValve {
    incoming: DirectionStats,
    outgoing: DirectionStats,
}

impl StatsValve {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_in: self.incoming.frames.load(Ordering::Relaxed),
            frames_out: self.outgoing.frames.load(Ordering::Relaxed),
            data_in: self.incoming.data_frames.load(Ordering::Relaxed),
            data_out: self.outgoing.data_frames.load(Ordering::Relaxed),
            bytes_in: self.incoming.payload_bytes.load(Ordering::Relaxed),
            bytes_out: self.outgoing.payload_bytes.load(Ordering::Relaxed),
        }
    }
}

impl Valve for StatsValve {
    fn name(&self) -> &str {
        "stats"
    }

    fn invoke_incoming(&self, msg: Message) -> Message {
        self.incoming.record(&msg);
        msg
    }

    fn invoke_outgoing(&self, msg: Message) -> Message {
        self.outgoing.record(&msg);
        msg
    }
}
