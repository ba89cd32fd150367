//! Per-session orchestrator core.
//!
//! Data flow for one call:
//! socket -> `protocol` (decode) -> inbound `queue` -> `orchestrator`
//! (dispatch) -> `turn` (produce) -> outbound `queue` -> `transport` writer
//! -> socket. Cancellation originates in the orchestrator and fans out to the
//! turn handler and the outbound queue atomically through the gate.

pub mod keepalive;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod producer;
pub mod protocol;
pub mod queue;
pub mod slots;
pub mod speech;
pub mod transport;
pub mod turn;

// Re-export the session-facing types for convenient access
pub use metrics::{CompositeMetrics, GLOBAL_PROM, Metrics, MetricsSink};
pub use orchestrator::Orchestrator;
pub use producer::{ProducerReply, ScriptedProducer, TurnContext, TurnProducer};
pub use protocol::{InboundEvent, OutboundEvent, TranscriptUtterance};
pub use queue::BoundedQueue;
pub use transport::{
    FrameSink, FrameSource, Gate, InboundItem, InboundQueue, OutboundEnvelope, OutboundQueue,
    WriterParams, socket_reader, socket_writer,
};
