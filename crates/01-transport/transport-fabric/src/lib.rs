//! Ports, codecs, and duty-cycle runtime layered over the transport rings.

mod codec;
mod error;
mod port;
mod runtime;

pub use codec::{Codec, Encoded, INLINE_PAYLOAD};
pub use error::{FabricError, FabricResult};
pub use port::{
    make_port_pair, PortMetricsSnapshot, PortPair, RingConsumer, RingProducer, SubmitOutcome,
};
pub use runtime::{Agent, AgentRunner, IdleStrategy, Idler, WorkerRuntime};
