use std::error::Error as StdError;

use driver_protocol::{Destination, ErrorKind, ProtocolError};
use thiserror::Error;
use transport::TransportError;
use transport_fabric::FabricError;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client construction failed while {stage}: {source}")]
    Construction {
        stage: &'static str,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error("invalid client configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("session {session_id} already in use on {destination} stream {stream_id}")]
    SessionConflict {
        destination: Destination,
        stream_id: i32,
        session_id: i32,
    },

    #[error("no free session id on {destination} stream {stream_id} after {attempts} attempts")]
    AllocationExhausted {
        destination: Destination,
        stream_id: i32,
        attempts: usize,
    },

    #[error("admin command buffer full")]
    BufferFull,

    #[error("destination {destination:?} rejected: {detail}")]
    InvalidDestination {
        destination: Option<Destination>,
        detail: String,
    },

    #[error("driver reported {kind} for {destination:?}: {detail}")]
    Driver {
        kind: ErrorKind,
        destination: Option<Destination>,
        detail: String,
    },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("fabric error: {0}")]
    Fabric(#[from] FabricError),

    #[error("client is closed")]
    Closed,
}

impl ClientError {
    pub(crate) fn construction<E>(stage: &'static str, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        ClientError::Construction {
            stage,
            source: source.into(),
        }
    }
}
