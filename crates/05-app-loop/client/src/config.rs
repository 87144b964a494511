//! Validated configuration values for clients and endpoints.

use std::fmt;
use std::sync::Arc;

use driver_protocol::{validate_streams, Destination, StreamList};
use serde::{Deserialize, Serialize};
use transport::TRAILER_LENGTH;
use transport_fabric::IdleStrategy;

use crate::dispatch::{ErrorHandler, InvalidDestinationHandler};
use crate::error::{ClientError, ClientResult};
use crate::producer_control::{default_producer_control, ProducerControlFactory};
use crate::strategy::AdminBufferStrategy;

/// Record storage of the in-process admin command ring.
pub const ADMIN_BUFFER_CAPACITY: usize = 1024;
/// Total size of the admin ring region, trailer included.
pub const ADMIN_BUFFER_LENGTH: usize = ADMIN_BUFFER_CAPACITY + TRAILER_LENGTH;
/// Record storage of each driver ring when a strategy does not say otherwise.
pub const DEFAULT_DRIVER_BUFFER_CAPACITY: usize = 64 * 1024;

/// Default number of admin commands applied per coordinator duty cycle.
pub const DEFAULT_COMMAND_BUDGET: usize = 16;
/// Default number of driver responses applied per coordinator duty cycle.
pub const DEFAULT_RESPONSE_BUDGET: usize = 32;
pub const DEFAULT_OFFER_ATTEMPTS: usize = 1024;
pub const DEFAULT_HANDOFF_CAPACITY: usize = 1024;
pub const DEFAULT_SESSION_ATTEMPTS: usize = 64;

/// Tunables of a client and its coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub command_budget: usize,
    pub response_budget: usize,
    /// Attempts an application thread makes against a full admin ring.
    pub offer_attempts: usize,
    /// Endpoints that may be in flight to the coordinator at once.
    pub handoff_capacity: usize,
    pub session_attempts: usize,
    pub idle: IdleStrategy,
    /// Start no coordinator thread; the application calls `Client::invoke`.
    pub use_invoker: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            command_budget: DEFAULT_COMMAND_BUDGET,
            response_budget: DEFAULT_RESPONSE_BUDGET,
            offer_attempts: DEFAULT_OFFER_ATTEMPTS,
            handoff_capacity: DEFAULT_HANDOFF_CAPACITY,
            session_attempts: DEFAULT_SESSION_ATTEMPTS,
            idle: IdleStrategy::default(),
            use_invoker: false,
        }
    }
}

impl ClientSettings {
    pub fn validate(&self) -> ClientResult<()> {
        if self.command_budget == 0 {
            return Err(ClientError::InvalidConfig("command_budget must be non-zero"));
        }
        if self.response_budget == 0 {
            return Err(ClientError::InvalidConfig("response_budget must be non-zero"));
        }
        if self.offer_attempts == 0 {
            return Err(ClientError::InvalidConfig("offer_attempts must be non-zero"));
        }
        if self.handoff_capacity == 0 {
            return Err(ClientError::InvalidConfig("handoff_capacity must be non-zero"));
        }
        if self.session_attempts == 0 {
            return Err(ClientError::InvalidConfig("session_attempts must be non-zero"));
        }
        Ok(())
    }
}

/// Everything a client needs at construction.
#[derive(Clone)]
pub struct ClientConfig {
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
    pub invalid_destination_handler: Option<Arc<dyn InvalidDestinationHandler>>,
    pub buffer_strategy: Arc<dyn AdminBufferStrategy>,
    pub producer_control: ProducerControlFactory,
    pub settings: ClientSettings,
}

impl ClientConfig {
    /// Config with no handlers, default producer control and default settings.
    pub fn new(buffer_strategy: Arc<dyn AdminBufferStrategy>) -> Self {
        Self {
            error_handler: None,
            invalid_destination_handler: None,
            buffer_strategy,
            producer_control: default_producer_control(),
            settings: ClientSettings::default(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("error_handler", &self.error_handler.is_some())
            .field(
                "invalid_destination_handler",
                &self.invalid_destination_handler.is_some(),
            )
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Parameters of a new source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceConfig {
    pub destination: Destination,
    pub stream_id: i32,
    /// Explicit session id; drawn at random when absent.
    pub session_id: Option<i32>,
}

impl SourceConfig {
    pub fn new(destination: Destination, stream_id: i32) -> Self {
        Self {
            destination,
            stream_id,
            session_id: None,
        }
    }

    pub fn with_session(destination: Destination, stream_id: i32, session_id: i32) -> Self {
        Self {
            destination,
            stream_id,
            session_id: Some(session_id),
        }
    }
}

/// Parameters of a new receiver. Starts empty so a configurator can fill it in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub destination: Option<Destination>,
    pub streams: StreamList,
}

impl ReceiverConfig {
    pub fn new(destination: Destination, streams: &[i32]) -> Self {
        Self {
            destination: Some(destination),
            streams: StreamList::from_slice(streams),
        }
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.destination.is_none() {
            return Err(ClientError::InvalidConfig("receiver destination is required"));
        }
        validate_streams(&self.streams)?;
        Ok(())
    }
}
