//! Client-side coordination with a media driver.
//!
//! Application threads create [`Source`]s and [`Receiver`]s through a
//! [`Client`]. Requests are encoded onto an admin ring and applied by a single
//! admin coordinator, which owns the endpoint registries, talks to the driver
//! over two shared-memory rings, and reports asynchronous failures through the
//! configured handlers.

mod client;
mod config;
mod coordinator;
mod dispatch;
mod endpoint;
mod error;
mod producer_control;
mod proxy;
mod session;
mod strategy;

pub use client::Client;
pub use config::{
    ClientConfig, ClientSettings, ReceiverConfig, SourceConfig, ADMIN_BUFFER_CAPACITY,
    ADMIN_BUFFER_LENGTH, DEFAULT_COMMAND_BUDGET, DEFAULT_DRIVER_BUFFER_CAPACITY,
    DEFAULT_HANDOFF_CAPACITY, DEFAULT_OFFER_ATTEMPTS, DEFAULT_RESPONSE_BUDGET,
    DEFAULT_SESSION_ATTEMPTS,
};
pub use coordinator::CoordinatorStats;
pub use dispatch::{ErrorHandler, InvalidDestinationHandler};
pub use endpoint::{Channel, ConsumerChannel, EndpointState, Receiver, Source};
pub use error::{ClientError, ClientResult};
pub use producer_control::{
    default_producer_control, DefaultProducerControl, ProducerControl, ProducerControlFactory,
    DEFAULT_WINDOW_LENGTH,
};
pub use session::SessionAllocator;
pub use strategy::{
    AdminBufferStrategy, HeapBufferStrategy, MappedBufferStrategy, TO_CLIENT_FILE, TO_DRIVER_FILE,
};

pub use driver_protocol::{Destination, ErrorKind};
