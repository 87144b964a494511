//! Endpoint records shared with the registries and the handles returned to
//! application code.
//!
//! A [`Channel`] or [`ConsumerChannel`] is created by the application thread in
//! state [`EndpointState::Requested`] and handed to the admin coordinator, which
//! owns every later transition. Handles only read the state and request
//! removal.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use driver_protocol::{ChannelMessage, Destination, ReceiverMessage, StreamList};

use crate::error::ClientResult;
use crate::producer_control::ProducerControl;
use crate::proxy::AdminProxy;

/// Lifecycle of a source or receiver.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointState {
    /// Constructed and enqueued, not yet confirmed by the driver.
    Requested = 0,
    /// Confirmed by the driver.
    Active = 1,
    /// A failure is being reported; removal follows.
    Erroring = 2,
    /// Terminal. The endpoint is no longer registered.
    Closed = 3,
}

impl EndpointState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EndpointState::Requested,
            1 => EndpointState::Active,
            2 => EndpointState::Erroring,
            _ => EndpointState::Closed,
        }
    }

    pub fn is_closed(self) -> bool {
        self == EndpointState::Closed
    }
}

pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(EndpointState::Requested as u8))
    }

    pub(crate) fn load(&self) -> EndpointState {
        EndpointState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn transition(&self, from: EndpointState, to: EndpointState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves a live endpoint to `Erroring`. Fails if it is already erroring or closed.
    pub(crate) fn begin_erroring(&self) -> bool {
        self.transition(EndpointState::Requested, EndpointState::Erroring)
            || self.transition(EndpointState::Active, EndpointState::Erroring)
    }

    pub(crate) fn close(&self) -> EndpointState {
        EndpointState::from_u8(
            self.0
                .swap(EndpointState::Closed as u8, Ordering::AcqRel),
        )
    }
}

/// Registered message producer on a destination, stream, and session.
pub struct Channel {
    registration_id: i64,
    destination: Destination,
    stream_id: i32,
    session_id: i32,
    pub(crate) state: StateCell,
    close_requested: AtomicBool,
    pub(crate) producer_control: OnceLock<Arc<dyn ProducerControl>>,
}

impl Channel {
    pub(crate) fn new(
        registration_id: i64,
        destination: Destination,
        stream_id: i32,
        session_id: i32,
    ) -> Self {
        Self {
            registration_id,
            destination,
            stream_id,
            session_id,
            state: StateCell::new(),
            close_requested: AtomicBool::new(false),
            producer_control: OnceLock::new(),
        }
    }

    /// Correlation id of the command that registered this channel.
    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn state(&self) -> EndpointState {
        self.state.load()
    }

    /// Flow-control policy, available once the driver confirmed the channel.
    pub fn producer_control(&self) -> Option<&Arc<dyn ProducerControl>> {
        self.producer_control.get()
    }

    pub fn occupies(&self, destination: &Destination, stream_id: i32, session_id: i32) -> bool {
        self.session_id == session_id
            && self.stream_id == stream_id
            && &self.destination == destination
    }

    pub(crate) fn conflicts_with(&self, other: &Channel) -> bool {
        !std::ptr::eq(self, other)
            && !self.state().is_closed()
            && self.occupies(&other.destination, other.stream_id, other.session_id)
    }

    pub(crate) fn message(&self) -> ChannelMessage {
        ChannelMessage {
            correlation_id: self.registration_id,
            destination: self.destination.clone(),
            stream_id: self.stream_id,
            session_id: self.session_id,
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("registration_id", &self.registration_id)
            .field("destination", &self.destination)
            .field("stream_id", &self.stream_id)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Registered message consumer on a destination and stream filter.
pub struct ConsumerChannel {
    registration_id: i64,
    destination: Destination,
    streams: StreamList,
    pub(crate) state: StateCell,
    close_requested: AtomicBool,
}

impl ConsumerChannel {
    pub(crate) fn new(registration_id: i64, destination: Destination, streams: StreamList) -> Self {
        Self {
            registration_id,
            destination,
            streams,
            state: StateCell::new(),
            close_requested: AtomicBool::new(false),
        }
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn streams(&self) -> &[i32] {
        &self.streams
    }

    pub fn subscribes_to(&self, stream_id: i32) -> bool {
        self.streams.contains(&stream_id)
    }

    pub fn state(&self) -> EndpointState {
        self.state.load()
    }

    pub(crate) fn message(&self) -> ReceiverMessage {
        ReceiverMessage {
            correlation_id: self.registration_id,
            destination: self.destination.clone(),
            streams: self.streams.clone(),
        }
    }
}

impl fmt::Debug for ConsumerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerChannel")
            .field("registration_id", &self.registration_id)
            .field("destination", &self.destination)
            .field("streams", &self.streams)
            .field("state", &self.state())
            .finish()
    }
}

/// Application handle to a source channel.
///
/// Dropping the handle does not close the channel; call [`Source::close`].
pub struct Source {
    channel: Arc<Channel>,
    proxy: AdminProxy,
}

impl Source {
    pub(crate) fn new(channel: Arc<Channel>, proxy: AdminProxy) -> Self {
        Self { channel, proxy }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn destination(&self) -> &Destination {
        self.channel.destination()
    }

    pub fn stream_id(&self) -> i32 {
        self.channel.stream_id()
    }

    pub fn session_id(&self) -> i32 {
        self.channel.session_id()
    }

    pub fn state(&self) -> EndpointState {
        self.channel.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == EndpointState::Active
    }

    pub fn producer_control(&self) -> Option<&Arc<dyn ProducerControl>> {
        self.channel.producer_control()
    }

    /// Requests removal and returns without waiting for it to be applied.
    ///
    /// Repeated calls, and calls on an already closed channel, are no-ops
    /// while the client is open. Once the client is closed this fails with
    /// [`crate::ClientError::Closed`].
    pub fn close(&self) -> ClientResult<()> {
        self.proxy.ensure_open()?;
        if self.channel.state().is_closed()
            || self.channel.close_requested.swap(true, Ordering::AcqRel)
        {
            return Ok(());
        }
        let result = self.proxy.remove_channel(&self.channel);
        if result.is_err() {
            self.channel.close_requested.store(false, Ordering::Release);
        }
        result
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Source").field(&self.channel).finish()
    }
}

/// Application handle to a receiver.
///
/// Dropping the handle does not close the receiver; call [`Receiver::close`].
pub struct Receiver {
    consumer: Arc<ConsumerChannel>,
    proxy: AdminProxy,
}

impl Receiver {
    pub(crate) fn new(consumer: Arc<ConsumerChannel>, proxy: AdminProxy) -> Self {
        Self { consumer, proxy }
    }

    pub fn consumer(&self) -> &Arc<ConsumerChannel> {
        &self.consumer
    }

    pub fn destination(&self) -> &Destination {
        self.consumer.destination()
    }

    pub fn streams(&self) -> &[i32] {
        self.consumer.streams()
    }

    pub fn state(&self) -> EndpointState {
        self.consumer.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == EndpointState::Active
    }

    pub fn close(&self) -> ClientResult<()> {
        self.proxy.ensure_open()?;
        if self.consumer.state().is_closed()
            || self.consumer.close_requested.swap(true, Ordering::AcqRel)
        {
            return Ok(());
        }
        let result = self.proxy.remove_receiver(&self.consumer);
        if result.is_err() {
            self.consumer
                .close_requested
                .store(false, Ordering::Release);
        }
        result
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Receiver").field(&self.consumer).finish()
    }
}
