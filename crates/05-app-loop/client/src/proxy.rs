//! Application-thread side of the admin protocol.
//!
//! Registrations travel in two parts: the endpoint `Arc` goes through a
//! bounded handoff channel, then the encoded command goes through the admin
//! ring. The handoff is always sent first, so by the time the coordinator reads
//! a command its endpoint is already waiting in the handoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use driver_protocol::{encode_command, AdminCommand};
use transport::ManyToOneRingBuffer;
use transport_fabric::{Encoded, FabricError, RingProducer};

use crate::endpoint::{Channel, ConsumerChannel};
use crate::error::{ClientError, ClientResult};

/// Endpoint awaiting its command on the coordinator side.
#[derive(Clone)]
pub(crate) enum Registration {
    Channel(Arc<Channel>),
    Receiver(Arc<ConsumerChannel>),
}

impl Registration {
    pub(crate) fn registration_id(&self) -> i64 {
        match self {
            Registration::Channel(channel) => channel.registration_id(),
            Registration::Receiver(receiver) => receiver.registration_id(),
        }
    }

    /// True once the application gave up on the registration.
    pub(crate) fn is_abandoned(&self) -> bool {
        match self {
            Registration::Channel(channel) => channel.state().is_closed(),
            Registration::Receiver(receiver) => receiver.state().is_closed(),
        }
    }

    pub(crate) fn abandon(&self) {
        match self {
            Registration::Channel(channel) => {
                channel.state.close();
            }
            Registration::Receiver(receiver) => {
                receiver.state.close();
            }
        }
    }
}

#[derive(Clone)]
pub(crate) struct AdminProxy {
    commands: RingProducer,
    handoff: Sender<Registration>,
    correlation: Arc<ManyToOneRingBuffer>,
    offer_attempts: usize,
    closed: Arc<AtomicBool>,
}

impl AdminProxy {
    pub(crate) fn new(
        commands: RingProducer,
        handoff: Sender<Registration>,
        correlation: Arc<ManyToOneRingBuffer>,
        offer_attempts: usize,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            commands,
            handoff,
            correlation,
            offer_attempts,
            closed,
        }
    }

    /// Draws from the driver ring's counter so ids stay unique across clients.
    pub(crate) fn next_correlation_id(&self) -> i64 {
        self.correlation.next_correlation_id()
    }

    pub(crate) fn add_channel(&self, channel: &Arc<Channel>) -> ClientResult<()> {
        let encoded = encode_command(&AdminCommand::AddChannel(channel.message()))?;
        self.register(Registration::Channel(Arc::clone(channel)), &encoded)
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) -> ClientResult<()> {
        self.ensure_open()?;
        let encoded = encode_command(&AdminCommand::RemoveChannel(channel.message()))?;
        self.offer(&encoded)
    }

    pub(crate) fn add_receiver(&self, receiver: &Arc<ConsumerChannel>) -> ClientResult<()> {
        let encoded = encode_command(&AdminCommand::AddReceiver(receiver.message()))?;
        self.register(Registration::Receiver(Arc::clone(receiver)), &encoded)
    }

    pub(crate) fn remove_receiver(&self, receiver: &ConsumerChannel) -> ClientResult<()> {
        self.ensure_open()?;
        let encoded = encode_command(&AdminCommand::RemoveReceiver(receiver.message()))?;
        self.offer(&encoded)
    }

    fn register(&self, registration: Registration, encoded: &Encoded) -> ClientResult<()> {
        self.ensure_open()?;
        let id = registration.registration_id();
        self.handoff
            .try_send(registration.clone())
            .map_err(|err| match err {
                TrySendError::Full(_) => ClientError::BufferFull,
                TrySendError::Disconnected(_) => ClientError::Closed,
            })?;

        if let Err(err) = self.offer(encoded) {
            tracing::warn!(registration_id = id, %err, "abandoning registration");
            registration.abandon();
            return Err(err);
        }
        tracing::trace!(registration_id = id, "registration enqueued");
        Ok(())
    }

    fn offer(&self, encoded: &Encoded) -> ClientResult<()> {
        self.commands
            .offer_with_retry(encoded.msg_type_id, &encoded.payload, self.offer_attempts)
            .map_err(|err| match err {
                FabricError::BackPressured { .. } => ClientError::BufferFull,
                other => other.into(),
            })
    }

    pub(crate) fn ensure_open(&self) -> ClientResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }
}
