//! The admin coordinator: the single owner of registry mutation and of the
//! driver rings.
//!
//! Each duty cycle:
//! 1. Flush commands the driver ring refused earlier. While any remain, no new
//!    admin commands are taken, so back-pressure reaches the callers as delayed
//!    confirmation.
//! 2. Apply up to `command_budget` admin commands: register or remove
//!    endpoints and forward the command to the driver.
//! 3. Apply up to `response_budget` driver responses: confirm endpoints or
//!    fail them through the error dispatch.
//!
//! The two drain phases are independent and both run every cycle, so a busy
//! command ring cannot starve driver responses and vice versa.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver as HandoffReceiver;
use driver_protocol::{
    encode_command, AdminCodec, AdminCommand, DriverResponse, ErrorKind, ErrorNotification,
    ResponseCodec,
};
use serde::{Deserialize, Serialize};
use transport::AtomicArray;
use transport_fabric::{Agent, Encoded, RingConsumer, RingProducer, SubmitOutcome};

use crate::dispatch::ErrorDispatch;
use crate::endpoint::{Channel, ConsumerChannel, EndpointState};
use crate::error::ClientError;
use crate::producer_control::{DefaultProducerControl, ProducerControl, ProducerControlFactory};
use crate::proxy::Registration;

/// Point-in-time copy of the coordinator counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub duty_cycles: u64,
    pub commands_applied: u64,
    pub commands_forwarded: u64,
    pub responses_applied: u64,
    pub malformed_frames: u64,
    pub unknown_correlations: u64,
    pub driver_back_pressure: u64,
    pub async_errors: u64,
}

#[derive(Debug, Default)]
pub(crate) struct CoordinatorCounters {
    duty_cycles: AtomicU64,
    commands_applied: AtomicU64,
    commands_forwarded: AtomicU64,
    responses_applied: AtomicU64,
    malformed_frames: AtomicU64,
    unknown_correlations: AtomicU64,
    driver_back_pressure: AtomicU64,
    async_errors: AtomicU64,
}

impl CoordinatorCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CoordinatorStats {
        CoordinatorStats {
            duty_cycles: self.duty_cycles.load(Ordering::Relaxed),
            commands_applied: self.commands_applied.load(Ordering::Relaxed),
            commands_forwarded: self.commands_forwarded.load(Ordering::Relaxed),
            responses_applied: self.responses_applied.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            unknown_correlations: self.unknown_correlations.load(Ordering::Relaxed),
            driver_back_pressure: self.driver_back_pressure.load(Ordering::Relaxed),
            async_errors: self.async_errors.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct CoordinatorParts {
    pub commands: RingConsumer,
    pub to_driver: RingProducer,
    pub from_driver: RingConsumer,
    pub handoff: HandoffReceiver<Registration>,
    pub channels: Arc<AtomicArray<Channel>>,
    pub receivers: Arc<AtomicArray<ConsumerChannel>>,
    pub dispatch: ErrorDispatch,
    pub producer_control: ProducerControlFactory,
    pub counters: Arc<CoordinatorCounters>,
    pub command_budget: usize,
    pub response_budget: usize,
}

pub(crate) struct AdminCoordinator {
    commands: RingConsumer,
    to_driver: RingProducer,
    from_driver: RingConsumer,
    handoff: HandoffReceiver<Registration>,
    pending: HashMap<i64, Registration>,
    backlog: VecDeque<(i64, Encoded)>,
    channels: Arc<AtomicArray<Channel>>,
    receivers: Arc<AtomicArray<ConsumerChannel>>,
    dispatch: ErrorDispatch,
    producer_control: ProducerControlFactory,
    counters: Arc<CoordinatorCounters>,
    command_budget: usize,
    response_budget: usize,
}

impl AdminCoordinator {
    pub(crate) fn new(parts: CoordinatorParts) -> Self {
        Self {
            commands: parts.commands,
            to_driver: parts.to_driver,
            from_driver: parts.from_driver,
            handoff: parts.handoff,
            pending: HashMap::new(),
            backlog: VecDeque::new(),
            channels: parts.channels,
            receivers: parts.receivers,
            dispatch: parts.dispatch,
            producer_control: parts.producer_control,
            counters: parts.counters,
            command_budget: parts.command_budget,
            response_budget: parts.response_budget,
        }
    }

    pub(crate) fn duty_cycle(&mut self) -> usize {
        CoordinatorCounters::bump(&self.counters.duty_cycles);

        let mut work = self.flush_backlog();
        if self.backlog.is_empty() {
            work += self.process_commands();
        }
        work += self.process_responses();
        self.sweep_abandoned();
        work
    }

    fn collect_handoffs(&mut self) {
        while let Ok(registration) = self.handoff.try_recv() {
            self.pending
                .insert(registration.registration_id(), registration);
        }
    }

    fn sweep_abandoned(&mut self) {
        self.collect_handoffs();
        self.pending.retain(|id, registration| {
            let abandoned = registration.is_abandoned();
            if abandoned {
                tracing::debug!(registration_id = id, "dropping abandoned registration");
            }
            !abandoned
        });
    }

    fn process_commands(&mut self) -> usize {
        let frames = self
            .commands
            .drain_decoded(&AdminCodec, self.command_budget);
        if frames.is_empty() {
            return 0;
        }

        // Every frame read above had its endpoint handed off before it was written.
        self.collect_handoffs();
        let work = frames.len();
        for frame in frames {
            match frame {
                Ok(command) => self.apply_command(command),
                Err(err) => {
                    CoordinatorCounters::bump(&self.counters.malformed_frames);
                    tracing::warn!(%err, "dropping malformed admin command");
                }
            }
        }
        work
    }

    fn apply_command(&mut self, command: AdminCommand) {
        match &command {
            AdminCommand::AddChannel(msg) => {
                let Some(channel) = self.take_pending_channel(msg.correlation_id) else {
                    return;
                };
                if self.channels.any(|live| live.conflicts_with(&channel)) {
                    self.reject_conflict(&channel);
                    return;
                }
                self.channels.add(Arc::clone(&channel));
                tracing::debug!(
                    registration_id = msg.correlation_id,
                    destination = %msg.destination,
                    stream_id = msg.stream_id,
                    session_id = msg.session_id,
                    "channel registered"
                );
            }
            AdminCommand::RemoveChannel(msg) => {
                let id = msg.correlation_id;
                let removed = self.channels.remove_where(|c| c.registration_id() == id);
                if removed.is_empty() {
                    tracing::debug!(registration_id = id, "channel already removed");
                    return;
                }
                for channel in &removed {
                    channel.state.close();
                }
                tracing::debug!(registration_id = id, "channel closed");
            }
            AdminCommand::AddReceiver(msg) => {
                let Some(receiver) = self.take_pending_receiver(msg.correlation_id) else {
                    return;
                };
                self.receivers.add(receiver);
                tracing::debug!(
                    registration_id = msg.correlation_id,
                    destination = %msg.destination,
                    streams = ?msg.streams,
                    "receiver registered"
                );
            }
            AdminCommand::RemoveReceiver(msg) => {
                let id = msg.correlation_id;
                let removed = self.receivers.remove_where(|r| r.registration_id() == id);
                if removed.is_empty() {
                    tracing::debug!(registration_id = id, "receiver already removed");
                    return;
                }
                for receiver in &removed {
                    receiver.state.close();
                }
                tracing::debug!(registration_id = id, "receiver closed");
            }
        }

        CoordinatorCounters::bump(&self.counters.commands_applied);
        self.forward(&command);
    }

    fn take_pending_channel(&mut self, id: i64) -> Option<Arc<Channel>> {
        match self.pending.remove(&id) {
            Some(Registration::Channel(channel)) if !channel.state().is_closed() => Some(channel),
            Some(Registration::Channel(_)) => {
                tracing::debug!(registration_id = id, "channel abandoned before apply");
                None
            }
            _ => {
                self.unknown_registration(id);
                None
            }
        }
    }

    fn take_pending_receiver(&mut self, id: i64) -> Option<Arc<ConsumerChannel>> {
        match self.pending.remove(&id) {
            Some(Registration::Receiver(receiver)) if !receiver.state().is_closed() => {
                Some(receiver)
            }
            Some(Registration::Receiver(_)) => {
                tracing::debug!(registration_id = id, "receiver abandoned before apply");
                None
            }
            _ => {
                self.unknown_registration(id);
                None
            }
        }
    }

    fn unknown_registration(&self, id: i64) {
        CoordinatorCounters::bump(&self.counters.unknown_correlations);
        tracing::warn!(registration_id = id, "admin command without matching endpoint");
    }

    fn reject_conflict(&self, channel: &Arc<Channel>) {
        channel.state.begin_erroring();
        tracing::debug!(
            registration_id = channel.registration_id(),
            session_id = channel.session_id(),
            "session conflict detected at apply"
        );
        self.dispatch.error(&ClientError::SessionConflict {
            destination: channel.destination().clone(),
            stream_id: channel.stream_id(),
            session_id: channel.session_id(),
        });
        channel.state.close();
        CoordinatorCounters::bump(&self.counters.async_errors);
    }

    fn forward(&mut self, command: &AdminCommand) {
        let id = command.correlation_id();
        let encoded = match encode_command(command) {
            Ok(encoded) => encoded,
            Err(err) => {
                self.fail_forward(id, ClientError::Protocol(err));
                return;
            }
        };

        if !self.backlog.is_empty() {
            self.backlog.push_back((id, encoded));
            return;
        }
        match self.to_driver.offer(encoded.msg_type_id, &encoded.payload) {
            Ok(SubmitOutcome::Accepted) => {
                CoordinatorCounters::bump(&self.counters.commands_forwarded);
                tracing::trace!(msg_type_id = encoded.msg_type_id, "forwarded to driver");
            }
            Ok(SubmitOutcome::WouldBlock) => {
                CoordinatorCounters::bump(&self.counters.driver_back_pressure);
                tracing::warn!("driver ring full, deferring command");
                self.backlog.push_back((id, encoded));
            }
            Err(err) => self.fail_forward(id, ClientError::Fabric(err)),
        }
    }

    fn flush_backlog(&mut self) -> usize {
        let mut flushed = 0;
        while let Some((id, encoded)) = self.backlog.front() {
            let id = *id;
            match self.to_driver.offer(encoded.msg_type_id, &encoded.payload) {
                Ok(SubmitOutcome::Accepted) => {
                    CoordinatorCounters::bump(&self.counters.commands_forwarded);
                    self.backlog.pop_front();
                    flushed += 1;
                }
                Ok(SubmitOutcome::WouldBlock) => {
                    CoordinatorCounters::bump(&self.counters.driver_back_pressure);
                    break;
                }
                Err(err) => {
                    self.backlog.pop_front();
                    self.fail_forward(id, ClientError::Fabric(err));
                }
            }
        }
        flushed
    }

    /// A command the driver will never see cannot be answered, so the
    /// endpoint it registered fails here instead of waiting in `Requested`.
    fn fail_forward(&mut self, id: i64, error: ClientError) {
        tracing::error!(registration_id = id, %error, "command could not reach the driver");
        let channel = self
            .channels
            .find(|c| c.registration_id() == id)
            .filter(|c| c.state.begin_erroring());
        let receiver = self
            .receivers
            .find(|r| r.registration_id() == id)
            .filter(|r| r.state.begin_erroring());

        self.dispatch.error(&error);
        CoordinatorCounters::bump(&self.counters.async_errors);

        if let Some(channel) = channel {
            self.channels.remove(&channel);
            channel.state.close();
            tracing::debug!(registration_id = id, "channel failed");
        }
        if let Some(receiver) = receiver {
            self.receivers.remove(&receiver);
            receiver.state.close();
            tracing::debug!(registration_id = id, "receiver failed");
        }
    }

    fn process_responses(&mut self) -> usize {
        let responses = self
            .from_driver
            .drain_decoded(&ResponseCodec, self.response_budget);
        let work = responses.len();
        for response in responses {
            match response {
                Ok(DriverResponse::Ack { correlation_id }) => self.on_ack(correlation_id),
                Ok(DriverResponse::Error(notification)) => self.on_error(notification),
                Err(err) => {
                    CoordinatorCounters::bump(&self.counters.malformed_frames);
                    tracing::warn!(%err, "dropping malformed driver response");
                    continue;
                }
            }
            CoordinatorCounters::bump(&self.counters.responses_applied);
        }
        work
    }

    fn on_ack(&mut self, id: i64) {
        if let Some(channel) = self.channels.find(|c| c.registration_id() == id) {
            if channel
                .state
                .transition(EndpointState::Requested, EndpointState::Active)
            {
                let factory = &self.producer_control;
                let control = catch_unwind(AssertUnwindSafe(|| factory(channel.as_ref())))
                    .unwrap_or_else(|_| {
                        tracing::error!(
                            registration_id = id,
                            "producer control factory panicked, using the default"
                        );
                        Arc::new(DefaultProducerControl::default()) as Arc<dyn ProducerControl>
                    });
                let _ = channel.producer_control.set(control);
                tracing::debug!(registration_id = id, "channel active");
            }
        } else if let Some(receiver) = self.receivers.find(|r| r.registration_id() == id) {
            if receiver
                .state
                .transition(EndpointState::Requested, EndpointState::Active)
            {
                tracing::debug!(registration_id = id, "receiver active");
            }
        } else {
            CoordinatorCounters::bump(&self.counters.unknown_correlations);
            tracing::trace!(registration_id = id, "ack for unknown endpoint");
        }
    }

    fn on_error(&mut self, notification: ErrorNotification) {
        let id = notification.correlation_id;
        let mut channels: Vec<Arc<Channel>> = self
            .channels
            .find(|c| c.registration_id() == id)
            .into_iter()
            .collect();
        let mut receivers: Vec<Arc<ConsumerChannel>> = self
            .receivers
            .find(|r| r.registration_id() == id)
            .into_iter()
            .collect();

        if channels.is_empty() && receivers.is_empty() {
            if let (ErrorKind::InvalidDestination, Some(destination)) =
                (notification.kind, &notification.destination)
            {
                let destination = destination.clone();
                self.channels.for_each(|c| {
                    if c.destination() == &destination {
                        channels.push(Arc::clone(c));
                    }
                });
                self.receivers.for_each(|r| {
                    if r.destination() == &destination {
                        receivers.push(Arc::clone(r));
                    }
                });
            }
        }

        channels.retain(|c| c.state.begin_erroring());
        receivers.retain(|r| r.state.begin_erroring());

        let destination = notification
            .destination
            .clone()
            .or_else(|| channels.first().map(|c| c.destination().clone()))
            .or_else(|| receivers.first().map(|r| r.destination().clone()));

        if channels.is_empty() && receivers.is_empty() {
            tracing::warn!(
                registration_id = id,
                kind = %notification.kind,
                "driver error for unknown endpoint"
            );
        }

        match (notification.kind, &destination) {
            (ErrorKind::InvalidDestination, Some(destination)) => self
                .dispatch
                .invalid_destination(destination, &notification.detail),
            (ErrorKind::SessionConflict, Some(destination)) if channels.len() == 1 => {
                self.dispatch.error(&ClientError::SessionConflict {
                    destination: destination.clone(),
                    stream_id: channels[0].stream_id(),
                    session_id: channels[0].session_id(),
                })
            }
            (kind, _) => self.dispatch.error(&ClientError::Driver {
                kind,
                destination: destination.clone(),
                detail: notification.detail.clone(),
            }),
        }
        CoordinatorCounters::bump(&self.counters.async_errors);

        for channel in channels {
            self.channels.remove(&channel);
            channel.state.close();
            tracing::debug!(registration_id = channel.registration_id(), "channel failed");
        }
        for receiver in receivers {
            self.receivers.remove(&receiver);
            receiver.state.close();
            tracing::debug!(registration_id = receiver.registration_id(), "receiver failed");
        }
    }

    fn abandon_pending(&mut self) {
        self.collect_handoffs();
        for (_, registration) in self.pending.drain() {
            registration.abandon();
        }
    }
}

impl Agent for AdminCoordinator {
    fn do_work(&mut self) -> usize {
        self.duty_cycle()
    }

    fn name(&self) -> &'static str {
        "admin-coordinator"
    }

    fn on_close(&mut self) {
        self.abandon_pending();
        let stats = self.counters.snapshot();
        tracing::debug!(?stats, "admin coordinator closed");
    }
}
