//! In-process media driver speaking the admin wire protocol.
//!
//! Attaches to the regions of an [`AdminBufferStrategy`], reads client commands
//! from the to-driver ring and answers on the to-client ring. Channel keys are
//! tracked driver-side, so a second registration of an active
//! `(destination, stream, session)` is refused with a session conflict even if
//! the client never saw the first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Context;
use client::AdminBufferStrategy;
use driver_protocol::{
    AdminCodec, AdminCommand, ChannelMessage, Destination, DriverResponse, ErrorKind,
    ErrorNotification, ReceiverMessage, ResponseCodec,
};
use parking_lot::Mutex;
use transport::ManyToOneRingBuffer;
use transport_fabric::{Agent, RingConsumer, RingProducer, SubmitOutcome};

const DEFAULT_COMMAND_BUDGET: usize = 32;

type ChannelKey = (Destination, i32, i32);

#[derive(Debug, Default)]
struct DriverState {
    received: Vec<AdminCommand>,
    rejected: HashSet<Destination>,
    channels: HashMap<ChannelKey, i64>,
    receivers: HashMap<i64, ReceiverMessage>,
    holding: bool,
}

/// Shared view of a [`MockMediaDriver`], usable while the driver runs on its
/// own thread.
#[derive(Clone, Debug, Default)]
pub struct MockDriverHandle {
    state: Arc<Mutex<DriverState>>,
}

impl MockDriverHandle {
    /// Answers later registrations on `destination` with `InvalidDestination`.
    pub fn reject(&self, destination: Destination) {
        self.state.lock().rejected.insert(destination);
    }

    pub fn accept(&self, destination: &Destination) {
        self.state.lock().rejected.remove(destination);
    }

    /// While holding, commands are still read and recorded but not answered.
    pub fn hold_responses(&self, holding: bool) {
        self.state.lock().holding = holding;
    }

    /// Every command decoded so far, in arrival order.
    pub fn received(&self) -> Vec<AdminCommand> {
        self.state.lock().received.clone()
    }

    pub fn active_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn active_receivers(&self) -> usize {
        self.state.lock().receivers.len()
    }

    pub fn has_channel(&self, destination: &Destination, stream_id: i32, session_id: i32) -> bool {
        self.state
            .lock()
            .channels
            .contains_key(&(destination.clone(), stream_id, session_id))
    }
}

pub struct MockMediaDriver {
    commands: RingConsumer,
    responses: RingProducer,
    unsent: VecDeque<DriverResponse>,
    handle: MockDriverHandle,
    command_budget: usize,
}

impl MockMediaDriver {
    /// Attaches to both driver rings. The strategy must hand out the same
    /// regions the client uses, as `HeapBufferStrategy` does.
    pub fn attach(strategy: &dyn AdminBufferStrategy) -> anyhow::Result<Self> {
        let to_driver = strategy
            .to_driver()
            .context("to-driver region unavailable")?;
        let to_client = strategy
            .to_client()
            .context("to-client region unavailable")?;

        let commands = RingConsumer::new(Arc::new(
            ManyToOneRingBuffer::new(to_driver).context("attaching to-driver ring")?,
        ))
        .context("claiming to-driver ring")?;
        let responses = RingProducer::new(Arc::new(
            ManyToOneRingBuffer::new(to_client).context("attaching to-client ring")?,
        ));

        Ok(Self {
            commands,
            responses,
            unsent: VecDeque::new(),
            handle: MockDriverHandle::default(),
            command_budget: DEFAULT_COMMAND_BUDGET,
        })
    }

    pub fn handle(&self) -> MockDriverHandle {
        self.handle.clone()
    }

    /// Ring the driver answers on; tests use it to inject raw frames.
    pub fn response_ring(&self) -> &Arc<ManyToOneRingBuffer> {
        self.responses.ring()
    }

    /// One pass over pending answers and new commands.
    pub fn step(&mut self) -> usize {
        let mut work = self.flush();
        if !self.unsent.is_empty() {
            return work;
        }

        let frames = self.commands.drain_decoded(&AdminCodec, self.command_budget);
        work += frames.len();
        for frame in frames {
            match frame {
                Ok(command) => self.apply(command),
                Err(err) => tracing::warn!(%err, "mock driver dropped malformed command"),
            }
        }
        work + self.flush()
    }

    fn apply(&mut self, command: AdminCommand) {
        let response = {
            let mut state = self.handle.state.lock();
            state.received.push(command.clone());
            let response = match command {
                AdminCommand::AddChannel(msg) => add_channel(&mut state, msg),
                AdminCommand::AddReceiver(msg) => add_receiver(&mut state, msg),
                AdminCommand::RemoveChannel(msg) => {
                    let key = (msg.destination, msg.stream_id, msg.session_id);
                    if state.channels.get(&key) == Some(&msg.correlation_id) {
                        state.channels.remove(&key);
                    }
                    None
                }
                AdminCommand::RemoveReceiver(msg) => {
                    state.receivers.remove(&msg.correlation_id);
                    None
                }
            };
            if state.holding {
                None
            } else {
                response
            }
        };
        if let Some(response) = response {
            self.unsent.push_back(response);
        }
    }

    fn flush(&mut self) -> usize {
        let mut sent = 0;
        while let Some(response) = self.unsent.front() {
            match self.responses.send(&ResponseCodec, response) {
                Ok(SubmitOutcome::Accepted) => {
                    self.unsent.pop_front();
                    sent += 1;
                }
                Ok(SubmitOutcome::WouldBlock) => break,
                Err(err) => {
                    tracing::warn!(%err, "mock driver failed to send response");
                    self.unsent.pop_front();
                }
            }
        }
        sent
    }
}

fn add_channel(state: &mut DriverState, msg: ChannelMessage) -> Option<DriverResponse> {
    let id = msg.correlation_id;
    if state.rejected.contains(&msg.destination) {
        return Some(rejection(id, msg.destination));
    }
    let key = (msg.destination.clone(), msg.stream_id, msg.session_id);
    if state.channels.contains_key(&key) {
        return Some(DriverResponse::Error(ErrorNotification {
            correlation_id: id,
            kind: ErrorKind::SessionConflict,
            destination: Some(msg.destination),
            detail: format!("session {} already active", msg.session_id),
        }));
    }
    state.channels.insert(key, id);
    Some(DriverResponse::Ack { correlation_id: id })
}

fn add_receiver(state: &mut DriverState, msg: ReceiverMessage) -> Option<DriverResponse> {
    let id = msg.correlation_id;
    if state.rejected.contains(&msg.destination) {
        return Some(rejection(id, msg.destination));
    }
    state.receivers.insert(id, msg);
    Some(DriverResponse::Ack { correlation_id: id })
}

fn rejection(correlation_id: i64, destination: Destination) -> DriverResponse {
    DriverResponse::Error(ErrorNotification {
        correlation_id,
        kind: ErrorKind::InvalidDestination,
        detail: format!("{destination} is unreachable"),
        destination: Some(destination),
    })
}

impl Agent for MockMediaDriver {
    fn do_work(&mut self) -> usize {
        self.step()
    }

    fn name(&self) -> &'static str {
        "mock-media-driver"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use client::HeapBufferStrategy;
    use driver_protocol::{decode_response, encode_command};

    fn dest(s: &str) -> Destination {
        Destination::new(s).unwrap()
    }

    struct ClientEnd {
        to_driver: ManyToOneRingBuffer,
        to_client: ManyToOneRingBuffer,
    }

    impl ClientEnd {
        fn new(strategy: &HeapBufferStrategy) -> Self {
            Self {
                to_driver: ManyToOneRingBuffer::new(strategy.to_driver().unwrap()).unwrap(),
                to_client: ManyToOneRingBuffer::new(strategy.to_client().unwrap()).unwrap(),
            }
        }

        fn send(&self, command: AdminCommand) {
            let encoded = encode_command(&command).unwrap();
            self.to_driver
                .try_write(encoded.msg_type_id, &encoded.payload)
                .unwrap();
        }

        fn responses(&self) -> Vec<DriverResponse> {
            let mut out = Vec::new();
            self.to_client.read(64, |msg_type_id, payload| {
                out.push(decode_response(msg_type_id, payload).unwrap());
            });
            out
        }
    }

    fn add(id: i64, destination: &Destination, session_id: i32) -> AdminCommand {
        AdminCommand::AddChannel(ChannelMessage {
            correlation_id: id,
            destination: destination.clone(),
            stream_id: 1,
            session_id,
        })
    }

    fn setup() -> (MockMediaDriver, ClientEnd) {
        let strategy = HeapBufferStrategy::new(4096).unwrap();
        let driver = MockMediaDriver::attach(&strategy).unwrap();
        (driver, ClientEnd::new(&strategy))
    }

    #[test]
    fn acks_new_channels_and_refuses_duplicates() {
        let (mut driver, client) = setup();
        let a = dest("udp://a:1");
        client.send(add(1, &a, 10));
        client.send(add(2, &a, 10));
        client.send(add(3, &a, 11));
        driver.step();

        let responses = client.responses();
        assert_eq!(responses[0], DriverResponse::Ack { correlation_id: 1 });
        assert!(matches!(
            &responses[1],
            DriverResponse::Error(n) if n.kind == ErrorKind::SessionConflict && n.correlation_id == 2
        ));
        assert_eq!(responses[2], DriverResponse::Ack { correlation_id: 3 });
        assert_eq!(driver.handle().active_channels(), 2);
    }

    #[test]
    fn rejected_destination_and_silent_removal() {
        let (mut driver, client) = setup();
        let handle = driver.handle();
        let bad = dest("udp://bad:1");
        handle.reject(bad.clone());

        client.send(add(1, &bad, 1));
        client.send(AdminCommand::RemoveChannel(ChannelMessage {
            correlation_id: 1,
            destination: bad.clone(),
            stream_id: 1,
            session_id: 1,
        }));
        driver.step();

        let responses = client.responses();
        assert_eq!(responses.len(), 1, "removal is not answered");
        assert!(matches!(
            &responses[0],
            DriverResponse::Error(n)
                if n.kind == ErrorKind::InvalidDestination && n.destination.as_ref() == Some(&bad)
        ));
        assert_eq!(handle.received().len(), 2);
        assert_eq!(handle.active_channels(), 0);
    }

    #[test]
    fn holding_suppresses_answers() {
        let (mut driver, client) = setup();
        let handle = driver.handle();
        handle.hold_responses(true);
        client.send(add(1, &dest("udp://a:1"), 1));
        driver.step();
        assert!(client.responses().is_empty());
        assert!(handle.has_channel(&dest("udp://a:1"), 1, 1));
    }
}
