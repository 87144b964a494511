use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use client::{Client, ClientConfig, ClientError, ClientSettings, Destination, HeapBufferStrategy};
use crossbeam_channel::{unbounded, Receiver};
use mock_driver::{MockDriverHandle, MockMediaDriver};
use transport_fabric::{AgentRunner, IdleStrategy};

const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Asynchronous notifications observed through the client's handlers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    SessionConflict { stream_id: i32, session_id: i32 },
    InvalidDestination(Destination),
    Other(String),
}

/// A threaded client wired to a mock driver running on its own agent thread.
pub struct Harness {
    pub client: Client,
    pub driver: MockDriverHandle,
    pub events: Receiver<Event>,
    pub strategy: HeapBufferStrategy,
    _driver_thread: AgentRunner,
}

impl Harness {
    pub fn start() -> Self {
        Self::with_capacity(64 * 1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(capacity, |_| {})
    }

    pub fn build(capacity: usize, prepare: impl FnOnce(&MockDriverHandle)) -> Self {
        let strategy = HeapBufferStrategy::new(capacity).expect("strategy");
        let driver = MockMediaDriver::attach(&strategy).expect("attach mock driver");
        let handle = driver.handle();
        prepare(&handle);
        let driver_thread =
            AgentRunner::start(driver, IdleStrategy::Yield).expect("start mock driver");

        let (config, events) = observed_config(strategy.clone(), ClientSettings {
            idle: IdleStrategy::Yield,
            ..ClientSettings::default()
        });
        let client = Client::connect(config).expect("connect client");

        Self {
            client,
            driver: handle,
            events,
            strategy,
            _driver_thread: driver_thread,
        }
    }

    pub fn drain_events(&self) -> Vec<Event> {
        self.events.try_iter().collect()
    }
}

/// Config whose handlers forward every notification to the returned channel.
pub fn observed_config(
    strategy: HeapBufferStrategy,
    settings: ClientSettings,
) -> (ClientConfig, Receiver<Event>) {
    let (tx, rx) = unbounded();
    let general = tx.clone();
    let config = ClientConfig {
        error_handler: Some(Arc::new(move |err: &ClientError| {
            let event = match err {
                ClientError::SessionConflict {
                    stream_id,
                    session_id,
                    ..
                } => Event::SessionConflict {
                    stream_id: *stream_id,
                    session_id: *session_id,
                },
                other => Event::Other(other.to_string()),
            };
            let _ = general.send(event);
        })),
        invalid_destination_handler: Some(Arc::new(move |destination: &Destination, _: &str| {
            let _ = tx.send(Event::InvalidDestination(destination.clone()));
        })),
        settings,
        ..ClientConfig::new(Arc::new(strategy))
    };
    (config, rx)
}

pub fn destination(value: &str) -> Destination {
    Destination::new(value).expect("destination")
}

/// Polls `condition` until it holds, panicking after a generous limit.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}
