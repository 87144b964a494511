use std::sync::Arc;

use client::{
    AdminBufferStrategy, Client, ClientConfig, ClientError, ClientSettings, Destination,
    EndpointState, HeapBufferStrategy, ReceiverConfig, SourceConfig,
};
use driver_protocol::AdminCommand;
use mock_driver::MockMediaDriver;
use transport::ManyToOneRingBuffer;
use transport_fabric::Agent;

use crate::harness::{destination, observed_config, wait_until, Event, Harness};

#[test]
fn sources_become_active_and_conflicts_fail_before_sending() {
    const SOURCE_COUNT: usize = 32;
    let harness = Harness::start();
    let client = &harness.client;
    let dest = destination("udp://localhost:40456");

    let sources: Vec<_> = (0..SOURCE_COUNT)
        .map(|_| client.add_source(SourceConfig::new(dest.clone(), 1)).expect("add source"))
        .collect();
    wait_until("all sources active", || sources.iter().all(|s| s.is_active()));
    assert_eq!(client.channels().len(), SOURCE_COUNT);
    assert_eq!(harness.driver.active_channels(), SOURCE_COUNT);

    let taken = sources[3].session_id();
    let sent_before = harness.driver.received().len();
    let err = client
        .add_source(SourceConfig::with_session(dest.clone(), 1, taken))
        .expect_err("duplicate session");
    assert!(matches!(err, ClientError::SessionConflict { session_id, .. } if session_id == taken));

    sources[3].close().expect("close");
    wait_until("closed source leaves the registry", || {
        client.channels().len() == SOURCE_COUNT - 1
    });
    assert_eq!(sources[3].state(), EndpointState::Closed);

    let reused = client
        .add_source(SourceConfig::with_session(dest.clone(), 1, taken))
        .expect("freed session id is allocatable");
    wait_until("reused session active", || reused.is_active());

    let received = harness.driver.received();
    assert_eq!(
        received[sent_before..]
            .iter()
            .filter(|c| matches!(c, AdminCommand::AddChannel(m) if m.session_id == taken))
            .count(),
        1,
        "the rejected duplicate never reached the driver"
    );
    assert!(harness.drain_events().is_empty());
}

#[test]
fn invalid_destination_reaches_narrow_handler() {
    let bad = destination("udp://unreachable:1");
    let harness = Harness::build(64 * 1024, |driver| driver.reject(bad.clone()));
    let client = &harness.client;

    let source = client.add_source_to(bad.clone()).expect("add source");
    let receiver = client
        .add_receiver(ReceiverConfig::new(bad.clone(), &[1, 2]))
        .expect("add receiver");

    wait_until("both endpoints closed", || {
        source.state() == EndpointState::Closed && receiver.state() == EndpointState::Closed
    });
    assert!(client.channels().is_empty());
    assert!(client.receivers().is_empty());

    let events = harness.drain_events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| *e == Event::InvalidDestination(bad.clone())));

    let good = client
        .add_source_to(destination("udp://localhost:1"))
        .expect("client still usable");
    wait_until("good source active", || good.is_active());
}

#[test]
fn receiver_lifecycle() {
    let harness = Harness::start();
    let client = &harness.client;
    let receiver = client
        .add_receiver_with(|cfg| {
            cfg.destination = Some(destination("udp://localhost:2"));
            cfg.streams.extend([7, 8]);
        })
        .expect("add receiver");
    wait_until("receiver active", || receiver.is_active());
    assert_eq!(harness.driver.active_receivers(), 1);
    assert!(client.receivers().snapshot()[0].subscribes_to(8));

    receiver.close().expect("close");
    wait_until("receiver removed", || client.receivers().is_empty());
    wait_until("driver forgot receiver", || harness.driver.active_receivers() == 0);
}

#[test]
fn malformed_driver_frames_are_dropped() {
    let harness = Harness::start();
    let client = &harness.client;
    let ring = ManyToOneRingBuffer::new(harness.strategy.to_client().expect("region"))
        .expect("ring");
    // Unknown type, then an Ack whose payload is too short.
    ring.try_write(0x7f, b"junk").expect("write");
    ring.try_write(0x11, &[1, 2, 3]).expect("write");

    wait_until("malformed frames counted", || {
        client.coordinator_stats().malformed_frames == 2
    });
    let source = client
        .add_source_to(destination("udp://localhost:3"))
        .expect("add source");
    wait_until("source active after bad frames", || source.is_active());
}

#[test]
fn batch_creation_closes_partial_results_on_failure() {
    let harness = Harness::start();
    let client = &harness.client;
    let dest = destination("udp://localhost:4");
    let first = client
        .add_source(SourceConfig::with_session(dest.clone(), 1, 1))
        .expect("first");
    wait_until("first active", || first.is_active());

    let err = client
        .add_sources([
            SourceConfig::with_session(dest.clone(), 1, 2),
            SourceConfig::with_session(dest.clone(), 1, 3),
            SourceConfig::with_session(dest.clone(), 1, 1),
        ])
        .expect_err("third conflicts");
    assert!(matches!(err, ClientError::SessionConflict { session_id: 1, .. }));
    wait_until("batch rolled back", || client.channels().len() == 1);
    assert!(client.channels().any(|c| c.session_id() == 1));
}

#[test]
fn connect_many_gives_independent_clients() {
    let strategies: Vec<_> = (0..2)
        .map(|_| HeapBufferStrategy::new(4096).expect("strategy"))
        .collect();
    let mut drivers: Vec<_> = strategies
        .iter()
        .map(|s| MockMediaDriver::attach(s).expect("driver"))
        .collect();
    let configs = strategies.iter().map(|s| ClientConfig {
        settings: ClientSettings {
            use_invoker: true,
            ..ClientSettings::default()
        },
        ..ClientConfig::new(Arc::new(s.clone()))
    });
    let clients = Client::connect_many(configs).expect("connect");
    let dest = destination("udp://localhost:5");

    // The same session id is fine on two clients talking to two drivers.
    let sources: Vec<_> = clients
        .iter()
        .map(|c| c.add_source(SourceConfig::with_session(dest.clone(), 1, 99)).unwrap())
        .collect();
    for _ in 0..3 {
        for client in &clients {
            client.invoke().expect("invoke");
        }
        for driver in &mut drivers {
            driver.do_work();
        }
    }
    assert!(sources.iter().all(|s| s.is_active()));
    assert!(clients.iter().all(|c| c.channels().len() == 1));
}

#[test]
fn invoker_client_holds_requested_until_answered() {
    let strategy = HeapBufferStrategy::new(4096).expect("strategy");
    let mut driver = MockMediaDriver::attach(&strategy).expect("driver");
    let handle = driver.handle();
    let (config, events) = observed_config(
        strategy,
        ClientSettings {
            use_invoker: true,
            ..ClientSettings::default()
        },
    );
    let client = Client::connect(config).expect("connect");

    handle.hold_responses(true);
    let source = client.add_source_to(destination("udp://localhost:6")).unwrap();
    client.invoke().unwrap();
    driver.step();
    client.invoke().unwrap();
    assert_eq!(source.state(), EndpointState::Requested);
    assert_eq!(client.channels().len(), 1);

    // A second registration of the same key reaches the driver only if the
    // client forgot the first; here it fails locally.
    let dup = client.add_source(SourceConfig::with_session(
        source.destination().clone(),
        0,
        source.session_id(),
    ));
    assert!(matches!(dup, Err(ClientError::SessionConflict { .. })));

    handle.hold_responses(false);
    source.close().unwrap();
    client.invoke().unwrap();
    driver.step();
    assert!(client.channels().is_empty());
    assert_eq!(handle.active_channels(), 0);
    assert!(events.try_recv().is_err());

    let stats = client.coordinator_stats();
    assert_eq!(stats.commands_applied, 2);
    assert_eq!(stats.commands_forwarded, 2);
}

#[test]
fn panicking_handler_does_not_stop_the_coordinator() {
    let bad = destination("udp://unreachable:2");
    let strategy = HeapBufferStrategy::new(4096).expect("strategy");
    let mut driver = MockMediaDriver::attach(&strategy).expect("driver");
    driver.handle().reject(bad.clone());
    let client = Client::connect(ClientConfig {
        invalid_destination_handler: Some(Arc::new(|_: &Destination, _: &str| {
            panic!("handler bug")
        })),
        settings: ClientSettings {
            use_invoker: true,
            ..ClientSettings::default()
        },
        ..ClientConfig::new(Arc::new(strategy))
    })
    .expect("connect");

    let doomed = client.add_source_to(bad).unwrap();
    client.invoke().unwrap();
    driver.step();
    client.invoke().unwrap();
    assert_eq!(doomed.state(), EndpointState::Closed);

    let fine = client.add_source_to(destination("udp://localhost:8")).unwrap();
    client.invoke().unwrap();
    driver.step();
    client.invoke().unwrap();
    assert!(fine.is_active());
}
