use std::collections::HashSet;
use std::sync::Barrier;
use std::thread;

use client::{ClientError, SourceConfig};
use parking_lot::Mutex;

use crate::harness::{destination, wait_until, Event, Harness};

const THREADS: usize = 8;

#[test]
fn distinct_sessions_from_many_threads_all_register() {
    const PER_THREAD: i32 = 16;
    let harness = Harness::start();
    let client = &harness.client;
    let dest = destination("udp://localhost:50000");
    let barrier = Barrier::new(THREADS);

    let sources = Mutex::new(Vec::new());
    thread::scope(|scope| {
        for t in 0..THREADS as i32 {
            let (barrier, sources, dest) = (&barrier, &sources, dest.clone());
            scope.spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    let session_id = t * PER_THREAD + i;
                    let source = client
                        .add_source(SourceConfig::with_session(dest.clone(), 1, session_id))
                        .expect("distinct sessions never conflict");
                    sources.lock().push(source);
                }
            });
        }
    });

    let sources = sources.into_inner();
    let total = THREADS * PER_THREAD as usize;
    assert_eq!(sources.len(), total);
    wait_until("all sources active", || sources.iter().all(|s| s.is_active()));

    let mut seen = HashSet::new();
    client.channels().for_each(|c| {
        assert!(seen.insert(c.session_id()), "duplicate session {}", c.session_id());
    });
    assert_eq!(seen.len(), total);
    assert!(harness.drain_events().is_empty());
}

#[test]
fn identical_session_race_has_one_winner() {
    let harness = Harness::start();
    let client = &harness.client;
    let dest = destination("udp://localhost:50001");

    for session_id in 0..32 {
        let barrier = Barrier::new(2);
        let outcomes: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let (barrier, dest) = (&barrier, dest.clone());
                    scope.spawn(move || {
                        barrier.wait();
                        client.add_source(SourceConfig::with_session(dest, 2, session_id))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("racer panicked"))
                .collect()
        });

        let sync_conflicts = outcomes
            .iter()
            .filter(|r| matches!(r, Err(ClientError::SessionConflict { .. })))
            .count();
        let created: Vec<_> = outcomes.into_iter().filter_map(Result::ok).collect();
        assert_eq!(created.len() + sync_conflicts, 2);

        // Whichever request lost at apply time is closed and reported.
        wait_until("race settled", || {
            created
                .iter()
                .all(|s| s.is_active() || s.state().is_closed())
        });
        let winners = created.iter().filter(|s| s.is_active()).count();
        assert_eq!(winners, 1, "session {session_id}");

        let async_conflicts = harness
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, Event::SessionConflict { session_id: s, .. } if *s == session_id))
            .count();
        assert_eq!(sync_conflicts + async_conflicts, 1, "session {session_id}");
        assert_eq!(
            client
                .channels()
                .snapshot()
                .iter()
                .filter(|c| c.stream_id() == 2 && c.session_id() == session_id)
                .count(),
            1
        );
    }
}

#[test]
fn readers_iterate_while_sources_come_and_go() {
    let harness = Harness::start();
    let client = &harness.client;
    let dest = destination("udp://localhost:50002");

    thread::scope(|scope| {
        let reader = scope.spawn(|| {
            let mut observed = 0usize;
            for _ in 0..2_000 {
                client.channels().for_each(|c| {
                    assert_eq!(c.destination(), &dest);
                    observed += 1;
                });
            }
            observed
        });

        for round in 0..64 {
            let source = client
                .add_source(SourceConfig::with_session(dest.clone(), 3, round))
                .expect("add source");
            wait_until("source active", || source.is_active());
            source.close().expect("close");
        }
        reader.join().expect("reader panicked");
    });

    wait_until("registry drained", || client.channels().is_empty());
}
