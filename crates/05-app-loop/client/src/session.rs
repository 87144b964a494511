//! Session id allocation scoped to a destination and stream.
//!
//! The check here is a point-in-time guard against the channel registry. Two
//! threads can still pick the same explicit id concurrently; the admin
//! coordinator re-validates in apply order and reports the loser
//! asynchronously.

use std::sync::Arc;

use driver_protocol::Destination;
use rand::Rng;
use transport::AtomicArray;

use crate::endpoint::Channel;
use crate::error::{ClientError, ClientResult};

pub struct SessionAllocator {
    channels: Arc<AtomicArray<Channel>>,
    max_attempts: usize,
}

impl SessionAllocator {
    pub fn new(channels: Arc<AtomicArray<Channel>>, max_attempts: usize) -> Self {
        Self {
            channels,
            max_attempts,
        }
    }

    /// Validates `requested`, or draws a random free id when absent.
    pub fn allocate(
        &self,
        destination: &Destination,
        stream_id: i32,
        requested: Option<i32>,
    ) -> ClientResult<i32> {
        self.allocate_with(&mut rand::thread_rng(), destination, stream_id, requested)
    }

    pub fn allocate_with<R>(
        &self,
        rng: &mut R,
        destination: &Destination,
        stream_id: i32,
        requested: Option<i32>,
    ) -> ClientResult<i32>
    where
        R: Rng + ?Sized,
    {
        if let Some(session_id) = requested {
            if self.is_in_use(destination, stream_id, session_id) {
                return Err(ClientError::SessionConflict {
                    destination: destination.clone(),
                    stream_id,
                    session_id,
                });
            }
            return Ok(session_id);
        }

        for _ in 0..self.max_attempts {
            let candidate: i32 = rng.gen();
            if !self.is_in_use(destination, stream_id, candidate) {
                return Ok(candidate);
            }
        }

        tracing::warn!(
            %destination,
            stream_id,
            attempts = self.max_attempts,
            "session allocation exhausted"
        );
        Err(ClientError::AllocationExhausted {
            destination: destination.clone(),
            stream_id,
            attempts: self.max_attempts,
        })
    }

    pub fn is_in_use(&self, destination: &Destination, stream_id: i32, session_id: i32) -> bool {
        self.channels.any(|channel| {
            !channel.state().is_closed() && channel.occupies(destination, stream_id, session_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn dest(value: &str) -> Destination {
        Destination::new(value).unwrap()
    }

    fn registry_with(entries: &[(&str, i32, i32)]) -> Arc<AtomicArray<Channel>> {
        let registry = Arc::new(AtomicArray::new());
        for (i, (destination, stream, session)) in entries.iter().enumerate() {
            registry.add(Arc::new(Channel::new(
                i as i64,
                dest(destination),
                *stream,
                *session,
            )));
        }
        registry
    }

    #[test]
    fn explicit_id_conflicts_only_within_scope() {
        let allocator = SessionAllocator::new(registry_with(&[("udp://a:1", 1, 5)]), 64);

        assert!(matches!(
            allocator.allocate(&dest("udp://a:1"), 1, Some(5)),
            Err(ClientError::SessionConflict { session_id: 5, .. })
        ));
        assert_eq!(allocator.allocate(&dest("udp://a:1"), 2, Some(5)).unwrap(), 5);
        assert_eq!(allocator.allocate(&dest("udp://b:1"), 1, Some(5)).unwrap(), 5);
        assert_eq!(allocator.allocate(&dest("udp://a:1"), 1, Some(6)).unwrap(), 6);
    }

    #[test]
    fn random_ids_skip_occupied_values() {
        let allocator = SessionAllocator::new(registry_with(&[("udp://a:1", 1, 3)]), 64);
        // StepRng yields 3, 4, 5, ...; 3 is taken.
        let mut rng = StepRng::new(3, 1);
        assert_eq!(
            allocator
                .allocate_with(&mut rng, &dest("udp://a:1"), 1, None)
                .unwrap(),
            4
        );
    }

    #[test]
    fn exhaustion_after_bounded_attempts() {
        let allocator = SessionAllocator::new(registry_with(&[("udp://a:1", 1, 7)]), 64);
        let mut rng = StepRng::new(7, 0);
        assert!(matches!(
            allocator.allocate_with(&mut rng, &dest("udp://a:1"), 1, None),
            Err(ClientError::AllocationExhausted { attempts: 64, .. })
        ));
    }

    #[test]
    fn closed_channels_release_their_id() {
        let registry = registry_with(&[("udp://a:1", 1, 9)]);
        let allocator = SessionAllocator::new(Arc::clone(&registry), 64);
        assert!(allocator.is_in_use(&dest("udp://a:1"), 1, 9));

        registry.for_each(|channel| {
            channel.state.close();
        });
        assert!(!allocator.is_in_use(&dest("udp://a:1"), 1, 9));
    }

    #[test]
    fn seeded_allocation_is_deterministic() {
        let allocator = SessionAllocator::new(Arc::new(AtomicArray::new()), 64);
        let mut a = StdRng::seed_from_u64(11);
        let mut b = StdRng::seed_from_u64(11);
        let destination = dest("udp://a:1");
        assert_eq!(
            allocator.allocate_with(&mut a, &destination, 0, None).unwrap(),
            allocator.allocate_with(&mut b, &destination, 0, None).unwrap()
        );
    }
}
