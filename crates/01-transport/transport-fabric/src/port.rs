use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;
use transport::{ManyToOneRingBuffer, RingWrite};

use crate::codec::Codec;
use crate::error::{FabricError, FabricResult};

/// Outcome returned when attempting to submit a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Record entered the ring.
    Accepted,
    /// Ring could not accept without blocking.
    WouldBlock,
}

struct SharedPort {
    ring: Arc<ManyToOneRingBuffer>,
    metrics: PortMetrics,
}

/// Writing side of a ring. Cheap to clone; every clone may write concurrently.
#[derive(Clone)]
pub struct RingProducer {
    inner: Arc<SharedPort>,
}

impl RingProducer {
    pub fn new(ring: Arc<ManyToOneRingBuffer>) -> Self {
        Self {
            inner: Arc::new(SharedPort {
                ring,
                metrics: PortMetrics::default(),
            }),
        }
    }

    /// Single non-blocking attempt.
    pub fn offer(&self, msg_type_id: i32, payload: &[u8]) -> FabricResult<SubmitOutcome> {
        let outcome = match self.inner.ring.try_write(msg_type_id, payload)? {
            RingWrite::Written => SubmitOutcome::Accepted,
            RingWrite::Full => SubmitOutcome::WouldBlock,
        };
        self.inner.metrics.record(outcome);
        Ok(outcome)
    }

    /// Retries a full ring up to `attempts` times, yielding between tries.
    pub fn offer_with_retry(
        &self,
        msg_type_id: i32,
        payload: &[u8],
        attempts: usize,
    ) -> FabricResult<()> {
        if attempts == 0 {
            return Err(FabricError::InvalidConfig("offer attempts must be non-zero"));
        }
        for attempt in 0..attempts {
            if self.offer(msg_type_id, payload)? == SubmitOutcome::Accepted {
                return Ok(());
            }
            if attempt + 1 < attempts {
                std::thread::yield_now();
            }
        }
        Err(FabricError::BackPressured { attempts })
    }

    /// Encodes `msg` with `codec` and offers it once.
    pub fn send<C: Codec>(&self, codec: &C, msg: &C::Msg) -> FabricResult<SubmitOutcome> {
        let encoded = codec.encode(msg)?;
        self.offer(encoded.msg_type_id, &encoded.payload)
    }

    pub fn ring(&self) -> &Arc<ManyToOneRingBuffer> {
        &self.inner.ring
    }

    pub fn metrics(&self) -> PortMetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

/// Reading side of a ring. Holds the ring's consumer claim until dropped.
pub struct RingConsumer {
    ring: Arc<ManyToOneRingBuffer>,
}

impl RingConsumer {
    pub fn new(ring: Arc<ManyToOneRingBuffer>) -> FabricResult<Self> {
        ring.claim_consumer()?;
        Ok(Self { ring })
    }

    pub fn drain_records<F>(&self, max: usize, f: F) -> usize
    where
        F: FnMut(i32, &[u8]),
    {
        if max == 0 {
            return 0;
        }
        self.ring.read(max, f)
    }

    /// Drains up to `max` records and decodes each one; undecodable records
    /// come back as errors in arrival order.
    pub fn drain_decoded<C: Codec>(
        &self,
        codec: &C,
        max: usize,
    ) -> SmallVec<[FabricResult<C::Msg>; 8]> {
        let mut decoded = SmallVec::new();
        self.drain_records(max, |msg_type_id, payload| {
            decoded.push(codec.decode(msg_type_id, payload));
        });
        decoded
    }

    pub fn ring(&self) -> &Arc<ManyToOneRingBuffer> {
        &self.ring
    }
}

impl Drop for RingConsumer {
    fn drop(&mut self) {
        self.ring.release_consumer();
    }
}

#[derive(Default)]
struct PortMetrics {
    accepted: AtomicU64,
    would_block: AtomicU64,
}

impl PortMetrics {
    fn record(&self, outcome: SubmitOutcome) {
        match outcome {
            SubmitOutcome::Accepted => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
            }
            SubmitOutcome::WouldBlock => {
                self.would_block.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> PortMetricsSnapshot {
        PortMetricsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            would_block: self.would_block.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortMetricsSnapshot {
    pub accepted: u64,
    pub would_block: u64,
}

pub struct PortPair {
    pub producer: RingProducer,
    pub consumer: RingConsumer,
}

pub fn make_port_pair(ring: ManyToOneRingBuffer) -> FabricResult<PortPair> {
    let ring = Arc::new(ring);
    Ok(PortPair {
        producer: RingProducer::new(Arc::clone(&ring)),
        consumer: RingConsumer::new(ring)?,
    })
}
