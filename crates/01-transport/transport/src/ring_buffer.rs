//! Many-producer/single-consumer framed ring buffer.
//!
//! Layout:
//!
//! ```text
//! +--------------------------------------------+-------------------------------+
//! | Data region (capacity bytes, power of two) | Trailer (TRAILER_LENGTH)      |
//! +--------------------------------------------+-------------------------------+
//!   Record:                                      tail position        @ +0
//!   [i32 length][i32 msg_type][payload ...]      head cache position  @ +64
//!   [pad → 8 bytes]                              head position        @ +128
//!   Padding record (wrap): msg_type == -1        correlation counter  @ +192
//!                                                consumer claim       @ +200
//!                                                read guard           @ +208
//! ```
//!
//! Producers claim space by advancing the tail with a CAS, mark the record as
//! in flight with a negative length, copy the payload, then publish the
//! positive length with release ordering. The consumer reads records until it
//! meets a zero or negative length, zeroes what it consumed, and advances the
//! head. Because all state lives inside the [`SharedRegion`], two processes
//! mapping the same file see the same ring.
//!
//! Under the `loom` feature the header and trailer words move into loom
//! atomics owned by the handle, so the model checker can follow them; payload
//! bytes stay in the region.

use crate::region::{RegionInit, SharedRegion};
use crate::{TransportError, TransportResult};
#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicI32, AtomicU64, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

/// Bytes occupied by the `[length][msg_type]` record header.
pub const RECORD_HEADER_LENGTH: usize = 8;
/// Alignment of every record inside the data region.
pub const RECORD_ALIGNMENT: usize = 8;
/// Message type reserved for wrap padding records.
pub const PADDING_MSG_TYPE_ID: i32 = -1;

const CACHE_LINE: usize = 64;
const TAIL_POSITION_OFFSET: usize = 0;
const HEAD_CACHE_POSITION_OFFSET: usize = CACHE_LINE;
const HEAD_POSITION_OFFSET: usize = CACHE_LINE * 2;
const CORRELATION_COUNTER_OFFSET: usize = CACHE_LINE * 3;
const CONSUMER_CLAIM_OFFSET: usize = CORRELATION_COUNTER_OFFSET + 8;
const READ_GUARD_OFFSET: usize = CORRELATION_COUNTER_OFFSET + 16;

/// Size of the metadata trailer appended after the data region.
pub const TRAILER_LENGTH: usize = CACHE_LINE * 4;
/// Smallest data capacity a ring accepts.
pub const MIN_CAPACITY: usize = 64;

/// Outcome of a non-blocking write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingWrite {
    /// The record was published.
    Written,
    /// Not enough contiguous capacity; retry after the consumer catches up.
    Full,
}

/// Bounded lock-free MPSC channel of length-prefixed, type-tagged records.
pub struct ManyToOneRingBuffer {
    region: Arc<SharedRegion>,
    capacity: usize,
    max_msg_length: usize,
    #[cfg(feature = "loom")]
    words: LoomWords,
}

#[cfg(feature = "loom")]
struct LoomWords {
    headers: Vec<AtomicI32>,
    trailer: Vec<AtomicU64>,
}

impl ManyToOneRingBuffer {
    /// Allocates a process-local ring with `capacity` bytes of record storage.
    pub fn with_capacity(capacity: usize) -> TransportResult<Self> {
        validate_capacity(capacity)?;
        let region =
            SharedRegion::new_aligned(capacity + TRAILER_LENGTH, CACHE_LINE, RegionInit::Zeroed)?;
        Self::new(Arc::new(region))
    }

    /// Wraps an existing region. The data capacity is `region.len() - TRAILER_LENGTH`.
    ///
    /// The region must be zeroed when first used; attaching to a region that
    /// another party already writes into resumes from the positions stored in
    /// its trailer.
    pub fn new(region: Arc<SharedRegion>) -> TransportResult<Self> {
        let capacity = region.len().saturating_sub(TRAILER_LENGTH);
        validate_capacity(capacity)?;
        if region.as_shared_ptr() as usize % RECORD_ALIGNMENT != 0 {
            return Err(TransportError::AllocationFailed {
                size: region.len(),
                alignment: RECORD_ALIGNMENT,
            });
        }

        Ok(Self {
            region,
            capacity,
            max_msg_length: capacity / 4,
            #[cfg(feature = "loom")]
            words: LoomWords {
                headers: (0..capacity / 4).map(|_| AtomicI32::new(0)).collect(),
                trailer: (0..TRAILER_LENGTH / 8).map(|_| AtomicU64::new(0)).collect(),
            },
        })
    }

    /// Data capacity in bytes, excluding the trailer.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest record (header included) a single write may carry.
    pub fn max_msg_length(&self) -> usize {
        self.max_msg_length
    }

    /// Largest payload a single write may carry.
    pub fn max_payload_length(&self) -> usize {
        self.max_msg_length - RECORD_HEADER_LENGTH
    }

    /// Bytes currently claimed by producers and not yet consumed.
    pub fn size(&self) -> usize {
        let head = self.trailer(HEAD_POSITION_OFFSET).load(Ordering::Acquire);
        let tail = self.trailer(TAIL_POSITION_OFFSET).load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }

    /// Backing region, shared with any other ring attached to it.
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Hands out a process-wide unique, monotonically increasing identifier.
    ///
    /// The counter lives in the trailer, so every party attached to the same
    /// region draws from one sequence.
    pub fn next_correlation_id(&self) -> i64 {
        self.trailer(CORRELATION_COUNTER_OFFSET)
            .fetch_add(1, Ordering::AcqRel) as i64
    }

    /// Claims the ring's single consumer slot.
    ///
    /// The claim is stored in the trailer, so it is exclusive across every
    /// handle and process attached to the region. Fails with
    /// [`TransportError::ConsumerClaimed`] while another claim is held. A claim
    /// left behind by a process that died holding it lasts until the region is
    /// recreated.
    pub fn claim_consumer(&self) -> TransportResult<()> {
        self.trailer(CONSUMER_CLAIM_OFFSET)
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| TransportError::ConsumerClaimed)
    }

    /// Releases a claim taken with [`Self::claim_consumer`].
    pub fn release_consumer(&self) {
        self.trailer(CONSUMER_CLAIM_OFFSET)
            .store(0, Ordering::Release);
    }

    /// Attempts to publish `payload` tagged with `msg_type_id`.
    ///
    /// Never blocks. Returns [`RingWrite::Full`] when the ring lacks space; prior
    /// content is left untouched in that case.
    pub fn try_write(&self, msg_type_id: i32, payload: &[u8]) -> TransportResult<RingWrite> {
        if msg_type_id <= 0 {
            return Err(TransportError::InvalidMessageType(msg_type_id));
        }

        let record_length = RECORD_HEADER_LENGTH + payload.len();
        if record_length > self.max_msg_length {
            return Err(TransportError::MessageTooLong {
                length: payload.len(),
                maximum: self.max_payload_length(),
            });
        }

        let required = align_up(record_length, RECORD_ALIGNMENT);
        let Some(index) = self.claim_capacity(required) else {
            return Ok(RingWrite::Full);
        };

        self.length_at(index)
            .store(-(record_length as i32), Ordering::Release);
        self.type_at(index).store(msg_type_id, Ordering::Relaxed);
        unsafe {
            // SAFETY: `claim_capacity` reserved `[index, index + required)` for this
            // writer alone; the consumer will not read past the negative length.
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.base().add(index + RECORD_HEADER_LENGTH),
                payload.len(),
            );
        }
        self.length_at(index)
            .store(record_length as i32, Ordering::Release);

        Ok(RingWrite::Written)
    }

    /// Reads up to `limit` complete records, handing each to `handler`.
    ///
    /// Only one thread reads at a time, across every handle on the region: a
    /// call made while another read is in progress observes an empty ring.
    /// Padding at the end of the buffer is stepped over within the same call.
    /// Returns the number of records handed to `handler` (padding is not
    /// counted).
    pub fn read<F>(&self, limit: usize, mut handler: F) -> usize
    where
        F: FnMut(i32, &[u8]),
    {
        let guard = self.trailer(READ_GUARD_OFFSET);
        if limit == 0
            || guard
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
        {
            return 0;
        }

        let head_position = self.trailer(HEAD_POSITION_OFFSET);
        let mut records = 0usize;
        loop {
            let head = head_position.load(Ordering::Relaxed);
            let head_index = (head & self.mask()) as usize;
            let contiguous = self.capacity - head_index;

            let mut bytes_read = 0usize;
            while bytes_read < contiguous && records < limit {
                let index = head_index + bytes_read;
                let length = self.length_at(index).load(Ordering::Acquire);
                if length <= 0 {
                    break;
                }

                bytes_read += align_up(length as usize, RECORD_ALIGNMENT);
                let msg_type_id = self.type_at(index).load(Ordering::Relaxed);
                if msg_type_id == PADDING_MSG_TYPE_ID {
                    continue;
                }

                let payload = unsafe {
                    // SAFETY: the release store of `length` published these bytes and no
                    // producer may reuse them until the head moves past them below.
                    std::slice::from_raw_parts(
                        self.base().add(index + RECORD_HEADER_LENGTH),
                        length as usize - RECORD_HEADER_LENGTH,
                    )
                };
                handler(msg_type_id, payload);
                records += 1;
            }

            if bytes_read == 0 {
                break;
            }
            self.clear(head_index, bytes_read);
            head_position.store(head + bytes_read as u64, Ordering::Release);

            // Reaching the buffer end with budget left resumes from index 0.
            if bytes_read < contiguous || records == limit {
                break;
            }
        }

        guard.store(0, Ordering::Release);
        records
    }

    /// Reads a single record into an owned frame.
    pub fn try_read(&self) -> Option<Frame> {
        let mut frame = None;
        self.read(1, |msg_type_id, payload| {
            frame = Some(Frame {
                msg_type_id,
                payload: payload.to_vec(),
            });
        });
        frame
    }

    fn claim_capacity(&self, required: usize) -> Option<usize> {
        let capacity = self.capacity as u64;
        let mask = self.mask();
        let required = required as u64;
        let head_position = self.trailer(HEAD_POSITION_OFFSET);
        let head_cache = self.trailer(HEAD_CACHE_POSITION_OFFSET);
        let tail_position = self.trailer(TAIL_POSITION_OFFSET);

        let mut head = head_cache.load(Ordering::Acquire);
        loop {
            let tail = tail_position.load(Ordering::Acquire);
            if tail.wrapping_sub(head).saturating_add(required) > capacity {
                head = head_position.load(Ordering::Acquire);
                if tail - head + required > capacity {
                    return None;
                }
                head_cache.store(head, Ordering::Release);
            }

            let tail_index = tail & mask;
            let to_buffer_end = capacity - tail_index;
            let mut padding = 0;
            if required > to_buffer_end {
                let mut head_index = head & mask;
                if required > head_index {
                    head = head_position.load(Ordering::Acquire);
                    head_index = head & mask;
                    if required > head_index {
                        return None;
                    }
                    head_cache.store(head, Ordering::Release);
                }
                padding = to_buffer_end;
            }

            let next_tail = tail + padding + required;
            if tail_position
                .compare_exchange_weak(tail, next_tail, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if padding == 0 {
                    return Some(tail_index as usize);
                }
                let pad_index = tail_index as usize;
                self.type_at(pad_index)
                    .store(PADDING_MSG_TYPE_ID, Ordering::Relaxed);
                self.length_at(pad_index)
                    .store(padding as i32, Ordering::Release);
                return Some(0);
            }
        }
    }

    fn mask(&self) -> u64 {
        self.capacity as u64 - 1
    }

    fn base(&self) -> *mut u8 {
        self.region.as_shared_ptr()
    }

    /// Zeroes a consumed span so producers find clear headers after the wrap.
    fn clear(&self, index: usize, len: usize) {
        unsafe {
            // SAFETY: the consumed span belongs to the consumer until the head
            // store that follows hands it back to producers.
            std::ptr::write_bytes(self.base().add(index), 0, len);
        }
        #[cfg(feature = "loom")]
        for word in &self.words.headers[index / 4..(index + len) / 4] {
            word.store(0, Ordering::Relaxed);
        }
    }

    fn length_at(&self, index: usize) -> &AtomicI32 {
        self.header_word(index)
    }

    fn type_at(&self, index: usize) -> &AtomicI32 {
        self.header_word(index + 4)
    }

    #[cfg(not(feature = "loom"))]
    fn trailer(&self, offset: usize) -> &AtomicU64 {
        unsafe {
            // SAFETY: trailer fields are 8-byte aligned offsets past the power-of-two
            // data region and stay inside the region for its lifetime.
            &*(self.base().add(self.capacity + offset) as *const AtomicU64)
        }
    }

    #[cfg(not(feature = "loom"))]
    fn header_word(&self, index: usize) -> &AtomicI32 {
        unsafe {
            // SAFETY: header words sit at 4-byte aligned offsets below `capacity`.
            &*(self.base().add(index) as *const AtomicI32)
        }
    }

    #[cfg(feature = "loom")]
    fn trailer(&self, offset: usize) -> &AtomicU64 {
        &self.words.trailer[offset / 8]
    }

    #[cfg(feature = "loom")]
    fn header_word(&self, index: usize) -> &AtomicI32 {
        &self.words.headers[index / 4]
    }
}

/// Owned copy of a record returned by [`ManyToOneRingBuffer::try_read`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Message type identifier written by the producer.
    pub msg_type_id: i32,
    /// Payload bytes, header stripped.
    pub payload: Vec<u8>,
}

fn validate_capacity(capacity: usize) -> TransportResult<()> {
    if capacity < MIN_CAPACITY || !capacity.is_power_of_two() || capacity > i32::MAX as usize {
        return Err(TransportError::InvalidCapacity {
            requested: capacity,
            minimum: MIN_CAPACITY,
        });
    }
    Ok(())
}

fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}
