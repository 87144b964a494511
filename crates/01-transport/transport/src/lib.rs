//! Core transport primitives shared by the client and the media driver.
//!
//! * [`SharedRegion`] – aligned memory, heap or file mapped, backing the rings.
//! * [`ManyToOneRingBuffer`] – lock-free multi-producer/single-consumer framed ring.
//! * [`AtomicArray`] – copy-on-write registry with wait-free readers.
//! * [`TransportError`] – lightweight error surface for allocation/config failures.

mod atomic_array;
mod error;
mod region;
mod ring_buffer;

pub use atomic_array::AtomicArray;
pub use error::{TransportError, TransportResult};
pub use region::{RegionInit, SharedRegion};
pub use ring_buffer::{
    Frame, ManyToOneRingBuffer, RingWrite, MIN_CAPACITY, PADDING_MSG_TYPE_ID, RECORD_ALIGNMENT,
    RECORD_HEADER_LENGTH, TRAILER_LENGTH,
};
