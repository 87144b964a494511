//! Admin protocol spoken between the client coordinator and the media driver.
//!
//! This crate defines the typed messages exchanged over the driver rings and
//! the exact little-endian layout used to carry them, plus [`Codec`] adapters
//! so fabric ports can encode and decode them directly.
//!
//! [`Codec`]: transport_fabric::Codec

mod codec;
mod error;
mod message;

pub use codec::{decode_command, decode_response, encode_command, encode_response, AdminCodec, ResponseCodec};
pub use error::{ProtocolError, ProtocolResult};
pub use message::*;
