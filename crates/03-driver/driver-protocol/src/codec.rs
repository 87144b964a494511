//! Little-endian wire codec for admin commands and driver responses.
//!
//! ```text
//! AddChannel / RemoveChannel    i64 correlation | i32 stream | i32 session | u16 len | dest
//! AddReceiver / RemoveReceiver  i64 correlation | u16 n | i32 stream × n  | u16 len | dest
//! Ack                           i64 correlation
//! ErrorNotification             i64 correlation | i32 kind | u16 len | dest | u16 len | detail
//! ```
//!
//! An error notification with no destination carries a zero destination length.

use smallvec::SmallVec;
use transport_fabric::{Codec, Encoded, FabricError, FabricResult, INLINE_PAYLOAD};

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::*;

type Buf = SmallVec<[u8; INLINE_PAYLOAD]>;

pub fn encode_command(cmd: &AdminCommand) -> ProtocolResult<Encoded> {
    let mut buf = Buf::new();
    match cmd {
        AdminCommand::AddChannel(msg) | AdminCommand::RemoveChannel(msg) => {
            put_i64(&mut buf, msg.correlation_id);
            put_i32(&mut buf, msg.stream_id);
            put_i32(&mut buf, msg.session_id);
            put_str(&mut buf, msg.destination.as_str())?;
        }
        AdminCommand::AddReceiver(msg) | AdminCommand::RemoveReceiver(msg) => {
            validate_streams(&msg.streams)?;
            put_i64(&mut buf, msg.correlation_id);
            put_u16(&mut buf, msg.streams.len() as u16);
            for stream in &msg.streams {
                put_i32(&mut buf, *stream);
            }
            put_str(&mut buf, msg.destination.as_str())?;
        }
    }
    Ok(Encoded::new(cmd.msg_type_id(), buf))
}

pub fn decode_command(msg_type_id: i32, payload: &[u8]) -> ProtocolResult<AdminCommand> {
    let mut reader = Reader::new(payload);
    let cmd = match msg_type_id {
        ADD_CHANNEL_MSG_TYPE_ID | REMOVE_CHANNEL_MSG_TYPE_ID => {
            let msg = ChannelMessage {
                correlation_id: reader.i64()?,
                stream_id: reader.i32()?,
                session_id: reader.i32()?,
                destination: reader.destination()?,
            };
            if msg_type_id == ADD_CHANNEL_MSG_TYPE_ID {
                AdminCommand::AddChannel(msg)
            } else {
                AdminCommand::RemoveChannel(msg)
            }
        }
        ADD_RECEIVER_MSG_TYPE_ID | REMOVE_RECEIVER_MSG_TYPE_ID => {
            let correlation_id = reader.i64()?;
            let count = reader.u16()? as usize;
            if count > MAX_RECEIVER_STREAMS {
                return Err(ProtocolError::TooManyStreams {
                    count,
                    max: MAX_RECEIVER_STREAMS,
                });
            }
            let mut streams = StreamList::new();
            for _ in 0..count {
                streams.push(reader.i32()?);
            }
            validate_streams(&streams)?;
            let msg = ReceiverMessage {
                correlation_id,
                destination: reader.destination()?,
                streams,
            };
            if msg_type_id == ADD_RECEIVER_MSG_TYPE_ID {
                AdminCommand::AddReceiver(msg)
            } else {
                AdminCommand::RemoveReceiver(msg)
            }
        }
        other => return Err(ProtocolError::UnknownMessageType(other)),
    };
    reader.finish()?;
    Ok(cmd)
}

pub fn encode_response(response: &DriverResponse) -> ProtocolResult<Encoded> {
    let mut buf = Buf::new();
    match response {
        DriverResponse::Ack { correlation_id } => put_i64(&mut buf, *correlation_id),
        DriverResponse::Error(err) => {
            put_i64(&mut buf, err.correlation_id);
            put_i32(&mut buf, err.kind.code());
            put_str(
                &mut buf,
                err.destination.as_ref().map_or("", Destination::as_str),
            )?;
            put_str(&mut buf, &err.detail)?;
        }
    }
    Ok(Encoded::new(response.msg_type_id(), buf))
}

pub fn decode_response(msg_type_id: i32, payload: &[u8]) -> ProtocolResult<DriverResponse> {
    let mut reader = Reader::new(payload);
    let response = match msg_type_id {
        ON_ACK_MSG_TYPE_ID => DriverResponse::Ack {
            correlation_id: reader.i64()?,
        },
        ON_ERROR_MSG_TYPE_ID => {
            let correlation_id = reader.i64()?;
            let kind = ErrorKind::from_code(reader.i32()?)?;
            let destination = match reader.str()? {
                "" => None,
                value => Some(Destination::new(value)?),
            };
            let detail = reader.str()?.to_owned();
            DriverResponse::Error(ErrorNotification {
                correlation_id,
                kind,
                destination,
                detail,
            })
        }
        other => return Err(ProtocolError::UnknownMessageType(other)),
    };
    reader.finish()?;
    Ok(response)
}

/// [`Codec`] for the client → driver ring.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdminCodec;

impl Codec for AdminCodec {
    type Msg = AdminCommand;

    fn encode(&self, msg: &Self::Msg) -> FabricResult<Encoded> {
        encode_command(msg).map_err(codec_error)
    }

    fn decode(&self, msg_type_id: i32, payload: &[u8]) -> FabricResult<Self::Msg> {
        decode_command(msg_type_id, payload).map_err(codec_error)
    }
}

/// [`Codec`] for the driver → client ring.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResponseCodec;

impl Codec for ResponseCodec {
    type Msg = DriverResponse;

    fn encode(&self, msg: &Self::Msg) -> FabricResult<Encoded> {
        encode_response(msg).map_err(codec_error)
    }

    fn decode(&self, msg_type_id: i32, payload: &[u8]) -> FabricResult<Self::Msg> {
        decode_response(msg_type_id, payload).map_err(codec_error)
    }
}

fn codec_error(err: ProtocolError) -> FabricError {
    FabricError::codec(err.to_string())
}

fn put_u16(buf: &mut Buf, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(buf: &mut Buf, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_i64(buf: &mut Buf, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_str(buf: &mut Buf, value: &str) -> ProtocolResult<()> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::FieldTooLong(value.len()))?;
    put_u16(buf, len);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take<const N: usize>(&mut self) -> ProtocolResult<[u8; N]> {
        let (head, rest) = self.split(N)?;
        self.bytes = rest;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn split(&self, needed: usize) -> ProtocolResult<(&'a [u8], &'a [u8])> {
        if self.bytes.len() < needed {
            return Err(ProtocolError::Truncated {
                needed,
                remaining: self.bytes.len(),
            });
        }
        Ok(self.bytes.split_at(needed))
    }

    fn u16(&mut self) -> ProtocolResult<u16> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    fn i32(&mut self) -> ProtocolResult<i32> {
        self.take::<4>().map(i32::from_le_bytes)
    }

    fn i64(&mut self) -> ProtocolResult<i64> {
        self.take::<8>().map(i64::from_le_bytes)
    }

    fn str(&mut self) -> ProtocolResult<&'a str> {
        let len = self.u16()? as usize;
        let (head, rest) = self.split(len)?;
        self.bytes = rest;
        std::str::from_utf8(head).map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn destination(&mut self) -> ProtocolResult<Destination> {
        Destination::new(self.str()?)
    }

    fn finish(self) -> ProtocolResult<()> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes(self.bytes.len()))
        }
    }
}
