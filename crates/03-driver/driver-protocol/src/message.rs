//! Typed admin commands and driver responses.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::{ProtocolError, ProtocolResult};

/// Longest destination accepted on the wire, in bytes.
pub const MAX_DESTINATION_LENGTH: usize = 128;
/// Most streams a single receiver may subscribe to.
pub const MAX_RECEIVER_STREAMS: usize = 16;
/// Encoded size of the largest admin command: a receiver with the most
/// streams and the longest destination.
pub const MAX_COMMAND_LENGTH: usize =
    8 + 2 + 4 * MAX_RECEIVER_STREAMS + 2 + MAX_DESTINATION_LENGTH;
/// Correlation id used by responses that answer no particular command.
pub const NO_CORRELATION_ID: i64 = -1;

pub const ADD_CHANNEL_MSG_TYPE_ID: i32 = 0x01;
pub const REMOVE_CHANNEL_MSG_TYPE_ID: i32 = 0x02;
pub const ADD_RECEIVER_MSG_TYPE_ID: i32 = 0x03;
pub const REMOVE_RECEIVER_MSG_TYPE_ID: i32 = 0x04;
pub const ON_ACK_MSG_TYPE_ID: i32 = 0x11;
pub const ON_ERROR_MSG_TYPE_ID: i32 = 0x12;

/// Validated, immutable address a source sends to or a receiver listens on.
///
/// The address syntax itself belongs to the media driver; here a destination
/// is any non-empty UTF-8 string of at most [`MAX_DESTINATION_LENGTH`] bytes
/// without control characters. Clones share one allocation.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination(Arc<str>);

impl Destination {
    pub fn new(value: &str) -> ProtocolResult<Self> {
        if value.is_empty() {
            return Err(ProtocolError::InvalidDestination("empty"));
        }
        if value.len() > MAX_DESTINATION_LENGTH {
            return Err(ProtocolError::InvalidDestination("longer than 128 bytes"));
        }
        if value.chars().any(char::is_control) {
            return Err(ProtocolError::InvalidDestination("contains control characters"));
        }
        Ok(Self(Arc::from(value)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Destination {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for Destination {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Destination({:?})", &*self.0)
    }
}

/// Stream filter of a receiver: 1..=16 distinct stream ids in caller order.
pub type StreamList = SmallVec<[i32; 4]>;

/// Checks a receiver's stream filter.
pub fn validate_streams(streams: &[i32]) -> ProtocolResult<()> {
    if streams.is_empty() {
        return Err(ProtocolError::NoStreams);
    }
    if streams.len() > MAX_RECEIVER_STREAMS {
        return Err(ProtocolError::TooManyStreams {
            count: streams.len(),
            max: MAX_RECEIVER_STREAMS,
        });
    }
    for (i, stream) in streams.iter().enumerate() {
        if streams[..i].contains(stream) {
            return Err(ProtocolError::DuplicateStream(*stream));
        }
    }
    Ok(())
}

/// Identifies one source channel in a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMessage {
    pub correlation_id: i64,
    pub destination: Destination,
    pub stream_id: i32,
    pub session_id: i32,
}

/// Identifies one receiver in a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiverMessage {
    pub correlation_id: i64,
    pub destination: Destination,
    pub streams: StreamList,
}

/// Requests sent from the client towards the media driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminCommand {
    AddChannel(ChannelMessage),
    RemoveChannel(ChannelMessage),
    AddReceiver(ReceiverMessage),
    RemoveReceiver(ReceiverMessage),
}

impl AdminCommand {
    pub fn msg_type_id(&self) -> i32 {
        match self {
            AdminCommand::AddChannel(_) => ADD_CHANNEL_MSG_TYPE_ID,
            AdminCommand::RemoveChannel(_) => REMOVE_CHANNEL_MSG_TYPE_ID,
            AdminCommand::AddReceiver(_) => ADD_RECEIVER_MSG_TYPE_ID,
            AdminCommand::RemoveReceiver(_) => REMOVE_RECEIVER_MSG_TYPE_ID,
        }
    }

    pub fn correlation_id(&self) -> i64 {
        match self {
            AdminCommand::AddChannel(msg) | AdminCommand::RemoveChannel(msg) => msg.correlation_id,
            AdminCommand::AddReceiver(msg) | AdminCommand::RemoveReceiver(msg) => {
                msg.correlation_id
            }
        }
    }

    pub fn destination(&self) -> &Destination {
        match self {
            AdminCommand::AddChannel(msg) | AdminCommand::RemoveChannel(msg) => &msg.destination,
            AdminCommand::AddReceiver(msg) | AdminCommand::RemoveReceiver(msg) => {
                &msg.destination
            }
        }
    }
}

/// Category of an asynchronous driver failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Destination unreachable or rejected by the driver.
    InvalidDestination,
    /// Session id already registered on the same destination and stream.
    SessionConflict,
    /// Command referred to an endpoint the driver does not know.
    UnknownEndpoint,
    Generic,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::InvalidDestination => 1,
            ErrorKind::SessionConflict => 2,
            ErrorKind::UnknownEndpoint => 3,
            ErrorKind::Generic => 4,
        }
    }

    pub fn from_code(code: i32) -> ProtocolResult<Self> {
        match code {
            1 => Ok(ErrorKind::InvalidDestination),
            2 => Ok(ErrorKind::SessionConflict),
            3 => Ok(ErrorKind::UnknownEndpoint),
            4 => Ok(ErrorKind::Generic),
            other => Err(ProtocolError::UnknownErrorKind(other)),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidDestination => "invalid destination",
            ErrorKind::SessionConflict => "session conflict",
            ErrorKind::UnknownEndpoint => "unknown endpoint",
            ErrorKind::Generic => "generic error",
        };
        f.write_str(name)
    }
}

/// Asynchronous failure reported by the driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorNotification {
    pub correlation_id: i64,
    pub kind: ErrorKind,
    /// Absent when the failure is not tied to a destination.
    pub destination: Option<Destination>,
    pub detail: String,
}

/// Messages sent from the media driver back to the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverResponse {
    Ack { correlation_id: i64 },
    Error(ErrorNotification),
}

impl DriverResponse {
    pub fn msg_type_id(&self) -> i32 {
        match self {
            DriverResponse::Ack { .. } => ON_ACK_MSG_TYPE_ID,
            DriverResponse::Error(_) => ON_ERROR_MSG_TYPE_ID,
        }
    }

    pub fn correlation_id(&self) -> i64 {
        match self {
            DriverResponse::Ack { correlation_id } => *correlation_id,
            DriverResponse::Error(err) => err.correlation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_validation() {
        assert!(Destination::new("udp://localhost:40123").is_ok());
        assert_eq!(
            Destination::new(""),
            Err(ProtocolError::InvalidDestination("empty"))
        );
        assert!(Destination::new(&"x".repeat(MAX_DESTINATION_LENGTH)).is_ok());
        assert!(Destination::new(&"x".repeat(MAX_DESTINATION_LENGTH + 1)).is_err());
        assert!(Destination::new("udp://host\n:1").is_err());
        assert_eq!(
            "udp://a:1".parse::<Destination>().unwrap().to_string(),
            "udp://a:1"
        );
    }

    #[test]
    fn stream_list_validation() {
        assert!(validate_streams(&[1]).is_ok());
        assert_eq!(validate_streams(&[]), Err(ProtocolError::NoStreams));
        assert_eq!(
            validate_streams(&[1, 2, 1]),
            Err(ProtocolError::DuplicateStream(1))
        );
        let many: Vec<i32> = (0..17).collect();
        assert!(matches!(
            validate_streams(&many),
            Err(ProtocolError::TooManyStreams { count: 17, .. })
        ));
    }

    #[test]
    fn error_kind_codes_are_stable() {
        for kind in [
            ErrorKind::InvalidDestination,
            ErrorKind::SessionConflict,
            ErrorKind::UnknownEndpoint,
            ErrorKind::Generic,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), Ok(kind));
        }
        assert_eq!(
            ErrorKind::from_code(9),
            Err(ProtocolError::UnknownErrorKind(9))
        );
    }
}
