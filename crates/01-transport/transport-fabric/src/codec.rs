use smallvec::SmallVec;

use crate::error::FabricResult;

/// Inline capacity of an encoded payload; admin frames rarely exceed it.
pub const INLINE_PAYLOAD: usize = 160;

/// A message ready to be written into a ring record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Encoded {
    pub msg_type_id: i32,
    pub payload: SmallVec<[u8; INLINE_PAYLOAD]>,
}

impl Encoded {
    pub fn new(msg_type_id: i32, payload: SmallVec<[u8; INLINE_PAYLOAD]>) -> Self {
        Self {
            msg_type_id,
            payload,
        }
    }
}

/// Maps typed messages to ring records and back.
pub trait Codec: Clone + Send + Sync + 'static {
    type Msg: Send + 'static;

    fn encode(&self, msg: &Self::Msg) -> FabricResult<Encoded>;
    fn decode(&self, msg_type_id: i32, payload: &[u8]) -> FabricResult<Self::Msg>;
}
