//! Wire format of stream messages.
//!
//! Every record on a data channel is one length-delimited protobuf message
//! carrying optional flag and data fields. A record never exceeds
//! [`MAX_MESSAGE_SIZE`]; larger application writes are chunked.

use prost::Message as _;

use crate::error::StreamError;

/// Upper bound for one data-channel message, including framing.
pub const MAX_MESSAGE_SIZE: usize = 16384;

/// Varint length prefix plus field tags and data length.
const PROTO_OVERHEAD: usize = 5;

/// Largest data payload a single record may carry.
pub const MAX_DATA_LEN: usize = MAX_MESSAGE_SIZE - PROTO_OVERHEAD;

/// Stream control flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Flag {
    /// The sender will transmit no more data.
    Fin = 0,
    /// The receiver refuses further data; the peer's writes fail.
    StopSending = 1,
    /// Abortive close of both directions.
    Reset = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamMessage {
    #[prost(enumeration = "Flag", optional, tag = "1")]
    pub flag: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub data: Option<Vec<u8>>,
}

impl StreamMessage {
    pub fn data_message(bytes: Vec<u8>) -> Self {
        Self {
            flag: None,
            data: Some(bytes),
        }
    }

    pub fn flag_message(flag: Flag) -> Self {
        Self {
            flag: Some(flag as i32),
            data: None,
        }
    }

    /// The flag carried by this record, ignoring unknown values.
    pub fn flag_value(&self) -> Option<Flag> {
        self.flag.and_then(|raw| Flag::try_from(raw).ok())
    }

    pub(crate) fn encode_framed(&self) -> Vec<u8> {
        self.encode_length_delimited_to_vec()
    }

    pub(crate) fn decode_framed(buf: &[u8]) -> Result<Self, StreamError> {
        Self::decode_length_delimited(buf).map_err(|err| StreamError::Malformed(err.to_string()))
    }
}
