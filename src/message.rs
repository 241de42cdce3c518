//! The mplex wire record.

use bytes::Bytes;

use crate::error::Error;

/// One of the seven mplex frame kinds. Discriminant values are wire-stable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    NewStream = 0,
    MessageReceiver = 1,
    MessageInitiator = 2,
    CloseReceiver = 3,
    CloseInitiator = 4,
    ResetReceiver = 5,
    ResetInitiator = 6,
}

impl MessageType {
    /// Maps a wire type value to a `MessageType`, or `None` if it falls
    /// outside `0..=6` (fatal `InvalidType` at the decoder).
    pub(crate) fn from_wire(v: u64) -> Option<Self> {
        match v {
            0 => Some(MessageType::NewStream),
            1 => Some(MessageType::MessageReceiver),
            2 => Some(MessageType::MessageInitiator),
            3 => Some(MessageType::CloseReceiver),
            4 => Some(MessageType::CloseInitiator),
            5 => Some(MessageType::ResetReceiver),
            6 => Some(MessageType::ResetInitiator),
            _ => None,
        }
    }

    /// Whether this type carries a `data` field on the wire.
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            MessageType::NewStream | MessageType::MessageReceiver | MessageType::MessageInitiator
        )
    }

    /// `type & 1` directional routing table: odd types are
    /// the `_RECEIVER` family and route to the local initiators map; even
    /// positive types are the `_INITIATOR` family and route to the local
    /// receivers map. Only meaningful for non-`NewStream` types.
    pub(crate) fn routes_to_initiators_map(self) -> bool {
        (self as u8) & 1 == 1
    }
}

/// One decoded or to-be-encoded mplex frame.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: u64,
    pub message_type: MessageType,
    /// Present only for data-bearing types (`NewStream`, `MessageInitiator`,
    /// `MessageReceiver`); empty `Bytes` for every other type.
    pub data: Bytes,
}

impl Message {
    pub(crate) fn new_stream(id: u64, name: &str) -> Self {
        Message {
            id,
            message_type: MessageType::NewStream,
            data: Bytes::copy_from_slice(name.as_bytes()),
        }
    }

    pub(crate) fn data_message(id: u64, message_type: MessageType, data: Bytes) -> Self {
        debug_assert!(
            matches!(
                message_type,
                MessageType::MessageInitiator | MessageType::MessageReceiver
            ),
            "data_message used with a non-MESSAGE_* type"
        );
        Message {
            id,
            message_type,
            data,
        }
    }

    pub(crate) fn control(id: u64, message_type: MessageType) -> Self {
        debug_assert!(
            !message_type.is_data_bearing() || message_type == MessageType::NewStream,
            "control() used with a MESSAGE_* type"
        );
        Message {
            id,
            message_type,
            data: Bytes::new(),
        }
    }
}

/// Computes the opposite-direction reset type used when the multiplexer
/// force-resets an overflowing stream: a stream fed by
/// `MESSAGE_INITIATOR` frames is reset with `RESET_RECEIVER`, and vice versa.
pub(crate) fn opposite_reset_type(incoming: MessageType) -> Result<MessageType, Error> {
    match incoming {
        MessageType::MessageInitiator => Ok(MessageType::ResetReceiver),
        MessageType::MessageReceiver => Ok(MessageType::ResetInitiator),
        other => Err(Error::InvalidType(other as u8 as u64)),
    }
}
