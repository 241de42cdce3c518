//! Stateful frame decoder.

use bytes::Bytes;

use crate::byte_list::ByteList;
use crate::error::{Error, PartialError};
use crate::message::{Message, MessageType};
use crate::varint::decode_uvarint;

/// A fully-parsed frame header, awaiting `payload_length` more bytes in the
/// accumulator before it can be emitted.
#[derive(Debug, Clone, Copy)]
struct PendingHeader {
    id: u64,
    message_type: MessageType,
    /// Offset within the accumulator where the payload begins.
    payload_offset: usize,
    payload_length: usize,
}

/// Accepts arbitrary byte chunks and emits zero or more complete [`Message`]
/// records. Holds at most one partial frame's worth of bytes at any quiescent
/// moment.
#[derive(Debug, Default)]
pub(crate) struct Decoder {
    accumulator: ByteList,
    pending: Option<PendingHeader>,
}

impl Decoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` to the accumulator and decodes every complete frame
    /// that can now be formed. Returns the messages in wire order.
    ///
    /// On [`Error::InvalidType`] the decoder is permanently wedged (the
    /// accumulator still holds the offending header) — this is unrecoverable,
    /// and the caller (the multiplexer) must tear the connection down rather
    /// than call `write` again.
    pub(crate) fn write(&mut self, chunk: Bytes) -> Result<Vec<Message>, Error> {
        self.accumulator.append(chunk);
        let mut out = Vec::new();

        loop {
            if self.pending.is_none() {
                match self.try_decode_header()? {
                    Some(header) => self.pending = Some(header),
                    None => break,
                }
            }

            let header = self.pending.expect("just set above");
            let available = self.accumulator.len().saturating_sub(header.payload_offset);
            if available < header.payload_length {
                break;
            }

            let data = if header.message_type.is_data_bearing() {
                self.accumulator
                    .sublist(
                        header.payload_offset,
                        header.payload_offset + header.payload_length,
                    )
                    .to_bytes()
            } else {
                Bytes::new()
            };

            self.accumulator
                .consume(header.payload_offset + header.payload_length);
            self.pending = None;

            out.push(Message {
                id: header.id,
                message_type: header.message_type,
                data,
            });
        }

        Ok(out)
    }

    /// Tries to decode one header (two varints) from the front of the
    /// accumulator.
    ///
    /// Returns `Ok(None)` on short input (wait for more bytes). Returns
    /// `Err(Error::InvalidType)` if the type nibble falls outside `0..=6` —
    /// unrecoverable. A malformed (over-long) varint is
    /// treated the same as short input: it can only happen with a peer that
    /// is never going to produce a valid frame, and the read loop will stall
    /// waiting for bytes that complete a 10-byte-or-shorter varint, which
    /// never arrive — an explicit idle/size cap at the transport layer is
    /// the host's responsibility, consistent with mplex having no innate
    /// backpressure mechanism.
    fn try_decode_header(&mut self) -> Result<Option<PendingHeader>, Error> {
        let (header_word, consumed_1) = match decode_uvarint(&self.accumulator, 0) {
            Ok(v) => v,
            Err(PartialError::NeedMoreData) => return Ok(None),
            Err(PartialError::MalformedVarint) => return Ok(None),
        };

        let id = header_word >> 3;
        let type_value = header_word & 0x7;
        let message_type =
            MessageType::from_wire(type_value).ok_or(Error::InvalidType(type_value))?;

        let (payload_length, consumed_2) = match decode_uvarint(&self.accumulator, consumed_1) {
            Ok(v) => v,
            Err(PartialError::NeedMoreData) => return Ok(None),
            Err(PartialError::MalformedVarint) => return Ok(None),
        };

        Ok(Some(PendingHeader {
            id,
            message_type,
            payload_offset: consumed_1 + consumed_2,
            payload_length: payload_length as usize,
        }))
    }
}
