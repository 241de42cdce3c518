//! Frame encoder.

use bytes::{Bytes, BytesMut};

use crate::message::Message;
use crate::varint::encode_uvarint;

/// Bytes reserved per header pool block.
const POOL_BLOCK_SIZE: usize = 10 * 1024;
/// Once fewer than this many bytes remain in the current pool block, a fresh
/// block is allocated. This is purely an allocation-amortization strategy;
/// correctness never depends on the pool's size.
const POOL_LOW_WATERMARK: usize = 100;

/// Serializes `Message`s to their wire chunk sequences. Holds a small
/// bump-allocated pool for header bytes so that back-to-back writes don't
/// each allocate a fresh tiny buffer.
#[derive(Debug)]
pub(crate) struct Encoder {
    pool: BytesMut,
}

impl Default for Encoder {
    fn default() -> Self {
        Encoder {
            pool: BytesMut::with_capacity(POOL_BLOCK_SIZE),
        }
    }
}

impl Encoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Encodes `msg` to an ordered list of byte chunks whose concatenation is
    /// the wire encoding. The payload chunk (if any) is passed through by
    /// reference — never copied.
    pub(crate) fn write(&mut self, msg: &Message) -> Vec<Bytes> {
        if self.pool.capacity() - self.pool.len() < POOL_LOW_WATERMARK {
            self.pool = BytesMut::with_capacity(POOL_BLOCK_SIZE);
        }

        let header_word = (msg.id << 3) | (msg.message_type as u64);
        encode_uvarint(header_word, &mut self.pool);

        let payload_len = if msg.message_type.is_data_bearing() {
            msg.data.len() as u64
        } else {
            0
        };
        encode_uvarint(payload_len, &mut self.pool);

        // `split`, not `split_off`: it splits at the current length and
        // leaves the *remaining* capacity behind in `self.pool` for the next
        // write. `split_off(at)` does the opposite — it truncates `self`'s
        // capacity to `at`, which would force a fresh allocation on every
        // single call and defeat the pool.
        let header_chunk = self.pool.split().freeze();

        let mut out = Vec::with_capacity(2);
        out.push(header_chunk);
        if msg.message_type.is_data_bearing() && !msg.data.is_empty() {
            out.push(msg.data.clone());
        }
        out
    }
}

#[cfg(test)]
mod encoder_test {
    use super::*;
    use crate::message::{Message, MessageType};

    fn concat(chunks: &[Bytes]) -> Vec<u8> {
        chunks.iter().flat_map(|c| c.to_vec()).collect()
    }

    #[test]
    fn header_encode_matches_worked_example() {
        let mut enc = Encoder::new();
        let msg = Message::new_stream(17, "17");
        let chunks = enc.write(&msg);
        let wire = concat(&chunks);
        assert_eq!(wire, vec![0x88, 0x01, 0x02, 0x31, 0x37]);
    }

    #[test]
    fn zero_length_data_message() {
        let mut enc = Encoder::new();
        let msg = Message::control(17, MessageType::CloseInitiator);
        let chunks = enc.write(&msg);
        let wire = concat(&chunks);
        // id=17, type=4 (CLOSE_INITIATOR): header word = 17<<3|4 = 140 = 0x8c
        assert_eq!(wire, vec![0x8c, 0x01, 0x00]);
    }

    #[test]
    fn multi_frame_example() {
        let mut enc = Encoder::new();
        let wire: Vec<u8> = [(17, "17"), (19, "19"), (21, "21")]
            .into_iter()
            .flat_map(|(id, name)| concat(&enc.write(&Message::new_stream(id, name))))
            .collect();
        assert_eq!(
            wire,
            vec![
                0x88, 0x01, 0x02, 0x31, 0x37, 0x98, 0x01, 0x02, 0x31, 0x39, 0xa8, 0x01, 0x02,
                0x32, 0x31,
            ]
        );
    }

    #[test]
    fn payload_is_shared_not_copied() {
        let mut enc = Encoder::new();
        let data = Bytes::from_static(b"hello");
        let msg = Message::data_message(1, MessageType::MessageInitiator, data.clone());
        let chunks = enc.write(&msg);
        // The second chunk must alias the same underlying storage as `data`.
        assert_eq!(chunks[1].as_ptr(), data.as_ptr());
    }
}
