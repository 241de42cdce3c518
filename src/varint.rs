//! Unsigned LEB128 varint encode/decode.

use bytes::{BufMut, BytesMut};

use crate::byte_list::ByteList;
use crate::error::PartialError;

/// Bytes needed to hold a varint never exceed this: 10 groups of 7 bits
/// covers a full `u64`.
const MAX_VARINT_BYTES: usize = 10;

/// Encodes `value` as an unsigned LEB128 varint, appending to `out`.
pub(crate) fn encode_uvarint(mut value: u64, out: &mut BytesMut) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decodes an unsigned LEB128 varint from `list` starting at byte offset
/// `start`. Returns `(value, bytes_consumed)` on success.
///
/// Returns [`PartialError::NeedMoreData`] if `list` is exhausted before a
/// terminating byte (MSB unset) is seen — this is a recoverable signal, the
/// caller should wait for more input. Returns [`PartialError::MalformedVarint`]
/// if more than [`MAX_VARINT_BYTES`] bytes are consumed without terminating.
pub(crate) fn decode_uvarint(list: &ByteList, start: usize) -> Result<(u64, usize), PartialError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    let mut consumed = 0usize;

    loop {
        if consumed >= MAX_VARINT_BYTES {
            return Err(PartialError::MalformedVarint);
        }
        let idx = start + consumed;
        if idx >= list.len() {
            return Err(PartialError::NeedMoreData);
        }
        let byte = list.get(idx);
        consumed += 1;

        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, consumed));
        }
        shift += 7;
    }
}

#[cfg(test)]
mod varint_test {
    use bytes::Bytes;

    use super::*;

    fn encode_to_bytes(value: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_uvarint(value, &mut buf);
        buf.to_vec()
    }

    #[test]
    fn encodes_single_byte_values() {
        assert_eq!(encode_to_bytes(0), vec![0x00]);
        assert_eq!(encode_to_bytes(1), vec![0x01]);
        assert_eq!(encode_to_bytes(127), vec![0x7f]);
    }

    #[test]
    fn encodes_multi_byte_values() {
        // 136 = 0x88 => continuation group of 0x08, then 0x01
        assert_eq!(encode_to_bytes(136), vec![0x88, 0x01]);
        assert_eq!(encode_to_bytes(300), vec![0xac, 0x02]);
    }

    #[test]
    fn round_trips() {
        for value in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64, u64::MAX] {
            let encoded = encode_to_bytes(value);
            let mut list = ByteList::new();
            list.append(Bytes::from(encoded.clone()));
            let (decoded, consumed) = decode_uvarint(&list, 0).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn needs_more_data_on_truncated_input() {
        let mut list = ByteList::new();
        list.append(Bytes::from_static(&[0x88])); // continuation bit set, no follow-up byte
        assert_eq!(
            decode_uvarint(&list, 0),
            Err(PartialError::NeedMoreData)
        );
    }

    #[test]
    fn malformed_past_ten_bytes() {
        let mut list = ByteList::new();
        list.append(Bytes::from(vec![0x80u8; 11]));
        assert_eq!(
            decode_uvarint(&list, 0),
            Err(PartialError::MalformedVarint)
        );
    }
}
