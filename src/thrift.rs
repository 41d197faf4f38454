//! Minimal thrift compact-protocol writer.
//!
//! Only the subset needed to serialise the broker's connect payload is
//! implemented: scalar fields, binary strings, nested structs, lists of
//! integers and string maps. Field headers use the compact protocol's delta
//! encoding and integers are zigzag varints.

use bytes::{BufMut, Bytes, BytesMut};

/// Compact-protocol type codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CompactType {
    /// Struct terminator.
    Stop = 0,
    /// Boolean `true` (encoded in the field header).
    BoolTrue = 1,
    /// Boolean `false` (encoded in the field header).
    BoolFalse = 2,
    /// Signed byte.
    Byte = 3,
    /// 16-bit zigzag varint.
    I16 = 4,
    /// 32-bit zigzag varint.
    I32 = 5,
    /// 64-bit zigzag varint.
    I64 = 6,
    /// Length-prefixed bytes or UTF-8 string.
    Binary = 8,
    /// List header followed by elements.
    List = 9,
    /// Map header followed by key/value pairs.
    Map = 11,
    /// Nested struct.
    Struct = 12,
}

/// Incremental compact-protocol writer.
///
/// # Examples
///
/// ```
/// use mqttot::thrift::CompactWriter;
///
/// let mut writer = CompactWriter::new();
/// writer.write_string(1, "abc");
/// writer.write_i32(2, -1);
/// let bytes = writer.finish();
/// assert_eq!(&bytes[..], &[0x18, 0x03, b'a', b'b', b'c', 0x15, 0x01, 0x00]);
/// ```
#[derive(Debug, Default)]
pub struct CompactWriter {
    buf: BytesMut,
    last_field: i16,
    parents: Vec<i16>,
}

impl CompactWriter {
    /// Create an empty writer positioned inside the top-level struct.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn write_field_header(&mut self, kind: CompactType, id: i16) {
        let delta = id - self.last_field;
        if (1..=15).contains(&delta) {
            #[expect(
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                reason = "delta is within 1..=15"
            )]
            self.buf.put_u8(((delta as u8) << 4) | kind as u8);
        } else {
            self.buf.put_u8(kind as u8);
            self.write_varint(zigzag_i32(i32::from(id)));
        }
        self.last_field = id;
    }

    fn write_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            #[expect(clippy::cast_possible_truncation, reason = "masked to seven bits")]
            self.buf.put_u8((value as u8 & 0x7F) | 0x80);
            value >>= 7;
        }
        #[expect(clippy::cast_possible_truncation, reason = "value < 0x80")]
        self.buf.put_u8(value as u8);
    }

    fn write_bytes_raw(&mut self, value: &[u8]) {
        self.write_varint(value.len() as u64);
        self.buf.put_slice(value);
    }

    /// Write a boolean field.
    pub fn write_bool(&mut self, id: i16, value: bool) {
        let kind = if value {
            CompactType::BoolTrue
        } else {
            CompactType::BoolFalse
        };
        self.write_field_header(kind, id);
    }

    /// Write a signed byte field.
    pub fn write_byte(&mut self, id: i16, value: i8) {
        self.write_field_header(CompactType::Byte, id);
        self.buf.put_i8(value);
    }

    /// Write a 32-bit integer field.
    pub fn write_i32(&mut self, id: i16, value: i32) {
        self.write_field_header(CompactType::I32, id);
        self.write_varint(zigzag_i32(value));
    }

    /// Write a 64-bit integer field.
    pub fn write_i64(&mut self, id: i16, value: i64) {
        self.write_field_header(CompactType::I64, id);
        self.write_varint(zigzag_i64(value));
    }

    /// Write a UTF-8 string field.
    pub fn write_string(&mut self, id: i16, value: &str) { self.write_binary(id, value.as_bytes()); }

    /// Write a binary field.
    pub fn write_binary(&mut self, id: i16, value: &[u8]) {
        self.write_field_header(CompactType::Binary, id);
        self.write_bytes_raw(value);
    }

    /// Write a `list<i32>` field.
    pub fn write_i32_list(&mut self, id: i16, values: &[i32]) {
        self.write_field_header(CompactType::List, id);
        self.write_list_header(CompactType::I32, values.len());
        for value in values {
            self.write_varint(zigzag_i32(*value));
        }
    }

    fn write_list_header(&mut self, elem: CompactType, len: usize) {
        if len < 15 {
            #[expect(clippy::cast_possible_truncation, reason = "len < 15")]
            self.buf.put_u8(((len as u8) << 4) | elem as u8);
        } else {
            self.buf.put_u8(0xF0 | elem as u8);
            self.write_varint(len as u64);
        }
    }

    /// Write a `map<string, string>` field. Entries keep the given order.
    pub fn write_string_map<'a>(&mut self, id: i16, entries: impl ExactSizeIterator<Item = (&'a str, &'a str)>) {
        self.write_field_header(CompactType::Map, id);
        let len = entries.len();
        if len == 0 {
            self.buf.put_u8(0);
            return;
        }
        self.write_varint(len as u64);
        self.buf
            .put_u8(((CompactType::Binary as u8) << 4) | CompactType::Binary as u8);
        for (key, value) in entries {
            self.write_bytes_raw(key.as_bytes());
            self.write_bytes_raw(value.as_bytes());
        }
    }

    /// Open a nested struct field. Must be paired with [`Self::end_struct`].
    pub fn begin_struct(&mut self, id: i16) {
        self.write_field_header(CompactType::Struct, id);
        self.parents.push(self.last_field);
        self.last_field = 0;
    }

    /// Close the innermost nested struct.
    pub fn end_struct(&mut self) {
        self.buf.put_u8(CompactType::Stop as u8);
        self.last_field = self.parents.pop().unwrap_or_default();
    }

    /// Terminate the top-level struct and return the encoded bytes. Any
    /// unclosed nested structs are closed first.
    #[must_use]
    pub fn finish(mut self) -> Bytes {
        while !self.parents.is_empty() {
            self.end_struct();
        }
        self.buf.put_u8(CompactType::Stop as u8);
        self.buf.freeze()
    }
}

#[expect(clippy::cast_sign_loss, reason = "zigzag maps signed to unsigned")]
fn zigzag_i32(n: i32) -> u64 { u64::from(((n << 1) ^ (n >> 31)) as u32) }

#[expect(clippy::cast_sign_loss, reason = "zigzag maps signed to unsigned")]
fn zigzag_i64(n: i64) -> u64 { ((n << 1) ^ (n >> 63)) as u64 }

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, 0)]
    #[case(-1, 1)]
    #[case(1, 2)]
    #[case(-2, 3)]
    #[case(i32::MAX, 4_294_967_294)]
    fn zigzag_reference_values(#[case] input: i32, #[case] expected: u64) {
        assert_eq!(zigzag_i32(input), expected);
        assert_eq!(zigzag_i64(i64::from(input)), expected);
    }

    #[test]
    fn long_field_jumps_use_explicit_ids() {
        let mut writer = CompactWriter::new();
        writer.write_bool(1, true);
        writer.write_string(20, "");
        let bytes = writer.finish();
        // bool true delta 1, then binary with explicit zigzag id 40, empty body, stop
        assert_eq!(&bytes[..], &[0x11, 0x08, 40, 0x00, 0x00]);
    }

    #[test]
    fn nested_structs_restore_parent_field_ids() {
        let mut writer = CompactWriter::new();
        writer.write_string(1, "c");
        writer.begin_struct(4);
        writer.write_i64(1, 5);
        writer.end_struct();
        writer.write_string(5, "p");
        let bytes = writer.finish();
        assert_eq!(
            &bytes[..],
            &[0x18, 1, b'c', 0x3C, 0x16, 10, 0x00, 0x18, 1, b'p', 0x00]
        );
    }

    #[test]
    fn lists_and_maps_encode_headers() {
        let mut writer = CompactWriter::new();
        writer.write_i32_list(1, &[88, 146]);
        writer.write_string_map(2, [("k", "v")].into_iter());
        let bytes = writer.finish();
        assert_eq!(
            &bytes[..],
            &[0x19, 0x25, 176, 1, 164, 2, 0x1B, 1, 0x88, 1, b'k', 1, b'v', 0x00]
        );
    }
}
