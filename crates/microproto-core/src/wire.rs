// Low-level wire primitives: operation header, varints, bounded reader.
use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ProtoError, Result};

pub const PROTOCOL_VERSION: u8 = 1;

/// Longest varint the decoder accepts (32-bit ceiling).
pub const MAX_VARINT_LEN: usize = 5;

/// Most entries a single batched message can carry (count is sent as `count - 1`).
pub const MAX_BATCH: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Hello = 0x00,
    PropertyUpdateShort = 0x01,
    /// Same entries as the short form with a `u16` property id.
    PropertyUpdateLong = 0x02,
    SchemaUpsert = 0x03,
    Error = 0x07,
    Ping = 0x08,
    Pong = 0x09,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(OpCode::Hello),
            0x01 => Ok(OpCode::PropertyUpdateShort),
            0x02 => Ok(OpCode::PropertyUpdateLong),
            0x03 => Ok(OpCode::SchemaUpsert),
            0x07 => Ok(OpCode::Error),
            0x08 => Ok(OpCode::Ping),
            0x09 => Ok(OpCode::Pong),
            other => Err(ProtoError::UnknownOpcode(other)),
        }
    }
}

/// Operation header byte.
///
/// Bit layout: `[0:3]` opcode, `[4:6]` flags, `[7]` batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpHeader {
    pub opcode: u8,
    pub flags: u8,
    pub batch: bool,
}

impl OpHeader {
    pub fn new(opcode: OpCode) -> Self {
        Self {
            opcode: opcode as u8,
            flags: 0,
            batch: false,
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags & 0x07;
        self
    }

    pub fn batched(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }

    /// Never fails: every byte is a valid header. Unknown opcodes surface
    /// through [`OpHeader::opcode`].
    pub fn decode(byte: u8) -> Self {
        Self {
            opcode: byte & 0x0F,
            flags: (byte >> 4) & 0x07,
            batch: byte & 0x80 != 0,
        }
    }

    pub fn encode(&self) -> u8 {
        ((self.batch as u8) << 7) | ((self.flags & 0x07) << 4) | (self.opcode & 0x0F)
    }

    pub fn opcode(&self) -> Result<OpCode> {
        OpCode::from_u8(self.opcode)
    }
}

/// Append `value` as an unsigned LEB128 varint using the minimal byte count.
pub fn encode_varint(mut value: u32, buf: &mut BytesMut) -> usize {
    let mut written = 0;
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        written += 1;
        if value == 0 {
            buf.put_u8(byte);
            return written;
        }
        buf.put_u8(byte | 0x80);
    }
}

pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

/// Decode a varint from the front of `input`, returning `(value, bytes_consumed)`.
///
/// Consumes at most [`MAX_VARINT_LEN`] bytes. A continuation bit on the fifth
/// byte, or a value wider than 32 bits, is malformed input.
pub fn decode_varint(input: &[u8]) -> Result<(u32, usize)> {
    let mut result: u64 = 0;
    for (i, &byte) in input.iter().take(MAX_VARINT_LEN).enumerate() {
        result |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return u32::try_from(result)
                .map(|v| (v, i + 1))
                .map_err(|_| ProtoError::malformed("varint exceeds 32 bits"));
        }
    }
    if input.len() < MAX_VARINT_LEN {
        Err(ProtoError::TruncatedMessage)
    } else {
        Err(ProtoError::malformed("varint longer than 5 bytes"))
    }
}

/// Bounded little-endian reader. Every read checks the remaining length first,
/// so a short buffer yields `TruncatedMessage` instead of a partial value.
#[derive(Clone, Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    start_len: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            start_len: buf.len(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes consumed since construction.
    pub fn position(&self) -> usize {
        self.start_len - self.buf.len()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            Err(ProtoError::TruncatedMessage)
        } else {
            Ok(())
        }
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn i8(&mut self) -> Result<i8> {
        self.need(1)?;
        Ok(self.buf.get_i8())
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn f32(&mut self) -> Result<f32> {
        self.need(4)?;
        Ok(self.buf.get_f32_le())
    }

    pub fn varint(&mut self) -> Result<u32> {
        let (value, used) = decode_varint(self.buf)?;
        self.buf.advance(used);
        Ok(value)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    /// `u8` length + bytes.
    pub fn ident(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtoError::malformed("ident is not UTF-8"))
    }

    /// `varint` byte length + UTF-8 bytes.
    pub fn utf8(&mut self) -> Result<String> {
        let len = self.varint()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtoError::malformed("string is not UTF-8"))
    }

    /// Everything not yet consumed.
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }
}

/// Write a `u8`-length-prefixed identifier.
pub fn put_ident(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u8::try_from(s.len()).map_err(|_| ProtoError::malformed("ident longer than 255 bytes"))?;
    buf.put_u8(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Write a varint-length-prefixed UTF-8 string. The length is a byte count.
pub fn put_utf8(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u32::try_from(s.len()).map_err(|_| ProtoError::malformed("string too long"))?;
    encode_varint(len, buf);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Batch count byte for `n` entries (`n - 1`, so 1..=256).
pub fn batch_count_byte(n: usize) -> Result<u8> {
    if n == 0 || n > MAX_BATCH {
        return Err(ProtoError::malformed(format!("batch of {n} entries")));
    }
    Ok((n - 1) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_all_bytes() {
        for byte in 0..=u8::MAX {
            let header = OpHeader::decode(byte);
            assert_eq!(header.encode(), byte);
        }
    }

    #[test]
    fn header_fields() {
        let h = OpHeader::decode(0x83);
        assert_eq!(h.opcode, 3);
        assert_eq!(h.flags, 0);
        assert!(h.batch);
        assert_eq!(h.opcode().unwrap(), OpCode::SchemaUpsert);

        let h = OpHeader::decode(0x17);
        assert_eq!(h.opcode().unwrap(), OpCode::Error);
        assert_eq!(h.flags, 1);
        assert!(!h.batch);
    }

    #[test]
    fn long_update_opcode_decodes() {
        let h = OpHeader::decode(0x82);
        assert_eq!(h.opcode().unwrap(), OpCode::PropertyUpdateLong);
        assert!(h.batch);
        assert_eq!(OpHeader::new(OpCode::PropertyUpdateLong).encode(), 0x02);
    }

    #[test]
    fn unknown_opcode_reported_by_caller() {
        let h = OpHeader::decode(0x0B);
        assert_eq!(h.opcode(), Err(ProtoError::UnknownOpcode(0x0B)));
    }

    #[test]
    fn varint_boundaries() {
        let samples = [
            0u32,
            1,
            0x7F,
            0x80,
            0x3FFF,
            0x4000,
            0x1F_FFFF,
            0x20_0000,
            0x0FFF_FFFF,
            0x1000_0000,
            u32::MAX,
        ];
        for v in samples {
            let mut buf = BytesMut::new();
            let written = encode_varint(v, &mut buf);
            assert_eq!(written, buf.len());
            assert_eq!(written, varint_len(v), "len mismatch for {v}");
            assert!(written <= MAX_VARINT_LEN);
            assert_eq!(decode_varint(&buf).unwrap(), (v, written));
        }
    }

    #[test]
    fn varint_stride_roundtrip() {
        let mut v: u32 = 0;
        loop {
            let mut buf = BytesMut::new();
            let n = encode_varint(v, &mut buf);
            assert_eq!(decode_varint(&buf).unwrap(), (v, n));
            match v.checked_add(0x0001_3579) {
                Some(next) => v = next,
                None => break,
            }
        }
    }

    #[test]
    fn varint_minimal_encoding() {
        let mut buf = BytesMut::new();
        encode_varint(300, &mut buf);
        assert_eq!(&buf[..], &[0xAC, 0x02]);
    }

    #[test]
    fn varint_sixth_byte_is_malformed() {
        let input = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert!(matches!(decode_varint(&input), Err(ProtoError::Malformed(_))));
    }

    #[test]
    fn varint_over_32_bits_is_malformed() {
        let input = [0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
        assert!(matches!(decode_varint(&input), Err(ProtoError::Malformed(_))));
    }

    #[test]
    fn varint_truncated() {
        assert_eq!(decode_varint(&[0x80, 0x80]), Err(ProtoError::TruncatedMessage));
        assert_eq!(decode_varint(&[]), Err(ProtoError::TruncatedMessage));
    }

    #[test]
    fn reader_little_endian() {
        let data = [0x01, 0x34, 0x12, 0x78, 0x56, 0x34];
        let mut r = WireReader::new(&data);
        assert_eq!(r.u8().unwrap(), 1);
        assert_eq!(r.u16().unwrap(), 0x1234);
        assert_eq!(r.u32(), Err(ProtoError::TruncatedMessage));
        // failed read consumed nothing
        assert_eq!(r.remaining(), 3);
        assert_eq!(r.position(), 3);
    }

    #[test]
    fn utf8_length_is_byte_count() {
        let mut buf = BytesMut::new();
        put_utf8(&mut buf, "héllo ✓").unwrap();
        assert_eq!(buf[0] as usize, "héllo ✓".len());
        let mut r = WireReader::new(&buf);
        assert_eq!(r.utf8().unwrap(), "héllo ✓");
        assert!(r.is_empty());
    }

    #[test]
    fn ident_too_long() {
        let mut buf = BytesMut::new();
        let long = "x".repeat(256);
        assert!(put_ident(&mut buf, &long).is_err());
    }

    #[test]
    fn batch_count_bounds() {
        assert_eq!(batch_count_byte(1).unwrap(), 0);
        assert_eq!(batch_count_byte(256).unwrap(), 255);
        assert!(batch_count_byte(0).is_err());
        assert!(batch_count_byte(257).is_err());
    }
}
