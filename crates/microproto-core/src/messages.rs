//! Fixed-layout messages (HELLO, PING/PONG, ERROR) and property updates.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, ProtoError, Result};
use crate::types::{PropertyType, Value};
use crate::wire::{batch_count_byte, encode_varint, OpCode, OpHeader, WireReader};

pub const HELLO_REQUEST_LEN: usize = 8;
pub const HELLO_RESPONSE_LEN: usize = 12;
pub const HEARTBEAT_LEN: usize = 5;

const ERROR_HAS_RELATED_OPCODE: u8 = 0x01;

/// Longest `ERROR` text put on the wire, in bytes.
pub const MAX_ERROR_MESSAGE_LEN: usize = u16::MAX as usize;

fn expect_opcode(r: &mut WireReader<'_>, expected: OpCode) -> Result<OpHeader> {
    let header = OpHeader::decode(r.u8()?);
    let opcode = header.opcode()?;
    if opcode != expected {
        return Err(ProtoError::malformed(format!(
            "expected {expected:?}, got {opcode:?}"
        )));
    }
    Ok(header)
}

/// Client greeting: `header, version:u8, max_packet:u16, device_id:u32`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub version: u8,
    pub max_packet_size: u16,
    pub device_id: u32,
}

impl HelloRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HELLO_REQUEST_LEN);
        buf.put_u8(OpHeader::new(OpCode::Hello).encode());
        buf.put_u8(self.version);
        buf.put_u16_le(self.max_packet_size);
        buf.put_u32_le(self.device_id);
        buf.freeze()
    }

    /// Bytes past the fixed 8-byte layout are ignored.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(frame);
        expect_opcode(&mut r, OpCode::Hello)?;
        Ok(Self {
            version: r.u8()?,
            max_packet_size: r.u16()?,
            device_id: r.u32()?,
        })
    }
}

/// Device reply: `header, version:u8, max_packet:u16, session_id:u32, timestamp:u32`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloResponse {
    pub version: u8,
    pub max_packet_size: u16,
    pub session_id: u32,
    pub timestamp: u32,
}

impl HelloResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HELLO_RESPONSE_LEN);
        buf.put_u8(OpHeader::new(OpCode::Hello).encode());
        buf.put_u8(self.version);
        buf.put_u16_le(self.max_packet_size);
        buf.put_u32_le(self.session_id);
        buf.put_u32_le(self.timestamp);
        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < HELLO_RESPONSE_LEN {
            return Err(ProtoError::TruncatedMessage);
        }
        let mut r = WireReader::new(frame);
        expect_opcode(&mut r, OpCode::Hello)?;
        Ok(Self {
            version: r.u8()?,
            max_packet_size: r.u16()?,
            session_id: r.u32()?,
            timestamp: r.u32()?,
        })
    }
}

fn encode_heartbeat(opcode: OpCode, payload: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEARTBEAT_LEN);
    buf.put_u8(OpHeader::new(opcode).encode());
    buf.put_u32_le(payload);
    buf.freeze()
}

pub fn encode_ping(payload: u32) -> Bytes {
    encode_heartbeat(OpCode::Ping, payload)
}

pub fn encode_pong(payload: u32) -> Bytes {
    encode_heartbeat(OpCode::Pong, payload)
}

/// Payload of a PING or PONG frame. The frame must be exactly 5 bytes.
pub fn decode_heartbeat(frame: &[u8]) -> Result<u32> {
    let mut r = WireReader::new(frame);
    let header = OpHeader::decode(r.u8()?);
    match header.opcode()? {
        OpCode::Ping | OpCode::Pong => {}
        other => {
            return Err(ProtoError::malformed(format!(
                "expected heartbeat, got {other:?}"
            )))
        }
    }
    let payload = r.u32()?;
    if !r.is_empty() {
        return Err(ProtoError::malformed("heartbeat payload longer than 4 bytes"));
    }
    Ok(payload)
}

/// `header(flags bit0 = has_related_opcode), code:u16, varint(len), message, [related_opcode]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
    pub related_opcode: Option<u8>,
}

impl ErrorMessage {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            related_opcode: None,
        }
    }

    pub fn related_to(mut self, opcode: OpCode) -> Self {
        self.related_opcode = Some(opcode as u8);
        self
    }

    pub fn from_error(err: &ProtoError) -> Self {
        Self::new(err.wire_code(), err.to_string())
    }

    pub fn encode(&self) -> Bytes {
        let flags = if self.related_opcode.is_some() {
            ERROR_HAS_RELATED_OPCODE
        } else {
            0
        };
        let mut buf = BytesMut::with_capacity(4 + self.message.len() + 1);
        buf.put_u8(OpHeader::new(OpCode::Error).with_flags(flags).encode());
        buf.put_u16_le(self.code.0);
        // clamped so encoding cannot fail
        let message = truncate_utf8(&self.message, MAX_ERROR_MESSAGE_LEN);
        encode_varint(message.len() as u32, &mut buf);
        buf.put_slice(message.as_bytes());
        if let Some(op) = self.related_opcode {
            buf.put_u8(op);
        }
        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(frame);
        let header = expect_opcode(&mut r, OpCode::Error)?;
        let code = ErrorCode(r.u16()?);
        let message = r.utf8()?;
        let related_opcode = if header.flags & ERROR_HAS_RELATED_OPCODE != 0 {
            Some(r.u8()?)
        } else {
            None
        };
        Ok(Self {
            code,
            message,
            related_opcode,
        })
    }
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Per-item flags of a property update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFlags {
    pub has_timestamp: bool,
    pub force_notify: bool,
    pub has_version: bool,
}

impl UpdateFlags {
    pub fn from_byte(b: u8) -> Self {
        Self {
            has_timestamp: b & 0x01 != 0,
            force_notify: b & 0x02 != 0,
            has_version: b & 0x04 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        (self.has_timestamp as u8) | ((self.force_notify as u8) << 1) | ((self.has_version as u8) << 2)
    }
}

/// One `(id, value)` pair to put on the wire.
#[derive(Clone, Copy, Debug)]
pub struct UpdateEntry<'a> {
    pub id: u8,
    pub ty: &'a PropertyType,
    pub value: &'a Value,
}

/// Build one PROPERTY_UPDATE_SHORT message. One entry is sent unbatched,
/// 2..=256 entries as a batch. Item flags are always 0.
pub fn encode_property_update(entries: &[UpdateEntry<'_>]) -> Result<Bytes> {
    encode_update(OpCode::PropertyUpdateShort, entries)
}

/// Build one PROPERTY_UPDATE_LONG message: same layout as the short form
/// with each id written as `u16` LE.
pub fn encode_property_update_long(entries: &[UpdateEntry<'_>]) -> Result<Bytes> {
    encode_update(OpCode::PropertyUpdateLong, entries)
}

fn encode_update(opcode: OpCode, entries: &[UpdateEntry<'_>]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(2 + entries.len() * 7);
    match entries.len() {
        0 => return Err(ProtoError::malformed("property update needs at least one entry")),
        1 => buf.put_u8(OpHeader::new(opcode).encode()),
        n => {
            buf.put_u8(OpHeader::new(opcode).batched(true).encode());
            buf.put_u8(batch_count_byte(n)?);
        }
    }
    for entry in entries {
        if opcode == OpCode::PropertyUpdateLong {
            buf.put_u16_le(u16::from(entry.id));
        } else {
            buf.put_u8(entry.id);
        }
        buf.put_u8(0);
        entry.value.encode(entry.ty, &mut buf)?;
    }
    Ok(buf.freeze())
}

/// An update entry located in an inbound frame, value still encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawUpdate {
    pub id: u8,
    pub flags: UpdateFlags,
    pub timestamp: Option<u32>,
    /// `(version, source_node)`.
    pub version: Option<(u32, u32)>,
    pub value: Bytes,
}

/// Result of splitting an inbound update frame.
///
/// Both PROPERTY_UPDATE_SHORT and PROPERTY_UPDATE_LONG frames are accepted;
/// `opcode` says which one was split. Long ids above 255 cannot name a
/// property and end the split with `PropertyIdOutOfRange`.
///
/// Entries are located using the value length implied by each property's
/// type. The first entry that cannot be located ends the split: later entries
/// have no known offset. `error` carries why.
#[derive(Debug, Default)]
pub struct SplitUpdates {
    pub opcode: Option<OpCode>,
    pub entries: Vec<RawUpdate>,
    pub error: Option<ProtoError>,
}

pub fn split_update_frame(
    frame: &Bytes,
    lookup: impl Fn(u8) -> Option<PropertyType>,
) -> SplitUpdates {
    let mut out = SplitUpdates::default();
    let mut r = WireReader::new(frame);
    let header = match r.u8() {
        Ok(b) => OpHeader::decode(b),
        Err(e) => {
            out.error = Some(e);
            return out;
        }
    };
    let wide_ids = match header.opcode() {
        Ok(OpCode::PropertyUpdateShort) => false,
        Ok(OpCode::PropertyUpdateLong) => true,
        Ok(other) => {
            out.error = Some(ProtoError::malformed(format!(
                "{other:?} is not a property update"
            )));
            return out;
        }
        Err(e) => {
            out.error = Some(e);
            return out;
        }
    };
    out.opcode = Some(if wide_ids {
        OpCode::PropertyUpdateLong
    } else {
        OpCode::PropertyUpdateShort
    });
    let count = if header.batch {
        match r.u8() {
            Ok(b) => b as usize + 1,
            Err(e) => {
                out.error = Some(e);
                return out;
            }
        }
    } else {
        1
    };
    for _ in 0..count {
        match next_raw_update(frame, &mut r, wide_ids, &lookup) {
            Ok(raw) => out.entries.push(raw),
            Err(e) => {
                out.error = Some(e);
                return out;
            }
        }
    }
    if !r.is_empty() {
        out.error = Some(ProtoError::malformed(format!(
            "{} trailing bytes after update entries",
            r.remaining()
        )));
    }
    out
}

fn next_raw_update(
    frame: &Bytes,
    r: &mut WireReader<'_>,
    wide_ids: bool,
    lookup: &impl Fn(u8) -> Option<PropertyType>,
) -> Result<RawUpdate> {
    let id = if wide_ids {
        let wide = r.u16()?;
        u8::try_from(wide).map_err(|_| ProtoError::PropertyIdOutOfRange(wide))?
    } else {
        r.u8()?
    };
    let flags = UpdateFlags::from_byte(r.u8()?);
    let timestamp = if flags.has_timestamp {
        Some(r.u32()?)
    } else {
        None
    };
    let version = if flags.has_version {
        Some((r.u32()?, r.u32()?))
    } else {
        None
    };
    let ty = lookup(id).ok_or(ProtoError::UnknownProperty(id))?;
    let start = r.position();
    let len = ty.measure(r)?;
    Ok(RawUpdate {
        id,
        flags,
        timestamp,
        version,
        value: frame.slice(start..start + len),
    })
}

/// Fully decode an update frame into `(id, value)` pairs. Fails on the first
/// bad entry.
pub fn decode_property_update(
    frame: &Bytes,
    lookup: impl Fn(u8) -> Option<PropertyType>,
) -> Result<Vec<(u8, Value)>> {
    let split = split_update_frame(frame, &lookup);
    if let Some(err) = split.error {
        return Err(err);
    }
    split
        .entries
        .into_iter()
        .map(|raw| {
            let ty = lookup(raw.id).ok_or(ProtoError::UnknownProperty(raw.id))?;
            let mut r = WireReader::new(&raw.value);
            Ok((raw.id, Value::decode(&mut r, &ty)?))
        })
        .collect()
}
