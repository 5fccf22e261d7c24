//! Property type model and the scalar/container value codec.
//!
//! All multi-byte scalars are little-endian. `Array<T, N>` carries no length
//! prefix (the count is schema-known); `List<T>` is `varint(count)` followed by
//! `count` packed elements.

use std::borrow::Cow;
use std::fmt;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};
use crate::wire::{encode_varint, WireReader};

pub const TYPE_ARRAY: u8 = 0x20;
pub const TYPE_LIST: u8 = 0x21;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Bool,
    Int8,
    UInt8,
    Int32,
    Float32,
}

impl ScalarType {
    pub fn type_id(self) -> u8 {
        match self {
            Self::Bool => 0x01,
            Self::Int8 => 0x02,
            Self::UInt8 => 0x03,
            Self::Int32 => 0x04,
            Self::Float32 => 0x05,
        }
    }

    pub fn from_type_id(id: u8) -> Result<Self> {
        match id {
            0x01 => Ok(Self::Bool),
            0x02 => Ok(Self::Int8),
            0x03 => Ok(Self::UInt8),
            0x04 => Ok(Self::Int32),
            0x05 => Ok(Self::Float32),
            other => Err(ProtoError::malformed(format!(
                "unknown scalar type id 0x{other:02X}"
            ))),
        }
    }

    /// Encoded width in bytes.
    pub fn width(self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int32 | Self::Float32 => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
            Self::Int32 => "int32",
            Self::Float32 => "float32",
        }
    }
}

/// Container constraints of a `List` property: optional `min_length` /
/// `max_length` plus element ordering rules.
///
/// Length is part of the shape and checked by the codec. Uniqueness and
/// ordering are value constraints, checked at validation time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListConstraints {
    pub min: Option<u32>,
    pub max: Option<u32>,
    #[serde(default)]
    pub unique: bool,
    /// Non-decreasing.
    #[serde(default)]
    pub sorted: bool,
    /// Non-increasing.
    #[serde(default)]
    pub reverse_sorted: bool,
}

impl ListConstraints {
    pub fn new(min: Option<u32>, max: Option<u32>) -> Self {
        Self {
            min,
            max,
            ..Self::default()
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sorted(mut self) -> Self {
        self.sorted = true;
        self
    }

    pub fn reverse_sorted(mut self) -> Self {
        self.reverse_sorted = true;
        self
    }

    pub fn contains(&self, len: u32) -> bool {
        self.min.map_or(true, |min| len >= min) && self.max.map_or(true, |max| len <= max)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Scalar(ScalarType),
    Array { element: ScalarType, count: u32 },
    List { element: ScalarType, bounds: ListConstraints },
}

impl PropertyType {
    pub fn type_id(&self) -> u8 {
        match self {
            Self::Scalar(s) => s.type_id(),
            Self::Array { .. } => TYPE_ARRAY,
            Self::List { .. } => TYPE_LIST,
        }
    }

    /// Scalar type each element (or the value itself) is encoded as.
    pub fn element(&self) -> ScalarType {
        match self {
            Self::Scalar(s) => *s,
            Self::Array { element, .. } | Self::List { element, .. } => *element,
        }
    }

    pub fn is_container(&self) -> bool {
        !matches!(self, Self::Scalar(_))
    }

    /// Advance `r` past one encoded value of this type and return its byte length.
    ///
    /// Only the shape is checked (enough bytes present); list bounds and element
    /// contents are left to [`Value::decode`].
    pub fn measure(&self, r: &mut WireReader<'_>) -> Result<usize> {
        let start = r.position();
        match self {
            Self::Scalar(s) => r.skip(s.width())?,
            Self::Array { element, count } => r.skip(packed_len(*element, *count)?)?,
            Self::List { element, .. } => {
                let count = r.varint()?;
                r.skip(packed_len(*element, count)?)?;
            }
        }
        Ok(r.position() - start)
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(s) => f.write_str(s.as_str()),
            Self::Array { element, count } => write!(f, "array<{}, {count}>", element.as_str()),
            Self::List { element, .. } => write!(f, "list<{}>", element.as_str()),
        }
    }
}

fn packed_len(element: ScalarType, count: u32) -> Result<usize> {
    (count as usize)
        .checked_mul(element.width())
        .ok_or_else(|| ProtoError::malformed("container length overflows"))
}

/// One fixed-width element.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scalar {
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int32(i32),
    Float32(f32),
}

impl Scalar {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::Bool(_) => ScalarType::Bool,
            Self::Int8(_) => ScalarType::Int8,
            Self::UInt8(_) => ScalarType::UInt8,
            Self::Int32(_) => ScalarType::Int32,
            Self::Float32(_) => ScalarType::Float32,
        }
    }

    pub fn zero(ty: ScalarType) -> Self {
        match ty {
            ScalarType::Bool => Self::Bool(false),
            ScalarType::Int8 => Self::Int8(0),
            ScalarType::UInt8 => Self::UInt8(0),
            ScalarType::Int32 => Self::Int32(0),
            ScalarType::Float32 => Self::Float32(0.0),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match *self {
            Self::Bool(v) => buf.put_u8(v as u8),
            Self::Int8(v) => buf.put_i8(v),
            Self::UInt8(v) => buf.put_u8(v),
            Self::Int32(v) => buf.put_i32_le(v),
            Self::Float32(v) => buf.put_f32_le(v),
        }
    }

    pub fn decode(r: &mut WireReader<'_>, ty: ScalarType) -> Result<Self> {
        Ok(match ty {
            ScalarType::Bool => Self::Bool(r.u8()? != 0),
            ScalarType::Int8 => Self::Int8(r.i8()?),
            ScalarType::UInt8 => Self::UInt8(r.u8()?),
            ScalarType::Int32 => Self::Int32(r.i32()?),
            ScalarType::Float32 => Self::Float32(r.f32()?),
        })
    }

    /// Integer view; `None` for floats.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Bool(v) => Some(v as i64),
            Self::Int8(v) => Some(v.into()),
            Self::UInt8(v) => Some(v.into()),
            Self::Int32(v) => Some(v.into()),
            Self::Float32(_) => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Float32(v) => v.into(),
            other => other.as_i64().unwrap_or_default() as f64,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int8(v) => write!(f, "{v}"),
            Self::UInt8(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
        }
    }
}

/// A property value. Containers hold elements of the property's element type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int32(i32),
    Float32(f32),
    Array(Vec<Scalar>),
    List(Vec<Scalar>),
}

impl From<Scalar> for Value {
    fn from(s: Scalar) -> Self {
        match s {
            Scalar::Bool(v) => Self::Bool(v),
            Scalar::Int8(v) => Self::Int8(v),
            Scalar::UInt8(v) => Self::UInt8(v),
            Scalar::Int32(v) => Self::Int32(v),
            Scalar::Float32(v) => Self::Float32(v),
        }
    }
}

impl Value {
    /// Zero value for `ty`. Lists start at their minimum length.
    pub fn default_for(ty: &PropertyType) -> Self {
        match ty {
            PropertyType::Scalar(s) => Scalar::zero(*s).into(),
            PropertyType::Array { element, count } => {
                Self::Array(vec![Scalar::zero(*element); *count as usize])
            }
            PropertyType::List { element, bounds } => {
                Self::List(vec![Scalar::zero(*element); bounds.min.unwrap_or(0) as usize])
            }
        }
    }

    pub fn as_scalar(&self) -> Option<Scalar> {
        match *self {
            Self::Bool(v) => Some(Scalar::Bool(v)),
            Self::Int8(v) => Some(Scalar::Int8(v)),
            Self::UInt8(v) => Some(Scalar::UInt8(v)),
            Self::Int32(v) => Some(Scalar::Int32(v)),
            Self::Float32(v) => Some(Scalar::Float32(v)),
            Self::Array(_) | Self::List(_) => None,
        }
    }

    /// The value as a slice of elements (a scalar is a single element).
    pub fn elements(&self) -> Cow<'_, [Scalar]> {
        match self {
            Self::Array(items) | Self::List(items) => Cow::Borrowed(items),
            scalar => Cow::Owned(scalar.as_scalar().into_iter().collect()),
        }
    }

    /// Shape check against `ty`: variant, element type, array count, list bounds.
    pub fn check_shape(&self, ty: &PropertyType) -> Result<()> {
        match (ty, self) {
            (PropertyType::Scalar(s), v) => match v.as_scalar() {
                Some(scalar) if scalar.scalar_type() == *s => Ok(()),
                _ => Err(shape_error(ty, v)),
            },
            (PropertyType::Array { element, count }, Self::Array(items)) => {
                if items.len() != *count as usize {
                    return Err(ProtoError::malformed(format!(
                        "array expects {count} elements, got {}",
                        items.len()
                    )));
                }
                check_elements(*element, items)
            }
            (PropertyType::List { element, bounds }, Self::List(items)) => {
                let len = u32::try_from(items.len())
                    .map_err(|_| ProtoError::malformed("list too long"))?;
                if !bounds.contains(len) {
                    return Err(ProtoError::malformed(format!(
                        "list length {len} outside bounds"
                    )));
                }
                check_elements(*element, items)
            }
            (_, v) => Err(shape_error(ty, v)),
        }
    }

    pub fn encode(&self, ty: &PropertyType, buf: &mut BytesMut) -> Result<()> {
        self.check_shape(ty)?;
        match self {
            Self::Array(items) => items.iter().for_each(|s| s.encode(buf)),
            Self::List(items) => {
                encode_varint(items.len() as u32, buf);
                items.iter().for_each(|s| s.encode(buf));
            }
            scalar => {
                if let Some(s) = scalar.as_scalar() {
                    s.encode(buf);
                }
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self, ty: &PropertyType) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        self.encode(ty, &mut buf)?;
        Ok(buf)
    }

    /// Decode one value of type `ty`. On error nothing meaningful is returned;
    /// the reader position is unspecified.
    pub fn decode(r: &mut WireReader<'_>, ty: &PropertyType) -> Result<Self> {
        match ty {
            PropertyType::Scalar(s) => Ok(Scalar::decode(r, *s)?.into()),
            PropertyType::Array { element, count } => {
                Ok(Self::Array(decode_elements(r, *element, *count)?))
            }
            PropertyType::List { element, bounds } => {
                let count = r.varint()?;
                if !bounds.contains(count) {
                    return Err(ProtoError::malformed(format!(
                        "list length {count} outside bounds"
                    )));
                }
                Ok(Self::List(decode_elements(r, *element, count)?))
            }
        }
    }
}

fn decode_elements(r: &mut WireReader<'_>, element: ScalarType, count: u32) -> Result<Vec<Scalar>> {
    if packed_len(element, count)? > r.remaining() {
        return Err(ProtoError::TruncatedMessage);
    }
    (0..count).map(|_| Scalar::decode(r, element)).collect()
}

fn check_elements(element: ScalarType, items: &[Scalar]) -> Result<()> {
    match items.iter().find(|s| s.scalar_type() != element) {
        Some(bad) => Err(ProtoError::malformed(format!(
            "element {} is not {}",
            bad.scalar_type().as_str(),
            element.as_str()
        ))),
        None => Ok(()),
    }
}

fn shape_error(ty: &PropertyType, v: &Value) -> ProtoError {
    ProtoError::malformed(format!("value {v:?} does not match type {ty}"))
}
