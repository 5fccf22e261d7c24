//! Property definitions and the `SCHEMA_UPSERT` encoding.
//!
//! Each property item is laid out as:
//!
//! ```text
//! item_type | readonly<<4 | persistent<<5 | hidden<<6
//! level | ble_exposed<<2
//! [group_id]                      if level == Group
//! id, namespace_id
//! name                            u8 len + bytes
//! description                     varint len + UTF-8
//! DATA_TYPE_DEFINITION
//! value
//! ui_flags [widget] [unit] [icon]
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};
use crate::types::{ListConstraints, PropertyType, Scalar, ScalarType, Value, TYPE_ARRAY, TYPE_LIST};
use crate::wire::{
    batch_count_byte, encode_varint, put_ident, put_utf8, OpCode, OpHeader, WireReader,
};

/// Item type carried in the low nibble of the first item byte.
pub const ITEM_PROPERTY: u8 = 0x01;

const FLAG_READONLY: u8 = 1 << 4;
const FLAG_PERSISTENT: u8 = 1 << 5;
const FLAG_HIDDEN: u8 = 1 << 6;

const HAS_MIN: u8 = 1 << 0;
const HAS_MAX: u8 = 1 << 1;
const HAS_STEP: u8 = 1 << 2;
const HAS_ONE_OF: u8 = 1 << 3;

const HAS_MIN_LEN: u8 = 1 << 0;
const HAS_MAX_LEN: u8 = 1 << 1;
const LIST_UNIQUE: u8 = 1 << 2;
const LIST_SORTED: u8 = 1 << 3;
const LIST_REVERSE_SORTED: u8 = 1 << 4;

const UI_HAS_WIDGET: u8 = 1 << 0;
const UI_HAS_UNIT: u8 = 1 << 1;
const UI_HAS_ICON: u8 = 1 << 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    pub readonly: bool,
    pub persistent: bool,
    pub hidden: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Local,
    Group(u8),
    #[default]
    Global,
}

impl Level {
    fn code(self) -> u8 {
        match self {
            Self::Local => 0,
            Self::Group(_) => 1,
            Self::Global => 2,
        }
    }
}

/// Per-element constraints. Every present value has the property's element type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSet {
    pub min: Option<Scalar>,
    pub max: Option<Scalar>,
    pub step: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub one_of: Vec<Scalar>,
}

impl ConstraintSet {
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none() && self.step.is_none() && self.one_of.is_empty()
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.min.is_some() {
            flags |= HAS_MIN;
        }
        if self.max.is_some() {
            flags |= HAS_MAX;
        }
        if self.step.is_some() {
            flags |= HAS_STEP;
        }
        if !self.one_of.is_empty() {
            flags |= HAS_ONE_OF;
        }
        flags
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiHints {
    pub widget: Option<u8>,
    pub unit: Option<String>,
    pub icon: Option<String>,
    /// 4-bit palette index; 0 means none.
    pub color_group: u8,
}

/// One schema entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    pub id: u8,
    pub namespace_id: u8,
    pub name: String,
    pub description: Option<String>,
    pub ty: PropertyType,
    pub access: Access,
    pub level: Level,
    pub ble_exposed: bool,
    pub constraints: ConstraintSet,
    pub ui: UiHints,
}

impl PropertyDef {
    pub fn new(id: u8, name: impl Into<String>, ty: PropertyType) -> Self {
        Self {
            id,
            namespace_id: 0,
            name: name.into(),
            description: None,
            ty,
            access: Access::default(),
            level: Level::Global,
            ble_exposed: false,
            constraints: ConstraintSet::default(),
            ui: UiHints::default(),
        }
    }

    pub fn scalar(id: u8, name: impl Into<String>, ty: ScalarType) -> Self {
        Self::new(id, name, PropertyType::Scalar(ty))
    }

    pub fn namespace(mut self, namespace_id: u8) -> Self {
        self.namespace_id = namespace_id;
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn readonly(mut self) -> Self {
        self.access.readonly = true;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.access.persistent = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.access.hidden = true;
        self
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn ble_exposed(mut self) -> Self {
        self.ble_exposed = true;
        self
    }

    pub fn min(mut self, v: Scalar) -> Self {
        self.constraints.min = Some(v);
        self
    }

    pub fn max(mut self, v: Scalar) -> Self {
        self.constraints.max = Some(v);
        self
    }

    pub fn step(mut self, v: Scalar) -> Self {
        self.constraints.step = Some(v);
        self
    }

    pub fn one_of(mut self, values: impl IntoIterator<Item = Scalar>) -> Self {
        self.constraints.one_of = values.into_iter().collect();
        self
    }

    pub fn ui(mut self, ui: UiHints) -> Self {
        self.ui = ui;
        self
    }

    /// Checks the definition is encodable and self-consistent: constraint
    /// values use the element type, a step is positive, `min <= max`.
    pub fn check_definition(&self) -> Result<()> {
        if self.name.len() > u8::MAX as usize {
            return Err(ProtoError::malformed(format!(
                "property {} name longer than 255 bytes",
                self.id
            )));
        }
        let element = self.ty.element();
        let c = &self.constraints;
        for s in c.min.iter().chain(&c.max).chain(&c.step).chain(&c.one_of) {
            if s.scalar_type() != element {
                return Err(ProtoError::malformed(format!(
                    "property {} constraint {} is not {}",
                    self.id,
                    s.scalar_type().as_str(),
                    element.as_str()
                )));
            }
        }
        if let Some(step) = c.step {
            let positive = step.as_f64() > 0.0;
            if !positive {
                return Err(ProtoError::malformed(format!(
                    "property {} step must be positive",
                    self.id
                )));
            }
        }
        if let (Some(min), Some(max)) = (c.min, c.max) {
            if min.as_f64() > max.as_f64() {
                return Err(ProtoError::malformed(format!(
                    "property {} min {min} above max {max}",
                    self.id
                )));
            }
        }
        if let PropertyType::List { bounds, .. } = &self.ty {
            if let (Some(min), Some(max)) = (bounds.min, bounds.max) {
                if min > max {
                    return Err(ProtoError::malformed(format!(
                        "property {} min length above max length",
                        self.id
                    )));
                }
            }
        }
        if self.ui.color_group > 0x0F {
            return Err(ProtoError::malformed("color group is a 4-bit value"));
        }
        Ok(())
    }

    /// Append this property's schema item (with `value`) to `buf`.
    pub fn encode_item(&self, value: &Value, buf: &mut BytesMut) -> Result<()> {
        let mut first = ITEM_PROPERTY;
        if self.access.readonly {
            first |= FLAG_READONLY;
        }
        if self.access.persistent {
            first |= FLAG_PERSISTENT;
        }
        if self.access.hidden {
            first |= FLAG_HIDDEN;
        }
        buf.put_u8(first);
        buf.put_u8(self.level.code() | ((self.ble_exposed as u8) << 2));
        if let Level::Group(group) = self.level {
            buf.put_u8(group);
        }
        buf.put_u8(self.id);
        buf.put_u8(self.namespace_id);
        put_ident(buf, &self.name)?;
        put_utf8(buf, self.description.as_deref().unwrap_or(""))?;
        encode_type_definition(&self.ty, &self.constraints, buf)?;
        value.encode(&self.ty, buf)?;
        encode_ui(&self.ui, buf)
    }

    /// Decode one schema item. Returns the definition and the value it carried.
    pub fn decode_item(r: &mut WireReader<'_>) -> Result<(Self, Value)> {
        let first = r.u8()?;
        if first & 0x0F != ITEM_PROPERTY {
            return Err(ProtoError::malformed(format!(
                "unsupported schema item type {}",
                first & 0x0F
            )));
        }
        let access = Access {
            readonly: first & FLAG_READONLY != 0,
            persistent: first & FLAG_PERSISTENT != 0,
            hidden: first & FLAG_HIDDEN != 0,
        };
        let level_byte = r.u8()?;
        let level = match level_byte & 0x03 {
            0 => Level::Local,
            1 => Level::Group(r.u8()?),
            2 => Level::Global,
            _ => return Err(ProtoError::malformed("reserved visibility level 3")),
        };
        let id = r.u8()?;
        let namespace_id = r.u8()?;
        let name = r.ident()?;
        let description = Some(r.utf8()?).filter(|d| !d.is_empty());
        let (ty, constraints) = decode_type_definition(r)?;
        let value = Value::decode(r, &ty)?;
        let ui = decode_ui(r)?;
        let def = Self {
            id,
            namespace_id,
            name,
            description,
            ty,
            access,
            level,
            ble_exposed: level_byte & 0x04 != 0,
            constraints,
            ui,
        };
        Ok((def, value))
    }
}

fn encode_constraints(element: ScalarType, c: &ConstraintSet, buf: &mut BytesMut) -> Result<()> {
    buf.put_u8(element.type_id());
    buf.put_u8(c.flags());
    for s in c.min.iter().chain(&c.max).chain(&c.step) {
        s.encode(buf);
    }
    if !c.one_of.is_empty() {
        let count = u32::try_from(c.one_of.len())
            .map_err(|_| ProtoError::malformed("too many oneof values"))?;
        encode_varint(count, buf);
        c.one_of.iter().for_each(|s| s.encode(buf));
    }
    Ok(())
}

fn decode_flagged(r: &mut WireReader<'_>, present: bool, ty: ScalarType) -> Result<Option<Scalar>> {
    if present {
        Scalar::decode(r, ty).map(Some)
    } else {
        Ok(None)
    }
}

fn decode_constraints(r: &mut WireReader<'_>) -> Result<(ScalarType, ConstraintSet)> {
    let element = ScalarType::from_type_id(r.u8()?)?;
    let flags = r.u8()?;
    let min = decode_flagged(r, flags & HAS_MIN != 0, element)?;
    let max = decode_flagged(r, flags & HAS_MAX != 0, element)?;
    let step = decode_flagged(r, flags & HAS_STEP != 0, element)?;
    let one_of = if flags & HAS_ONE_OF != 0 {
        let count = r.varint()?;
        if (count as usize).saturating_mul(element.width()) > r.remaining() {
            return Err(ProtoError::TruncatedMessage);
        }
        (0..count)
            .map(|_| Scalar::decode(r, element))
            .collect::<Result<Vec<_>>>()?
    } else {
        Vec::new()
    };
    Ok((
        element,
        ConstraintSet {
            min,
            max,
            step,
            one_of,
        },
    ))
}

/// Append the DATA_TYPE_DEFINITION block for `ty` with its element constraints.
pub fn encode_type_definition(
    ty: &PropertyType,
    constraints: &ConstraintSet,
    buf: &mut BytesMut,
) -> Result<()> {
    match ty {
        PropertyType::Scalar(s) => encode_constraints(*s, constraints, buf),
        PropertyType::Array { element, count } => {
            buf.put_u8(TYPE_ARRAY);
            encode_varint(*count, buf);
            encode_constraints(*element, constraints, buf)
        }
        PropertyType::List { element, bounds } => {
            buf.put_u8(TYPE_LIST);
            let mut flags = 0;
            if bounds.min.is_some() {
                flags |= HAS_MIN_LEN;
            }
            if bounds.max.is_some() {
                flags |= HAS_MAX_LEN;
            }
            if bounds.unique {
                flags |= LIST_UNIQUE;
            }
            if bounds.sorted {
                flags |= LIST_SORTED;
            }
            if bounds.reverse_sorted {
                flags |= LIST_REVERSE_SORTED;
            }
            buf.put_u8(flags);
            for len in bounds.min.iter().chain(&bounds.max) {
                encode_varint(*len, buf);
            }
            encode_constraints(*element, constraints, buf)
        }
    }
}

pub fn decode_type_definition(r: &mut WireReader<'_>) -> Result<(PropertyType, ConstraintSet)> {
    let type_id = r.rest().first().copied().ok_or(ProtoError::TruncatedMessage)?;
    match type_id {
        TYPE_ARRAY => {
            r.skip(1)?;
            let count = r.varint()?;
            let (element, constraints) = decode_constraints(r)?;
            Ok((PropertyType::Array { element, count }, constraints))
        }
        TYPE_LIST => {
            r.skip(1)?;
            let flags = r.u8()?;
            let min = if flags & HAS_MIN_LEN != 0 {
                Some(r.varint()?)
            } else {
                None
            };
            let max = if flags & HAS_MAX_LEN != 0 {
                Some(r.varint()?)
            } else {
                None
            };
            let (element, constraints) = decode_constraints(r)?;
            let bounds = ListConstraints {
                unique: flags & LIST_UNIQUE != 0,
                sorted: flags & LIST_SORTED != 0,
                reverse_sorted: flags & LIST_REVERSE_SORTED != 0,
                ..ListConstraints::new(min, max)
            };
            Ok((PropertyType::List { element, bounds }, constraints))
        }
        _ => {
            let (element, constraints) = decode_constraints(r)?;
            Ok((PropertyType::Scalar(element), constraints))
        }
    }
}

fn encode_ui(ui: &UiHints, buf: &mut BytesMut) -> Result<()> {
    let mut flags = (ui.color_group & 0x0F) << 4;
    if ui.widget.is_some() {
        flags |= UI_HAS_WIDGET;
    }
    if ui.unit.is_some() {
        flags |= UI_HAS_UNIT;
    }
    if ui.icon.is_some() {
        flags |= UI_HAS_ICON;
    }
    buf.put_u8(flags);
    if let Some(widget) = ui.widget {
        buf.put_u8(widget);
    }
    if let Some(unit) = &ui.unit {
        put_ident(buf, unit)?;
    }
    if let Some(icon) = &ui.icon {
        put_ident(buf, icon)?;
    }
    Ok(())
}

fn decode_ui(r: &mut WireReader<'_>) -> Result<UiHints> {
    let flags = r.u8()?;
    let widget = if flags & UI_HAS_WIDGET != 0 {
        Some(r.u8()?)
    } else {
        None
    };
    let unit = if flags & UI_HAS_UNIT != 0 {
        Some(r.ident()?)
    } else {
        None
    };
    let icon = if flags & UI_HAS_ICON != 0 {
        Some(r.ident()?)
    } else {
        None
    };
    Ok(UiHints {
        widget,
        unit,
        icon,
        color_group: flags >> 4,
    })
}

/// Build one `SCHEMA_UPSERT` message. A single entry is sent unbatched;
/// 2..=256 entries use the batch form with a `count - 1` byte.
pub fn encode_schema_upsert(entries: &[(&PropertyDef, &Value)]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64 * entries.len().max(1));
    match entries.len() {
        0 => return Err(ProtoError::malformed("schema upsert needs at least one property")),
        1 => buf.put_u8(OpHeader::new(OpCode::SchemaUpsert).encode()),
        n => {
            buf.put_u8(OpHeader::new(OpCode::SchemaUpsert).batched(true).encode());
            buf.put_u8(batch_count_byte(n)?);
        }
    }
    for (def, value) in entries {
        def.encode_item(value, &mut buf)?;
    }
    Ok(buf.freeze())
}

/// Decode a complete `SCHEMA_UPSERT` frame (header included).
pub fn decode_schema_upsert(frame: &[u8]) -> Result<Vec<(PropertyDef, Value)>> {
    let mut r = WireReader::new(frame);
    let header = OpHeader::decode(r.u8()?);
    if header.opcode()? != OpCode::SchemaUpsert {
        return Err(ProtoError::malformed("not a schema upsert"));
    }
    let count = if header.batch {
        r.u8()? as usize + 1
    } else {
        1
    };
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(PropertyDef::decode_item(&mut r)?);
    }
    if !r.is_empty() {
        return Err(ProtoError::malformed(format!(
            "{} trailing bytes after schema items",
            r.remaining()
        )));
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brightness() -> PropertyDef {
        PropertyDef::scalar(3, "brightness", ScalarType::UInt8)
            .persistent()
            .min(Scalar::UInt8(0))
            .max(Scalar::UInt8(255))
    }

    #[test]
    fn item_byte_layout() {
        let def = brightness().readonly();
        let mut buf = BytesMut::new();
        def.encode_item(&Value::UInt8(100), &mut buf).unwrap();

        let mut expected = vec![0x31, 0x02, 3, 0, 10];
        expected.extend_from_slice(b"brightness");
        expected.extend_from_slice(&[0x00, 0x03, 0x03, 0x00, 0xFF, 100, 0x00]);
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn group_level_carries_group_byte() {
        let def = PropertyDef::scalar(1, "x", ScalarType::Bool)
            .level(Level::Group(9))
            .ble_exposed();
        let mut buf = BytesMut::new();
        def.encode_item(&Value::Bool(false), &mut buf).unwrap();
        assert_eq!(buf[1], 0x01 | 0x04);
        assert_eq!(buf[2], 9);

        let mut r = WireReader::new(&buf);
        let (decoded, _) = PropertyDef::decode_item(&mut r).unwrap();
        assert_eq!(decoded.level, Level::Group(9));
        assert!(decoded.ble_exposed);
    }

    #[test]
    fn array_and_list_definitions() {
        let color = PropertyDef::new(
            4,
            "color",
            PropertyType::Array {
                element: ScalarType::UInt8,
                count: 3,
            },
        )
        .max(Scalar::UInt8(200));
        let mut buf = BytesMut::new();
        encode_type_definition(&color.ty, &color.constraints, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x20, 0x03, 0x03, 0x02, 200]);

        let palette = PropertyType::List {
            element: ScalarType::Int32,
            bounds: ListConstraints::new(Some(1), Some(300)),
        };
        let mut buf = BytesMut::new();
        encode_type_definition(&palette, &ConstraintSet::default(), &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x21, 0x03, 0x01, 0xAC, 0x02, 0x04, 0x00]);

        let mut r = WireReader::new(&buf);
        let (ty, c) = decode_type_definition(&mut r).unwrap();
        assert_eq!(ty, palette);
        assert!(c.is_empty());
    }

    #[test]
    fn list_ordering_flags_roundtrip() {
        let ids = PropertyType::List {
            element: ScalarType::UInt8,
            bounds: ListConstraints::new(None, Some(4)).unique().sorted(),
        };
        let mut buf = BytesMut::new();
        encode_type_definition(&ids, &ConstraintSet::default(), &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x21, 0x0E, 0x04, 0x03, 0x00]);

        let mut r = WireReader::new(&buf);
        let (ty, _) = decode_type_definition(&mut r).unwrap();
        assert_eq!(ty, ids);

        let desc = PropertyType::List {
            element: ScalarType::Int8,
            bounds: ListConstraints::default().reverse_sorted(),
        };
        let mut buf = BytesMut::new();
        encode_type_definition(&desc, &ConstraintSet::default(), &mut buf).unwrap();
        assert_eq!(buf[1], 0x10);
    }

    #[test]
    fn one_of_follows_step() {
        let def = PropertyDef::scalar(1, "mode", ScalarType::UInt8)
            .step(Scalar::UInt8(1))
            .one_of([Scalar::UInt8(0), Scalar::UInt8(2)]);
        let mut buf = BytesMut::new();
        encode_type_definition(&def.ty, &def.constraints, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x03, 0x0C, 0x01, 0x02, 0x00, 0x02]);
    }

    #[test]
    fn description_length_is_bytes() {
        let def = brightness().description("Helligkeit – größer ist heller");
        let mut buf = BytesMut::new();
        def.encode_item(&Value::UInt8(1), &mut buf).unwrap();
        let mut r = WireReader::new(&buf);
        let (decoded, value) = PropertyDef::decode_item(&mut r).unwrap();
        assert_eq!(decoded, def);
        assert_eq!(value, Value::UInt8(1));
        assert!(r.is_empty());
    }

    #[test]
    fn ui_hints_roundtrip() {
        let ui = UiHints {
            widget: Some(2),
            unit: Some("°C".into()),
            icon: None,
            color_group: 5,
        };
        let def = PropertyDef::scalar(7, "temp", ScalarType::Float32).ui(ui.clone());
        let mut buf = BytesMut::new();
        def.encode_item(&Value::Float32(21.5), &mut buf).unwrap();
        let mut r = WireReader::new(&buf);
        let (decoded, _) = PropertyDef::decode_item(&mut r).unwrap();
        assert_eq!(decoded.ui, ui);
    }

    #[test]
    fn batched_upsert_count_byte() {
        let defs: Vec<PropertyDef> = (0..5)
            .map(|i| PropertyDef::scalar(i, format!("p{i}"), ScalarType::Int8))
            .collect();
        let value = Value::Int8(-3);
        let entries: Vec<_> = defs.iter().map(|d| (d, &value)).collect();
        let frame = encode_schema_upsert(&entries).unwrap();
        assert_eq!(frame[0], 0x83);
        assert_eq!(frame[1], 0x04);

        let decoded = decode_schema_upsert(&frame).unwrap();
        assert_eq!(decoded.len(), 5);
        for (i, (def, v)) in decoded.iter().enumerate() {
            assert_eq!(def.id, i as u8);
            assert_eq!(v, &value);
        }
    }

    #[test]
    fn single_upsert_is_unbatched() {
        let def = brightness();
        let frame = encode_schema_upsert(&[(&def, &Value::UInt8(9))]).unwrap();
        assert_eq!(frame[0], 0x03);
        assert_eq!(decode_schema_upsert(&frame).unwrap(), vec![(def, Value::UInt8(9))]);
    }

    #[test]
    fn empty_upsert_rejected() {
        assert!(encode_schema_upsert(&[]).is_err());
    }

    #[test]
    fn truncated_schema_fails() {
        let def = brightness();
        let frame = encode_schema_upsert(&[(&def, &Value::UInt8(9))]).unwrap();
        for cut in 1..frame.len() {
            assert!(decode_schema_upsert(&frame[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn definition_checks() {
        assert!(brightness().check_definition().is_ok());
        let wrong_type = PropertyDef::scalar(1, "x", ScalarType::UInt8).max(Scalar::Int32(3));
        assert!(wrong_type.check_definition().is_err());
        let zero_step = PropertyDef::scalar(1, "x", ScalarType::Float32).step(Scalar::Float32(0.0));
        assert!(zero_step.check_definition().is_err());
        let inverted = PropertyDef::scalar(1, "x", ScalarType::Int8)
            .min(Scalar::Int8(5))
            .max(Scalar::Int8(-5));
        assert!(inverted.check_definition().is_err());
        let long_name = PropertyDef::scalar(1, "n".repeat(256), ScalarType::Bool);
        assert!(long_name.check_definition().is_err());
    }
}
