//! Property table served by the binary: a small LED controller.

use microproto_core::schema::UiHints;
use microproto_core::types::ListConstraints;
use microproto_core::{PropertyDef, PropertyType, Scalar, ScalarType, Value};
use microproto_engine::{EngineError, PropertyRegistry};

pub const UPTIME: u8 = 6;

pub fn register_properties(registry: &mut PropertyRegistry) -> Result<(), EngineError> {
    registry.register(
        PropertyDef::scalar(0, "enabled", ScalarType::Bool)
            .description("Output on/off")
            .persistent()
            .ble_exposed(),
        Value::Bool(true),
    )?;
    registry.register(
        PropertyDef::scalar(1, "mode", ScalarType::UInt8)
            .description("Animation mode")
            .one_of([0, 1, 2, 4].map(Scalar::UInt8))
            .persistent(),
        Value::UInt8(0),
    )?;
    registry.register(
        PropertyDef::scalar(2, "speed", ScalarType::Float32)
            .description("Animation speed multiplier")
            .min(Scalar::Float32(0.1))
            .max(Scalar::Float32(10.0)),
        Value::Float32(1.0),
    )?;
    registry.register(
        PropertyDef::scalar(3, "brightness", ScalarType::UInt8)
            .description("Global brightness")
            .min(Scalar::UInt8(0))
            .max(Scalar::UInt8(255))
            .persistent()
            .ui(UiHints {
                widget: Some(1),
                unit: Some("%".into()),
                icon: Some("sun".into()),
                color_group: 2,
            }),
        Value::UInt8(128),
    )?;
    registry.register(
        PropertyDef::new(
            4,
            "color",
            PropertyType::Array {
                element: ScalarType::UInt8,
                count: 3,
            },
        )
        .description("Base RGB color"),
        Value::Array(vec![Scalar::UInt8(255), Scalar::UInt8(160), Scalar::UInt8(64)]),
    )?;
    let palette = PropertyType::List {
        element: ScalarType::UInt8,
        bounds: ListConstraints::new(None, Some(16)).unique(),
    };
    let empty_palette = Value::default_for(&palette);
    registry.register(
        PropertyDef::new(5, "palette", palette).description("Palette indices"),
        empty_palette,
    )?;
    registry.register(
        PropertyDef::scalar(UPTIME, "uptime", ScalarType::Int32)
            .description("Seconds since boot")
            .readonly(),
        Value::Int32(0),
    )?;
    registry.register(
        PropertyDef::scalar(7, "offset", ScalarType::Int8)
            .description("Hue offset")
            .min(Scalar::Int8(-10))
            .max(Scalar::Int8(10))
            .step(Scalar::Int8(2))
            .hidden(),
        Value::Int8(0),
    )?;
    Ok(())
}
