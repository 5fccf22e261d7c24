//! Per-element constraint checks (min, max, step, oneof) and list ordering
//! rules (unique, sorted, reverse-sorted).

use microproto_core::schema::ConstraintSet;
use microproto_core::types::ListConstraints;
use microproto_core::{PropertyDef, PropertyType, ProtoError, Scalar, Value};

/// Relative tolerance for float step checks, in units of `step`.
pub const FLOAT_STEP_TOLERANCE: f64 = 1e-4;

/// Check every element of `value` against the constraints of `def`.
/// The shape is assumed to have been checked already.
pub fn validate(def: &PropertyDef, value: &Value) -> Result<(), ProtoError> {
    if let (PropertyType::List { bounds, .. }, Value::List(items)) = (&def.ty, value) {
        check_list(bounds, items).map_err(|reason| ProtoError::ValidationFailed { id: def.id, reason })?;
    }
    if def.constraints.is_empty() {
        return Ok(());
    }
    for (index, element) in value.elements().iter().enumerate() {
        check_element(&def.constraints, element).map_err(|reason| {
            let reason = if def.ty.is_container() {
                format!("element {index}: {reason}")
            } else {
                reason
            };
            ProtoError::ValidationFailed { id: def.id, reason }
        })?;
    }
    Ok(())
}

fn check_element(c: &ConstraintSet, v: &Scalar) -> Result<(), String> {
    let x = v.as_f64();
    if x.is_nan() {
        return Err("value is NaN".into());
    }
    if let Some(min) = c.min {
        if x < min.as_f64() {
            return Err(format!("{v} below min {min}"));
        }
    }
    if let Some(max) = c.max {
        if x > max.as_f64() {
            return Err(format!("{v} above max {max}"));
        }
    }
    if let Some(step) = c.step {
        if !on_step(v, c.min, step) {
            return Err(format!("{v} is not reachable from min in steps of {step}"));
        }
    }
    if !c.one_of.is_empty() && !c.one_of.iter().any(|o| o.as_f64() == x) {
        return Err(format!("{v} is not an allowed value"));
    }
    Ok(())
}

fn check_list(c: &ListConstraints, items: &[Scalar]) -> Result<(), String> {
    if c.unique {
        for (i, a) in items.iter().enumerate() {
            if let Some(j) = items[i + 1..].iter().position(|b| b == a) {
                return Err(format!("elements {i} and {} are both {a}", i + 1 + j));
            }
        }
    }
    for (i, pair) in items.windows(2).enumerate() {
        let (a, b) = (pair[0].as_f64(), pair[1].as_f64());
        if c.sorted && a > b {
            return Err(format!("element {} breaks ascending order", i + 1));
        }
        if c.reverse_sorted && a < b {
            return Err(format!("element {} breaks descending order", i + 1));
        }
    }
    Ok(())
}

/// Steps are counted from `min`, or from zero when no minimum is set.
fn on_step(v: &Scalar, min: Option<Scalar>, step: Scalar) -> bool {
    match (v.as_i64(), step.as_i64()) {
        (Some(value), Some(step)) if step > 0 => {
            let base = min.and_then(|m| m.as_i64()).unwrap_or(0);
            (value - base) % step == 0
        }
        _ => {
            let step = step.as_f64();
            if step <= 0.0 {
                return true;
            }
            let base = min.map_or(0.0, |m| m.as_f64());
            let q = (v.as_f64() - base) / step;
            (q - q.round()).abs() <= FLOAT_STEP_TOLERANCE
        }
    }
}
