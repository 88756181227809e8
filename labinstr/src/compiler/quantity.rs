/// Conversion between physical values and the raw instrument units stored in shot tables.
use anyhow::anyhow;

use crate::profile::QuantityProfile;
use crate::Error;
use labinstr_protocol::{FieldFormat, Value};

/// Checks `x` against the limits of `quantity` and returns the value that is actually used,
/// i.e. wrapped into range for periodic quantities.
pub fn check_range(quantity: &QuantityProfile, x: f64) -> crate::Result<f64> {
    let x = match quantity.wrap {
        Some(wrap) if x.is_finite() => x.rem_euclid(wrap),
        _ => x,
    };
    let (min, max) = quantity.limits();
    if !(x >= min && x <= max) {
        return Err(Error::range(quantity.name.as_str(), x, min, max));
    }
    Ok(x)
}

fn integer(format: FieldFormat, x: i128) -> Value {
    if format.is_signed() {
        Value::Int(x as i64)
    } else {
        Value::Uint(x as u64)
    }
}

/// Quantizes an already checked physical value without further validation.
fn quantize(quantity: &QuantityProfile, x: f64) -> Value {
    if let Some(levels) = &quantity.levels {
        return integer(quantity.format, levels.coerce(x) as i128);
    }
    let raw = x * quantity.scale;
    if quantity.format.is_float() {
        Value::Float(raw)
    } else if quantity.format.is_signed() {
        Value::Int(raw.round() as i64)
    } else {
        Value::Uint((raw + 0.5).trunc().max(0.0) as u64)
    }
}

/// Range checks and scales a physical value into raw units.
pub fn physical_to_raw(quantity: &QuantityProfile, x: f64) -> crate::Result<Value> {
    let x = check_range(quantity, x)?;
    let raw = quantize(quantity, x);
    if quantity.format.is_integer() {
        let (lo, hi) = quantity.format.integer_bounds();
        let fits = raw.as_f64().map(|r| r >= lo as f64 && r <= hi as f64).unwrap_or(false);
        if !fits {
            let (min, max) = quantity.limits();
            return Err(Error::range(
                quantity.name.as_str(),
                x,
                min.max(lo as f64 / quantity.scale),
                max.min(hi as f64 / quantity.scale),
            ));
        }
    }
    Ok(raw)
}

/// Converts a raw table value back into physical units.
pub fn raw_to_physical(quantity: &QuantityProfile, raw: &Value) -> crate::Result<f64> {
    let x = raw
        .as_f64()
        .ok_or_else(|| Error::argument(anyhow!("`{}` cannot hold {:?}", quantity.name, raw)))?;
    match &quantity.levels {
        Some(levels) => levels
            .values
            .get(x as usize)
            .copied()
            .filter(|_| x >= 0.0)
            .ok_or_else(|| Error::argument(anyhow!("`{}` has no setting with index {}", quantity.name, x))),
        None => Ok(x / quantity.scale),
    }
}

/// Maps a reading in instrument units (the units of the raw table values) onto the raw
/// representation, so it can be compared to what was programmed.
pub fn reading_to_raw(quantity: &QuantityProfile, reading: f64) -> Value {
    if quantity.levels.is_some() {
        return integer(quantity.format, reading.round() as i128);
    }
    quantize(quantity, reading / quantity.scale)
}

/// True if two raw values denote the same instrument setting.
/// Floats are compared with the precision of an `f32` table field.
pub fn same_setting(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => {
            let tolerance = 1e-6 * x.abs().max(y.abs()).max(1e-12);
            (x - y).abs() <= tolerance
        }
        (Value::Str(_), _) | (_, Value::Str(_)) => a == b,
        _ => a.as_f64() == b.as_f64(),
    }
}
