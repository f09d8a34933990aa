//! Control values and their bounds.

use crate::controls::ValueLayout;
use std::fmt;
use thiserror::Error;

/// A decoded control payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlValue {
    /// Scalar, bitmap or boolean value.
    Int(i64),
    /// Two packed fields, e.g. pan/tilt or white-balance blue/red.
    Pair(i64, i64),
    /// Opaque payload (extension units, relative motion controls).
    Raw(Vec<u8>),
}

impl ControlValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ControlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_pair(&self) -> Option<(i64, i64)> {
        match self {
            ControlValue::Pair(a, b) => Some((*a, *b)),
            _ => None,
        }
    }
}

impl fmt::Display for ControlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlValue::Int(v) => write!(f, "{v}"),
            ControlValue::Pair(a, b) => write!(f, "{a},{b}"),
            ControlValue::Raw(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Parse a hex string, optionally `0x`-prefixed, into bytes.
pub fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let hex = text.strip_prefix("0x").unwrap_or(text);
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| hex.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
        .collect()
}

/// Bounds reported by GET_MIN / GET_MAX / GET_RES / GET_DEF.
///
/// Bitmap controls have no GET_MIN or GET_MAX: `min` is 0 and `max` is the
/// supported-mode mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRange {
    pub min: ControlValue,
    pub max: ControlValue,
    /// Step size; for bitmap layouts, the mask of supported modes.
    pub res: ControlValue,
    pub def: ControlValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("value {value} out of range ({constraint})")]
    OutOfRange { value: i64, constraint: String },
    #[error("value {value} does not fit layout {layout:?}")]
    LayoutMismatch { value: String, layout: ValueLayout },
}

/// Check a value against a layout and, if known, the device's bounds.
///
/// Scalars must lie in `[min, max]` and sit a whole number of `res` steps
/// above `min`. Bitmaps must select exactly one mode from the `res` mask.
pub fn validate(
    layout: ValueLayout,
    range: Option<&ControlRange>,
    value: &ControlValue,
) -> Result<(), ValueError> {
    let mismatch = || ValueError::LayoutMismatch {
        value: value.to_string(),
        layout,
    };

    match (layout, value) {
        (ValueLayout::Boolean, ControlValue::Int(v)) => {
            if *v == 0 || *v == 1 {
                Ok(())
            } else {
                Err(ValueError::OutOfRange {
                    value: *v,
                    constraint: "boolean".to_string(),
                })
            }
        }
        (ValueLayout::Bitmap(width), ControlValue::Int(v)) => {
            check_width(*v, width, false)?;
            if v.count_ones() != 1 {
                return Err(ValueError::OutOfRange {
                    value: *v,
                    constraint: "exactly one mode bit".to_string(),
                });
            }
            if let Some(mask) = range.and_then(|r| r.res.as_int()) {
                if v & mask == 0 {
                    return Err(ValueError::OutOfRange {
                        value: *v,
                        constraint: format!("supported modes {mask:#04x}"),
                    });
                }
            }
            Ok(())
        }
        (ValueLayout::Signed(width), ControlValue::Int(v))
        | (ValueLayout::Unsigned(width), ControlValue::Int(v)) => {
            check_width(*v, width, layout.is_signed())?;
            if let Some(r) = range {
                let (min, max, res) = (
                    r.min.as_int().ok_or_else(mismatch)?,
                    r.max.as_int().ok_or_else(mismatch)?,
                    r.res.as_int().ok_or_else(mismatch)?,
                );
                check_bounds(*v, min, max, res)?;
            }
            Ok(())
        }
        (ValueLayout::SignedPair(width), ControlValue::Pair(a, b))
        | (ValueLayout::UnsignedPair(width), ControlValue::Pair(a, b)) => {
            check_width(*a, width, layout.is_signed())?;
            check_width(*b, width, layout.is_signed())?;
            if let Some(r) = range {
                let (min, max, res) = (
                    r.min.as_pair().ok_or_else(mismatch)?,
                    r.max.as_pair().ok_or_else(mismatch)?,
                    r.res.as_pair().ok_or_else(mismatch)?,
                );
                check_bounds(*a, min.0, max.0, res.0)?;
                check_bounds(*b, min.1, max.1, res.1)?;
            }
            Ok(())
        }
        (ValueLayout::Raw, ControlValue::Raw(_)) => Ok(()),
        _ => Err(mismatch()),
    }
}

fn check_bounds(value: i64, min: i64, max: i64, res: i64) -> Result<(), ValueError> {
    let constraint = || format!("[{min}, {max}] step {res}");
    if value < min || value > max {
        return Err(ValueError::OutOfRange {
            value,
            constraint: constraint(),
        });
    }
    if res > 0 && (value - min) % res != 0 {
        return Err(ValueError::OutOfRange {
            value,
            constraint: constraint(),
        });
    }
    Ok(())
}

fn check_width(value: i64, width: u8, signed: bool) -> Result<(), ValueError> {
    let bits = u32::from(width.min(8)) * 8;
    let (lo, hi) = if signed {
        if bits >= 64 {
            (i64::MIN, i64::MAX)
        } else {
            (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
        }
    } else if bits >= 64 {
        (0, i64::MAX)
    } else {
        (0, (1i64 << bits) - 1)
    };
    if value < lo || value > hi {
        return Err(ValueError::OutOfRange {
            value,
            constraint: format!("{}{bits}", if signed { "i" } else { "u" }),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: i64, max: i64, res: i64) -> ControlRange {
        ControlRange {
            min: ControlValue::Int(min),
            max: ControlValue::Int(max),
            res: ControlValue::Int(res),
            def: ControlValue::Int(min),
        }
    }

    #[test]
    fn test_exposure_step() {
        let r = range(100, 1000, 50);
        let layout = ValueLayout::Unsigned(4);
        assert!(validate(layout, Some(&r), &ControlValue::Int(500)).is_ok());
        assert!(matches!(
            validate(layout, Some(&r), &ControlValue::Int(510)),
            Err(ValueError::OutOfRange { value: 510, .. })
        ));
    }

    #[test]
    fn test_bounds_inclusive() {
        let r = range(100, 1000, 50);
        let layout = ValueLayout::Unsigned(4);
        assert!(validate(layout, Some(&r), &ControlValue::Int(100)).is_ok());
        assert!(validate(layout, Some(&r), &ControlValue::Int(1000)).is_ok());
        assert!(validate(layout, Some(&r), &ControlValue::Int(50)).is_err());
        assert!(validate(layout, Some(&r), &ControlValue::Int(1050)).is_err());
    }

    #[test]
    fn test_step_measured_from_min() {
        let r = range(1, 9, 2);
        let layout = ValueLayout::Unsigned(2);
        assert!(validate(layout, Some(&r), &ControlValue::Int(3)).is_ok());
        assert!(validate(layout, Some(&r), &ControlValue::Int(4)).is_err());
    }

    #[test]
    fn test_zero_resolution_accepts_any_in_range() {
        let r = range(-64, 64, 0);
        assert!(validate(ValueLayout::Signed(2), Some(&r), &ControlValue::Int(-7)).is_ok());
    }

    #[test]
    fn test_width_without_range() {
        assert!(validate(ValueLayout::Unsigned(1), None, &ControlValue::Int(255)).is_ok());
        assert!(validate(ValueLayout::Unsigned(1), None, &ControlValue::Int(256)).is_err());
        assert!(validate(ValueLayout::Unsigned(2), None, &ControlValue::Int(-1)).is_err());
        assert!(validate(ValueLayout::Signed(1), None, &ControlValue::Int(-128)).is_ok());
        assert!(validate(ValueLayout::Signed(1), None, &ControlValue::Int(128)).is_err());
    }

    #[test]
    fn test_bitmap_modes() {
        let r = ControlRange {
            min: ControlValue::Int(0),
            max: ControlValue::Int(0),
            res: ControlValue::Int(0x09),
            def: ControlValue::Int(0x08),
        };
        let layout = ValueLayout::Bitmap(1);
        assert!(validate(layout, Some(&r), &ControlValue::Int(0x01)).is_ok());
        assert!(validate(layout, Some(&r), &ControlValue::Int(0x08)).is_ok());
        // shutter priority not in the mask
        assert!(validate(layout, Some(&r), &ControlValue::Int(0x04)).is_err());
        // two modes at once
        assert!(validate(layout, Some(&r), &ControlValue::Int(0x09)).is_err());
    }

    #[test]
    fn test_boolean() {
        assert!(validate(ValueLayout::Boolean, None, &ControlValue::Int(1)).is_ok());
        assert!(validate(ValueLayout::Boolean, None, &ControlValue::Int(2)).is_err());
    }

    #[test]
    fn test_pair_checked_per_component() {
        let r = ControlRange {
            min: ControlValue::Pair(-36000, -18000),
            max: ControlValue::Pair(36000, 18000),
            res: ControlValue::Pair(3600, 3600),
            def: ControlValue::Pair(0, 0),
        };
        let layout = ValueLayout::SignedPair(4);
        assert!(validate(layout, Some(&r), &ControlValue::Pair(3600, -3600)).is_ok());
        assert!(validate(layout, Some(&r), &ControlValue::Pair(3600, 20000)).is_err());
        assert!(validate(layout, Some(&r), &ControlValue::Pair(100, 0)).is_err());
    }

    #[test]
    fn test_layout_mismatch() {
        let err = validate(ValueLayout::Unsigned(2), None, &ControlValue::Pair(1, 2)).unwrap_err();
        assert!(matches!(err, ValueError::LayoutMismatch { .. }));
        assert!(validate(ValueLayout::Raw, None, &ControlValue::Int(1)).is_err());
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0a0BfF"), Some(vec![0x0a, 0x0b, 0xff]));
        assert_eq!(parse_hex("0x01"), Some(vec![0x01]));
        assert_eq!(parse_hex("abc"), None);
        assert_eq!(parse_hex("zz"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(ControlValue::Int(-5).to_string(), "-5");
        assert_eq!(ControlValue::Pair(1, 2).to_string(), "1,2");
        assert_eq!(ControlValue::Raw(vec![0x0a, 0xff]).to_string(), "0aff");
    }
}
