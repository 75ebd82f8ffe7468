//! Characteristic value, format, unit, and constraint types.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Serialize, Serializer};

/// Characteristic value format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Bool,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int32,
    Float,
    String,
    Tlv8,
    Data,
}

impl Format {
    /// Wire representation.
    pub fn to_wire(&self) -> &'static str {
        match self {
            Format::Bool => "bool",
            Format::UInt8 => "uint8",
            Format::UInt16 => "uint16",
            Format::UInt32 => "uint32",
            Format::UInt64 => "uint64",
            Format::Int32 => "int",
            Format::Float => "float",
            Format::String => "string",
            Format::Tlv8 => "tlv8",
            Format::Data => "data",
        }
    }
}

/// Characteristic unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Celsius,
    Percentage,
    ArcDegrees,
    Lux,
    Seconds,
}

impl Unit {
    /// Wire representation.
    pub fn to_wire(&self) -> &'static str {
        match self {
            Unit::Celsius => "celsius",
            Unit::Percentage => "percentage",
            Unit::ArcDegrees => "arcdegrees",
            Unit::Lux => "lux",
            Unit::Seconds => "seconds",
        }
    }
}

/// A characteristic value.
#[derive(Debug, Clone, PartialEq)]
pub enum HapValue {
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    String(String),
    Data(Vec<u8>),
}

impl HapValue {
    /// The neutral default for a format (used before any write or handler
    /// result).
    pub fn default_for(format: Format) -> Self {
        match format {
            Format::Bool => HapValue::Bool(false),
            Format::UInt8 | Format::UInt16 | Format::UInt32 | Format::UInt64 => HapValue::UInt(0),
            Format::Int32 => HapValue::Int(0),
            Format::Float => HapValue::Float(0.0),
            Format::String => HapValue::String(String::new()),
            Format::Tlv8 | Format::Data => HapValue::Data(Vec::new()),
        }
    }

    /// Decode a JSON request value against the characteristic's format.
    ///
    /// Controllers send booleans as `true`/`false` or `0`/`1`; integer
    /// formats are range-checked here, and tlv8/data arrive base64-encoded.
    /// Returns None on any mismatch.
    pub fn from_json(value: &serde_json::Value, format: Format) -> Option<Self> {
        use serde_json::Value;

        match format {
            Format::Bool => match value {
                Value::Bool(b) => Some(HapValue::Bool(*b)),
                Value::Number(n) => match n.as_u64() {
                    Some(0) => Some(HapValue::Bool(false)),
                    Some(1) => Some(HapValue::Bool(true)),
                    _ => None,
                },
                _ => None,
            },
            Format::UInt8 | Format::UInt16 | Format::UInt32 | Format::UInt64 => {
                let n = value.as_u64()?;
                let max = match format {
                    Format::UInt8 => u8::MAX as u64,
                    Format::UInt16 => u16::MAX as u64,
                    Format::UInt32 => u32::MAX as u64,
                    _ => u64::MAX,
                };
                if n <= max {
                    Some(HapValue::UInt(n))
                } else {
                    None
                }
            }
            Format::Int32 => {
                let n = value.as_i64()?;
                if n >= i32::MIN as i64 && n <= i32::MAX as i64 {
                    Some(HapValue::Int(n))
                } else {
                    None
                }
            }
            Format::Float => value.as_f64().map(HapValue::Float),
            Format::String => value.as_str().map(|s| HapValue::String(s.to_string())),
            Format::Tlv8 | Format::Data => {
                let s = value.as_str()?;
                STANDARD.decode(s).ok().map(HapValue::Data)
            }
        }
    }

    /// Whether this value's variant is admissible for a format.
    pub fn matches_format(&self, format: Format) -> bool {
        matches!(
            (self, format),
            (HapValue::Bool(_), Format::Bool)
                | (
                    HapValue::UInt(_),
                    Format::UInt8 | Format::UInt16 | Format::UInt32 | Format::UInt64
                )
                | (HapValue::Int(_), Format::Int32)
                | (HapValue::Float(_), Format::Float)
                | (HapValue::String(_), Format::String)
                | (HapValue::Data(_), Format::Tlv8 | Format::Data)
        )
    }

    /// Numeric view for constraint checks.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HapValue::UInt(n) => Some(*n as f64),
            HapValue::Int(n) => Some(*n as f64),
            HapValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HapValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            HapValue::UInt(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HapValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            HapValue::Data(d) => Some(d),
            _ => None,
        }
    }
}

impl Serialize for HapValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            HapValue::Bool(b) => serializer.serialize_bool(*b),
            HapValue::UInt(n) => serializer.serialize_u64(*n),
            HapValue::Int(n) => serializer.serialize_i64(*n),
            HapValue::Float(f) => serializer.serialize_f64(*f),
            HapValue::String(s) => serializer.serialize_str(s),
            HapValue::Data(d) => serializer.serialize_str(&STANDARD.encode(d)),
        }
    }
}

/// Value constraints advertised in metadata and enforced on writes.
///
/// An out-of-range write is rejected, never clamped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constraints {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    pub max_len: Option<u32>,
    pub valid_values: Option<Vec<u64>>,
}

impl Constraints {
    /// No constraints.
    pub fn none() -> Self {
        Self::default()
    }

    /// Numeric range.
    pub fn range(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            ..Self::default()
        }
    }

    /// Numeric range with step.
    pub fn stepped(min: f64, max: f64, step: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            step: Some(step),
            ..Self::default()
        }
    }

    /// Enumerated values (uint formats).
    pub fn enumerated(values: impl Into<Vec<u64>>) -> Self {
        Self {
            valid_values: Some(values.into()),
            ..Self::default()
        }
    }

    /// Check a decoded value against these constraints.
    pub fn validate(&self, value: &HapValue) -> bool {
        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    return false;
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return false;
                }
            }
            if let Some(step) = self.step {
                if step > 0.0 {
                    let base = self.min.unwrap_or(0.0);
                    let offset = (n - base) / step;
                    if (offset - offset.round()).abs() > 1e-6 {
                        return false;
                    }
                }
            }
            if let Some(valid) = &self.valid_values {
                match value.as_u64() {
                    Some(v) if valid.contains(&v) => {}
                    _ => return false,
                }
            }
        }
        if let Some(max_len) = self.max_len {
            let len = match value {
                HapValue::String(s) => s.len(),
                HapValue::Data(d) => d.len(),
                _ => 0,
            };
            if len > max_len as usize {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    mod decoding {
        use super::*;

        #[test]
        fn bool_accepts_bool_and_zero_one() {
            assert_eq!(
                HapValue::from_json(&json!(true), Format::Bool),
                Some(HapValue::Bool(true))
            );
            assert_eq!(
                HapValue::from_json(&json!(0), Format::Bool),
                Some(HapValue::Bool(false))
            );
            assert_eq!(
                HapValue::from_json(&json!(1), Format::Bool),
                Some(HapValue::Bool(true))
            );
            assert_eq!(HapValue::from_json(&json!(2), Format::Bool), None);
            assert_eq!(HapValue::from_json(&json!("on"), Format::Bool), None);
        }

        #[test]
        fn uint8_range_checked() {
            assert_eq!(
                HapValue::from_json(&json!(255), Format::UInt8),
                Some(HapValue::UInt(255))
            );
            assert_eq!(HapValue::from_json(&json!(256), Format::UInt8), None);
            assert_eq!(HapValue::from_json(&json!(-1), Format::UInt8), None);
        }

        #[test]
        fn int32_range_checked() {
            assert_eq!(
                HapValue::from_json(&json!(-40), Format::Int32),
                Some(HapValue::Int(-40))
            );
            assert_eq!(
                HapValue::from_json(&json!(i64::from(i32::MAX) + 1), Format::Int32),
                None
            );
        }

        #[test]
        fn data_is_base64() {
            let decoded = HapValue::from_json(&json!("AQID"), Format::Data).unwrap();
            assert_eq!(decoded, HapValue::Data(vec![1, 2, 3]));
            assert_eq!(HapValue::from_json(&json!("!!!"), Format::Data), None);
        }

        #[test]
        fn string_rejects_numbers() {
            assert_eq!(HapValue::from_json(&json!(5), Format::String), None);
        }

        #[test]
        fn matches_format_pairs_variant_with_format() {
            assert!(HapValue::Bool(true).matches_format(Format::Bool));
            assert!(HapValue::UInt(3).matches_format(Format::UInt8));
            assert!(HapValue::UInt(3).matches_format(Format::UInt64));
            assert!(HapValue::Data(vec![]).matches_format(Format::Tlv8));
            assert!(!HapValue::Bool(true).matches_format(Format::UInt8));
            assert!(!HapValue::Int(1).matches_format(Format::Float));
        }
    }

    mod serialization {
        use super::*;

        #[test]
        fn scalar_values_serialize_bare() {
            assert_eq!(serde_json::to_string(&HapValue::Bool(true)).unwrap(), "true");
            assert_eq!(serde_json::to_string(&HapValue::UInt(42)).unwrap(), "42");
            assert_eq!(serde_json::to_string(&HapValue::Int(-3)).unwrap(), "-3");
        }

        #[test]
        fn data_serializes_as_base64() {
            let json = serde_json::to_string(&HapValue::Data(vec![1, 2, 3])).unwrap();
            assert_eq!(json, "\"AQID\"");
        }
    }

    mod constraints {
        use super::*;

        #[test]
        fn range_rejects_out_of_bounds() {
            let c = Constraints::range(0.0, 100.0);
            assert!(c.validate(&HapValue::UInt(0)));
            assert!(c.validate(&HapValue::UInt(100)));
            assert!(!c.validate(&HapValue::UInt(101)));
            assert!(!c.validate(&HapValue::Int(-1)));
        }

        #[test]
        fn step_rejects_misaligned() {
            let c = Constraints::stepped(0.0, 100.0, 5.0);
            assert!(c.validate(&HapValue::UInt(35)));
            assert!(!c.validate(&HapValue::UInt(33)));
        }

        #[test]
        fn enumerated_values() {
            let c = Constraints::enumerated(vec![0, 1, 2]);
            assert!(c.validate(&HapValue::UInt(1)));
            assert!(!c.validate(&HapValue::UInt(3)));
        }

        #[test]
        fn max_len_applies_to_strings_and_data() {
            let c = Constraints {
                max_len: Some(4),
                ..Constraints::none()
            };
            assert!(c.validate(&HapValue::String("abcd".to_string())));
            assert!(!c.validate(&HapValue::String("abcde".to_string())));
            assert!(!c.validate(&HapValue::Data(vec![0; 5])));
        }

        #[test]
        fn none_accepts_everything() {
            let c = Constraints::none();
            assert!(c.validate(&HapValue::Float(1e12)));
            assert!(c.validate(&HapValue::String("x".repeat(1000))));
        }
    }
}
