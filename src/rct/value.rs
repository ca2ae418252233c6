use crate::prelude::*;

use serde::{Deserialize, Serialize, Serializer};

/// Rounding digits for FLOAT registers without an explicit precision
pub const DEFAULT_PRECISION: u8 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Float,
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    #[serde(rename = "STRING")]
    Text,
    Enum,
}

impl DataType {
    pub fn decode(self, data: &[u8], multiplier: Option<f64>, precision: Option<u8>) -> Value {
        match self {
            Self::Float => float(data, multiplier, precision.unwrap_or(DEFAULT_PRECISION)),
            Self::UInt8 => integer::<1>(data, |b| i64::from(b[0])),
            Self::Int8 => integer::<1>(data, |b| i64::from(b[0] as i8)),
            Self::UInt16 => integer::<2>(data, |b| i64::from(u16::from_le_bytes(b))),
            Self::Int16 => integer::<2>(data, |b| i64::from(i16::from_be_bytes(b))),
            Self::UInt32 => integer::<4>(data, |b| i64::from(u32::from_le_bytes(b))),
            Self::Int32 => integer::<4>(data, |b| i64::from(i32::from_be_bytes(b))),
            Self::Text => text(data),
            Self::Enum => enumeration(data),
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Float => "FLOAT",
            Self::UInt8 => "UINT8",
            Self::Int8 => "INT8",
            Self::UInt16 => "UINT16",
            Self::Int16 => "INT16",
            Self::UInt32 => "UINT32",
            Self::Int32 => "INT32",
            Self::Text => "STRING",
            Self::Enum => "ENUM",
        };
        write!(f, "{}", s)
    }
}

fn float(data: &[u8], multiplier: Option<f64>, precision: u8) -> Value {
    let Ok(bytes) = <[u8; 4]>::try_from(data) else {
        debug!("FLOAT needs 4 bytes, got {}", data.len());
        return Value::Empty;
    };

    let mut value = f64::from(f32::from_be_bytes(bytes));
    if let Some(multiplier) = multiplier {
        value *= multiplier;
    }

    Value::Float(round(value, precision))
}

// an empty payload reads as 0; a short one cannot be decoded
fn integer<const N: usize>(data: &[u8], convert: fn([u8; N]) -> i64) -> Value {
    if data.is_empty() {
        return Value::Integer(0);
    }

    match data.get(..N).and_then(|b| <[u8; N]>::try_from(b).ok()) {
        Some(bytes) => Value::Integer(convert(bytes)),
        None => {
            debug!("integer needs {} bytes, got {}", N, data.len());
            Value::Empty
        }
    }
}

fn text(data: &[u8]) -> Value {
    Value::Text(String::from_utf8_lossy(data).trim_end_matches('\0').to_string())
}

fn enumeration(data: &[u8]) -> Value {
    match data {
        [] => Value::Integer(0),
        [b] => Value::Integer(i64::from(*b)),
        [lo, hi, ..] => Value::Integer(i64::from(u16::from_le_bytes([*lo, *hi]))),
    }
}

/// Round to `precision` decimal digits, halves going up.
pub fn round(value: f64, precision: u8) -> f64 {
    let factor = 10f64.powi(i32::from(precision));
    (value * factor + 0.5).floor() / factor
}

// Value {{{
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    /// unknown or unmapped type; published as an empty string
    Empty,
}

impl Value {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Integer(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Empty => serializer.serialize_str(""),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{}", s),
            Self::Empty => Ok(()),
        }
    }
} // }}}
