//! # Tag Value Types
//!
//! Typed values read from and written to Logix controller tags.
//!
//! | TagType | CIP data type | Element size |
//! |---------|---------------|--------------|
//! | Bool | BOOL `0x00C1` (mask) | 1 |
//! | UInt8 / Int8 | SINT `0x00C2` | 1 |
//! | UInt16 / Int16 | INT `0x00C3` | 2 |
//! | UInt32 / Int32 | DINT `0x00C4` | 4 |
//! | Single | REAL `0x00CA` | 4 |
//! | UInt64 / Int64 / Double | LINT `0x00C5` | 8 |
//! | String | STRUCT `0x02A0` | - |

use std::fmt;
use std::str::FromStr;

use crate::constants::{
    DATA_TYPE_BOOL, DATA_TYPE_DINT, DATA_TYPE_INT, DATA_TYPE_LINT, DATA_TYPE_REAL,
    DATA_TYPE_SINT, DATA_TYPE_STRUCT,
};
use crate::error::EipError;

/// Requested interpretation of a tag's reply data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagType {
    Bool,
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    UInt64,
    Int64,
    Single,
    /// 64-bit float carried in a LINT
    Double,
    /// Logix STRING structure
    String,
}

impl TagType {
    /// CIP data type written for this type, and the type a read expects
    pub fn data_type(&self) -> u16 {
        match self {
            TagType::Bool => DATA_TYPE_BOOL,
            TagType::UInt8 | TagType::Int8 => DATA_TYPE_SINT,
            TagType::UInt16 | TagType::Int16 => DATA_TYPE_INT,
            TagType::UInt32 | TagType::Int32 => DATA_TYPE_DINT,
            TagType::UInt64 | TagType::Int64 | TagType::Double => DATA_TYPE_LINT,
            TagType::Single => DATA_TYPE_REAL,
            TagType::String => DATA_TYPE_STRUCT,
        }
    }

    /// Bytes per array element; zero for STRING
    pub fn element_size(&self) -> usize {
        match self {
            TagType::Bool | TagType::UInt8 | TagType::Int8 => 1,
            TagType::UInt16 | TagType::Int16 => 2,
            TagType::UInt32 | TagType::Int32 | TagType::Single => 4,
            TagType::UInt64 | TagType::Int64 | TagType::Double => 8,
            TagType::String => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TagType::Bool => "bool",
            TagType::UInt8 => "u8",
            TagType::Int8 => "i8",
            TagType::UInt16 => "u16",
            TagType::Int16 => "i16",
            TagType::UInt32 => "u32",
            TagType::Int32 => "i32",
            TagType::UInt64 => "u64",
            TagType::Int64 => "i64",
            TagType::Single => "f32",
            TagType::Double => "f64",
            TagType::String => "string",
        }
    }
}

impl FromStr for TagType {
    type Err = EipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bool" | "boolean" => Ok(TagType::Bool),
            "u8" | "uint8" | "usint" => Ok(TagType::UInt8),
            "i8" | "int8" | "sint" => Ok(TagType::Int8),
            "u16" | "uint16" | "uint" => Ok(TagType::UInt16),
            "i16" | "int16" | "int" => Ok(TagType::Int16),
            "u32" | "uint32" | "udint" | "dword" => Ok(TagType::UInt32),
            "i32" | "int32" | "dint" => Ok(TagType::Int32),
            "u64" | "uint64" | "ulint" => Ok(TagType::UInt64),
            "i64" | "int64" | "lint" => Ok(TagType::Int64),
            "f32" | "float" | "single" | "real" => Ok(TagType::Single),
            "f64" | "double" | "lreal" => Ok(TagType::Double),
            "string" | "str" => Ok(TagType::String),
            _ => Err(EipError::client(format!("Unsupported tag type: {}", s))),
        }
    }
}

impl fmt::Display for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded tag value
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Bool(bool),
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
}

impl TagValue {
    /// Numeric view of the value; strings parse or yield NaN
    pub fn as_f64(&self) -> f64 {
        match self {
            TagValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            TagValue::U8(v) => f64::from(*v),
            TagValue::I8(v) => f64::from(*v),
            TagValue::U16(v) => f64::from(*v),
            TagValue::I16(v) => f64::from(*v),
            TagValue::U32(v) => f64::from(*v),
            TagValue::I32(v) => f64::from(*v),
            TagValue::U64(v) => *v as f64,
            TagValue::I64(v) => *v as f64,
            TagValue::F32(v) => f64::from(*v),
            TagValue::F64(v) => *v,
            TagValue::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The tag type that produces this value
    pub fn tag_type(&self) -> TagType {
        match self {
            TagValue::Bool(_) => TagType::Bool,
            TagValue::U8(_) => TagType::UInt8,
            TagValue::I8(_) => TagType::Int8,
            TagValue::U16(_) => TagType::UInt16,
            TagValue::I16(_) => TagType::Int16,
            TagValue::U32(_) => TagType::UInt32,
            TagValue::I32(_) => TagType::Int32,
            TagValue::U64(_) => TagType::UInt64,
            TagValue::I64(_) => TagType::Int64,
            TagValue::F32(_) => TagType::Single,
            TagValue::F64(_) => TagType::Double,
            TagValue::String(_) => TagType::String,
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            TagValue::String(s) => s.is_empty(),
            other => other.as_f64() == 0.0,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Bool(v) => write!(f, "{}", v),
            TagValue::U8(v) => write!(f, "{}", v),
            TagValue::I8(v) => write!(f, "{}", v),
            TagValue::U16(v) => write!(f, "{}", v),
            TagValue::I16(v) => write!(f, "{}", v),
            TagValue::U32(v) => write!(f, "{}", v),
            TagValue::I32(v) => write!(f, "{}", v),
            TagValue::U64(v) => write!(f, "{}", v),
            TagValue::I64(v) => write!(f, "{}", v),
            TagValue::F32(v) => write!(f, "{}", v),
            TagValue::F64(v) => write!(f, "{}", v),
            TagValue::String(v) => write!(f, "{:?}", v),
        }
    }
}

// ============================================================================
// From implementations
// ============================================================================

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for TagValue {
                fn from(v: $ty) -> Self {
                    TagValue::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    u64 => U64,
    i64 => I64,
    f32 => F32,
    f64 => F64,
    String => String,
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        TagValue::String(v.to_string())
    }
}
