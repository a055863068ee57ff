//! PLC data types and the conversion of values from and to their wire form.
//!
//! All numbers are little endian.  Every [`PlcType`] has a fixed size; strings
//! and arrays are only variable in the capacity they are declared with.

use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use byteorder::{ByteOrder, LE};
use itertools::Itertools;

use crate::{Error, Result};

/// Byte size of a plain `STRING` on the PLC: 80 characters plus terminator.
pub const DEFAULT_STRING_SIZE: usize = 81;

/// A PLC data type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PlcType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    /// Null-terminated string occupying this many bytes, terminator included.
    String(usize),
    /// A fixed number of elements of the same type.
    Array(Box<PlcType>, usize),
}

impl PlcType {
    /// Shorthand for `Array(Box::new(elem), count)`.
    pub fn array(elem: PlcType, count: usize) -> Self {
        PlcType::Array(Box::new(elem), count)
    }

    /// Number of bytes a value of this type occupies on the wire.
    pub fn size(&self) -> usize {
        match self {
            PlcType::Bool | PlcType::Int8 | PlcType::UInt8 => 1,
            PlcType::Int16 | PlcType::UInt16 => 2,
            PlcType::Int32 | PlcType::UInt32 | PlcType::Float32 => 4,
            PlcType::Int64 | PlcType::UInt64 | PlcType::Float64 => 8,
            PlcType::String(capacity) => *capacity,
            PlcType::Array(elem, count) => elem.size() * count,
        }
    }
}

impl fmt::Display for PlcType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PlcType::Bool => f.write_str("BOOL"),
            PlcType::Int8 => f.write_str("SINT"),
            PlcType::Int16 => f.write_str("INT"),
            PlcType::Int32 => f.write_str("DINT"),
            PlcType::Int64 => f.write_str("LINT"),
            PlcType::UInt8 => f.write_str("USINT"),
            PlcType::UInt16 => f.write_str("UINT"),
            PlcType::UInt32 => f.write_str("UDINT"),
            PlcType::UInt64 => f.write_str("ULINT"),
            PlcType::Float32 => f.write_str("REAL"),
            PlcType::Float64 => f.write_str("LREAL"),
            PlcType::String(capacity) => write!(f, "STRING({})", capacity.saturating_sub(1)),
            PlcType::Array(elem, count) => write!(f, "ARRAY[0..{}] OF {}", *count as i64 - 1, elem),
        }
    }
}

impl FromStr for PlcType {
    type Err = &'static str;

    /// Parse an IEC 61131-3 type name such as `DINT`, `STRING(20)` or
    /// `ARRAY[1..10] OF LREAL`.  `STRING(n)` holds n characters and thus
    /// takes n+1 bytes.
    fn from_str(s: &str) -> std::result::Result<Self, &'static str> {
        let upper = s.trim().to_ascii_uppercase();

        if let Some(rest) = upper.strip_prefix("ARRAY") {
            let (range, elem) = rest.trim_start().strip_prefix('[')
                                    .and_then(|r| r.split_once(']'))
                                    .ok_or("invalid array type")?;
            let elem = elem.trim_start().strip_prefix("OF").ok_or("invalid array type")?;
            let (lo, hi) = range.split("..").map(str::trim).collect_tuple()
                                .ok_or("invalid array bounds")?;
            let lo = lo.parse::<i64>().map_err(|_| "invalid array bounds")?;
            let hi = hi.parse::<i64>().map_err(|_| "invalid array bounds")?;
            let count = hi.checked_sub(lo).and_then(|d| d.checked_add(1))
                          .filter(|&n| n > 0)
                          .and_then(|n| usize::try_from(n).ok())
                          .ok_or("invalid array bounds")?;
            return Ok(PlcType::array(elem.parse()?, count));
        }

        if let Some(rest) = upper.strip_prefix("STRING") {
            let rest = rest.trim();
            if rest.is_empty() {
                return Ok(PlcType::String(DEFAULT_STRING_SIZE));
            }
            let chars = rest.strip_prefix('(').and_then(|r| r.strip_suffix(')'))
                            .and_then(|n| n.trim().parse::<usize>().ok())
                            .ok_or("invalid string length")?;
            return Ok(PlcType::String(chars + 1));
        }

        Ok(match &*upper {
            "BOOL" => PlcType::Bool,
            "SINT" => PlcType::Int8,
            "INT" => PlcType::Int16,
            "DINT" => PlcType::Int32,
            "LINT" => PlcType::Int64,
            "USINT" | "BYTE" => PlcType::UInt8,
            "UINT" | "WORD" => PlcType::UInt16,
            "UDINT" | "DWORD" => PlcType::UInt32,
            "ULINT" | "LWORD" => PlcType::UInt64,
            "REAL" => PlcType::Float32,
            "LREAL" => PlcType::Float64,
            _ => return Err("unknown PLC type"),
        })
    }
}

/// A decoded PLC value; each variant corresponds to a [`PlcType`] variant.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    Array(Vec<Value>),
}

impl Value {
    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int8(_) => "i8",
            Value::Int16(_) => "i16",
            Value::Int32(_) => "i32",
            Value::Int64(_) => "i64",
            Value::UInt8(_) => "u8",
            Value::UInt16(_) => "u16",
            Value::UInt32(_) => "u32",
            Value::UInt64(_) => "u64",
            Value::Float32(_) => "f32",
            Value::Float64(_) => "f64",
            Value::String(_) => "string",
            Value::Array(_) => "array",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Return any integer value widened to i64 (u64 only if it fits).
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int8(v) => Some(v.into()),
            Value::Int16(v) => Some(v.into()),
            Value::Int32(v) => Some(v.into()),
            Value::Int64(v) => Some(v),
            Value::UInt8(v) => Some(v.into()),
            Value::UInt16(v) => Some(v.into()),
            Value::UInt32(v) => Some(v.into()),
            Value::UInt64(v) => std::convert::TryFrom::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float32(v) => Some(v.into()),
            Value::Float64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($($t:ty => $variant:ident),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from!(bool => Bool, i8 => Int8, i16 => Int16, i32 => Int32, i64 => Int64,
            u8 => UInt8, u16 => UInt16, u32 => UInt32, u64 => UInt64,
            f32 => Float32, f64 => Float64, String => String, Vec<Value> => Array);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.into())
    }
}

/// Encode a value into exactly `ty.size()` bytes.
///
/// Strings longer than the capacity allows are cut off silently, on a
/// character boundary, so that the terminator still fits.
pub fn encode(value: &Value, ty: &PlcType) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(ty.size());
    encode_into(&mut out, value, ty)?;
    Ok(out)
}

fn encode_into(out: &mut Vec<u8>, value: &Value, ty: &PlcType) -> Result<()> {
    match (ty, value) {
        (PlcType::Bool, Value::Bool(v)) => out.push(*v as u8),
        (PlcType::Int8, Value::Int8(v)) => out.extend(&v.to_le_bytes()),
        (PlcType::Int16, Value::Int16(v)) => out.extend(&v.to_le_bytes()),
        (PlcType::Int32, Value::Int32(v)) => out.extend(&v.to_le_bytes()),
        (PlcType::Int64, Value::Int64(v)) => out.extend(&v.to_le_bytes()),
        (PlcType::UInt8, Value::UInt8(v)) => out.push(*v),
        (PlcType::UInt16, Value::UInt16(v)) => out.extend(&v.to_le_bytes()),
        (PlcType::UInt32, Value::UInt32(v)) => out.extend(&v.to_le_bytes()),
        (PlcType::UInt64, Value::UInt64(v)) => out.extend(&v.to_le_bytes()),
        (PlcType::Float32, Value::Float32(v)) => out.extend(&v.to_le_bytes()),
        (PlcType::Float64, Value::Float64(v)) => out.extend(&v.to_le_bytes()),
        (PlcType::String(capacity), Value::String(s)) => {
            let start = out.len();
            out.extend(truncate(s, capacity.saturating_sub(1)).as_bytes());
            out.resize(start + capacity, 0);
        }
        (PlcType::Array(elem, count), Value::Array(items)) => {
            if items.len() != *count {
                return Err(Error::SizeMismatch { expected: elem.size() * count,
                                                 actual: elem.size() * items.len() });
            }
            for item in items {
                encode_into(out, item, elem)?;
            }
        }
        (ty, value) => return Err(Error::type_mismatch(ty, value.kind())),
    }
    Ok(())
}

// Longest prefix of at most `max` bytes that ends on a char boundary.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Decode a value of the given type.
///
/// Scalars need at least `ty.size()` bytes, arrays exactly that many.  Strings
/// end at the first null byte or after `capacity` bytes, whichever is first;
/// shorter buffers are fine for them.
pub fn decode(buf: &[u8], ty: &PlcType) -> Result<Value> {
    let size = ty.size();
    let scalar = |buf: &[u8]| if buf.len() < size {
        Err(Error::SizeMismatch { expected: size, actual: buf.len() })
    } else {
        Ok(())
    };

    Ok(match ty {
        PlcType::Bool => { scalar(buf)?; Value::Bool(buf[0] != 0) }
        PlcType::Int8 => { scalar(buf)?; Value::Int8(buf[0] as i8) }
        PlcType::Int16 => { scalar(buf)?; Value::Int16(LE::read_i16(buf)) }
        PlcType::Int32 => { scalar(buf)?; Value::Int32(LE::read_i32(buf)) }
        PlcType::Int64 => { scalar(buf)?; Value::Int64(LE::read_i64(buf)) }
        PlcType::UInt8 => { scalar(buf)?; Value::UInt8(buf[0]) }
        PlcType::UInt16 => { scalar(buf)?; Value::UInt16(LE::read_u16(buf)) }
        PlcType::UInt32 => { scalar(buf)?; Value::UInt32(LE::read_u32(buf)) }
        PlcType::UInt64 => { scalar(buf)?; Value::UInt64(LE::read_u64(buf)) }
        PlcType::Float32 => { scalar(buf)?; Value::Float32(LE::read_f32(buf)) }
        PlcType::Float64 => { scalar(buf)?; Value::Float64(LE::read_f64(buf)) }
        PlcType::String(capacity) => Value::String(decode_string(&buf[..buf.len().min(*capacity)])),
        PlcType::Array(elem, count) => {
            if buf.len() != size {
                return Err(Error::SizeMismatch { expected: size, actual: buf.len() });
            }
            let stride = elem.size();
            let items = (0..*count).map(|i| decode(&buf[i * stride..][..stride], elem))
                                   .collect::<Result<Vec<_>>>()?;
            Value::Array(items)
        }
    })
}

/// Decode a null-terminated string; without a terminator it fills the buffer.
pub(crate) fn decode_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
