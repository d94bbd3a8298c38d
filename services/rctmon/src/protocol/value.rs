//! Typed payload values

use std::fmt;

/// Wire encoding of an object's value, fixed per identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    Float,
    String,
}

impl DataKind {
    /// Number of data bytes for fixed-width kinds
    pub fn width(self) -> Option<usize> {
        match self {
            Self::Bool | Self::U8 | Self::I8 => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 | Self::Float => Some(4),
            Self::String => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        self != Self::String
    }

    /// Decode the data part of a response payload
    pub fn decode(self, data: &[u8]) -> Result<Value, String> {
        if let Some(width) = self.width() {
            if data.len() < width {
                return Err(format!(
                    "{:?} needs {} bytes, got {}",
                    self,
                    width,
                    data.len()
                ));
            }
        }

        let value = match self {
            Self::Bool => Value::Bool(data[0] != 0),
            Self::U8 => Value::Int(i64::from(data[0])),
            Self::I8 => Value::Int(i64::from(data[0] as i8)),
            Self::U16 => Value::Int(i64::from(u16::from_be_bytes([data[0], data[1]]))),
            Self::I16 => Value::Int(i64::from(i16::from_be_bytes([data[0], data[1]]))),
            Self::U32 => Value::Int(i64::from(u32::from_be_bytes([
                data[0], data[1], data[2], data[3],
            ]))),
            Self::I32 => Value::Int(i64::from(i32::from_be_bytes([
                data[0], data[1], data[2], data[3],
            ]))),
            Self::Float => Value::Float(f32::from_be_bytes([data[0], data[1], data[2], data[3]])),
            Self::String => {
                let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
                let text = std::str::from_utf8(&data[..end])
                    .map_err(|e| format!("string is not valid UTF-8: {}", e))?;
                Value::Str(text.to_string())
            },
        };

        Ok(value)
    }

    /// Encode a value the way the device sends it
    ///
    /// Returns `None` when the value does not fit the kind. Only the fake devices
    /// in tests and tooling need this; the collector never writes values.
    pub fn encode(self, value: &Value) -> Option<Vec<u8>> {
        let bytes = match (self, value) {
            (Self::Bool, Value::Bool(b)) => vec![u8::from(*b)],
            (Self::U8, Value::Int(v)) => vec![u8::try_from(*v).ok()?],
            (Self::I8, Value::Int(v)) => i8::try_from(*v).ok()?.to_be_bytes().to_vec(),
            (Self::U16, Value::Int(v)) => u16::try_from(*v).ok()?.to_be_bytes().to_vec(),
            (Self::I16, Value::Int(v)) => i16::try_from(*v).ok()?.to_be_bytes().to_vec(),
            (Self::U32, Value::Int(v)) => u32::try_from(*v).ok()?.to_be_bytes().to_vec(),
            (Self::I32, Value::Int(v)) => i32::try_from(*v).ok()?.to_be_bytes().to_vec(),
            (Self::Float, Value::Float(v)) => v.to_be_bytes().to_vec(),
            (Self::String, Value::Str(s)) => {
                let mut bytes = s.as_bytes().to_vec();
                bytes.push(0);
                bytes
            },
            _ => return None,
        };
        Some(bytes)
    }

    /// Zero value of this kind
    pub fn default_value(self) -> Value {
        match self {
            Self::Bool => Value::Bool(false),
            Self::Float => Value::Float(0.0),
            Self::String => Value::Str(String::new()),
            _ => Value::Int(0),
        }
    }
}

/// A decoded value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f32),
    Str(String),
}

impl Value {
    /// Numeric view used by gauge exports; strings have none
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(f64::from(*v)),
            Self::Str(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Str(s) => write!(f, "{:?}", s),
        }
    }
}
