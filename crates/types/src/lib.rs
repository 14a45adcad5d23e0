use serde::{Deserialize, Serialize};

/// Raw register values before SunSpec scale factors are applied.
///
/// Every variant is sourced from big-endian holding registers: `U32` spans
/// two consecutive registers, the 16-bit variants exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawValue {
    I16(i16),
    U16(u16),
    U32(u32),
}

impl RawValue {
    pub fn as_f64(self) -> f64 {
        match self {
            RawValue::I16(v) => f64::from(v),
            RawValue::U16(v) => f64::from(v),
            RawValue::U32(v) => f64::from(v),
        }
    }
}
