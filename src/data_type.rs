//! Register data types and their conversion to engineering values
//!
//! Every channel declares one of five fixed-width types. A type knows how many
//! 16-bit registers it consumes and how to normalise an arbitrary `f64` into
//! its own value range. Unsigned types wrap negative inputs into the unsigned
//! range (`UInt16(-1) == 65535`); signed types keep in-range negatives as they
//! are; `Float32` is the identity.

use std::fmt;
use std::str::FromStr;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};

/// Fixed-width register data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
}

impl DataType {
    pub const INT16_MIN: f64 = i16::MIN as f64;
    pub const INT16_MAX: f64 = i16::MAX as f64;
    pub const UINT16_MIN: f64 = 0.0;
    pub const UINT16_MAX: f64 = u16::MAX as f64;
    pub const INT32_MIN: f64 = i32::MIN as f64;
    pub const INT32_MAX: f64 = i32::MAX as f64;
    pub const UINT32_MIN: f64 = 0.0;
    pub const UINT32_MAX: f64 = u32::MAX as f64;
    pub const FLOAT32_MAX: f64 = f32::MAX as f64;
    pub const FLOAT32_MIN: f64 = -(f32::MAX as f64);

    /// Number of 16-bit registers the type occupies
    pub fn size(self) -> u16 {
        match self {
            DataType::Int16 | DataType::UInt16 => 1,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 2,
        }
    }

    /// Type name as it appears in configuration
    pub fn specifier(self) -> &'static str {
        match self {
            DataType::Int16 => "Int16",
            DataType::UInt16 => "UInt16",
            DataType::Int32 => "Int32",
            DataType::UInt32 => "UInt32",
            DataType::Float32 => "Float32",
        }
    }

    /// Bring `raw` into the value range of this type
    ///
    /// Integer types reduce out-of-range input modulo 2^bits; values already
    /// inside the range are returned unchanged. Pure and total: NaN and
    /// infinities come back as they went in.
    pub fn normalized_value(self, raw: f64) -> f64 {
        match self {
            DataType::Int16 => wrap_into(raw, Self::INT16_MIN, Self::INT16_MAX),
            DataType::UInt16 => wrap_into(raw, Self::UINT16_MIN, Self::UINT16_MAX),
            DataType::Int32 => wrap_into(raw, Self::INT32_MIN, Self::INT32_MAX),
            DataType::UInt32 => wrap_into(raw, Self::UINT32_MIN, Self::UINT32_MAX),
            DataType::Float32 => raw,
        }
    }

    /// Decode the raw registers of one channel (big-endian word order)
    pub fn decode(self, registers: &[u16]) -> ModbusResult<f64> {
        if registers.len() != self.size() as usize {
            return Err(ModbusError::invalid_data(format!(
                "{} needs {} register(s), got {}",
                self,
                self.size(),
                registers.len()
            )));
        }

        let raw = match self {
            DataType::Int16 | DataType::UInt16 => registers[0] as i16 as f64,
            DataType::Int32 | DataType::UInt32 => {
                BigEndian::read_i32(&registers_to_bytes(registers)) as f64
            }
            DataType::Float32 => BigEndian::read_f32(&registers_to_bytes(registers)) as f64,
        };
        Ok(self.normalized_value(raw))
    }

    /// Encode an engineering value into the registers sent to the device
    pub fn encode(self, value: f64) -> Vec<u16> {
        let normalized = self.normalized_value(value);
        let mut bytes = [0u8; 4];
        match self {
            DataType::Int16 | DataType::UInt16 => {
                return vec![normalized as i64 as u16];
            }
            DataType::Int32 | DataType::UInt32 => {
                BigEndian::write_u32(&mut bytes, normalized.round() as i64 as u32);
            }
            DataType::Float32 => {
                BigEndian::write_f32(&mut bytes, normalized as f32);
            }
        }
        vec![
            BigEndian::read_u16(&bytes[0..2]),
            BigEndian::read_u16(&bytes[2..4]),
        ]
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.specifier())
    }
}

impl FromStr for DataType {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Int16" => Ok(DataType::Int16),
            "UInt16" => Ok(DataType::UInt16),
            "Int32" => Ok(DataType::Int32),
            "UInt32" => Ok(DataType::UInt32),
            "Float32" => Ok(DataType::Float32),
            other => Err(ModbusError::configuration(format!("Unknown data type: {}", other))),
        }
    }
}

fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    let mut bytes = vec![0u8; registers.len() * 2];
    BigEndian::write_u16_into(registers, &mut bytes);
    bytes
}

fn wrap_into(value: f64, min: f64, max: f64) -> f64 {
    if !value.is_finite() || (min..=max).contains(&value) {
        return value;
    }
    let step = max + 1.0 - min;
    let delta = (value - min) % step;
    let mut result = min + delta;
    if delta < 0.0 {
        result += step;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uint16_wraps_negatives() {
        assert_eq!(DataType::UInt16.normalized_value(0.0), 0.0);
        assert_eq!(DataType::UInt16.normalized_value(1.0), 1.0);
        assert_eq!(DataType::UInt16.normalized_value(-1.0), 65535.0);
        assert_eq!(DataType::UInt16.normalized_value(-10.0), 65526.0);
        for x in [0u32, 1, 255, 32767, 32768, 65534, 65535] {
            assert_eq!(DataType::UInt16.normalized_value(x as f64), x as f64);
        }
    }

    #[test]
    fn test_int16_keeps_sign() {
        assert_eq!(DataType::Int16.normalized_value(0.0), 0.0);
        assert_eq!(DataType::Int16.normalized_value(1.0), 1.0);
        assert_eq!(DataType::Int16.normalized_value(-1.0), -1.0);
        assert_eq!(DataType::Int16.normalized_value(-10.0), -10.0);
        assert_ne!(DataType::Int16.normalized_value(-1.0), DataType::INT16_MAX);
        // out of range wraps around the signed range
        assert_eq!(DataType::Int16.normalized_value(40000.0), -25536.0);
        assert_eq!(DataType::Int16.normalized_value(-40000.0), 25536.0);
    }

    #[test]
    fn test_uint32_wraps_negatives() {
        assert_eq!(DataType::UInt32.normalized_value(0.0), 0.0);
        assert_eq!(DataType::UInt32.normalized_value(-1.0), DataType::UINT32_MAX);
        assert_eq!(DataType::UInt32.normalized_value(-10.0), DataType::UINT32_MAX - 9.0);
    }

    #[test]
    fn test_int32_and_float32_keep_sign() {
        assert_eq!(DataType::Int32.normalized_value(-1.0), -1.0);
        assert_eq!(DataType::Int32.normalized_value(-10.0), -10.0);
        assert_eq!(DataType::Float32.normalized_value(-1.0), -1.0);
        assert_eq!(DataType::Float32.normalized_value(-10.0), -10.0);
        assert_ne!(DataType::Float32.normalized_value(-1.0), DataType::FLOAT32_MAX);
    }

    #[test]
    fn test_decode_registers() {
        assert_eq!(DataType::UInt16.decode(&[0xFFFF]).unwrap(), 65535.0);
        assert_eq!(DataType::Int16.decode(&[0xFFFF]).unwrap(), -1.0);
        assert_eq!(DataType::UInt32.decode(&[0x0001, 0x0000]).unwrap(), 65536.0);
        assert_eq!(DataType::UInt32.decode(&[0xFFFF, 0xFFFF]).unwrap(), DataType::UINT32_MAX);
        assert_eq!(DataType::Int32.decode(&[0xFFFF, 0xFFFE]).unwrap(), -2.0);
        assert_eq!(DataType::Float32.decode(&[0x3FC0, 0x0000]).unwrap(), 1.5);
        assert!(DataType::Float32.decode(&[0x3FC0]).is_err());
    }

    #[test]
    fn test_encode_registers() {
        assert_eq!(DataType::UInt16.encode(-1.0), vec![0xFFFF]);
        assert_eq!(DataType::Int16.encode(-2.0), vec![0xFFFE]);
        assert_eq!(DataType::UInt32.encode(65536.0), vec![0x0001, 0x0000]);
        assert_eq!(DataType::Float32.encode(1.5), vec![0x3FC0, 0x0000]);
    }

    #[test]
    fn test_parse_specifier() {
        assert_eq!("Float32".parse::<DataType>().unwrap(), DataType::Float32);
        assert!("Int64".parse::<DataType>().is_err());
        assert_eq!(DataType::Int32.size(), 2);
    }
}
