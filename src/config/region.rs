use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::ModbusFunction;

/// Modbus memory area a channel lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Region {
    Coils,
    Discretes,
    Inputs,
    Holdings,
}

impl Region {
    pub const ALL: [Region; 4] = [Region::Coils, Region::Discretes, Region::Inputs, Region::Holdings];

    /// Whether the master may write to this region
    pub fn is_writable(self) -> bool {
        matches!(self, Region::Coils | Region::Holdings)
    }

    /// Width of one addressable item in bits
    pub fn bit_size(self) -> u8 {
        match self {
            Region::Coils | Region::Discretes => 1,
            Region::Inputs | Region::Holdings => 16,
        }
    }

    pub fn read_function(self) -> ModbusFunction {
        match self {
            Region::Coils => ModbusFunction::ReadCoils,
            Region::Discretes => ModbusFunction::ReadDiscreteInputs,
            Region::Inputs => ModbusFunction::ReadInputRegisters,
            Region::Holdings => ModbusFunction::ReadHoldingRegisters,
        }
    }

    /// Most items one read request may cover
    pub fn max_read_count(self) -> u16 {
        match self.bit_size() {
            1 => crate::MAX_COILS_PER_REQUEST,
            _ => crate::MAX_REGISTERS_PER_REQUEST,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Region::Coils => "Coils",
            Region::Discretes => "Discretes",
            Region::Inputs => "Inputs",
            Region::Holdings => "Holdings",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_properties() {
        assert!(Region::Coils.is_writable());
        assert!(!Region::Discretes.is_writable());
        assert!(!Region::Inputs.is_writable());
        assert!(Region::Holdings.is_writable());
        assert_eq!(Region::Discretes.bit_size(), 1);
        assert_eq!(Region::Inputs.bit_size(), 16);
        assert_eq!(Region::Inputs.read_function(), ModbusFunction::ReadInputRegisters);
        assert_eq!(Region::Coils.max_read_count(), 2000);
    }
}
