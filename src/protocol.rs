//! Modbus TCP protocol definitions and framing
//!
//! This module contains the function codes, exception codes and the
//! request/response structures exchanged with field devices, together with
//! the MBAP framing used on TCP links. Responses arrive as an arbitrary byte
//! stream, so decoding is incremental: [`ResponseDecoder`] buffers bytes and
//! yields complete frames as they become available.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ModbusError, ModbusResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus value type (16-bit register value)
pub type ModbusValue = u16;

/// Modbus unit identifier
pub type UnitId = u8;

/// Unit id used for every request
pub const DEFAULT_UNIT_ID: UnitId = 1;

/// Modbus TCP Application Protocol header size (without unit id)
pub const MBAP_HEADER_SIZE: usize = 6;

/// Maximum value of the MBAP length field (unit id + PDU)
const MAX_MBAP_LENGTH: usize = 254;

/// Value written to a coil to switch it on
pub const COIL_ON: u16 = 0xFF00;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::ReadHoldingRegisters
                | ModbusFunction::ReadInputRegisters
        )
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        !self.is_read_function()
    }

    /// Check if the function addresses single bits
    pub fn is_bit_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::WriteSingleCoil
                | ModbusFunction::WriteMultipleCoils
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (0x{:02X})",
            crate::logging::get_function_name(self.to_u8()),
            self.to_u8()
        )
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "Function code not supported by the device",
            ModbusException::IllegalDataAddress => "Address range outside the device map",
            ModbusException::IllegalDataValue => "Value rejected by the device",
            ModbusException::ServerDeviceFailure => "Device failed while executing the request",
            ModbusException::Acknowledge => "Request accepted, processing takes long",
            ModbusException::ServerDeviceBusy => "Device busy",
            ModbusException::MemoryParityError => "Memory parity error on the device",
            ModbusException::GatewayPathUnavailable => "Gateway path unavailable",
            ModbusException::GatewayTargetDeviceFailedToRespond => "Gateway target did not respond",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Modbus request PDU
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub function: ModbusFunction,
    pub address: ModbusAddress,
    pub quantity: u16,
    /// Payload of write requests (register values, packed coils or the coil word)
    pub data: Vec<u8>,
}

impl ModbusRequest {
    /// Create a new read request
    pub fn new_read(function: ModbusFunction, address: ModbusAddress, quantity: u16) -> Self {
        Self {
            function,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// Write one coil (0x05)
    pub fn write_single_coil(address: ModbusAddress, on: bool) -> Self {
        let value = if on { COIL_ON } else { 0x0000 };
        Self {
            function: ModbusFunction::WriteSingleCoil,
            address,
            quantity: 1,
            data: value.to_be_bytes().to_vec(),
        }
    }

    /// Write a run of coils (0x0F)
    pub fn write_multiple_coils(address: ModbusAddress, values: &[bool]) -> Self {
        Self {
            function: ModbusFunction::WriteMultipleCoils,
            address,
            quantity: values.len() as u16,
            data: data_utils::pack_bits(values),
        }
    }

    /// Write one holding register (0x06)
    pub fn write_single_register(address: ModbusAddress, value: ModbusValue) -> Self {
        Self {
            function: ModbusFunction::WriteSingleRegister,
            address,
            quantity: 1,
            data: value.to_be_bytes().to_vec(),
        }
    }

    /// Write a run of holding registers (0x10)
    pub fn write_multiple_registers(address: ModbusAddress, values: &[ModbusValue]) -> Self {
        Self {
            function: ModbusFunction::WriteMultipleRegisters,
            address,
            quantity: values.len() as u16,
            data: data_utils::registers_to_bytes(values),
        }
    }

    /// Validate the request
    pub fn validate(&self) -> ModbusResult<()> {
        if self.quantity == 0 {
            return Err(ModbusError::invalid_data("Quantity cannot be zero"));
        }

        let limit = match self.function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => crate::MAX_COILS_PER_REQUEST,
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                crate::MAX_REGISTERS_PER_REQUEST
            }
            ModbusFunction::WriteMultipleCoils => crate::MAX_WRITE_COILS_PER_REQUEST,
            ModbusFunction::WriteMultipleRegisters => crate::MAX_WRITE_REGISTERS_PER_REQUEST,
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => 1,
        };
        if self.quantity > limit {
            return Err(ModbusError::invalid_data(format!(
                "Too many items for {}: {} (max {})",
                self.function, self.quantity, limit
            )));
        }

        if (self.address as u32) + (self.quantity as u32) > 0x1_0000 {
            return Err(ModbusError::invalid_address(self.address as i32, self.quantity as i32));
        }

        Ok(())
    }

    /// Encode request to a TCP frame (MBAP header + PDU)
    pub fn encode(&self, transaction_id: u16, unit_id: UnitId) -> Vec<u8> {
        let body_length = match self.function {
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => 5 + self.data.len(),
            _ => 4,
        };
        // unit id + function code + body
        let pdu_length = 2 + body_length;

        let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + pdu_length);
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&(pdu_length as u16).to_be_bytes());
        frame.push(unit_id);
        frame.push(self.function.to_u8());
        frame.extend_from_slice(&self.address.to_be_bytes());

        match self.function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters => {
                frame.extend_from_slice(&self.quantity.to_be_bytes());
            }
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
                let mut value = [0u8; 2];
                let n = self.data.len().min(2);
                value[..n].copy_from_slice(&self.data[..n]);
                frame.extend_from_slice(&value);
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                frame.extend_from_slice(&self.quantity.to_be_bytes());
                frame.push(self.data.len() as u8);
                frame.extend_from_slice(&self.data);
            }
        }

        frame
    }
}

/// Decoded Modbus TCP response
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub transaction_id: u16,
    pub unit_id: UnitId,
    pub function: ModbusFunction,
    /// PDU bytes after the function code
    pub data: Vec<u8>,
    /// Raw exception code when the device answered with function | 0x80
    pub exception_code: Option<u8>,
}

impl ModbusResponse {
    /// Check if this is an exception response
    pub fn is_exception(&self) -> bool {
        self.exception_code.is_some()
    }

    /// Get exception error if present
    pub fn get_exception(&self) -> Option<ModbusError> {
        self.exception_code
            .map(|code| ModbusError::exception(self.function.to_u8(), code))
    }

    /// Parse response data as registers (u16 values)
    pub fn parse_registers(&self) -> ModbusResult<Vec<u16>> {
        if let Some(error) = self.get_exception() {
            return Err(error);
        }

        let byte_count = *self
            .data
            .first()
            .ok_or_else(|| ModbusError::frame("Empty response data"))? as usize;
        if self.data.len() < 1 + byte_count {
            return Err(ModbusError::frame("Incomplete register data"));
        }
        if byte_count % 2 != 0 {
            return Err(ModbusError::frame("Invalid register data length"));
        }

        data_utils::bytes_to_registers(&self.data[1..1 + byte_count])
    }

    /// Parse response data as `bit_count` bits (LSB first)
    pub fn parse_bits(&self, bit_count: usize) -> ModbusResult<Vec<bool>> {
        if let Some(error) = self.get_exception() {
            return Err(error);
        }

        let byte_count = *self
            .data
            .first()
            .ok_or_else(|| ModbusError::frame("Empty response data"))? as usize;
        if self.data.len() < 1 + byte_count || byte_count * 8 < bit_count {
            return Err(ModbusError::frame("Incomplete bit data"));
        }

        Ok(data_utils::unpack_bits(&self.data[1..1 + byte_count], bit_count))
    }
}

/// A frame the decoder could not turn into a response
///
/// `transaction_id` is known once the MBAP header was consumed, so the caller
/// can settle the transaction the bad reply belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameError {
    pub transaction_id: Option<u16>,
    pub error: ModbusError,
}

impl FrameError {
    fn header(error: ModbusError) -> Self {
        Self { transaction_id: None, error }
    }

    fn body(transaction_id: u16, error: ModbusError) -> Self {
        Self {
            transaction_id: Some(transaction_id),
            error,
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transaction_id {
            Some(id) => write!(f, "{} (transaction #{})", self.error, id),
            None => write!(f, "{}", self.error),
        }
    }
}

impl From<FrameError> for ModbusError {
    fn from(err: FrameError) -> Self {
        err.error
    }
}

/// Incremental decoder for the response byte stream of one connection
///
/// Bytes are appended as the transport delivers them; [`next_frame`](Self::next_frame)
/// returns `Ok(None)` while the buffered data does not hold a complete frame.
/// A malformed header is reported once and the buffer is dropped, since the
/// stream can no longer be resynchronised. A complete frame with a bad body
/// is consumed on its own and the frames behind it stay decodable.
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    buffer: BytesMut,
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes waiting for a complete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Forget buffered bytes (after a reconnect)
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Take the next complete frame out of the buffer
    pub fn next_frame(&mut self) -> Result<Option<ModbusResponse>, FrameError> {
        if self.buffer.len() < MBAP_HEADER_SIZE {
            return Ok(None);
        }

        let protocol_id = u16::from_be_bytes([self.buffer[2], self.buffer[3]]);
        let length = u16::from_be_bytes([self.buffer[4], self.buffer[5]]) as usize;
        if protocol_id != 0 {
            self.buffer.clear();
            return Err(FrameError::header(ModbusError::frame(format!(
                "Unexpected protocol id {}",
                protocol_id
            ))));
        }
        if !(2..=MAX_MBAP_LENGTH).contains(&length) {
            self.buffer.clear();
            return Err(FrameError::header(ModbusError::frame(format!(
                "Invalid MBAP length {}",
                length
            ))));
        }
        if self.buffer.len() < MBAP_HEADER_SIZE + length {
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(MBAP_HEADER_SIZE + length);
        let transaction_id = frame.get_u16();
        let _protocol_id = frame.get_u16();
        let _length = frame.get_u16();
        let unit_id = frame.get_u8();
        let function_code = frame.get_u8();

        if function_code & 0x80 != 0 {
            let function = ModbusFunction::from_u8(function_code & 0x7F)
                .map_err(|e| FrameError::body(transaction_id, e))?;
            if frame.is_empty() {
                return Err(FrameError::body(
                    transaction_id,
                    ModbusError::frame("Invalid exception response"),
                ));
            }
            return Ok(Some(ModbusResponse {
                transaction_id,
                unit_id,
                function,
                data: Vec::new(),
                exception_code: Some(frame.get_u8()),
            }));
        }

        let function = ModbusFunction::from_u8(function_code).map_err(|e| FrameError::body(transaction_id, e))?;
        Ok(Some(ModbusResponse {
            transaction_id,
            unit_id,
            function,
            data: frame.to_vec(),
            exception_code: None,
        }))
    }
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian)
    pub fn bytes_to_registers(bytes: &[u8]) -> ModbusResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(ModbusError::invalid_data("Byte array length must be even"));
        }

        Ok(bytes
            .chunks(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }

    /// Pack boolean values into bytes
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let byte_count = (bits.len() + 7) / 8;
        let mut bytes = vec![0u8; byte_count];

        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }

        bytes
    }

    /// Unpack bytes into boolean values
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| {
                bytes
                    .get(i / 8)
                    .map(|byte| byte & (1 << (i % 8)) != 0)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Pack text into registers, two bytes per register, zero padded
    pub fn text_to_registers(text: &str, register_count: usize) -> Vec<u16> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.resize(register_count * 2, 0);
        bytes
            .chunks(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(ModbusFunction::from_u8(0x03).unwrap(), ModbusFunction::ReadHoldingRegisters);
        assert_eq!(ModbusFunction::ReadHoldingRegisters.to_u8(), 0x03);
        assert!(ModbusFunction::WriteSingleCoil.is_bit_function());
        assert!(ModbusFunction::from_u8(0xFF).is_err());
    }

    #[test]
    fn test_exception_conversion() {
        assert_eq!(ModbusException::from_u8(0x02).unwrap(), ModbusException::IllegalDataAddress);
        assert_eq!(ModbusException::IllegalDataAddress.to_u8(), 0x02);
    }

    #[test]
    fn test_request_validation() {
        let valid = ModbusRequest::new_read(ModbusFunction::ReadHoldingRegisters, 100, 10);
        assert!(valid.validate().is_ok());

        let too_many = ModbusRequest::new_read(ModbusFunction::ReadHoldingRegisters, 100, 200);
        assert!(too_many.validate().is_err());

        let past_end = ModbusRequest::new_read(ModbusFunction::ReadHoldingRegisters, 65535, 2);
        assert!(past_end.validate().is_err());
    }

    #[test]
    fn test_encode_read_request() {
        let frame = ModbusRequest::new_read(ModbusFunction::ReadHoldingRegisters, 10, 2).encode(7, DEFAULT_UNIT_ID);
        assert_eq!(
            frame,
            vec![0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x0A, 0x00, 0x02]
        );
    }

    #[test]
    fn test_encode_write_requests() {
        let coil = ModbusRequest::write_single_coil(3, true).encode(1, 1);
        assert_eq!(&coil[7..], &[0x05, 0x00, 0x03, 0xFF, 0x00]);

        let multiple = ModbusRequest::write_multiple_registers(0x20, &[0x0102, 0x0304]).encode(2, 1);
        assert_eq!(&multiple[4..6], &[0x00, 0x0B]);
        assert_eq!(&multiple[7..], &[0x10, 0x00, 0x20, 0x00, 0x02, 0x04, 0x01, 0x02, 0x03, 0x04]);

        let coils = ModbusRequest::write_multiple_coils(0x13, &[true, false, true, true, false, false, false, false, true]);
        assert!(coils.validate().is_ok());
        assert_eq!(&coils.encode(3, 1)[7..], &[0x0F, 0x00, 0x13, 0x00, 0x09, 0x02, 0x0D, 0x01]);

        let too_many = ModbusRequest::write_multiple_coils(0, &[true; 2000]);
        assert!(too_many.validate().is_err());
    }

    #[test]
    fn test_decoder_waits_for_complete_frame() {
        let frame = [0x00, 0x05, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78];
        let mut decoder = ResponseDecoder::new();
        decoder.push(&frame[..4]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&frame[4..10]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&frame[10..]);

        let response = decoder.next_frame().unwrap().unwrap();
        assert_eq!(response.transaction_id, 5);
        assert_eq!(response.parse_registers().unwrap(), vec![0x1234, 0x5678]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_exception_and_garbage() {
        let mut decoder = ResponseDecoder::new();
        decoder.push(&[0x00, 0x09, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02]);
        let response = decoder.next_frame().unwrap().unwrap();
        assert!(response.is_exception());
        assert_eq!(response.function, ModbusFunction::ReadHoldingRegisters);
        assert!(matches!(
            response.parse_registers(),
            Err(ModbusError::Exception { code: 0x02, .. })
        ));

        decoder.push(&[0x00, 0x01, 0x12, 0x34, 0x00, 0x03, 0x01]);
        assert_eq!(decoder.next_frame().unwrap_err().transaction_id, None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_skips_bad_body_and_keeps_next_frame() {
        let mut decoder = ResponseDecoder::new();
        // unsupported function 0x2B, then a valid read answer
        decoder.push(&[0x00, 0x04, 0x00, 0x00, 0x00, 0x03, 0x01, 0x2B, 0x00]);
        decoder.push(&[0x00, 0x05, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x2A]);

        let error = decoder.next_frame().unwrap_err();
        assert_eq!(error.transaction_id, Some(4));
        assert!(matches!(error.error, ModbusError::InvalidFunction { code: 0x2B }));

        let response = decoder.next_frame().unwrap().unwrap();
        assert_eq!(response.transaction_id, 5);
        assert_eq!(response.parse_registers().unwrap(), vec![42]);

        decoder.push(&[0x00, 0x06, 0x00, 0x00, 0x00, 0x02, 0x01, 0x83]);
        assert_eq!(decoder.next_frame().unwrap_err().transaction_id, Some(6));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_data_utils() {
        let registers = vec![0x1234, 0x5678];
        let bytes = data_utils::registers_to_bytes(&registers);
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(data_utils::bytes_to_registers(&bytes).unwrap(), registers);

        let bits = vec![true, false, true, true, false, false, false, false, true];
        let packed = data_utils::pack_bits(&bits);
        assert_eq!(packed, vec![0b0000_1101, 0b0000_0001]);
        assert_eq!(data_utils::unpack_bits(&packed, bits.len()), bits);

        assert_eq!(data_utils::text_to_registers("abc", 3), vec![0x6162, 0x6300, 0x0000]);
    }
}
