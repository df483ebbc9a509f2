//! Frame construction and validation for the register protocol.
//!
//! Requests are always eight bytes: slave, function, a big-endian address,
//! a big-endian quantity or value, and the checksum low byte first. Read
//! responses carry a byte count followed by big-endian register pairs.

use thiserror::Error;

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const READ_INPUT_REGISTERS: u8 = 0x04;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;

pub const REQUEST_LEN: usize = 8;
/// A write-single response echoes the request.
pub const WRITE_RESPONSE_LEN: usize = REQUEST_LEN;

const MIN_CHECKED_LEN: usize = 4;
const MIN_RESPONSE_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFunction {
    Holding,
    Input,
}

impl ReadFunction {
    pub fn code(self) -> u8 {
        match self {
            ReadFunction::Holding => READ_HOLDING_REGISTERS,
            ReadFunction::Input => READ_INPUT_REGISTERS,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
    #[error("checksum mismatch: received {received:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { received: u16, computed: u16 },
    #[error("byte count {byte_count} exceeds the {available} data bytes present")]
    Truncated { byte_count: usize, available: usize },
    #[error("{count} registers do not fit in a one-byte byte count")]
    TooManyRegisters { count: usize },
}

/// CRC-16 over `bytes`, seed 0xFFFF, reflected polynomial 0xA001.
pub fn checksum16(bytes: &[u8]) -> u16 {
    crc16::State::<crc16::MODBUS>::calculate(bytes)
}

/// Appends the checksum of everything already in `frame`, low byte first.
pub fn append_checksum(frame: &mut Vec<u8>) {
    let crc = checksum16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

pub fn verify_checksum(frame: &[u8]) -> bool {
    check_frame(frame).is_ok()
}

/// Like [`verify_checksum`] but says what is wrong.
pub fn check_frame(frame: &[u8]) -> Result<(), FrameError> {
    let len = frame.len();
    if len < MIN_CHECKED_LEN {
        return Err(FrameError::TooShort {
            len,
            min: MIN_CHECKED_LEN,
        });
    }
    let received = (u16::from(frame[len - 1]) << 8) | u16::from(frame[len - 2]);
    let computed = checksum16(&frame[..len - 2]);
    if received != computed {
        return Err(FrameError::ChecksumMismatch { received, computed });
    }
    Ok(())
}

fn request(slave: u8, function: u8, address: u16, word: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(REQUEST_LEN);
    frame.push(slave);
    frame.push(function);
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&word.to_be_bytes());
    append_checksum(&mut frame);
    frame
}

pub fn build_read_request(function: ReadFunction, slave: u8, start: u16, quantity: u16) -> Vec<u8> {
    request(slave, function.code(), start, quantity)
}

pub fn build_write_single_request(slave: u8, address: u16, value: u16) -> Vec<u8> {
    request(slave, WRITE_SINGLE_REGISTER, address, value)
}

/// Expected length of a read response carrying `quantity` registers.
pub fn read_response_len(quantity: u16) -> usize {
    MIN_RESPONSE_LEN + 2 * usize::from(quantity)
}

/// Builds a read response the way a device would send it. At most 127
/// registers fit in the one-byte byte count.
pub fn encode_read_response(slave: u8, function: u8, registers: &[u16]) -> Result<Vec<u8>, FrameError> {
    let byte_count = u8::try_from(registers.len() * 2).map_err(|_| FrameError::TooManyRegisters {
        count: registers.len(),
    })?;
    let mut frame = Vec::with_capacity(MIN_RESPONSE_LEN + registers.len() * 2);
    frame.push(slave);
    frame.push(function);
    frame.push(byte_count);
    for register in registers {
        frame.extend_from_slice(&register.to_be_bytes());
    }
    append_checksum(&mut frame);
    Ok(frame)
}

/// Validates a read response and returns its registers in order.
pub fn parse_registers(response: &[u8]) -> Result<Vec<u16>, FrameError> {
    if response.len() < MIN_RESPONSE_LEN {
        return Err(FrameError::TooShort {
            len: response.len(),
            min: MIN_RESPONSE_LEN,
        });
    }
    check_frame(response)?;

    let byte_count = usize::from(response[2]);
    let available = response.len() - MIN_RESPONSE_LEN;
    if byte_count > available {
        return Err(FrameError::Truncated {
            byte_count,
            available,
        });
    }

    Ok(response[3..3 + byte_count]
        .chunks_exact(2)
        .map(|pair| (u16::from(pair[0]) << 8) | u16::from(pair[1]))
        .collect())
}

pub fn to_float(register: u16, scale: f32) -> f32 {
    f32::from(register) / scale
}

/// Truncates toward zero; values outside the register range saturate.
pub fn from_float(value: f32, scale: f32) -> u16 {
    (value * scale) as u16
}
