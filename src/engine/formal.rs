//------------------------------------------------------------------------------
// Modbus RTU master/slave engine
// Formal parts of the protocol: CRC, codes, frame constants, error taxonomy
// This code is under MIT license (see LICENSE.txt)
//------------------------------------------------------------------------------

use crate::engine::frame::FUNC;

/// Inter-character silence that closes a frame, in milliseconds.
/// Approximates the 3.5 character times of the Modbus serial line standard.
pub const T35: u32 = 5;

/// Reply watchdog default, in milliseconds.
pub const DEFAULT_TIMEOUT: u32 = 1000;

/// Echo replies keep the first six bytes of the request.
pub const RESPONSE_SIZE: usize = 6;

/// Exception frame body: id, function | 0x80, exception code.
pub const EXCEPTION_SIZE: usize = 3;

pub const CHECKSUM_SIZE: usize = 2;

/// Frames shorter than this are dropped as line noise; a complete request
/// (id, function, four data bytes, CRC) is eight bytes.
pub const MIN_FRAME: usize = 7;

/// Shortest well-formed exception reply (EXCEPTION_SIZE + CRC).
pub const MIN_EXCEPTION: usize = EXCEPTION_SIZE + CHECKSUM_SIZE;

// Расчёт CRC по спецификации Modbus (seed 0xFFFF, полином 0xA001).
// The result is returned byte-swapped, so writing it out big-endian puts the
// CRC low byte first on the wire, as RTU framing requires.
pub fn crc16(buf: &[u8]) -> u16 {
	let mut crc: u16 = 0xFFFF;
	for &e in buf.iter() {
		crc ^= e as u16;
		for _ in 0..8 {
			if (crc & 0x0001) != 0 {
				crc >>= 1;
				crc ^= 0xA001;
			}
			else {
				crc >>= 1;
			}
		}
	}
	(crc << 8) | (crc >> 8)
}

// Check the CRC carried in the last two bytes of a frame (low byte first)
// against the CRC of everything before it.
pub fn frame_crc_ok(frame: &[u8]) -> bool {
	if frame.len() < CHECKSUM_SIZE + 1 { return false; }
	let body = frame.len() - CHECKSUM_SIZE;
	let wire = ((frame[body] as u16) << 8) | frame[body + 1] as u16;
	crc16(&frame[..body]) == wire
}

// Modbus function codes
#[derive(FromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MbFunc {
	ReadCoils              = 0x01,
	ReadDiscreteInputs     = 0x02,
	ReadHoldingRegisters   = 0x03,
	ReadInputRegisters     = 0x04,
	WriteSingleCoil        = 0x05,
	WriteSingleRegister    = 0x06,
	WriteMultipleCoils     = 0x0F,
	WriteMultipleRegisters = 0x10,
}

// Function-code support check, shared by both engine halves. The supported
// set is exactly the eight codes of MbFunc.
pub fn function_code(raw: u8) -> Result<MbFunc, Error> {
	let f: Option<MbFunc> = num::FromPrimitive::from_u8(raw);
	f.ok_or(Error::IllegalFunction)
}

/// True for a reply whose function code carries the exception bit.
pub fn is_exception(frame: &[u8]) -> bool {
	frame.len() > FUNC && (frame[FUNC] & 0x80) != 0
}

// Modbus exception codes placed on the wire. The internal no-reply
// pseudo-code (255) is never transmitted and is modelled as Error::NoReply.
#[repr(u8)]
#[derive(FromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MbExc {
	IllegalFunction    = 1,
	IllegalDataAddress = 2,
	IllegalDataValue   = 3,
	SlaveDeviceFailure = 4,
}

/// Everything that can go wrong on the bus or at the engine API.
/// Protocol faults are recovered locally; the engine returns to idle and the
/// caller sees one of these.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
	#[error("query is only valid on the master engine")]
	NotMaster,
	#[error("slave poll is only valid on a slave engine")]
	NotSlave,
	#[error("a query is already waiting for its reply")]
	AlreadyWaiting,
	#[error("target id must be in 1..=247")]
	InvalidTarget,
	#[error("no reply inside the watchdog window")]
	NoReply,
	#[error("frame does not fit the communication buffer")]
	BufferOverflow,
	#[error("frame is shorter than the protocol minimum")]
	ShortFrame,
	#[error("unsupported function code")]
	IllegalFunction,
	#[error("address range outside the data area")]
	IllegalDataAddress,
	#[error("illegal data value or quantity")]
	IllegalDataValue,
	#[error("register store access out of range")]
	AddressOutOfRange,
	#[error("slave replied with exception code {0}")]
	Exception(u8),
}

impl Error {
	/// Wire exception code for faults that are answered with an exception
	/// frame. None for faults that must stay off the wire (a bad CRC may not
	/// even have been addressed to this node).
	pub fn exception(&self) -> Option<MbExc> {
		match self {
			Error::IllegalFunction    => Some(MbExc::IllegalFunction),
			Error::IllegalDataAddress => Some(MbExc::IllegalDataAddress),
			Error::IllegalDataValue   => Some(MbExc::IllegalDataValue),
			Error::AddressOutOfRange  => Some(MbExc::SlaveDeviceFailure),
			_ => None,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn crc_known_vector() {
		// 01 03 00 00 00 0A carries CRC 0xCDC5, low byte 0xC5 first on the wire.
		let frame = [0x01u8, 0x03, 0x00, 0x00, 0x00, 0x0A];
		assert_eq!(crc16(&frame), 0xC5CD);
	}

	#[test]
	fn crc_append_then_validate() {
		let mut frame = vec![0x11u8, 0x03, 0x00, 0x6B, 0x00, 0x03];
		let crc = crc16(&frame);
		frame.push((crc >> 8) as u8);
		frame.push((crc & 0x00FF) as u8);
		assert!(frame_crc_ok(&frame));
	}

	#[test]
	fn crc_catches_any_single_bit_flip() {
		let mut frame = vec![0x01u8, 0x06, 0x00, 0x05, 0x00, 0xFF];
		let crc = crc16(&frame);
		frame.push((crc >> 8) as u8);
		frame.push((crc & 0x00FF) as u8);

		for byte in 0..frame.len() {
			for bit in 0..8 {
				let mut bad = frame.clone();
				bad[byte] ^= 1 << bit;
				assert!(!frame_crc_ok(&bad), "flip of byte {} bit {} went unnoticed", byte, bit);
			}
		}
	}

	#[test]
	fn supported_set_is_exactly_the_eight_codes() {
		for fc in 0..=255u8 {
			let expected = matches!(fc, 1..=6 | 15 | 16);
			assert_eq!(function_code(fc).is_ok(), expected, "function {}", fc);
		}
	}

	#[test]
	fn exception_mapping() {
		assert_eq!(Error::IllegalFunction.exception(), Some(MbExc::IllegalFunction));
		assert_eq!(Error::IllegalDataAddress.exception(), Some(MbExc::IllegalDataAddress));
		assert_eq!(Error::IllegalDataValue.exception(), Some(MbExc::IllegalDataValue));
		assert_eq!(Error::AddressOutOfRange.exception(), Some(MbExc::SlaveDeviceFailure));
		assert_eq!(Error::NoReply.exception(), None);
		assert_eq!(Error::ShortFrame.exception(), None);
	}
}
