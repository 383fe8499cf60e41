//------------------------------------------------------------------------------
// Modbus RTU master/slave engine
// Master half: query construction and the reply poll cycle
// This code is under MIT license (see LICENSE.txt)
//------------------------------------------------------------------------------

use crate::engine::formal::{ frame_crc_ok, function_code, is_exception, Error, MbFunc, CHECKSUM_SIZE, MIN_EXCEPTION, RESPONSE_SIZE };
use crate::engine::frame::FUNC;
use crate::engine::{ deadline_passed, Clock, ComState, Modbus, Poll, Role, Transport };

/// Everything the master needs to build one query. The engine borrows the
/// telegram (and its value buffer) only while building the frame; a host may
/// keep several of these and send them cyclically.
#[derive(Clone, Copy, Debug)]
pub struct Telegram<'a> {
	/// Slave address, 1..=247.
	pub id: u8,
	pub function: MbFunc,
	/// First register or coil to access at the slave.
	pub address: u16,
	/// Number of coils or registers to access.
	pub quantity: u16,
	/// Outgoing values for the write functions. Read functions ignore it.
	pub values: &'a [u16],
}

impl<P: Transport, C: Clock> Modbus<P, C> {
	/// Build and transmit one query, then start waiting for the reply.
	/// Only valid on an idle master engine; on success the state moves to
	/// WaitingReply and the reply watchdog is armed.
	pub fn query(&mut self, telegram: &Telegram) -> Result<(), Error> {
		if self.role != Role::Master {
			return Err(Error::NotMaster);
		}
		if self.state != ComState::Idle {
			return Err(Error::AlreadyWaiting);
		}
		if telegram.id == 0 || telegram.id > 247 {
			return Err(Error::InvalidTarget);
		}
		self.build_query(telegram)?;
		self.send_frame()?;
		self.state = ComState::WaitingReply;
		Ok(())
	}

	fn build_query(&mut self, t: &Telegram) -> Result<(), Error> {
		// how many caller values the function consumes
		let needed = match t.function {
			MbFunc::WriteSingleCoil
			| MbFunc::WriteSingleRegister => 1,
			MbFunc::WriteMultipleCoils
			| MbFunc::WriteMultipleRegisters => t.quantity as usize,
			_ => 0,
		};
		if t.values.len() < needed {
			return Err(Error::AddressOutOfRange);
		}

		self.frame.clear();
		self.frame.push(t.id)?;
		self.frame.push(t.function as u8)?;
		self.frame.push_u16(t.address)?;

		match t.function {
			MbFunc::ReadCoils
			| MbFunc::ReadDiscreteInputs
			| MbFunc::ReadHoldingRegisters
			| MbFunc::ReadInputRegisters => {
				self.frame.push_u16(t.quantity)?;
			},

			MbFunc::WriteSingleCoil => {
				self.frame.push(if t.values[0] > 0 { 0xFF } else { 0x00 })?;
				self.frame.push(0x00)?;
			},

			MbFunc::WriteSingleRegister => {
				self.frame.push_u16(t.values[0])?;
			},

			MbFunc::WriteMultipleCoils => {
				let n_bytes = (t.quantity as usize + 7) / 8;
				self.frame.push_u16(t.quantity)?;
				self.frame.push(n_bytes as u8)?;
				// pack the coil states LSB-first, one bit per requested coil
				let mut byte = 0u8;
				for i in 0..t.quantity as usize {
					if t.values[i] > 0 {
						byte |= 1 << (i % 8);
					}
					if i % 8 == 7 {
						self.frame.push(byte)?;
						byte = 0;
					}
				}
				if t.quantity % 8 != 0 {
					self.frame.push(byte)?;
				}
			},

			MbFunc::WriteMultipleRegisters => {
				self.frame.push_u16(t.quantity)?;
				self.frame.push((t.quantity as usize * 2) as u8)?;
				for i in 0..t.quantity as usize {
					self.frame.push_u16(t.values[i])?;
				}
			},
		}
		Ok(())
	}

	/// Master poll cycle: watch for the reply to the query in flight.
	/// Non-blocking; returns Waiting until a whole frame has settled on the
	/// line, then validates it and, for the read functions, copies the
	/// payload into `dest`. Every outcome other than Waiting leaves the
	/// engine idle again.
	pub fn poll(&mut self, dest: &mut [u16]) -> Result<Poll, Error> {
		if self.role != Role::Master {
			return Err(Error::NotMaster);
		}
		if self.state != ComState::WaitingReply {
			return Ok(Poll::Idle);
		}

		let now = self.clock.now_millis();
		if deadline_passed(now, self.watchdog) {
			self.state = ComState::Idle;
			self.set_last_error(Error::NoReply);
			self.count_error();
			return Err(Error::NoReply);
		}

		let avail = self.port.available();
		if avail == 0 {
			return Ok(Poll::Waiting);
		}
		if !self.frame_settled(avail, now) {
			return Ok(Poll::Waiting);
		}

		// a full frame is in; whatever happens next, this exchange is over
		self.state = ComState::Idle;
		self.drain_frame()?;

		if let Err(e) = self.validate_answer() {
			self.set_last_error(e);
			return Err(e);
		}

		match num::FromPrimitive::from_u8(self.frame.function()) {
			Some(MbFunc::ReadCoils)
			| Some(MbFunc::ReadDiscreteInputs) => self.get_fc1(dest),
			Some(MbFunc::ReadHoldingRegisters)
			| Some(MbFunc::ReadInputRegisters) => self.get_fc3(dest),
			// write replies carry no payload to copy
			_ => {},
		}

		self.clear_last_error();
		Ok(Poll::Complete(self.frame.len()))
	}

	// Validate a reply: length, CRC, exception bit, function support.
	// Replies do not all share one minimum size: an exception is five bytes,
	// a read reply shrinks with its byte count, a write echo is eight.
	fn validate_answer(&mut self) -> Result<(), Error> {
		if self.frame.len() < MIN_EXCEPTION {
			self.count_error();
			return Err(Error::ShortFrame);
		}
		if !frame_crc_ok(self.frame.bytes()) {
			self.count_error();
			return Err(Error::NoReply);
		}
		if is_exception(self.frame.bytes()) {
			self.count_error();
			return Err(Error::Exception(self.frame.at(FUNC + 1)));
		}
		let func = match function_code(self.frame.function()) {
			Ok(f) => f,
			Err(e) => {
				self.count_error();
				return Err(e);
			},
		};
		let minimum = match func {
			MbFunc::ReadCoils
			| MbFunc::ReadDiscreteInputs
			| MbFunc::ReadHoldingRegisters
			| MbFunc::ReadInputRegisters => REPLY_PAYLOAD + self.frame.byte_count() as usize + CHECKSUM_SIZE,
			_ => RESPONSE_SIZE + CHECKSUM_SIZE,
		};
		if self.frame.len() < minimum {
			self.count_error();
			return Err(Error::ShortFrame);
		}
		Ok(())
	}

	// Reply payload of FC1/FC2: packed coil bytes, copied into the caller's
	// buffer as big-endian words, an odd trailing byte padded low.
	fn get_fc1(&mut self, dest: &mut [u16]) {
		let n_bytes = self.frame.byte_count() as usize;
		let n_bytes = n_bytes.min(self.frame.len().saturating_sub(REPLY_PAYLOAD + CHECKSUM_SIZE));
		let words = (n_bytes + 1) / 2;
		for i in 0..words.min(dest.len()) {
			let hi = self.frame.at(REPLY_PAYLOAD + 2 * i) as u16;
			let lo = if 2 * i + 1 < n_bytes {
				self.frame.at(REPLY_PAYLOAD + 2 * i + 1) as u16
			} else {
				0
			};
			dest[i] = (hi << 8) | lo;
		}
	}

	// Reply payload of FC3/FC4: big-endian words into the caller's buffer.
	fn get_fc3(&mut self, dest: &mut [u16]) {
		let words = self.frame.byte_count() as usize / 2;
		let words = words.min(self.frame.len().saturating_sub(REPLY_PAYLOAD + CHECKSUM_SIZE) / 2);
		for i in 0..words.min(dest.len()) {
			dest[i] = self.frame.u16_at(REPLY_PAYLOAD + 2 * i);
		}
	}
}

// Read replies carry their payload right after id, function and byte count.
const REPLY_PAYLOAD: usize = 3;
