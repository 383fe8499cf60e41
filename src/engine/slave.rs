//------------------------------------------------------------------------------
// Modbus RTU master/slave engine
// Slave half: request detection, validation and exception replies
// This code is under MIT license (see LICENSE.txt)
//------------------------------------------------------------------------------

use crate::engine::formal::{ frame_crc_ok, function_code, Error, MbExc, MbFunc, CHECKSUM_SIZE, MIN_FRAME };
use crate::engine::frame::BYTE_CNT;
use crate::engine::store::{ BitSpace, RegisterSpace };
use crate::engine::{ Clock, Modbus, Poll, Role, Transport };

impl<P: Transport, C: Clock> Modbus<P, C> {
	/// Slave poll cycle: watch the line for a request addressed to this
	/// node, validate it, execute it against the register store and reply.
	/// Non-blocking; frames for other nodes are discarded without comment,
	/// a bad CRC is never answered (the master's watchdog covers it), and
	/// semantic faults are answered with an exception frame.
	pub fn poll_slave(&mut self) -> Result<Poll, Error> {
		if self.role != Role::Slave {
			return Err(Error::NotSlave);
		}

		let now = self.clock.now_millis();
		let avail = self.port.available();
		if avail == 0 {
			return Ok(Poll::Idle);
		}
		if !self.frame_settled(avail, now) {
			return Ok(Poll::Waiting);
		}

		self.drain_frame()?;
		if self.frame.len() < MIN_FRAME {
			self.set_last_error(Error::ShortFrame);
			return Err(Error::ShortFrame);
		}
		if self.frame.id() != self.id {
			// normal bus traffic for another node
			return Ok(Poll::Idle);
		}

		let func = match self.validate_request() {
			Ok(f) => f,
			Err(e) => {
				self.set_last_error(e);
				if let Some(exc) = e.exception() {
					self.send_exception(exc)?;
				}
				return Err(e);
			},
		};

		// the master is alive; give the host a fresh watchdog window
		self.watchdog = now.wrapping_add(self.timeout);
		self.clear_last_error();

		match self.dispatch(func) {
			Ok(sent) => Ok(Poll::Complete(sent)),
			Err(e) => {
				// store fault after a validated request; report a device
				// failure rather than leaving the master to time out
				self.set_last_error(e);
				self.send_exception(e.exception().unwrap_or(MbExc::SlaveDeviceFailure))?;
				Err(e)
			},
		}
	}

	fn dispatch(&mut self, func: MbFunc) -> Result<usize, Error> {
		match func {
			MbFunc::ReadCoils              => self.process_fc1(BitSpace::Coil),
			MbFunc::ReadDiscreteInputs     => self.process_fc1(BitSpace::Discrete),
			MbFunc::ReadHoldingRegisters   => self.process_fc3(RegisterSpace::Holding),
			MbFunc::ReadInputRegisters     => self.process_fc3(RegisterSpace::Input),
			MbFunc::WriteSingleCoil        => self.process_fc5(),
			MbFunc::WriteSingleRegister    => self.process_fc6(),
			MbFunc::WriteMultipleCoils     => self.process_fc15(),
			MbFunc::WriteMultipleRegisters => self.process_fc16(),
		}
	}

	// Validate a request addressed to us: CRC, function support, then the
	// address range against the capacity of the space the function actually
	// touches.
	fn validate_request(&mut self) -> Result<MbFunc, Error> {
		if !frame_crc_ok(self.frame.bytes()) {
			self.count_error();
			return Err(Error::NoReply);
		}

		let func = match function_code(self.frame.function()) {
			Ok(f) => f,
			Err(e) => {
				self.count_error();
				return Err(e);
			},
		};

		let addr = self.frame.address() as usize;
		let quantity = self.frame.quantity() as usize;
		match func {
			MbFunc::ReadCoils            => check_range(addr, quantity, BitSpace::Coil.capacity())?,
			MbFunc::ReadDiscreteInputs   => check_range(addr, quantity, BitSpace::Discrete.capacity())?,
			MbFunc::ReadHoldingRegisters => check_range(addr, quantity, RegisterSpace::Holding.capacity())?,
			MbFunc::ReadInputRegisters   => check_range(addr, quantity, RegisterSpace::Input.capacity())?,
			MbFunc::WriteSingleCoil      => check_single(addr, BitSpace::Coil.capacity())?,
			MbFunc::WriteSingleRegister  => check_single(addr, RegisterSpace::Holding.capacity())?,
			MbFunc::WriteMultipleCoils => {
				check_range(addr, quantity, BitSpace::Coil.capacity())?;
				self.check_payload((quantity + 7) / 8)?;
			},
			MbFunc::WriteMultipleRegisters => {
				check_range(addr, quantity, RegisterSpace::Holding.capacity())?;
				self.check_payload(quantity * 2)?;
			},
		}
		Ok(func)
	}

	// The multi-write functions carry a byte count; it has to agree with the
	// quantity and the payload has to actually be there.
	fn check_payload(&self, expected: usize) -> Result<(), Error> {
		if self.frame.byte_count() as usize != expected {
			return Err(Error::IllegalDataValue);
		}
		if self.frame.len() < BYTE_CNT + 1 + expected + CHECKSUM_SIZE {
			return Err(Error::IllegalDataValue);
		}
		Ok(())
	}

	// Exception reply: requester id, function with the high bit set, one
	// exception-code byte.
	fn send_exception(&mut self, exc: MbExc) -> Result<(), Error> {
		let func = self.frame.function();
		log::warn!("exception {:?} replying to function {:#04x}", exc, func);
		self.frame.clear();
		self.frame.push(self.id)?;
		self.frame.push(func | 0x80)?;
		self.frame.push(exc as u8)?;
		self.send_frame()?;
		Ok(())
	}
}

fn check_range(addr: usize, quantity: usize, capacity: usize) -> Result<(), Error> {
	if quantity == 0 {
		return Err(Error::IllegalDataValue);
	}
	if addr + quantity > capacity {
		return Err(Error::IllegalDataAddress);
	}
	Ok(())
}

fn check_single(addr: usize, capacity: usize) -> Result<(), Error> {
	if addr >= capacity {
		return Err(Error::IllegalDataAddress);
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::engine::testing::{ slave_exchange, with_crc, TestClock, TestPort };
	use crate::engine::Modbus;

	fn slave(id: u8) -> (Modbus<TestPort, TestClock>, crate::engine::testing::PortHandle, crate::engine::testing::ClockHandle) {
		let (port, ph) = TestPort::new();
		let (clock, ch) = TestClock::new();
		(Modbus::slave(port, clock, id).unwrap(), ph, ch)
	}

	#[test]
	fn frame_for_another_node_is_ignored() {
		let (mut s, ph, ch) = slave(1);
		let request = with_crc(&[0x02, 0x03, 0x00, 0x00, 0x00, 0x02]);
		assert_eq!(slave_exchange(&mut s, &ph, &ch, &request), Ok(Poll::Idle));
		assert!(ph.borrow().tx.is_empty());
		assert_eq!(s.err_count(), 0);
		assert_eq!(s.in_count(), 1);
	}

	#[test]
	fn bad_crc_gets_no_reply_at_all() {
		let (mut s, ph, ch) = slave(1);
		let mut request = with_crc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]);
		request[2] ^= 0x10;
		assert_eq!(slave_exchange(&mut s, &ph, &ch, &request), Err(Error::NoReply));
		assert!(ph.borrow().tx.is_empty());
		assert_eq!(s.err_count(), 1);
		assert_eq!(s.last_error(), Some(Error::NoReply));
	}

	#[test]
	fn unsupported_function_raises_exception_one() {
		let (mut s, ph, ch) = slave(1);
		let request = with_crc(&[0x01, 0x07, 0x00, 0x00, 0x00, 0x01]);
		assert_eq!(slave_exchange(&mut s, &ph, &ch, &request), Err(Error::IllegalFunction));
		assert_eq!(ph.borrow().tx, with_crc(&[0x01, 0x87, 0x01]));
		assert_eq!(s.err_count(), 1);
	}

	#[test]
	fn out_of_range_read_raises_exception_two() {
		let (mut s, ph, ch) = slave(1);
		// 16-word space; 10 + 10 runs past it
		let request = with_crc(&[0x01, 0x03, 0x00, 0x0A, 0x00, 0x0A]);
		assert_eq!(slave_exchange(&mut s, &ph, &ch, &request), Err(Error::IllegalDataAddress));
		assert_eq!(ph.borrow().tx, with_crc(&[0x01, 0x83, 0x02]));
	}

	#[test]
	fn single_write_at_the_capacity_boundary_is_rejected() {
		let (mut s, ph, ch) = slave(1);
		let request = with_crc(&[0x01, 0x06, 0x00, 0x10, 0x12, 0x34]);
		assert_eq!(slave_exchange(&mut s, &ph, &ch, &request), Err(Error::IllegalDataAddress));
		assert_eq!(ph.borrow().tx, with_crc(&[0x01, 0x86, 0x02]));
	}

	#[test]
	fn zero_quantity_raises_exception_three() {
		let (mut s, ph, ch) = slave(1);
		let request = with_crc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x00]);
		assert_eq!(slave_exchange(&mut s, &ph, &ch, &request), Err(Error::IllegalDataValue));
		assert_eq!(ph.borrow().tx, with_crc(&[0x01, 0x83, 0x03]));
	}

	#[test]
	fn byte_count_disagreeing_with_quantity_raises_exception_three() {
		let (mut s, ph, ch) = slave(1);
		// two registers announced, but byte count says 2 instead of 4
		let request = with_crc(&[0x01, 0x10, 0x00, 0x00, 0x00, 0x02, 0x02, 0x12, 0x34]);
		assert_eq!(slave_exchange(&mut s, &ph, &ch, &request), Err(Error::IllegalDataValue));
		assert_eq!(ph.borrow().tx, with_crc(&[0x01, 0x90, 0x03]));
	}

	#[test]
	fn short_frames_are_dropped_silently() {
		let (mut s, ph, ch) = slave(1);
		assert_eq!(slave_exchange(&mut s, &ph, &ch, &[0x01, 0x03, 0x00]), Err(Error::ShortFrame));
		assert!(ph.borrow().tx.is_empty());
		assert_eq!(s.err_count(), 0);
	}

	#[test]
	fn valid_request_rearms_the_watchdog() {
		let (mut s, ph, ch) = slave(1);
		ch.set(1000);
		assert!(s.watchdog_expired());

		let request = with_crc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]);
		assert!(matches!(slave_exchange(&mut s, &ph, &ch, &request), Ok(Poll::Complete(_))));

		ch.set(1500);
		assert!(!s.watchdog_expired());
		ch.set(2100);
		assert!(s.watchdog_expired());
	}

	#[test]
	fn master_engine_cannot_serve_requests() {
		let (port, _ph) = TestPort::new();
		let (clock, _ch) = TestClock::new();
		let mut m = Modbus::master(port, clock);
		assert_eq!(m.poll_slave(), Err(Error::NotSlave));
	}
}
