//------------------------------------------------------------------------------
// Modbus RTU master/slave engine
// Engine structure and shared receive/transmit plumbing
// This code is under MIT license (see LICENSE.txt)
//------------------------------------------------------------------------------

pub mod formal;
pub mod frame;
pub mod store;
pub mod master;
pub mod slave;
mod process;

#[cfg(test)]
pub mod testing;

pub use formal::{ Error, MbExc, MbFunc };
pub use master::Telegram;
pub use store::{ BitSpace, RegisterSpace, RegisterStore };

use crate::engine::formal::{ crc16, DEFAULT_TIMEOUT, T35 };
use crate::engine::frame::Frame;

/// Byte-oriented duplex channel under the engine. The engine never owns the
/// physical port; an adapter (serial, test double) is handed in at
/// construction.
///
/// None of these may block waiting for data. `flush` is the one blocking
/// call: it returns only once every queued byte has physically left the
/// device, which is what makes the RS-485 turnaround below safe.
pub trait Transport {
	/// Number of received bytes ready to be read.
	fn available(&mut self) -> usize;
	/// Take one received byte, if any.
	fn read_byte(&mut self) -> Option<u8>;
	fn write_bytes(&mut self, bytes: &[u8]);
	fn flush(&mut self);
	/// RS-485 driver-enable control. No-op on full-duplex links.
	fn set_line_driver(&mut self, _enabled: bool) {}
}

/// Monotonic millisecond counter. Wraps on overflow; all deadline math in
/// the engine goes through `deadline_passed` and stays correct across the
/// wrap.
pub trait Clock {
	fn now_millis(&self) -> u32;
}

/// Wrap-safe deadline test: compare through subtraction, never directly.
pub(crate) fn deadline_passed(now: u32, deadline: u32) -> bool {
	now.wrapping_sub(deadline) as i32 >= 0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
	Master,
	Slave,
}

/// Communication state of the engine. Only the master ever waits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComState {
	Idle,
	WaitingReply,
}

/// Outcome of one poll cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Poll {
	/// Nothing to do: no traffic, or a frame meant for another node.
	Idle,
	/// An exchange is in flight; call poll again.
	Waiting,
	/// A frame was processed; carries its size in bytes.
	Complete(usize),
}

/// One Modbus RTU protocol engine, master or slave, over an owned transport
/// and clock. All state lives here; every operation takes the engine by
/// exclusive reference and returns promptly.
pub struct Modbus<P: Transport, C: Clock> {
	port: P,
	clock: C,
	role: Role,
	id: u8,
	state: ComState,
	frame: Frame,
	store: RegisterStore,
	last_error: Option<Error>,
	in_cnt: u16,
	out_cnt: u16,
	err_cnt: u16,
	timeout: u32,
	watchdog: u32,
	silence_until: u32,
	last_avail: usize,
}

impl<P: Transport, C: Clock> Modbus<P, C> {
	/// Master engine; node address 0 by definition.
	pub fn master(port: P, clock: C) -> Modbus<P, C> {
		Modbus::init(port, clock, Role::Master, 0)
	}

	/// Slave engine with a node address in 1..=247.
	pub fn slave(port: P, clock: C, id: u8) -> Result<Modbus<P, C>, Error> {
		if id == 0 || id > 247 {
			return Err(Error::InvalidTarget);
		}
		Ok(Modbus::init(port, clock, Role::Slave, id))
	}

	fn init(port: P, clock: C, role: Role, id: u8) -> Modbus<P, C> {
		Modbus {
			port,
			clock,
			role,
			id,
			state: ComState::Idle,
			frame: Frame::new(),
			store: RegisterStore::new(),
			last_error: None,
			in_cnt: 0,
			out_cnt: 0,
			err_cnt: 0,
			timeout: DEFAULT_TIMEOUT,
			watchdog: 0,
			silence_until: 0,
			last_avail: 0,
		}
	}

	pub fn role(&self) -> Role {
		self.role
	}

	/// Node address: 0 for the master, 1..=247 for a slave.
	pub fn id(&self) -> u8 {
		self.id
	}

	/// Change the slave node address. Out-of-range values are rejected.
	pub fn set_id(&mut self, id: u8) -> Result<(), Error> {
		if id == 0 || id > 247 {
			return Err(Error::InvalidTarget);
		}
		self.id = id;
		Ok(())
	}

	pub fn state(&self) -> ComState {
		self.state
	}

	pub fn last_error(&self) -> Option<Error> {
		self.last_error
	}

	/// Communication watchdog in milliseconds. Rearmed on every transmission
	/// and, on the slave, on every valid request.
	pub fn set_timeout(&mut self, ms: u16) {
		self.timeout = ms as u32;
	}

	pub fn timeout(&self) -> u16 {
		self.timeout as u16
	}

	/// True once the watchdog window has elapsed since the last exchange.
	/// Host code uses this on a slave to detect bus silence from the master.
	pub fn watchdog_expired(&self) -> bool {
		deadline_passed(self.clock.now_millis(), self.watchdog)
	}

	/// Incoming frame counter (every drained frame, valid or not).
	pub fn in_count(&self) -> u16 {
		self.in_cnt
	}

	/// Transmitted frame counter.
	pub fn out_count(&self) -> u16 {
		self.out_cnt
	}

	/// Error counter. Accumulates forever; never reset by the engine.
	pub fn err_count(&self) -> u16 {
		self.err_cnt
	}

	pub fn store(&self) -> &RegisterStore {
		&self.store
	}

	pub fn store_mut(&mut self) -> &mut RegisterStore {
		&mut self.store
	}

	pub(crate) fn count_error(&mut self) {
		self.err_cnt = self.err_cnt.wrapping_add(1);
	}

	// Frame-boundary detection: the byte count has to sit still for T35 of
	// line silence before the frame counts as complete.
	pub(crate) fn frame_settled(&mut self, avail: usize, now: u32) -> bool {
		if avail != self.last_avail {
			self.last_avail = avail;
			self.silence_until = now.wrapping_add(T35);
			return false;
		}
		deadline_passed(now, self.silence_until)
	}

	// Move the transport's receive queue into the frame buffer.
	pub(crate) fn drain_frame(&mut self) -> Result<usize, Error> {
		self.frame.clear();
		self.last_avail = 0;
		let mut overflow = false;
		while self.port.available() > 0 {
			let byte = match self.port.read_byte() {
				Some(b) => b,
				None    => break,
			};
			if self.frame.push(byte).is_err() {
				overflow = true;
			}
		}
		self.in_cnt = self.in_cnt.wrapping_add(1);
		log::debug!("rx {}", hex::encode(self.frame.bytes()));
		if overflow {
			self.count_error();
			self.last_error = Some(Error::BufferOverflow);
			return Err(Error::BufferOverflow);
		}
		Ok(self.frame.len())
	}

	// Append the CRC and put the frame on the wire. The line driver stays
	// asserted until flush confirms the last byte has left the device;
	// releasing it earlier would corrupt the tail of our own transmission.
	pub(crate) fn send_frame(&mut self) -> Result<usize, Error> {
		let crc = crc16(self.frame.bytes());
		self.frame.push((crc >> 8) as u8)?;
		self.frame.push((crc & 0x00FF) as u8)?;
		log::debug!("tx {}", hex::encode(self.frame.bytes()));

		self.port.set_line_driver(true);
		self.port.write_bytes(self.frame.bytes());
		self.port.flush();
		self.port.set_line_driver(false);

		self.watchdog = self.clock.now_millis().wrapping_add(self.timeout);
		self.out_cnt = self.out_cnt.wrapping_add(1);
		Ok(self.frame.len())
	}

	pub(crate) fn set_last_error(&mut self, e: Error) {
		self.last_error = Some(e);
	}

	pub(crate) fn clear_last_error(&mut self) {
		self.last_error = None;
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::engine::testing::{ TestClock, TestPort };

	#[test]
	fn deadlines_survive_the_clock_wrap() {
		let deadline = 0xFFFF_FFF0u32.wrapping_add(0x20); // wraps to 0x10
		assert!(!deadline_passed(0xFFFF_FFF5, deadline));
		assert!(!deadline_passed(0x0000_000F, deadline));
		assert!(deadline_passed(0x0000_0010, deadline));
		assert!(deadline_passed(0x0000_0011, deadline));
	}

	#[test]
	fn slave_id_must_be_a_node_address() {
		let (port, _) = TestPort::new();
		let (clock, _) = TestClock::new();
		assert!(Modbus::slave(port, clock, 0).is_err());

		let (port, _) = TestPort::new();
		let (clock, _) = TestClock::new();
		assert!(Modbus::slave(port, clock, 248).is_err());

		let (port, _) = TestPort::new();
		let (clock, _) = TestClock::new();
		let mut engine = Modbus::slave(port, clock, 247).unwrap();
		assert_eq!(engine.id(), 247);
		assert_eq!(engine.set_id(0), Err(Error::InvalidTarget));
		engine.set_id(17).unwrap();
		assert_eq!(engine.id(), 17);
	}

	#[test]
	fn fresh_engine_is_idle_with_clean_counters() {
		let (port, _) = TestPort::new();
		let (clock, _) = TestClock::new();
		let engine = Modbus::master(port, clock);
		assert_eq!(engine.role(), Role::Master);
		assert_eq!(engine.id(), 0);
		assert_eq!(engine.state(), ComState::Idle);
		assert_eq!(engine.last_error(), None);
		assert_eq!(engine.in_count(), 0);
		assert_eq!(engine.out_count(), 0);
		assert_eq!(engine.err_count(), 0);
		assert_eq!(engine.timeout(), 1000);
	}
}
