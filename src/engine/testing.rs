//------------------------------------------------------------------------------
// Modbus RTU master/slave engine
// Test doubles: in-memory transport and a hand-cranked clock
// This code is under MIT license (see LICENSE.txt)
//------------------------------------------------------------------------------

use std::cell::{ Cell, Ref, RefCell };
use std::collections::VecDeque;
use std::rc::Rc;

use crate::engine::formal::{ crc16, Error, T35 };
use crate::engine::{ Clock, Modbus, Poll, Transport };

/// What the fake wire has seen. The test keeps a handle to this while the
/// engine owns the port itself.
#[derive(Default)]
pub struct PortState {
	pub rx: VecDeque<u8>,
	pub tx: Vec<u8>,
	/// Every line-driver transition, in order.
	pub line_driver: Vec<bool>,
	pub flushes: usize,
}

pub struct TestPort {
	state: Rc<RefCell<PortState>>,
}

#[derive(Clone)]
pub struct PortHandle {
	state: Rc<RefCell<PortState>>,
}

impl TestPort {
	pub fn new() -> (TestPort, PortHandle) {
		let state = Rc::new(RefCell::new(PortState::default()));
		(
			TestPort { state: state.clone() },
			PortHandle { state },
		)
	}
}

impl PortHandle {
	pub fn borrow(&self) -> Ref<PortState> {
		self.state.borrow()
	}

	/// Put bytes on the fake wire for the engine to receive.
	pub fn deliver(&self, bytes: &[u8]) {
		self.state.borrow_mut().rx.extend(bytes.iter().copied());
	}

	pub fn clear_tx(&self) {
		self.state.borrow_mut().tx.clear();
	}
}

impl Transport for TestPort {
	fn available(&mut self) -> usize {
		self.state.borrow().rx.len()
	}

	fn read_byte(&mut self) -> Option<u8> {
		self.state.borrow_mut().rx.pop_front()
	}

	fn write_bytes(&mut self, bytes: &[u8]) {
		self.state.borrow_mut().tx.extend_from_slice(bytes);
	}

	fn flush(&mut self) {
		self.state.borrow_mut().flushes += 1;
	}

	fn set_line_driver(&mut self, enabled: bool) {
		self.state.borrow_mut().line_driver.push(enabled);
	}
}

pub struct TestClock {
	now: Rc<Cell<u32>>,
}

#[derive(Clone)]
pub struct ClockHandle {
	now: Rc<Cell<u32>>,
}

impl TestClock {
	pub fn new() -> (TestClock, ClockHandle) {
		let now = Rc::new(Cell::new(0));
		(
			TestClock { now: now.clone() },
			ClockHandle { now },
		)
	}
}

impl ClockHandle {
	pub fn set(&self, millis: u32) {
		self.now.set(millis);
	}

	pub fn advance(&self, millis: u32) {
		self.now.set(self.now.get().wrapping_add(millis));
	}
}

impl Clock for TestClock {
	fn now_millis(&self) -> u32 {
		self.now.get()
	}
}

/// Append the wire CRC (low byte first) to a frame body.
pub fn with_crc(body: &[u8]) -> Vec<u8> {
	let mut frame = body.to_vec();
	let crc = crc16(body);
	frame.push((crc >> 8) as u8);
	frame.push((crc & 0x00FF) as u8);
	frame
}

/// Deliver one request to a slave engine and poll it through the silence
/// window: the first poll spots the traffic, the second one, past T35,
/// processes the settled frame.
pub fn slave_exchange(
	engine: &mut Modbus<TestPort, TestClock>,
	port: &PortHandle,
	clock: &ClockHandle,
	request: &[u8],
) -> Result<Poll, Error> {
	port.deliver(request);
	assert_eq!(engine.poll_slave(), Ok(Poll::Waiting));
	clock.advance(T35 + 1);
	engine.poll_slave()
}
