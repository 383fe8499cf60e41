//------------------------------------------------------------------------------
// Modbus RTU master/slave engine
// Processing of validated requests against the register store
// This code is under MIT license (see LICENSE.txt)
//------------------------------------------------------------------------------

use crate::engine::formal::{ Error, RESPONSE_SIZE };
use crate::engine::frame::{ BYTE_CNT, FUNC, NB_HI };
use crate::engine::store::{ BitSpace, RegisterSpace, SIZE_RW_REGS };
use crate::engine::{ Clock, Modbus, Transport };

impl<P: Transport, C: Clock> Modbus<P, C> {
	// FC1 / FC2: read a run of bits and pack them into the reply,
	// LSB-first within each byte, byte count = ceil(quantity / 8).
	pub(super) fn process_fc1(&mut self, space: BitSpace) -> Result<usize, Error> {
		let start = self.frame.address();
		let quantity = self.frame.quantity();
		let n_bytes = (quantity as usize + 7) / 8;

		self.frame.truncate(FUNC + 1);
		self.frame.push(n_bytes as u8)?;

		let mut byte = 0u8;
		for i in 0..quantity {
			if self.store.bit(space, start + i)? {
				byte |= 1 << (i % 8);
			}
			if i % 8 == 7 {
				self.frame.push(byte)?;
				byte = 0;
			}
		}
		if quantity % 8 != 0 {
			self.frame.push(byte)?;
		}
		self.send_frame()
	}

	// FC3 / FC4: read a run of registers, big-endian words in the reply,
	// byte count = quantity * 2.
	pub(super) fn process_fc3(&mut self, space: RegisterSpace) -> Result<usize, Error> {
		let start = self.frame.address();
		let quantity = self.frame.quantity() as usize;

		let mut words = [0u16; SIZE_RW_REGS];
		self.store.read_registers(space, start, &mut words[..quantity])?;

		self.frame.truncate(FUNC + 1);
		self.frame.push((quantity * 2) as u8)?;
		for &word in &words[..quantity] {
			self.frame.push_u16(word)?;
		}
		self.send_frame()
	}

	// FC5: write one coil; 0xFF00 sets, anything else clears.
	// The reply is the request echoed back.
	pub(super) fn process_fc5(&mut self) -> Result<usize, Error> {
		let addr = self.frame.address();
		let on = self.frame.at(NB_HI) == 0xFF;
		self.store.set_bit(BitSpace::Coil, addr, on)?;

		self.frame.truncate(RESPONSE_SIZE);
		self.send_frame()
	}

	// FC6: write one holding register; the reply echoes the request.
	pub(super) fn process_fc6(&mut self) -> Result<usize, Error> {
		let addr = self.frame.address();
		let value = self.frame.u16_at(NB_HI);
		self.store.set_register(RegisterSpace::Holding, addr, value)?;

		self.frame.truncate(RESPONSE_SIZE);
		self.send_frame()
	}

	// FC15: unpack the payload bits into the coil space. The reply keeps
	// only id, function, address and quantity.
	pub(super) fn process_fc15(&mut self) -> Result<usize, Error> {
		let start = self.frame.address();
		let quantity = self.frame.quantity();

		for i in 0..quantity {
			let byte = self.frame.at(BYTE_CNT + 1 + i as usize / 8);
			let on = byte & (1 << (i % 8)) != 0;
			self.store.set_bit(BitSpace::Coil, start + i, on)?;
		}

		self.frame.truncate(RESPONSE_SIZE);
		self.send_frame()
	}

	// FC16: unpack big-endian words into the holding registers in one
	// bounds-checked store write. The reply keeps only the header.
	pub(super) fn process_fc16(&mut self) -> Result<usize, Error> {
		let start = self.frame.address();
		let quantity = self.frame.quantity() as usize;

		let mut words = [0u16; SIZE_RW_REGS];
		for i in 0..quantity {
			words[i] = self.frame.u16_at(BYTE_CNT + 1 + 2 * i);
		}
		self.store.write_registers(RegisterSpace::Holding, start, &words[..quantity])?;

		self.frame.truncate(RESPONSE_SIZE);
		self.send_frame()
	}
}
