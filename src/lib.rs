//------------------------------------------------------------------------------
// Modbus RTU master/slave engine over a half-duplex serial line
// This code is under MIT license (see LICENSE.txt)
//------------------------------------------------------------------------------

//! Modbus RTU wire protocol over a half-duplex serial channel.
//!
//! One [`engine::Modbus`] instance acts either as the polling master of the
//! bus or as one slave node. The engine owns a [`engine::Transport`] (the
//! byte-level serial channel) and a [`engine::Clock`] (a monotonic
//! millisecond counter) and is driven by repeated non-blocking `poll` calls
//! from a host loop; frame boundaries are detected by line silence, frames
//! are protected by the Modbus CRC-16, and a slave serves the eight standard
//! function codes against its four-space register store.

extern crate num;
#[macro_use]
extern crate num_derive;

pub mod engine;

pub use engine::{ BitSpace, Clock, Error, MbExc, MbFunc, Modbus, Poll, RegisterSpace, RegisterStore, Telegram, Transport };
