//------------------------------------------------------------------------------
// Modbus RTU master/slave engine over a serial line
// This code is under MIT license (see LICENSE.txt)
//------------------------------------------------------------------------------
use std::io::{ Read, Write };
use std::thread;
use std::time::{ Duration, Instant };

use structopt::StructOpt;
use serialport::{ SerialPort, Parity };

use modbus_rtu::{ BitSpace, Clock, MbFunc, Modbus, Poll, RegisterSpace, Telegram, Transport };

#[derive(Debug, StructOpt)]
#[structopt(name = "Modbus RTU", about = "parameters")]
struct Opt {
	/// Engine role: master or slave
	#[structopt(short, long, default_value="slave")]
	mode: String,
	/// Own node address in slave mode
	#[structopt(short, long, default_value="1")]
	slave_id: u8,
	/// Node polled in master mode
	#[structopt(long, default_value="1")]
	target: u8,
	/// First holding register polled in master mode
	#[structopt(long, default_value="0")]
	address: u16,
	/// Number of registers polled in master mode
	#[structopt(long, default_value="4")]
	quantity: u16,
	/// Serial port name
	#[structopt(short, long)]
	port: String,
	/// Baud rate
	#[structopt(short, long, default_value="9600")]
	baudrate: u32,
	/// Serial port parity
	#[structopt(short="a", long, default_value="even")]
	parity: String,
	/// Watchdog timeout in ms
	#[structopt(short, long, default_value="1000")]
	timeout: u16,
}

fn main() -> Result<(), Box<dyn std::error::Error>>  {
	env_logger::init();
	let opt = Opt::from_args();

	let ports = serialport::available_ports().expect("No serial ports found in this system");

	let port_name = match ports.iter().find(|p| p.port_name == opt.port) {
		Some(p) => p.port_name.as_str(),
		None    => {
			eprintln!("Warning! Serial port \"{}\" was not found.", opt.port);
			eprintln!("Existing ports:");
			if ports.len() > 0 {
				for (i, p) in ports.iter().enumerate() {
					eprintln!("\t{}: {}", i, p.port_name);
				}
			}
			else { eprintln!("[no ports found]"); }
			opt.port.as_str()
		},
	};
	let parity = match opt.parity.to_lowercase().as_str() {
		"even" => Parity::Even,
		"odd"  => Parity::Odd,
		"none" => Parity::None,
		&_     => panic!("Invalid parity. Use values: Even, Odd and None.")
	};

	let port = serialport::new(port_name, opt.baudrate)
		// short read timeout: the engine only reads bytes it knows are there
		.timeout(Duration::from_millis(10))
		.parity(parity)
		.open().expect("Failed to open the port");

	display_port_settings(&port);

	let link = SerialLink { port };
	let clock = WallClock { origin: Instant::now() };

	match opt.mode.to_lowercase().as_str() {
		"master" => {
			let mut engine = Modbus::master(link, clock);
			engine.set_timeout(opt.timeout);
			run_master(engine, &opt)
		},
		"slave" => {
			let mut engine = Modbus::slave(link, clock, opt.slave_id)?;
			engine.set_timeout(opt.timeout);
			run_slave(engine)
		},
		&_ => panic!("Invalid mode. Use values: master and slave.")
	}
}

/// Send one read query per second and print what comes back.
fn run_master(
	mut engine: Modbus<SerialLink, WallClock>,
	opt: &Opt,
) -> Result<(), Box<dyn std::error::Error>> {
	let mut values = [0u16; 16];
	loop {
		let telegram = Telegram {
			id: opt.target,
			function: MbFunc::ReadHoldingRegisters,
			address: opt.address,
			quantity: opt.quantity,
			values: &[],
		};
		engine.query(&telegram)?;

		loop {
			match engine.poll(&mut values) {
				Ok(Poll::Waiting) => thread::sleep(Duration::from_millis(1)),
				Ok(Poll::Idle)    => break,
				Ok(Poll::Complete(_)) => {
					let n = (opt.quantity as usize).min(values.len());
					println!("regs {}..{} of node {}: {:04X?}",
						opt.address, opt.address + n as u16, opt.target, &values[..n]);
					break;
				},
				Err(e) => {
					log::warn!("exchange failed: {} (errors: {})", e, engine.err_count());
					break;
				},
			}
		}
		thread::sleep(Duration::from_millis(1000));
	}
}

/// Serve requests until interrupted.
fn run_slave(
	mut engine: Modbus<SerialLink, WallClock>,
) -> Result<(), Box<dyn std::error::Error>> {
	// recognizable demo pattern in the read-only spaces
	for i in 0..16u16 {
		engine.store_mut().set_register(RegisterSpace::Input, i, 0x0100 + i)?;
	}
	engine.store_mut().set_bit(BitSpace::Discrete, 3, true)?;

	let mut bus_quiet = false;
	loop {
		match engine.poll_slave() {
			Ok(Poll::Complete(n)) => {
				bus_quiet = false;
				log::info!("served a {} byte reply (in {} out {} err {})",
					n, engine.in_count(), engine.out_count(), engine.err_count());
			},
			Ok(_)  => {},
			Err(e) => log::warn!("request failed: {}", e),
		}
		if engine.watchdog_expired() && !bus_quiet {
			bus_quiet = true;
			log::info!("bus silent for more than {} ms", engine.timeout());
		}
		thread::sleep(Duration::from_millis(1));
	}
}

/// Serial port behind the engine's transport capability. Underlying I/O
/// faults are logged and absorbed here; the protocol engine sees a quiet
/// line and recovers through its own timeouts.
struct SerialLink {
	port: Box<dyn SerialPort>,
}

impl Transport for SerialLink {
	fn available(&mut self) -> usize {
		self.port.bytes_to_read().unwrap_or(0) as usize
	}

	fn read_byte(&mut self) -> Option<u8> {
		let mut byte = [0u8; 1];
		match self.port.read(&mut byte) {
			Ok(1) => Some(byte[0]),
			_     => None,
		}
	}

	fn write_bytes(&mut self, bytes: &[u8]) {
		if let Err(e) = self.port.write_all(bytes) {
			log::warn!("serial write failed: {}", e);
		}
	}

	fn flush(&mut self) {
		// completes once the bytes have left the device, which is what the
		// engine's RS-485 turnaround ordering relies on
		if let Err(e) = self.port.flush() {
			log::warn!("serial flush failed: {}", e);
		}
	}
}

/// Millisecond clock for the engine, counted from process start.
/// Wraps after ~49 days; the engine's deadline math tolerates the wrap.
struct WallClock {
	origin: Instant,
}

impl Clock for WallClock {
	fn now_millis(&self) -> u32 {
		self.origin.elapsed().as_millis() as u32
	}
}

fn display_port_settings(port: &Box<dyn SerialPort>) {
	println!("================[ Serial port ]==================");
	println!("name:         {:?}", port.name().unwrap_or_default());
	println!("baud rate:    {:?}", port.baud_rate().unwrap());
	println!("data bits:    {:?}", port.data_bits().unwrap());
	println!("parity:       {:?}", port.parity().unwrap());
	println!("stop bits:    {:?}", port.stop_bits().unwrap());
	println!("flow control: {:?}", port.flow_control().unwrap());
	println!("timeout:      {:?} ms", port.timeout().as_millis());
	println!("=================================================");
}
