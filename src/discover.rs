//! Finding instruments on serial ports and on the local network.
//!
//! Every candidate is confirmed with a probe handshake before it is handed
//! back as a [`Device`]: a fixed greeting command is sent and the reply must
//! match the expected greeting. Discovery never fails as a whole; candidates
//! that cannot be opened or do not answer are logged and left out.
//!
//! ```rust,no_run
//! # use xtralien::{discover::{DiscoverOptions, ScanOptions}, Device};
//! # use std::time::Duration;
//! // Instruments on the local network that answer within two seconds.
//! let devices = Device::discover(DiscoverOptions::new().window(Duration::from_secs(2)));
//!
//! // The first instrument plugged in over USB.
//! let device = Device::first_usb(&ScanOptions::new());
//! ```

pub mod subnet;

use crate::{
	connection::{Connection, OpenSerialOptions, OpenTcpOptions, INPUT_POLL_INTERVAL},
	device::Device,
};
use std::{
	collections::BTreeSet,
	io,
	net::{IpAddr, Ipv4Addr, UdpSocket},
	thread,
	time::{Duration, Instant},
};

/// The probe handshake used to confirm a candidate is an instrument.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
	/// The greeting command.
	command: String,
	/// The expected reply, compared case-insensitively after trimming.
	expected: String,
	/// How long to wait for the reply to start arriving.
	timeout: Duration,
}

impl ProbeOptions {
	/// The default probe: send `cloi hello` and expect `hello world` within
	/// 100 milliseconds.
	///
	/// Equivalent to [`default`](ProbeOptions::default).
	pub fn new() -> Self {
		ProbeOptions {
			command: "cloi hello\n".to_string(),
			expected: "hello world".to_string(),
			timeout: Duration::from_millis(100),
		}
	}

	/// Set the greeting command, including any terminator.
	pub fn command(&mut self, command: &str) -> &mut Self {
		self.command = command.to_string();
		self
	}

	/// Set the expected reply.
	pub fn expected(&mut self, expected: &str) -> &mut Self {
		self.expected = expected.trim().to_lowercase();
		self
	}

	/// Set how long to wait for the reply to start arriving.
	pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
		self.timeout = timeout;
		self
	}

	/// Whether `reply` is the expected greeting.
	fn matches(&self, reply: &str) -> bool {
		reply.trim().to_lowercase() == self.expected
	}
}

impl Default for ProbeOptions {
	fn default() -> Self {
		ProbeOptions::new()
	}
}

/// Options for [network broadcast discovery](broadcast).
#[derive(Debug, Clone)]
pub struct DiscoverOptions {
	/// How long to listen for replies.
	window: Duration,
	/// Where the discovery datagram is sent.
	broadcast_address: Ipv4Addr,
	/// The port instruments listen for discovery datagrams on.
	discovery_port: u16,
	/// The port the resulting devices connect to.
	command_port: u16,
	/// The discovery datagram.
	payload: Vec<u8>,
	/// How the resulting devices' sockets are opened.
	tcp: OpenTcpOptions,
}

impl DiscoverOptions {
	/// The port instruments listen for discovery datagrams on.
	pub const DISCOVERY_PORT: u16 = 8889;

	/// Create a blank set of options ready for configuration.
	///
	/// By default `xtra` is broadcast to `255.255.255.255:8889`, replies are
	/// collected for one second, and devices connect on
	/// [`Device::COMMAND_PORT`] with the default [`OpenTcpOptions`].
	///
	/// Equivalent to [`default`](DiscoverOptions::default).
	pub fn new() -> Self {
		DiscoverOptions {
			window: Duration::from_secs(1),
			broadcast_address: Ipv4Addr::BROADCAST,
			discovery_port: DiscoverOptions::DISCOVERY_PORT,
			command_port: Device::COMMAND_PORT,
			payload: b"xtra".to_vec(),
			tcp: OpenTcpOptions::new(),
		}
	}

	/// Set how long to listen for replies.
	pub fn window(&mut self, window: Duration) -> &mut Self {
		self.window = window;
		self
	}

	/// Set where the discovery datagram is sent, e.g. a subnet's broadcast
	/// address.
	pub fn broadcast_address(&mut self, address: Ipv4Addr) -> &mut Self {
		self.broadcast_address = address;
		self
	}

	/// Set the port the discovery datagram is sent to.
	pub fn discovery_port(&mut self, port: u16) -> &mut Self {
		self.discovery_port = port;
		self
	}

	/// Set the port the resulting devices connect to.
	pub fn command_port(&mut self, port: u16) -> &mut Self {
		self.command_port = port;
		self
	}

	/// Set the discovery datagram.
	pub fn payload<T: AsRef<[u8]>>(&mut self, payload: T) -> &mut Self {
		self.payload = payload.as_ref().to_vec();
		self
	}

	/// Set how the resulting devices' sockets are opened.
	pub fn tcp(&mut self, options: OpenTcpOptions) -> &mut Self {
		self.tcp = options;
		self
	}
}

impl Default for DiscoverOptions {
	fn default() -> Self {
		DiscoverOptions::new()
	}
}

/// Options for [scanning serial ports](scan_serial).
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
	probe: ProbeOptions,
	serial: OpenSerialOptions,
	/// Explicit ports to try instead of every port the OS reports.
	candidates: Option<Vec<String>>,
}

impl ScanOptions {
	/// Probe every serial port the OS reports with the default options.
	///
	/// Equivalent to [`default`](ScanOptions::default).
	pub fn new() -> Self {
		ScanOptions::default()
	}

	/// Set the probe handshake.
	pub fn probe(&mut self, probe: ProbeOptions) -> &mut Self {
		self.probe = probe;
		self
	}

	/// Set how candidate ports are opened.
	pub fn serial(&mut self, options: OpenSerialOptions) -> &mut Self {
		self.serial = options;
		self
	}

	/// Only try these ports.
	pub fn candidates<I, S>(&mut self, paths: I) -> &mut Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.candidates = Some(paths.into_iter().map(Into::into).collect());
		self
	}

	fn paths(&self) -> Vec<String> {
		match &self.candidates {
			Some(paths) => paths.clone(),
			None => available_ports(),
		}
	}
}

/// Send the probe command over `connection` and check the reply.
///
/// The reply must start arriving within the probe's timeout; it is then
/// drained as usual.
pub(crate) fn probe(connection: &mut dyn Connection, options: &ProbeOptions) -> io::Result<bool> {
	connection.write(options.command.as_bytes())?;
	let deadline = Instant::now() + options.timeout;
	loop {
		let reply = connection.read(false)?;
		if !reply.is_empty() {
			return Ok(options.matches(&reply));
		}
		if Instant::now() >= deadline {
			return Ok(false);
		}
		thread::sleep(INPUT_POLL_INTERVAL);
	}
}

/// Wrap `connection` in a [`Device`] if it answers the probe, closing it
/// otherwise.
pub(crate) fn confirm<C>(mut connection: C, options: &ProbeOptions) -> Option<Device>
where
	C: Connection + 'static,
{
	let name = connection.name().unwrap_or_default();
	match probe(&mut connection, options) {
		Ok(true) => {
			log::info!("found instrument on {name}");
			Some(Device::from_connection(connection))
		}
		Ok(false) => {
			log::debug!("{name} did not answer the probe");
			connection.close();
			None
		}
		Err(e) => {
			log::debug!("{name}: probe failed: {e}");
			connection.close();
			None
		}
	}
}

/// The names of every serial port the OS reports.
fn available_ports() -> Vec<String> {
	match serialport::available_ports() {
		Ok(ports) => ports.into_iter().map(|info| info.port_name).collect(),
		Err(e) => {
			log::warn!("could not list serial ports: {e}");
			Vec::new()
		}
	}
}

/// The serial ports that can currently be opened.
pub fn serial_ports() -> Vec<String> {
	let options = OpenSerialOptions::new();
	available_ports()
		.into_iter()
		.filter(|path| match options.open(path) {
			Ok(mut serial) => {
				serial.close();
				true
			}
			Err(e) => {
				log::warn!("could not open {path}: {e}");
				false
			}
		})
		.collect()
}

/// Open and probe the serial port at `path`.
fn try_serial(path: &str, options: &ScanOptions) -> Option<Device> {
	match options.serial.open(path) {
		Ok(serial) => confirm(serial, &options.probe),
		Err(e) => {
			log::warn!("could not open {path}: {e}");
			None
		}
	}
}

/// Every serial port that answers the probe.
pub fn scan_serial(options: &ScanOptions) -> Vec<Device> {
	options
		.paths()
		.iter()
		.filter_map(|path| try_serial(path, options))
		.collect()
}

/// The first serial port that answers the probe, if any does.
///
/// Ports after the first match are left untouched.
pub fn scan_serial_first(options: &ScanOptions) -> Option<Device> {
	options
		.paths()
		.iter()
		.find_map(|path| try_serial(path, options))
}

/// Broadcast a discovery datagram and connect to every instrument that
/// replies within the listening window.
///
/// Replies are only used to learn the instruments' addresses; their contents
/// are ignored. Each address yields at most one device.
pub fn broadcast(options: &DiscoverOptions) -> Vec<Device> {
	let addresses = match collect_replies(options) {
		Ok(addresses) => addresses,
		Err(e) => {
			log::warn!("network discovery failed: {e}");
			return Vec::new();
		}
	};
	addresses
		.into_iter()
		.filter_map(|address| {
			let host = address.to_string();
			match options.tcp.open(&host, options.command_port) {
				Ok(socket) => {
					log::info!("found instrument at {host}");
					Some(Device::from_connection(socket))
				}
				Err(e) => {
					log::warn!("{host} replied to discovery but refused a connection: {e}");
					None
				}
			}
		})
		.collect()
}

/// Send the discovery datagram and gather the distinct addresses that reply.
fn collect_replies(options: &DiscoverOptions) -> io::Result<BTreeSet<IpAddr>> {
	let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
	socket.set_broadcast(true)?;
	let target = (options.broadcast_address, options.discovery_port);
	socket.send_to(&options.payload, target)?;
	log::debug!(
		"sent discovery datagram to {}:{}",
		options.broadcast_address,
		options.discovery_port
	);

	let deadline = Instant::now() + options.window;
	let mut addresses = BTreeSet::new();
	let mut buffer = [0u8; 64];
	loop {
		let remaining = deadline.saturating_duration_since(Instant::now());
		if remaining.is_zero() {
			break;
		}
		socket.set_read_timeout(Some(remaining))?;
		match socket.recv_from(&mut buffer) {
			Ok((_, from)) => {
				if addresses.insert(from.ip()) {
					log::debug!("discovery reply from {from}");
				}
			}
			Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {}
			Err(e) => {
				// Some platforms report ICMP errors from earlier datagrams here.
				log::debug!("ignoring discovery error: {e}");
				thread::sleep(INPUT_POLL_INTERVAL);
			}
		}
	}
	Ok(addresses)
}
