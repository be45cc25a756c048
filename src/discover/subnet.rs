//! Sweeping an IPv4 subnet for instruments, one address at a time.
//!
//! Broadcast [discovery](super::broadcast) is much faster, but it relies on
//! datagrams reaching the instruments. A sweep only needs TCP: each host
//! address is connected to on the command port and the ones that answer the
//! probe are kept.
//!
//! Networks are given as an address and netmask. To cover every local
//! interface, sweep each interface's network in turn.
//!
//! ```rust,no_run
//! # use xtralien::discover::subnet::{self, SweepOptions};
//! # use std::net::Ipv4Addr;
//! let devices = subnet::sweep(
//!     Ipv4Addr::new(192, 168, 1, 20),
//!     Ipv4Addr::new(255, 255, 255, 0),
//!     &SweepOptions::new(),
//! );
//! ```

use super::{confirm, ProbeOptions};
use crate::{connection::OpenTcpOptions, device::Device};
use std::{net::Ipv4Addr, ops::RangeInclusive, time::Duration};

/// Convert an address to its big-endian integer form.
pub fn ip_to_int(address: Ipv4Addr) -> u32 {
	u32::from(address)
}

/// Convert a big-endian integer to an address.
pub fn int_to_ip(value: u32) -> Ipv4Addr {
	Ipv4Addr::from(value)
}

/// The integer range of usable host addresses on the network of `address`.
fn host_range(address: Ipv4Addr, netmask: Ipv4Addr) -> RangeInclusive<u32> {
	let mask = ip_to_int(netmask);
	let network = ip_to_int(address) & mask;
	let broadcast = network | !mask;
	if broadcast - network < 2 {
		// Point-to-point (/31) and single host (/32) networks have no
		// network or broadcast address to skip.
		network..=broadcast
	} else {
		network + 1..=broadcast - 1
	}
}

/// Every host address on the network of `address`, excluding the network and
/// broadcast addresses.
///
/// ## Example
///
/// ```rust
/// # use xtralien::discover::subnet::hosts;
/// # use std::net::Ipv4Addr;
/// let hosts: Vec<_> = hosts(Ipv4Addr::new(10, 0, 0, 7), Ipv4Addr::new(255, 255, 255, 252)).collect();
/// assert_eq!(hosts, [Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 6)]);
/// ```
pub fn hosts(address: Ipv4Addr, netmask: Ipv4Addr) -> impl Iterator<Item = Ipv4Addr> {
	host_range(address, netmask).map(int_to_ip)
}

/// Options for a [`sweep`].
#[derive(Debug, Clone)]
pub struct SweepOptions {
	probe: ProbeOptions,
	tcp: OpenTcpOptions,
	command_port: u16,
}

impl SweepOptions {
	/// How long each host is given to accept a connection by default.
	pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(30);

	/// Create a blank set of options ready for configuration.
	///
	/// By default hosts are connected to on [`Device::COMMAND_PORT`], each
	/// given 30 milliseconds to accept, and checked with the default
	/// [`ProbeOptions`].
	///
	/// Equivalent to [`default`](SweepOptions::default).
	pub fn new() -> Self {
		let mut tcp = OpenTcpOptions::new();
		tcp.connect_timeout(Some(SweepOptions::DEFAULT_CONNECT_TIMEOUT));
		SweepOptions {
			probe: ProbeOptions::new(),
			tcp,
			command_port: Device::COMMAND_PORT,
		}
	}

	/// Set the probe handshake.
	pub fn probe(&mut self, probe: ProbeOptions) -> &mut Self {
		self.probe = probe;
		self
	}

	/// Set how each host is connected to.
	///
	/// Without a connect timeout a sweep waits on every absent host for as
	/// long as the OS does.
	pub fn tcp(&mut self, options: OpenTcpOptions) -> &mut Self {
		self.tcp = options;
		self
	}

	/// Set the port to connect to.
	pub fn command_port(&mut self, port: u16) -> &mut Self {
		self.command_port = port;
		self
	}

	/// Connect to and probe a single host.
	fn try_host(&self, host: Ipv4Addr) -> Option<Device> {
		let host = host.to_string();
		match self.tcp.open(&host, self.command_port) {
			Ok(socket) => confirm(socket, &self.probe),
			Err(e) => {
				log::trace!("{host}:{}: {e}", self.command_port);
				None
			}
		}
	}
}

impl Default for SweepOptions {
	fn default() -> Self {
		SweepOptions::new()
	}
}

/// Every host on the network of `address` that answers the probe.
pub fn sweep(address: Ipv4Addr, netmask: Ipv4Addr, options: &SweepOptions) -> Vec<Device> {
	log::debug!("sweeping the network of {address}/{netmask}");
	hosts(address, netmask)
		.filter_map(|host| options.try_host(host))
		.collect()
}

#[cfg(test)]
mod test {
	use super::*;
	use std::{
		io::{Read, Write},
		net::TcpListener,
		thread,
	};

	#[test]
	fn integer_conversions() {
		assert_eq!(ip_to_int(Ipv4Addr::new(192, 168, 1, 2)), 0xC0A8_0102);
		assert_eq!(int_to_ip(0x0A00_00FF), Ipv4Addr::new(10, 0, 0, 255));
	}

	#[test]
	fn host_enumeration() {
		let all: Vec<_> = hosts(Ipv4Addr::new(192, 168, 1, 77), Ipv4Addr::new(255, 255, 255, 0)).collect();
		assert_eq!(all.len(), 254);
		assert_eq!(all.first(), Some(&Ipv4Addr::new(192, 168, 1, 1)));
		assert_eq!(all.last(), Some(&Ipv4Addr::new(192, 168, 1, 254)));

		let single: Vec<_> = hosts(Ipv4Addr::LOCALHOST, Ipv4Addr::BROADCAST).collect();
		assert_eq!(single, [Ipv4Addr::LOCALHOST]);

		let pair: Vec<_> = hosts(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(255, 255, 255, 254)).collect();
		assert_eq!(pair, [Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 0, 0, 1)]);
	}

	#[test]
	fn sweep_keeps_hosts_that_answer() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let port = listener.local_addr().unwrap().port();
		let server = thread::spawn(move || {
			let (mut stream, _) = listener.accept().unwrap();
			let mut buffer = [0u8; 11];
			stream.read_exact(&mut buffer).unwrap();
			assert_eq!(&buffer, b"cloi hello\n");
			stream.write_all(b"Hello World\n").unwrap();
			stream
		});

		let mut options = SweepOptions::new();
		options.command_port(port);
		let devices = sweep(Ipv4Addr::LOCALHOST, Ipv4Addr::BROADCAST, &options);
		let _stream = server.join().unwrap();
		assert_eq!(devices.len(), 1);
	}
}
