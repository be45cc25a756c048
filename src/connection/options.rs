//! Types defining the different options when opening a connection.

use super::{Serial, Socket};
use crate::error::Error;
use serialport as sp;
use std::{
	io,
	net::{TcpStream, ToSocketAddrs},
	time::Duration,
};

/// The shortest idle timeout a connection will accept.
///
/// A zero timeout means "block forever" to the OS, which would break draining.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Options for configuring and opening a serial connection.
///
/// ## Example
///
/// ```rust
/// # use xtralien::connection::OpenSerialOptions;
/// # use std::time::Duration;
/// # fn wrapper() -> Result<(), Box<dyn std::error::Error>> {
/// let serial = OpenSerialOptions::new()
///     .timeout(Duration::from_millis(50))
///     .open("/dev/ttyUSB0")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct OpenSerialOptions {
	/// The custom baud rate
	baud_rate: u32,
	/// How long the line must be idle before a reply is considered complete.
	timeout: Duration,
	/// Whether writes block until the outbound buffer drains.
	drain_writes: bool,
}

impl OpenSerialOptions {
	/// The default baud rate: 9,600.
	///
	/// Instruments enumerate as USB CDC devices, which ignore the baud rate,
	/// but the OS still requires one.
	pub const DEFAULT_BAUD_RATE: u32 = 9_600;

	/// Create a blank set of options ready for configuration.
	///
	/// The default baud rate and idle timeout are 9,600 and 100 milliseconds,
	/// respectively. Writes do not wait for the outbound buffer to drain.
	///
	/// Equivalent to [`default`](OpenSerialOptions::default).
	pub fn new() -> Self {
		OpenSerialOptions {
			baud_rate: OpenSerialOptions::DEFAULT_BAUD_RATE,
			timeout: Duration::from_millis(100),
			drain_writes: false,
		}
	}

	/// Set a custom baud rate.
	pub fn baud_rate(&mut self, baud_rate: u32) -> &mut Self {
		self.baud_rate = baud_rate;
		self
	}

	/// Set a custom idle timeout.
	///
	/// A reply is considered complete once no data has arrived for this long.
	pub fn timeout(&mut self, duration: Duration) -> &mut Self {
		self.timeout = duration.max(MIN_TIMEOUT);
		self
	}

	/// Set whether each write should block until the OS has transmitted it.
	pub fn drain_writes(&mut self, drain: bool) -> &mut Self {
		self.drain_writes = drain;
		self
	}

	/// Open the serial port at the specified path with the custom options.
	pub fn open(&self, path: &str) -> Result<Serial, Error> {
		// Due to https://gitlab.com/susurrus/serialport-rs/-/issues/102, the
		// baud rate passed to new is ignored. It must be defined using the
		// baud_rate method below.
		let port = sp::new(path, OpenSerialOptions::DEFAULT_BAUD_RATE)
			.data_bits(sp::DataBits::Eight)
			.parity(sp::Parity::None)
			.flow_control(sp::FlowControl::None)
			.stop_bits(sp::StopBits::One)
			.timeout(self.timeout)
			.baud_rate(self.baud_rate)
			.open_native()?;
		log::debug!("opened serial port {path}");
		Ok(Serial::from_port(path, port, self.drain_writes))
	}
}

impl Default for OpenSerialOptions {
	fn default() -> Self {
		OpenSerialOptions::new()
	}
}

/// Options for configuring and opening a TCP connection.
///
/// ## Example
///
/// ```rust
/// # use xtralien::connection::OpenTcpOptions;
/// # use std::time::Duration;
/// # fn wrapper() -> Result<(), Box<dyn std::error::Error>> {
/// let socket = OpenTcpOptions::new()
///     .timeout(Duration::from_millis(50))
///     .open("192.168.0.1", 8888)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct OpenTcpOptions {
	/// How long the socket must be idle before a reply is considered complete.
	timeout: Duration,
	/// How long to wait for the connection to be established.
	connect_timeout: Option<Duration>,
}

impl OpenTcpOptions {
	/// Create a blank set of options ready for configuration.
	///
	/// The default idle timeout is 70 milliseconds and connecting waits as long
	/// as the OS does.
	///
	/// Equivalent to [`default`](OpenTcpOptions::default).
	pub fn new() -> Self {
		OpenTcpOptions {
			timeout: Duration::from_millis(70),
			connect_timeout: None,
		}
	}

	/// Set a custom idle timeout.
	///
	/// A reply is considered complete once no data has arrived for this long.
	pub fn timeout(&mut self, duration: Duration) -> &mut Self {
		self.timeout = duration.max(MIN_TIMEOUT);
		self
	}

	/// Set how long to wait for the connection to be established.
	///
	/// If duration is `None`, the OS default is used.
	pub fn connect_timeout(&mut self, duration: Option<Duration>) -> &mut Self {
		self.connect_timeout = duration.map(|d| d.max(MIN_TIMEOUT));
		self
	}

	/// Open a [`TcpStream`] to `host:port`.
	fn open_tcp_stream(&self, host: &str, port: u16) -> io::Result<TcpStream> {
		let stream = match self.connect_timeout {
			None => TcpStream::connect((host, port))?,
			Some(timeout) => {
				let mut last_error = None;
				let mut connected = None;
				for address in (host, port).to_socket_addrs()? {
					match TcpStream::connect_timeout(&address, timeout) {
						Ok(stream) => {
							connected = Some(stream);
							break;
						}
						Err(e) => last_error = Some(e),
					}
				}
				match (connected, last_error) {
					(Some(stream), _) => stream,
					(None, Some(e)) => return Err(e),
					(None, None) => {
						return Err(io::Error::new(
							io::ErrorKind::InvalidInput,
							format!("{host} did not resolve to any address"),
						))
					}
				}
			}
		};
		stream.set_read_timeout(Some(self.timeout))?;
		Ok(stream)
	}

	/// Open a connection to `host:port` with the custom options.
	pub fn open(&self, host: &str, port: u16) -> io::Result<Socket> {
		let stream = self.open_tcp_stream(host, port)?;
		log::debug!("connected to {host}:{port}");
		Ok(Socket::from_stream(host, port, stream))
	}
}

impl Default for OpenTcpOptions {
	fn default() -> Self {
		OpenTcpOptions::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::connection::Connection as _;
	use std::net::TcpListener;

	#[test]
	fn timeouts_are_never_zero() {
		let mut options = OpenTcpOptions::new();
		options
			.timeout(Duration::ZERO)
			.connect_timeout(Some(Duration::ZERO));
		assert_eq!(options.timeout, MIN_TIMEOUT);
		assert_eq!(options.connect_timeout, Some(MIN_TIMEOUT));

		let mut options = OpenSerialOptions::new();
		options.timeout(Duration::ZERO);
		assert_eq!(options.timeout, MIN_TIMEOUT);
	}

	#[test]
	fn tcp_open_applies_idle_timeout() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let port = listener.local_addr().unwrap().port();
		let socket = OpenTcpOptions::new()
			.timeout(Duration::from_millis(25))
			.connect_timeout(Some(Duration::from_secs(1)))
			.open("127.0.0.1", port)
			.unwrap();
		assert_eq!(socket.host(), "127.0.0.1");
		assert_eq!(socket.name(), Some(format!("127.0.0.1:{port}")));
		// The OS rounds the timeout up to its clock tick.
		let timeout = socket.stream.as_ref().unwrap().read_timeout().unwrap().unwrap();
		assert!(timeout >= Duration::from_millis(25), "{timeout:?}");
		assert!(timeout < Duration::from_millis(45), "{timeout:?}");
	}

	#[test]
	fn serial_open_reports_missing_port() {
		let err = OpenSerialOptions::new()
			.open("/dev/this-port-does-not-exist")
			.unwrap_err();
		assert!(
			matches!(err, Error::Io(_) | Error::SerialDeviceInUseOrDisconnected(_)),
			"{err:?}"
		);
	}
}
