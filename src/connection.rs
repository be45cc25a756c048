//! Transports that carry commands to an instrument and bring back its replies.
//!
//! The [`Connection`] trait represents all such types. The instrument protocol
//! has no message framing, so every implementation reads by "draining": it
//! keeps reading until the line has been idle for the connection's timeout.
//!
//! Two transports are provided, [`Serial`] for USB/serial links and [`Socket`]
//! for TCP. They are normally opened through [`OpenSerialOptions`] and
//! [`OpenTcpOptions`], or indirectly through the [`Device`](crate::Device)
//! constructors.

mod options;

pub use options::*;

use std::{
	fmt,
	io::{self, Read, Write},
	net::{Shutdown, TcpStream},
	thread,
	time::{Duration, Instant},
};

use serialport as sp;

#[cfg(windows)]
use sp::COMPort as ExternSerial;
use sp::SerialPort;
#[cfg(unix)]
use sp::TTYPort as ExternSerial;

/// The placeholder name for a connection that doesn't have a name.
pub(crate) const UNKNOWN_CONNECTION_NAME: &str = "<unknown connection>";

/// The number of bytes requested from a socket per `recv`.
const SOCKET_CHUNK: usize = 576;
/// The largest number of bytes requested from a serial port per `read`.
const SERIAL_CHUNK: usize = 436;
/// How often a serial port is polled for pending input.
pub(crate) const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Types that can exchange text with a connected instrument.
///
/// `read` follows a "drain" contract, because replies carry no terminator:
///
///  * With `wait == true` the call blocks until at least some data has
///    arrived and then keeps reading until no more arrives within the
///    connection's idle timeout. If the instrument never answers, the call
///    never returns.
///  * With `wait == false` the call returns an empty string straight away if
///    nothing is pending. Otherwise it drains as above.
///
/// `close` releases the underlying handle and must be safe to call more than
/// once. Reads and writes on a closed connection fail with
/// [`io::ErrorKind::NotConnected`].
pub trait Connection: Send + fmt::Debug {
	/// Write `data` to the instrument.
	fn write(&mut self, data: &[u8]) -> io::Result<()>;

	/// Drain the pending reply from the instrument.
	fn read(&mut self, wait: bool) -> io::Result<String>;

	/// Close the connection.
	fn close(&mut self);

	/// Whether the connection is still open.
	fn is_open(&self) -> bool;

	/// Get the "name" of the connection.
	///
	/// This can be in any format, but should uniquely identify the connection
	/// instance.
	fn name(&self) -> Option<String>;
}

impl<C: Connection + ?Sized> Connection for Box<C> {
	fn write(&mut self, data: &[u8]) -> io::Result<()> {
		(**self).write(data)
	}
	fn read(&mut self, wait: bool) -> io::Result<String> {
		(**self).read(wait)
	}
	fn close(&mut self) {
		(**self).close();
	}
	fn is_open(&self) -> bool {
		(**self).is_open()
	}
	fn name(&self) -> Option<String> {
		(**self).name()
	}
}

/// The error reported when using a connection that has been closed.
fn not_connected() -> io::Error {
	io::Error::new(io::ErrorKind::NotConnected, "the connection is closed")
}

/// Whether a read error only means that no data arrived in time.
fn is_idle(err: &io::Error) -> bool {
	matches!(
		err.kind(),
		io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
	)
}

/// A TCP connection to an instrument.
#[derive(Debug)]
pub struct Socket {
	/// The host the socket was opened to.
	host: String,
	/// The remote port.
	port: u16,
	/// The stream, or `None` once closed.
	stream: Option<TcpStream>,
}

impl Socket {
	/// Connect to `host:port` using the default [`OpenTcpOptions`].
	pub fn connect(host: &str, port: u16) -> io::Result<Socket> {
		OpenTcpOptions::new().open(host, port)
	}

	pub(crate) fn from_stream(host: &str, port: u16, stream: TcpStream) -> Socket {
		Socket {
			host: host.to_string(),
			port,
			stream: Some(stream),
		}
	}

	/// The host the socket was opened to.
	pub fn host(&self) -> &str {
		&self.host
	}

	/// The remote port.
	pub fn port(&self) -> u16 {
		self.port
	}

	fn stream(&mut self) -> io::Result<&mut TcpStream> {
		self.stream.as_mut().ok_or_else(not_connected)
	}

	/// Read whatever is immediately available without waiting.
	///
	/// Returns `Ok(0)` if nothing is pending.
	fn recv_now(stream: &mut TcpStream, chunk: &mut [u8]) -> io::Result<usize> {
		stream.set_nonblocking(true)?;
		let result = stream.read(chunk);
		stream.set_nonblocking(false)?;
		match result {
			Err(e) if is_idle(&e) => Ok(0),
			other => other,
		}
	}
}

impl Connection for Socket {
	fn write(&mut self, data: &[u8]) -> io::Result<()> {
		let stream = self.stream()?;
		stream.write_all(data)?;
		stream.flush()
	}

	fn read(&mut self, wait: bool) -> io::Result<String> {
		let stream = self.stream()?;
		let mut received = Vec::new();
		let mut chunk = [0u8; SOCKET_CHUNK];

		if wait {
			// Block, one idle timeout at a time, until something arrives.
			while received.is_empty() {
				match stream.read(&mut chunk) {
					Ok(0) => {
						return Err(io::Error::new(
							io::ErrorKind::UnexpectedEof,
							"the instrument closed the connection",
						))
					}
					Ok(n) => received.extend_from_slice(&chunk[..n]),
					Err(e) if is_idle(&e) || e.kind() == io::ErrorKind::Interrupted => {}
					Err(e) => return Err(e),
				}
			}
		} else {
			let n = Socket::recv_now(stream, &mut chunk)?;
			if n == 0 {
				return Ok(String::new());
			}
			received.extend_from_slice(&chunk[..n]);
		}

		loop {
			match stream.read(&mut chunk) {
				Ok(0) => break,
				Ok(n) => received.extend_from_slice(&chunk[..n]),
				Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
				Err(e) if is_idle(&e) => break,
				Err(e) => return Err(e),
			}
		}
		Ok(String::from_utf8_lossy(&received).into_owned())
	}

	fn close(&mut self) {
		if let Some(stream) = self.stream.take() {
			// The peer may already be gone, in which case there is nothing to shut down.
			let _ = stream.shutdown(Shutdown::Both);
		}
	}

	fn is_open(&self) -> bool {
		self.stream.is_some()
	}

	fn name(&self) -> Option<String> {
		Some(format!("{}:{}", self.host, self.port))
	}
}

impl fmt::Display for Socket {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Socket {}:{}", self.host, self.port)
	}
}

/// A platform agnostic USB/serial connection to an instrument.
//
// The `serialport` crate exposes two platform specific serial ports, `COMPort`
// and `TTYPort` for windows and unix, respectively. Wrapping whichever one the
// platform uses keeps the platform specific type out of every signature.
#[derive(Debug)]
pub struct Serial {
	/// The path the port was opened at.
	path: String,
	/// The port, or `None` once closed.
	port: Option<ExternSerial>,
	/// Whether each write blocks until the outbound buffer has drained.
	drain_writes: bool,
}

impl Serial {
	/// Open the serial port at `path` using the default [`OpenSerialOptions`].
	pub fn open(path: &str) -> Result<Serial, crate::error::Error> {
		OpenSerialOptions::new().open(path)
	}

	pub(crate) fn from_port(path: &str, port: ExternSerial, drain_writes: bool) -> Serial {
		Serial {
			path: path.to_string(),
			port: Some(port),
			drain_writes,
		}
	}

	/// The path the port was opened at.
	pub fn path(&self) -> &str {
		&self.path
	}

	fn port(&mut self) -> io::Result<&mut ExternSerial> {
		self.port.as_mut().ok_or_else(not_connected)
	}

	/// Wait up to `idle` for input to become pending.
	fn wait_for_input(port: &ExternSerial, idle: Duration) -> io::Result<bool> {
		let deadline = Instant::now() + idle;
		loop {
			if port.bytes_to_read()? > 0 {
				return Ok(true);
			}
			if Instant::now() >= deadline {
				return Ok(false);
			}
			thread::sleep(INPUT_POLL_INTERVAL);
		}
	}
}

impl Connection for Serial {
	fn write(&mut self, data: &[u8]) -> io::Result<()> {
		let drain = self.drain_writes;
		let port = self.port()?;
		port.write_all(data)?;
		if drain {
			// Blocks until the OS has transmitted everything.
			port.flush()?;
		}
		Ok(())
	}

	fn read(&mut self, wait: bool) -> io::Result<String> {
		let port = self.port()?;
		let idle = port.timeout();

		if wait {
			while port.bytes_to_read()? == 0 {
				thread::sleep(INPUT_POLL_INTERVAL);
			}
		} else if port.bytes_to_read()? == 0 {
			return Ok(String::new());
		}

		let mut received = Vec::new();
		let mut chunk = [0u8; SERIAL_CHUNK];
		loop {
			let pending = port.bytes_to_read()? as usize;
			if pending == 0 {
				if Serial::wait_for_input(port, idle)? {
					continue;
				}
				break;
			}
			let len = pending.min(SERIAL_CHUNK);
			match port.read(&mut chunk[..len]) {
				Ok(n) => received.extend_from_slice(&chunk[..n]),
				Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
				Err(e) if is_idle(&e) => break,
				Err(e) => return Err(e),
			}
		}
		Ok(String::from_utf8_lossy(&received).into_owned())
	}

	fn close(&mut self) {
		// Dropping the native port releases the handle.
		self.port = None;
	}

	fn is_open(&self) -> bool {
		self.port.is_some()
	}

	fn name(&self) -> Option<String> {
		Some(self.path.clone())
	}
}

impl fmt::Display for Serial {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Serial/USB {}", self.path)
	}
}

#[cfg(any(test, feature = "mock"))]
pub use mock::{Exchange, Mock};

#[cfg(any(test, feature = "mock"))]
mod mock {
	use super::{not_connected, Connection};
	use std::{
		fmt, io,
		sync::{Arc, Mutex, MutexGuard, PoisonError},
	};

	/// A function producing the instrument's reply to a command, if it replies.
	type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

	/// One entry in a [`Mock`]'s transcript.
	#[derive(Debug, Clone, PartialEq, Eq)]
	pub enum Exchange {
		/// Text written to the mock.
		Write(String),
		/// Text read back from the mock.
		Read(String),
	}

	#[derive(Default)]
	struct State {
		/// The data that reads return.
		buffer: Vec<u8>,
		/// Produces replies for written commands.
		responder: Option<Responder>,
		/// Everything written and read so far, in order.
		transcript: Vec<Exchange>,
		/// The error to surface on the next read, if any. It is only surfaced once.
		read_error: Option<io::Error>,
		/// The error to surface on the next write, if any. It is only surfaced once.
		write_error: Option<io::Error>,
		/// Whether `close` has been called.
		closed: bool,
	}

	/// A mock connection for use in testing.
	///
	/// It has the following features:
	///   * It records everything written to and read from it.
	///   * It can be filled with data for reading, or given a function that
	///     replies to each written command.
	///   * Specific errors can be inserted for calls to `read` and `write`.
	///
	/// Clones share the same state, so a test can keep one handle while a
	/// [`Device`](crate::Device) owns another.
	#[derive(Clone, Default)]
	pub struct Mock {
		state: Arc<Mutex<State>>,
	}

	impl Mock {
		/// Create a new Mock connection.
		pub fn new() -> Self {
			Mock::default()
		}

		fn state(&self) -> MutexGuard<'_, State> {
			self.state.lock().unwrap_or_else(PoisonError::into_inner)
		}

		/// Append data to the read buffer.
		pub fn append_data<T: AsRef<[u8]>>(&self, bytes: T) {
			self.state().buffer.extend_from_slice(bytes.as_ref());
		}

		/// Clear the read buffer.
		pub fn clear_buffer(&self) {
			self.state().buffer.clear();
		}

		/// Reply to every written command with the output of `responder`.
		pub fn respond_with<F>(&self, responder: F)
		where
			F: FnMut(&str) -> Option<String> + Send + 'static,
		{
			self.state().responder = Some(Box::new(responder));
		}

		/// Set the error for the next `read`, if any.
		pub fn read_error(&self, err: Option<io::Error>) {
			self.state().read_error = err;
		}

		/// Set the error for the next `write`, if any.
		pub fn write_error(&self, err: Option<io::Error>) {
			self.state().write_error = err;
		}

		/// Every command written so far.
		pub fn written(&self) -> Vec<String> {
			self.state()
				.transcript
				.iter()
				.filter_map(|exchange| match exchange {
					Exchange::Write(text) => Some(text.clone()),
					Exchange::Read(_) => None,
				})
				.collect()
		}

		/// Everything written and read so far, in order.
		pub fn transcript(&self) -> Vec<Exchange> {
			self.state().transcript.clone()
		}

		/// Whether the connection has been closed.
		pub fn is_closed(&self) -> bool {
			self.state().closed
		}
	}

	impl fmt::Debug for Mock {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.debug_struct("Mock")
				.field("name", &self.name())
				.finish_non_exhaustive()
		}
	}

	impl Connection for Mock {
		fn write(&mut self, data: &[u8]) -> io::Result<()> {
			let mut state = self.state();
			if state.closed {
				return Err(not_connected());
			}
			if let Some(err) = state.write_error.take() {
				return Err(err);
			}
			let text = String::from_utf8_lossy(data).into_owned();
			let reply = state.responder.as_mut().and_then(|respond| respond(&text));
			state.transcript.push(Exchange::Write(text));
			if let Some(reply) = reply {
				state.buffer.extend_from_slice(reply.as_bytes());
			}
			Ok(())
		}

		fn read(&mut self, wait: bool) -> io::Result<String> {
			let mut state = self.state();
			if state.closed {
				return Err(not_connected());
			}
			if let Some(err) = state.read_error.take() {
				return Err(err);
			}
			if state.buffer.is_empty() {
				if wait {
					// A real instrument would keep the caller waiting forever.
					// Our data is in memory, so report a timeout instead.
					return Err(io::Error::new(
						io::ErrorKind::TimedOut,
						"Simulated timeout error",
					));
				}
				return Ok(String::new());
			}
			let bytes = std::mem::take(&mut state.buffer);
			let text = String::from_utf8_lossy(&bytes).into_owned();
			state.transcript.push(Exchange::Read(text.clone()));
			Ok(text)
		}

		fn close(&mut self) {
			self.state().closed = true;
		}

		fn is_open(&self) -> bool {
			!self.state().closed
		}

		fn name(&self) -> Option<String> {
			Some(format!("<mock 0x{:x}>", Arc::as_ptr(&self.state) as usize))
		}
	}
}
