//! Devices: sessions with an instrument that commands are composed on.
//!
//! A [`Device`] owns one or more [`Connection`]s and a list of pending command
//! tokens. Tokens are appended with the [`CommandBuilder`] methods and the
//! command is dispatched over the first connection that works.
//!
//! ```rust
//! # use xtralien::{CommandBuilder as _, Device, Invocation};
//! # fn wrapper() -> Result<(), Box<dyn std::error::Error>> {
//! let mut device = Device::usb("/dev/ttyUSB0")?;
//!
//! // `smu1 set voltage 1`, without waiting for a reply.
//! device.select("smu1").select("set").select("voltage").invoke(Invocation::new().arg(1));
//!
//! // `smu1 measure`, decoding the reply as a vector.
//! let reading = device.select("smu1").select("measure").query("array");
//!
//! // Bookmark a subsystem and reuse it.
//! let mut smu2 = device.select("smu2").dup();
//! smu2.select("set").select("enabled").invoke(Invocation::new().arg(1));
//! let reading = smu2.select("measure").query("auto");
//! # Ok(())
//! # }
//! ```
//!
//! At most one command is in flight per device at any time. Commands issued
//! from several threads, or with [`invoke_with`](CommandBuilder::invoke_with),
//! are dispatched one after another in the order they were issued.

mod builder;
#[cfg(test)]
mod test;

pub use builder::{CommandBuilder, Invocation};

use crate::{
	connection::{Connection, OpenSerialOptions, OpenTcpOptions, UNKNOWN_CONNECTION_NAME},
	discover::{self, DiscoverOptions, ProbeOptions, ScanOptions},
	error::{ConnectionsExhaustedError, Error, NoConnectionError},
	format::Value,
	turnstile::{Ticket, Turnstile},
};
use std::{
	fmt, io,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
	thread::{self, JoinHandle},
	time::Duration,
};

/// The mutable part of a session, guarded by its mutex.
struct State {
	/// The connections, in the order they are tried.
	///
	/// Empty while a command is using them, see [`Session::check_out`].
	connections: Vec<Box<dyn Connection>>,
	/// The names of the connections a command is using, if one is.
	checked_out: Vec<String>,
	/// How long to wait before each command.
	settle_delay: Duration,
	/// Appended to every command on the wire.
	terminator: String,
}

impl State {
	/// The names of every attached connection, including any in use.
	fn names(&self) -> Vec<String> {
		self.checked_out
			.iter()
			.cloned()
			.chain(self.connections.iter().map(|c| connection_name(&**c)))
			.collect()
	}
}

fn connection_name(connection: &dyn Connection) -> String {
	connection
		.name()
		.unwrap_or_else(|| UNKNOWN_CONNECTION_NAME.to_string())
}

/// Send `payload` over the first connection that works, reading the reply
/// if `returns` is set.
///
/// A connection that fails is closed and the next one is tried.
fn exchange(
	connections: &mut [Box<dyn Connection>],
	command: &str,
	payload: &str,
	returns: bool,
) -> Result<Option<String>, Error> {
	if connections.is_empty() {
		return Err(NoConnectionError::new(command).into());
	}
	let mut last_error = None;
	for connection in connections {
		if !connection.is_open() {
			continue;
		}
		let name = connection_name(&**connection);
		match exchange_on(&mut **connection, &name, payload, returns) {
			Ok(reply) => return Ok(reply),
			Err(e) => {
				log::warn!("{name}: {e}; closing the connection");
				connection.close();
				last_error = Some(e);
			}
		}
	}
	Err(ConnectionsExhaustedError::new(command, last_error).into())
}

/// Write `payload` to a single connection and drain the reply, if one is expected.
fn exchange_on(
	connection: &mut dyn Connection,
	name: &str,
	payload: &str,
	returns: bool,
) -> io::Result<Option<String>> {
	log::debug!("{name} TX:   {}", payload.trim_end());
	connection.write(payload.as_bytes())?;
	if !returns {
		return Ok(None);
	}
	let reply = connection.read(true)?;
	log::debug!("{name} RECV: {}", reply.trim_end());
	Ok(Some(reply))
}

/// The state shared by a device, its duplicates and its background commands.
pub(crate) struct Session {
	turnstile: Arc<Turnstile>,
	state: Mutex<State>,
}

impl Session {
	fn new(connections: Vec<Box<dyn Connection>>) -> Arc<Self> {
		Arc::new(Session {
			turnstile: Turnstile::new(),
			state: Mutex::new(State {
				connections,
				checked_out: Vec::new(),
				settle_delay: Device::DEFAULT_SETTLE_DELAY,
				terminator: String::new(),
			}),
		})
	}

	/// Lock the state.
	///
	/// Connections close themselves on failure, so the state is usable even if
	/// a thread panicked while holding the lock.
	fn state(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Take the connections out of the state so they can be used without
	/// holding the lock. They are put back when the returned guard is dropped.
	///
	/// Only call this during a [`Turn`](crate::turnstile::Turn), so that no
	/// one else has them checked out.
	fn check_out(&self) -> CheckedOut<'_> {
		let mut state = self.state();
		let connections = std::mem::take(&mut state.connections);
		state.checked_out = connections.iter().map(|c| connection_name(&**c)).collect();
		CheckedOut {
			session: self,
			connections,
		}
	}

	/// Wait for `ticket`'s turn, let the instrument settle, then exchange.
	fn dispatch(
		&self,
		ticket: Ticket,
		command: &str,
		returns: bool,
		settle: Option<Duration>,
	) -> Result<Option<String>, Error> {
		let _turn = ticket.wait();
		let (delay, payload) = {
			let state = self.state();
			let delay = settle.unwrap_or(state.settle_delay);
			(delay, format!("{command}{}", state.terminator))
		};
		if !delay.is_zero() {
			thread::sleep(delay);
		}
		let mut checked_out = self.check_out();
		exchange(&mut checked_out.connections, command, &payload, returns)
	}

	/// Dispatch `command` on the calling thread.
	fn invoke(&self, command: &str, invocation: &Invocation) -> Value {
		let format = invocation.formatter(false);
		let ticket = self.turnstile.ticket();
		match self.dispatch(ticket, command, invocation.expects_reply(), invocation.settle) {
			Ok(Some(reply)) => format.apply(&reply),
			Ok(None) => Value::None,
			Err(e) => {
				log::error!("{e}");
				Value::None
			}
		}
	}

	/// Dispatch `command` on a new thread, calling `callback` with the reply.
	///
	/// The ticket is drawn before the thread starts, so the command keeps its
	/// place relative to commands issued after it.
	fn spawn<F>(
		self: &Arc<Self>,
		command: String,
		invocation: Invocation,
		callback: F,
	) -> io::Result<JoinHandle<()>>
	where
		F: FnOnce(Value) + Send + 'static,
	{
		let format = invocation.formatter(true);
		let ticket = self.turnstile.ticket();
		let session = Arc::clone(self);
		thread::Builder::new()
			.name("xtralien-dispatch".to_string())
			.spawn(move || {
				let value = match session.dispatch(ticket, &command, true, invocation.settle) {
					Ok(reply) => format.apply(reply.as_deref().unwrap_or_default()),
					Err(e) => {
						log::error!("{e}");
						Value::None
					}
				};
				callback(value);
			})
	}

	fn first_connection_name(&self) -> Option<String> {
		self.state().names().into_iter().next()
	}
}

/// Connections taken out of a [`Session`] for the length of one command.
struct CheckedOut<'a> {
	session: &'a Session,
	connections: Vec<Box<dyn Connection>>,
}

impl Drop for CheckedOut<'_> {
	fn drop(&mut self) {
		let mut state = self.session.state();
		let mut connections = std::mem::take(&mut self.connections);
		// Connections attached in the meantime go after the existing ones.
		connections.append(&mut state.connections);
		state.connections = connections;
		state.checked_out.clear();
	}
}

impl fmt::Debug for Session {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Session")
			.field("connection", &self.first_connection_name())
			.finish_non_exhaustive()
	}
}

impl Drop for Session {
	fn drop(&mut self) {
		let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
		for connection in &mut state.connections {
			connection.close();
		}
	}
}

/// A session with an instrument.
///
/// See the [module level documentation](self) for details.
pub struct Device {
	session: Arc<Session>,
	pending: Vec<String>,
}

impl Device {
	/// The TCP port instruments accept commands on.
	pub const COMMAND_PORT: u16 = 8888;

	/// The default delay before each command: 50 milliseconds.
	pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(50);

	/// A device with no connections.
	///
	/// Commands fail (and are logged) until a connection is added with
	/// [`add_connection`](Device::add_connection).
	pub fn new() -> Self {
		Device::with_connections(Vec::new())
	}

	fn with_connections(connections: Vec<Box<dyn Connection>>) -> Self {
		Device {
			session: Session::new(connections),
			pending: Vec::new(),
		}
	}

	/// A device using an already opened connection.
	pub fn from_connection<C: Connection + 'static>(connection: C) -> Self {
		Device::with_connections(vec![Box::new(connection)])
	}

	/// Open the serial port at `path` with the default [`OpenSerialOptions`].
	///
	/// ## Example
	///
	/// ```rust
	/// # use xtralien::Device;
	/// # fn wrapper() -> Result<(), Box<dyn std::error::Error>> {
	/// let device = Device::usb("/dev/ttyUSB0")?;
	/// // OR, on Windows
	/// let device = Device::usb("COM3")?;
	/// # Ok(())
	/// # }
	/// ```
	pub fn usb(path: &str) -> Result<Self, Error> {
		Ok(Device::from_connection(OpenSerialOptions::new().open(path)?))
	}

	/// Connect to `host:port` with the default [`OpenTcpOptions`].
	pub fn tcp(host: &str, port: u16) -> Result<Self, Error> {
		Ok(Device::from_connection(OpenTcpOptions::new().open(host, port)?))
	}

	/// Connect to `host` on the standard [command port](Device::COMMAND_PORT).
	pub fn network(host: &str) -> Result<Self, Error> {
		Device::tcp(host, Device::COMMAND_PORT)
	}

	/// The first serial device that answers the probe, if any does.
	pub fn first_usb(options: &ScanOptions) -> Option<Self> {
		discover::scan_serial_first(options)
	}

	/// Every device that answers a network broadcast within the listening
	/// window.
	pub fn discover(options: &DiscoverOptions) -> Vec<Self> {
		discover::broadcast(options)
	}

	/// Attach another connection. It is tried after the existing ones.
	pub fn add_connection<C: Connection + 'static>(&self, connection: C) {
		self.session.state().connections.push(Box::new(connection));
	}

	/// The names of the attached connections, in the order they are tried.
	pub fn connection_names(&self) -> Vec<String> {
		self.session.state().names()
	}

	/// Close every connection, once any command in flight has finished.
	pub fn close(&self) {
		let _turn = self.session.turnstile.ticket().wait();
		for connection in &mut self.session.state().connections {
			connection.close();
		}
	}

	/// The delay before each command.
	pub fn settle_delay(&self) -> Duration {
		self.session.state().settle_delay
	}

	/// Set the delay before each command.
	///
	/// Individual commands can override it with [`Invocation::settle`].
	pub fn set_settle_delay(&self, delay: Duration) {
		self.session.state().settle_delay = delay;
	}

	/// Set the text appended to every command on the wire, e.g. `"\n"`.
	///
	/// Nothing is appended by default.
	pub fn set_terminator(&self, terminator: &str) {
		self.session.state().terminator = terminator.to_string();
	}

	/// Snapshot the pending tokens as the prefix of a [`DeviceDuplicate`] and
	/// clear them from this device.
	pub fn dup(&mut self) -> DeviceDuplicate {
		DeviceDuplicate {
			session: Arc::clone(&self.session),
			base: std::mem::take(&mut self.pending).into(),
			pending: Vec::new(),
		}
	}

	/// Send a complete command, reading the raw reply if `returns` is set.
	///
	/// Unlike the [`CommandBuilder`] methods, failures are returned rather
	/// than logged. The pending tokens are left untouched.
	pub fn command(&self, command: &str, returns: bool) -> Result<Option<String>, Error> {
		let ticket = self.session.turnstile.ticket();
		self.session.dispatch(ticket, command, returns, None)
	}

	/// The instrument's firmware version, from `cloi version`.
	pub fn version(&self) -> Option<String> {
		match self.command("cloi version", true) {
			Ok(reply) => reply.map(|v| v.trim().to_string()),
			Err(e) => {
				log::error!("{e}");
				None
			}
		}
	}

	/// Whether the first open connection answers the probe handshake.
	///
	/// Unlike a normal command, the reply is only awaited for the probe's
	/// timeout.
	pub fn is_responsive(&self, probe: &ProbeOptions) -> bool {
		let _turn = self.session.turnstile.ticket().wait();
		let mut checked_out = self.session.check_out();
		let Some(connection) = checked_out.connections.iter_mut().find(|c| c.is_open()) else {
			return false;
		};
		match discover::probe(&mut **connection, probe) {
			Ok(confirmed) => confirmed,
			Err(e) => {
				log::warn!("probe failed: {e}");
				false
			}
		}
	}
}

impl Default for Device {
	fn default() -> Self {
		Device::new()
	}
}

impl fmt::Debug for Device {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Device")
			.field("connection", &self.session.first_connection_name())
			.field("pending", &self.pending)
			.finish_non_exhaustive()
	}
}

impl fmt::Display for Device {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.session.first_connection_name() {
			Some(name) => write!(f, "<Device connection={name}/>"),
			None => write!(f, "<Device connection=None/>"),
		}
	}
}

impl CommandBuilder for Device {
	fn pending(&self) -> &[String] {
		&self.pending
	}

	fn pending_mut(&mut self) -> &mut Vec<String> {
		&mut self.pending
	}

	fn invoke(&mut self, invocation: Invocation) -> Value {
		let command = builder::finish(&[], &mut self.pending, &invocation.args);
		self.session.invoke(&command, &invocation)
	}

	fn invoke_with<F>(&mut self, invocation: Invocation, callback: F) -> io::Result<JoinHandle<()>>
	where
		F: FnOnce(Value) + Send + 'static,
	{
		let command = builder::finish(&[], &mut self.pending, &invocation.args);
		self.session.spawn(command, invocation, callback)
	}
}

/// A bookmarked command prefix that dispatches through the [`Device`] it was
/// taken from.
///
/// Created with [`Device::dup`]. Chaining on the duplicate never touches the
/// device's own pending tokens.
#[derive(Debug, Clone)]
pub struct DeviceDuplicate {
	session: Arc<Session>,
	base: Arc<[String]>,
	pending: Vec<String>,
}

impl DeviceDuplicate {
	/// The frozen prefix prepended to every command.
	pub fn base(&self) -> &[String] {
		&self.base
	}

	/// Snapshot this duplicate's prefix plus its pending tokens as a new
	/// duplicate, clearing the pending tokens.
	pub fn dup(&mut self) -> DeviceDuplicate {
		let base: Vec<String> = self
			.base
			.iter()
			.cloned()
			.chain(std::mem::take(&mut self.pending))
			.collect();
		DeviceDuplicate {
			session: Arc::clone(&self.session),
			base: base.into(),
			pending: Vec::new(),
		}
	}
}

impl CommandBuilder for DeviceDuplicate {
	fn pending(&self) -> &[String] {
		&self.pending
	}

	fn pending_mut(&mut self) -> &mut Vec<String> {
		&mut self.pending
	}

	fn invoke(&mut self, invocation: Invocation) -> Value {
		let command = builder::finish(&self.base, &mut self.pending, &invocation.args);
		self.session.invoke(&command, &invocation)
	}

	fn invoke_with<F>(&mut self, invocation: Invocation, callback: F) -> io::Result<JoinHandle<()>>
	where
		F: FnOnce(Value) + Send + 'static,
	{
		let command = builder::finish(&self.base, &mut self.pending, &invocation.args);
		self.session.spawn(command, invocation, callback)
	}
}
