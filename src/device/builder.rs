//! The fluent interface for composing and invoking commands.

use crate::format::{Format, Value};
use std::{fmt::Display, io, thread::JoinHandle, time::Duration};

/// Options for the terminal step of a command: its trailing arguments, how
/// (and whether) to read a reply, and how long to let the instrument settle.
///
/// ## Example
///
/// ```rust
/// # use xtralien::{CommandBuilder as _, Device, Invocation};
/// # fn wrapper(mut device: Device) {
/// // Send `smu1 sweep 0 0.1 3` and decode the reply automatically.
/// let data = device
///     .select("smu1")
///     .select("sweep")
///     .invoke(Invocation::new().args([0.0, 0.1, 3.0]).format("auto"));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Invocation {
	pub(super) args: Vec<String>,
	format: Option<Format>,
	response: bool,
	pub(super) settle: Option<Duration>,
}

impl Invocation {
	/// An invocation with no arguments that does not read a reply.
	pub fn new() -> Self {
		Invocation::default()
	}

	/// Append an argument to the command.
	#[must_use]
	pub fn arg<T: Display>(mut self, value: T) -> Self {
		self.args.push(value.to_string());
		self
	}

	/// Append several arguments to the command.
	#[must_use]
	pub fn args<I>(mut self, values: I) -> Self
	where
		I: IntoIterator,
		I::Item: Display,
	{
		self.args.extend(values.into_iter().map(|v| v.to_string()));
		self
	}

	/// Read the reply and decode it with `format`.
	///
	/// Names are looked up with [`Format::from_name`], so an unknown name
	/// returns the raw reply rather than failing.
	#[must_use]
	pub fn format<F: Into<Format>>(mut self, format: F) -> Self {
		self.format = Some(format.into());
		self
	}

	/// Read the reply even if no format is given, returning it untouched.
	#[must_use]
	pub fn response(mut self, response: bool) -> Self {
		self.response = response;
		self
	}

	/// Override the device's settle delay for this command.
	#[must_use]
	pub fn settle(mut self, delay: Duration) -> Self {
		self.settle = Some(delay);
		self
	}

	/// Whether a reply should be read.
	pub(super) fn expects_reply(&self) -> bool {
		self.response || self.format.is_some()
	}

	/// The format used to decode the reply.
	///
	/// Replies handed to a callback are decoded automatically unless a format
	/// is given.
	pub(super) fn formatter(&self, has_callback: bool) -> Format {
		match &self.format {
			Some(format) => format.clone(),
			None if has_callback => Format::Auto,
			None => Format::None,
		}
	}
}

/// Types that accumulate command tokens and dispatch them to an instrument.
///
/// Tokens are appended with [`select`](CommandBuilder::select) and
/// [`index`](CommandBuilder::index), which return the builder itself so calls
/// can be chained. A terminal call ([`invoke`](CommandBuilder::invoke),
/// [`invoke_with`](CommandBuilder::invoke_with), [`send`](CommandBuilder::send)
/// or [`query`](CommandBuilder::query)) joins the tokens with single spaces,
/// clears them, and dispatches the result.
///
/// ```rust
/// # use xtralien::{CommandBuilder as _, Device};
/// # fn wrapper(mut device: Device) {
/// // Send `smu1 measure` and decode the reply automatically.
/// let reading = device.select("smu1").select("measure").query("auto");
/// # }
/// ```
///
/// The pending tokens are cleared by every terminal call, even one that
/// fails, so a failed command never leaks into the next one.
pub trait CommandBuilder: private::Sealed {
	/// The tokens accumulated since the last terminal call.
	fn pending(&self) -> &[String];

	#[doc(hidden)]
	fn pending_mut(&mut self) -> &mut Vec<String>;

	/// Dispatch the command and wait for the outcome.
	///
	/// A reply is read if the invocation asks for a format or a response;
	/// otherwise the command is sent and [`Value::None`] is returned.
	/// Dispatch failures are logged and also yield [`Value::None`].
	fn invoke(&mut self, invocation: Invocation) -> Value;

	/// Dispatch the command on a background thread and hand the decoded reply
	/// to `callback`.
	///
	/// Returns as soon as the thread is started. A reply is always read, and
	/// decoded with [`Format::Auto`] unless the invocation names a format.
	/// Commands keep the order in which they were issued, whether they are
	/// invoked synchronously or not.
	fn invoke_with<F>(&mut self, invocation: Invocation, callback: F) -> io::Result<JoinHandle<()>>
	where
		F: FnOnce(Value) + Send + 'static;

	/// Append a symbolic token, e.g. `smu1` or `measure`.
	fn select<T: Into<String>>(&mut self, token: T) -> &mut Self {
		self.pending_mut().push(token.into());
		self
	}

	/// Append a literal token, e.g. a channel number.
	fn index<T: Display>(&mut self, value: T) -> &mut Self {
		self.pending_mut().push(value.to_string());
		self
	}

	/// Send the command without reading a reply.
	fn send(&mut self) {
		self.invoke(Invocation::new());
	}

	/// Send the command and decode the reply with `format`.
	fn query<F: Into<Format>>(&mut self, format: F) -> Value {
		self.invoke(Invocation::new().format(format))
	}
}

/// Join `prefix`, the `pending` tokens and `args` into a command, clearing
/// `pending`.
pub(super) fn finish(prefix: &[String], pending: &mut Vec<String>, args: &[String]) -> String {
	let pending = std::mem::take(pending);
	prefix
		.iter()
		.chain(pending.iter())
		.chain(args.iter())
		.map(String::as_str)
		.collect::<Vec<_>>()
		.join(" ")
}

pub(super) mod private {
	pub trait Sealed {}

	impl Sealed for super::super::Device {}
	impl Sealed for super::super::DeviceDuplicate {}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn finish_joins_and_clears() {
		let prefix = vec!["smu1".to_string()];
		let mut pending = vec!["set".to_string(), "voltage".to_string()];
		let command = finish(&prefix, &mut pending, &["1".to_string()]);
		assert_eq!(command, "smu1 set voltage 1");
		assert!(pending.is_empty());

		assert_eq!(finish(&[], &mut Vec::new(), &[]), "");
	}

	#[test]
	fn reply_expectations() {
		assert!(!Invocation::new().expects_reply());
		assert!(Invocation::new().response(true).expects_reply());
		assert!(Invocation::new().format("none").expects_reply());

		assert!(matches!(Invocation::new().formatter(false), Format::None));
		assert!(matches!(Invocation::new().formatter(true), Format::Auto));
		assert!(matches!(
			Invocation::new().format("strip").formatter(true),
			Format::Strip
		));
	}

	#[test]
	fn arguments_are_stringified() {
		let invocation = Invocation::new().arg(1).arg("x").args([0.5, 2.0]);
		assert_eq!(invocation.args, ["1", "x", "0.5", "2"]);
	}
}
