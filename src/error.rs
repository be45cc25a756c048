//! Error types.
//!
//! Each error is represented by a unique type that implements [`std::error::Error`].
//! Dispatching a command can fail in more than one way, so the dispatch APIs
//! return the higher level [`Error`] enum. The individual error types are
//! convertible to it, allowing them to be used with `?`:
//!
//! ```
//! use xtralien::error::{Error, NoConnectionError};
//!
//! fn foo() -> Result<(), NoConnectionError> {
//!     // ...
//! # unimplemented!();
//! }
//!
//! fn bar() -> Result<(), Error> {
//!     foo()?;
//!     // ...
//! # Ok(())
//! }
//! ```
//!
//! Note that the fluent command API on [`Device`](crate::Device) never returns
//! these errors. Failures there are logged and the call yields
//! [`Value::None`](crate::format::Value::None).

use std::io;

/// Implement Error and Display traits for the specified type.
///
/// After the type define the format string and any arguments it should
/// reference after `self =>` (to abide by macro hygiene rules).
macro_rules! impl_error_display {
	(
		$name:path,
		$self:ident =>
		$display:literal
		$(,
			$($arg:expr),+
		)?
	) => {
		impl std::fmt::Display for $name {
			fn fmt(&$self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
				write!(
					f,
					$display
					$(,
						$($arg),+
					)?
				)
			}
		}
	};
}

/// Define error enums that contain concrete error types (not other error enums).
///
/// From and TryFrom traits will be implemented for the enum and it's underlying
/// errors. The enum's Display implementation will defer to the underlying errors'
/// Display implementations.
///
/// ```compile_fail
/// # // This fails to compile because the macro is not exported.
/// error_enum!{
///     #[non_exhaustive]
///     pub enum ThisError {
///         VariantA(A),
///         VariantB(B),
///         // ...
///     }
/// }
/// ```
macro_rules! error_enum {
	(
		$(#[$attr:meta])*
		pub enum $name:ident {
			$(
				$variant:ident($inner:path)
			),+
			$(,)?
		}
	) => {
		$(
			#[$attr]
		)*
		#[allow(missing_docs)]
		pub enum $name {
			$(
				$variant($inner)
			),+
		}

		// Defer the display to the inner error type
		impl std::fmt::Display for $name {
			fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
				match self {
					$(
						$name::$variant(e) => std::fmt::Display::fmt(e, f)
					),+
				}
			}
		}

		impl std::error::Error for $name {
			fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
				match self {
					$(
						$name::$variant(e) => std::error::Error::source(e)
					),+
				}
			}
		}

		// Conversions with underlying errors
		$(
			impl From<$inner> for $name {
				fn from(other: $inner) -> Self {
					$name::$variant(other)
				}
			}

			impl TryFrom<$name> for $inner {
				type Error = $name;
				fn try_from(other: $name) -> Result<Self, Self::Error> {
					match other {
						$name::$variant(value) => Ok(value),
						#[allow(unreachable_patterns)]
						value => Err(value)
					}
				}
			}
		)+
	};
}

/// The specified device is either disconnected or already in use by another process.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SerialDeviceInUseOrDisconnectedError(Box<str>);

impl std::error::Error for SerialDeviceInUseOrDisconnectedError {}
impl_error_display! {
	SerialDeviceInUseOrDisconnectedError,
	self =>
	"the specified device is either disconnected or already in use by another process: {}", self.0
}

/// A command was dispatched on a device that has no connections attached.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct NoConnectionError(Box<str>);

impl NoConnectionError {
	pub(crate) fn new(command: &str) -> Self {
		NoConnectionError(Box::from(command))
	}

	/// The command that could not be sent.
	pub fn command(&self) -> &str {
		&self.0
	}
}

impl std::error::Error for NoConnectionError {}
impl_error_display! {
	NoConnectionError,
	self => "cannot send command '{}' because there are no connections", self.0
}

/// Every connection attached to a device failed (or was already closed)
/// while dispatching a command.
#[derive(Debug)]
pub struct ConnectionsExhaustedError {
	command: Box<str>,
	last: Option<io::Error>,
}

impl ConnectionsExhaustedError {
	pub(crate) fn new(command: &str, last: Option<io::Error>) -> Self {
		ConnectionsExhaustedError {
			command: Box::from(command),
			last,
		}
	}

	/// The command that could not be sent.
	pub fn command(&self) -> &str {
		&self.command
	}

	/// The error reported by the last connection that was tried, if any was.
	pub fn last_error(&self) -> Option<&io::Error> {
		self.last.as_ref()
	}
}

impl std::error::Error for ConnectionsExhaustedError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		self.last
			.as_ref()
			.map(|e| e as &(dyn std::error::Error + 'static))
	}
}
impl_error_display! {
	ConnectionsExhaustedError,
	self => "cannot send command '{}' because there are no open connections", self.command
}

/// A format name did not match any known formatter.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct UnknownFormatError(Box<str>);

impl UnknownFormatError {
	pub(crate) fn new(name: &str) -> Self {
		UnknownFormatError(Box::from(name))
	}

	/// The unrecognised name.
	pub fn name(&self) -> &str {
		&self.0
	}
}

impl std::error::Error for UnknownFormatError {}
impl_error_display! {
	UnknownFormatError,
	self => "unknown response format '{}'", self.0
}

/// A response could not be decoded into the requested shape.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ParseValueError {
	expected: &'static str,
	text: Box<str>,
}

impl ParseValueError {
	pub(crate) fn new(expected: &'static str, text: &str) -> Self {
		ParseValueError {
			expected,
			text: Box::from(text),
		}
	}

	/// The text that failed to decode.
	pub fn text(&self) -> &str {
		&self.text
	}
}

impl std::error::Error for ParseValueError {}
impl_error_display! {
	ParseValueError,
	self => "cannot decode {:?} as {}", self.text, self.expected
}

error_enum! {
	/// Any error returned when dispatching a command.
	#[derive(Debug)]
	#[non_exhaustive]
	pub enum Error {
		Io(io::Error),
		SerialDeviceInUseOrDisconnected(SerialDeviceInUseOrDisconnectedError),
		NoConnection(NoConnectionError),
		ConnectionsExhausted(ConnectionsExhaustedError),
	}
}

impl Error {
	/// A convenience function for determining if the error is due to a
	/// connection timing out.
	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::TimedOut)
	}
}

impl From<serialport::Error> for Error {
	fn from(other: serialport::Error) -> Self {
		match other.kind() {
			serialport::ErrorKind::NoDevice => Error::SerialDeviceInUseOrDisconnected(
				SerialDeviceInUseOrDisconnectedError(other.description.into_boxed_str()),
			),
			serialport::ErrorKind::InvalidInput => Error::Io(io::Error::new(
				io::ErrorKind::InvalidInput,
				other.description,
			)),
			serialport::ErrorKind::Unknown => Error::Io(io::Error::other(other.description)),
			serialport::ErrorKind::Io(kind) => Error::Io(io::Error::new(kind, other.description)),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use static_assertions::assert_impl_all;

	assert_impl_all!(Error: From<io::Error>, From<NoConnectionError>, Send, Sync);
	assert_impl_all!(Error: From<ConnectionsExhaustedError>, From<serialport::Error>);
	assert_impl_all!(NoConnectionError: TryFrom<Error>);
	assert_impl_all!(ConnectionsExhaustedError: TryFrom<Error>);

	#[test]
	fn serialport_errors_map_to_matching_variants() {
		let err: Error = serialport::Error::new(serialport::ErrorKind::NoDevice, "busy").into();
		assert!(matches!(err, Error::SerialDeviceInUseOrDisconnected(_)));

		let err: Error = serialport::Error::new(
			serialport::ErrorKind::Io(io::ErrorKind::TimedOut),
			"slow",
		)
		.into();
		assert!(err.is_timeout());

		let err: Error =
			serialport::Error::new(serialport::ErrorKind::InvalidInput, "bad baud").into();
		assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::InvalidInput));
	}

	#[test]
	fn exhausted_error_exposes_its_cause() {
		use std::error::Error as _;

		let err = ConnectionsExhaustedError::new(
			"smu1 measure",
			Some(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
		);
		assert_eq!(err.command(), "smu1 measure");
		assert!(err.source().is_some());
		assert_eq!(
			err.to_string(),
			"cannot send command 'smu1 measure' because there are no open connections"
		);

		let err: Error = err.into();
		assert!(ConnectionsExhaustedError::try_from(err).is_ok());
	}

	#[test]
	fn try_from_returns_other_variants_unchanged() {
		let err: Error = NoConnectionError::new("cloi hello").into();
		let err = ConnectionsExhaustedError::try_from(err).unwrap_err();
		assert_eq!(
			NoConnectionError::try_from(err).unwrap().command(),
			"cloi hello"
		);
	}
}
