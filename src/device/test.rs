use super::*;
use crate::{
	connection::{Exchange, Mock},
	error::Error,
	format::Format,
};
use static_assertions::assert_impl_all;
use std::{
	io::Read as _,
	net::TcpListener,
	sync::mpsc,
	time::{Duration, Instant},
};

assert_impl_all!(Device: Send, Sync, fmt::Debug, fmt::Display);
assert_impl_all!(DeviceDuplicate: Send, Sync, Clone, fmt::Debug);

/// A device with no settle delay backed by a mock that replies using `responder`.
fn mock_device<F>(responder: F) -> (Device, Mock)
where
	F: FnMut(&str) -> Option<String> + Send + 'static,
{
	let mock = Mock::new();
	mock.respond_with(responder);
	let device = Device::from_connection(mock.clone());
	device.set_settle_delay(Duration::ZERO);
	(device, mock)
}

/// Replies to `cloi hello` like an instrument and echoes everything else.
fn instrument(command: &str) -> Option<String> {
	match command {
		"cloi hello" => Some("Hello World\n".to_string()),
		"smu1 measure" => Some("[0.5;1e-3]\n".to_string()),
		"smu1 sweep 0 0.1 0.2" => Some("[0,0;0.1,1e-6;0.2,4e-6]".to_string()),
		_ => Some(format!("{command}\n")),
	}
}

#[test]
fn chained_tokens_are_joined_and_cleared() {
	let (mut device, mock) = mock_device(instrument);
	device.select("smu1").select("set").select("voltage");
	assert_eq!(device.pending(), ["smu1", "set", "voltage"]);

	let value = device.invoke(Invocation::new().arg(1.5));
	assert_eq!(value, Value::None);
	assert!(device.pending().is_empty());
	assert_eq!(mock.written(), ["smu1 set voltage 1.5"]);
}

#[test]
fn fire_and_forget_does_not_read() {
	let (mut device, mock) = mock_device(instrument);
	device.select("smu1").select("set").select("enabled").index(1).send();
	assert_eq!(
		mock.transcript(),
		[Exchange::Write("smu1 set enabled 1".to_string())]
	);
}

#[test]
fn hello_with_each_format() {
	let (mut device, _mock) = mock_device(instrument);

	let value = device.select("cloi").select("hello").query("strip");
	assert_eq!(value, Value::Text("Hello World".to_string()));

	let value = device.select("cloi").select("hello").query("none");
	assert_eq!(value, Value::Text("Hello World\n".to_string()));

	let value = device.select("cloi").select("hello").query(Format::Auto);
	assert_eq!(value, Value::Text("Hello World".to_string()));
}

#[test]
fn replies_are_decoded() {
	let (mut device, _mock) = mock_device(instrument);

	let value = device.select("smu1").select("measure").query("array");
	assert_eq!(value.as_array(), Some(&[0.5, 1e-3][..]));

	let value = device
		.select("smu1")
		.select("sweep")
		.invoke(Invocation::new().args([0.0, 0.1, 0.2]).format("auto"));
	assert_eq!(
		value.as_matrix(),
		Some(&[vec![0.0, 0.0], vec![0.1, 1e-6], vec![0.2, 4e-6]][..])
	);
}

#[test]
fn unknown_format_returns_raw_reply() {
	let (mut device, _mock) = mock_device(instrument);
	let value = device.select("cloi").select("hello").query("bogus");
	assert_eq!(value, Value::Text("Hello World\n".to_string()));
}

#[test]
fn response_without_format_returns_raw_reply() {
	let (mut device, _mock) = mock_device(instrument);
	let value = device
		.select("cloi")
		.select("hello")
		.invoke(Invocation::new().response(true));
	assert_eq!(value, Value::Text("Hello World\n".to_string()));
}

#[test]
fn duplicates_keep_their_own_tokens() {
	let (mut device, mock) = mock_device(instrument);
	let mut smu = device.select("smu2").dup();
	assert!(device.pending().is_empty());
	assert_eq!(smu.base(), ["smu2"]);

	device.select("cloi");
	smu.select("set").select("enabled").index(1).send();
	assert_eq!(device.pending(), ["cloi"]);
	assert!(smu.pending().is_empty());

	let mut measure = smu.select("measure").dup();
	assert_eq!(measure.base(), ["smu2", "measure"]);
	measure.send();
	smu.send();
	device.select("hello").send();

	assert_eq!(
		mock.written(),
		["smu2 set enabled 1", "smu2 measure", "smu2", "cloi hello"]
	);
}

#[test]
fn failing_connection_falls_through() {
	let first = Mock::new();
	first.write_error(Some(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")));
	let second = Mock::new();
	second.respond_with(instrument);

	let mut device = Device::from_connection(first.clone());
	device.add_connection(second.clone());
	device.set_settle_delay(Duration::ZERO);

	let value = device.select("cloi").select("hello").query("strip");
	assert_eq!(value, Value::Text("Hello World".to_string()));
	assert!(first.is_closed());
	assert!(!second.is_closed());
	assert_eq!(second.written(), ["cloi hello"]);

	// The closed connection is skipped from now on.
	device.select("smu1").select("measure").send();
	assert!(first.written().is_empty());
	assert_eq!(second.written(), ["cloi hello", "smu1 measure"]);
}

#[test]
fn all_connections_failing() {
	let mock = Mock::new();
	let mut device = Device::from_connection(mock.clone());
	device.set_settle_delay(Duration::ZERO);

	// Nothing in the buffer, so waiting for a reply times out.
	device.select("smu1").select("measure");
	assert_eq!(device.query("auto"), Value::None);
	assert!(device.pending().is_empty());
	assert!(mock.is_closed());

	match device.command("cloi hello", true) {
		Err(Error::ConnectionsExhausted(e)) => {
			assert_eq!(e.command(), "cloi hello");
			assert!(e.last_error().is_none());
		}
		other => panic!("unexpected result: {other:?}"),
	}
}

#[test]
fn exhausted_error_carries_last_failure() {
	let mock = Mock::new();
	mock.read_error(Some(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
	mock.append_data("ignored");
	let device = Device::from_connection(mock);
	device.set_settle_delay(Duration::ZERO);

	let err = device.command("smu1 measure", true).unwrap_err();
	let Error::ConnectionsExhausted(e) = err else {
		panic!("unexpected error: {err:?}");
	};
	assert_eq!(
		e.last_error().map(io::Error::kind),
		Some(io::ErrorKind::ConnectionReset)
	);
}

#[test]
fn no_connection() {
	let mut device = Device::new();
	device.set_settle_delay(Duration::ZERO);
	assert_eq!(device.select("cloi").select("hello").query("strip"), Value::None);
	assert!(device.pending().is_empty());
	assert!(matches!(
		device.command("cloi hello", true),
		Err(Error::NoConnection(_))
	));
	assert_eq!(device.to_string(), "<Device connection=None/>");
}

#[test]
fn callback_receives_auto_decoded_reply() {
	let (mut device, _mock) = mock_device(instrument);
	let (tx, rx) = mpsc::channel();
	let handle = device
		.select("smu1")
		.select("measure")
		.invoke_with(Invocation::new(), move |value| tx.send(value).unwrap())
		.unwrap();
	assert!(device.pending().is_empty());
	handle.join().unwrap();
	assert_eq!(
		rx.recv().unwrap(),
		Value::Array(vec![0.5, 1e-3])
	);
}

#[test]
fn callback_gets_none_on_failure() {
	let mut device = Device::new();
	let (tx, rx) = mpsc::channel();
	device
		.select("cloi")
		.select("hello")
		.invoke_with(Invocation::new().format("strip"), move |value| {
			tx.send(value).unwrap();
		})
		.unwrap()
		.join()
		.unwrap();
	assert_eq!(rx.recv().unwrap(), Value::None);
}

#[test]
fn commands_never_interleave() {
	let (mut device, mock) = mock_device(|command| Some(format!("re {command}")));
	device.set_settle_delay(Duration::from_millis(2));

	let handles: Vec<_> = (0..10)
		.map(|i| {
			device
				.select("echo")
				.index(i)
				.invoke_with(Invocation::new().format("none"), |_| ())
				.unwrap()
		})
		.collect();
	let last = device.select("echo").select("last").query("none");
	assert_eq!(last, Value::Text("re echo last".to_string()));
	for handle in handles {
		handle.join().unwrap();
	}

	let expected: Vec<_> = (0..10)
		.map(|i| format!("echo {i}"))
		.chain(std::iter::once("echo last".to_string()))
		.flat_map(|command| {
			let reply = format!("re {command}");
			[Exchange::Write(command), Exchange::Read(reply)]
		})
		.collect();
	assert_eq!(mock.transcript(), expected);
}

#[test]
fn device_stays_usable_while_a_reply_is_pending() {
	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let port = listener.local_addr().unwrap().port();
	let mut device = Device::tcp("127.0.0.1", port).unwrap();
	device.set_settle_delay(Duration::ZERO);
	let (mut instrument, _) = listener.accept().unwrap();
	let socket_name = format!("127.0.0.1:{port}");

	let (tx, rx) = mpsc::channel();
	let handle = device
		.select("smu1")
		.select("measure")
		.invoke_with(Invocation::new(), move |value| tx.send(value).unwrap())
		.unwrap();
	// Once the command arrives the dispatch thread is blocked reading the reply.
	let mut buf = [0u8; 12];
	instrument.read_exact(&mut buf).unwrap();
	assert_eq!(&buf, b"smu1 measure");

	let spare = Mock::new();
	let observed = thread::scope(|s| {
		let (seen_tx, seen_rx) = mpsc::channel();
		let device = &device;
		let spare = spare.clone();
		s.spawn(move || {
			device.add_connection(spare);
			device.set_terminator("\n");
			seen_tx
				.send((device.connection_names(), device.to_string(), device.settle_delay()))
				.unwrap();
		});
		let seen = seen_rx.recv_timeout(Duration::from_secs(2));
		// Hanging up ends the pending read either way.
		drop(instrument);
		seen
	});

	let (names, display, settle) = observed.expect("device was locked during the read");
	assert_eq!(names, [socket_name.clone(), spare.name().unwrap()]);
	assert_eq!(display, format!("<Device connection={socket_name}/>"));
	assert_eq!(settle, Duration::ZERO);

	handle.join().unwrap();
	assert_eq!(rx.recv().unwrap(), Value::None);
	// The connection attached mid-command is kept, after the original one.
	assert_eq!(device.connection_names(), [socket_name, spare.name().unwrap()]);
}

#[test]
fn close_closes_every_connection() {
	let first = Mock::new();
	let second = Mock::new();
	let device = Device::from_connection(first.clone());
	device.add_connection(second.clone());
	assert_eq!(device.connection_names().len(), 2);

	device.close();
	assert!(first.is_closed());
	assert!(second.is_closed());
	assert!(matches!(
		device.command("cloi hello", false),
		Err(Error::ConnectionsExhausted(_))
	));
}

#[test]
fn dropping_the_device_closes_connections() {
	let mock = Mock::new();
	let device = Device::from_connection(mock.clone());
	drop(device);
	assert!(mock.is_closed());
}

#[test]
fn terminator_is_appended() {
	let (mut device, mock) = mock_device(|_| None);
	device.set_terminator("\n");
	device.select("cloi").select("hello").send();
	assert_eq!(mock.written(), ["cloi hello\n"]);
}

#[test]
fn settle_delay_can_be_overridden() {
	let (mut device, _mock) = mock_device(|_| None);
	assert_eq!(device.settle_delay(), Duration::ZERO);

	device.set_settle_delay(Duration::from_secs(5));
	let start = Instant::now();
	device
		.select("smu1")
		.select("measure")
		.invoke(Invocation::new().settle(Duration::ZERO));
	assert!(start.elapsed() < Duration::from_secs(5));

	assert_eq!(Device::new().settle_delay(), Device::DEFAULT_SETTLE_DELAY);
}

#[test]
fn version_is_trimmed() {
	let (device, mock) = mock_device(|command| {
		(command == "cloi version").then(|| "1.4.2\r\n".to_string())
	});
	assert_eq!(device.version().as_deref(), Some("1.4.2"));
	assert_eq!(mock.written(), ["cloi version"]);
	assert_eq!(Device::new().version(), None);
}

#[test]
fn responsiveness() {
	let (device, _mock) = mock_device(|command| {
		(command == "cloi hello\n").then(|| "Hello World\n".to_string())
	});
	assert!(device.is_responsive(&ProbeOptions::new()));

	let (device, _mock) = mock_device(|_| Some("what?\n".to_string()));
	assert!(!device.is_responsive(&ProbeOptions::new()));

	assert!(!Device::new().is_responsive(&ProbeOptions::new()));
}

#[test]
fn display_names_first_connection() {
	let mock = Mock::new();
	let name = mock.name().unwrap();
	let device = Device::from_connection(mock);
	assert_eq!(device.to_string(), format!("<Device connection={name}/>"));
	assert_eq!(device.connection_names(), [name]);
}
