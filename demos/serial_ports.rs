//! Example: list serial ports and probe them for Xtralien devices.

use simple_logger::SimpleLogger;
use xtralien::discover::{self, ProbeOptions, ScanOptions};

fn main() {
    // Enable logging
    SimpleLogger::new().env().init().unwrap();

    let ports = discover::serial_ports();
    println!("Serial ports that can be opened: {ports:?}");

    // Probe each of them with a longer timeout than usual.
    let mut probe = ProbeOptions::new();
    probe.timeout(std::time::Duration::from_millis(500));
    let mut options = ScanOptions::new();
    options.probe(probe).candidates(ports);
    for device in discover::scan_serial(&options) {
        println!("Found {device}");
    }
}
