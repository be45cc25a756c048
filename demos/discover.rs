//! Example: discover and connect to Xtralien devices.

use simple_logger::SimpleLogger;
use std::time::Duration;
use xtralien::{discover::DiscoverOptions, CommandBuilder as _, Device};

fn main() {
    // Enable logging
    SimpleLogger::new().init().unwrap();

    // Listen for two seconds for instruments on the local network.
    let mut devices = Device::discover(DiscoverOptions::new().window(Duration::from_secs(2)));
    if devices.is_empty() {
        println!("No instruments found");
    }

    // Greet each one and ask for its firmware version.
    for device in &mut devices {
        let greeting = device.select("cloi").select("hello").query("strip");
        println!("{device}: {greeting}, version {:?}", device.version());
    }
}
