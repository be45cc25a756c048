//! Example: receive responses through a callback.

use simple_logger::SimpleLogger;
use std::{sync::mpsc, time::Duration};
use xtralien::{CommandBuilder as _, Device, Invocation};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Enable logging
    SimpleLogger::new().init().unwrap();

    let mut device = Device::usb("/dev/ttyACM0")?;

    // Enable SMU 1 and bookmark it.
    let mut smu = device.select("smu1").dup();
    smu.select("set").select("enabled").invoke(Invocation::new().arg(1));

    // Start a sweep in the background and keep working while it runs.
    let (tx, rx) = mpsc::channel();
    let sweep = smu.select("sweep").invoke_with(
        Invocation::new()
            .args([0.0, 0.1, 1.0])
            .settle(Duration::from_millis(100)),
        move |value| tx.send(value).unwrap(),
    )?;

    // Queued behind the sweep, so this only runs once it has finished.
    let version = device.version();

    sweep.join().unwrap();
    println!("firmware {version:?}, sweep {}", rx.recv()?);
    Ok(())
}
