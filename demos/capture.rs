//! Locate a device by vendor and product ID and dump its bulk and interrupt
//! payloads until Enter is pressed.
//!
//! ```text
//! cargo run --example capture -- 1234 5678
//! ```

#[cfg(windows)]
fn main() {
    use usbtap::{platform, CaptureSession, ErrorKind};

    env_logger::init();
    let mut args = std::env::args().skip(1);
    let mut id = || {
        args.next()
            .and_then(|s| u16::from_str_radix(&s, 16).ok())
            .expect("usage: capture VID PID (hex)")
    };
    let (vid, pid) = (id(), id());

    let mut session = CaptureSession::new(platform::WindowsHost::new());
    let found = match session.find_device(&platform::list_endpoints(), vid, pid) {
        Ok(found) => found,
        Err(e) if e.kind() == ErrorKind::NoEndpoints => {
            if let Ok(false) = platform::upper_filter_installed() {
                eprintln!("USBPcap is not a USB upper filter; reinstall it and reboot");
            }
            panic!("{e}");
        }
        Err(e) => panic!("{e}"),
    };
    println!(
        "{vid:04x}:{pid:04x} is on {} port {}, address {}",
        found.endpoint, found.port, found.device_address
    );

    session
        .start(|payload: &[u8]| println!("{} bytes: {:02x?}", payload.len(), payload))
        .unwrap();

    let mut line = String::new();
    std::io::stdin().read_line(&mut line).unwrap();
    session.stop();
}

#[cfg(not(windows))]
fn main() {
    eprintln!("USBPcap is only available on Windows");
}
