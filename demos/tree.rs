//! Print the devices below every capture endpoint.
//!
//! Pass `--extcap` for the extcap configuration lines instead of the
//! indented tree.

#[cfg(windows)]
fn main() {
    use std::io::stdout;
    use usbtap::{
        display::{ExtcapConfig, TreePrinter},
        hub::enumerate_endpoint,
        platform,
    };

    env_logger::init();
    let extcap = std::env::args().any(|a| a == "--extcap");
    let host = platform::WindowsHost::new();

    match platform::upper_filter_installed() {
        Ok(true) => {}
        Ok(false) => eprintln!("USBPcap is not an upper filter of the USB class; reboot required?"),
        Err(e) => eprintln!("failed to check USB class upper filters: {e}"),
    }

    for endpoint in platform::list_endpoints() {
        let res = if extcap {
            let mut out = ExtcapConfig::new(stdout().lock());
            enumerate_endpoint(&host, &endpoint, &mut out).map(|_| out.finish())
        } else {
            println!("{endpoint}");
            let mut out = TreePrinter::new(stdout().lock());
            enumerate_endpoint(&host, &endpoint, &mut out).map(|_| out.finish())
        };
        match res {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => eprintln!("write failed: {e}"),
            Err(e) => eprintln!("  {endpoint}: {e}"),
        }
    }
}

#[cfg(not(windows))]
fn main() {
    eprintln!("USBPcap is only available on Windows");
}
