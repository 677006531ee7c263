use log::debug;
use windows_sys::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_PATH_NOT_FOUND};

use super::util::create_file;

/// Highest endpoint number probed by [`list_endpoints`].
pub const MAX_ENDPOINTS: u32 = 64;

/// Device path of capture endpoint `n`.
pub fn endpoint_path(n: u32) -> String {
    format!("\\\\.\\USBPcap{n}")
}

/// List the capture endpoints present on the system, in numeric order.
///
/// Each candidate is opened without access rights, so endpoints that are
/// currently capturing are listed too.
pub fn list_endpoints() -> Vec<String> {
    let mut endpoints = Vec::new();
    for n in 1..=MAX_ENDPOINTS {
        let path = endpoint_path(n);
        match create_file(&path, 0, 0, 0) {
            Ok(_) => endpoints.push(path),
            Err(ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND) => {}
            Err(e) => {
                debug!("Probing {path} failed with {e}, listing it anyway");
                endpoints.push(path);
            }
        }
    }
    debug!("Found capture endpoints: {endpoints:?}");
    endpoints
}

#[test]
fn test_endpoint_path() {
    assert_eq!(endpoint_path(3), "\\\\.\\USBPcap3");
}
