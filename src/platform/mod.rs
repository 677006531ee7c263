#[cfg(target_os = "windows")]
mod windows_usbpcap;

#[cfg(target_os = "windows")]
pub use windows_usbpcap::*;
