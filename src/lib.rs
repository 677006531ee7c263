//! Discover USB devices below USBPcap capture endpoints and capture their
//! bulk and interrupt traffic.
//!
//! USBPcap attaches one capture endpoint (`\\.\USBPcapN`) to each root hub.
//! This crate provides:
//!
//!  * Listing the device tree below each endpoint, as indented text with
//!    [`display::TreePrinter`] or as extcap configuration lines with
//!    [`display::ExtcapConfig`].
//!  * Locating the endpoint a device is attached under by vendor and product
//!    ID with [`locate::find_device`].
//!  * Running a [`CaptureSession`] against an endpoint, which decodes the
//!    driver's pcap stream on a background thread and passes the data of each
//!    bulk or interrupt transfer to a [`PayloadSink`], or to an async
//!    [`stream::PayloadStream`].
//!
//! The platform-independent logic is written against the
//! [`DeviceRegistry`][registry::DeviceRegistry], [`Host`][hub::Host] and
//! [`CaptureDriver`][session::CaptureDriver] traits. The Windows
//! implementation of all three is [`platform::WindowsHost`].
//!
//! ### Logging
//!
//! `usbtap` uses the [`log`](https://docs.rs/log) crate to log debug and error
//! information. Devices and hubs that cannot be queried are skipped with a
//! log message rather than failing the whole enumeration.

pub mod platform;

mod error;
pub use error::{Error, ErrorKind};

pub mod display;
pub mod filter;
pub mod frame;
pub mod hub;
pub mod locate;
pub mod registry;
pub mod session;
pub use session::{CaptureSession, PayloadSink, SessionConfig};

pub mod stream;
pub mod tree;

#[cfg(test)]
mod test_support;
