//! Finding which capture endpoint a device is attached to.

use log::{debug, info, warn};

use crate::{
    hub::{enumerate_endpoint, Host, HubVisitor, PortConnection},
    Error, ErrorKind,
};

/// A device found below a capture endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedDevice {
    /// Capture endpoint whose root hub the device is attached under.
    pub endpoint: String,

    /// Port of the device on its parent hub.
    pub port: u32,

    pub device_address: u16,
}

/// Hub visitor recording the first port whose device matches a vendor/product ID pair.
#[derive(Debug, Clone)]
pub struct DeviceMatcher {
    vendor_id: u16,
    product_id: u16,
    found: Option<(u32, u16)>,
}

impl DeviceMatcher {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        DeviceMatcher {
            vendor_id,
            product_id,
            found: None,
        }
    }

    /// Port number and device address of the first match.
    pub fn found(&self) -> Option<(u32, u16)> {
        self.found
    }
}

impl<H: ?Sized> HubVisitor<H> for DeviceMatcher {
    fn visit_port(&mut self, _hub: &H, connection: &PortConnection) {
        if self.found.is_none()
            && connection.vendor_id == self.vendor_id
            && connection.product_id == self.product_id
        {
            debug!(
                "Found {:04x}:{:04x} at port {} address {}",
                self.vendor_id, self.product_id, connection.port, connection.device_address
            );
            self.found = Some((connection.port, connection.device_address));
        }
    }
}

/// Search the hubs below each capture endpoint, in order, for a device.
///
/// Returns the first endpoint with a match; later endpoints are not queried.
/// Endpoints whose root hub cannot be resolved are skipped.
pub fn find_device<H, S>(
    host: &H,
    endpoints: &[S],
    vendor_id: u16,
    product_id: u16,
) -> Result<LocatedDevice, Error>
where
    H: Host,
    S: AsRef<str>,
{
    if endpoints.is_empty() {
        match host.upper_filter_installed() {
            Ok(true) => debug!("USBPcap is a USB class upper filter but no endpoint exists"),
            Ok(false) => warn!("USBPcap is not a USB class upper filter; reinstall it and reboot"),
            Err(e) => warn!("Failed to read USB class upper filters: {e}"),
        }
        return Err(Error::new(
            ErrorKind::NoEndpoints,
            "no capture endpoints are available",
        ));
    }

    for endpoint in endpoints {
        let endpoint = endpoint.as_ref();
        let mut matcher = DeviceMatcher::new(vendor_id, product_id);

        if let Err(e) = enumerate_endpoint(host, endpoint, &mut matcher) {
            warn!("Failed to get root hub of {endpoint}: {e}");
            continue;
        }

        if let Some((port, device_address)) = matcher.found() {
            info!("Device {vendor_id:04x}:{product_id:04x} found on {endpoint} port {port}");
            return Ok(LocatedDevice {
                endpoint: endpoint.to_owned(),
                port,
                device_address,
            });
        }
    }

    Err(Error::new(ErrorKind::NotFound, "device not found").log_debug())
}
