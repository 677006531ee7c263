//! Recursive enumeration of the hubs below a capture endpoint.

use log::{debug, warn};

use crate::{
    registry::DeviceRegistry,
    tree::{describe_device, VisitedNode},
    Error,
};

/// Connection state of a hub port.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Nothing is plugged in.
    NoDevice,

    /// A device is attached and enumerated.
    Connected,

    /// A device is attached but failed to enumerate (over-current, not enough
    /// power or bandwidth, reset in progress, ...).
    Failed,
}

/// Information about one port of a hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConnection {
    /// 1-based port number.
    pub port: u32,
    pub status: ConnectionStatus,

    /// USB address assigned to the attached device.
    pub device_address: u16,

    /// The attached device is itself a hub.
    pub is_hub: bool,

    /// `idVendor` from the attached device's device descriptor.
    pub vendor_id: u16,

    /// `idProduct` from the attached device's device descriptor.
    pub product_id: u16,
}

/// An open hub.
pub trait Hub {
    /// Number of downstream ports, from the hub descriptor.
    fn port_count(&self) -> Result<u8, Error>;

    fn connection(&self, port: u32) -> Result<PortConnection, Error>;

    /// Driver key of the device attached to `port`, matching
    /// [`PropertyKind::DriverKey`][crate::registry::PropertyKind::DriverKey].
    fn driver_key_name(&self, port: u32) -> Result<String, Error>;

    /// Name of the hub attached to `port`, to be passed to [`Host::open_hub`]
    /// after [`hub_device_path`].
    fn external_hub_name(&self, port: u32) -> Result<String, Error>;
}

/// The host side of hub enumeration: capture endpoints, hubs, and the device
/// registry.
pub trait Host {
    type Hub: Hub;
    type Registry: DeviceRegistry;

    fn registry(&self) -> &Self::Registry;

    /// Name of the root hub a capture endpoint is attached to.
    fn root_hub_name(&self, endpoint: &str) -> Result<String, Error>;

    /// Open a hub by device path.
    fn open_hub(&self, path: &str) -> Result<Self::Hub, Error>;

    /// Whether the capture driver is registered as an upper filter of the
    /// USB device class.
    ///
    /// Hosts that have no such notion report `true`.
    fn upper_filter_installed(&self) -> Result<bool, Error> {
        Ok(true)
    }
}

/// Callbacks from [`enumerate_hub`].
///
/// All methods have empty defaults.
pub trait HubVisitor<H: ?Sized> {
    /// Whether port devices should be described from the registry, producing
    /// [`visit_node`][Self::visit_node] calls.
    fn describes_nodes(&self) -> bool {
        false
    }

    /// Called by [`enumerate_endpoint`] once the root hub is known.
    fn visit_root(&mut self, _endpoint: &str, _hub_name: &str) {}

    fn visit_node(&mut self, _node: &VisitedNode) {}

    /// Called for every port with an enumerated device.
    fn visit_port(&mut self, _hub: &H, _connection: &PortConnection) {}
}

/// Convert a hub name as reported by the driver into a path that can be opened.
pub fn hub_device_path(name: &str) -> String {
    if let Some(rest) = name.strip_prefix("\\??\\") {
        format!("\\\\.\\{rest}")
    } else if name.starts_with('\\') {
        name.to_owned()
    } else {
        format!("\\\\.\\{name}")
    }
}

/// Walk the ports of the hub `hub_name` and, depth first, of every hub below it.
///
/// `parent` is the port connection the hub is attached through, `None` for a
/// root hub. Failures to open a hub or read its port count abandon that hub
/// only; failures on one port skip that port.
pub fn enumerate_hub<H, V>(
    host: &H,
    hub_name: &str,
    parent: Option<&PortConnection>,
    level: u32,
    visitor: &mut V,
) where
    H: Host,
    V: HubVisitor<H::Hub> + ?Sized,
{
    let path = hub_device_path(hub_name);

    let hub = match host.open_hub(&path) {
        Ok(hub) => hub,
        Err(e) => {
            warn!("Unable to open hub {path}: {e}");
            return;
        }
    };

    let port_count = match hub.port_count() {
        Ok(n) => n,
        Err(e) => {
            warn!("Failed to get node information for hub {path}: {e}");
            return;
        }
    };

    let hub_address = parent.map_or(0, |p| p.device_address);

    for port in 1..=u32::from(port_count) {
        let connection = match hub.connection(port) {
            Ok(c) => c,
            Err(e) => {
                debug!("Failed to get connection information for {path} port {port}: {e}");
                continue;
            }
        };

        if connection.status == ConnectionStatus::NoDevice {
            continue;
        }

        if visitor.describes_nodes() {
            match hub.driver_key_name(port) {
                Ok(driver_key) => {
                    let res = describe_device(
                        host.registry(),
                        &driver_key,
                        port,
                        level,
                        !connection.is_hub,
                        connection.device_address,
                        hub_address,
                        &mut |node| visitor.visit_node(node),
                    );
                    if let Err(e) = res {
                        warn!("Failed to describe device on {path} port {port}: {e}");
                    }
                }
                Err(e) => debug!("Failed to get driver key for {path} port {port}: {e}"),
            }
        }

        if connection.status == ConnectionStatus::Connected {
            visitor.visit_port(&hub, &connection);
        }

        if connection.is_hub {
            match hub.external_hub_name(port) {
                Ok(name) => enumerate_hub(host, &name, Some(&connection), level + 1, &mut *visitor),
                Err(e) => debug!("Failed to get hub name for {path} port {port}: {e}"),
            }
        }
    }
}

/// Enumerate the root hub of a capture endpoint.
pub fn enumerate_endpoint<H, V>(host: &H, endpoint: &str, visitor: &mut V) -> Result<(), Error>
where
    H: Host,
    V: HubVisitor<H::Hub> + ?Sized,
{
    let hub_name = host.root_hub_name(endpoint)?;
    visitor.visit_root(endpoint, &hub_name);
    enumerate_hub(host, &hub_name, None, 0, visitor);
    Ok(())
}
