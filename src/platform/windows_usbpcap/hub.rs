use std::{mem, os::windows::prelude::OwnedHandle};

use log::debug;
use windows_sys::Win32::{
    Devices::Usb::{
        DeviceConnected, NoDeviceConnected, IOCTL_USB_GET_NODE_CONNECTION_DRIVERKEY_NAME,
        IOCTL_USB_GET_NODE_CONNECTION_INFORMATION_EX, IOCTL_USB_GET_NODE_CONNECTION_NAME,
        IOCTL_USB_GET_NODE_INFORMATION, USB_NODE_CONNECTION_INFORMATION_EX, USB_NODE_INFORMATION,
    },
    Foundation::{ERROR_ACCESS_DENIED, GENERIC_WRITE},
    Storage::FileSystem::FILE_SHARE_WRITE,
};

use crate::{
    hub::{ConnectionStatus, Hub, PortConnection},
    Error, ErrorKind,
};

use super::util::{
    create_file, device_io_control, device_io_control_struct, from_wide_until_nul,
    wide_from_bytes,
};

/// Size of `ConnectionIndex` + `ActualLength` preceding the name in
/// `USB_NODE_CONNECTION_NAME` and `USB_NODE_CONNECTION_DRIVERKEY_NAME`.
const NAME_HEADER_LEN: usize = 8;

/// Safe wrapper around the hub ioctls used to enumerate ports.
pub struct HubHandle(OwnedHandle);

impl HubHandle {
    pub fn open(path: &str) -> Result<HubHandle, Error> {
        match create_file(path, GENERIC_WRITE, FILE_SHARE_WRITE, 0) {
            Ok(h) => Ok(HubHandle(h)),
            Err(ERROR_ACCESS_DENIED) => Err(Error::new_os(
                ErrorKind::PermissionDenied,
                "access denied opening hub",
                ERROR_ACCESS_DENIED,
            )),
            Err(e) => Err(Error::new_os(ErrorKind::Other, "unable to open hub", e)),
        }
    }

    /// Issue one of the variable-length name requests for `port`.
    fn connection_name(&self, code: u32, port: u32) -> Result<String, Error> {
        let mut header = [0u8; NAME_HEADER_LEN + 2];
        header[..4].copy_from_slice(&port.to_le_bytes());
        let request = header;
        device_io_control(&self.0, code, &request, &mut header)
            .map_err(|e| Error::new_os(ErrorKind::Other, "failed to get name length", e))?;

        let actual = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if actual <= NAME_HEADER_LEN {
            return Err(Error::new(ErrorKind::Other, "name length too small"));
        }

        let mut buf = vec![0u8; actual];
        buf[..4].copy_from_slice(&port.to_le_bytes());
        let request = buf.clone();
        let n = device_io_control(&self.0, code, &request, &mut buf)
            .map_err(|e| Error::new_os(ErrorKind::Other, "failed to get name", e))?;

        let end = n.clamp(NAME_HEADER_LEN, buf.len());
        Ok(from_wide_until_nul(&wide_from_bytes(&buf[NAME_HEADER_LEN..end])))
    }
}

impl Hub for HubHandle {
    fn port_count(&self) -> Result<u8, Error> {
        let mut info: USB_NODE_INFORMATION = unsafe { mem::zeroed() };
        device_io_control_struct(&self.0, IOCTL_USB_GET_NODE_INFORMATION, &mut info)
            .map_err(|e| Error::new_os(ErrorKind::Other, "failed to get hub node information", e))?;
        Ok(unsafe { info.u.HubInformation.HubDescriptor.bNumberOfPorts })
    }

    fn connection(&self, port: u32) -> Result<PortConnection, Error> {
        let mut info: USB_NODE_CONNECTION_INFORMATION_EX = unsafe { mem::zeroed() };
        info.ConnectionIndex = port;
        device_io_control_struct(&self.0, IOCTL_USB_GET_NODE_CONNECTION_INFORMATION_EX, &mut info)
            .map_err(|e| {
                debug!("IOCTL_USB_GET_NODE_CONNECTION_INFORMATION_EX failed for port {port}: {e}");
                Error::new_os(ErrorKind::Other, "failed to get connection information", e)
            })?;

        let status = match info.ConnectionStatus {
            NoDeviceConnected => ConnectionStatus::NoDevice,
            DeviceConnected => ConnectionStatus::Connected,
            _ => ConnectionStatus::Failed,
        };

        let descriptor = info.DeviceDescriptor;
        Ok(PortConnection {
            port,
            status,
            device_address: info.DeviceAddress,
            is_hub: info.DeviceIsHub != 0,
            vendor_id: descriptor.idVendor,
            product_id: descriptor.idProduct,
        })
    }

    fn driver_key_name(&self, port: u32) -> Result<String, Error> {
        self.connection_name(IOCTL_USB_GET_NODE_CONNECTION_DRIVERKEY_NAME, port)
    }

    fn external_hub_name(&self, port: u32) -> Result<String, Error> {
        self.connection_name(IOCTL_USB_GET_NODE_CONNECTION_NAME, port)
    }
}
