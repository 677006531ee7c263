use std::ptr;

use log::debug;
use windows_sys::Win32::Devices::DeviceAndDriverInstallation::{
    CM_Get_Child, CM_Get_DevNode_Registry_PropertyW, CM_Get_Parent, CM_Get_Sibling,
    CM_Locate_DevNodeW, CM_DRP_DEVICEDESC, CM_DRP_DRIVER, CM_DRP_FRIENDLYNAME, CONFIGRET,
    CM_LOCATE_DEVNODE_NORMAL, CR_BUFFER_SMALL, CR_NO_SUCH_DEVNODE, CR_NO_SUCH_VALUE, CR_SUCCESS,
};

use crate::{
    registry::{DeviceRegistry, PropertyKind},
    Error, ErrorKind,
};

use super::util::from_wide_until_nul;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct DevInst(u32);

fn relative(cr: CONFIGRET, out: u32, message: &'static str) -> Result<Option<DevInst>, Error> {
    match cr {
        CR_SUCCESS => Ok(Some(DevInst(out))),
        CR_NO_SUCH_DEVNODE => Ok(None),
        _ => Err(Error::new_os(ErrorKind::Other, message, cr)),
    }
}

impl DevInst {
    /// Root of the device tree.
    pub fn root() -> Result<DevInst, Error> {
        let mut devinst = 0;
        let cr = unsafe { CM_Locate_DevNodeW(&mut devinst, ptr::null(), CM_LOCATE_DEVNODE_NORMAL) };
        if cr == CR_SUCCESS {
            Ok(DevInst(devinst))
        } else {
            Err(Error::new_os(ErrorKind::Other, "failed to locate device tree root", cr).log_error())
        }
    }

    pub fn parent(&self) -> Result<Option<DevInst>, Error> {
        let mut out = 0;
        let cr = unsafe { CM_Get_Parent(&mut out, self.0, 0) };
        relative(cr, out, "CM_Get_Parent failed")
    }

    pub fn first_child(&self) -> Result<Option<DevInst>, Error> {
        let mut out = 0;
        let cr = unsafe { CM_Get_Child(&mut out, self.0, 0) };
        relative(cr, out, "CM_Get_Child failed")
    }

    pub fn next_sibling(&self) -> Result<Option<DevInst>, Error> {
        let mut out = 0;
        let cr = unsafe { CM_Get_Sibling(&mut out, self.0, 0) };
        relative(cr, out, "CM_Get_Sibling failed")
    }

    /// Read a string registry property of the device node.
    ///
    /// Returns `Ok(None)` if the node has no such value.
    pub fn registry_property(&self, property: u32) -> Result<Option<String>, Error> {
        let mut buf: Vec<u16> = vec![0; 256];
        loop {
            let mut reg_type = 0;
            let mut len = (buf.len() * 2) as u32;
            let cr = unsafe {
                CM_Get_DevNode_Registry_PropertyW(
                    self.0,
                    property,
                    &mut reg_type,
                    buf.as_mut_ptr().cast(),
                    &mut len,
                    0,
                )
            };

            match cr {
                CR_SUCCESS => {
                    let units = (len as usize / 2).min(buf.len());
                    return Ok(Some(from_wide_until_nul(&buf[..units])));
                }
                CR_NO_SUCH_VALUE => return Ok(None),
                CR_BUFFER_SMALL if (len as usize / 2) > buf.len() => {
                    buf.resize(len as usize / 2, 0);
                }
                _ => {
                    debug!("CM_Get_DevNode_Registry_PropertyW({property}) failed for {self:?}, status {cr}");
                    return Err(Error::new_os(ErrorKind::Other, "failed to read device property", cr));
                }
            }
        }
    }
}

/// The Configuration Manager device tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigManager;

impl DeviceRegistry for ConfigManager {
    type Node = DevInst;

    fn root(&self) -> Result<DevInst, Error> {
        DevInst::root()
    }

    fn first_child(&self, node: DevInst) -> Result<Option<DevInst>, Error> {
        node.first_child()
    }

    fn next_sibling(&self, node: DevInst) -> Result<Option<DevInst>, Error> {
        node.next_sibling()
    }

    fn parent(&self, node: DevInst) -> Result<Option<DevInst>, Error> {
        node.parent()
    }

    fn property(&self, node: DevInst, kind: PropertyKind) -> Result<Option<String>, Error> {
        let property = match kind {
            PropertyKind::FriendlyName => CM_DRP_FRIENDLYNAME,
            PropertyKind::Description => CM_DRP_DEVICEDESC,
            PropertyKind::DriverKey => CM_DRP_DRIVER,
        };
        node.registry_property(property)
    }
}
