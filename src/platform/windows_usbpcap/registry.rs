use std::ptr::{null, null_mut};

use log::debug;
use windows_sys::Win32::{
    Foundation::{ERROR_FILE_NOT_FOUND, ERROR_SUCCESS},
    System::Registry::{
        RegCloseKey, RegOpenKeyExW, RegQueryValueExW, HKEY, HKEY_LOCAL_MACHINE, KEY_READ,
        REG_MULTI_SZ,
    },
};

use crate::{Error, ErrorKind};

use super::util::{from_wide_until_nul, to_wide};

/// Registry key of the USB device setup class.
const USB_CLASS_KEY: &str =
    "System\\CurrentControlSet\\Control\\Class\\{36FC9E60-C465-11CF-8056-444553540000}";

const USBPCAP_SERVICE: &str = "USBPcap";

pub struct RegKey(HKEY);

impl RegKey {
    pub fn open_local_machine(path: &str) -> Result<RegKey, Error> {
        let path = to_wide(path);
        let mut hkey: HKEY = null_mut();
        let r = unsafe { RegOpenKeyExW(HKEY_LOCAL_MACHINE, path.as_ptr(), 0, KEY_READ, &mut hkey) };
        if r == ERROR_SUCCESS {
            Ok(RegKey(hkey))
        } else {
            Err(Error::new_os(ErrorKind::Other, "failed to open registry key", r))
        }
    }

    /// Read a `REG_MULTI_SZ` value. Returns `Ok(None)` if the value does not exist.
    pub fn query_value_multi_sz(&self, value_name: &str) -> Result<Option<Vec<String>>, Error> {
        let value_name = to_wide(value_name);
        let mut ty = 0;
        let mut size = 0;

        // get size
        let r = unsafe {
            RegQueryValueExW(self.0, value_name.as_ptr(), null(), &mut ty, null_mut(), &mut size)
        };
        if r == ERROR_FILE_NOT_FOUND {
            return Ok(None);
        }
        if r != ERROR_SUCCESS {
            return Err(Error::new_os(ErrorKind::Other, "failed to query registry value", r));
        }
        if ty != REG_MULTI_SZ {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "registry value type not multi-string",
            ));
        }

        let mut buf: Vec<u16> = vec![0; (size as usize).div_ceil(2)];
        let r = unsafe {
            RegQueryValueExW(
                self.0,
                value_name.as_ptr(),
                null(),
                &mut ty,
                buf.as_mut_ptr().cast(),
                &mut size,
            )
        };
        if r != ERROR_SUCCESS {
            return Err(Error::new_os(ErrorKind::Other, "failed to query registry value", r));
        }

        buf.truncate(size as usize / 2);
        Ok(Some(split_multi_sz(&buf)))
    }
}

impl Drop for RegKey {
    fn drop(&mut self) {
        unsafe {
            RegCloseKey(self.0);
        }
    }
}

fn split_multi_sz(buf: &[u16]) -> Vec<String> {
    buf.split(|&c| c == 0)
        .filter(|s| !s.is_empty())
        .map(from_wide_until_nul)
        .collect()
}

/// Whether USBPcap is registered as an upper filter of the USB device class.
///
/// When it is not, capture endpoints exist but never see any traffic; this
/// usually means the driver was installed without a reboot.
pub fn upper_filter_installed() -> Result<bool, Error> {
    let key = RegKey::open_local_machine(USB_CLASS_KEY)?;
    let filters = key.query_value_multi_sz("UpperFilters")?.unwrap_or_default();
    debug!("USB class upper filters: {filters:?}");
    Ok(filters.iter().any(|f| f.eq_ignore_ascii_case(USBPCAP_SERVICE)))
}

#[test]
fn test_split_multi_sz() {
    let buf: Vec<u16> = "USBPcap\0foo\0\0".encode_utf16().collect();
    assert_eq!(split_multi_sz(&buf), vec!["USBPcap", "foo"]);
    assert!(split_multi_sz(&[0]).is_empty());
}
