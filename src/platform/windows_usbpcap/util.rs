use std::{
    ffi::{c_void, OsStr, OsString},
    mem,
    os::windows::prelude::{
        AsHandle, AsRawHandle, HandleOrInvalid, OsStrExt, OsStringExt, OwnedHandle, RawHandle,
    },
    ptr::{null, null_mut},
};

use windows_sys::Win32::{
    Foundation::{GetLastError, HANDLE, WIN32_ERROR},
    Storage::FileSystem::{CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_MODE, OPEN_EXISTING},
    System::IO::DeviceIoControl,
};

/// Wrapper around `CreateFile`
pub fn create_file(
    path: &str,
    access: u32,
    share: FILE_SHARE_MODE,
    flags: FILE_FLAGS_AND_ATTRIBUTES,
) -> Result<OwnedHandle, WIN32_ERROR> {
    let wide_name = to_wide(path);

    unsafe {
        let r = CreateFileW(
            wide_name.as_ptr(),
            access,
            share,
            null(),
            OPEN_EXISTING,
            flags,
            null_mut(),
        );
        HandleOrInvalid::from_raw_handle(r as RawHandle)
            .try_into()
            .map_err(|_| GetLastError())
    }
}

pub fn raw_handle(h: impl AsHandle) -> HANDLE {
    h.as_handle().as_raw_handle() as HANDLE
}

/// Null-terminated UTF-16 copy of `s`.
pub fn to_wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(Some(0)).collect()
}

/// Decode UTF-16 up to the first nul, or the whole slice if there is none.
pub fn from_wide_until_nul(s: &[u16]) -> String {
    let end = s.iter().position(|&c| c == 0).unwrap_or(s.len());
    OsString::from_wide(&s[..end]).to_string_lossy().into_owned()
}

/// Reinterpret little-endian bytes returned by an ioctl as UTF-16 units.
pub fn wide_from_bytes(b: &[u8]) -> Vec<u16> {
    b.chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Synchronous buffered `DeviceIoControl`, returning the number of bytes written to `output`.
pub fn device_io_control(
    handle: &OwnedHandle,
    code: u32,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize, WIN32_ERROR> {
    let mut bytes_returned: u32 = 0;
    let r = unsafe {
        DeviceIoControl(
            raw_handle(handle),
            code,
            if input.is_empty() {
                null()
            } else {
                input.as_ptr() as *const c_void
            },
            input.len() as u32,
            if output.is_empty() {
                null_mut()
            } else {
                output.as_mut_ptr() as *mut c_void
            },
            output.len() as u32,
            &mut bytes_returned,
            null_mut(),
        )
    };

    if r != 0 {
        Ok(bytes_returned as usize)
    } else {
        Err(unsafe { GetLastError() })
    }
}

/// `DeviceIoControl` with a fixed-size structure as both input and output.
pub fn device_io_control_struct<T: Copy>(
    handle: &OwnedHandle,
    code: u32,
    value: &mut T,
) -> Result<(), WIN32_ERROR> {
    let mut bytes_returned: u32 = 0;
    let size = mem::size_of::<T>() as u32;
    let r = unsafe {
        DeviceIoControl(
            raw_handle(handle),
            code,
            value as *const T as *const c_void,
            size,
            value as *mut T as *mut c_void,
            size,
            &mut bytes_returned,
            null_mut(),
        )
    };

    if r != 0 {
        Ok(())
    } else {
        Err(unsafe { GetLastError() })
    }
}

#[test]
fn test_wide_strings() {
    assert_eq!(to_wide("ab"), vec![b'a' as u16, b'b' as u16, 0]);
    assert_eq!(from_wide_until_nul(&[b'h' as u16, b'i' as u16, 0, b'x' as u16]), "hi");
    assert_eq!(from_wide_until_nul(&[b'h' as u16]), "h");
    assert_eq!(wide_from_bytes(&[b'\\', 0, b'?', 0, 1]), vec![b'\\' as u16, b'?' as u16]);
}
