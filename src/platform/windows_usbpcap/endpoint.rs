use std::{
    mem,
    os::windows::{
        io::HandleOrNull,
        prelude::{OwnedHandle, RawHandle},
    },
    ptr,
    sync::Arc,
};

use log::{debug, error};
use windows_sys::Win32::{
    Foundation::{
        GetLastError, ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_IO_PENDING,
        ERROR_OPERATION_ABORTED, ERROR_SHARING_VIOLATION, FALSE, GENERIC_READ, GENERIC_WRITE,
        TRUE, WAIT_OBJECT_0, WIN32_ERROR,
    },
    Storage::FileSystem::{ReadFile, FILE_FLAG_OVERLAPPED},
    System::{
        Threading::{CreateEventW, ResetEvent, SetEvent, WaitForMultipleObjects, INFINITE},
        IO::{CancelIo, CancelIoEx, GetOverlappedResult, OVERLAPPED},
    },
};

use crate::{
    filter::AddressFilter,
    session::{CaptureEndpoint, ReadInterrupt, ReadOutcome},
    Error, ErrorKind,
};

use super::util::{
    create_file, device_io_control, from_wide_until_nul, raw_handle, wide_from_bytes,
};

const FILE_DEVICE_UNKNOWN: u32 = 0x22;
const METHOD_BUFFERED: u32 = 0;
const FILE_ANY_ACCESS: u32 = 0;
const FILE_READ_ACCESS: u32 = 1;
const FILE_WRITE_ACCESS: u32 = 2;

const fn ctl_code(function: u32, access: u32) -> u32 {
    (FILE_DEVICE_UNKNOWN << 16) | (access << 14) | (function << 2) | METHOD_BUFFERED
}

pub const IOCTL_USBPCAP_SETUP_BUFFER: u32 = ctl_code(0x800, FILE_READ_ACCESS);
pub const IOCTL_USBPCAP_START_FILTERING: u32 =
    ctl_code(0x801, FILE_READ_ACCESS | FILE_WRITE_ACCESS);
pub const IOCTL_USBPCAP_STOP_FILTERING: u32 =
    ctl_code(0x802, FILE_READ_ACCESS | FILE_WRITE_ACCESS);
pub const IOCTL_USBPCAP_GET_HUB_SYMLINK: u32 = ctl_code(0x803, FILE_ANY_ACCESS);
pub const IOCTL_USBPCAP_SET_SNAPLEN_SIZE: u32 = ctl_code(0x804, FILE_READ_ACCESS);

/// Output buffer size for the hub symlink, in bytes.
const SYMLINK_BUFFER_LEN: usize = 2048;

fn open_error(e: WIN32_ERROR) -> Error {
    match e {
        ERROR_FILE_NOT_FOUND => Error::new_os(ErrorKind::NotFound, "capture endpoint not found", e),
        ERROR_ACCESS_DENIED => {
            Error::new_os(ErrorKind::PermissionDenied, "access denied opening capture endpoint", e)
        }
        ERROR_SHARING_VIOLATION => {
            Error::new_os(ErrorKind::Busy, "capture endpoint is in use", e)
        }
        _ => Error::new_os(ErrorKind::Other, "couldn't open capture endpoint", e),
    }
}

/// Name of the root hub a capture endpoint is attached to, e.g.
/// `\??\USB#ROOT_HUB30#...`.
///
/// The endpoint is opened without read or write access, so this works while
/// another process is capturing from it.
pub fn hub_symlink(endpoint: &str) -> Result<String, Error> {
    let handle = create_file(endpoint, 0, 0, 0).map_err(open_error)?;

    let mut buf = vec![0u8; SYMLINK_BUFFER_LEN];
    let n = device_io_control(&handle, IOCTL_USBPCAP_GET_HUB_SYMLINK, &[], &mut buf)
        .map_err(|e| Error::new_os(ErrorKind::Other, "failed to get hub symlink", e))?;

    if n == 0 {
        return Err(Error::new(ErrorKind::NotFound, "capture endpoint has no hub symlink"));
    }
    Ok(from_wide_until_nul(&wide_from_bytes(&buf[..n])))
}

/// Manual-reset event.
pub struct Event(OwnedHandle);

impl Event {
    pub fn new() -> Result<Event, Error> {
        unsafe {
            let h = CreateEventW(ptr::null(), TRUE, FALSE, ptr::null());
            match HandleOrNull::from_raw_handle(h as RawHandle).try_into() {
                Ok(handle) => Ok(Event(handle)),
                Err(_) => Err(Error::new_os(
                    ErrorKind::Other,
                    "failed to create event",
                    GetLastError(),
                )
                .log_error()),
            }
        }
    }

    fn set(&self) {
        unsafe {
            SetEvent(raw_handle(&self.0));
        }
    }

    fn reset(&self) {
        unsafe {
            ResetEvent(raw_handle(&self.0));
        }
    }
}

impl ReadInterrupt for Event {
    fn interrupt(&self) {
        self.set();
    }
}

/// An open USBPcap control device.
pub struct WindowsEndpoint {
    handle: OwnedHandle,
    read_event: Event,
    stop_event: Arc<Event>,
}

impl WindowsEndpoint {
    /// Open `address` exclusively for capture.
    pub fn open(address: &str) -> Result<WindowsEndpoint, Error> {
        let handle = create_file(
            address,
            GENERIC_READ | GENERIC_WRITE,
            0,
            FILE_FLAG_OVERLAPPED,
        )
        .map_err(|e| open_error(e).log_error())?;

        debug!("Opened capture endpoint {address}");
        Ok(WindowsEndpoint {
            handle,
            read_event: Event::new()?,
            stop_event: Arc::new(Event::new()?),
        })
    }

    fn control(&mut self, code: u32, input: &[u8], message: &'static str) -> Result<(), Error> {
        device_io_control(&self.handle, code, input, &mut [])
            .map(|_| ())
            .map_err(|e| Error::new_os(ErrorKind::Other, message, e).log_error())
    }
}

impl CaptureEndpoint for WindowsEndpoint {
    fn set_snapshot_length(&mut self, length: u32) -> Result<(), Error> {
        self.control(
            IOCTL_USBPCAP_SET_SNAPLEN_SIZE,
            &length.to_le_bytes(),
            "failed to set snapshot length",
        )
    }

    fn setup_buffer(&mut self, length: u32) -> Result<(), Error> {
        self.control(
            IOCTL_USBPCAP_SETUP_BUFFER,
            &length.to_le_bytes(),
            "failed to set up capture buffer",
        )
    }

    fn start_filtering(&mut self, filter: &AddressFilter) -> Result<(), Error> {
        self.control(
            IOCTL_USBPCAP_START_FILTERING,
            &filter.to_bytes(),
            "failed to start filtering",
        )
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, Error> {
        let handle = raw_handle(&self.handle);
        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);

        self.read_event.reset();
        let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
        overlapped.hEvent = raw_handle(&self.read_event.0);

        unsafe {
            let r = ReadFile(handle, buf.as_mut_ptr(), len, ptr::null_mut(), &mut overlapped);
            if r == FALSE {
                let err = GetLastError();
                if err != ERROR_IO_PENDING {
                    return Err(Error::new_os(ErrorKind::Other, "ReadFile failed", err));
                }
            }

            let events = [raw_handle(&self.read_event.0), raw_handle(&self.stop_event.0)];
            let w = WaitForMultipleObjects(events.len() as u32, events.as_ptr(), FALSE, INFINITE);

            let interrupted = if w == WAIT_OBJECT_0 {
                false
            } else if w == WAIT_OBJECT_0 + 1 {
                CancelIoEx(handle, &overlapped);
                true
            } else {
                let err = GetLastError();
                error!("WaitForMultipleObjects failed: {err}");
                CancelIoEx(handle, &overlapped);
                let mut transferred = 0;
                GetOverlappedResult(handle, &overlapped, &mut transferred, TRUE);
                return Err(Error::new_os(ErrorKind::Other, "wait for capture data failed", err));
            };

            // the overlapped structure and buffer must outlive the I/O
            let mut transferred = 0;
            let r = GetOverlappedResult(handle, &overlapped, &mut transferred, TRUE);
            if r == FALSE {
                let err = GetLastError();
                if interrupted && err == ERROR_OPERATION_ABORTED {
                    return Ok(ReadOutcome::Interrupted);
                }
                return Err(Error::new_os(ErrorKind::Other, "capture read failed", err));
            }

            if interrupted && transferred == 0 {
                Ok(ReadOutcome::Interrupted)
            } else {
                Ok(ReadOutcome::Data(transferred as usize))
            }
        }
    }

    fn interrupter(&self) -> Arc<dyn ReadInterrupt> {
        self.stop_event.clone()
    }
}

impl Drop for WindowsEndpoint {
    fn drop(&mut self) {
        unsafe {
            CancelIo(raw_handle(&self.handle));
        }
        if let Err(e) = device_io_control(&self.handle, IOCTL_USBPCAP_STOP_FILTERING, &[], &mut []) {
            debug!("IOCTL_USBPCAP_STOP_FILTERING failed: {e}");
        }
        debug!("Closed capture endpoint");
    }
}
