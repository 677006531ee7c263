use std::{fmt::Display, io, num::NonZeroU32};

/// Error returned from `usbtap` operations.
#[derive(Debug, Clone)]
pub struct Error {
    pub(crate) kind: ErrorKind,
    pub(crate) code: Option<NonZeroU32>,
    pub(crate) message: &'static str,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self {
            kind,
            code: None,
            message,
        }
    }

    /// Error carrying an OS error code (`WIN32_ERROR` / `CONFIGRET` on Windows).
    #[allow(dead_code)]
    pub(crate) fn new_os(kind: ErrorKind, message: &'static str, code: u32) -> Self {
        Self {
            kind,
            code: NonZeroU32::new(code),
            message,
        }
    }

    #[track_caller]
    pub(crate) fn log_error(self) -> Self {
        log::error!("{}", self);
        self
    }

    #[track_caller]
    pub(crate) fn log_debug(self) -> Self {
        log::debug!("{}", self);
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error code from the OS, if applicable.
    ///
    /// On Windows this is the `WIN32_ERROR` value, or the `CONFIGRET` value
    /// for device registry queries.
    pub fn os_error(&self) -> Option<u32> {
        self.code.map(|c| c.get())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = self.code {
            write!(f, " (error 0x{:08x})", code.get())?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err.kind {
            ErrorKind::NoEndpoints => io::ErrorKind::NotFound,
            ErrorKind::NotFound => io::ErrorKind::NotFound,
            ErrorKind::Busy => io::ErrorKind::Other,
            ErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
            ErrorKind::InvalidInput => io::ErrorKind::InvalidInput,
            ErrorKind::SanityLimit => io::ErrorKind::InvalidData,
            ErrorKind::Other => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// General category of error as part of an [`Error`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// No capture endpoints are available.
    NoEndpoints,

    /// Requested device, endpoint, or registry node not found.
    NotFound,

    /// A capture session is already running, or the endpoint is opened by another process.
    Busy,

    /// This user or application does not have permission to open the endpoint.
    PermissionDenied,

    /// Malformed argument, such as an address list.
    InvalidInput,

    /// A device tree walk exceeded its iteration bound.
    ///
    /// The registry data is malformed or cyclic.
    SanityLimit,

    /// Uncategorized error.
    Other,
}
