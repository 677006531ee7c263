//! Capture session lifecycle and the background read loop.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use log::{debug, error, info};

use crate::{
    filter::AddressFilter,
    frame,
    hub::Host,
    locate::{self, LocatedDevice},
    Error, ErrorKind,
};

/// Default maximum number of bytes captured per transfer.
pub const DEFAULT_SNAPSHOT_LENGTH: u32 = 65535;

/// Default size of the driver's capture buffer and of the read buffer.
pub const DEFAULT_BUFFER_LENGTH: u32 = 1024 * 1024;

/// Settings applied to the endpoint when a session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub snapshot_length: u32,
    pub buffer_length: u32,
    pub address_filter: AddressFilter,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            snapshot_length: DEFAULT_SNAPSHOT_LENGTH,
            buffer_length: DEFAULT_BUFFER_LENGTH,
            address_filter: AddressFilter::all(),
        }
    }
}

impl SessionConfig {
    pub fn with_snapshot_length(mut self, length: u32) -> Self {
        self.snapshot_length = length;
        self
    }

    pub fn with_buffer_length(mut self, length: u32) -> Self {
        self.buffer_length = length;
        self
    }

    pub fn with_address_filter(mut self, filter: AddressFilter) -> Self {
        self.address_filter = filter;
        self
    }
}

/// Opens capture endpoints.
pub trait CaptureDriver {
    type Endpoint: CaptureEndpoint + Send + 'static;

    /// Open the endpoint at `address` for exclusive capture.
    fn open(&self, address: &str) -> Result<Self::Endpoint, Error>;
}

/// Result of [`CaptureEndpoint::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were read into the buffer.
    Data(usize),

    /// The read was woken by a [`ReadInterrupt`] before any data arrived.
    Interrupted,
}

/// Wakes a blocked [`CaptureEndpoint::read`] from another thread.
pub trait ReadInterrupt: Send + Sync {
    fn interrupt(&self);
}

/// An open capture endpoint.
///
/// Dropping the endpoint cancels outstanding I/O and closes it.
pub trait CaptureEndpoint {
    fn set_snapshot_length(&mut self, length: u32) -> Result<(), Error>;

    /// Allocate the driver's capture buffer.
    fn setup_buffer(&mut self, length: u32) -> Result<(), Error>;

    /// Begin capturing traffic of the devices selected by `filter`.
    fn start_filtering(&mut self, filter: &AddressFilter) -> Result<(), Error>;

    /// Block until data arrives or the read is interrupted.
    ///
    /// Never returns while I/O into `buf` is still in flight.
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, Error>;

    fn interrupter(&self) -> Arc<dyn ReadInterrupt>;
}

/// Receives the payloads extracted by a running session.
///
/// Called on the capture thread. The slice is only valid for the duration of
/// the call.
pub trait PayloadSink: Send + 'static {
    fn deliver(&mut self, payload: &[u8]);
}

impl<F> PayloadSink for F
where
    F: FnMut(&[u8]) + Send + 'static,
{
    fn deliver(&mut self, payload: &[u8]) {
        self(payload)
    }
}

struct Running {
    flag: Arc<AtomicBool>,
    interrupt: Arc<dyn ReadInterrupt>,
}

/// Controls capture from one endpoint.
///
/// The session reads from a dedicated thread once started. Dropping the
/// session stops the capture.
pub struct CaptureSession<D> {
    driver: D,
    config: SessionConfig,
    target: Option<String>,
    running: Option<Running>,
}

impl<D: CaptureDriver> CaptureSession<D> {
    pub fn new(driver: D) -> Self {
        Self::with_config(driver, SessionConfig::default())
    }

    pub fn with_config(driver: D, config: SessionConfig) -> Self {
        CaptureSession {
            driver,
            config,
            target: None,
            running: None,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Capture from `endpoint` on the next [`start`][Self::start].
    pub fn set_target(&mut self, endpoint: impl Into<String>) {
        self.target = Some(endpoint.into());
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| r.flag.load(Ordering::Acquire))
    }

    /// Open the target endpoint, configure it, and start the read loop.
    ///
    /// Returns once the loop thread is spawned. Payloads are passed to `sink`
    /// in arrival order until [`stop`][Self::stop] is called or a read fails.
    pub fn start(&mut self, sink: impl PayloadSink) -> Result<(), Error> {
        if self.is_running() {
            return Err(Error::new(ErrorKind::Busy, "capture session already running"));
        }

        let Some(target) = self.target.as_deref() else {
            return Err(Error::new(ErrorKind::NotFound, "no capture endpoint selected"));
        };

        let mut endpoint = self.driver.open(target)?;
        endpoint.set_snapshot_length(self.config.snapshot_length)?;
        endpoint.setup_buffer(self.config.buffer_length)?;
        endpoint.start_filtering(&self.config.address_filter)?;

        let flag = Arc::new(AtomicBool::new(true));
        let interrupt = endpoint.interrupter();
        let buffer_length = self.config.buffer_length as usize;

        let loop_flag = flag.clone();
        thread::Builder::new()
            .name("usbtap-capture".into())
            .spawn(move || read_loop(endpoint, buffer_length, &loop_flag, sink))
            .map_err(|e| {
                error!("Failed to spawn capture thread: {e}");
                Error::new(ErrorKind::Other, "failed to spawn capture thread")
            })?;

        info!("Capture started on {target}");
        self.running = Some(Running { flag, interrupt });
        Ok(())
    }

    /// Ask the read loop to exit.
    ///
    /// Wakes a blocked read but does not wait for the thread to finish.
    pub fn stop(&self) {
        let Some(running) = &self.running else {
            return;
        };
        if running.flag.swap(false, Ordering::AcqRel) {
            debug!("Stopping capture");
            running.interrupt.interrupt();
        }
    }
}

impl<D: CaptureDriver + Host> CaptureSession<D> {
    /// Search `endpoints` for a device and make its endpoint the target.
    ///
    /// On failure the target is cleared, so a later [`start`][Self::start]
    /// fails instead of capturing from a previously located endpoint. A
    /// capture that is already running is not affected.
    pub fn find_device<S: AsRef<str>>(
        &mut self,
        endpoints: &[S],
        vendor_id: u16,
        product_id: u16,
    ) -> Result<LocatedDevice, Error> {
        match locate::find_device(&self.driver, endpoints, vendor_id, product_id) {
            Ok(found) => {
                self.target = Some(found.endpoint.clone());
                Ok(found)
            }
            Err(e) => {
                self.target = None;
                Err(e)
            }
        }
    }
}

impl<D> Drop for CaptureSession<D> {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            if running.flag.swap(false, Ordering::AcqRel) {
                running.interrupt.interrupt();
            }
        }
    }
}

fn read_loop<E: CaptureEndpoint>(
    mut endpoint: E,
    buffer_length: usize,
    running: &AtomicBool,
    mut sink: impl PayloadSink,
) {
    let mut buf = vec![0; buffer_length];

    while running.load(Ordering::Acquire) {
        match endpoint.read(&mut buf) {
            Ok(ReadOutcome::Data(n)) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                let Some(data) = buf.get(..n) else {
                    error!("Read of {n} bytes overran a {buffer_length} byte buffer");
                    break;
                };
                for payload in frame::payloads(data) {
                    sink.deliver(payload);
                }
            }
            Ok(ReadOutcome::Interrupted) => continue,
            Err(e) => {
                error!("Capture read failed: {e}");
                break;
            }
        }
    }

    running.store(false, Ordering::Release);
    drop(endpoint);
    debug!("Capture loop exited");
}
