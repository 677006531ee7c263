//! In-memory doubles for the registry, hubs and capture endpoints.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    filter::AddressFilter,
    frame,
    hub::{ConnectionStatus, Host, Hub, PortConnection},
    registry::{DeviceRegistry, PropertyKind},
    session::{CaptureDriver, CaptureEndpoint, ReadInterrupt, ReadOutcome},
    Error, ErrorKind,
};

#[derive(Default)]
struct MockNode {
    parent: Option<usize>,
    children: Vec<usize>,
    friendly_name: Option<String>,
    description: Option<String>,
    driver_key: Option<String>,
    sibling_override: Option<usize>,
    fail_sibling: bool,
}

/// Registry tree; node 0 is the root.
pub struct MockRegistry {
    nodes: Vec<MockNode>,
}

impl MockRegistry {
    pub fn new() -> Self {
        MockRegistry {
            nodes: vec![MockNode::default()],
        }
    }

    pub fn add_unnamed(&mut self, parent: usize) -> usize {
        let id = self.nodes.len();
        self.nodes.push(MockNode {
            parent: Some(parent),
            ..Default::default()
        });
        self.nodes[parent].children.push(id);
        id
    }

    pub fn add(&mut self, parent: usize, description: &str) -> usize {
        let id = self.add_unnamed(parent);
        self.nodes[id].description = Some(description.into());
        id
    }

    pub fn set_friendly_name(&mut self, node: usize, name: &str) {
        self.nodes[node].friendly_name = Some(name.into());
    }

    pub fn set_driver_key(&mut self, node: usize, key: &str) {
        self.nodes[node].driver_key = Some(key.into());
    }

    pub fn set_sibling_override(&mut self, node: usize, sibling: usize) {
        self.nodes[node].sibling_override = Some(sibling);
    }

    pub fn fail_sibling(&mut self, node: usize) {
        self.nodes[node].fail_sibling = true;
    }
}

impl DeviceRegistry for MockRegistry {
    type Node = usize;

    fn root(&self) -> Result<usize, Error> {
        Ok(0)
    }

    fn first_child(&self, node: usize) -> Result<Option<usize>, Error> {
        Ok(self.nodes[node].children.first().copied())
    }

    fn next_sibling(&self, node: usize) -> Result<Option<usize>, Error> {
        let n = &self.nodes[node];
        if n.fail_sibling {
            return Err(Error::new(ErrorKind::Other, "sibling query failed"));
        }
        if let Some(s) = n.sibling_override {
            return Ok(Some(s));
        }
        let Some(parent) = n.parent else {
            return Ok(None);
        };
        let siblings = &self.nodes[parent].children;
        let pos = siblings.iter().position(|&c| c == node);
        Ok(pos.and_then(|p| siblings.get(p + 1).copied()))
    }

    fn parent(&self, node: usize) -> Result<Option<usize>, Error> {
        Ok(self.nodes[node].parent)
    }

    fn property(&self, node: usize, kind: PropertyKind) -> Result<Option<String>, Error> {
        let n = &self.nodes[node];
        Ok(match kind {
            PropertyKind::FriendlyName => n.friendly_name.clone(),
            PropertyKind::Description => n.description.clone(),
            PropertyKind::DriverKey => n.driver_key.clone(),
        })
    }
}

#[derive(Clone)]
pub struct MockPort {
    pub connection: PortConnection,
    pub driver_key: Option<String>,
    pub hub_name: Option<String>,
}

#[derive(Clone, Default)]
pub struct MockHub {
    pub ports: Vec<Option<MockPort>>,
    pub fail_port_count: bool,
    /// Ports whose connection query fails.
    pub fail_connection: HashSet<u32>,
}

impl MockHub {
    /// Hub with `count` empty ports.
    pub fn with_ports(count: usize) -> Self {
        MockHub {
            ports: vec![None; count],
            fail_port_count: false,
            fail_connection: HashSet::new(),
        }
    }

    pub fn attach(&mut self, port: u32, connection: PortConnection, driver_key: Option<&str>) {
        self.ports[port as usize - 1] = Some(MockPort {
            connection: PortConnection { port, ..connection },
            driver_key: driver_key.map(String::from),
            hub_name: None,
        });
    }

    pub fn attach_hub(&mut self, port: u32, address: u16, driver_key: Option<&str>, name: &str) {
        self.ports[port as usize - 1] = Some(MockPort {
            connection: PortConnection {
                port,
                status: ConnectionStatus::Connected,
                device_address: address,
                is_hub: true,
                vendor_id: 0x05e3,
                product_id: 0x0610,
            },
            driver_key: driver_key.map(String::from),
            hub_name: Some(name.into()),
        });
    }
}

pub fn device(address: u16, vendor_id: u16, product_id: u16) -> PortConnection {
    PortConnection {
        port: 0,
        status: ConnectionStatus::Connected,
        device_address: address,
        is_hub: false,
        vendor_id,
        product_id,
    }
}

impl Hub for MockHub {
    fn port_count(&self) -> Result<u8, Error> {
        if self.fail_port_count {
            return Err(Error::new(ErrorKind::Other, "node information failed"));
        }
        Ok(self.ports.len() as u8)
    }

    fn connection(&self, port: u32) -> Result<PortConnection, Error> {
        if self.fail_connection.contains(&port) {
            return Err(Error::new_os(ErrorKind::Other, "connection query failed", 31));
        }
        match self.ports.get(port as usize - 1) {
            Some(Some(p)) => Ok(p.connection.clone()),
            Some(None) => Ok(PortConnection {
                port,
                status: ConnectionStatus::NoDevice,
                device_address: 0,
                is_hub: false,
                vendor_id: 0,
                product_id: 0,
            }),
            None => Err(Error::new(ErrorKind::Other, "connection query failed")),
        }
    }

    fn driver_key_name(&self, port: u32) -> Result<String, Error> {
        self.ports[port as usize - 1]
            .as_ref()
            .and_then(|p| p.driver_key.clone())
            .ok_or(Error::new(ErrorKind::NotFound, "no driver key"))
    }

    fn external_hub_name(&self, port: u32) -> Result<String, Error> {
        self.ports[port as usize - 1]
            .as_ref()
            .and_then(|p| p.hub_name.clone())
            .ok_or(Error::new(ErrorKind::NotFound, "no hub name"))
    }
}

/// Host with capture endpoints mapped to root hubs, keyed by device path.
pub struct MockHost {
    pub registry: MockRegistry,
    pub symlinks: HashMap<String, String>,
    pub hubs: HashMap<String, MockHub>,
    pub queried: RefCell<Vec<String>>,
    pub opened: RefCell<Vec<String>>,
    /// Result of the upper filter check; `None` makes it fail.
    pub upper_filter: Option<bool>,
    pub upper_filter_checked: Cell<bool>,
}

impl MockHost {
    pub fn new(registry: MockRegistry) -> Self {
        MockHost {
            registry,
            symlinks: HashMap::new(),
            hubs: HashMap::new(),
            queried: RefCell::new(Vec::new()),
            opened: RefCell::new(Vec::new()),
            upper_filter: Some(true),
            upper_filter_checked: Cell::new(false),
        }
    }

    /// Register `endpoint` whose root hub symlink is `\??\{hub}`.
    pub fn add_endpoint(&mut self, endpoint: &str, hub: &str, root: MockHub) {
        self.symlinks
            .insert(endpoint.into(), format!("\\??\\{hub}"));
        self.hubs.insert(format!("\\\\.\\{hub}"), root);
    }

    pub fn add_hub(&mut self, name: &str, hub: MockHub) {
        self.hubs.insert(format!("\\\\.\\{name}"), hub);
    }
}

impl Host for MockHost {
    type Hub = MockHub;
    type Registry = MockRegistry;

    fn registry(&self) -> &MockRegistry {
        &self.registry
    }

    fn root_hub_name(&self, endpoint: &str) -> Result<String, Error> {
        self.queried.borrow_mut().push(endpoint.into());
        self.symlinks
            .get(endpoint)
            .cloned()
            .ok_or(Error::new(ErrorKind::NotFound, "no such endpoint"))
    }

    fn open_hub(&self, path: &str) -> Result<MockHub, Error> {
        self.opened.borrow_mut().push(path.into());
        self.hubs
            .get(path)
            .cloned()
            .ok_or(Error::new(ErrorKind::NotFound, "unable to open hub"))
    }

    fn upper_filter_installed(&self) -> Result<bool, Error> {
        self.upper_filter_checked.set(true);
        self.upper_filter
            .ok_or(Error::new(ErrorKind::PermissionDenied, "failed to open registry key"))
    }
}

/// Scripted result of one endpoint read.
pub enum Script {
    Data(Vec<u8>),
    Fail,
    Wake,
}

/// Which session setup request should fail.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SetupStep {
    SnapshotLength,
    Buffer,
    Filtering,
}

#[derive(Default)]
pub struct EndpointLog {
    pub calls: Vec<String>,
    pub buffer_len: Option<usize>,
}

pub struct MockEndpoint {
    rx: mpsc::Receiver<Script>,
    tx: mpsc::Sender<Script>,
    fail: Option<SetupStep>,
    log: Arc<Mutex<EndpointLog>>,
    closed: Arc<AtomicBool>,
}

struct MockInterrupt(Mutex<mpsc::Sender<Script>>);

impl ReadInterrupt for MockInterrupt {
    fn interrupt(&self) {
        let _ = self.0.lock().unwrap().send(Script::Wake);
    }
}

impl CaptureEndpoint for MockEndpoint {
    fn set_snapshot_length(&mut self, length: u32) -> Result<(), Error> {
        self.step(SetupStep::SnapshotLength, format!("snaplen {length}"))
    }

    fn setup_buffer(&mut self, length: u32) -> Result<(), Error> {
        self.step(SetupStep::Buffer, format!("buffer {length}"))
    }

    fn start_filtering(&mut self, filter: &AddressFilter) -> Result<(), Error> {
        self.step(
            SetupStep::Filtering,
            format!("filter all={}", filter.filters_all()),
        )
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, Error> {
        self.log.lock().unwrap().buffer_len = Some(buf.len());
        match self.rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Script::Data(data)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(ReadOutcome::Data(data.len()))
            }
            Ok(Script::Wake) => Ok(ReadOutcome::Interrupted),
            Ok(Script::Fail) | Err(_) => Err(Error::new(ErrorKind::Other, "wait failed")),
        }
    }

    fn interrupter(&self) -> Arc<dyn ReadInterrupt> {
        Arc::new(MockInterrupt(Mutex::new(self.tx.clone())))
    }
}

impl MockEndpoint {
    fn step(&mut self, step: SetupStep, call: String) -> Result<(), Error> {
        self.log.lock().unwrap().calls.push(call);
        if self.fail == Some(step) {
            Err(Error::new_os(ErrorKind::Other, "DeviceIoControl failed", 31))
        } else {
            Ok(())
        }
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Driver handing out one scripted endpoint per `open`.
///
/// Feed reads through the sender returned by [`MockDriver::new`].
pub struct MockDriver {
    pending: Mutex<Option<(mpsc::Sender<Script>, mpsc::Receiver<Script>)>>,
    pub fail_open: bool,
    pub fail_step: Option<SetupStep>,
    pub log: Arc<Mutex<EndpointLog>>,
    pub closed: Arc<AtomicBool>,
    pub opened: Mutex<Vec<String>>,
    pub host: Option<MockHost>,
}

impl MockDriver {
    pub fn new() -> (Self, mpsc::Sender<Script>) {
        let (tx, rx) = mpsc::channel();
        let driver = MockDriver {
            pending: Mutex::new(Some((tx.clone(), rx))),
            fail_open: false,
            fail_step: None,
            log: Arc::new(Mutex::new(EndpointLog::default())),
            closed: Arc::new(AtomicBool::new(false)),
            opened: Mutex::new(Vec::new()),
            host: None,
        };
        (driver, tx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Poll until the endpoint has been dropped.
    pub fn wait_closed(&self) -> bool {
        wait_until(|| self.is_closed())
    }
}

impl CaptureDriver for MockDriver {
    type Endpoint = MockEndpoint;

    fn open(&self, address: &str) -> Result<MockEndpoint, Error> {
        self.opened.lock().unwrap().push(address.into());
        if self.fail_open {
            return Err(Error::new_os(ErrorKind::PermissionDenied, "couldn't open device", 5));
        }
        let (tx, rx) = self
            .pending
            .lock()
            .unwrap()
            .take()
            .expect("mock driver opened twice");
        Ok(MockEndpoint {
            rx,
            tx,
            fail: self.fail_step,
            log: self.log.clone(),
            closed: self.closed.clone(),
        })
    }
}

impl Host for MockDriver {
    type Hub = MockHub;
    type Registry = MockRegistry;

    fn registry(&self) -> &MockRegistry {
        self.host.as_ref().unwrap().registry()
    }

    fn root_hub_name(&self, endpoint: &str) -> Result<String, Error> {
        self.host.as_ref().unwrap().root_hub_name(endpoint)
    }

    fn open_hub(&self, path: &str) -> Result<MockHub, Error> {
        self.host.as_ref().unwrap().open_hub(path)
    }

    fn upper_filter_installed(&self) -> Result<bool, Error> {
        self.host.as_ref().unwrap().upper_filter_installed()
    }
}

/// Poll `f` for up to two seconds.
pub fn wait_until(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    f()
}

/// pcap global header as sent by the driver when capture starts.
pub fn global_header() -> Vec<u8> {
    let mut b = Vec::new();
    b.extend_from_slice(&frame::PCAP_MAGIC.to_le_bytes());
    b.extend_from_slice(&2u16.to_le_bytes());
    b.extend_from_slice(&4u16.to_le_bytes());
    b.extend_from_slice(&[0; 8]);
    b.extend_from_slice(&65535u32.to_le_bytes());
    b.extend_from_slice(&frame::LINKTYPE_USBPCAP.to_le_bytes());
    b
}

/// Bulk IN record carrying `data`.
pub fn bulk_record(data: &[u8]) -> Vec<u8> {
    let incl_len = (frame::PACKET_HEADER_LEN + data.len()) as u32;
    let mut b = Vec::new();
    b.extend_from_slice(&[0; 8]);
    b.extend_from_slice(&incl_len.to_le_bytes());
    b.extend_from_slice(&incl_len.to_le_bytes());
    b.extend_from_slice(&(frame::PACKET_HEADER_LEN as u16).to_le_bytes());
    b.extend_from_slice(&[0; 12]);
    b.extend_from_slice(&frame::URB_FUNCTION_BULK_OR_INTERRUPT_TRANSFER.to_le_bytes());
    b.push(1);
    b.extend_from_slice(&1u16.to_le_bytes());
    b.extend_from_slice(&5u16.to_le_bytes());
    b.push(0x82);
    b.push(3);
    b.extend_from_slice(&(data.len() as u32).to_le_bytes());
    b.extend_from_slice(data);
    b
}
