mod cfgmgr32;
pub use cfgmgr32::{ConfigManager, DevInst};

mod endpoint;
pub use endpoint::{hub_symlink, WindowsEndpoint};

mod filters;
pub use filters::{endpoint_path, list_endpoints};

mod hub;
pub use hub::HubHandle;

mod registry;
pub use registry::upper_filter_installed;

mod util;

use crate::{hub::Host, session::CaptureDriver, Error};

/// USBPcap capture endpoints, USB hubs and the Configuration Manager device tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsHost {
    registry: ConfigManager,
}

impl WindowsHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Host for WindowsHost {
    type Hub = HubHandle;
    type Registry = ConfigManager;

    fn registry(&self) -> &ConfigManager {
        &self.registry
    }

    fn root_hub_name(&self, endpoint: &str) -> Result<String, Error> {
        hub_symlink(endpoint)
    }

    fn open_hub(&self, path: &str) -> Result<HubHandle, Error> {
        HubHandle::open(path)
    }

    fn upper_filter_installed(&self) -> Result<bool, Error> {
        registry::upper_filter_installed()
    }
}

impl CaptureDriver for WindowsHost {
    type Endpoint = WindowsEndpoint;

    fn open(&self, address: &str) -> Result<WindowsEndpoint, Error> {
        WindowsEndpoint::open(address)
    }
}
