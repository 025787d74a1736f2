//! Windows host implementation: hub-walk enumeration, the capture driver
//! shim, and overlapped URB I/O through a completion port.

mod device;
mod enumeration;
mod events;
mod monitor;
mod registry;
mod setup;
mod util;

use std::{future::Future, sync::Arc};

use crate::device::ExportedDevice;
use crate::engine::CompletionSink;
use crate::error::HostError;
use crate::host::DeviceHost;

pub use device::WindowsBackend;
pub use registry::RegistryShareStore;

use monitor::Monitor;

/// [`DeviceHost`] backed by the kernel capture driver.
pub struct WindowsHost {
    monitor: Arc<Monitor>,
}

impl WindowsHost {
    /// Open the capture monitor. Fails when the driver is not installed.
    pub fn new() -> Result<WindowsHost, HostError> {
        Ok(WindowsHost {
            monitor: Monitor::open()?,
        })
    }
}

impl DeviceHost for WindowsHost {
    type Backend = WindowsBackend;

    fn verify_driver(&self) -> Result<(), HostError> {
        self.monitor.check_version()
    }

    fn enumerate(&self) -> Result<Vec<ExportedDevice>, HostError> {
        enumeration::enumerate()
    }

    fn claim(
        &self,
        dev: &ExportedDevice,
        sink: CompletionSink,
    ) -> impl Future<Output = Result<Self::Backend, HostError>> + Send {
        let monitor = self.monitor.clone();
        let dev = dev.clone();
        async move {
            let filter_id = monitor.add_filter(&dev)?;
            if let Err(e) = monitor.run_filters() {
                monitor.remove_filter(filter_id);
                return Err(e);
            }
            let claimed = match monitor::claim(&monitor, &dev, filter_id).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    monitor.remove_filter(filter_id);
                    return Err(e);
                }
            };
            // From here the filter is removed by ClaimedDevice's drop.
            WindowsBackend::new(claimed, sink)
        }
    }
}
