//! Seam between sessions and the host's device-capture machinery.
//!
//! A [`DeviceHost`] knows how to enumerate exportable devices and how to
//! claim one away from the host USB stack, yielding a
//! [`DeviceBackend`][crate::engine::DeviceBackend] for the URB engine.
//! The production implementation lives in the platform module; tests use
//! an in-process mock.

use std::future::Future;

use crate::device::ExportedDevice;
use crate::engine::{CompletionSink, DeviceBackend};
use crate::error::HostError;

pub trait DeviceHost: Send + Sync + 'static {
    type Backend: DeviceBackend;

    /// Verify the kernel capture driver is present and compatible. The
    /// listener refuses to begin if this fails.
    fn verify_driver(&self) -> Result<(), HostError>;

    /// Snapshot of the devices currently present, ordered by bus id.
    /// Fails only when the OS denies device-info access altogether;
    /// individual broken devices are skipped with a logged warning.
    fn enumerate(&self) -> Result<Vec<ExportedDevice>, HostError>;

    /// Divert `dev` into the capture driver and open it for exclusive
    /// I/O. Completions of transfers on the returned backend are pushed
    /// into `sink`.
    ///
    /// Dropping the returned backend releases the claim, removes the
    /// capture filter, and closes the device handles. On error, no
    /// capture filter for the device remains installed either.
    fn claim(
        &self,
        dev: &ExportedDevice,
        sink: CompletionSink,
    ) -> impl Future<Output = Result<Self::Backend, HostError>> + Send;
}
