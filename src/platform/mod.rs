//! OS-specific device capture and I/O.
//!
//! Only Windows can export devices; the capture driver this crate talks
//! to has no counterpart elsewhere. Other platforms build the protocol
//! core without a host implementation.

#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "windows")]
pub use windows::{RegistryShareStore, WindowsBackend, WindowsHost};
