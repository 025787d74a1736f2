//! A USB/IP server for Windows hosts.
//!
//! `usbipd` exports locally attached USB devices to remote USB/IP clients
//! (typically the Linux kernel's VHCI driver, possibly running inside a
//! VM on the same machine). A remote client sees an exported device as if
//! it were plugged in locally; all control, bulk, interrupt, and
//! isochronous traffic is tunneled over TCP.
//!
//! The crate is split along the attach pipeline:
//!
//! * [`wire`]: the USB/IP wire codec (big-endian, version `0x0111`).
//! * [`engine`]: the per-attachment URB engine, multiplexing in-flight
//!   transfers and resolving unlink/complete races.
//! * [`Session`]: per-connection protocol state machine, handling the
//!   device list and import operations and then command mode.
//! * [`Server`]: the TCP listener on port 3240.
//! * [`ShareRegistry`]: which devices are shared, plus transient attach
//!   state.
//! * [`DeviceHost`]: the seam to the host's capture machinery. The
//!   Windows implementation claims devices through the kernel capture
//!   driver; everything above it is platform-independent.
//!
//! Device capture is only available on Windows; on other platforms the
//! crate builds the protocol core only (useful for testing and for
//! embedding the codec).
//!
//! ## Logging
//!
//! `usbipd` uses the [`log`](https://docs.rs/log) crate. The bundled
//! binary installs `env_logger`; set `RUST_LOG=usbipd=debug` to see
//! protocol-level detail.

mod device;
pub use device::{is_valid_bus_id, ExportedDevice, InterfaceClass, Speed, BUS_ID_MAX};

mod error;
pub use error::{HostError, HostErrorKind};

pub mod wire;

pub mod engine;

mod host;
pub use host::DeviceHost;

mod registry;
pub use registry::{
    AttachError, MemoryStore, PersistedShare, ShareRecord, ShareRegistry, ShareStore,
};

mod session;
pub use session::{Session, SessionContext};

mod server;
pub use server::Server;

pub mod config;
pub use config::Config;

mod platform;
#[cfg(target_os = "windows")]
pub use platform::{RegistryShareStore, WindowsBackend, WindowsHost};
