use std::{fmt::Display, io, num::NonZeroU32};

/// Error returned from host-side operations: enumeration, filter
/// installation, and claiming a device away from the host USB stack.
#[derive(Debug, Clone)]
pub struct HostError {
    pub(crate) kind: HostErrorKind,
    pub(crate) code: Option<NonZeroU32>,
    pub(crate) message: &'static str,
}

impl HostError {
    pub(crate) fn new(kind: HostErrorKind, message: &'static str) -> Self {
        Self {
            kind,
            code: None,
            message,
        }
    }

    #[allow(unused)]
    pub(crate) fn new_os(kind: HostErrorKind, message: &'static str, code: u32) -> Self {
        Self {
            kind,
            code: NonZeroU32::new(code),
            message,
        }
    }

    #[allow(unused)]
    #[track_caller]
    pub(crate) fn log_error(self) -> Self {
        log::error!("{}", self);
        self
    }

    #[allow(unused)]
    #[track_caller]
    pub(crate) fn log_debug(self) -> Self {
        log::debug!("{}", self);
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> HostErrorKind {
        self.kind
    }

    /// Get the status code reported by the OS or the filter driver, if
    /// applicable.
    pub fn os_error(&self) -> Option<u32> {
        self.code.map(|c| c.get())
    }
}

impl Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = self.code {
            write!(f, " (error {:#010x})", code.get())?;
        }
        Ok(())
    }
}

impl std::error::Error for HostError {}

impl From<HostError> for io::Error {
    fn from(err: HostError) -> Self {
        let kind = match err.kind {
            HostErrorKind::DeviceGone => io::ErrorKind::NotConnected,
            HostErrorKind::NotClaimable => io::ErrorKind::Other,
            HostErrorKind::Timeout => io::ErrorKind::TimedOut,
            HostErrorKind::EnumerationFailed => io::ErrorKind::PermissionDenied,
            HostErrorKind::UnsupportedDriver => io::ErrorKind::Unsupported,
            HostErrorKind::FilterRejected => io::ErrorKind::Other,
            HostErrorKind::Other => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// General category of error as part of a [`HostError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HostErrorKind {
    /// The kernel filter driver's version does not match this build.
    ///
    /// Fatal at startup: the listener refuses to begin.
    UnsupportedDriver,

    /// The filter driver refused to install a capture filter. The status
    /// code it reported is in [`HostError::os_error`].
    FilterRejected,

    /// The device re-enumerated under the capture driver but refused the
    /// claim request.
    NotClaimable,

    /// The device did not re-enumerate under the capture driver within the
    /// claim window.
    Timeout,

    /// Device disappeared during claim or operation.
    DeviceGone,

    /// The OS denied access to device information during enumeration.
    EnumerationFailed,

    /// Uncategorized error.
    Other,
}
