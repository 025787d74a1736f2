//! Shim over the kernel capture driver.
//!
//! The driver has two faces: a monitor control device that manages the
//! set of capture filters, and a per-device interface that appears once a
//! filtered device has re-enumerated under the capture stack. Installing
//! a filter and running the filter set physically re-enumerates the
//! matched device, so claiming is a bounded poll: the device interface
//! shows up only when re-enumeration has finished.

use std::{ffi::OsStr, mem, slice, sync::Arc, time::Duration};

use log::{debug, info, warn};
use windows_sys::core::GUID;

use crate::device::ExportedDevice;
use crate::error::{HostError, HostErrorKind};

use super::device::ClaimedDevice;
use super::setup;
use super::util::{create_file, raw_handle, sync_ioctl, WCString};

/// Control device exposed by the capture monitor driver.
const MONITOR_PATH: &str = r"\\.\UsbCaptureMon";

/// Device interface class of captured devices.
pub(super) const GUID_DEVINTERFACE_USB_CAPTURE: GUID =
    GUID::from_u128(0xa45f4672_6a10_4d56_a3c7_91b38a0d4e9f);

/// Driver interface version this build speaks. The major must match
/// exactly; the driver's minor must be at least this.
const MONITOR_MAJOR_VERSION: u32 = 5;
const MONITOR_MINOR_VERSION: u32 = 0;
pub(super) const DEVICE_MAJOR_VERSION: u32 = 5;
pub(super) const DEVICE_MINOR_VERSION: u32 = 0;

// Control codes: FILE_DEVICE_UNKNOWN, METHOD_BUFFERED, FILE_WRITE_ACCESS.
const fn ctl_code(function: u32) -> u32 {
    (0x22 << 16) | (2 << 14) | (function << 2)
}

const IOCTL_MONITOR_GET_VERSION: u32 = ctl_code(0x601);
const IOCTL_MONITOR_ADD_FILTER: u32 = ctl_code(0x602);
const IOCTL_MONITOR_REMOVE_FILTER: u32 = ctl_code(0x603);
const IOCTL_MONITOR_RUN_FILTERS: u32 = ctl_code(0x604);
const IOCTL_MONITOR_CHECK_DEVICE: u32 = ctl_code(0x605);

pub(super) const IOCTL_DEVICE_GET_VERSION: u32 = ctl_code(0x611);
pub(super) const IOCTL_DEVICE_IS_OPERATIONAL: u32 = ctl_code(0x612);
pub(super) const IOCTL_DEVICE_GET_INFO: u32 = ctl_code(0x613);
pub(super) const IOCTL_DEVICE_CLAIM: u32 = ctl_code(0x614);
pub(super) const IOCTL_DEVICE_RELEASE: u32 = ctl_code(0x615);
pub(super) const IOCTL_DEVICE_SUBMIT_URB: u32 = ctl_code(0x616);

#[repr(C)]
#[derive(Default)]
pub(super) struct DriverVersion {
    pub major: u32,
    pub minor: u32,
}

/// Filter field match kinds.
const MATCH_NUM_EXACT: u16 = 1;

/// Filter field indices. Order is part of the driver ABI.
const FIELD_VENDOR_ID: usize = 0;
const FIELD_PRODUCT_ID: usize = 1;
const FIELD_DEVICE_REV: usize = 2;
const FIELD_CLASS: usize = 3;
const FIELD_SUBCLASS: usize = 4;
const FIELD_PROTOCOL: usize = 5;
const FIELD_PORT: usize = 6;
const FILTER_FIELD_COUNT: usize = 7;

/// Filter type: divert the matched device to the capture stack.
const FILTER_TYPE_CAPTURE: u32 = 1;

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct FilterField {
    match_kind: u16,
    value: u16,
}

#[repr(C)]
struct CaptureFilter {
    filter_type: u32,
    fields: [FilterField; FILTER_FIELD_COUNT],
}

#[repr(C)]
#[derive(Default)]
struct AddFilterReply {
    filter_id: u64,
    rc: u32,
    _reserved: u32,
}

#[repr(C)]
#[derive(Default)]
struct CheckDeviceRequest {
    hdevice: u64,
}

#[repr(C)]
#[derive(Default)]
struct CheckDeviceReply {
    filter_id: u64,
}

#[repr(C)]
#[derive(Default)]
pub(super) struct DeviceInfoReply {
    pub hdevice: u64,
    pub hub: u32,
    pub port: u32,
}

#[repr(C)]
#[derive(Default)]
pub(super) struct BoolReply {
    pub value: u32,
}

pub(super) fn struct_bytes<T>(v: &T) -> &[u8] {
    unsafe { slice::from_raw_parts(v as *const T as *const u8, mem::size_of::<T>()) }
}

pub(super) fn struct_bytes_mut<T>(v: &mut T) -> &mut [u8] {
    unsafe { slice::from_raw_parts_mut(v as *mut T as *mut u8, mem::size_of::<T>()) }
}

/// Handle to the monitor control device.
pub(crate) struct Monitor {
    handle: std::os::windows::prelude::OwnedHandle,
}

impl Monitor {
    pub fn open() -> Result<Arc<Monitor>, HostError> {
        let path: WCString = OsStr::new(MONITOR_PATH).into();
        let handle = create_file(&path, false).map_err(|e| {
            HostError::new_os(
                HostErrorKind::UnsupportedDriver,
                "capture monitor driver is not installed or not running",
                e,
            )
            .log_error()
        })?;
        Ok(Arc::new(Monitor { handle }))
    }

    fn ioctl(&self, code: u32, input: &[u8], output: &mut [u8]) -> Result<usize, u32> {
        sync_ioctl(raw_handle(&self.handle), code, input, output)
    }

    /// Gate on the driver interface version. A major mismatch or an older
    /// minor is fatal.
    pub fn check_version(&self) -> Result<(), HostError> {
        let mut version = DriverVersion::default();
        self.ioctl(IOCTL_MONITOR_GET_VERSION, &[], struct_bytes_mut(&mut version))
            .map_err(|e| {
                HostError::new_os(HostErrorKind::UnsupportedDriver, "driver version query failed", e)
            })?;
        if version.major != MONITOR_MAJOR_VERSION || version.minor < MONITOR_MINOR_VERSION {
            warn!(
                "capture monitor driver is v{}.{}, this build needs v{}.{}",
                version.major, version.minor, MONITOR_MAJOR_VERSION, MONITOR_MINOR_VERSION
            );
            return Err(HostError::new(
                HostErrorKind::UnsupportedDriver,
                "capture monitor driver version mismatch",
            ));
        }
        info!(
            "capture monitor driver v{}.{}",
            version.major, version.minor
        );
        Ok(())
    }

    /// Install a capture filter matching exactly one physical device.
    /// Returns the driver's id for the installed filter.
    pub fn add_filter(&self, dev: &ExportedDevice) -> Result<u64, HostError> {
        let exact = |value: u16| FilterField {
            match_kind: MATCH_NUM_EXACT,
            value,
        };
        let mut filter = CaptureFilter {
            filter_type: FILTER_TYPE_CAPTURE,
            fields: [FilterField::default(); FILTER_FIELD_COUNT],
        };
        filter.fields[FIELD_VENDOR_ID] = exact(dev.vendor_id);
        filter.fields[FIELD_PRODUCT_ID] = exact(dev.product_id);
        filter.fields[FIELD_DEVICE_REV] = exact(dev.bcd_device);
        filter.fields[FIELD_CLASS] = exact(dev.device_class as u16);
        filter.fields[FIELD_SUBCLASS] = exact(dev.sub_class as u16);
        filter.fields[FIELD_PROTOCOL] = exact(dev.protocol as u16);
        filter.fields[FIELD_PORT] = exact(dev.dev_num as u16);

        let mut reply = AddFilterReply::default();
        self.ioctl(
            IOCTL_MONITOR_ADD_FILTER,
            struct_bytes(&filter),
            struct_bytes_mut(&mut reply),
        )
        .map_err(|e| HostError::new_os(HostErrorKind::FilterRejected, "add filter failed", e))?;
        if reply.rc != 0 {
            return Err(HostError::new_os(
                HostErrorKind::FilterRejected,
                "driver rejected the capture filter",
                reply.rc,
            ));
        }
        debug!("installed capture filter {} for {}", reply.filter_id, dev.bus_id);
        Ok(reply.filter_id)
    }

    /// Remove a capture filter. Used on teardown paths, so failures are
    /// logged rather than returned.
    pub fn remove_filter(&self, filter_id: u64) {
        if let Err(e) = self.ioctl(IOCTL_MONITOR_REMOVE_FILTER, struct_bytes(&filter_id), &mut []) {
            warn!("removing capture filter {filter_id} failed (error {e:#010x})");
        } else {
            debug!("removed capture filter {filter_id}");
        }
    }

    /// Re-evaluate the filter set against currently enumerated devices.
    /// This is what actually yanks the matched device from its original
    /// driver.
    pub fn run_filters(&self) -> Result<(), HostError> {
        self.ioctl(IOCTL_MONITOR_RUN_FILTERS, &[], &mut [])
            .map_err(|e| {
                HostError::new_os(HostErrorKind::FilterRejected, "running filters failed", e)
            })?;
        Ok(())
    }

    /// Which filter owns the device behind the opaque `hdevice` token.
    pub fn check_device(&self, hdevice: u64) -> Result<u64, HostError> {
        let request = CheckDeviceRequest { hdevice };
        let mut reply = CheckDeviceReply::default();
        self.ioctl(
            IOCTL_MONITOR_CHECK_DEVICE,
            struct_bytes(&request),
            struct_bytes_mut(&mut reply),
        )
        .map_err(|e| HostError::new_os(HostErrorKind::Other, "device cross-check failed", e))?;
        Ok(reply.filter_id)
    }
}

const CLAIM_ATTEMPTS: u32 = 50;
const CLAIM_POLL: Duration = Duration::from_millis(100);

/// Wait for the filtered device to re-enumerate under the capture driver
/// and claim it. Polls every 100 ms for up to 5 s; only "device not
/// found" is retried, every other driver error aborts immediately.
///
/// Each probe runs a batch of synchronous ioctls, so it is handed to the
/// runtime's blocking pool rather than stalling an executor thread.
pub(super) async fn claim(
    monitor: &Arc<Monitor>,
    dev: &ExportedDevice,
    filter_id: u64,
) -> Result<ClaimedDevice, HostError> {
    for attempt in 0..CLAIM_ATTEMPTS {
        let probe_monitor = monitor.clone();
        let probe_dev = dev.clone();
        let probed =
            tokio::task::spawn_blocking(move || try_claim(&probe_monitor, &probe_dev, filter_id))
                .await
                .map_err(|_| {
                    HostError::new(HostErrorKind::Other, "claim probe task failed")
                })??;
        if let Some(claimed) = probed {
            debug!("claimed {} after {} attempt(s)", dev.bus_id, attempt + 1);
            return Ok(claimed);
        }
        tokio::time::sleep(CLAIM_POLL).await;
    }
    Err(HostError::new(
        HostErrorKind::Timeout,
        "device did not reappear under the capture driver",
    ))
}

/// One claim attempt. `Ok(None)` means the device has not shown up on the
/// capture interface yet.
fn try_claim(
    monitor: &Arc<Monitor>,
    dev: &ExportedDevice,
    filter_id: u64,
) -> Result<Option<ClaimedDevice>, HostError> {
    let paths = setup::list_interfaces(GUID_DEVINTERFACE_USB_CAPTURE).map_err(|cr| {
        HostError::new_os(HostErrorKind::Other, "listing capture interfaces failed", cr)
    })?;

    for path in paths.iter() {
        let handle = match create_file(path, true) {
            Ok(h) => h,
            Err(e) => {
                // Candidates can be mid-re-enumeration; skip, the poll
                // will come back.
                debug!("capture candidate {path} not openable (error {e})");
                continue;
            }
        };
        let handle_raw = raw_handle(&handle);

        let mut operational = BoolReply::default();
        if sync_ioctl(
            handle_raw,
            IOCTL_DEVICE_IS_OPERATIONAL,
            &[],
            struct_bytes_mut(&mut operational),
        )
        .is_err()
            || operational.value == 0
        {
            continue;
        }

        let mut device_info = DeviceInfoReply::default();
        if sync_ioctl(
            handle_raw,
            IOCTL_DEVICE_GET_INFO,
            &[],
            struct_bytes_mut(&mut device_info),
        )
        .is_err()
        {
            continue;
        }
        if (device_info.hub, device_info.port) != (dev.bus_num, dev.dev_num) {
            continue;
        }

        // This is our device. From here on, any failure aborts the claim.
        let mut version = DriverVersion::default();
        sync_ioctl(
            handle_raw,
            IOCTL_DEVICE_GET_VERSION,
            &[],
            struct_bytes_mut(&mut version),
        )
        .map_err(|e| {
            HostError::new_os(HostErrorKind::Other, "device version query failed", e)
        })?;
        if version.major != DEVICE_MAJOR_VERSION || version.minor < DEVICE_MINOR_VERSION {
            return Err(HostError::new(
                HostErrorKind::UnsupportedDriver,
                "capture device driver version mismatch",
            ));
        }

        let owner = monitor.check_device(device_info.hdevice)?;
        if owner != filter_id {
            return Err(HostError::new(
                HostErrorKind::Other,
                "device is captured by a different filter",
            ));
        }

        let mut claim_reply = BoolReply::default();
        sync_ioctl(
            handle_raw,
            IOCTL_DEVICE_CLAIM,
            &[],
            struct_bytes_mut(&mut claim_reply),
        )
        .map_err(|e| HostError::new_os(HostErrorKind::Other, "claim request failed", e))?;
        if claim_reply.value == 0 {
            return Err(HostError::new(
                HostErrorKind::NotClaimable,
                "driver refused to claim the device",
            ));
        }

        // Re-check after the claim: the device must still be there.
        let mut recheck = BoolReply::default();
        sync_ioctl(
            handle_raw,
            IOCTL_DEVICE_IS_OPERATIONAL,
            &[],
            struct_bytes_mut(&mut recheck),
        )
        .map_err(|e| HostError::new_os(HostErrorKind::DeviceGone, "device vanished after claim", e))?;
        if recheck.value == 0 {
            return Err(HostError::new(
                HostErrorKind::DeviceGone,
                "device went non-operational after claim",
            ));
        }

        return Ok(Some(ClaimedDevice::new(
            monitor.clone(),
            filter_id,
            handle,
            device_info.hdevice,
        )));
    }
    Ok(None)
}
