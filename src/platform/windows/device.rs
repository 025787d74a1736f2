//! URB I/O on a claimed device.
//!
//! Each submit leaks a [`TransferIo`] block whose first member is the
//! `OVERLAPPED` handed to the driver; the completion port thread casts
//! the pointer back, reports the result into the attachment's completion
//! channel, and frees the block. The backend only keeps a seqnum → block
//! map so unlinks can target `CancelIoEx` at the right transfer.

use std::{
    collections::HashMap,
    ffi::c_void,
    mem,
    os::windows::prelude::OwnedHandle,
    ptr,
    sync::{Arc, Mutex, Weak},
};

use log::{debug, warn};
use windows_sys::Win32::{
    Foundation::{
        GetLastError, ERROR_DEVICE_NOT_CONNECTED, ERROR_FILE_NOT_FOUND, ERROR_GEN_FAILURE,
        ERROR_INVALID_PARAMETER, ERROR_IO_PENDING, ERROR_NO_SUCH_DEVICE, HANDLE,
    },
    System::IO::{CancelIoEx, DeviceIoControl, OVERLAPPED},
};

use crate::engine::{CompletionSink, DeviceBackend, RawCompletion, TransferError, TransferType, Urb};
use crate::error::HostError;
use crate::wire::cmd::{Direction, IsoPacket};
use crate::wire::errno;

use super::events;
use super::monitor::{struct_bytes, Monitor, IOCTL_DEVICE_RELEASE, IOCTL_DEVICE_SUBMIT_URB};
use super::util::{raw_handle, sync_ioctl};

// URB kinds in the driver ABI.
const URB_KIND_CONTROL: u32 = 0;
const URB_KIND_ISO: u32 = 1;
const URB_KIND_BULK: u32 = 2;
const URB_KIND_INTERRUPT: u32 = 3;

// Per-URB status reported by the driver.
const DEVICE_ST_OK: i32 = 0;
const DEVICE_ST_STALL: i32 = 1;
const DEVICE_ST_DNR: i32 = 2;
const DEVICE_ST_CRC: i32 = 3;

// NTSTATUS values seen in `OVERLAPPED.Internal` when the I/O itself
// failed.
const STATUS_CANCELLED: u32 = 0xC000_0120;
const STATUS_DEVICE_NOT_CONNECTED: u32 = 0xC000_009D;
const STATUS_NO_SUCH_DEVICE: u32 = 0xC000_000E;

/// Fixed header of the submit-URB I/O block. The driver reads the whole
/// block and writes `status`, `actual_length`, `start_frame`,
/// `error_count`, the iso descriptors, and (for IN) the payload back into
/// it before completing the I/O.
#[repr(C)]
struct UrbBlockHeader {
    kind: u32,
    /// Endpoint address, direction bit included.
    endpoint: u32,
    flags: u32,
    status: i32,
    buffer_length: u32,
    actual_length: u32,
    start_frame: u32,
    number_of_packets: u32,
    error_count: u32,
    interval: u32,
    setup: [u8; 8],
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct UrbBlockIso {
    offset: u32,
    length: u32,
    actual_length: u32,
    status: i32,
}

const BLOCK_HEADER_LEN: usize = mem::size_of::<UrbBlockHeader>();
const BLOCK_ISO_LEN: usize = mem::size_of::<UrbBlockIso>();

/// The device claimed away from the host stack, with its sibling
/// resources. Dropping it releases the claim, removes the capture filter,
/// and closes the handle, in that order.
pub(super) struct ClaimedDevice {
    monitor: Arc<Monitor>,
    filter_id: u64,
    handle: OwnedHandle,
    /// Opaque kernel token for this device; used only for filter
    /// cross-checks, never dereferenced.
    hdevice: u64,
}

impl ClaimedDevice {
    pub fn new(
        monitor: Arc<Monitor>,
        filter_id: u64,
        handle: OwnedHandle,
        hdevice: u64,
    ) -> ClaimedDevice {
        ClaimedDevice {
            monitor,
            filter_id,
            handle,
            hdevice,
        }
    }
}

impl Drop for ClaimedDevice {
    fn drop(&mut self) {
        debug!(
            "releasing captured device {:#018x}, filter {}",
            self.hdevice, self.filter_id
        );
        if let Err(e) = sync_ioctl(raw_handle(&self.handle), IOCTL_DEVICE_RELEASE, &[], &mut []) {
            warn!("releasing device claim failed (error {e:#010x})");
        }
        self.monitor.remove_filter(self.filter_id);
        // The handle closes on drop; any still-pending I/O completes as
        // cancelled through the completion port.
    }
}

/// Per-transfer block. `overlapped` must stay the first member so the
/// completion port can cast `*mut OVERLAPPED` back to `*mut TransferIo`.
#[repr(C)]
struct TransferIo {
    overlapped: OVERLAPPED,
    seqnum: u32,
    direction: Direction,
    is_iso: bool,
    number_of_packets: u32,
    /// In/out I/O block: header, iso descriptors, payload.
    block: Vec<u8>,
    sink: CompletionSink,
    pending: Weak<Mutex<HashMap<u32, usize>>>,
}

unsafe impl Send for TransferIo {}

/// [`DeviceBackend`] over a [`ClaimedDevice`].
pub struct WindowsBackend {
    device: ClaimedDevice,
    sink: CompletionSink,
    /// seqnum → `*mut TransferIo` of in-flight submits. The lock also
    /// serializes `CancelIoEx` against the completion handler freeing the
    /// block.
    pending: Arc<Mutex<HashMap<u32, usize>>>,
}

impl WindowsBackend {
    pub(super) fn new(device: ClaimedDevice, sink: CompletionSink) -> Result<WindowsBackend, HostError> {
        events::register(&device.handle)?;
        Ok(WindowsBackend {
            device,
            sink,
            pending: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn device_handle(&self) -> HANDLE {
        raw_handle(&self.device.handle)
    }
}

fn submit_error(err: u32) -> TransferError {
    match err {
        ERROR_FILE_NOT_FOUND | ERROR_DEVICE_NOT_CONNECTED | ERROR_NO_SUCH_DEVICE => {
            TransferError::Disconnected
        }
        ERROR_INVALID_PARAMETER => TransferError::InvalidArgument,
        ERROR_GEN_FAILURE => TransferError::Fault,
        e => TransferError::Unknown(e),
    }
}

impl DeviceBackend for WindowsBackend {
    fn submit(&self, urb: &Urb) -> Result<(), TransferError> {
        let kind = match urb.transfer_type {
            TransferType::Control => URB_KIND_CONTROL,
            TransferType::Isochronous => URB_KIND_ISO,
            TransferType::Bulk => URB_KIND_BULK,
            TransferType::Interrupt => URB_KIND_INTERRUPT,
        };
        let direction_bit = match urb.direction {
            Direction::In => 0x80,
            Direction::Out => 0,
        };
        let header = UrbBlockHeader {
            kind,
            endpoint: (urb.endpoint as u32) | direction_bit,
            flags: urb.flags,
            status: DEVICE_ST_OK,
            buffer_length: urb.buffer_length,
            actual_length: 0,
            start_frame: urb.start_frame,
            number_of_packets: urb.iso_packets.len() as u32,
            error_count: 0,
            interval: urb.interval,
            setup: urb.setup,
        };

        let payload = match urb.direction {
            Direction::Out => urb.data.len(),
            Direction::In => urb.buffer_length as usize,
        };
        let total = BLOCK_HEADER_LEN + urb.iso_packets.len() * BLOCK_ISO_LEN + payload;
        let mut block = Vec::with_capacity(total);
        block.extend_from_slice(struct_bytes(&header));
        for p in &urb.iso_packets {
            let desc = UrbBlockIso {
                offset: p.offset,
                length: p.length,
                ..Default::default()
            };
            block.extend_from_slice(struct_bytes(&desc));
        }
        if urb.direction == Direction::Out {
            block.extend_from_slice(&urb.data);
        }
        block.resize(total, 0);

        let io = Box::new(TransferIo {
            overlapped: unsafe { mem::zeroed() },
            seqnum: urb.seqnum,
            direction: urb.direction,
            is_iso: urb.transfer_type == TransferType::Isochronous,
            number_of_packets: urb.iso_packets.len() as u32,
            block,
            sink: self.sink.clone(),
            pending: Arc::downgrade(&self.pending),
        });
        let io = Box::into_raw(io);
        self.pending.lock().unwrap().insert(urb.seqnum, io as usize);

        let queued = unsafe {
            let block_ptr = (*io).block.as_mut_ptr();
            let block_len = (*io).block.len() as u32;
            let r = DeviceIoControl(
                self.device_handle(),
                IOCTL_DEVICE_SUBMIT_URB,
                block_ptr as *const c_void,
                block_len,
                block_ptr as *mut c_void,
                block_len,
                ptr::null_mut(),
                &mut (*io).overlapped,
            );
            if r != 0 {
                // Completed synchronously; the packet is still delivered
                // through the completion port.
                Ok(())
            } else {
                match GetLastError() {
                    ERROR_IO_PENDING => Ok(()),
                    e => Err(e),
                }
            }
        };

        match queued {
            Ok(()) => Ok(()),
            Err(e) => {
                // Nothing reached the driver; reclaim the block.
                self.pending.lock().unwrap().remove(&urb.seqnum);
                drop(unsafe { Box::from_raw(io) });
                debug!("seqnum {}: submit ioctl failed (error {e:#010x})", urb.seqnum);
                Err(submit_error(e))
            }
        }
    }

    fn abort(&self, seqnum: u32) {
        // Hold the map lock across CancelIoEx: the completion handler
        // takes it before freeing the block, so the pointer stays valid
        // here.
        let pending = self.pending.lock().unwrap();
        if let Some(&io) = pending.get(&seqnum) {
            let io = io as *mut TransferIo;
            unsafe {
                CancelIoEx(self.device_handle(), &(*io).overlapped);
            }
        }
    }
}

/// Called on the completion port thread for each finished transfer I/O.
///
/// SAFETY: `overlapped` must be a pointer previously submitted by
/// `WindowsBackend::submit`; the kernel no longer touches it.
pub(super) unsafe fn handle_event(overlapped: *mut OVERLAPPED) {
    let io = unsafe { Box::from_raw(overlapped as *mut TransferIo) };
    if let Some(pending) = io.pending.upgrade() {
        pending.lock().unwrap().remove(&io.seqnum);
    }

    let ntstatus = io.overlapped.Internal as u32;
    let completion = if ntstatus != 0 {
        let status = match ntstatus {
            STATUS_CANCELLED => TransferError::Cancelled,
            STATUS_DEVICE_NOT_CONNECTED | STATUS_NO_SUCH_DEVICE => TransferError::Disconnected,
            e => TransferError::Unknown(e),
        };
        RawCompletion {
            seqnum: io.seqnum,
            status: Err(status),
            data: vec![],
            actual_length: 0,
            iso_packets: vec![],
            start_frame: 0,
            error_count: 0,
        }
    } else {
        parse_completed_block(&io)
    };

    debug!(
        "seqnum {}: transfer complete, status {:?}, {} bytes",
        completion.seqnum,
        completion.status,
        completion.actual_length
    );
    let _ = io.sink.send(completion);
}

fn device_status(status: i32) -> Result<(), TransferError> {
    match status {
        DEVICE_ST_OK => Ok(()),
        DEVICE_ST_STALL => Err(TransferError::Stall),
        DEVICE_ST_DNR => Err(TransferError::Disconnected),
        DEVICE_ST_CRC => Err(TransferError::Fault),
        other => Err(TransferError::Unknown(other as u32)),
    }
}

fn iso_status(status: i32) -> i32 {
    match device_status(status) {
        Ok(()) => 0,
        Err(TransferError::Stall) => errno::EPIPE,
        Err(TransferError::Disconnected) => errno::ENODEV,
        Err(TransferError::Fault) => errno::EPROTO,
        Err(_) => errno::EIO,
    }
}

fn parse_completed_block(io: &TransferIo) -> RawCompletion {
    // The driver wrote the results back into the block; read the header
    // unaligned, Vec<u8> gives no alignment guarantee.
    let header: UrbBlockHeader =
        unsafe { ptr::read_unaligned(io.block.as_ptr() as *const UrbBlockHeader) };

    let mut iso_packets = Vec::with_capacity(io.number_of_packets as usize);
    let mut error_count = 0;
    for i in 0..io.number_of_packets as usize {
        let desc: UrbBlockIso = unsafe {
            ptr::read_unaligned(
                io.block.as_ptr().add(BLOCK_HEADER_LEN + i * BLOCK_ISO_LEN) as *const UrbBlockIso
            )
        };
        let status = iso_status(desc.status);
        if status != 0 {
            error_count += 1;
        }
        iso_packets.push(IsoPacket {
            offset: desc.offset,
            length: desc.length,
            actual_length: desc.actual_length,
            status,
        });
    }

    let payload_at = BLOCK_HEADER_LEN + io.number_of_packets as usize * BLOCK_ISO_LEN;
    let actual = header.actual_length.min(header.buffer_length) as usize;
    let data = if io.direction == Direction::In {
        io.block[payload_at..io.block.len().min(payload_at + actual)].to_vec()
    } else {
        Vec::new()
    };

    RawCompletion {
        seqnum: io.seqnum,
        status: device_status(header.status),
        actual_length: if io.direction == Direction::In {
            data.len() as u32
        } else {
            header.actual_length
        },
        data,
        iso_packets,
        start_frame: header.start_frame,
        error_count: if io.is_iso {
            error_count
        } else {
            header.error_count
        },
    }
}
