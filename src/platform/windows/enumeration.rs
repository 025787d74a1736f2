//! Host device enumeration by walking the USB hubs.
//!
//! Bus numbers are assigned to hubs in path order, which keeps them
//! stable within one snapshot and across snapshots while the hub set does
//! not change; a device's bus id is `<hub>-<port>`.

use std::{ffi::c_void, mem, os::windows::prelude::OwnedHandle, ptr::null_mut};

use log::{debug, warn};
use windows_sys::Win32::{
    Devices::Usb::{
        UsbFullSpeed, UsbHighSpeed, UsbLowSpeed, DeviceConnected, GUID_DEVINTERFACE_USB_HUB,
        IOCTL_USB_GET_DESCRIPTOR_FROM_NODE_CONNECTION, IOCTL_USB_GET_HUB_INFORMATION_EX,
        IOCTL_USB_GET_NODE_CONNECTION_INFORMATION_EX,
        IOCTL_USB_GET_NODE_CONNECTION_INFORMATION_EX_V2, USB_DESCRIPTOR_REQUEST,
        USB_DESCRIPTOR_REQUEST_0, USB_DEVICE_SPEED, USB_HUB_INFORMATION_EX,
        USB_NODE_CONNECTION_INFORMATION_EX, USB_NODE_CONNECTION_INFORMATION_EX_V2,
    },
    Foundation::TRUE,
    System::IO::DeviceIoControl,
};

use crate::device::{ExportedDevice, InterfaceClass, Speed};
use crate::error::{HostError, HostErrorKind};

use super::setup;
use super::util::{create_file, raw_handle, WCStr, WCString};

// USB_NODE_CONNECTION_INFORMATION_EX_V2 protocol/flag bits.
const USB110: u32 = 0x01;
const USB200: u32 = 0x02;
const USB300: u32 = 0x04;
const OPERATING_AT_SUPER_SPEED_OR_HIGHER: u32 = 0x01;
const SUPER_SPEED_CAPABLE_OR_HIGHER: u32 = 0x02;

const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 2;
const DESCRIPTOR_TYPE_INTERFACE: u8 = 4;

/// Snapshot of all exportable devices, ordered by bus id. Fails only when
/// the hub interface list itself cannot be obtained; broken hubs and
/// ports are skipped with a warning.
pub fn enumerate() -> Result<Vec<ExportedDevice>, HostError> {
    let hubs = setup::list_interfaces(GUID_DEVINTERFACE_USB_HUB).map_err(|cr| {
        HostError::new_os(
            HostErrorKind::EnumerationFailed,
            "listing USB hubs failed",
            cr,
        )
        .log_error()
    })?;

    let mut hub_paths: Vec<WCString> = hubs.iter().map(|p| p.to_owned()).collect();
    hub_paths.sort_by_key(|p| p.to_string());

    let mut devices = Vec::new();
    for (index, path) in hub_paths.iter().enumerate() {
        let bus_num = (index + 1) as u32;
        let hub = match HubHandle::open(path) {
            Ok(hub) => hub,
            Err(e) => {
                warn!("skipping hub {path}: open failed (error {e})");
                continue;
            }
        };
        let highest_port = match hub.hub_info() {
            Ok(info) => info.HighestPortNumber as u32,
            Err(e) => {
                warn!("skipping hub {path}: hub info failed (error {e})");
                continue;
            }
        };
        for port in 1..=highest_port {
            match hub.port_device(bus_num, port, path) {
                Ok(Some(dev)) => devices.push(dev),
                Ok(None) => {}
                Err(e) => {
                    warn!("skipping {bus_num}-{port}: {e}");
                }
            }
        }
    }
    devices.sort_by(|a, b| a.bus_id.cmp(&b.bus_id));
    Ok(devices)
}

/// An open hub, queried per port with the node-connection ioctls.
struct HubHandle(OwnedHandle);

impl HubHandle {
    fn open(path: &WCStr) -> Result<HubHandle, u32> {
        create_file(path, false).map(HubHandle)
    }

    fn ioctl<T>(&self, code: u32, inout: &mut T) -> Result<(), u32> {
        unsafe {
            let mut returned: u32 = 0;
            let r = DeviceIoControl(
                raw_handle(&self.0),
                code,
                inout as *const _ as *const c_void,
                mem::size_of_val(inout) as u32,
                inout as *mut _ as *mut c_void,
                mem::size_of_val(inout) as u32,
                &mut returned,
                null_mut(),
            );
            if r == TRUE {
                Ok(())
            } else {
                Err(windows_sys::Win32::Foundation::GetLastError())
            }
        }
    }

    fn hub_info(&self) -> Result<USB_HUB_INFORMATION_EX, u32> {
        let mut info: USB_HUB_INFORMATION_EX = unsafe { mem::zeroed() };
        self.ioctl(IOCTL_USB_GET_HUB_INFORMATION_EX, &mut info)?;
        Ok(info)
    }

    fn connection_info(&self, port: u32) -> Result<USB_NODE_CONNECTION_INFORMATION_EX, u32> {
        let mut info: USB_NODE_CONNECTION_INFORMATION_EX = unsafe { mem::zeroed() };
        info.ConnectionIndex = port;
        self.ioctl(IOCTL_USB_GET_NODE_CONNECTION_INFORMATION_EX, &mut info)?;
        Ok(info)
    }

    fn connection_info_v2(&self, port: u32) -> Result<USB_NODE_CONNECTION_INFORMATION_EX_V2, u32> {
        let mut info: USB_NODE_CONNECTION_INFORMATION_EX_V2 = unsafe { mem::zeroed() };
        info.ConnectionIndex = port;
        info.Length = mem::size_of_val(&info) as u32;
        info.SupportedUsbProtocols.ul = USB110 | USB200 | USB300;
        self.ioctl(IOCTL_USB_GET_NODE_CONNECTION_INFORMATION_EX_V2, &mut info)?;
        Ok(info)
    }

    /// Read a descriptor from the device on `port` through the hub, while
    /// the device is still owned by the regular USB stack.
    fn descriptor(&self, port: u32, descriptor_type: u8, length: u16) -> Result<Vec<u8>, u32> {
        let header = mem::size_of::<USB_DESCRIPTOR_REQUEST>();
        let mut buf = vec![0u8; header + length as usize];
        let request = USB_DESCRIPTOR_REQUEST {
            ConnectionIndex: port,
            SetupPacket: USB_DESCRIPTOR_REQUEST_0 {
                bmRequest: 0x80,
                bRequest: 0x06,
                wValue: (descriptor_type as u16) << 8,
                wIndex: 0,
                wLength: length,
            },
            Data: [0],
        };
        unsafe {
            // The Vec gives no alignment guarantee for the request header.
            std::ptr::write_unaligned(buf.as_mut_ptr().cast::<USB_DESCRIPTOR_REQUEST>(), request);
            let mut returned: u32 = 0;
            let r = DeviceIoControl(
                raw_handle(&self.0),
                IOCTL_USB_GET_DESCRIPTOR_FROM_NODE_CONNECTION,
                buf.as_ptr() as *const c_void,
                buf.len() as u32,
                buf.as_mut_ptr() as *mut c_void,
                buf.len() as u32,
                &mut returned,
                null_mut(),
            );
            if r != TRUE {
                return Err(windows_sys::Win32::Foundation::GetLastError());
            }
            buf.drain(..header.min(returned as usize));
            buf.truncate((returned as usize).saturating_sub(header));
        }
        Ok(buf)
    }

    /// Lift the device on `port` into an [`ExportedDevice`], or `None` if
    /// the port is empty or carries another hub.
    fn port_device(
        &self,
        bus_num: u32,
        port: u32,
        hub_path: &WCString,
    ) -> Result<Option<ExportedDevice>, HostError> {
        let os = |e: u32| HostError::new_os(HostErrorKind::Other, "port query failed", e);
        let info = self.connection_info(port).map_err(os)?;
        if info.ConnectionStatus != DeviceConnected {
            return Ok(None);
        }
        if info.DeviceIsHub != 0 {
            // The child hub shows up in the hub interface list with its
            // own bus number.
            return Ok(None);
        }

        let speed = self.port_speed(port, &info);
        let desc = &info.DeviceDescriptor;

        let (interfaces, configuration_value) =
            match self.descriptor(port, DESCRIPTOR_TYPE_CONFIGURATION, 1024) {
                Ok(config) => parse_config(&config),
                Err(e) => {
                    debug!("{bus_num}-{port}: config descriptor unavailable (error {e})");
                    (Vec::new(), info.CurrentConfigurationValue)
                }
            };

        Ok(Some(ExportedDevice {
            bus_id: format!("{bus_num}-{port}"),
            path: format!("{hub_path}#{port}"),
            bus_num,
            dev_num: port,
            speed,
            vendor_id: desc.idVendor,
            product_id: desc.idProduct,
            bcd_device: desc.bcdDevice,
            device_class: desc.bDeviceClass,
            sub_class: desc.bDeviceSubClass,
            protocol: desc.bDeviceProtocol,
            configuration_value: if info.CurrentConfigurationValue != 0 {
                info.CurrentConfigurationValue
            } else {
                configuration_value
            },
            num_configurations: desc.bNumConfigurations,
            interfaces,
        }))
    }

    fn port_speed(&self, port: u32, info: &USB_NODE_CONNECTION_INFORMATION_EX) -> Speed {
        #![allow(non_upper_case_globals)]
        let super_flags = OPERATING_AT_SUPER_SPEED_OR_HIGHER | SUPER_SPEED_CAPABLE_OR_HIGHER;
        if let Ok(v2) = self.connection_info_v2(port) {
            let flags = unsafe { v2.Flags.ul };
            if flags & super_flags != 0 {
                return Speed::Super;
            }
        }
        match info.Speed as USB_DEVICE_SPEED {
            UsbLowSpeed => Speed::Low,
            UsbFullSpeed => Speed::Full,
            UsbHighSpeed => Speed::High,
            _ => Speed::High,
        }
    }
}

/// Pull the configuration value and the alternate-zero interface triples
/// out of a configuration descriptor.
fn parse_config(config: &[u8]) -> (Vec<InterfaceClass>, u8) {
    if config.len() < 9 || config[1] != DESCRIPTOR_TYPE_CONFIGURATION {
        return (Vec::new(), 0);
    }
    let configuration_value = config[5];
    let mut interfaces = Vec::new();
    let mut at = config[0] as usize;
    while at + 2 <= config.len() {
        let len = config[at] as usize;
        if len < 2 || at + len > config.len() {
            break;
        }
        if config[at + 1] == DESCRIPTOR_TYPE_INTERFACE && len >= 9 && config[at + 3] == 0 {
            interfaces.push(InterfaceClass {
                class: config[at + 5],
                subclass: config[at + 6],
                protocol: config[at + 7],
            });
        }
        at += len;
    }
    (interfaces, configuration_value)
}
