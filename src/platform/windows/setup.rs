//! Device-interface discovery via the setup API.

use windows_sys::{
    core::GUID,
    Win32::Devices::DeviceAndDriverInstallation::{
        CM_Get_Device_Interface_ListW, CM_Get_Device_Interface_List_SizeW, CONFIGRET,
        CM_GET_DEVICE_INTERFACE_LIST_PRESENT, CR_BUFFER_SMALL, CR_SUCCESS,
    },
};

use super::util::WCStrList;

/// List the present device interfaces of `class`, as openable paths.
pub fn list_interfaces(class: GUID) -> Result<WCStrList, CONFIGRET> {
    let flags = CM_GET_DEVICE_INTERFACE_LIST_PRESENT;
    let mut buf: Vec<u16> = Vec::new();
    loop {
        let mut len = 0;
        let cr = unsafe {
            CM_Get_Device_Interface_List_SizeW(&mut len, &class, std::ptr::null(), flags)
        };
        if cr != CR_SUCCESS {
            return Err(cr);
        }

        buf.resize(len as usize, 0);
        let cr = unsafe {
            CM_Get_Device_Interface_ListW(
                &class,
                std::ptr::null(),
                buf.as_mut_ptr(),
                buf.len() as u32,
                flags,
            )
        };
        match cr {
            CR_SUCCESS => return Ok(WCStrList(buf)),
            // The set of devices changed between the two calls; go again.
            CR_BUFFER_SMALL => continue,
            _ => return Err(cr),
        }
    }
}
