//! Durable share records in the Windows registry.
//!
//! Each share lives under `HKLM\SOFTWARE\usbipd\SharedDevices\<guid>`
//! with `BusId` and `FriendlyName` string values. Attach state is never
//! written here.

use std::{ffi::OsStr, io, os::windows::prelude::OsStrExt, ptr::null_mut, slice};

use log::warn;
use uuid::Uuid;
use windows_sys::Win32::{
    Foundation::{ERROR_FILE_NOT_FOUND, ERROR_NO_MORE_ITEMS, ERROR_SUCCESS},
    System::Registry::{
        RegCloseKey, RegCreateKeyExW, RegDeleteTreeW, RegEnumKeyExW, RegOpenKeyExW,
        RegQueryValueExW, RegSetValueExW, HKEY, HKEY_LOCAL_MACHINE, KEY_READ, KEY_WRITE,
        REG_OPTION_NON_VOLATILE, REG_SZ,
    },
};

use crate::registry::{PersistedShare, ShareStore};

use super::util::utf16_field_to_string;

const SHARES_KEY: &str = r"SOFTWARE\usbipd\SharedDevices";

fn wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(Some(0)).collect()
}

fn reg_error(code: u32) -> io::Error {
    io::Error::from_raw_os_error(code as i32)
}

/// Closes its key on drop.
struct Key(HKEY);

impl Key {
    /// `Ok(None)` when the key does not exist.
    fn open(parent: HKEY, path: &str, access: u32) -> io::Result<Option<Key>> {
        let path = wide(path);
        let mut key: HKEY = null_mut();
        match unsafe { RegOpenKeyExW(parent, path.as_ptr(), 0, access, &mut key) } {
            ERROR_SUCCESS => Ok(Some(Key(key))),
            ERROR_FILE_NOT_FOUND => Ok(None),
            e => Err(reg_error(e)),
        }
    }

    fn create(parent: HKEY, path: &str) -> io::Result<Key> {
        let path = wide(path);
        let mut key: HKEY = null_mut();
        let r = unsafe {
            RegCreateKeyExW(
                parent,
                path.as_ptr(),
                0,
                null_mut(),
                REG_OPTION_NON_VOLATILE,
                KEY_READ | KEY_WRITE,
                std::ptr::null(),
                &mut key,
                null_mut(),
            )
        };
        if r == ERROR_SUCCESS {
            Ok(Key(key))
        } else {
            Err(reg_error(r))
        }
    }

    fn subkey_names(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for index in 0.. {
            let mut name = [0u16; 256];
            let mut len = name.len() as u32;
            let r = unsafe {
                RegEnumKeyExW(
                    self.0,
                    index,
                    name.as_mut_ptr(),
                    &mut len,
                    null_mut(),
                    null_mut(),
                    null_mut(),
                    null_mut(),
                )
            };
            match r {
                ERROR_SUCCESS => names.push(utf16_field_to_string(&name)),
                ERROR_NO_MORE_ITEMS => break,
                e => return Err(reg_error(e)),
            }
        }
        Ok(names)
    }

    fn string_value(&self, name: &str) -> io::Result<Option<String>> {
        let name = wide(name);
        let mut data = [0u16; 512];
        let mut ty = 0u32;
        let mut size = (data.len() * 2) as u32;
        let r = unsafe {
            RegQueryValueExW(
                self.0,
                name.as_ptr(),
                null_mut(),
                &mut ty,
                data.as_mut_ptr() as *mut u8,
                &mut size,
            )
        };
        match r {
            ERROR_SUCCESS if ty == REG_SZ => Ok(Some(utf16_field_to_string(&data))),
            ERROR_SUCCESS => Ok(None),
            ERROR_FILE_NOT_FOUND => Ok(None),
            e => Err(reg_error(e)),
        }
    }

    fn set_string(&self, name: &str, value: &str) -> io::Result<()> {
        let name = wide(name);
        let data = wide(value);
        let bytes =
            unsafe { slice::from_raw_parts(data.as_ptr() as *const u8, data.len() * 2) };
        let r = unsafe {
            RegSetValueExW(
                self.0,
                name.as_ptr(),
                0,
                REG_SZ,
                bytes.as_ptr(),
                bytes.len() as u32,
            )
        };
        if r == ERROR_SUCCESS {
            Ok(())
        } else {
            Err(reg_error(r))
        }
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        unsafe {
            RegCloseKey(self.0);
        }
    }
}

/// [`ShareStore`] over `HKLM`.
#[derive(Default)]
pub struct RegistryShareStore;

impl RegistryShareStore {
    pub fn new() -> RegistryShareStore {
        RegistryShareStore
    }
}

impl ShareStore for RegistryShareStore {
    fn load(&self) -> io::Result<Vec<PersistedShare>> {
        let Some(root) = Key::open(HKEY_LOCAL_MACHINE, SHARES_KEY, KEY_READ)? else {
            return Ok(Vec::new());
        };
        let mut shares = Vec::new();
        for name in root.subkey_names()? {
            let Ok(guid) = Uuid::parse_str(&name) else {
                warn!("ignoring share key with non-GUID name {name:?}");
                continue;
            };
            let Some(key) = Key::open(root.0, &name, KEY_READ)? else {
                continue;
            };
            let Some(bus_id) = key.string_value("BusId")? else {
                warn!("ignoring share {name}: no BusId value");
                continue;
            };
            shares.push(PersistedShare {
                guid,
                bus_id,
                friendly_name: key.string_value("FriendlyName")?.unwrap_or_default(),
            });
        }
        Ok(shares)
    }

    fn insert(&self, share: &PersistedShare) -> io::Result<()> {
        let key = Key::create(
            HKEY_LOCAL_MACHINE,
            &format!("{SHARES_KEY}\\{}", share.guid),
        )?;
        key.set_string("BusId", &share.bus_id)?;
        key.set_string("FriendlyName", &share.friendly_name)
    }

    fn remove(&self, guid: &Uuid) -> io::Result<()> {
        let Some(root) = Key::open(HKEY_LOCAL_MACHINE, SHARES_KEY, KEY_READ | KEY_WRITE)? else {
            return Ok(());
        };
        let name = wide(&guid.to_string());
        match unsafe { RegDeleteTreeW(root.0, name.as_ptr()) } {
            ERROR_SUCCESS | ERROR_FILE_NOT_FOUND => Ok(()),
            e => Err(reg_error(e)),
        }
    }
}
