//! UTF-16 string and handle plumbing for the Win32 calls.

use std::{
    ffi::{c_void, OsStr, OsString},
    fmt::{Display, Write},
    mem,
    os::windows::prelude::{
        AsHandle, AsRawHandle, HandleOrInvalid, OsStrExt, OsStringExt, OwnedHandle, RawHandle,
    },
    ptr::{self, null},
};

use windows_sys::Win32::{
    Foundation::{
        CloseHandle, GetLastError, ERROR_IO_PENDING, GENERIC_READ, GENERIC_WRITE, HANDLE,
        WIN32_ERROR,
    },
    Storage::FileSystem::{
        CreateFileW, FILE_FLAG_OVERLAPPED, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
    },
    System::{
        Threading::CreateEventW,
        IO::{DeviceIoControl, GetOverlappedResult, OVERLAPPED},
    },
};

pub fn raw_handle(h: impl AsHandle) -> HANDLE {
    h.as_handle().as_raw_handle() as HANDLE
}

/// Open a device path. Overlapped handles are used for URB I/O; the
/// monitor control device is opened plain.
pub fn create_file(path: &WCStr, overlapped: bool) -> Result<OwnedHandle, WIN32_ERROR> {
    let flags = if overlapped { FILE_FLAG_OVERLAPPED } else { 0 };
    unsafe {
        let r = CreateFileW(
            path.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            null(),
            OPEN_EXISTING,
            flags,
            ptr::null_mut(),
        );
        HandleOrInvalid::from_raw_handle(r as RawHandle)
            .try_into()
            .map_err(|_| GetLastError())
    }
}

/// Synchronous `DeviceIoControl`, usable on overlapped handles: issues
/// the ioctl with a one-shot event and waits for it. Returns the number
/// of output bytes.
pub fn sync_ioctl(
    handle: HANDLE,
    code: u32,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize, WIN32_ERROR> {
    unsafe {
        let event = CreateEventW(null(), 1, 0, null());
        if event.is_null() {
            return Err(GetLastError());
        }
        let mut overlapped: OVERLAPPED = mem::zeroed();
        overlapped.hEvent = event;

        let mut returned: u32 = 0;
        let r = DeviceIoControl(
            handle,
            code,
            input.as_ptr() as *const c_void,
            input.len() as u32,
            output.as_mut_ptr() as *mut c_void,
            output.len() as u32,
            &mut returned,
            &mut overlapped,
        );
        let result = if r != 0 {
            Ok(returned as usize)
        } else {
            match GetLastError() {
                ERROR_IO_PENDING => {
                    let mut transferred: u32 = 0;
                    if GetOverlappedResult(handle, &overlapped, &mut transferred, 1) != 0 {
                        Ok(transferred as usize)
                    } else {
                        Err(GetLastError())
                    }
                }
                e => Err(e),
            }
        };
        CloseHandle(event);
        result
    }
}

/// A UTF-16 owned NUL-terminated string.
#[repr(transparent)]
pub struct WCString(Vec<u16>);

impl From<&OsStr> for WCString {
    fn from(s: &OsStr) -> Self {
        WCString(s.encode_wide().chain(Some(0)).collect())
    }
}

impl From<&str> for WCString {
    fn from(s: &str) -> Self {
        OsStr::new(s).into()
    }
}

impl std::ops::Deref for WCString {
    type Target = WCStr;

    fn deref(&self) -> &Self::Target {
        unsafe { WCStr::from_slice_unchecked(&self.0) }
    }
}

impl Display for WCString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (**self).fmt(f)
    }
}

/// A UTF-16 borrowed NUL-terminated string.
#[repr(transparent)]
pub struct WCStr([u16]);

impl WCStr {
    unsafe fn from_slice_unchecked(s: &[u16]) -> &WCStr {
        debug_assert_eq!(s.last().copied(), Some(0));
        let p: *const [u16] = s;
        unsafe { &*(p as *const WCStr) }
    }

    pub fn as_ptr(&self) -> *const u16 {
        self.0.as_ptr()
    }
}

impl ToOwned for WCStr {
    type Owned = WCString;

    fn to_owned(&self) -> Self::Owned {
        WCString(self.0.to_owned())
    }
}

impl std::borrow::Borrow<WCStr> for WCString {
    fn borrow(&self) -> &WCStr {
        self
    }
}

impl From<&WCStr> for OsString {
    fn from(s: &WCStr) -> Self {
        OsString::from_wide(&s.0[..s.0.len() - 1])
    }
}

impl Display for WCStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in char::decode_utf16(self.0[..self.0.len() - 1].iter().copied()) {
            f.write_char(c.unwrap_or(char::REPLACEMENT_CHARACTER))?;
        }
        Ok(())
    }
}

/// A buffer of NUL-separated UTF-16 strings, double-NUL terminated, as
/// several setup APIs return.
pub struct WCStrList(pub Vec<u16>);

impl WCStrList {
    pub fn iter(&self) -> impl Iterator<Item = &WCStr> {
        let mut rest: &[u16] = &self.0;
        std::iter::from_fn(move || {
            let nul = rest.iter().position(|&c| c == 0)?;
            if nul == 0 {
                return None;
            }
            let (item, tail) = rest.split_at(nul + 1);
            rest = tail;
            Some(unsafe { WCStr::from_slice_unchecked(item) })
        })
    }
}

/// Decode a fixed UTF-16 field (NUL-padded) into a `String`.
pub fn utf16_field_to_string(field: &[u16]) -> String {
    let len = field.iter().position(|&c| c == 0).unwrap_or(field.len());
    let os = OsString::from_wide(&field[..len]);
    os.to_string_lossy().into_owned()
}
