//! Snapshots of exportable host devices.

use std::fmt::Display;

/// Connection speed of a device, with the numeric codes used on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
#[non_exhaustive]
pub enum Speed {
    /// Low speed (1.5 Mbit)
    Low,

    /// Full speed (12 Mbit)
    Full,

    /// High speed (480 Mbit)
    High,

    /// Super speed (5000 Mbit)
    Super,
}

impl Speed {
    /// Numeric code carried in device list and import replies.
    pub fn wire_code(self) -> u32 {
        match self {
            Speed::Low => 1,
            Speed::Full => 2,
            Speed::High => 3,
            Speed::Super => 5,
        }
    }
}

impl Display for Speed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Speed::Low => write!(f, "low"),
            Speed::Full => write!(f, "full"),
            Speed::High => write!(f, "high"),
            Speed::Super => write!(f, "super"),
        }
    }
}

/// Class/subclass/protocol triple of one interface of the active
/// configuration.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct InterfaceClass {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// Immutable snapshot of an enumerated device, as produced by the host
/// enumerator and serialized into device list and import replies.
///
/// `path` is the host-internal handle path; the wire `path` field is
/// advisory and never used to reopen a device.
#[derive(Clone, Debug)]
pub struct ExportedDevice {
    /// Physical location, `<hub>-<port>`. At most [`BUS_ID_MAX`] bytes of
    /// ASCII.
    pub bus_id: String,
    pub path: String,
    pub bus_num: u32,
    pub dev_num: u32,
    pub speed: Speed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    /// One entry per interface of the active configuration.
    pub interfaces: Vec<InterfaceClass>,
}

/// Maximum length of a bus id on the wire (NUL-padded to 32).
pub const BUS_ID_MAX: usize = 31;

impl ExportedDevice {
    /// Device id carried in command headers: `(busnum << 16) | devnum`.
    pub fn devid(&self) -> u32 {
        (self.bus_num << 16) | self.dev_num
    }

    pub fn num_interfaces(&self) -> u8 {
        self.interfaces.len() as u8
    }
}

/// Whether `s` is a syntactically acceptable bus id: ASCII `<hub>-<port>`
/// with both halves decimal, short enough to fit the wire field.
pub fn is_valid_bus_id(s: &str) -> bool {
    if s.is_empty() || s.len() > BUS_ID_MAX {
        return false;
    }
    let Some((hub, port)) = s.split_once('-') else {
        return false;
    };
    let numeric = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    numeric(hub) && numeric(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ExportedDevice {
        ExportedDevice {
            bus_id: "1-2".into(),
            path: r"\\?\usb#vid_1234&pid_5678".into(),
            bus_num: 1,
            dev_num: 2,
            speed: Speed::High,
            vendor_id: 0x1234,
            product_id: 0x5678,
            bcd_device: 0x0100,
            device_class: 0x03,
            sub_class: 0,
            protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            interfaces: vec![InterfaceClass {
                class: 3,
                subclass: 1,
                protocol: 2,
            }],
        }
    }

    #[test]
    fn devid_packs_bus_and_device_number() {
        assert_eq!(sample().devid(), 0x0001_0002);
    }

    #[test]
    fn bus_id_syntax() {
        assert!(is_valid_bus_id("1-2"));
        assert!(is_valid_bus_id("12-34"));
        assert!(!is_valid_bus_id(""));
        assert!(!is_valid_bus_id("1"));
        assert!(!is_valid_bus_id("1-"));
        assert!(!is_valid_bus_id("-2"));
        assert!(!is_valid_bus_id("1-2-3"));
        assert!(!is_valid_bus_id("a-b"));
        assert!(!is_valid_bus_id("123456789012345678901234567890123-1"));
    }

    #[test]
    fn speed_wire_codes() {
        assert_eq!(Speed::Low.wire_code(), 1);
        assert_eq!(Speed::Full.wire_code(), 2);
        assert_eq!(Speed::High.wire_code(), 3);
        assert_eq!(Speed::Super.wire_code(), 5);
    }
}
