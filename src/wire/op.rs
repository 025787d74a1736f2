//! Operation (pre-attach) messages: device list and import.

use crate::device::{ExportedDevice, BUS_ID_MAX};

use super::{be_u16, be_u32, put_u16, put_u32, WireError, USBIP_VERSION};

pub const OP_REQ_DEVLIST: u16 = 0x8005;
pub const OP_REP_DEVLIST: u16 = 0x0005;
pub const OP_REQ_IMPORT: u16 = 0x8003;
pub const OP_REP_IMPORT: u16 = 0x0003;

/// Operation status: success.
pub const ST_OK: u32 = 0;
/// Operation status: request refused.
pub const ST_NA: u32 = 1;

/// Length of the fixed operation header: version, code, status.
pub const OP_HEADER_LEN: usize = 8;

/// Length of the NUL-padded bus id field.
pub const BUS_ID_FIELD_LEN: usize = 32;

/// Length of the NUL-padded path field in a device record.
pub const PATH_FIELD_LEN: usize = 256;

/// Length of a device record without interface descriptors.
pub const DEVICE_RECORD_LEN: usize = 312;

/// Length of one interface descriptor entry in a device list reply.
pub const INTERFACE_RECORD_LEN: usize = 4;

/// Parsed operation request header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OpHeader {
    pub code: u16,
    pub status: u32,
}

impl OpHeader {
    /// Parse and version-check an operation header.
    pub fn parse(buf: &[u8; OP_HEADER_LEN]) -> Result<OpHeader, WireError> {
        let version = be_u16(buf, 0);
        if version != USBIP_VERSION {
            return Err(WireError::VersionMismatch(version));
        }
        Ok(OpHeader {
            code: be_u16(buf, 2),
            status: be_u32(buf, 4),
        })
    }

    pub fn encode(code: u16, status: u32, out: &mut Vec<u8>) {
        put_u16(out, USBIP_VERSION);
        put_u16(out, code);
        put_u32(out, status);
    }
}

/// Extract the bus id from an import request body.
pub fn parse_import_bus_id(body: &[u8; BUS_ID_FIELD_LEN]) -> Result<String, WireError> {
    let len = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    if len > BUS_ID_MAX {
        return Err(WireError::MalformedFrame("bus id not NUL-terminated"));
    }
    let raw = &body[..len];
    if !raw.is_ascii() {
        return Err(WireError::MalformedFrame("bus id not ASCII"));
    }
    // Everything after the first NUL must be padding.
    if body[len..].iter().any(|&b| b != 0) {
        return Err(WireError::MalformedFrame("bus id padding not NUL"));
    }
    Ok(String::from_utf8_lossy(raw).into_owned())
}

fn put_padded(out: &mut Vec<u8>, s: &str, field_len: usize) {
    let bytes = s.as_bytes();
    let take = bytes.len().min(field_len - 1);
    out.extend_from_slice(&bytes[..take]);
    out.resize(out.len() + field_len - take, 0);
}

/// Serialize one device record. Interface descriptors are appended only in
/// device list replies; import replies stop at the fixed record.
pub fn encode_device_record(dev: &ExportedDevice, with_interfaces: bool, out: &mut Vec<u8>) {
    put_padded(out, &dev.path, PATH_FIELD_LEN);
    put_padded(out, &dev.bus_id, BUS_ID_FIELD_LEN);
    put_u32(out, dev.bus_num);
    put_u32(out, dev.dev_num);
    put_u32(out, dev.speed.wire_code());
    put_u16(out, dev.vendor_id);
    put_u16(out, dev.product_id);
    put_u16(out, dev.bcd_device);
    out.push(dev.device_class);
    out.push(dev.sub_class);
    out.push(dev.protocol);
    out.push(dev.configuration_value);
    out.push(dev.num_configurations);
    out.push(dev.num_interfaces());
    if with_interfaces {
        for intf in &dev.interfaces {
            out.push(intf.class);
            out.push(intf.subclass);
            out.push(intf.protocol);
            out.push(0);
        }
    }
}

/// Build a complete device list reply.
pub fn encode_devlist_reply(devices: &[ExportedDevice]) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        OP_HEADER_LEN + 4 + devices.len() * (DEVICE_RECORD_LEN + 2 * INTERFACE_RECORD_LEN),
    );
    OpHeader::encode(OP_REP_DEVLIST, ST_OK, &mut out);
    put_u32(&mut out, devices.len() as u32);
    for dev in devices {
        encode_device_record(dev, true, &mut out);
    }
    out
}

/// Build an import reply: device record on success, bare failure status
/// otherwise.
pub fn encode_import_reply(device: Option<&ExportedDevice>) -> Vec<u8> {
    let mut out = Vec::with_capacity(OP_HEADER_LEN + DEVICE_RECORD_LEN);
    match device {
        Some(dev) => {
            OpHeader::encode(OP_REP_IMPORT, ST_OK, &mut out);
            encode_device_record(dev, false, &mut out);
        }
        None => {
            OpHeader::encode(OP_REP_IMPORT, ST_NA, &mut out);
        }
    }
    out
}

/// Build an import request (client side of the exchange; used in tests).
pub fn encode_import_request(bus_id: &str, out: &mut Vec<u8>) {
    OpHeader::encode(OP_REQ_IMPORT, 0, out);
    put_padded(out, bus_id, BUS_ID_FIELD_LEN);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{InterfaceClass, Speed};

    fn hid_device() -> ExportedDevice {
        ExportedDevice {
            bus_id: "1-2".into(),
            path: "/sys/devices/usbip/1-2".into(),
            bus_num: 1,
            dev_num: 2,
            speed: Speed::High,
            vendor_id: 0x1234,
            product_id: 0x5678,
            bcd_device: 0x0203,
            device_class: 0x03,
            sub_class: 0x01,
            protocol: 0x02,
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
    fn header_round_trip() {
        let mut buf = Vec::new();
        OpHeader::encode(OP_REQ_DEVLIST, 0, &mut buf);
        assert_eq!(buf, [0x01, 0x11, 0x80, 0x05, 0, 0, 0, 0]);
        let hdr = OpHeader::parse(buf[..].try_into().unwrap()).unwrap();
        assert_eq!(
            hdr,
            OpHeader {
                code: OP_REQ_DEVLIST,
                status: 0
            }
        );
    }

    #[test]
    fn header_rejects_wrong_version() {
        let buf = [0x01, 0x10, 0x80, 0x05, 0, 0, 0, 0];
        assert_eq!(
            OpHeader::parse(&buf),
            Err(WireError::VersionMismatch(0x0110))
        );
    }

    #[test]
    fn empty_devlist_reply() {
        // Reply header 0x01110005, status 0, then n_devices = 0.
        let reply = encode_devlist_reply(&[]);
        assert_eq!(reply, [0x01, 0x11, 0x00, 0x05, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn devlist_reply_record_layout() {
        let dev = hid_device();
        let reply = encode_devlist_reply(std::slice::from_ref(&dev));
        assert_eq!(
            reply.len(),
            OP_HEADER_LEN + 4 + DEVICE_RECORD_LEN + INTERFACE_RECORD_LEN
        );
        assert_eq!(&reply[8..12], &[0, 0, 0, 1]);

        let rec = &reply[12..];
        // Path, NUL-padded to 256.
        assert_eq!(&rec[..dev.path.len()], dev.path.as_bytes());
        assert!(rec[dev.path.len()..PATH_FIELD_LEN].iter().all(|&b| b == 0));
        // Bus id "1-2" followed by NULs to 32 bytes.
        assert_eq!(&rec[256..259], b"1-2");
        assert!(rec[259..288].iter().all(|&b| b == 0));
        // busnum, devnum, speed.
        assert_eq!(&rec[288..292], &[0, 0, 0, 1]);
        assert_eq!(&rec[292..296], &[0, 0, 0, 2]);
        assert_eq!(&rec[296..300], &[0, 0, 0, 3]);
        // idVendor, idProduct, bcdDevice.
        assert_eq!(&rec[300..302], &[0x12, 0x34]);
        assert_eq!(&rec[302..304], &[0x56, 0x78]);
        assert_eq!(&rec[304..306], &[0x02, 0x03]);
        // Class bytes and counts.
        assert_eq!(&rec[306..312], &[0x03, 0x01, 0x02, 1, 1, 1]);
        // Interface triple with padding byte.
        assert_eq!(&rec[312..316], &[3, 1, 2, 0]);
    }

    #[test]
    fn import_reply_has_no_interface_records() {
        let dev = hid_device();
        let reply = encode_import_reply(Some(&dev));
        assert_eq!(reply.len(), OP_HEADER_LEN + DEVICE_RECORD_LEN);
        assert_eq!(&reply[..8], &[0x01, 0x11, 0x00, 0x03, 0, 0, 0, 0]);
    }

    #[test]
    fn import_failure_reply_is_header_only() {
        let reply = encode_import_reply(None);
        assert_eq!(reply, [0x01, 0x11, 0x00, 0x03, 0, 0, 0, 1]);
    }

    #[test]
    fn import_bus_id_round_trip() {
        let mut buf = Vec::new();
        encode_import_request("3-14", &mut buf);
        assert_eq!(buf.len(), OP_HEADER_LEN + BUS_ID_FIELD_LEN);
        let body: &[u8; 32] = buf[8..].try_into().unwrap();
        assert_eq!(parse_import_bus_id(body).unwrap(), "3-14");
    }

    #[test]
    fn import_bus_id_rejects_garbage_padding() {
        let mut body = [0u8; 32];
        body[..3].copy_from_slice(b"1-2");
        body[20] = 0xff;
        assert!(matches!(
            parse_import_bus_id(&body),
            Err(WireError::MalformedFrame(_))
        ));
    }

    #[test]
    fn import_bus_id_rejects_unterminated() {
        let body = [b'1'; 32];
        assert!(matches!(
            parse_import_bus_id(&body),
            Err(WireError::MalformedFrame(_))
        ));
    }
}
