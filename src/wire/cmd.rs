//! Command (post-attach) messages: submit, unlink, and their replies.
//!
//! Every message is a 48-byte block whose first five words are shared
//! (`command`, `seqnum`, `devid`, `direction`, `ep`), optionally followed
//! by a payload and/or isochronous packet descriptors. The block alone
//! determines the trailer length, which is how frames are delimited on a
//! stream with no length prefix.

use super::{be_i32, be_u32, put_i32, put_u32, WireError};

pub const CMD_SUBMIT: u32 = 0x0000_0001;
pub const CMD_UNLINK: u32 = 0x0000_0002;
pub const RET_SUBMIT: u32 = 0x0000_0003;
pub const RET_UNLINK: u32 = 0x0000_0004;

/// Length of every command block.
pub const CMD_BLOCK_LEN: usize = 48;

/// Length of one isochronous packet descriptor.
pub const ISO_DESC_LEN: usize = 16;

/// `number_of_packets` value marking a non-isochronous submit.
pub const NO_ISO: u32 = 0xffff_ffff;

/// Upper bound accepted for a single transfer buffer.
const MAX_TRANSFER_LEN: u32 = 1 << 24;

/// Upper bound accepted for isochronous packets per URB.
const MAX_ISO_PACKETS: u32 = 1024;

/// Transfer direction as seen from the client: OUT writes to the device,
/// IN reads from it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn from_wire(v: u32) -> Result<Direction, WireError> {
        match v {
            0 => Ok(Direction::Out),
            1 => Ok(Direction::In),
            _ => Err(WireError::MalformedFrame("direction out of range")),
        }
    }

    pub fn wire(self) -> u32 {
        match self {
            Direction::Out => 0,
            Direction::In => 1,
        }
    }
}

/// The five words shared by every command block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CmdHeader {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    pub ep: u32,
}

impl CmdHeader {
    fn parse(buf: &[u8]) -> Result<CmdHeader, WireError> {
        let ep = be_u32(buf, 16);
        if ep > 15 {
            return Err(WireError::MalformedFrame("endpoint out of range"));
        }
        Ok(CmdHeader {
            command: be_u32(buf, 0),
            seqnum: be_u32(buf, 4),
            devid: be_u32(buf, 8),
            direction: Direction::from_wire(be_u32(buf, 12))?,
            ep,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.command);
        put_u32(out, self.seqnum);
        put_u32(out, self.devid);
        put_u32(out, self.direction.wire());
        put_u32(out, self.ep);
    }
}

/// One isochronous packet descriptor. Requests carry `offset`/`length`;
/// replies fill in `actual_length`/`status`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct IsoPacket {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacket {
    fn parse(buf: &[u8]) -> IsoPacket {
        IsoPacket {
            offset: be_u32(buf, 0),
            length: be_u32(buf, 4),
            actual_length: be_u32(buf, 8),
            status: be_i32(buf, 12),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.offset);
        put_u32(out, self.length);
        put_u32(out, self.actual_length);
        put_i32(out, self.status);
    }
}

fn parse_iso_trailer(buf: &[u8], count: usize) -> Vec<IsoPacket> {
    buf.chunks_exact(ISO_DESC_LEN)
        .take(count)
        .map(IsoPacket::parse)
        .collect()
}

/// A decoded `CMD_SUBMIT`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitCmd {
    pub header: CmdHeader,
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    pub setup: [u8; 8],
    /// OUT payload; empty for IN submits.
    pub data: Vec<u8>,
    /// Isochronous packet descriptors; empty for non-iso submits.
    pub iso_packets: Vec<IsoPacket>,
}

impl SubmitCmd {
    pub fn is_iso(&self) -> bool {
        self.number_of_packets != NO_ISO
    }
}

/// A decoded `CMD_UNLINK`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnlinkCmd {
    pub header: CmdHeader,
    pub unlink_seqnum: u32,
}

/// A client-to-server command message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Submit(SubmitCmd),
    Unlink(UnlinkCmd),
}

/// Number of trailer bytes that follow a 48-byte command block, derived
/// from the block alone. Performs the size sanity checks so a hostile
/// length cannot drive allocation.
pub fn trailer_len(block: &[u8; CMD_BLOCK_LEN]) -> Result<usize, WireError> {
    match be_u32(block, 0) {
        CMD_SUBMIT => {
            let direction = Direction::from_wire(be_u32(block, 12))?;
            let buffer_len = be_u32(block, 24);
            let packets = be_u32(block, 32);
            if buffer_len > MAX_TRANSFER_LEN {
                return Err(WireError::MalformedFrame("transfer buffer too large"));
            }
            let mut len = 0usize;
            if direction == Direction::Out {
                len += buffer_len as usize;
            }
            if packets != NO_ISO {
                if packets > MAX_ISO_PACKETS {
                    return Err(WireError::MalformedFrame("too many iso packets"));
                }
                len += packets as usize * ISO_DESC_LEN;
            }
            Ok(len)
        }
        CMD_UNLINK => Ok(0),
        other => Err(WireError::UnexpectedCommand(other)),
    }
}

impl Command {
    /// Decode one complete frame from the front of `buf`. Returns the
    /// message and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Command, usize), WireError> {
        if buf.len() < CMD_BLOCK_LEN {
            return Err(WireError::MalformedFrame("truncated command block"));
        }
        let block: &[u8; CMD_BLOCK_LEN] = buf[..CMD_BLOCK_LEN].try_into().unwrap();
        let trailer = trailer_len(block)?;
        if buf.len() < CMD_BLOCK_LEN + trailer {
            return Err(WireError::MalformedFrame("truncated command trailer"));
        }
        let header = CmdHeader::parse(block)?;
        match header.command {
            CMD_SUBMIT => {
                let buffer_len = be_u32(block, 24);
                let packets = be_u32(block, 32);
                let mut at = CMD_BLOCK_LEN;
                let data = if header.direction == Direction::Out {
                    let d = buf[at..at + buffer_len as usize].to_vec();
                    at += buffer_len as usize;
                    d
                } else {
                    Vec::new()
                };
                let iso_packets = if packets != NO_ISO {
                    let descs = parse_iso_trailer(&buf[at..], packets as usize);
                    at += packets as usize * ISO_DESC_LEN;
                    let total: u64 = descs.iter().map(|p| p.length as u64).sum();
                    if total != buffer_len as u64 {
                        return Err(WireError::MalformedFrame(
                            "iso packet lengths disagree with buffer length",
                        ));
                    }
                    descs
                } else {
                    Vec::new()
                };
                Ok((
                    Command::Submit(SubmitCmd {
                        header,
                        transfer_flags: be_u32(block, 20),
                        transfer_buffer_length: buffer_len,
                        start_frame: be_u32(block, 28),
                        number_of_packets: packets,
                        interval: be_u32(block, 36),
                        setup: block[40..48].try_into().unwrap(),
                        data,
                        iso_packets,
                    }),
                    at,
                ))
            }
            CMD_UNLINK => Ok((
                Command::Unlink(UnlinkCmd {
                    header,
                    unlink_seqnum: be_u32(block, 20),
                }),
                CMD_BLOCK_LEN,
            )),
            other => Err(WireError::UnexpectedCommand(other)),
        }
    }

    /// Serialize this message, appending to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Command::Submit(cmd) => {
                cmd.header.encode(out);
                put_u32(out, cmd.transfer_flags);
                put_u32(out, cmd.transfer_buffer_length);
                put_u32(out, cmd.start_frame);
                put_u32(out, cmd.number_of_packets);
                put_u32(out, cmd.interval);
                out.extend_from_slice(&cmd.setup);
                if cmd.header.direction == Direction::Out {
                    out.extend_from_slice(&cmd.data);
                }
                for p in &cmd.iso_packets {
                    p.encode(out);
                }
            }
            Command::Unlink(cmd) => {
                cmd.header.encode(out);
                put_u32(out, cmd.unlink_seqnum);
                out.resize(out.len() + 24, 0);
            }
        }
    }
}

/// A `RET_SUBMIT` reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitReply {
    pub header: CmdHeader,
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    /// Packet count for iso replies, zero otherwise.
    pub number_of_packets: u32,
    pub error_count: u32,
    /// IN payload; empty for OUT replies.
    pub data: Vec<u8>,
    pub iso_packets: Vec<IsoPacket>,
}

/// A `RET_UNLINK` reply. Status is zero when the unlink cancelled the
/// transfer, an errno-style code otherwise.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnlinkReply {
    pub header: CmdHeader,
    pub status: i32,
}

/// A server-to-client reply message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Submit(SubmitReply),
    Unlink(UnlinkReply),
}

impl Reply {
    /// Serialize this message, appending to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Submit(ret) => {
                ret.header.encode(out);
                put_i32(out, ret.status);
                put_u32(out, ret.actual_length);
                put_u32(out, ret.start_frame);
                put_u32(out, ret.number_of_packets);
                put_u32(out, ret.error_count);
                out.resize(out.len() + 8, 0);
                if ret.header.direction == Direction::In {
                    out.extend_from_slice(&ret.data);
                }
                for p in &ret.iso_packets {
                    p.encode(out);
                }
            }
            Reply::Unlink(ret) => {
                ret.header.encode(out);
                put_i32(out, ret.status);
                out.resize(out.len() + 24, 0);
            }
        }
    }

    /// Decode one complete reply from the front of `buf` (the client side
    /// of the exchange; used in tests). Returns the message and the number
    /// of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Reply, usize), WireError> {
        if buf.len() < CMD_BLOCK_LEN {
            return Err(WireError::MalformedFrame("truncated reply block"));
        }
        let block: &[u8; CMD_BLOCK_LEN] = buf[..CMD_BLOCK_LEN].try_into().unwrap();
        let header = CmdHeader::parse(block)?;
        match header.command {
            RET_SUBMIT => {
                let actual = be_u32(block, 24);
                let packets = be_u32(block, 32);
                if actual > MAX_TRANSFER_LEN || packets > MAX_ISO_PACKETS {
                    return Err(WireError::MalformedFrame("reply sizes out of range"));
                }
                let mut at = CMD_BLOCK_LEN;
                let data = if header.direction == Direction::In {
                    if buf.len() < at + actual as usize {
                        return Err(WireError::MalformedFrame("truncated reply payload"));
                    }
                    let d = buf[at..at + actual as usize].to_vec();
                    at += actual as usize;
                    d
                } else {
                    Vec::new()
                };
                if buf.len() < at + packets as usize * ISO_DESC_LEN {
                    return Err(WireError::MalformedFrame("truncated reply iso trailer"));
                }
                let iso_packets = parse_iso_trailer(&buf[at..], packets as usize);
                at += packets as usize * ISO_DESC_LEN;
                Ok((
                    Reply::Submit(SubmitReply {
                        header,
                        status: be_i32(block, 20),
                        actual_length: actual,
                        start_frame: be_u32(block, 28),
                        number_of_packets: packets,
                        error_count: be_u32(block, 36),
                        data,
                        iso_packets,
                    }),
                    at,
                ))
            }
            RET_UNLINK => Ok((
                Reply::Unlink(UnlinkReply {
                    header,
                    status: be_i32(block, 20),
                }),
                CMD_BLOCK_LEN,
            )),
            other => Err(WireError::UnexpectedCommand(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit_header(seqnum: u32, direction: Direction, ep: u32) -> CmdHeader {
        CmdHeader {
            command: CMD_SUBMIT,
            seqnum,
            devid: 0x0001_0002,
            direction,
            ep,
        }
    }

    #[test]
    fn decode_control_in_submit() {
        // GET_DESCRIPTOR(device) on endpoint 0.
        let mut buf = Vec::new();
        Command::Submit(SubmitCmd {
            header: submit_header(1, Direction::In, 0),
            transfer_flags: 0,
            transfer_buffer_length: 18,
            start_frame: 0,
            number_of_packets: NO_ISO,
            interval: 0,
            setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
            data: vec![],
            iso_packets: vec![],
        })
        .encode(&mut buf);
        assert_eq!(buf.len(), CMD_BLOCK_LEN);
        assert_eq!(&buf[..4], &[0, 0, 0, 1]);
        assert_eq!(&buf[40..48], &[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);

        let (cmd, used) = Command::decode(&buf).unwrap();
        assert_eq!(used, CMD_BLOCK_LEN);
        let Command::Submit(sub) = cmd else {
            panic!("expected submit");
        };
        assert_eq!(sub.header.seqnum, 1);
        assert_eq!(sub.transfer_buffer_length, 18);
        assert!(!sub.is_iso());
    }

    #[test]
    fn submit_out_round_trip() {
        let orig = Command::Submit(SubmitCmd {
            header: submit_header(9, Direction::Out, 2),
            transfer_flags: 0,
            transfer_buffer_length: 5,
            start_frame: 0,
            number_of_packets: NO_ISO,
            interval: 0,
            setup: [0; 8],
            data: b"hello".to_vec(),
            iso_packets: vec![],
        });
        let mut bytes = Vec::new();
        orig.encode(&mut bytes);
        assert_eq!(bytes.len(), CMD_BLOCK_LEN + 5);

        let (decoded, used) = Command::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, orig);

        let mut again = Vec::new();
        decoded.encode(&mut again);
        assert_eq!(again, bytes);
    }

    #[test]
    fn iso_submit_round_trip() {
        let orig = Command::Submit(SubmitCmd {
            header: submit_header(3, Direction::Out, 4),
            transfer_flags: 0,
            transfer_buffer_length: 6,
            start_frame: 1,
            number_of_packets: 2,
            interval: 1,
            setup: [0; 8],
            data: b"abcdef".to_vec(),
            iso_packets: vec![
                IsoPacket {
                    offset: 0,
                    length: 3,
                    ..Default::default()
                },
                IsoPacket {
                    offset: 3,
                    length: 3,
                    ..Default::default()
                },
            ],
        });
        let mut bytes = Vec::new();
        orig.encode(&mut bytes);
        assert_eq!(bytes.len(), CMD_BLOCK_LEN + 6 + 2 * ISO_DESC_LEN);
        let (decoded, _) = Command::decode(&bytes).unwrap();
        assert_eq!(decoded, orig);
    }

    #[test]
    fn iso_length_mismatch_is_malformed() {
        let mut bytes = Vec::new();
        Command::Submit(SubmitCmd {
            header: submit_header(3, Direction::Out, 4),
            transfer_flags: 0,
            transfer_buffer_length: 6,
            start_frame: 0,
            number_of_packets: 1,
            interval: 0,
            setup: [0; 8],
            data: b"abcdef".to_vec(),
            iso_packets: vec![IsoPacket {
                offset: 0,
                length: 5,
                ..Default::default()
            }],
        })
        .encode(&mut bytes);
        assert!(matches!(
            Command::decode(&bytes),
            Err(WireError::MalformedFrame(_))
        ));
    }

    #[test]
    fn truncated_trailer_is_malformed() {
        let mut bytes = Vec::new();
        Command::Submit(SubmitCmd {
            header: submit_header(9, Direction::Out, 2),
            transfer_flags: 0,
            transfer_buffer_length: 5,
            start_frame: 0,
            number_of_packets: NO_ISO,
            interval: 0,
            setup: [0; 8],
            data: b"hello".to_vec(),
            iso_packets: vec![],
        })
        .encode(&mut bytes);
        bytes.truncate(CMD_BLOCK_LEN + 2);
        assert!(matches!(
            Command::decode(&bytes),
            Err(WireError::MalformedFrame(_))
        ));
    }

    #[test]
    fn oversized_buffer_is_rejected_before_allocation() {
        let mut block = [0u8; CMD_BLOCK_LEN];
        block[..4].copy_from_slice(&CMD_SUBMIT.to_be_bytes());
        block[12..16].copy_from_slice(&1u32.to_be_bytes());
        block[24..28].copy_from_slice(&u32::MAX.to_be_bytes());
        block[32..36].copy_from_slice(&NO_ISO.to_be_bytes());
        assert!(matches!(
            trailer_len(&block),
            Err(WireError::MalformedFrame(_))
        ));
    }

    #[test]
    fn unknown_command_code() {
        let mut block = [0u8; CMD_BLOCK_LEN];
        block[..4].copy_from_slice(&0x55u32.to_be_bytes());
        assert_eq!(trailer_len(&block), Err(WireError::UnexpectedCommand(0x55)));
    }

    #[test]
    fn endpoint_out_of_range() {
        let mut bytes = Vec::new();
        Command::Unlink(UnlinkCmd {
            header: CmdHeader {
                command: CMD_UNLINK,
                seqnum: 2,
                devid: 0,
                direction: Direction::Out,
                ep: 0,
            },
            unlink_seqnum: 1,
        })
        .encode(&mut bytes);
        bytes[16..20].copy_from_slice(&16u32.to_be_bytes());
        assert!(matches!(
            Command::decode(&bytes),
            Err(WireError::MalformedFrame(_))
        ));
    }

    #[test]
    fn unlink_round_trip() {
        let orig = Command::Unlink(UnlinkCmd {
            header: CmdHeader {
                command: CMD_UNLINK,
                seqnum: 8,
                devid: 0x0001_0002,
                direction: Direction::In,
                ep: 1,
            },
            unlink_seqnum: 7,
        });
        let mut bytes = Vec::new();
        orig.encode(&mut bytes);
        assert_eq!(bytes.len(), CMD_BLOCK_LEN);
        let (decoded, used) = Command::decode(&bytes).unwrap();
        assert_eq!(used, CMD_BLOCK_LEN);
        assert_eq!(decoded, orig);
    }

    #[test]
    fn ret_submit_layout_and_round_trip() {
        let orig = Reply::Submit(SubmitReply {
            header: CmdHeader {
                command: RET_SUBMIT,
                seqnum: 1,
                devid: 0x0001_0002,
                direction: Direction::In,
                ep: 0,
            },
            status: 0,
            actual_length: 18,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            data: (0..18).collect(),
            iso_packets: vec![],
        });
        let mut bytes = Vec::new();
        orig.encode(&mut bytes);
        assert_eq!(bytes.len(), CMD_BLOCK_LEN + 18);
        assert_eq!(&bytes[..4], &[0, 0, 0, 3]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 1]);
        assert_eq!(&bytes[24..28], &[0, 0, 0, 18]);
        // Padding bytes between the counters and the payload.
        assert_eq!(&bytes[40..48], &[0; 8]);

        let (decoded, used) = Reply::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, orig);
    }

    #[test]
    fn ret_submit_with_error_status() {
        let orig = Reply::Submit(SubmitReply {
            header: CmdHeader {
                command: RET_SUBMIT,
                seqnum: 5,
                devid: 0,
                direction: Direction::Out,
                ep: 2,
            },
            status: crate::wire::errno::EPIPE,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            data: vec![],
            iso_packets: vec![],
        });
        let mut bytes = Vec::new();
        orig.encode(&mut bytes);
        assert_eq!(&bytes[20..24], &(-32i32).to_be_bytes());
        let (decoded, _) = Reply::decode(&bytes).unwrap();
        assert_eq!(decoded, orig);
    }

    #[test]
    fn ret_unlink_round_trip() {
        let orig = Reply::Unlink(UnlinkReply {
            header: CmdHeader {
                command: RET_UNLINK,
                seqnum: 8,
                devid: 0x0001_0002,
                direction: Direction::Out,
                ep: 0,
            },
            status: 0,
        });
        let mut bytes = Vec::new();
        orig.encode(&mut bytes);
        assert_eq!(bytes.len(), CMD_BLOCK_LEN);
        assert_eq!(&bytes[20..24], &[0; 4]);
        let (decoded, _) = Reply::decode(&bytes).unwrap();
        assert_eq!(decoded, orig);
    }
}
