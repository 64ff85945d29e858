//! Wire format for Homa packets.
//!
//! Every packet starts with a 28-byte common header whose first 16 bytes
//! mirror TCP field offsets (source/dest port where TCP puts them, two
//! unused words where seq/ack live, `doff` at offset 12, checksum bytes
//! at offset 16) so NIC TSO/RSS machinery leaves the interesting fields
//! alone. Multi-byte fields are big-endian except `id` and `priority`,
//! which are stored in the client's byte order and treated as opaque by
//! the receiver (fixed little-endian here).
//!
//! Every frame is padded to at least [`HOMA_MAX_HEADER`] bytes, and no
//! header exceeds that size.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

use crate::config::HOMA_MAX_PRIORITIES;
use crate::type_alias::*;

/// Largest allowable header; also the minimum length of every frame.
pub(crate) const HOMA_MAX_HEADER: usize = 64;

/// Bytes in the common header.
pub(crate) const COMMON_HDR_LEN: usize = 28;

/// Bytes in a DATA header, up to but not including the first segment.
pub(crate) const DATA_HDR_LEN: usize = 40;

/// Bytes in a segment header (`offset` + `segment_length`).
pub(crate) const SEG_HDR_LEN: usize = 8;

/// Number of wire packet types (DATA through FREEZE).
pub const NUM_PKT_TYPES: usize = 7;

// Field offsets within a frame, shared by the writers, the parser, and
// the in-place patch helpers below.
const OFF_SPORT: usize = 0;
const OFF_DPORT: usize = 2;
const OFF_DOFF: usize = 12;
const OFF_TYPE: usize = 13;
const OFF_PRIORITY: usize = 18;
const OFF_ID: usize = 20;
const OFF_MESSAGE_LENGTH: usize = 28;
const OFF_INCOMING: usize = 32;
const OFF_CUTOFF_VERSION: usize = 36;
const OFF_RETRANSMIT: usize = 38;

/// Packet type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PktType {
    /// Message payload.
    Data = 20,

    /// Receiver authorizes more bytes from the sender.
    Grant = 21,

    /// Receiver requests retransmission of a byte range.
    Resend = 22,

    /// Server tells a client to replay an RPC from scratch.
    Restart = 23,

    /// Bare liveness signal; resets the receiver's silence clock.
    Busy = 24,

    /// Receiver advertises its unscheduled-priority cutoffs.
    Cutoffs = 25,

    /// Debugging aid; accepted and counted, otherwise ignored.
    Freeze = 26,
}

impl PktType {
    /// Index into the per-type metrics arrays.
    #[inline(always)]
    pub(crate) fn index(self) -> usize {
        self as usize - PktType::Data as usize
    }
}

impl TryFrom<u8> for PktType {
    type Error = DecodeError;

    fn try_from(val: u8) -> Result<Self, DecodeError> {
        match val {
            20 => Ok(Self::Data),
            21 => Ok(Self::Grant),
            22 => Ok(Self::Resend),
            23 => Ok(Self::Restart),
            24 => Ok(Self::Busy),
            25 => Ok(Self::Cutoffs),
            26 => Ok(Self::Freeze),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

/// Why an inbound frame was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum DecodeError {
    #[error("frame shorter than the minimum header")]
    Short,

    #[error("unknown packet type {0}")]
    UnknownType(u8),
}

/// Fields common to every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CommonHeader {
    pub sport: Port,
    pub dport: Port,
    pub pkt_type: PktType,
    pub priority: Priority,
    pub id: RpcId,
}

impl CommonHeader {
    /// Write the common header into the first [`COMMON_HDR_LEN`] bytes
    /// of `out`. The unused words, `gro_count` and the checksum bytes
    /// are left zero.
    pub(crate) fn write(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= COMMON_HDR_LEN);
        BigEndian::write_u16(&mut out[OFF_SPORT..], self.sport);
        BigEndian::write_u16(&mut out[OFF_DPORT..], self.dport);
        out[OFF_DOFF] = if self.pkt_type == PktType::Data {
            // High 4 bits: number of 4-byte words in the data header.
            ((DATA_HDR_LEN as u8) << 2) & 0xf0
        } else {
            0
        };
        out[OFF_TYPE] = self.pkt_type as u8;
        LittleEndian::write_u16(&mut out[OFF_PRIORITY..], self.priority as u16);
        LittleEndian::write_u64(&mut out[OFF_ID..], self.id);
    }

    pub(crate) fn read(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < COMMON_HDR_LEN {
            return Err(DecodeError::Short);
        }
        Ok(Self {
            sport: BigEndian::read_u16(&buf[OFF_SPORT..]),
            dport: BigEndian::read_u16(&buf[OFF_DPORT..]),
            pkt_type: PktType::try_from(buf[OFF_TYPE])?,
            priority: LittleEndian::read_u16(&buf[OFF_PRIORITY..]) as Priority,
            id: LittleEndian::read_u64(&buf[OFF_ID..]),
        })
    }
}

/// DATA packet header. One or more segments follow it in the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DataHeader {
    pub common: CommonHeader,

    /// Total bytes in the message.
    pub message_length: u32,

    /// The receiver can count on the sender transmitting everything up
    /// to this offset without further grants.
    pub incoming: u32,

    /// Newest cutoff version the sender has seen from the destination.
    pub cutoff_version: u16,

    /// Set when this packet repeats data already sent once.
    pub retransmit: bool,
}

impl DataHeader {
    /// Write the DATA header into the first [`DATA_HDR_LEN`] bytes of
    /// `out`.
    pub(crate) fn write(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= DATA_HDR_LEN);
        self.common.write(out);
        BigEndian::write_u32(&mut out[OFF_MESSAGE_LENGTH..], self.message_length);
        BigEndian::write_u32(&mut out[OFF_INCOMING..], self.incoming);
        BigEndian::write_u16(&mut out[OFF_CUTOFF_VERSION..], self.cutoff_version);
        out[OFF_RETRANSMIT] = self.retransmit as u8;
    }
}

/// Write a segment header (`offset`, `segment_length`) into `out`.
pub(crate) fn write_segment_header(out: &mut [u8], offset: u32, len: u32) {
    debug_assert!(out.len() >= SEG_HDR_LEN);
    BigEndian::write_u32(&mut out[..4], offset);
    BigEndian::write_u32(&mut out[4..8], len);
}

/// One data segment of a parsed DATA frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DataSegment<'a> {
    pub offset: u32,
    pub data: &'a [u8],
}

/// A parsed inbound frame.
#[derive(Debug)]
pub(crate) enum Packet<'a> {
    Data {
        hdr: DataHeader,
        segments: Vec<DataSegment<'a>>,
    },
    Grant {
        common: CommonHeader,
        offset: u32,
        priority: Priority,
    },
    Resend {
        common: CommonHeader,
        offset: u32,
        length: u32,
        priority: Priority,
    },
    Restart {
        common: CommonHeader,
    },
    Busy {
        common: CommonHeader,
    },
    Cutoffs {
        common: CommonHeader,
        cutoffs: [u32; HOMA_MAX_PRIORITIES],
        version: u16,
    },
    Freeze {
        common: CommonHeader,
    },
}

impl<'a> Packet<'a> {
    pub(crate) fn common(&self) -> &CommonHeader {
        match self {
            Packet::Data { hdr, .. } => &hdr.common,
            Packet::Grant { common, .. }
            | Packet::Resend { common, .. }
            | Packet::Restart { common }
            | Packet::Busy { common }
            | Packet::Cutoffs { common, .. }
            | Packet::Freeze { common } => common,
        }
    }

    /// Parse one frame. Frames shorter than the minimum padded size are
    /// rejected outright; trailing padding (zero `segment_length`) is
    /// ignored.
    pub(crate) fn parse(frame: &'a [u8]) -> Result<Packet<'a>, DecodeError> {
        if frame.len() < HOMA_MAX_HEADER {
            return Err(DecodeError::Short);
        }
        let common = CommonHeader::read(frame)?;
        match common.pkt_type {
            PktType::Data => {
                let hdr = DataHeader {
                    common,
                    message_length: BigEndian::read_u32(&frame[OFF_MESSAGE_LENGTH..]),
                    incoming: BigEndian::read_u32(&frame[OFF_INCOMING..]),
                    cutoff_version: BigEndian::read_u16(&frame[OFF_CUTOFF_VERSION..]),
                    retransmit: frame[OFF_RETRANSMIT] != 0,
                };
                let mut segments = Vec::new();
                let mut at = DATA_HDR_LEN;
                while frame.len() - at >= SEG_HDR_LEN {
                    let offset = BigEndian::read_u32(&frame[at..]);
                    let len = BigEndian::read_u32(&frame[at + 4..]) as usize;
                    if len == 0 {
                        // Padding, not a segment.
                        break;
                    }
                    at += SEG_HDR_LEN;
                    if len > frame.len() - at {
                        return Err(DecodeError::Short);
                    }
                    segments.push(DataSegment {
                        offset,
                        data: &frame[at..at + len],
                    });
                    at += len;
                }
                if segments.is_empty() {
                    return Err(DecodeError::Short);
                }
                Ok(Packet::Data { hdr, segments })
            }
            PktType::Grant => Ok(Packet::Grant {
                common,
                offset: BigEndian::read_u32(&frame[COMMON_HDR_LEN..]),
                priority: frame[COMMON_HDR_LEN + 4],
            }),
            PktType::Resend => Ok(Packet::Resend {
                common,
                offset: BigEndian::read_u32(&frame[COMMON_HDR_LEN..]),
                length: BigEndian::read_u32(&frame[COMMON_HDR_LEN + 4..]),
                priority: frame[COMMON_HDR_LEN + 8],
            }),
            PktType::Restart => Ok(Packet::Restart { common }),
            PktType::Busy => Ok(Packet::Busy { common }),
            PktType::Cutoffs => {
                let mut cutoffs = [0; HOMA_MAX_PRIORITIES];
                for (i, c) in cutoffs.iter_mut().enumerate() {
                    *c = BigEndian::read_u32(&frame[COMMON_HDR_LEN + 4 * i..]);
                }
                Ok(Packet::Cutoffs {
                    common,
                    cutoffs,
                    version: BigEndian::read_u16(
                        &frame[COMMON_HDR_LEN + 4 * HOMA_MAX_PRIORITIES..],
                    ),
                })
            }
            PktType::Freeze => Ok(Packet::Freeze { common }),
        }
    }
}

/// Control-packet payloads (everything except DATA).
#[derive(Debug, Clone, Copy)]
pub(crate) enum Control {
    Grant {
        offset: u32,
        priority: Priority,
    },
    Resend {
        offset: u32,
        length: u32,
        priority: Priority,
    },
    Restart,
    Busy,
    Cutoffs {
        cutoffs: [u32; HOMA_MAX_PRIORITIES],
        version: u16,
    },
    Freeze,
}

impl Control {
    pub(crate) fn pkt_type(&self) -> PktType {
        match self {
            Control::Grant { .. } => PktType::Grant,
            Control::Resend { .. } => PktType::Resend,
            Control::Restart => PktType::Restart,
            Control::Busy => PktType::Busy,
            Control::Cutoffs { .. } => PktType::Cutoffs,
            Control::Freeze => PktType::Freeze,
        }
    }

    /// Build the full (padded) frame for this control packet.
    pub(crate) fn encode(
        &self,
        sport: Port,
        dport: Port,
        id: RpcId,
        priority: Priority,
    ) -> Vec<u8> {
        let mut frame = vec![0u8; HOMA_MAX_HEADER];
        CommonHeader {
            sport,
            dport,
            pkt_type: self.pkt_type(),
            priority,
            id,
        }
        .write(&mut frame);
        let body = &mut frame[COMMON_HDR_LEN..];
        match *self {
            Control::Grant { offset, priority } => {
                BigEndian::write_u32(&mut body[..4], offset);
                body[4] = priority;
            }
            Control::Resend {
                offset,
                length,
                priority,
            } => {
                BigEndian::write_u32(&mut body[..4], offset);
                BigEndian::write_u32(&mut body[4..8], length);
                body[8] = priority;
            }
            Control::Cutoffs { cutoffs, version } => {
                for (i, c) in cutoffs.iter().enumerate() {
                    BigEndian::write_u32(&mut body[4 * i..], *c);
                }
                BigEndian::write_u16(&mut body[4 * HOMA_MAX_PRIORITIES..], version);
            }
            Control::Restart | Control::Busy | Control::Freeze => {}
        }
        frame
    }
}

// In-place patch helpers for DATA frames that get (re)transmitted after
// assembly.

/// Rewrite the priority field of an already-encoded frame.
#[inline]
pub(crate) fn set_priority(frame: &mut [u8], priority: Priority) {
    LittleEndian::write_u16(&mut frame[OFF_PRIORITY..], priority as u16);
}

/// Rewrite the cutoff version of an already-encoded DATA frame.
#[inline]
pub(crate) fn set_cutoff_version(frame: &mut [u8], version: u16) {
    BigEndian::write_u16(&mut frame[OFF_CUTOFF_VERSION..], version);
}

/// Set or clear the retransmit flag of an already-encoded DATA frame.
#[inline]
pub(crate) fn set_retransmit(frame: &mut [u8], retransmit: bool) {
    frame[OFF_RETRANSMIT] = retransmit as u8;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common(t: PktType) -> CommonHeader {
        CommonHeader {
            sport: 0x8001,
            dport: 77,
            pkt_type: t,
            priority: 5,
            id: 0x1234_5678_9abc_def0,
        }
    }

    #[test]
    fn tcp_mirror_offsets() {
        // doff at offset 12 and checksum bytes at 16, as in TCP.
        assert_eq!(OFF_DOFF, 12);
        assert_eq!(OFF_CUTOFF_VERSION - 8, 28);
        assert_eq!(COMMON_HDR_LEN, 28);
        assert_eq!(DATA_HDR_LEN, 40);
        // Every header fits in the padded minimum, CUTOFFS included.
        assert!(COMMON_HDR_LEN + 4 * HOMA_MAX_PRIORITIES + 2 <= HOMA_MAX_HEADER);
    }

    #[test]
    fn common_roundtrip() {
        let mut buf = vec![0u8; HOMA_MAX_HEADER];
        let h = common(PktType::Busy);
        h.write(&mut buf);
        assert_eq!(CommonHeader::read(&buf).unwrap(), h);
        // Ports are big-endian at the TCP offsets.
        assert_eq!(&buf[0..2], &[0x80, 0x01]);
        assert_eq!(&buf[2..4], &[0, 77]);
    }

    #[test]
    fn data_roundtrip_multi_segment() {
        let payload_a = [1u8; 100];
        let payload_b = [2u8; 60];
        let mut frame = vec![0u8; DATA_HDR_LEN + 2 * SEG_HDR_LEN + 160];
        DataHeader {
            common: common(PktType::Data),
            message_length: 5000,
            incoming: 1000,
            cutoff_version: 3,
            retransmit: false,
        }
        .write(&mut frame);
        write_segment_header(&mut frame[DATA_HDR_LEN..], 0, 100);
        frame[DATA_HDR_LEN + 8..DATA_HDR_LEN + 108].copy_from_slice(&payload_a);
        let at = DATA_HDR_LEN + 108;
        write_segment_header(&mut frame[at..], 100, 60);
        frame[at + 8..at + 68].copy_from_slice(&payload_b);

        match Packet::parse(&frame).unwrap() {
            Packet::Data { hdr, segments } => {
                assert_eq!(hdr.message_length, 5000);
                assert_eq!(hdr.incoming, 1000);
                assert_eq!(segments.len(), 2);
                assert_eq!(segments[0].offset, 0);
                assert_eq!(segments[0].data, &payload_a);
                assert_eq!(segments[1].offset, 100);
                assert_eq!(segments[1].data, &payload_b);
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn padding_is_not_a_segment() {
        // A short DATA frame padded to the minimum: the zeroed tail must
        // not produce a phantom segment.
        let mut frame = vec![0u8; HOMA_MAX_HEADER];
        DataHeader {
            common: common(PktType::Data),
            message_length: 4,
            incoming: 4,
            cutoff_version: 0,
            retransmit: true,
        }
        .write(&mut frame);
        write_segment_header(&mut frame[DATA_HDR_LEN..], 0, 4);
        frame[DATA_HDR_LEN + 8..DATA_HDR_LEN + 12].copy_from_slice(b"ping");

        match Packet::parse(&frame).unwrap() {
            Packet::Data { hdr, segments } => {
                assert!(hdr.retransmit);
                assert_eq!(segments.len(), 1);
                assert_eq!(segments[0].data, b"ping");
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn control_roundtrips() {
        let frame = Control::Grant {
            offset: 70000,
            priority: 3,
        }
        .encode(0x8001, 77, 42, 7);
        assert_eq!(frame.len(), HOMA_MAX_HEADER);
        match Packet::parse(&frame).unwrap() {
            Packet::Grant {
                common,
                offset,
                priority,
            } => {
                assert_eq!(common.id, 42);
                assert_eq!(offset, 70000);
                assert_eq!(priority, 3);
            }
            other => panic!("parsed as {:?}", other),
        }

        let mut cutoffs = [0u32; HOMA_MAX_PRIORITIES];
        cutoffs[0] = u32::MAX;
        cutoffs[7] = 200;
        let frame = Control::Cutoffs {
            cutoffs,
            version: 9,
        }
        .encode(1, 2, 3, 0);
        match Packet::parse(&frame).unwrap() {
            Packet::Cutoffs {
                cutoffs: got,
                version,
                ..
            } => {
                assert_eq!(got, cutoffs);
                assert_eq!(version, 9);
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(Packet::parse(&[0u8; 10]), Err(DecodeError::Short)));
        let mut frame = vec![0u8; HOMA_MAX_HEADER];
        frame[OFF_TYPE] = 99;
        assert!(matches!(
            Packet::parse(&frame),
            Err(DecodeError::UnknownType(99))
        ));
    }

    #[test]
    fn patch_helpers() {
        let mut frame = Control::Busy.encode(1, 2, 3, 0);
        set_priority(&mut frame, 6);
        let h = CommonHeader::read(&frame).unwrap();
        assert_eq!(h.priority, 6);
    }
}
