//! Outbound message assembly and retransmission.
//!
//! A message is segmented once, at send time, into a list of DATA
//! frames. Each frame may carry several segments (up to the
//! segmentation-offload budget); the NIC or the host stack splits them
//! into wire packets. Frames are retained until the RPC dies so RESEND
//! requests can be answered from them.

use crate::config::{ETH_OVERHEAD, IPV4_HEADER_LENGTH, VLAN_HEADER};
use crate::pkthdr::{
    self, CommonHeader, DataHeader, Packet, PktType, DATA_HDR_LEN, HOMA_MAX_HEADER, SEG_HDR_LEN,
};
use crate::type_alias::*;

/// Parameters for segmenting one message.
pub(crate) struct FillParams {
    /// Path MTU (IP payload bytes).
    pub mtu: usize,

    /// Segmentation-offload budget: device limit already clamped by the
    /// configured `max_gso_size`.
    pub gso_max: usize,

    /// Unscheduled-window budget.
    pub rtt_bytes: u32,

    pub sport: Port,
    pub dport: Port,
    pub id: RpcId,

    /// Peer's current cutoff version, echoed in every DATA header.
    pub cutoff_version: u16,
}

/// One assembled DATA frame.
pub(crate) struct DataPacketBuf {
    frame: Vec<u8>,

    /// Offset within the message of the first byte in this frame.
    pub(crate) offset: u32,

    /// Payload bytes carried by this frame.
    pub(crate) data_bytes: u32,

    /// Number of segments (wire packets after offload).
    pub(crate) segs: u32,
}

impl DataPacketBuf {
    /// Wire bytes this frame will occupy once segmented, including all
    /// framing overheads; feeds the NIC-queue estimator.
    pub(crate) fn wire_bytes(&self) -> u64 {
        let per_pkt = (IPV4_HEADER_LENGTH + VLAN_HEADER + ETH_OVERHEAD) as u64;
        let mut bytes = self.frame.len() as u64 + per_pkt;
        if self.segs > 1 {
            // Offload replicates the data header for every extra packet.
            bytes += (self.segs as u64 - 1) * ((DATA_HDR_LEN - SEG_HDR_LEN) as u64 + per_pkt);
        }
        bytes
    }
}

/// A message being sent, request or response.
pub(crate) struct MessageOut {
    /// Total message bytes.
    pub(crate) length: u32,

    packets: Vec<DataPacketBuf>,

    /// Index of the next frame to transmit; everything before it has
    /// been sent.
    next_packet: usize,

    /// Bytes sendable without grants (rounded up to whole offload
    /// buffers, capped at `length`).
    pub(crate) unscheduled: u32,

    /// Bytes currently authorized, unscheduled included. Monotone
    /// non-decreasing, never beyond `length`.
    pub(crate) granted: u32,

    /// Priority for scheduled frames, from the latest GRANT.
    pub(crate) sched_priority: Priority,
}

impl MessageOut {
    /// Segment `msg` into DATA frames. The caller has validated the
    /// length.
    pub(crate) fn new(msg: &[u8], params: &FillParams) -> Self {
        let len = msg.len();
        let mut mtu = params.mtu;
        let mut max_pkt_data = mtu - IPV4_HEADER_LENGTH - DATA_HDR_LEN - SEG_HDR_LEN;

        let (max_gso_data, unscheduled) = if len <= max_pkt_data {
            (len, len)
        } else {
            let mut bufs_per_gso = params.gso_max / mtu;
            if bufs_per_gso == 0 {
                bufs_per_gso = 1;
                mtu = params.gso_max;
                max_pkt_data = mtu - IPV4_HEADER_LENGTH - DATA_HDR_LEN - SEG_HDR_LEN;
            }
            let max_gso_data = bufs_per_gso * max_pkt_data;

            // Round the unscheduled window up to whole offload buffers.
            let unsched = (params.rtt_bytes as usize).div_ceil(max_gso_data) * max_gso_data;
            (max_gso_data, unsched.min(len))
        };

        let mut packets = Vec::new();
        let mut sent = 0usize;
        while sent < len || packets.is_empty() {
            let buf_data = max_gso_data.min(len - sent);
            let mut segs = 0u32;
            let mut frame_len = DATA_HDR_LEN;
            {
                let mut left = buf_data;
                while left > 0 || segs == 0 {
                    let seg = left.min(max_pkt_data);
                    frame_len += SEG_HDR_LEN + seg;
                    left -= seg;
                    segs += 1;
                }
            }
            let padded = frame_len.max(HOMA_MAX_HEADER);
            let mut frame = vec![0u8; padded];

            DataHeader {
                common: CommonHeader {
                    sport: params.sport,
                    dport: params.dport,
                    pkt_type: PktType::Data,
                    priority: 0,
                    id: params.id,
                },
                message_length: len as u32,
                // The receiver may count on everything up to the end of
                // this buffer, or the whole unscheduled window if that
                // is further.
                incoming: (sent + buf_data).max(unscheduled) as u32,
                cutoff_version: params.cutoff_version,
                retransmit: false,
            }
            .write(&mut frame);

            let offset = sent as u32;
            let mut at = DATA_HDR_LEN;
            let mut left = buf_data;
            loop {
                let seg = left.min(max_pkt_data);
                pkthdr::write_segment_header(&mut frame[at..], sent as u32, seg as u32);
                at += SEG_HDR_LEN;
                frame[at..at + seg].copy_from_slice(&msg[sent..sent + seg]);
                at += seg;
                sent += seg;
                left -= seg;
                if left == 0 {
                    break;
                }
            }

            packets.push(DataPacketBuf {
                frame,
                offset,
                data_bytes: buf_data as u32,
                segs,
            });
        }

        let length = len as u32;
        Self {
            length,
            packets,
            next_packet: 0,
            unscheduled: unscheduled as u32,
            granted: (unscheduled as u32).min(length),
            sched_priority: 0,
        }
    }

    /// The frame the send cursor points at, if any remain.
    #[inline]
    pub(crate) fn peek(&self) -> Option<&DataPacketBuf> {
        self.packets.get(self.next_packet)
    }

    /// Offset of the next byte to transmit; `None` once fully sent.
    #[inline]
    pub(crate) fn next_offset(&self) -> Option<u32> {
        self.peek().map(|p| p.offset)
    }

    #[inline]
    pub(crate) fn fully_sent(&self) -> bool {
        self.next_packet >= self.packets.len()
    }

    /// True while granted bytes remain unsent.
    #[inline]
    pub(crate) fn transmittable(&self) -> bool {
        matches!(self.next_offset(), Some(off) if off < self.granted)
    }

    /// Bytes not yet handed to the NIC; orders the throttled list.
    #[inline]
    pub(crate) fn bytes_left(&self) -> u32 {
        self.length - self.next_offset().unwrap_or(self.length)
    }

    /// Apply a GRANT: raise the authorized horizon and adopt the
    /// receiver's scheduled priority. Grants never regress.
    pub(crate) fn grant_to(&mut self, offset: u32, priority: Priority) {
        if offset > self.granted {
            self.granted = offset.min(self.length);
        }
        self.sched_priority = priority;
    }

    /// Patch the cursor frame for transmission and return its bytes.
    /// The caller advances the cursor with [`Self::mark_sent`] after a
    /// successful hand-off.
    pub(crate) fn frame_for_xmit(&mut self, priority: Priority, cutoff_version: u16) -> &[u8] {
        let buf = &mut self.packets[self.next_packet];
        pkthdr::set_priority(&mut buf.frame, priority);
        pkthdr::set_cutoff_version(&mut buf.frame, cutoff_version);
        &buf.frame
    }

    #[inline]
    pub(crate) fn mark_sent(&mut self) {
        self.next_packet += 1;
    }

    /// Return the message to its pristine unsent state, as if nothing
    /// had been transmitted. Used when the server orders a RESTART.
    pub(crate) fn reset(&mut self) {
        for buf in &mut self.packets {
            pkthdr::set_retransmit(&mut buf.frame, false);
        }
        self.next_packet = 0;
        self.granted = self.unscheduled.min(self.length);
        self.sched_priority = 0;
    }

    /// Build retransmission frames for every segment overlapping
    /// `[start, end)`. Each result is a single-segment DATA frame with
    /// the retransmit flag set.
    pub(crate) fn resend_frames(
        &self,
        start: u32,
        end: u32,
        priority: Priority,
        cutoff_version: u16,
    ) -> Vec<DataPacketBuf> {
        let mut out = Vec::new();
        for buf in &self.packets {
            if end <= buf.offset {
                break;
            }
            if buf.offset + buf.data_bytes <= start {
                continue;
            }
            // Re-walk this frame's segments through the parser.
            let Ok(Packet::Data { hdr, segments }) = Packet::parse(&buf.frame) else {
                debug_assert!(false, "stored frame failed to parse");
                continue;
            };
            for seg in segments {
                let seg_end = seg.offset + seg.data.len() as u32;
                if end <= seg.offset {
                    break;
                }
                if seg_end <= start {
                    continue;
                }

                let frame_len = (DATA_HDR_LEN + SEG_HDR_LEN + seg.data.len()).max(HOMA_MAX_HEADER);
                let mut frame = vec![0u8; frame_len];
                DataHeader {
                    common: CommonHeader {
                        priority,
                        ..hdr.common
                    },
                    message_length: self.length,
                    incoming: end.max(seg_end),
                    cutoff_version,
                    retransmit: true,
                }
                .write(&mut frame);
                pkthdr::write_segment_header(
                    &mut frame[DATA_HDR_LEN..],
                    seg.offset,
                    seg.data.len() as u32,
                );
                frame[DATA_HDR_LEN + SEG_HDR_LEN..DATA_HDR_LEN + SEG_HDR_LEN + seg.data.len()]
                    .copy_from_slice(seg.data);
                out.push(DataPacketBuf {
                    frame,
                    offset: seg.offset,
                    data_bytes: seg.data.len() as u32,
                    segs: 1,
                });
            }
        }
        out
    }

    /// Consume a retransmission frame built by [`Self::resend_frames`].
    pub(crate) fn into_frame(buf: DataPacketBuf) -> Vec<u8> {
        buf.frame
    }

    /// Surrender the raw frame buffers (for the dead list).
    pub(crate) fn into_buffers(self) -> impl Iterator<Item = Vec<u8>> {
        self.packets.into_iter().map(|p| p.frame)
    }
}
