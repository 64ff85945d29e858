//! Inbound message reassembly.
//!
//! Segments arrive in any order and may duplicate or overlap ranges that
//! are already present; the message is complete when the byte coverage
//! equals the total length.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Reassembly progress shared with the grant scheduler.
///
/// The scheduler reads and advances `incoming` under the grantable lock
/// without touching the RPC's bucket; the data path updates
/// `bytes_remaining` under the bucket lock. Monotonic updates keep the
/// two views consistent.
pub(crate) struct MsgInProgress {
    /// Size of the entire message, in bytes.
    pub(crate) total_length: u32,

    /// Bytes not yet received.
    pub(crate) bytes_remaining: AtomicU32,

    /// Highest byte the sender is authorized to transmit (unscheduled
    /// bytes plus every grant issued so far). Never exceeds
    /// `total_length` and never regresses.
    pub(crate) incoming: AtomicU32,
}

impl MsgInProgress {
    /// Bytes not yet received.
    #[inline]
    pub(crate) fn bytes_remaining(&self) -> u32 {
        self.bytes_remaining.load(Ordering::Relaxed)
    }

    /// Bytes received so far.
    #[inline]
    pub(crate) fn received(&self) -> u32 {
        self.total_length - self.bytes_remaining()
    }

    #[inline]
    pub(crate) fn incoming(&self) -> u32 {
        self.incoming.load(Ordering::Relaxed)
    }

    /// Raise `incoming` to `offset` (capped at the message length).
    /// Returns the previous value.
    pub(crate) fn raise_incoming(&self, offset: u32) -> u32 {
        self.incoming
            .fetch_max(offset.min(self.total_length), Ordering::Relaxed)
    }

    /// True once the sender has been authorized to send everything.
    #[inline]
    pub(crate) fn fully_granted(&self) -> bool {
        self.incoming() >= self.total_length
    }
}

/// One received segment.
struct Segment {
    offset: u32,
    data: Vec<u8>,
}

/// A message being received, request or response.
pub(crate) struct MessageIn {
    /// Shared view of the totals; also held by the grantable list.
    pub(crate) progress: Arc<MsgInProgress>,

    /// Received segments, sorted by offset; may contain holes.
    segments: Vec<Segment>,

    /// True if part of the message must be authorized with grants.
    pub(crate) scheduled: bool,
}

impl MessageIn {
    /// Start reassembly of a `total_length`-byte message whose sender
    /// will transmit `incoming` bytes unprompted.
    pub(crate) fn new(total_length: u32, incoming: u32) -> Self {
        Self {
            progress: Arc::new(MsgInProgress {
                total_length,
                bytes_remaining: AtomicU32::new(total_length),
                incoming: AtomicU32::new(incoming.min(total_length)),
            }),
            segments: Vec::new(),
            scheduled: total_length > incoming,
        }
    }

    #[inline]
    pub(crate) fn total_length(&self) -> u32 {
        self.progress.total_length
    }

    #[inline]
    pub(crate) fn bytes_remaining(&self) -> u32 {
        self.progress.bytes_remaining.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn complete(&self) -> bool {
        self.bytes_remaining() == 0
    }

    /// Add one received segment. Data outside the message or entirely
    /// covered by existing segments is discarded. Returns true if the
    /// segment contributed new bytes.
    pub(crate) fn add_segment(&mut self, offset: u32, data: Vec<u8>) -> bool {
        let offset = offset as i64;
        let data_bytes = data.len() as i64;

        // Data below `floor` or at/after `ceiling` contributes nothing.
        let mut floor = 0i64;
        let mut ceiling = self.progress.total_length as i64;

        // Find the insertion point, scanning backwards: packets almost
        // always arrive in order, so the tail is the common case.
        let mut insert_at = 0;
        for (i, seg) in self.segments.iter().enumerate().rev() {
            let offset2 = seg.offset as i64;
            if offset2 < offset {
                floor = offset2 + seg.data.len() as i64;
                insert_at = i + 1;
                break;
            }
            ceiling = offset2;
        }

        // Segments shouldn't overlap, but compute the newly covered
        // byte count as though they might.
        floor = floor.max(offset);
        ceiling = ceiling.min(offset + data_bytes);
        if floor >= ceiling {
            return false;
        }
        self.segments.insert(insert_at, Segment { offset: offset as u32, data });
        self.progress
            .bytes_remaining
            .fetch_sub((ceiling - floor) as u32, Ordering::Relaxed);
        true
    }

    /// Find the first missing byte range below the authorized horizon:
    /// the range a RESEND should ask for. Only meaningful while bytes
    /// are missing.
    pub(crate) fn resend_gap(&self) -> (u32, u32) {
        let total = self.progress.total_length as i64;
        let incoming = self.progress.incoming() as i64;
        let mut missing = self.bytes_remaining() as i64 - (total - incoming);
        let mut end_offset = incoming;

        // Walk backwards through the segments until every missing byte
        // is accounted for; that identifies the first gap.
        for seg in self.segments.iter().rev() {
            let offset = seg.offset as i64;
            let len = (seg.data.len() as i64).min(total - offset);
            let gap = end_offset - (offset + len);
            missing -= gap;
            if missing <= 0 {
                return ((offset + len) as u32, gap.max(0) as u32);
            }
            end_offset = offset;
        }

        // The first packet(s) are missing.
        (0, missing.max(0) as u32)
    }

    /// Detach the segment buffers for final assembly. The caller builds
    /// the contiguous message with [`TakenMessage::assemble`] outside
    /// any lock.
    pub(crate) fn take_buffers(&mut self) -> TakenMessage {
        TakenMessage {
            total_length: self.progress.total_length,
            segments: std::mem::take(&mut self.segments),
        }
    }

    /// Surrender the raw segment buffers (for the dead list).
    pub(crate) fn into_buffers(self) -> impl Iterator<Item = Vec<u8>> {
        self.segments.into_iter().map(|s| s.data)
    }
}

/// Segment buffers detached from a complete message.
pub(crate) struct TakenMessage {
    total_length: u32,
    segments: Vec<Segment>,
}

impl TakenMessage {
    /// Build the contiguous message. Handles overlapping ranges the way
    /// the reassembly accounting does, so coverage equals length.
    pub(crate) fn assemble(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_length as usize);
        for seg in &self.segments {
            let cursor = out.len() as i64;
            let skip = cursor - seg.offset as i64;
            debug_assert!(skip >= 0, "hole in complete message");
            if skip < 0 || skip >= seg.data.len() as i64 {
                continue;
            }
            let want = (self.total_length as i64 - cursor).min(seg.data.len() as i64 - skip);
            out.extend_from_slice(&seg.data[skip as usize..(skip + want) as usize]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_completion() {
        let mut msg = MessageIn::new(250, 250);
        assert!(!msg.scheduled);
        assert!(msg.add_segment(0, vec![1; 100]));
        assert!(msg.add_segment(100, vec![2; 100]));
        assert!(!msg.complete());
        assert!(msg.add_segment(200, vec![3; 50]));
        assert!(msg.complete());

        let data = msg.take_buffers().assemble();
        assert_eq!(data.len(), 250);
        assert_eq!(&data[..100], &[1; 100][..]);
        assert_eq!(&data[200..], &[3; 50][..]);
    }

    #[test]
    fn out_of_order_with_duplicates() {
        let mut msg = MessageIn::new(300, 300);
        assert!(msg.add_segment(200, vec![3; 100]));
        assert!(msg.add_segment(0, vec![1; 100]));
        // Exact duplicate contributes nothing.
        assert!(!msg.add_segment(200, vec![9; 100]));
        assert_eq!(msg.bytes_remaining(), 100);
        assert!(msg.add_segment(100, vec![2; 100]));
        assert!(msg.complete());

        let data = msg.take_buffers().assemble();
        assert_eq!(&data[100..200], &[2; 100][..]);
        assert_eq!(&data[200..300], &[3; 100][..]);
    }

    #[test]
    fn data_beyond_length_is_ignored() {
        let mut msg = MessageIn::new(100, 100);
        assert!(msg.add_segment(0, vec![1; 100]));
        assert!(!msg.add_segment(100, vec![2; 50]));
        assert!(msg.complete());
    }

    #[test]
    fn resend_gap_mid_message() {
        // 50000-byte message with 20000..21000 missing.
        let mut msg = MessageIn::new(50000, 50000);
        for off in (0..50000).step_by(1000) {
            if off == 20000 {
                continue;
            }
            msg.add_segment(off, vec![0; 1000]);
        }
        assert_eq!(msg.bytes_remaining(), 1000);
        assert_eq!(msg.resend_gap(), (20000, 1000));
    }

    #[test]
    fn resend_gap_head_missing() {
        let mut msg = MessageIn::new(10000, 10000);
        msg.add_segment(4000, vec![0; 1000]);
        assert_eq!(msg.resend_gap(), (0, 4000));
    }

    #[test]
    fn resend_gap_respects_incoming() {
        // Only 6000 bytes authorized; bytes beyond that aren't missing
        // yet.
        let mut msg = MessageIn::new(20000, 6000);
        msg.add_segment(0, vec![0; 2000]);
        msg.add_segment(4000, vec![0; 2000]);
        assert_eq!(msg.resend_gap(), (2000, 2000));
    }

    #[test]
    fn incoming_is_monotonic() {
        let msg = MessageIn::new(1000, 400);
        msg.progress.raise_incoming(300);
        assert_eq!(msg.progress.incoming(), 400);
        msg.progress.raise_incoming(800);
        assert_eq!(msg.progress.incoming(), 800);
        msg.progress.raise_incoming(5000);
        assert_eq!(msg.progress.incoming(), 1000);
        assert!(msg.progress.fully_granted());
    }
}
