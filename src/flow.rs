//! Per-direction flow state.
//!
//! A conversation owns two of these, one per direction. Everything here is
//! mutated only on non-visited passes; visited passes read the persistent
//! records instead.

use crate::mptcp::MptcpSubflowState;
use crate::reassembly::{Msp, ReassemblyReplay};
use ahash::AHashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

/// Upper bound on tracked unacknowledged segments per direction. When full,
/// the oldest entry is dropped and bytes-in-flight stops being meaningful.
pub const MAX_UNACKED_SEGMENTS: usize = 10_000;

/// Flags set once for the lifetime of the flow.
pub mod static_flags {
    pub const BASE_SEQ_SET: u8 = 0x01;
    pub const SAW_SYN: u8 = 0x02;
    pub const SAW_SYNACK: u8 = 0x04;
}

/// Dynamic flow flags.
pub mod flow_flags {
    /// The subdissector asked for everything up to this direction's FIN.
    pub const REASSEMBLE_UNTIL_FIN: u16 = 0x0001;
}

/// Window-scale sentinel values; 0..=14 are real shifts.
pub const WIN_SCALE_UNKNOWN: i8 = -1;
pub const WIN_SCALE_UNSCALED: i8 = -2;

/// One sent-but-unacknowledged segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UnackedSegment {
    pub frame: u32,
    pub seq: u32,
    pub nextseq: u32,
    pub ts: f64,
}

/// Process attribution for one flow endpoint, as supplied by an external
/// annotation source (IPFIX and friends).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub uid: u32,
    pub pid: u32,
    pub username: String,
    pub command: String,
}

/// State for one direction of a conversation. Sequence numbers stored here
/// are relative to `base_seq` unless the field says otherwise.
#[derive(Debug, Default)]
pub struct FlowState {
    /// Raw initial sequence number; set exactly once per direction.
    pub base_seq: u32,
    pub static_flags: u8,

    /// Highest relative seq + footprint sent so far.
    pub nextseq: u32,
    pub nextseqframe: u32,
    pub nextseqtime: f64,

    /// Highest relative ack sent by this side.
    pub lastack: u32,
    pub lastacktime: f64,
    /// Frame of the most recent ACK that was not a duplicate.
    pub lastnondupack: u32,
    pub dupacknum: u32,

    /// Relative frontier used to recognise acks of never-captured data.
    pub maxseqtobeacked: u32,

    /// Last raw (unscaled) window advertised by this side.
    pub window: u16,
    pub win_scale: i8,

    /// False once bytes-in-flight can no longer be computed for this
    /// direction (lost segment, overflowed tracking list).
    pub valid_bif: bool,

    pub push_bytes_sent: u32,
    pub push_set_last: bool,

    pub unacked_segments: VecDeque<UnackedSegment>,

    /// Analysis flags of the previous segment in this direction; used to
    /// recognise keep-alive and zero-window-probe acks.
    pub lastsegmentflags: u32,

    pub scps_capable: bool,
    /// Largest acknowledged segment size; scales SNACK hole reports.
    pub maxsizeacked: u32,

    /// Multisegment PDUs keyed by their starting relative sequence number.
    pub multisegment_pdus: BTreeMap<u32, Msp>,

    /// What reassembly did per frame, replayed on visited passes.
    pub reassembly_replay: AHashMap<u32, ReassemblyReplay>,

    /// Frame of this direction's FIN; 0 while none seen.
    pub fin: u32,

    pub flags: u16,

    /// Highest contiguous relative sequence number, maintained in
    /// out-of-order reassembly mode.
    pub maxnextseq: u32,

    pub mptcp_subflow: Option<Box<MptcpSubflowState>>,

    pub process_info: Option<ProcessInfo>,

    // Per-direction byte/segment counters for the snapshot surface.
    pub packets: u64,
    pub bytes: u64,
}

impl FlowState {
    pub fn new() -> Self {
        FlowState {
            win_scale: WIN_SCALE_UNKNOWN,
            valid_bif: true,
            ..Default::default()
        }
    }

    #[inline]
    pub fn base_seq_set(&self) -> bool {
        self.static_flags & static_flags::BASE_SEQ_SET != 0
    }

    /// Record the base sequence number. Only the first call has any effect.
    pub fn set_base_seq(&mut self, raw_seq: u32, is_syn: bool) {
        if self.base_seq_set() {
            return;
        }
        self.base_seq = if is_syn {
            raw_seq
        } else {
            raw_seq.wrapping_sub(1)
        };
        self.static_flags |= static_flags::BASE_SEQ_SET;
    }

    #[inline]
    pub fn rel_seq(&self, raw: u32) -> u32 {
        raw.wrapping_sub(self.base_seq)
    }

    /// Track a sent segment for RTT and bytes-in-flight accounting.
    pub fn push_unacked(&mut self, seg: UnackedSegment) {
        if self.unacked_segments.len() >= MAX_UNACKED_SEGMENTS {
            self.unacked_segments.pop_front();
            self.valid_bif = false;
        }
        self.unacked_segments.push_back(seg);
    }

    /// Bytes in flight over the current tracking list.
    pub fn bytes_in_flight(&self) -> Option<u32> {
        if !self.valid_bif || self.unacked_segments.is_empty() {
            return None;
        }
        let mut lo = u32::MAX;
        let mut hi = 0u32;
        for ual in &self.unacked_segments {
            lo = lo.min(ual.seq);
            hi = hi.max(ual.nextseq);
        }
        Some(hi.wrapping_sub(lo))
    }
}

/// Wrapping 32-bit sequence-number comparisons.
pub mod seq {
    #[inline]
    pub fn gt(a: u32, b: u32) -> bool {
        (a.wrapping_sub(b) as i32) > 0
    }

    #[inline]
    pub fn ge(a: u32, b: u32) -> bool {
        (a.wrapping_sub(b) as i32) >= 0
    }

    #[inline]
    pub fn lt(a: u32, b: u32) -> bool {
        (a.wrapping_sub(b) as i32) < 0
    }

    #[inline]
    pub fn le(a: u32, b: u32) -> bool {
        (a.wrapping_sub(b) as i32) <= 0
    }
}
