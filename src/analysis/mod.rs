//! Per-segment analysis results and conversation-level timing.

pub mod sequence;

use crate::conversation::Conversation;
use crate::segment::{flags as tcp_flags, HeaderRecord};
use serde::Serialize;

/// Anomaly flags on an [`AnalysisRecord`].
pub mod flags {
    pub const RETRANSMISSION: u32 = 0x0001;
    pub const FAST_RETRANSMISSION: u32 = 0x0002;
    pub const SPURIOUS_RETRANSMISSION: u32 = 0x0004;
    pub const OUT_OF_ORDER: u32 = 0x0008;
    pub const LOST_PACKET: u32 = 0x0010;
    pub const ACK_LOST_PACKET: u32 = 0x0020;
    pub const KEEP_ALIVE: u32 = 0x0040;
    pub const KEEP_ALIVE_ACK: u32 = 0x0080;
    pub const WINDOW_UPDATE: u32 = 0x0100;
    pub const WINDOW_FULL: u32 = 0x0200;
    pub const ZERO_WINDOW: u32 = 0x0400;
    pub const ZERO_WINDOW_PROBE: u32 = 0x0800;
    pub const ZERO_WINDOW_PROBE_ACK: u32 = 0x1000;
    pub const DUPLICATE_ACK: u32 = 0x2000;
    pub const REUSED_PORTS: u32 = 0x4000;
}

/// Outcome of sequence analysis for one segment. Option fields distinguish
/// "never computed" from zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisRecord {
    pub flags: u32,
    /// Frame whose data this segment's ack exactly acknowledged.
    pub frame_acked: Option<u32>,
    /// Time from that frame to this ack.
    pub ack_rtt: Option<f64>,
    /// Time since the original transmission, on retransmissions.
    pub rto: Option<f64>,
    pub rto_frame: Option<u32>,
    pub bytes_in_flight: Option<u32>,
    pub push_bytes_sent: Option<u32>,
    pub dupack_num: Option<u32>,
    pub dupack_frame: Option<u32>,
}

impl AnalysisRecord {
    #[inline]
    pub fn has(&self, mask: u32) -> bool {
        self.flags & mask != 0
    }

    /// True when the segment was classified into any retransmission or
    /// out-of-order bucket.
    pub fn is_retransmission_like(&self) -> bool {
        self.has(
            flags::RETRANSMISSION
                | flags::FAST_RETRANSMISSION
                | flags::SPURIOUS_RETRANSMISSION
                | flags::OUT_OF_ORDER,
        )
    }
}

/// Conversation-relative timing for one segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Timing {
    /// Seconds since the conversation's first segment.
    pub ts_relative: f64,
    /// Seconds since the conversation's previous segment.
    pub ts_delta: f64,
    /// Initial round-trip time, once known.
    pub first_rtt: Option<f64>,
}

/// Maintain conversation timestamps and produce this segment's [`Timing`].
/// On visited frames the stored value is replayed without touching state.
pub(crate) fn update_timing(
    conv: &mut Conversation,
    header: &HeaderRecord,
    ts: f64,
    frame: u32,
    visited: bool,
) -> Timing {
    if visited {
        return conv.timing_table.get(&frame).copied().unwrap_or_default();
    }

    let timing = Timing {
        ts_relative: ts - conv.ts_first,
        ts_delta: ts - conv.ts_prev,
        first_rtt: conv.ts_first_rtt,
    };
    conv.ts_prev = ts;

    // Only a connection-opening SYN refreshes this; the initial RTT spans
    // the whole handshake, so the SYN-ACK must not reset the clock.
    if header.is_pure_syn() {
        conv.ts_mru_syn = Some(ts);
    }
    // Initial RTT: the first segment carrying exactly ACK after a SYN.
    if header.flags == tcp_flags::ACK && conv.ts_first_rtt.is_none() {
        if let Some(syn_ts) = conv.ts_mru_syn {
            conv.ts_first_rtt = Some(ts - syn_ts);
        }
    }

    let timing = Timing {
        first_rtt: conv.ts_first_rtt,
        ..timing
    };
    conv.timing_table.insert(frame, timing);
    timing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ConversationKey, ConversationTable, Endpoint};
    use std::net::{IpAddr, Ipv4Addr};

    fn test_conv() -> ConversationTable {
        let mut table = ConversationTable::new();
        let (key, _) = ConversationKey::new(
            Endpoint {
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                port: 1234,
            },
            Endpoint {
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                port: 80,
            },
        );
        table.find_or_create(key, 1, 0.0);
        table
    }

    fn header_with_flags(bits: u16) -> HeaderRecord {
        let mut notes = Vec::new();
        let mut pkt = vec![0u8; 20];
        pkt[12] = 0x50;
        pkt[13] = (bits & 0xFF) as u8;
        pkt[12] |= ((bits >> 8) & 0x0F) as u8;
        crate::segment::parse(&pkt, true, &mut notes).unwrap()
    }

    #[test]
    fn first_rtt_measured_from_mru_syn() {
        let mut table = test_conv();
        let conv = table.get_mut(crate::conversation::ConversationId(0));

        let syn = header_with_flags(tcp_flags::SYN);
        update_timing(conv, &syn, 0.0, 1, false);
        assert_eq!(conv.ts_mru_syn, Some(0.0));

        let synack = header_with_flags(tcp_flags::SYN | tcp_flags::ACK);
        update_timing(conv, &synack, 0.1, 2, false);
        // The SYN-ACK must not refresh the SYN timestamp.
        assert_eq!(conv.ts_mru_syn, Some(0.0));

        let ack = header_with_flags(tcp_flags::ACK);
        let t = update_timing(conv, &ack, 0.15, 3, false);
        assert!((conv.ts_first_rtt.unwrap() - 0.15).abs() < 1e-9);
        assert_eq!(t.first_rtt, conv.ts_first_rtt);
    }

    #[test]
    fn visited_pass_replays_stored_timing() {
        let mut table = test_conv();
        let conv = table.get_mut(crate::conversation::ConversationId(0));
        let ack = header_with_flags(tcp_flags::ACK);

        let first = update_timing(conv, &ack, 1.5, 1, false);
        let ts_prev_after = conv.ts_prev;
        let replay = update_timing(conv, &ack, 999.0, 1, true);
        assert_eq!(first, replay);
        assert_eq!(conv.ts_prev, ts_prev_after);
    }

    #[test]
    fn ts_delta_tracks_previous_segment() {
        let mut table = test_conv();
        let conv = table.get_mut(crate::conversation::ConversationId(0));
        let ack = header_with_flags(tcp_flags::ACK | tcp_flags::PSH);

        update_timing(conv, &ack, 1.0, 1, false);
        let t = update_timing(conv, &ack, 1.25, 2, false);
        assert!((t.ts_relative - 1.25).abs() < 1e-9);
        assert!((t.ts_delta - 0.25).abs() < 1e-9);
        // PSH|ACK is not a pure ACK, no first-RTT sample.
        assert_eq!(conv.ts_first_rtt, None);
    }
}
