//! Sequence-number analysis.
//!
//! Classifies each segment against the per-direction flow state, in the same
//! rule order the checks must be evaluated: the zero-window family first,
//! then lost/keep-alive/window anomalies, the duplicate-ack family, acks of
//! unseen data, and finally the retransmission family. State updates happen
//! after classification. Runs only on non-visited frames; visited frames are
//! served from the conversation's persistent record table.
//!
//! All sequence numbers handled here are relative to `base_seq`, with
//! wrapping comparisons throughout.

use crate::analysis::{flags as a, AnalysisRecord};
use crate::config::EngineConfig;
use crate::conversation::{Conversation, FlowDirection};
use crate::flow::{seq, static_flags, UnackedSegment, WIN_SCALE_UNKNOWN, WIN_SCALE_UNSCALED};
use crate::options::TcpOption;
use crate::segment::{flags as th, HeaderRecord};

/// Out-of-order threshold when no initial RTT is known yet.
const OOO_THRESHOLD_SECS: f64 = 0.003;

/// A resend within this long of the last duplicate ack is a fast
/// retransmission.
const FAST_RETRANS_WINDOW_SECS: f64 = 0.020;

/// Bytes-in-flight values at or above this are considered bogus.
const BIF_MAX: u32 = 2_000_000_000;

/// Effective shift for a direction, honouring the configured fallback.
fn scale_shift(win_scale: i8, default_scale: i8) -> u32 {
    match win_scale {
        s if s >= 0 => s as u32,
        WIN_SCALE_UNKNOWN if default_scale >= 0 => default_scale as u32,
        _ => 0,
    }
}

/// The window a raw advertisement actually grants. SYN segments are never
/// scaled.
pub(crate) fn scaled_window(raw: u16, win_scale: i8, default_scale: i8, is_syn: bool) -> u32 {
    if is_syn {
        raw as u32
    } else {
        (raw as u32) << scale_shift(win_scale, default_scale)
    }
}

/// Analyze one non-visited segment and persist the outcome keyed by
/// `(frame, raw seq, raw ack)`. `extra_flags` lets the caller attach
/// conversation-level findings (port reuse) to this segment's record.
pub(crate) fn analyze(
    conv: &mut Conversation,
    dir: FlowDirection,
    header: &HeaderRecord,
    ts: f64,
    frame: u32,
    extra_flags: u32,
    cfg: &EngineConfig,
) -> AnalysisRecord {
    let mut record = AnalysisRecord {
        flags: extra_flags,
        ..Default::default()
    };

    let first_rtt = conv.ts_first_rtt;
    let default_scale = cfg.default_window_scaling;

    {
        let (fwd, rev) = conv.flows_mut(dir);

        fwd.set_base_seq(header.seq, header.is_syn());
        if header.is_pure_syn() {
            fwd.static_flags |= static_flags::SAW_SYN;
        }
        if header.is_syn_ack() {
            fwd.static_flags |= static_flags::SAW_SYNACK;
        }
        if header.is_ack() && !rev.base_seq_set() {
            rev.set_base_seq(header.ack, false);
        }

        // Window scale and SCPS capability are negotiated on the SYNs.
        if header.is_syn() {
            let mut saw_ws = false;
            for opt in &header.options {
                match opt {
                    TcpOption::WindowScale { shift, .. } => {
                        fwd.win_scale = *shift as i8;
                        saw_ws = true;
                    }
                    TcpOption::ScpsCapabilities { .. } => fwd.scps_capable = true,
                    _ => {}
                }
            }
            if !saw_ws {
                fwd.win_scale = WIN_SCALE_UNSCALED;
            }
        }

        let seq_rel = fwd.rel_seq(header.seq);
        let ack_rel = rev.rel_seq(header.ack);
        let seglen = header.seglen;
        let window = header.window;
        let no_sfr = header.flags & (th::SYN | th::FIN | th::RST) == 0;

        let mut flags2 = record.flags;
        let mut skip_fwd_rest = false;

        // ZERO WINDOW PROBE: one byte poked at the edge of a closed window.
        if seglen == 1 && seq_rel == fwd.nextseq && rev.window == 0 {
            flags2 |= a::ZERO_WINDOW_PROBE;
            skip_fwd_rest = true;
        }

        if !skip_fwd_rest {
            // ZERO WINDOW
            if window == 0 && no_sfr {
                flags2 |= a::ZERO_WINDOW;
            }

            // LOST PACKET: a gap before this segment.
            if fwd.nextseq > 0 && seq::gt(seq_rel, fwd.nextseq) && !header.is_rst() {
                flags2 |= a::LOST_PACKET;
                fwd.valid_bif = false;
                // Remember the frontier so the ack of the lost data can be
                // spotted in the other direction.
                if fwd.maxseqtobeacked == 0 {
                    fwd.maxseqtobeacked = fwd.nextseq;
                }
            }

            // KEEP ALIVE: 0/1 bytes sent one below the frontier.
            if seglen <= 1 && seq_rel == fwd.nextseq.wrapping_sub(1) && no_sfr {
                flags2 |= a::KEEP_ALIVE;
            }

            // WINDOW UPDATE
            if seglen == 0
                && window != fwd.window
                && seq_rel == fwd.nextseq
                && ack_rel == fwd.lastack
                && no_sfr
            {
                flags2 |= a::WINDOW_UPDATE;
                skip_fwd_rest = true;
            }
        }

        // WINDOW FULL: this segment fills the receive window to the brim.
        if !skip_fwd_rest
            && seglen > 0
            && rev.window > 0
            && seq_rel.wrapping_add(seglen)
                == rev
                    .lastack
                    .wrapping_add(scaled_window(rev.window, rev.win_scale, default_scale, false))
            && no_sfr
        {
            flags2 |= a::WINDOW_FULL;
            skip_fwd_rest = true;
        }

        // The duplicate-ack family shares one shape and is told apart by what
        // the other side sent last.
        if !skip_fwd_rest
            && seglen == 0
            && window == fwd.window
            && seq_rel == fwd.nextseq
            && ack_rel == fwd.lastack
            && no_sfr
        {
            if rev.lastsegmentflags & a::KEEP_ALIVE != 0 {
                flags2 |= a::KEEP_ALIVE_ACK;
            } else if window == 0 && rev.lastsegmentflags & a::ZERO_WINDOW_PROBE != 0 {
                flags2 |= a::ZERO_WINDOW_PROBE_ACK;
            } else if header.is_ack() {
                flags2 |= a::DUPLICATE_ACK;
                fwd.dupacknum += 1;
                record.dupack_num = Some(fwd.dupacknum);
                record.dupack_frame = Some(fwd.lastnondupack);
            }
        }

        // ACK LOST PACKET: this ack covers data we never saw on the wire.
        if rev.maxseqtobeacked > 0
            && seq::gt(ack_rel, rev.maxseqtobeacked)
            && header.is_ack()
        {
            flags2 |= a::ACK_LOST_PACKET;
            if seq::ge(ack_rel, rev.nextseq) {
                rev.maxseqtobeacked = 0;
            } else {
                rev.maxseqtobeacked = ack_rel;
            }
        }

        // Retransmission family.
        if (seglen > 0 || header.is_syn() || header.is_fin())
            && fwd.nextseq > 0
            && seq::lt(seq_rel, fwd.nextseq)
            && flags2 & a::KEEP_ALIVE == 0
        {
            let since_frontier = ts - fwd.nextseqtime;
            let ooo_threshold = match first_rtt {
                Some(rtt) => rtt.max(OOO_THRESHOLD_SECS),
                None => OOO_THRESHOLD_SECS,
            };

            if rev.dupacknum >= 2
                && rev.lastack == seq_rel
                && ts - rev.lastacktime < FAST_RETRANS_WINDOW_SECS
            {
                flags2 |= a::FAST_RETRANSMISSION;
            } else if since_frontier < ooo_threshold
                && fwd.nextseq != seq_rel.wrapping_add(seglen)
            {
                flags2 |= a::OUT_OF_ORDER;
            } else if seglen > 0
                && rev.lastack > 0
                && seq::le(seq_rel.wrapping_add(seglen), rev.lastack)
            {
                flags2 |= a::SPURIOUS_RETRANSMISSION;
            } else {
                flags2 |= a::RETRANSMISSION;
                record.rto = Some(ts - fwd.nextseqtime);
                record.rto_frame = Some(fwd.nextseqframe);
            }
        }

        // --- classification done; update the flow state ---

        let footprint_end = seq_rel.wrapping_add(header.seq_footprint());

        if seglen > 0 || header.is_syn() || header.is_fin() {
            fwd.push_unacked(UnackedSegment {
                frame,
                seq: seq_rel,
                nextseq: footprint_end,
                ts,
            });
        }

        // Advance the frontier; a zero-window probe's phantom byte must not.
        if seq::gt(footprint_end, fwd.nextseq) && flags2 & a::ZERO_WINDOW_PROBE == 0 {
            fwd.nextseq = footprint_end;
            fwd.nextseqframe = frame;
            fwd.nextseqtime = ts;
        }

        if header.is_fin() && fwd.fin == 0 {
            fwd.fin = frame;
        }

        fwd.window = window;

        if header.is_ack() {
            if ack_rel != fwd.lastack {
                fwd.lastnondupack = frame;
                fwd.dupacknum = 0;
            }
            fwd.lastack = ack_rel;
            fwd.lastacktime = ts;

            // Walk the other side's unacked segments.
            let mut i = 0;
            while i < rev.unacked_segments.len() {
                let ual = rev.unacked_segments[i];
                if ual.nextseq == ack_rel {
                    record.frame_acked = Some(ual.frame);
                    record.ack_rtt = Some(ts - ual.ts);
                    fwd.maxsizeacked = fwd.maxsizeacked.max(ual.nextseq.wrapping_sub(ual.seq));
                    rev.unacked_segments.remove(i);
                } else if seq::le(ual.nextseq, ack_rel) {
                    fwd.maxsizeacked = fwd.maxsizeacked.max(ual.nextseq.wrapping_sub(ual.seq));
                    rev.unacked_segments.remove(i);
                } else if seq::gt(ack_rel, ual.seq) {
                    // Partial ack: shrink the tracked range.
                    if let Some(entry) = rev.unacked_segments.get_mut(i) {
                        entry.seq = ack_rel;
                    }
                    i += 1;
                } else {
                    i += 1;
                }
            }
        }

        if cfg.track_bytes_in_flight
            && (seglen > 0 || header.is_syn() || header.is_fin())
        {
            if let Some(bif) = fwd.bytes_in_flight() {
                if bif > 0 && bif < BIF_MAX {
                    record.bytes_in_flight = Some(bif);
                }
            }
        }

        // Push-byte accounting: the counter restarts after each PSH.
        if fwd.push_set_last {
            fwd.push_bytes_sent = seglen;
            fwd.push_set_last = false;
        } else {
            fwd.push_bytes_sent = fwd.push_bytes_sent.wrapping_add(seglen);
        }
        if header.has(th::PSH) {
            fwd.push_set_last = true;
            record.push_bytes_sent = Some(fwd.push_bytes_sent);
        }

        record.flags = flags2;
        fwd.lastsegmentflags = flags2;
    }

    conv.acked_table
        .insert((frame, header.seq, header.ack), record.clone());
    record
}
