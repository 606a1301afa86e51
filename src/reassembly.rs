//! Application-layer PDU reassembly across segment boundaries.
//!
//! When a handler reports that a PDU continues past the current segment, a
//! multisegment PDU (MSP) is opened at the PDU's starting sequence number.
//! Later segments accrete into the MSP's fragment buffer; when the byte
//! range `[seq, nxtpdu)` is fully present the concatenated buffer goes back
//! to the handler, which may consume it, extend it again, or leave a tail
//! that starts the next PDU within the same segment.
//!
//! Sequence numbers in this module are relative to the flow's `base_seq`.

use crate::config::EngineConfig;
use crate::expert::{ExpertNote, NoteKind};
use crate::flow::{flow_flags, seq, FlowState};
use crate::subdissector::{Desegment, DissectAction, PduContext, SubdissectorRegistry};
use serde::Serialize;

/// MSP lifecycle flags.
pub mod msp_flags {
    /// The handler wants whole segments, not a byte count (one-more-segment
    /// and until-FIN requests).
    pub const REASSEMBLE_ENTIRE_SEGMENT: u16 = 0x01;
    /// Opened at an expected position whose first bytes have not arrived.
    pub const MISSING_FIRST_SEGMENT: u16 = 0x02;
    pub const GOT_ALL_SEGMENTS: u16 = 0x04;
}

/// Upper bound on one MSP's accretion buffer. A sequence jump past this is
/// treated as data loss rather than a reason to allocate without limit.
pub const MAX_MSP_BYTES: u32 = 32 * 1024 * 1024;

/// Byte accretion buffer for one MSP. Offsets are relative to the MSP's
/// starting sequence number.
#[derive(Debug, Clone, Default)]
pub struct FragmentBuffer {
    data: Vec<u8>,
    /// Sorted, disjoint, merged `[lo, hi)` covered ranges.
    have: Vec<(u32, u32)>,
}

impl FragmentBuffer {
    pub fn add(&mut self, offset: u32, bytes: &[u8]) {
        if bytes.is_empty() || offset >= MAX_MSP_BYTES {
            return;
        }
        let lo = offset;
        let hi = offset + bytes.len() as u32;
        let end = hi as usize;
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[lo as usize..end].copy_from_slice(bytes);

        self.have.push((lo, hi));
        self.have.sort_unstable();
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.have.len());
        for &(lo, hi) in &self.have {
            match merged.last_mut() {
                Some(last) if lo <= last.1 => last.1 = last.1.max(hi),
                _ => merged.push((lo, hi)),
            }
        }
        self.have = merged;
    }

    /// Whether `[lo, hi)` is fully present.
    pub fn covers(&self, lo: u32, hi: u32) -> bool {
        if hi <= lo {
            return true;
        }
        self.have.iter().any(|&(a, b)| a <= lo && hi <= b)
    }

    /// The assembled bytes `[0, len)`; gaps read as zero.
    pub fn assembled(&self, len: usize) -> Vec<u8> {
        let mut out = self.data.clone();
        out.resize(len, 0);
        out
    }

    pub fn max_covered(&self) -> u32 {
        self.have.last().map(|&(_, hi)| hi).unwrap_or(0)
    }

    /// Length of the gap-free prefix.
    pub fn contiguous_covered(&self) -> u32 {
        match self.have.first() {
            Some(&(0, hi)) => hi,
            _ => 0,
        }
    }
}

/// One multisegment PDU.
#[derive(Debug, Clone)]
pub struct Msp {
    /// Relative sequence number of the PDU's first byte.
    pub seq: u32,
    /// One past the PDU's last byte (current expectation).
    pub nxtpdu: u32,
    /// Frame that opened the MSP.
    pub first_frame: u32,
    /// Frame that actually carried the first byte, once seen.
    pub first_frame_with_seq: u32,
    pub last_frame: u32,
    pub last_frame_time: f64,
    pub flags: u16,
    pub buf: FragmentBuffer,
}

impl Msp {
    #[inline]
    pub fn has(&self, mask: u16) -> bool {
        self.flags & mask != 0
    }

    fn complete(&self) -> bool {
        self.buf.covers(0, self.nxtpdu.wrapping_sub(self.seq))
    }
}

/// A reassembled PDU handed to the display surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PduView {
    pub stream_id: u32,
    /// Relative sequence number of the first byte.
    pub seq: u32,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub first_frame: u32,
    pub last_frame: u32,
}

/// First-pass reassembly outcome for one frame, replayed when visited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyReplay {
    /// The segment's bytes were already present in an MSP.
    Retransmitted,
    /// These MSPs were completed and delivered on this frame.
    Delivered { msp_seqs: Vec<u32> },
}

/// Per-call context for the desegmentation driver.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DesegmentCtx {
    pub stream_id: u32,
    pub frame: u32,
    pub ts: f64,
    pub visited: bool,
    pub src_port: u16,
    pub dst_port: u16,
    /// The segment carries FIN.
    pub fin: bool,
}

impl DesegmentCtx {
    fn pdu_ctx(&self, seq: u32, is_reassembled: bool) -> PduContext {
        PduContext {
            stream_id: self.stream_id,
            frame: self.frame,
            ts: self.ts,
            visited: self.visited,
            src_port: self.src_port,
            dst_port: self.dst_port,
            seq,
            is_reassembled,
        }
    }
}

/// Drive reassembly and the subdissector for one segment's payload.
pub(crate) fn process_payload(
    cfg: &EngineConfig,
    flow: &mut FlowState,
    registry: &mut SubdissectorRegistry,
    ctx: &DesegmentCtx,
    seq_start: u32,
    payload: &[u8],
    out: &mut Vec<PduView>,
    notes: &mut Vec<ExpertNote>,
) {
    if ctx.visited {
        replay(flow, ctx, out, notes);
        return;
    }
    if payload.is_empty() && !ctx.fin {
        return;
    }

    let nxtseq = seq_start.wrapping_add(payload.len() as u32);

    // Out-of-order mode: a segment past the contiguous frontier is buffered
    // into an unfinished MSP instead of being dissected now.
    if cfg.reassemble_out_of_order && !payload.is_empty() {
        if flow.maxnextseq == 0 {
            flow.maxnextseq = seq_start;
        }
        if seq::gt(seq_start, flow.maxnextseq) {
            buffer_out_of_order(flow, ctx, seq_start, payload);
            return;
        }
        if seq::ge(nxtseq, flow.maxnextseq) {
            flow.maxnextseq = nxtseq;
        }
        // The awaited first bytes of a gap MSP have arrived.
        if let Some(msp) = flow.multisegment_pdus.get_mut(&seq_start) {
            if msp.has(msp_flags::MISSING_FIRST_SEGMENT) {
                msp.first_frame_with_seq = ctx.frame;
                msp.flags &= !msp_flags::MISSING_FIRST_SEGMENT;
            }
        }
    }

    // Is this segment part of an existing MSP?
    let member = flow
        .multisegment_pdus
        .range(..=seq_start)
        .next_back()
        .map(|(&k, msp)| (k, msp.has(msp_flags::GOT_ALL_SEGMENTS), msp.nxtpdu))
        .filter(|&(_, done, nxtpdu)| !done && seq::lt(seq_start, nxtpdu));

    if let Some((msp_key, _, _)) = member {
        extend_msp(cfg, flow, registry, ctx, msp_key, seq_start, payload, out, notes);
        return;
    }

    // A FIN with no payload can still finalise an until-FIN request.
    if payload.is_empty() && ctx.fin {
        if flow.flags & flow_flags::REASSEMBLE_UNTIL_FIN != 0 {
            if let Some((&msp_key, _)) = flow.multisegment_pdus.range(..=seq_start).next_back() {
                finalize_until_fin(cfg, flow, registry, ctx, msp_key, seq_start, out, notes);
            }
        }
        return;
    }

    dissect_fresh(cfg, flow, registry, ctx, seq_start, payload, notes);
}

/// Out-of-order gap handling: extend the trailing unfinished MSP when the
/// hole lies inside it, otherwise open a new MSP at the expected position.
fn buffer_out_of_order(flow: &mut FlowState, ctx: &DesegmentCtx, seq_start: u32, payload: &[u8]) {
    let nxtseq = seq_start.wrapping_add(payload.len() as u32);

    let candidate = flow
        .multisegment_pdus
        .iter_mut()
        .next_back()
        .filter(|(_, msp)| !msp.has(msp_flags::GOT_ALL_SEGMENTS))
        .filter(|(&k, msp)| {
            // The unfinished MSP is still missing bytes before this segment.
            seq::ge(seq_start, k) && !msp.buf.covers(0, seq_start.wrapping_sub(k))
        });

    match candidate {
        Some((&k, msp)) => {
            let new_end = if seq::gt(nxtseq, msp.nxtpdu) {
                nxtseq
            } else {
                msp.nxtpdu
            };
            msp.nxtpdu = new_end;
            msp.buf.add(seq_start.wrapping_sub(k), payload);
            msp.last_frame = ctx.frame;
            msp.last_frame_time = ctx.ts;
            tracing::trace!(frame = ctx.frame, msp_seq = k, "out-of-order bytes added to MSP");
        }
        None => {
            let expected = flow.maxnextseq;
            let mut msp = Msp {
                seq: expected,
                nxtpdu: nxtseq,
                first_frame: ctx.frame,
                first_frame_with_seq: 0,
                last_frame: ctx.frame,
                last_frame_time: ctx.ts,
                flags: msp_flags::MISSING_FIRST_SEGMENT,
                buf: FragmentBuffer::default(),
            };
            msp.buf.add(seq_start.wrapping_sub(expected), payload);
            flow.multisegment_pdus.insert(expected, msp);
            tracing::trace!(
                frame = ctx.frame,
                expected,
                seq = seq_start,
                "gap detected, MSP opened without its first segment"
            );
        }
    }
}

/// This segment belongs to the MSP at `msp_key`.
#[allow(clippy::too_many_arguments)]
fn extend_msp(
    cfg: &EngineConfig,
    flow: &mut FlowState,
    registry: &mut SubdissectorRegistry,
    ctx: &DesegmentCtx,
    msp_key: u32,
    seq_start: u32,
    payload: &[u8],
    out: &mut Vec<PduView>,
    notes: &mut Vec<ExpertNote>,
) {
    let until_fin = flow.flags & flow_flags::REASSEMBLE_UNTIL_FIN != 0;
    let nxtseq = seq_start.wrapping_add(payload.len() as u32);

    let (completed, len, covered_frontier) = {
        let Some(msp) = flow.multisegment_pdus.get_mut(&msp_key) else {
            return;
        };
        let off = seq_start.wrapping_sub(msp.seq);

        // Entirely inside the MSP and already buffered: retransmitted data.
        if seq::gt(seq_start, msp.seq)
            && seq::le(nxtseq, msp.nxtpdu)
            && msp.buf.covers(off, off.wrapping_add(payload.len() as u32))
        {
            notes.push(ExpertNote::note(
                NoteKind::RetransmittedSegmentData,
                "retransmitted TCP segment data",
            ));
            flow.reassembly_replay
                .insert(ctx.frame, ReassemblyReplay::Retransmitted);
            return;
        }

        let len = if msp.has(msp_flags::REASSEMBLE_ENTIRE_SEGMENT) {
            payload.len()
        } else {
            let want = if seq::lt(nxtseq, msp.nxtpdu) {
                nxtseq
            } else {
                msp.nxtpdu
            };
            want.wrapping_sub(seq_start) as usize
        };

        if cfg.reassemble_out_of_order {
            let end = seq_start.wrapping_add(len as u32);
            if seq::gt(end, msp.nxtpdu) {
                msp.nxtpdu = end;
            }
        }

        msp.buf.add(off, &payload[..len.min(payload.len())]);
        msp.last_frame = ctx.frame;
        msp.last_frame_time = ctx.ts;

        let completed = if until_fin {
            ctx.fin
        } else if msp.has(msp_flags::REASSEMBLE_ENTIRE_SEGMENT) {
            // One-more-segment requests finish with the segment itself.
            true
        } else {
            msp.complete()
        };

        if completed {
            // Whole-segment requests learn their true end only now.
            if msp.has(msp_flags::REASSEMBLE_ENTIRE_SEGMENT) || until_fin {
                msp.nxtpdu = seq_start.wrapping_add(len as u32);
            }
            msp.flags |= msp_flags::GOT_ALL_SEGMENTS;
        } else if msp.has(msp_flags::REASSEMBLE_ENTIRE_SEGMENT) {
            // Keep the next segment a member while the request stays open.
            msp.nxtpdu = nxtseq.wrapping_add(1);
        }

        let covered_frontier = msp.seq.wrapping_add(msp.buf.contiguous_covered());
        (completed, len, covered_frontier)
    };

    // In out-of-order mode buffered bytes beyond the gap count towards the
    // contiguous frontier once the gap closes.
    if cfg.reassemble_out_of_order && seq::gt(covered_frontier, flow.maxnextseq) {
        flow.maxnextseq = covered_frontier;
    }

    if until_fin && ctx.fin && flow.fin == 0 {
        flow.fin = ctx.frame;
    }
    if completed && until_fin {
        flow.flags &= !flow_flags::REASSEMBLE_UNTIL_FIN;
    }

    if completed {
        deliver_msp(cfg, flow, registry, ctx, msp_key, out, notes);
    }

    // Bytes of this segment past the PDU boundary start the next PDU.
    let consumed_end = seq_start.wrapping_add(len as u32);
    if completed && seq::gt(nxtseq, consumed_end) {
        let tail_off = consumed_end.wrapping_sub(seq_start) as usize;
        dissect_fresh(cfg, flow, registry, ctx, consumed_end, &payload[tail_off..], notes);
    }
}

/// Hand a completed MSP to the handler and honour its verdict.
fn deliver_msp(
    cfg: &EngineConfig,
    flow: &mut FlowState,
    registry: &mut SubdissectorRegistry,
    ctx: &DesegmentCtx,
    msp_key: u32,
    out: &mut Vec<PduView>,
    notes: &mut Vec<ExpertNote>,
) {
    let (msp_seq, first_frame, buf_len, data) = {
        let Some(msp) = flow.multisegment_pdus.get(&msp_key) else {
            return;
        };
        let len = msp.nxtpdu.wrapping_sub(msp.seq) as usize;
        (msp.seq, msp.first_frame, len, msp.buf.assembled(len))
    };

    let action = registry.dissect(
        &ctx.pdu_ctx(msp_seq, true),
        &data,
        cfg.try_heuristic_first,
    );

    let mut delivered_seqs: Vec<u32> = Vec::new();
    let mut emit = |seq: u32, bytes: &[u8], out: &mut Vec<PduView>| {
        out.push(PduView {
            stream_id: ctx.stream_id,
            seq,
            data: bytes.to_vec(),
            first_frame,
            last_frame: ctx.frame,
        });
        delivered_seqs.push(seq);
    };

    match action {
        None | Some((_, DissectAction::Consumed(_))) | Some((_, DissectAction::Rejected)) => {
            // Fully consumed (or nobody claimed it): the PDU is done either
            // way. The display surface still gets the assembled bytes.
            emit(msp_seq, &data, out);
        }
        Some((name, DissectAction::Failed(msg))) => {
            notes.push(ExpertNote::error(
                NoteKind::SubdissectorFailed,
                format!("{} failed on reassembled PDU: {}", name, msg),
            ));
            emit(msp_seq, &data, out);
        }
        Some((_, DissectAction::NeedMore { consumed, need })) => {
            if consumed == 0 {
                // The whole buffer is still one PDU: reopen and extend.
                if let Some(msp) = flow.multisegment_pdus.get_mut(&msp_key) {
                    msp.flags &= !msp_flags::GOT_ALL_SEGMENTS;
                    apply_need(flow, msp_key, need);
                }
            } else {
                let consumed = consumed.min(buf_len);
                // The head PDUs are done; the tail bytes of the reassembled
                // buffer open a follow-up MSP.
                emit(msp_seq, &data[..consumed], out);
                let new_seq = msp_seq.wrapping_add(consumed as u32);
                let old_nxtpdu = {
                    let Some(msp) = flow.multisegment_pdus.get_mut(&msp_key) else {
                        return;
                    };
                    let old = msp.nxtpdu;
                    msp.nxtpdu = new_seq;
                    old
                };
                let mut follow = Msp {
                    seq: new_seq,
                    nxtpdu: old_nxtpdu,
                    first_frame: ctx.frame,
                    first_frame_with_seq: ctx.frame,
                    last_frame: ctx.frame,
                    last_frame_time: ctx.ts,
                    flags: 0,
                    buf: FragmentBuffer::default(),
                };
                follow.buf.add(0, &data[consumed..]);
                flow.multisegment_pdus.insert(new_seq, follow);
                apply_need(flow, new_seq, need);
            }
        }
    }

    if !delivered_seqs.is_empty() {
        match flow.reassembly_replay.get_mut(&ctx.frame) {
            Some(ReassemblyReplay::Delivered { msp_seqs }) => {
                msp_seqs.extend(delivered_seqs)
            }
            _ => {
                flow.reassembly_replay.insert(
                    ctx.frame,
                    ReassemblyReplay::Delivered {
                        msp_seqs: delivered_seqs,
                    },
                );
            }
        }
    }
}

/// Translate a handler's request into MSP bookkeeping.
fn apply_need(flow: &mut FlowState, msp_key: u32, need: Desegment) {
    let Some(msp) = flow.multisegment_pdus.get_mut(&msp_key) else {
        return;
    };
    let frontier = msp.seq.wrapping_add(msp.buf.max_covered());
    match need {
        Desegment::Bytes(n) => {
            msp.nxtpdu = frontier.wrapping_add(n);
        }
        Desegment::OneMoreSegment => {
            msp.flags |= msp_flags::REASSEMBLE_ENTIRE_SEGMENT;
            msp.nxtpdu = frontier.wrapping_add(1);
        }
        Desegment::UntilFin => {
            msp.flags |= msp_flags::REASSEMBLE_ENTIRE_SEGMENT;
            msp.nxtpdu = frontier.wrapping_add(1);
            flow.flags |= flow_flags::REASSEMBLE_UNTIL_FIN;
        }
    }
}

/// Dissect payload that is not part of any MSP; may iterate over several
/// PDUs within one segment and may open a new MSP for a trailing partial.
fn dissect_fresh(
    cfg: &EngineConfig,
    flow: &mut FlowState,
    registry: &mut SubdissectorRegistry,
    ctx: &DesegmentCtx,
    seq_start: u32,
    payload: &[u8],
    notes: &mut Vec<ExpertNote>,
) {
    let mut off = 0usize;
    loop {
        let offered = &payload[off..];
        if offered.is_empty() {
            return;
        }
        let seq_here = seq_start.wrapping_add(off as u32);
        let action = registry.dissect(
            &ctx.pdu_ctx(seq_here, false),
            offered,
            cfg.try_heuristic_first,
        );
        match action {
            None | Some((_, DissectAction::Rejected)) => return,
            Some((_, DissectAction::Consumed(n))) => {
                if n == 0 || n >= offered.len() {
                    return;
                }
                off += n;
            }
            Some((name, DissectAction::Failed(msg))) => {
                notes.push(ExpertNote::error(
                    NoteKind::SubdissectorFailed,
                    format!("{} failed: {}", name, msg),
                ));
                return;
            }
            Some((_, DissectAction::NeedMore { consumed, need })) => {
                if !cfg.allow_desegment {
                    return;
                }
                let pdu_start = seq_here.wrapping_add(consumed as u32);
                let nxtseq = seq_start.wrapping_add(payload.len() as u32);
                let mut msp = Msp {
                    seq: pdu_start,
                    nxtpdu: nxtseq, // placeholder; apply_need sets the real end
                    first_frame: ctx.frame,
                    first_frame_with_seq: ctx.frame,
                    last_frame: ctx.frame,
                    last_frame_time: ctx.ts,
                    flags: 0,
                    buf: FragmentBuffer::default(),
                };
                msp.buf.add(0, &payload[off + consumed..]);
                flow.multisegment_pdus.insert(pdu_start, msp);
                apply_need(flow, pdu_start, need);
                tracing::trace!(
                    frame = ctx.frame,
                    pdu_start,
                    "MSP opened for partial PDU"
                );
                return;
            }
        }
    }
}

/// A bare FIN closes an until-FIN request covering the byte before it.
#[allow(clippy::too_many_arguments)]
fn finalize_until_fin(
    cfg: &EngineConfig,
    flow: &mut FlowState,
    registry: &mut SubdissectorRegistry,
    ctx: &DesegmentCtx,
    msp_key: u32,
    seq_start: u32,
    out: &mut Vec<PduView>,
    notes: &mut Vec<ExpertNote>,
) {
    {
        let Some(msp) = flow.multisegment_pdus.get_mut(&msp_key) else {
            return;
        };
        if msp.has(msp_flags::GOT_ALL_SEGMENTS) {
            return;
        }
        msp.nxtpdu = seq_start;
        msp.flags |= msp_flags::GOT_ALL_SEGMENTS;
        msp.last_frame = ctx.frame;
        msp.last_frame_time = ctx.ts;
    }
    flow.flags &= !flow_flags::REASSEMBLE_UNTIL_FIN;
    if flow.fin == 0 {
        flow.fin = ctx.frame;
    }
    deliver_msp(cfg, flow, registry, ctx, msp_key, out, notes);
}

/// Visited pass: replay what the first pass recorded, mutating nothing.
fn replay(flow: &FlowState, ctx: &DesegmentCtx, out: &mut Vec<PduView>, notes: &mut Vec<ExpertNote>) {
    match flow.reassembly_replay.get(&ctx.frame) {
        Some(ReassemblyReplay::Retransmitted) => {
            notes.push(ExpertNote::note(
                NoteKind::RetransmittedSegmentData,
                "retransmitted TCP segment data",
            ));
        }
        Some(ReassemblyReplay::Delivered { msp_seqs }) => {
            for &msp_seq in msp_seqs {
                if let Some(msp) = flow.multisegment_pdus.get(&msp_seq) {
                    let len = msp.nxtpdu.wrapping_sub(msp.seq) as usize;
                    out.push(PduView {
                        stream_id: ctx.stream_id,
                        seq: msp.seq,
                        data: msp.buf.assembled(len),
                        first_frame: msp.first_frame,
                        last_frame: ctx.frame,
                    });
                }
            }
        }
        None => {}
    }
}
