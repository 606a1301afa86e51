//! The engine façade.
//!
//! Owns the conversation table, the MPTCP tracker, and the subdissector
//! registry, and runs one segment at a time through parsing, checksum,
//! conversation lookup, sequence analysis, MPTCP analysis, and reassembly.
//! Strictly single-threaded; a segment runs to completion before the next.
//!
//! Two-pass rule: state is mutated only when `meta.visited` is false.
//! Visited frames are served from the persistent per-frame tables and must
//! produce identical outcomes.

use crate::analysis::{self, flags as a, sequence, AnalysisRecord, Timing};
use crate::config::{ConfigError, EngineConfig};
use crate::conversation::{
    completeness, ConversationKey, ConversationId, ConversationSnapshot, ConversationTable,
    Endpoint, FlowDirection,
};
use crate::display;
use crate::expert::{ExpertNote, NoteKind};
use crate::flow::{static_flags, ProcessInfo};
use crate::mptcp::{self, MptcpOutcome, MptcpTracker};
use crate::options::TcpOption;
use crate::reassembly::{self, DesegmentCtx, PduView};
use crate::segment::{self, flags as th, ChecksumStatus, HeaderRecord, SegmentError, SegmentMeta};
use crate::subdissector::SubdissectorRegistry;
use std::collections::VecDeque;

/// One segment as handed in by the capture source.
#[derive(Debug, Clone, Copy)]
pub struct SegmentInput<'a> {
    pub meta: SegmentMeta,
    /// The full TCP segment: header plus payload.
    pub data: &'a [u8],
}

/// Everything the engine produces for one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub header: HeaderRecord,
    pub analysis: AnalysisRecord,
    pub timing: Option<Timing>,
    pub mptcp: Option<MptcpOutcome>,
    /// The first PDU completed by this segment, when any. All completed
    /// PDUs are available through [`Engine::iter_reassembled`].
    pub reassembled: Option<PduView>,
    pub expert: Vec<ExpertNote>,
    /// The rendered info column.
    pub info: String,
    pub completeness: u8,
    pub process_info: Option<ProcessInfo>,
}

/// TCP dissection and stream-analysis engine.
pub struct Engine {
    cfg: EngineConfig,
    conversations: ConversationTable,
    mptcp: MptcpTracker,
    registry: SubdissectorRegistry,
    pending: VecDeque<PduView>,
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Engine {
            cfg,
            conversations: ConversationTable::new(),
            mptcp: MptcpTracker::new(),
            registry: SubdissectorRegistry::new(),
            pending: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn registry_mut(&mut self) -> &mut SubdissectorRegistry {
        &mut self.registry
    }

    pub fn stream_count(&self) -> usize {
        self.conversations.len()
    }

    pub fn mptcp_stream_count(&self) -> usize {
        self.mptcp.connection_count()
    }

    pub fn conversation_snapshot(&self) -> Vec<ConversationSnapshot> {
        self.conversations.snapshot()
    }

    /// Attach process attribution to one side of a stream. Returns false
    /// when the stream id is unknown.
    pub fn set_process_info(
        &mut self,
        stream_id: u32,
        dir: FlowDirection,
        info: ProcessInfo,
    ) -> bool {
        if stream_id as usize >= self.conversations.len() {
            return false;
        }
        let conv = self.conversations.get_mut(ConversationId(stream_id));
        let (fwd, _) = conv.flows_mut(dir);
        fwd.process_info = Some(info);
        true
    }

    /// Completed PDUs from the most recent `process_segment` calls, oldest
    /// first. Draining; not restartable within a pass.
    pub fn iter_reassembled(&mut self) -> impl Iterator<Item = PduView> + '_ {
        self.pending.drain(..)
    }

    /// Run one segment through the pipeline.
    pub fn process_segment(&mut self, input: &SegmentInput<'_>) -> Result<Outcome, SegmentError> {
        let meta = input.meta;
        let mut notes: Vec<ExpertNote> = Vec::new();

        let mut header = segment::parse(input.data, self.cfg.exp_options_with_magic, &mut notes)?;

        if self.cfg.check_checksum && !meta.fragmented && !meta.in_error {
            header.checksum_status =
                segment::verify_checksum(meta.src, meta.dst, input.data, header.checksum);
            match header.checksum_status {
                ChecksumStatus::Bad { computed } => notes.push(ExpertNote::warn(
                    NoteKind::ChecksumBad,
                    format!(
                        "bad checksum 0x{:04x}, expected 0x{:04x}",
                        header.checksum, computed
                    ),
                )),
                ChecksumStatus::Ffff => notes.push(ExpertNote::note(
                    NoteKind::ChecksumFfff,
                    "checksum 0xFFFF instead of 0x0000 (RFC 1624)",
                )),
                _ => {}
            }
        }
        let desegment_ok = header.checksum_status.desegment_ok();

        let src = Endpoint {
            ip: meta.src,
            port: header.src_port,
        };
        let dst = Endpoint {
            ip: meta.dst,
            port: header.dst_port,
        };
        let (key, dir) = ConversationKey::new(src, dst);
        let (mut conv_id, _created) = self.conversations.find_or_create(key, meta.frame, meta.ts);

        // Port reuse: a fresh SYN (or SYN-ACK) with an unexpected sequence
        // number on a 4-tuple that already completed a handshake opens a new
        // conversation. Unclear how MPTCP's multiple SYNs should interact
        // with this; current behaviour is kept and hooks would go here.
        let mut extra_flags = 0u32;
        if !meta.visited && !meta.in_error && self.cfg.analyze_seq {
            let conv = self.conversations.get(conv_id);
            let (fwd, _) = conv.flows(dir);
            let reused = (header.is_pure_syn()
                && fwd.static_flags & static_flags::SAW_SYN != 0
                && fwd.base_seq_set()
                && header.seq != fwd.base_seq)
                || (header.is_syn_ack()
                    && fwd.static_flags & static_flags::SAW_SYNACK != 0
                    && fwd.base_seq_set()
                    && header.seq != fwd.base_seq);
            if reused {
                conv_id = self.conversations.start_new(key, meta.frame, meta.ts);
                extra_flags |= a::REUSED_PORTS;
                tracing::debug!(frame = meta.frame, "port numbers reused, new conversation");
            }
        }

        // Conversation-level bookkeeping. A segment quoted inside an ICMP
        // error is shown but must not advance any state.
        {
            let conv = self.conversations.get_mut(conv_id);
            if !meta.visited && !meta.in_error {
                conv.last_frame = meta.frame;
                if header.is_pure_syn() {
                    conv.completeness |= completeness::SYN;
                    conv.server_port = Some(header.dst_port);
                    conv.syn_direction = Some(dir);
                } else if header.is_syn_ack() {
                    conv.completeness |= completeness::SYNACK;
                    conv.server_port = Some(header.src_port);
                } else if header.is_ack() {
                    conv.completeness |= completeness::ACK;
                }
                if header.seglen > 0 {
                    conv.completeness |= completeness::DATA;
                }
                if header.is_fin() {
                    conv.completeness |= completeness::FIN;
                }
                if header.is_rst() {
                    conv.completeness |= completeness::RST;
                }
                let (fwd, _) = conv.flows_mut(dir);
                fwd.packets += 1;
                fwd.bytes += header.seglen as u64;
                let snapshot = conv.completeness;
                conv.completeness_table.insert(meta.frame, snapshot);
            }
            header.stream_id = conv.stream_id;
        }

        let timing = if self.cfg.calculate_ts && !meta.in_error {
            let conv = self.conversations.get_mut(conv_id);
            Some(analysis::update_timing(
                conv,
                &header,
                meta.ts,
                meta.frame,
                meta.visited,
            ))
        } else {
            None
        };

        let analysis_record = if self.cfg.analyze_seq && !meta.in_error {
            let conv = self.conversations.get_mut(conv_id);
            if meta.visited {
                conv.acked_table
                    .get(&(meta.frame, header.seq, header.ack))
                    .cloned()
                    .unwrap_or_default()
            } else {
                sequence::analyze(
                    conv,
                    dir,
                    &header,
                    meta.ts,
                    meta.frame,
                    extra_flags,
                    &self.cfg,
                )
            }
        } else {
            AnalysisRecord::default()
        };

        // Relative view and effective window.
        let rel_seq_val;
        {
            let conv = self.conversations.get(conv_id);
            let (fwd, rev) = conv.flows(dir);
            rel_seq_val = fwd.rel_seq(header.seq);
            if self.cfg.analyze_seq {
                if self.cfg.relative_seq {
                    header.rel_seq = Some(rel_seq_val);
                    header.rel_ack = Some(rev.rel_seq(header.ack));
                    // SACK edges acknowledge the other side's data, so they
                    // are shown in the reverse flow's sequence space.
                    if rev.base_seq_set() {
                        for range in header.sack_ranges.iter_mut() {
                            range.0 = range.0.wrapping_sub(rev.base_seq);
                            range.1 = range.1.wrapping_sub(rev.base_seq);
                        }
                    }
                }
                header.effective_window = Some(sequence::scaled_window(
                    header.window,
                    fwd.win_scale,
                    self.cfg.default_window_scaling,
                    header.is_syn(),
                ));
            }

            // SNACK holes are reported in units of the largest acked
            // segment size seen so far.
            for opt in &header.options {
                if let TcpOption::ScpsSnack { offset, size } = opt {
                    let scale = rev.maxsizeacked.max(1);
                    let hole_start = header.ack.wrapping_add(*offset as u32 * scale);
                    let hole_end = hole_start.wrapping_add(*size as u32 * scale);
                    notes.push(ExpertNote::note(
                        NoteKind::ScpsSnackHole,
                        format!("SNACK reports missing bytes {}..{}", hole_start, hole_end),
                    ));
                }
            }
        }

        let mptcp_out = if self.cfg.mptcp.analyze_mptcp
            && !meta.in_error
            && (header.mptcp.is_some() || self.conversations.get(conv_id).mptcp.is_some())
        {
            let opts = mptcp::MptcpOptions {
                relative_seq: self.cfg.mptcp.relative_seq,
                analyze_mappings: self.cfg.mptcp.analyze_mappings,
                intersubflows_retransmission: self.cfg.mptcp.intersubflows_retransmission,
            };
            Some(mptcp::process_segment(
                &mut self.mptcp,
                self.conversations.arena_mut(),
                conv_id,
                dir,
                &header,
                rel_seq_val,
                meta.src,
                meta.dst,
                meta.frame,
                meta.visited,
                opts,
                &mut notes,
            ))
        } else {
            None
        };

        // Reassembly and subdissection.
        let mut pdus: Vec<PduView> = Vec::new();
        if self.cfg.allow_desegment && desegment_ok && !meta.in_error {
            let skip = self.cfg.no_subdissector_on_error && analysis_record.is_retransmission_like();
            if !skip {
                let payload_full = &input.data[header.header_len..];
                // Urgent data is out-of-band; the handler sees what follows.
                let urg_skip = if header.has(th::URG) {
                    (header.urgent_ptr as usize).min(payload_full.len())
                } else {
                    0
                };
                let payload = &payload_full[urg_skip..];
                let payload_seq = rel_seq_val
                    .wrapping_add(if header.is_syn() { 1 } else { 0 })
                    .wrapping_add(urg_skip as u32);
                let dctx = DesegmentCtx {
                    stream_id: header.stream_id,
                    frame: meta.frame,
                    ts: meta.ts,
                    visited: meta.visited,
                    src_port: header.src_port,
                    dst_port: header.dst_port,
                    fin: header.is_fin(),
                };
                let conv = self.conversations.get_mut(conv_id);
                let (fwd, _) = conv.flows_mut(dir);
                reassembly::process_payload(
                    &self.cfg,
                    fwd,
                    &mut self.registry,
                    &dctx,
                    payload_seq,
                    payload,
                    &mut pdus,
                    &mut notes,
                );
            }
        }

        let reassembled = pdus.first().cloned();
        self.pending.extend(pdus);

        let info = display::info_column(&header, Some(&analysis_record), &self.cfg);

        let conv = self.conversations.get(conv_id);
        let (fwd, _) = conv.flows(dir);
        let completeness = conv
            .completeness_table
            .get(&meta.frame)
            .copied()
            .unwrap_or(conv.completeness);
        Ok(Outcome {
            info,
            completeness,
            process_info: fwd.process_info.clone(),
            header,
            analysis: analysis_record,
            timing,
            mptcp: mptcp_out,
            reassembled,
            expert: notes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mptcp::token_and_idsn;
    use crate::subdissector::testing::FixedSizePdus;
    use std::net::{IpAddr, Ipv4Addr};

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    struct SegmentBuilder {
        sport: u16,
        dport: u16,
        flags: u16,
        seq: u32,
        ack: u32,
        window: u16,
        options: Vec<u8>,
        payload: Vec<u8>,
    }

    impl SegmentBuilder {
        fn new(sport: u16, dport: u16, flags: u16, seq: u32, ack: u32) -> Self {
            SegmentBuilder {
                sport,
                dport,
                flags,
                seq,
                ack,
                window: 65535,
                options: Vec::new(),
                payload: Vec::new(),
            }
        }

        fn window(mut self, window: u16) -> Self {
            self.window = window;
            self
        }

        fn options(mut self, options: &[u8]) -> Self {
            self.options = options.to_vec();
            self
        }

        fn payload(mut self, payload: &[u8]) -> Self {
            self.payload = payload.to_vec();
            self
        }

        fn build(&self) -> Vec<u8> {
            let mut opts = self.options.clone();
            while opts.len() % 4 != 0 {
                opts.push(1); // NOP padding
            }
            let header_len = 20 + opts.len();
            let mut pkt = vec![0u8; header_len + self.payload.len()];
            pkt[0..2].copy_from_slice(&self.sport.to_be_bytes());
            pkt[2..4].copy_from_slice(&self.dport.to_be_bytes());
            pkt[4..8].copy_from_slice(&self.seq.to_be_bytes());
            pkt[8..12].copy_from_slice(&self.ack.to_be_bytes());
            pkt[12] = (((header_len / 4) as u8) << 4) | ((self.flags >> 8) & 0x0F) as u8;
            pkt[13] = (self.flags & 0xFF) as u8;
            pkt[14..16].copy_from_slice(&self.window.to_be_bytes());
            pkt[20..20 + opts.len()].copy_from_slice(&opts);
            pkt[header_len..].copy_from_slice(&self.payload);
            pkt
        }
    }

    struct Driver {
        engine: Engine,
        frame: u32,
    }

    impl Driver {
        fn new(cfg: EngineConfig) -> Self {
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();
            Driver {
                engine: Engine::new(cfg).unwrap(),
                frame: 0,
            }
        }

        fn feed(&mut self, src: IpAddr, dst: IpAddr, data: &[u8], ts: f64) -> Outcome {
            self.frame += 1;
            self.feed_at(self.frame, src, dst, data, ts, false)
        }

        fn feed_at(
            &mut self,
            frame: u32,
            src: IpAddr,
            dst: IpAddr,
            data: &[u8],
            ts: f64,
            visited: bool,
        ) -> Outcome {
            let meta = SegmentMeta {
                src,
                dst,
                ts,
                frame,
                visited,
                fragmented: false,
                in_error: false,
            };
            self.engine
                .process_segment(&SegmentInput { meta, data })
                .unwrap()
        }

        fn feed_in_error(&mut self, src: IpAddr, dst: IpAddr, data: &[u8], ts: f64) -> Outcome {
            self.frame += 1;
            let meta = SegmentMeta {
                src,
                dst,
                ts,
                frame: self.frame,
                visited: false,
                fragmented: false,
                in_error: true,
            };
            self.engine
                .process_segment(&SegmentInput { meta, data })
                .unwrap()
        }

        fn handshake(&mut self) {
            let syn = SegmentBuilder::new(1234, 80, th::SYN, 1000, 0).build();
            let synack = SegmentBuilder::new(80, 1234, th::SYN | th::ACK, 5000, 1001).build();
            let ack = SegmentBuilder::new(1234, 80, th::ACK, 1001, 5001).build();
            self.feed(CLIENT, SERVER, &syn, 0.000);
            self.feed(SERVER, CLIENT, &synack, 0.100);
            self.feed(CLIENT, SERVER, &ack, 0.150);
        }
    }

    #[test]
    fn s1_handshake_relative_seqs_and_irtt() {
        let mut d = Driver::new(EngineConfig::default());
        let syn = SegmentBuilder::new(1234, 80, th::SYN, 1000, 0).build();
        let synack = SegmentBuilder::new(80, 1234, th::SYN | th::ACK, 5000, 1001).build();
        let ack = SegmentBuilder::new(1234, 80, th::ACK, 1001, 5001).build();

        let o1 = d.feed(CLIENT, SERVER, &syn, 0.000);
        let o2 = d.feed(SERVER, CLIENT, &synack, 0.100);
        let o3 = d.feed(CLIENT, SERVER, &ack, 0.150);

        assert_eq!(o1.header.stream_id, 0);
        assert_eq!(o1.header.rel_seq, Some(0));
        assert_eq!(o2.header.rel_seq, Some(0));
        assert_eq!(o3.header.rel_seq, Some(1));
        assert_eq!(o3.header.rel_ack, Some(1));
        assert!((o3.timing.unwrap().first_rtt.unwrap() - 0.150).abs() < 1e-9);
        assert_eq!(d.engine.stream_count(), 1);
        assert!(o3.info.contains("Seq=1 Ack=1"));
    }

    #[test]
    fn s2_retransmission_info_column() {
        let mut d = Driver::new(EngineConfig::default());
        d.handshake();
        let data = SegmentBuilder::new(1234, 80, th::ACK, 1001, 5001)
            .payload(&[0xAB; 100])
            .build();
        d.feed(CLIENT, SERVER, &data, 1.000);
        let retrans = d.feed(CLIENT, SERVER, &data, 1.300);
        assert!(retrans.analysis.has(a::RETRANSMISSION));
        assert!((retrans.analysis.rto.unwrap() - 0.300).abs() < 1e-9);
        assert_eq!(retrans.analysis.rto_frame, Some(4));
        assert!(retrans.info.starts_with("[TCP Retransmission]"));
    }

    #[test]
    fn s4_port_reuse_creates_new_stream() {
        let mut d = Driver::new(EngineConfig::default());
        d.handshake();
        let fin = SegmentBuilder::new(1234, 80, th::FIN | th::ACK, 1001, 5001).build();
        d.feed(CLIENT, SERVER, &fin, 2.0);

        let syn2 = SegmentBuilder::new(1234, 80, th::SYN, 9000, 0).build();
        let o = d.feed(CLIENT, SERVER, &syn2, 10.0);
        assert_eq!(o.header.stream_id, 1);
        assert!(o.analysis.has(a::REUSED_PORTS));
        assert!(o.info.starts_with("[TCP Port numbers reused]"));
        assert_eq!(d.engine.stream_count(), 2);
    }

    #[test]
    fn s5_reassembly_across_three_segments() {
        let mut d = Driver::new(EngineConfig::default());
        d.engine
            .registry_mut()
            .register_port(80, Box::new(FixedSizePdus::new(250)));
        d.handshake();

        let mk = |seq: u32, bytes: &[u8]| {
            SegmentBuilder::new(1234, 80, th::ACK, seq, 5001)
                .payload(bytes)
                .build()
        };
        let chunk = vec![0x42u8; 100];
        let o1 = d.feed(CLIENT, SERVER, &mk(1001, &chunk), 1.0);
        let o2 = d.feed(CLIENT, SERVER, &mk(1101, &chunk), 1.1);
        let o3 = d.feed(CLIENT, SERVER, &mk(1201, &chunk), 1.2);

        assert!(o1.reassembled.is_none());
        assert!(o2.reassembled.is_none());
        let pdu = o3.reassembled.expect("PDU completed on third segment");
        assert_eq!(pdu.seq, 1);
        assert_eq!(pdu.data.len(), 250);
        assert_eq!(pdu.first_frame, 4);
        assert_eq!(pdu.last_frame, 6);
        let drained: Vec<_> = d.engine.iter_reassembled().collect();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0], pdu);
        // Drained means drained.
        assert_eq!(d.engine.iter_reassembled().count(), 0);
    }

    #[test]
    fn s6_mptcp_token_and_dsn_conversion() {
        let key: u64 = 1;
        let (token, idsn) = token_and_idsn(key);

        let mut cfg = EngineConfig::default();
        cfg.mptcp.analyze_mappings = true;
        let mut d = Driver::new(cfg);

        // MP_CAPABLE SYN carrying the client key (option length 12 + padding).
        let mut capable = vec![30, 12, 0x00, 0x01];
        capable.extend_from_slice(&key.to_be_bytes());
        let syn = SegmentBuilder::new(1234, 80, th::SYN, 1000, 0)
            .options(&capable)
            .build();
        let o1 = d.feed(CLIENT, SERVER, &syn, 0.0);
        let m1 = o1.mptcp.expect("MPTCP analysis present");
        assert_eq!(m1.token, Some(token));
        assert_eq!(m1.stream_id, Some(0));
        assert_eq!(d.engine.mptcp_stream_count(), 1);

        let synack = SegmentBuilder::new(80, 1234, th::SYN | th::ACK, 5000, 1001).build();
        d.feed(SERVER, CLIENT, &synack, 0.1);

        // DSS with a 32-bit DSN=5 mapping ssn 1, length 300 (option len 14).
        let mut dss = vec![30, 14, 0x20, 0x04];
        dss.extend_from_slice(&5u32.to_be_bytes());
        dss.extend_from_slice(&1u32.to_be_bytes());
        dss.extend_from_slice(&300u16.to_be_bytes());
        let data = SegmentBuilder::new(1234, 80, th::ACK, 1001, 5001)
            .options(&dss)
            .payload(&[0x11; 100])
            .build();
        let o3 = d.feed(CLIENT, SERVER, &data, 0.2);
        let m3 = o3.mptcp.expect("MPTCP analysis present");
        let expected = (idsn & 0xFFFF_FFFF_0000_0000) | 5;
        assert_eq!(m3.dsn, Some(expected));
        assert_eq!(m3.dsn_relative, Some(expected.wrapping_sub(idsn)));
        assert!(!m3.mapping_missing);
    }

    #[test]
    fn visited_pass_is_idempotent_and_identical() {
        let mut d = Driver::new(EngineConfig::default());
        d.engine
            .registry_mut()
            .register_port(80, Box::new(FixedSizePdus::new(150)));

        let segments: Vec<(IpAddr, IpAddr, Vec<u8>, f64)> = vec![
            (
                CLIENT,
                SERVER,
                SegmentBuilder::new(1234, 80, th::SYN, 1000, 0).build(),
                0.0,
            ),
            (
                SERVER,
                CLIENT,
                SegmentBuilder::new(80, 1234, th::SYN | th::ACK, 5000, 1001).build(),
                0.1,
            ),
            (
                CLIENT,
                SERVER,
                SegmentBuilder::new(1234, 80, th::ACK, 1001, 5001).build(),
                0.15,
            ),
            (
                CLIENT,
                SERVER,
                SegmentBuilder::new(1234, 80, th::ACK, 1001, 5001)
                    .payload(&[1u8; 100])
                    .build(),
                1.0,
            ),
            // Retransmission.
            (
                CLIENT,
                SERVER,
                SegmentBuilder::new(1234, 80, th::ACK, 1001, 5001)
                    .payload(&[1u8; 100])
                    .build(),
                1.5,
            ),
            // Completes the 150-byte PDU.
            (
                CLIENT,
                SERVER,
                SegmentBuilder::new(1234, 80, th::ACK, 1101, 5001)
                    .payload(&[2u8; 100])
                    .build(),
                2.0,
            ),
        ];

        let mut first_pass = Vec::new();
        for (i, (src, dst, data, ts)) in segments.iter().enumerate() {
            first_pass.push(d.feed_at(i as u32 + 1, *src, *dst, data, *ts, false));
        }
        d.engine.iter_reassembled().count();

        for (i, (src, dst, data, ts)) in segments.iter().enumerate() {
            let replay = d.feed_at(i as u32 + 1, *src, *dst, data, *ts, true);
            assert_eq!(replay, first_pass[i], "frame {} differs on revisit", i + 1);
        }
        // No new conversations, no duplicated state.
        assert_eq!(d.engine.stream_count(), 1);
    }

    #[test]
    fn checksum_failure_blocks_desegmentation() {
        let cfg = EngineConfig {
            check_checksum: true,
            ..Default::default()
        };
        let mut d = Driver::new(cfg);
        d.engine
            .registry_mut()
            .register_port(80, Box::new(FixedSizePdus::new(250)));
        d.handshake();

        // Bogus checksum field.
        let mut data = SegmentBuilder::new(1234, 80, th::ACK, 1001, 5001)
            .payload(&[0x42; 100])
            .build();
        data[16] = 0xDE;
        data[17] = 0xAD;
        let o = d.feed(CLIENT, SERVER, &data, 1.0);
        assert!(matches!(
            o.header.checksum_status,
            ChecksumStatus::Bad { .. }
        ));
        assert!(o.expert.iter().any(|n| n.kind == NoteKind::ChecksumBad));
        // No MSP was opened for the bad segment.
        let snap = d.engine.conversation_snapshot();
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn short_segment_is_an_error() {
        let mut d = Driver::new(EngineConfig::default());
        let meta = SegmentMeta {
            src: CLIENT,
            dst: SERVER,
            ts: 0.0,
            frame: 1,
            visited: false,
            fragmented: false,
            in_error: false,
        };
        let err = d
            .engine
            .process_segment(&SegmentInput {
                meta,
                data: &[0u8; 10],
            })
            .unwrap_err();
        assert!(matches!(err, SegmentError::ShortSegment { .. }));
    }

    #[test]
    fn analyze_seq_off_keeps_raw_numbers() {
        let cfg = EngineConfig {
            analyze_seq: false,
            relative_seq: false,
            ..Default::default()
        };
        let mut d = Driver::new(cfg);
        let syn = SegmentBuilder::new(1234, 80, th::SYN, 1000, 0).build();
        let o = d.feed(CLIENT, SERVER, &syn, 0.0);
        assert_eq!(o.header.rel_seq, None);
        assert_eq!(o.analysis, AnalysisRecord::default());
        assert!(o.info.contains("Seq=1000"));
    }

    #[test]
    fn process_info_surfaces_on_outcome() {
        let mut d = Driver::new(EngineConfig::default());
        d.handshake();
        assert!(d.engine.set_process_info(
            0,
            FlowDirection::AtoB,
            ProcessInfo {
                uid: 1000,
                pid: 4242,
                username: "web".into(),
                command: "nginx".into(),
            },
        ));
        let data = SegmentBuilder::new(1234, 80, th::ACK, 1001, 5001)
            .payload(&[1; 10])
            .build();
        let o = d.feed(CLIENT, SERVER, &data, 1.0);
        assert_eq!(o.process_info.map(|p| p.pid), Some(4242));
    }

    #[test]
    fn icmp_quoted_segment_leaves_state_untouched() {
        let mut d = Driver::new(EngineConfig::default());
        d.handshake();
        let data = SegmentBuilder::new(1234, 80, th::ACK, 1001, 5001)
            .payload(&[7u8; 100])
            .build();
        d.feed(CLIENT, SERVER, &data, 1.0);
        let packets_before = d.engine.conversation_snapshot()[0].packets_a_to_b;

        // The same segment quoted back inside an ICMP error: shown, but it
        // must neither count nor classify as a retransmission.
        let o = d.feed_in_error(CLIENT, SERVER, &data, 1.1);
        assert_eq!(o.analysis, AnalysisRecord::default());
        assert_eq!(o.header.seq, 1001);
        assert!(o.timing.is_none());
        let packets_after = d.engine.conversation_snapshot()[0].packets_a_to_b;
        assert_eq!(packets_before, packets_after);

        // A real retransmission afterwards is still classified against the
        // untouched frontier.
        let retrans = d.feed(CLIENT, SERVER, &data, 2.0);
        assert!(retrans.analysis.has(a::RETRANSMISSION));
    }

    #[test]
    fn completeness_accumulates() {
        let mut d = Driver::new(EngineConfig::default());
        d.handshake();
        let data = SegmentBuilder::new(1234, 80, th::ACK | th::PSH, 1001, 5001)
            .payload(&[1; 10])
            .build();
        let fin = SegmentBuilder::new(1234, 80, th::FIN | th::ACK, 1011, 5001).build();
        d.feed(CLIENT, SERVER, &data, 1.0);
        let o = d.feed(CLIENT, SERVER, &fin, 2.0);
        let want = completeness::SYN
            | completeness::SYNACK
            | completeness::ACK
            | completeness::DATA
            | completeness::FIN;
        assert_eq!(o.completeness, want);
    }

    #[test]
    fn window_scaling_applied_after_syn_exchange() {
        let mut d = Driver::new(EngineConfig::default());
        // SYN with window scale shift 3.
        let syn = SegmentBuilder::new(1234, 80, th::SYN, 1000, 0)
            .options(&[3, 3, 3])
            .build();
        let synack = SegmentBuilder::new(80, 1234, th::SYN | th::ACK, 5000, 1001)
            .options(&[3, 3, 2])
            .build();
        let ack = SegmentBuilder::new(1234, 80, th::ACK, 1001, 5001)
            .window(1000)
            .build();
        let o1 = d.feed(CLIENT, SERVER, &syn, 0.0);
        // SYN itself is never scaled.
        assert_eq!(o1.header.effective_window, Some(65535));
        d.feed(SERVER, CLIENT, &synack, 0.1);
        let o3 = d.feed(CLIENT, SERVER, &ack, 0.15);
        assert_eq!(o3.header.effective_window, Some(1000 << 3));
        assert!(o3.info.contains("Win=8000"));
    }
}
