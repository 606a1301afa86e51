//! Multipath TCP: option decoding, subflow linkage, and DSN mapping.
//!
//! A TCP conversation becomes an MPTCP subflow the first time it carries a
//! kind-30 option. Subflows are linked into one MPTCP connection through the
//! token derived from the MP_CAPABLE key (or carried literally in MP_JOIN).
//! DSS mappings translate subflow sequence numbers into the 64-bit data
//! sequence space; with the cross-subflow option enabled, DSN ranges seen on
//! one subflow are matched against the others to spot reinjected data.

use crate::conversation::{Conversation, ConversationId, FlowDirection};
use crate::expert::{ExpertNote, NoteKind};
use crate::segment::HeaderRecord;
use ahash::AHashMap;
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::net::IpAddr;

pub const SUBTYPE_CAPABLE: u8 = 0;
pub const SUBTYPE_JOIN: u8 = 1;
pub const SUBTYPE_DSS: u8 = 2;
pub const SUBTYPE_ADD_ADDR: u8 = 3;
pub const SUBTYPE_REMOVE_ADDR: u8 = 4;
pub const SUBTYPE_PRIO: u8 = 5;
pub const SUBTYPE_FAIL: u8 = 6;
pub const SUBTYPE_FASTCLOSE: u8 = 7;

/// DSS flag bits (second payload byte).
pub mod dss_flags {
    pub const DATA_ACK_PRESENT: u8 = 0x01;
    pub const DATA_ACK_8BYTES: u8 = 0x02;
    pub const MAPPING_PRESENT: u8 = 0x04;
    pub const DSN_8BYTES: u8 = 0x08;
    pub const DATA_FIN: u8 = 0x10;
}

/// MP_CAPABLE crypto negotiation bits.
pub const CAPABLE_ALGO_MASK: u8 = 0x3F;
pub const CAPABLE_HMAC_SHA1: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MpJoin {
    Syn {
        backup: bool,
        address_id: u8,
        token: u32,
        nonce: u32,
    },
    SynAck {
        backup: bool,
        address_id: u8,
        hmac_truncated: u64,
        nonce: u32,
    },
    Ack {
        hmac: [u8; 20],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DssOpt {
    pub flags: u8,
    pub data_ack: Option<u64>,
    /// Raw DSN as carried on the wire: 32-bit unless [`dss_flags::DSN_8BYTES`].
    pub raw_dsn: Option<u64>,
    pub ssn: Option<u32>,
    pub data_len: Option<u16>,
    pub checksum: Option<u16>,
}

impl DssOpt {
    #[inline]
    pub fn mapping_present(&self) -> bool {
        self.flags & dss_flags::MAPPING_PRESENT != 0
    }

    #[inline]
    pub fn dsn_is_8bytes(&self) -> bool {
        self.flags & dss_flags::DSN_8BYTES != 0
    }

    #[inline]
    pub fn data_fin(&self) -> bool {
        self.flags & dss_flags::DATA_FIN != 0
    }
}

/// One decoded MPTCP option.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MptcpOpt {
    Capable {
        version: u8,
        flags: u8,
        sender_key: Option<u64>,
        receiver_key: Option<u64>,
    },
    Join(MpJoin),
    Dss(DssOpt),
    AddAddr {
        address_id: u8,
        addr: Option<IpAddr>,
        port: Option<u16>,
    },
    RemoveAddr {
        address_ids: Vec<u8>,
    },
    Prio {
        backup: bool,
        address_id: Option<u8>,
    },
    Fail {
        dsn: u64,
    },
    FastClose {
        receiver_key: u64,
    },
    Unknown {
        subtype: u8,
        payload: Vec<u8>,
    },
}

impl MptcpOpt {
    /// Decode the payload of a kind-30 option (kind and length octets already
    /// stripped). `None` means the payload was empty or truncated beyond use.
    pub fn parse(payload: &[u8], notes: &mut Vec<ExpertNote>) -> Option<MptcpOpt> {
        let first = *payload.first()?;
        let subtype = first >> 4;

        let opt = match subtype {
            SUBTYPE_CAPABLE => {
                let version = first & 0x0F;
                let flags = payload.get(1).copied().unwrap_or(0);
                let algo = flags & CAPABLE_ALGO_MASK;
                if algo == 0 {
                    notes.push(ExpertNote::warn(
                        NoteKind::MptcpMissingAlgorithm,
                        "MP_CAPABLE advertises no checksum algorithm",
                    ));
                } else if algo != CAPABLE_HMAC_SHA1 {
                    notes.push(ExpertNote::warn(
                        NoteKind::MptcpUnsupportedAlgorithm,
                        format!("MP_CAPABLE advertises unsupported algorithm 0x{:02x}", algo),
                    ));
                }
                let sender_key = read_u64(payload, 2);
                let receiver_key = read_u64(payload, 10);
                MptcpOpt::Capable {
                    version,
                    flags,
                    sender_key,
                    receiver_key,
                }
            }
            SUBTYPE_JOIN => match payload.len() {
                // SYN form: flags/address-id, receiver token, sender nonce.
                10 => MptcpOpt::Join(MpJoin::Syn {
                    backup: first & 0x01 != 0,
                    address_id: payload[1],
                    token: read_u32(payload, 2)?,
                    nonce: read_u32(payload, 6)?,
                }),
                // SYN/ACK form: truncated HMAC plus nonce.
                14 => MptcpOpt::Join(MpJoin::SynAck {
                    backup: first & 0x01 != 0,
                    address_id: payload[1],
                    hmac_truncated: read_u64(payload, 2)?,
                    nonce: read_u32(payload, 10)?,
                }),
                // Final ACK form: full 160-bit HMAC.
                22 => {
                    let mut hmac = [0u8; 20];
                    hmac.copy_from_slice(&payload[2..22]);
                    MptcpOpt::Join(MpJoin::Ack { hmac })
                }
                _ => MptcpOpt::Unknown {
                    subtype,
                    payload: payload.to_vec(),
                },
            },
            SUBTYPE_DSS => {
                let flags = payload.get(1).copied().unwrap_or(0);
                let mut pos = 2usize;
                let mut dss = DssOpt {
                    flags,
                    data_ack: None,
                    raw_dsn: None,
                    ssn: None,
                    data_len: None,
                    checksum: None,
                };
                if flags & dss_flags::DATA_ACK_PRESENT != 0 {
                    if flags & dss_flags::DATA_ACK_8BYTES != 0 {
                        dss.data_ack = read_u64(payload, pos);
                        pos += 8;
                    } else {
                        dss.data_ack = read_u32(payload, pos).map(u64::from);
                        pos += 4;
                    }
                }
                if flags & dss_flags::MAPPING_PRESENT != 0 {
                    if flags & dss_flags::DSN_8BYTES != 0 {
                        dss.raw_dsn = read_u64(payload, pos);
                        pos += 8;
                    } else {
                        dss.raw_dsn = read_u32(payload, pos).map(u64::from);
                        pos += 4;
                    }
                    dss.ssn = read_u32(payload, pos);
                    pos += 4;
                    dss.data_len = read_u16(payload, pos);
                    pos += 2;
                    dss.checksum = read_u16(payload, pos);
                    if dss.data_len == Some(0) {
                        notes.push(ExpertNote::note(
                            NoteKind::MptcpInfiniteMapping,
                            "DSS carries an infinite mapping (data-level length 0)",
                        ));
                    }
                }
                MptcpOpt::Dss(dss)
            }
            SUBTYPE_ADD_ADDR => {
                let ipver = first & 0x0F;
                let address_id = payload.get(1).copied().unwrap_or(0);
                let (addr, after) = match ipver {
                    4 if payload.len() >= 6 => (
                        Some(IpAddr::from([payload[2], payload[3], payload[4], payload[5]])),
                        6,
                    ),
                    6 if payload.len() >= 18 => {
                        let mut a = [0u8; 16];
                        a.copy_from_slice(&payload[2..18]);
                        (Some(IpAddr::from(a)), 18)
                    }
                    _ => (None, payload.len()),
                };
                MptcpOpt::AddAddr {
                    address_id,
                    addr,
                    port: read_u16(payload, after),
                }
            }
            SUBTYPE_REMOVE_ADDR => MptcpOpt::RemoveAddr {
                address_ids: payload[1..].to_vec(),
            },
            SUBTYPE_PRIO => MptcpOpt::Prio {
                backup: first & 0x01 != 0,
                address_id: payload.get(1).copied(),
            },
            SUBTYPE_FAIL => match read_u64(payload, 2) {
                Some(dsn) => MptcpOpt::Fail { dsn },
                None => MptcpOpt::Unknown {
                    subtype,
                    payload: payload.to_vec(),
                },
            },
            SUBTYPE_FASTCLOSE => match read_u64(payload, 2) {
                Some(receiver_key) => MptcpOpt::FastClose { receiver_key },
                None => MptcpOpt::Unknown {
                    subtype,
                    payload: payload.to_vec(),
                },
            },
            _ => MptcpOpt::Unknown {
                subtype,
                payload: payload.to_vec(),
            },
        };
        Some(opt)
    }
}

fn read_u16(b: &[u8], at: usize) -> Option<u16> {
    b.get(at..at + 2).map(|s| u16::from_be_bytes([s[0], s[1]]))
}

fn read_u32(b: &[u8], at: usize) -> Option<u32> {
    b.get(at..at + 4)
        .map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
}

fn read_u64(b: &[u8], at: usize) -> Option<u64> {
    b.get(at..at + 8).map(|s| {
        u64::from_be_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]])
    })
}

/// Token and initial DSN derived from an MP_CAPABLE key: SHA-1 of the
/// big-endian key; token is the first 32 bits, IDSN the last 64.
pub fn token_and_idsn(key: u64) -> (u32, u64) {
    let digest = Sha1::digest(key.to_be_bytes());
    let token = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let idsn = u64::from_be_bytes([
        digest[12], digest[13], digest[14], digest[15], digest[16], digest[17], digest[18],
        digest[19],
    ]);
    (token, idsn)
}

/// Expand a 32-bit wire DSN into the 64-bit space using the meta flow's base.
#[inline]
pub fn dsn_expand(base_dsn: u64, raw: u32) -> u64 {
    (base_dsn & 0xFFFF_FFFF_0000_0000) | raw as u64
}

// ---------------------------------------------------------------------------
// Per-flow subflow state
// ---------------------------------------------------------------------------

/// Static flags on a [`MetaFlow`].
pub mod meta_flags {
    pub const HAS_KEY: u8 = 0x01;
    pub const HAS_TOKEN: u8 = 0x02;
    /// The full 64-bit base DSN (including its high 32 bits) is known, so
    /// 32-bit wire DSNs can be expanded.
    pub const HAS_BASE_DSN_MSB: u8 = 0x04;
}

/// One direction of the MPTCP connection's data sequence space.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetaFlow {
    pub key: Option<u64>,
    pub token: Option<u32>,
    pub base_dsn: Option<u64>,
    pub static_flags: u8,
    pub ip_src: Option<IpAddr>,
    pub ip_dst: Option<IpAddr>,
    pub sport: u16,
    pub dport: u16,
}

impl MetaFlow {
    /// Record the key and everything derived from it; returns the token.
    fn assign_key(&mut self, key: u64) -> u32 {
        let (token, idsn) = token_and_idsn(key);
        self.key = Some(key);
        self.token = Some(token);
        self.base_dsn = Some(idsn);
        self.static_flags |=
            meta_flags::HAS_KEY | meta_flags::HAS_TOKEN | meta_flags::HAS_BASE_DSN_MSB;
        token
    }
}

/// An SSN interval and the DSN it maps to, from one DSS option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DssMapping {
    pub raw_dsn: u64,
    /// True when the wire carried all 64 DSN bits.
    pub extended: bool,
    pub ssn_low: u32,
    pub ssn_high: u32,
    pub frame: u32,
}

/// A data-bearing segment registered in the DSN space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DsnSegment {
    pub dsn_low: u64,
    pub dsn_high: u64,
    pub frame: u32,
}

/// Subflow-side MPTCP state carried on a `FlowState`.
#[derive(Debug, Clone, Default)]
pub struct MptcpSubflowState {
    /// Which of the connection's two meta flows this direction feeds.
    pub meta_side: usize,
    pub address_id: Option<u8>,
    pub nonce: Option<u32>,
    /// SSN -> DSN mappings, keyed by the interval's high SSN.
    pub ssn2dsn: BTreeMap<u32, DssMapping>,
    /// DSN intervals carried on this subflow direction, keyed by high DSN.
    pub dsn_map: BTreeMap<u64, DsnSegment>,
}

impl MptcpSubflowState {
    /// First mapping whose SSN interval intersects `[lo, hi]`.
    pub fn lookup_mapping(&self, lo: u32, hi: u32) -> Option<&DssMapping> {
        self.ssn2dsn
            .range(lo..)
            .next()
            .map(|(_, m)| m)
            .filter(|m| m.ssn_low <= hi)
    }

    /// DSN intervals overlapping `[lo, hi]`.
    pub fn overlapping_dsn(&self, lo: u64, hi: u64) -> impl Iterator<Item = &DsnSegment> {
        self.dsn_map
            .range(lo..)
            .map(|(_, s)| s)
            .take_while(move |s| s.dsn_low <= hi)
    }
}

// ---------------------------------------------------------------------------
// Connection tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MptcpId(pub(crate) u32);

/// One MPTCP connection: two meta flows plus the subflow conversations.
#[derive(Debug, Clone, Serialize)]
pub struct MptcpAnalysis {
    pub stream_id: u32,
    pub meta: [MetaFlow; 2],
    pub subflows: Vec<ConversationId>,
    /// The conversation that carried MP_CAPABLE, when the handshake was seen.
    pub master: Option<ConversationId>,
}

/// What the engine surfaces per segment.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MptcpOutcome {
    pub stream_id: Option<u32>,
    pub token: Option<u32>,
    /// 64-bit DSN of the segment's first payload byte, when a mapping covers
    /// it (or the DSS carried the full value).
    pub dsn: Option<u64>,
    /// DSN relative to the meta flow's base, when enabled and known.
    pub dsn_relative: Option<u64>,
    pub mapping_missing: bool,
    pub reinjection_of: Vec<u32>,
    pub reinjected_in: Vec<u32>,
}

/// All MPTCP state for one engine instance. Token collisions are not
/// handled: a later connection with the same token takes over the slot.
#[derive(Debug, Default)]
pub struct MptcpTracker {
    analyses: Vec<MptcpAnalysis>,
    tokens: AHashMap<u32, MptcpId>,
    /// First-pass outcomes, replayed verbatim on visited frames.
    outcomes: AHashMap<u32, MptcpOutcome>,
}

impl MptcpTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: MptcpId) -> &MptcpAnalysis {
        &self.analyses[id.0 as usize]
    }

    pub fn connection_count(&self) -> usize {
        self.analyses.len()
    }

    fn alloc(&mut self) -> MptcpId {
        let id = MptcpId(self.analyses.len() as u32);
        self.analyses.push(MptcpAnalysis {
            stream_id: id.0,
            meta: [MetaFlow::default(), MetaFlow::default()],
            subflows: Vec::new(),
            master: None,
        });
        tracing::debug!(mptcp_stream = id.0, "new MPTCP connection");
        id
    }

    fn register_token(&mut self, token: u32, id: MptcpId) {
        // Last writer wins on collision; carried over from the source.
        self.tokens.insert(token, id);
    }

    fn by_token(&self, token: u32) -> Option<MptcpId> {
        self.tokens.get(&token).copied()
    }
}

/// Configuration slice the analyzer needs (mirrors `config::MptcpConfig`).
#[derive(Debug, Clone, Copy)]
pub struct MptcpOptions {
    pub relative_seq: bool,
    pub analyze_mappings: bool,
    pub intersubflows_retransmission: bool,
}

/// Run MPTCP analysis for one segment. `conversations` is the engine's
/// conversation arena; `conv_id` indexes the segment's conversation.
#[allow(clippy::too_many_arguments)]
pub(crate) fn process_segment(
    tracker: &mut MptcpTracker,
    conversations: &mut [Conversation],
    conv_id: ConversationId,
    dir: FlowDirection,
    header: &HeaderRecord,
    rel_seq: u32,
    src: IpAddr,
    dst: IpAddr,
    frame: u32,
    visited: bool,
    opts: MptcpOptions,
    notes: &mut Vec<ExpertNote>,
) -> MptcpOutcome {
    if visited {
        let out = tracker.outcomes.get(&frame).cloned().unwrap_or_default();
        replay_notes(&out, notes);
        return out;
    }

    let mut out = MptcpOutcome::default();

    // Bind the conversation to an MPTCP connection on first sighting.
    let analysis_id = match conversations[conv_id.index()].mptcp {
        Some(id) => Some(id),
        None => header.mptcp.as_ref().map(|mopt| {
            let id = match mopt {
                MptcpOpt::Join(MpJoin::Syn { token, .. }) => tracker
                    .by_token(*token)
                    .unwrap_or_else(|| tracker.alloc()),
                _ => tracker.alloc(),
            };
            let conv = &mut conversations[conv_id.index()];
            conv.mptcp = Some(id);
            let analysis = &mut tracker.analyses[id.0 as usize];
            analysis.subflows.push(conv_id);
            if matches!(mopt, MptcpOpt::Capable { .. }) && analysis.master.is_none() {
                analysis.master = Some(conv_id);
            }
            id
        }),
    };

    let Some(analysis_id) = analysis_id else {
        return out;
    };

    // Lazily initialise per-direction subflow state. Data sent in the SYN
    // direction of the subflow feeds meta side 0 (the connection initiator).
    {
        let conv = &mut conversations[conv_id.index()];
        let syn_dir = conv.syn_direction.unwrap_or(dir);
        for d in [FlowDirection::AtoB, FlowDirection::BtoA] {
            let side = if d == syn_dir { 0 } else { 1 };
            let (flow, _) = conv.flows_mut(d);
            flow.mptcp_subflow
                .get_or_insert_with(|| {
                    Box::new(MptcpSubflowState {
                        meta_side: side,
                        ..Default::default()
                    })
                });
        }
    }

    let meta_side = {
        let conv = &mut conversations[conv_id.index()];
        let (flow, _) = conv.flows_mut(dir);
        match flow.mptcp_subflow.as_mut() {
            Some(sub) => {
                if let Some(MptcpOpt::Join(MpJoin::Syn {
                    address_id, nonce, ..
                })) = &header.mptcp
                {
                    sub.address_id = Some(*address_id);
                    sub.nonce = Some(*nonce);
                }
                sub.meta_side
            }
            None => 0,
        }
    };

    // Meta binding from keys.
    if let Some(mopt) = &header.mptcp {
        bind_meta(
            tracker,
            analysis_id,
            meta_side,
            mopt,
            src,
            dst,
            header,
            notes,
        );
    }

    let analysis = &tracker.analyses[analysis_id.0 as usize];
    out.stream_id = Some(analysis.stream_id);
    out.token = analysis.meta[meta_side].token;
    let base_dsn = analysis.meta[meta_side].base_dsn;
    let base_known =
        analysis.meta[meta_side].static_flags & meta_flags::HAS_BASE_DSN_MSB != 0;

    // Mapping registration from a DSS carrying one.
    if opts.analyze_mappings {
        if let Some(MptcpOpt::Dss(dss)) = &header.mptcp {
            if dss.mapping_present() {
                if let (Some(raw_dsn), Some(ssn), Some(len)) =
                    (dss.raw_dsn, dss.ssn, dss.data_len)
                {
                    if len > 0 {
                        let mapping = DssMapping {
                            raw_dsn,
                            extended: dss.dsn_is_8bytes(),
                            ssn_low: ssn,
                            ssn_high: ssn.wrapping_add(len as u32 - 1),
                            frame,
                        };
                        let conv = &mut conversations[conv_id.index()];
                        let (flow, _) = conv.flows_mut(dir);
                        if let Some(sub) = flow.mptcp_subflow.as_mut() {
                            sub.ssn2dsn.insert(mapping.ssn_high, mapping);
                            tracing::trace!(
                                frame,
                                ssn_low = mapping.ssn_low,
                                ssn_high = mapping.ssn_high,
                                "DSS mapping registered"
                            );
                        }
                    }
                }
            }
        }
    }

    // DSN conversion for data-bearing segments.
    if header.seglen > 0 {
        let lo = rel_seq;
        let hi = rel_seq.wrapping_add(header.seglen - 1);
        let conv = &conversations[conv_id.index()];
        let (flow, _) = conv.flows(dir);
        let mapping = flow
            .mptcp_subflow
            .as_ref()
            .and_then(|sub| sub.lookup_mapping(lo, hi).copied());

        match mapping {
            Some(m) => {
                let delta = rel_seq.wrapping_sub(m.ssn_low) as u64;
                let dsn = if m.extended {
                    Some(m.raw_dsn.wrapping_add(delta))
                } else if base_known {
                    base_dsn
                        .map(|b| dsn_expand(b, m.raw_dsn as u32).wrapping_add(delta))
                } else {
                    // Cannot expand without the base's high bits; surface the
                    // raw 32-bit value only.
                    Some((m.raw_dsn as u32).wrapping_add(delta as u32) as u64)
                };
                out.dsn = dsn;
                if opts.relative_seq && base_known {
                    if let (Some(dsn), Some(base)) = (dsn, base_dsn) {
                        out.dsn_relative = Some(dsn.wrapping_sub(base));
                    }
                }
            }
            None if opts.analyze_mappings => {
                out.mapping_missing = true;
                notes.push(ExpertNote::note(
                    NoteKind::MptcpMappingMissing,
                    "no DSS mapping covers this segment",
                ));
            }
            None => {}
        }

        // Cross-subflow reinjection detection.
        if opts.intersubflows_retransmission {
            if let Some(dsn) = out.dsn {
                let dsn_hi = dsn + (header.seglen as u64 - 1);
                {
                    let conv = &mut conversations[conv_id.index()];
                    let (flow, _) = conv.flows_mut(dir);
                    if let Some(sub) = flow.mptcp_subflow.as_mut() {
                        sub.dsn_map.insert(
                            dsn_hi,
                            DsnSegment {
                                dsn_low: dsn,
                                dsn_high: dsn_hi,
                                frame,
                            },
                        );
                    }
                }
                let analysis = &tracker.analyses[analysis_id.0 as usize];
                for &other in &analysis.subflows {
                    if other == conv_id {
                        continue;
                    }
                    let other_conv = &conversations[other.index()];
                    for flow in [&other_conv.flow1, &other_conv.flow2] {
                        let Some(sub) = flow.mptcp_subflow.as_ref() else {
                            continue;
                        };
                        if sub.meta_side != meta_side {
                            continue;
                        }
                        for seg in sub.overlapping_dsn(dsn, dsn_hi) {
                            if seg.frame < frame {
                                out.reinjection_of.push(seg.frame);
                            } else if seg.frame > frame {
                                out.reinjected_in.push(seg.frame);
                            }
                        }
                    }
                }
                out.reinjection_of.sort_unstable();
                out.reinjected_in.sort_unstable();
                for f in &out.reinjection_of {
                    notes.push(ExpertNote::note(
                        NoteKind::MptcpReinjectionOf,
                        format!("reinjection of frame {}", f),
                    ));
                }
            }
        }
    }

    tracker.outcomes.insert(frame, out.clone());
    out
}

fn replay_notes(out: &MptcpOutcome, notes: &mut Vec<ExpertNote>) {
    if out.mapping_missing {
        notes.push(ExpertNote::note(
            NoteKind::MptcpMappingMissing,
            "no DSS mapping covers this segment",
        ));
    }
    for f in &out.reinjection_of {
        notes.push(ExpertNote::note(
            NoteKind::MptcpReinjectionOf,
            format!("reinjection of frame {}", f),
        ));
    }
}

#[allow(clippy::too_many_arguments)]
fn bind_meta(
    tracker: &mut MptcpTracker,
    id: MptcpId,
    meta_side: usize,
    mopt: &MptcpOpt,
    src: IpAddr,
    dst: IpAddr,
    header: &HeaderRecord,
    notes: &mut Vec<ExpertNote>,
) {
    match mopt {
        MptcpOpt::Capable {
            sender_key,
            receiver_key,
            ..
        } => {
            let other_side = 1 - meta_side;
            if let Some(key) = sender_key {
                let analysis = &mut tracker.analyses[id.0 as usize];
                let meta = &mut analysis.meta[meta_side];
                if let Some(existing) = meta.key {
                    if existing != *key {
                        notes.push(ExpertNote::warn(
                            NoteKind::MptcpEchoedKeyMismatch,
                            format!(
                                "echoed key 0x{:016x} does not match 0x{:016x}",
                                key, existing
                            ),
                        ));
                    }
                } else {
                    let token = meta.assign_key(*key);
                    meta.ip_src = Some(src);
                    meta.ip_dst = Some(dst);
                    meta.sport = header.src_port;
                    meta.dport = header.dst_port;
                    tracker.register_token(token, id);
                }
            }
            if let Some(key) = receiver_key {
                let analysis = &mut tracker.analyses[id.0 as usize];
                let meta = &mut analysis.meta[other_side];
                if let Some(existing) = meta.key {
                    if existing != *key {
                        notes.push(ExpertNote::warn(
                            NoteKind::MptcpEchoedKeyMismatch,
                            format!(
                                "echoed key 0x{:016x} does not match 0x{:016x}",
                                key, existing
                            ),
                        ));
                    }
                } else {
                    let token = meta.assign_key(*key);
                    tracker.register_token(token, id);
                }
            }
        }
        MptcpOpt::Join(MpJoin::Syn { token, .. }) => {
            // The SYN carries the peer's (receiver's) token.
            let analysis = &mut tracker.analyses[id.0 as usize];
            let meta = &mut analysis.meta[1 - meta_side];
            if meta.token.is_none() {
                meta.token = Some(*token);
                meta.static_flags |= meta_flags::HAS_TOKEN;
            }
            tracker.register_token(*token, id);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_and_idsn_from_known_key() {
        // SHA1(00 00 00 00 00 00 00 01) split per RFC 6824.
        let (token, idsn) = token_and_idsn(1);
        let digest = Sha1::digest(1u64.to_be_bytes());
        assert_eq!(
            token,
            u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
        );
        assert_eq!(idsn.to_be_bytes(), digest[12..20]);
    }

    #[test]
    fn dsn_expand_keeps_high_bits() {
        let base = 0x1122_3344_5566_7788u64;
        assert_eq!(dsn_expand(base, 5), 0x1122_3344_0000_0005);
    }

    #[test]
    fn parse_capable_syn_form() {
        // subtype 0, version 0, flags HMAC-SHA1, 8-byte sender key.
        let mut payload = vec![0x00, 0x01];
        payload.extend_from_slice(&0xDEAD_BEEF_CAFE_F00Du64.to_be_bytes());
        let mut notes = Vec::new();
        let opt = MptcpOpt::parse(&payload, &mut notes).unwrap();
        assert_eq!(
            opt,
            MptcpOpt::Capable {
                version: 0,
                flags: 0x01,
                sender_key: Some(0xDEAD_BEEF_CAFE_F00D),
                receiver_key: None,
            }
        );
        assert!(notes.is_empty());
    }

    #[test]
    fn capable_missing_algorithm_flagged() {
        let mut payload = vec![0x00, 0x00];
        payload.extend_from_slice(&1u64.to_be_bytes());
        let mut notes = Vec::new();
        MptcpOpt::parse(&payload, &mut notes).unwrap();
        assert_eq!(notes[0].kind, NoteKind::MptcpMissingAlgorithm);
    }

    #[test]
    fn capable_unsupported_algorithm_flagged() {
        let mut payload = vec![0x00, 0x02];
        payload.extend_from_slice(&1u64.to_be_bytes());
        let mut notes = Vec::new();
        MptcpOpt::parse(&payload, &mut notes).unwrap();
        assert_eq!(notes[0].kind, NoteKind::MptcpUnsupportedAlgorithm);
    }

    #[test]
    fn parse_join_syn_form() {
        let mut payload = vec![0x11, 7];
        payload.extend_from_slice(&0xAABBCCDDu32.to_be_bytes());
        payload.extend_from_slice(&0x01020304u32.to_be_bytes());
        let mut notes = Vec::new();
        let opt = MptcpOpt::parse(&payload, &mut notes).unwrap();
        assert_eq!(
            opt,
            MptcpOpt::Join(MpJoin::Syn {
                backup: true,
                address_id: 7,
                token: 0xAABBCCDD,
                nonce: 0x01020304,
            })
        );
    }

    #[test]
    fn parse_dss_with_mapping() {
        // flags: DATA_ACK_PRESENT | MAPPING_PRESENT (4-byte forms).
        let mut payload = vec![0x20, 0x05];
        payload.extend_from_slice(&100u32.to_be_bytes()); // data ack
        payload.extend_from_slice(&5u32.to_be_bytes()); // dsn
        payload.extend_from_slice(&1u32.to_be_bytes()); // ssn
        payload.extend_from_slice(&300u16.to_be_bytes()); // data-level length
        let mut notes = Vec::new();
        let opt = MptcpOpt::parse(&payload, &mut notes).unwrap();
        let MptcpOpt::Dss(dss) = opt else {
            panic!("expected DSS");
        };
        assert!(dss.mapping_present());
        assert_eq!(dss.data_ack, Some(100));
        assert_eq!(dss.raw_dsn, Some(5));
        assert_eq!(dss.ssn, Some(1));
        assert_eq!(dss.data_len, Some(300));
        assert_eq!(dss.checksum, None);
    }

    #[test]
    fn dss_infinite_mapping_flagged() {
        let mut payload = vec![0x20, 0x04];
        payload.extend_from_slice(&5u32.to_be_bytes());
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&0u16.to_be_bytes());
        let mut notes = Vec::new();
        MptcpOpt::parse(&payload, &mut notes).unwrap();
        assert_eq!(notes[0].kind, NoteKind::MptcpInfiniteMapping);
    }

    #[test]
    fn mapping_interval_lookup() {
        let mut sub = MptcpSubflowState::default();
        sub.ssn2dsn.insert(
            300,
            DssMapping {
                raw_dsn: 1000,
                extended: false,
                ssn_low: 1,
                ssn_high: 300,
                frame: 3,
            },
        );
        assert!(sub.lookup_mapping(1, 100).is_some());
        assert!(sub.lookup_mapping(250, 350).is_some());
        assert!(sub.lookup_mapping(301, 400).is_none());
    }
}
