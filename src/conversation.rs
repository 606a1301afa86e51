//! Conversation table: maps the unordered address/port 4-tuple to a
//! bidirectional flow pair.
//!
//! Conversations live in an arena for the lifetime of the engine and are
//! addressed by integer handles. A 4-tuple can map to several conversations
//! over time (port reuse); lookups carry the frame number and resolve to the
//! conversation whose setup frame is the greatest one not after it, so
//! visited passes find the same conversation the first pass used.

use crate::analysis::{AnalysisRecord, Timing};
use crate::flow::FlowState;
use crate::mptcp::MptcpId;
use ahash::AHashMap;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowDirection {
    AtoB,
    BtoA,
}

impl FlowDirection {
    #[inline]
    pub fn reverse(self) -> FlowDirection {
        match self {
            FlowDirection::AtoB => FlowDirection::BtoA,
            FlowDirection::BtoA => FlowDirection::AtoB,
        }
    }
}

impl fmt::Display for FlowDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowDirection::AtoB => write!(f, "a_to_b"),
            FlowDirection::BtoA => write!(f, "b_to_a"),
        }
    }
}

/// Unordered 4-tuple; `a` always sorts at or below `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConversationKey {
    pub a: Endpoint,
    pub b: Endpoint,
}

impl ConversationKey {
    /// Build the canonical key for a segment and report which direction the
    /// segment travels. Address comparison decides the orientation; equal
    /// addresses fall back to the ports.
    pub fn new(src: Endpoint, dst: Endpoint) -> (Self, FlowDirection) {
        if endpoint_key(&src) <= endpoint_key(&dst) {
            (ConversationKey { a: src, b: dst }, FlowDirection::AtoB)
        } else {
            (ConversationKey { a: dst, b: src }, FlowDirection::BtoA)
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.a, self.b)
    }
}

fn endpoint_key(endpoint: &Endpoint) -> (u8, [u8; 16], u16) {
    let (version, addr) = match endpoint.ip {
        IpAddr::V4(v4) => {
            let mut bytes = [0u8; 16];
            bytes[12..].copy_from_slice(&v4.octets());
            (4, bytes)
        }
        IpAddr::V6(v6) => (6, v6.octets()),
    };
    (version, addr, endpoint.port)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConversationId(pub(crate) u32);

impl ConversationId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handshake/teardown completeness bits.
pub mod completeness {
    pub const SYN: u8 = 0x01;
    pub const SYNACK: u8 = 0x02;
    pub const ACK: u8 = 0x04;
    pub const DATA: u8 = 0x08;
    pub const FIN: u8 = 0x10;
    pub const RST: u8 = 0x20;
}

/// The bidirectional association of two flows sharing a 4-tuple.
#[derive(Debug)]
pub struct Conversation {
    pub stream_id: u32,
    pub key: ConversationKey,
    /// Frame that created this conversation.
    pub setup_frame: u32,
    pub flow1: FlowState,
    pub flow2: FlowState,
    pub ts_first: f64,
    pub ts_prev: f64,
    /// Timestamp of the most recently seen SYN.
    pub ts_mru_syn: Option<f64>,
    /// Initial round-trip time, measured SYN -> first pure ACK.
    pub ts_first_rtt: Option<f64>,
    /// Learned from SYN/SYN-ACK.
    pub server_port: Option<u16>,
    /// Direction the opening SYN travelled, when one was seen.
    pub syn_direction: Option<FlowDirection>,
    /// Persistent per-packet analysis, keyed by `(frame, raw seq, raw ack)`.
    pub acked_table: AHashMap<(u32, u32, u32), AnalysisRecord>,
    /// Persistent per-frame timing, replayed on visited passes.
    pub timing_table: AHashMap<u32, Timing>,
    /// Completeness as of each frame's first pass; the live bitset keeps
    /// accumulating, so visited frames read their snapshot instead.
    pub completeness_table: AHashMap<u32, u8>,
    pub mptcp: Option<MptcpId>,
    /// Most recent frame that used this conversation.
    pub last_frame: u32,
    pub completeness: u8,
}

impl Conversation {
    fn new(stream_id: u32, key: ConversationKey, setup_frame: u32, ts: f64) -> Self {
        Conversation {
            stream_id,
            key,
            setup_frame,
            flow1: FlowState::new(),
            flow2: FlowState::new(),
            ts_first: ts,
            ts_prev: ts,
            ts_mru_syn: None,
            ts_first_rtt: None,
            server_port: None,
            syn_direction: None,
            acked_table: AHashMap::new(),
            timing_table: AHashMap::new(),
            completeness_table: AHashMap::new(),
            mptcp: None,
            last_frame: setup_frame,
            completeness: 0,
        }
    }

    /// The (forward, reverse) flow pair for a segment travelling `dir`.
    #[inline]
    pub fn flows(&self, dir: FlowDirection) -> (&FlowState, &FlowState) {
        match dir {
            FlowDirection::AtoB => (&self.flow1, &self.flow2),
            FlowDirection::BtoA => (&self.flow2, &self.flow1),
        }
    }

    #[inline]
    pub fn flows_mut(&mut self, dir: FlowDirection) -> (&mut FlowState, &mut FlowState) {
        match dir {
            FlowDirection::AtoB => (&mut self.flow1, &mut self.flow2),
            FlowDirection::BtoA => (&mut self.flow2, &mut self.flow1),
        }
    }
}

/// Per-conversation summary row for the snapshot surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSnapshot {
    pub stream_id: u32,
    pub endpoint_a: Endpoint,
    pub endpoint_b: Endpoint,
    pub packets_a_to_b: u64,
    pub packets_b_to_a: u64,
    pub bytes_a_to_b: u64,
    pub bytes_b_to_a: u64,
    pub ts_first: f64,
    pub server_port: Option<u16>,
    pub completeness: u8,
    pub mptcp_stream: Option<u32>,
}

/// Arena plus lookup index. Stream ids are dense, in creation order.
#[derive(Debug, Default)]
pub struct ConversationTable {
    arena: Vec<Conversation>,
    /// Per key, the conversations that used it, in setup order.
    index: AHashMap<ConversationKey, Vec<ConversationId>>,
}

impl ConversationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    #[inline]
    pub fn get(&self, id: ConversationId) -> &Conversation {
        &self.arena[id.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: ConversationId) -> &mut Conversation {
        &mut self.arena[id.index()]
    }

    pub(crate) fn arena_mut(&mut self) -> &mut [Conversation] {
        &mut self.arena
    }

    /// Find the conversation this frame belongs to, without creating one.
    pub fn find(&self, key: &ConversationKey, frame: u32) -> Option<ConversationId> {
        let ids = self.index.get(key)?;
        ids.iter()
            .rev()
            .find(|id| self.arena[id.index()].setup_frame <= frame)
            .or(ids.first())
            .copied()
    }

    /// Find or create the conversation for a segment.
    pub fn find_or_create(
        &mut self,
        key: ConversationKey,
        frame: u32,
        ts: f64,
    ) -> (ConversationId, bool) {
        if let Some(id) = self.find(&key, frame) {
            return (id, false);
        }
        (self.insert(key, frame, ts), true)
    }

    /// Open a fresh conversation for a 4-tuple already in use (port reuse).
    /// The previous conversation stays in the arena and keeps serving frames
    /// captured before `frame`.
    pub fn start_new(&mut self, key: ConversationKey, frame: u32, ts: f64) -> ConversationId {
        self.insert(key, frame, ts)
    }

    fn insert(&mut self, key: ConversationKey, frame: u32, ts: f64) -> ConversationId {
        let id = ConversationId(self.arena.len() as u32);
        self.arena.push(Conversation::new(id.0, key, frame, ts));
        self.index.entry(key).or_default().push(id);
        tracing::debug!(stream = id.0, %key, "new conversation");
        id
    }

    pub fn snapshot(&self) -> Vec<ConversationSnapshot> {
        self.arena
            .iter()
            .map(|conv| ConversationSnapshot {
                stream_id: conv.stream_id,
                endpoint_a: conv.key.a,
                endpoint_b: conv.key.b,
                packets_a_to_b: conv.flow1.packets,
                packets_b_to_a: conv.flow2.packets,
                bytes_a_to_b: conv.flow1.bytes,
                bytes_b_to_a: conv.flow2.bytes,
                ts_first: conv.ts_first,
                server_port: conv.server_port,
                completeness: conv.completeness,
                mptcp_stream: conv.mptcp.map(|id| id.0),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ep(a: u8, port: u16) -> Endpoint {
        Endpoint {
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, a)),
            port,
        }
    }

    #[test]
    fn key_is_directionless() {
        let (k1, d1) = ConversationKey::new(ep(1, 1234), ep(2, 80));
        let (k2, d2) = ConversationKey::new(ep(2, 80), ep(1, 1234));
        assert_eq!(k1, k2);
        assert_ne!(d1, d2);
    }

    #[test]
    fn same_address_ties_break_on_port() {
        let (key, dir) = ConversationKey::new(ep(1, 4000), ep(1, 80));
        assert_eq!(key.a.port, 80);
        assert_eq!(dir, FlowDirection::BtoA);
    }

    #[test]
    fn stream_ids_are_dense_in_creation_order() {
        let mut table = ConversationTable::new();
        let (key1, _) = ConversationKey::new(ep(1, 1111), ep(2, 80));
        let (key2, _) = ConversationKey::new(ep(1, 2222), ep(2, 80));
        let (id1, created1) = table.find_or_create(key1, 1, 0.0);
        let (id2, created2) = table.find_or_create(key2, 2, 0.1);
        assert!(created1 && created2);
        assert_eq!(table.get(id1).stream_id, 0);
        assert_eq!(table.get(id2).stream_id, 1);

        let (again, created) = table.find_or_create(key1, 3, 0.2);
        assert!(!created);
        assert_eq!(again, id1);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let mut table = ConversationTable::new();
        let (key, _) = ConversationKey::new(ep(1, 1234), ep(2, 443));
        let (id, _) = table.find_or_create(key, 1, 1.5);
        table.get_mut(id).server_port = Some(443);
        let json = serde_json::to_string(&table.snapshot()).unwrap();
        assert!(json.contains("\"stream_id\":0"));
        assert!(json.contains("\"server_port\":443"));
    }

    #[test]
    fn port_reuse_resolves_by_frame() {
        let mut table = ConversationTable::new();
        let (key, _) = ConversationKey::new(ep(1, 1234), ep(2, 80));
        let (old, _) = table.find_or_create(key, 1, 0.0);
        let new = table.start_new(key, 50, 5.0);
        assert_ne!(old, new);

        // Frames before the reuse still find the old conversation.
        assert_eq!(table.find(&key, 10), Some(old));
        assert_eq!(table.find(&key, 50), Some(new));
        assert_eq!(table.find(&key, 99), Some(new));
    }
}
