//! The upper-layer handler seam.
//!
//! The engine does not know any application protocol; it hands reassembled
//! payload to a registered handler and obeys its verdict. Handlers are found
//! through a registry keyed by server port, through heuristics, or through a
//! binding remembered per conversation after a first accept.

use ahash::AHashMap;

/// How much more data a handler wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Desegment {
    /// Exactly this many bytes beyond what was offered.
    Bytes(u32),
    /// The entirety of at least one more segment, size unknown.
    OneMoreSegment,
    /// Everything up to this direction's FIN.
    UntilFin,
}

/// A handler's verdict on one payload view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DissectAction {
    /// This many bytes form complete PDUs; anything beyond starts a new PDU.
    Consumed(usize),
    /// `consumed` bytes form complete PDUs, the rest is the head of a PDU
    /// that needs `need` more data.
    NeedMore { consumed: usize, need: Desegment },
    /// Not this handler's protocol.
    Rejected,
    /// The handler failed on this PDU; the engine reports it and carries on.
    Failed(String),
}

/// Call-site context for a handler.
#[derive(Debug, Clone, Copy)]
pub struct PduContext {
    pub stream_id: u32,
    pub frame: u32,
    pub ts: f64,
    pub visited: bool,
    pub src_port: u16,
    pub dst_port: u16,
    /// Relative sequence number of the first offered byte.
    pub seq: u32,
    /// True when the payload spans more than one segment.
    pub is_reassembled: bool,
}

pub trait Subdissector {
    fn name(&self) -> &'static str;
    fn dissect(&mut self, ctx: &PduContext, data: &[u8]) -> DissectAction;
}

/// Lookup from `(port | heuristic | conversation)` to a handler.
#[derive(Default)]
pub struct SubdissectorRegistry {
    handlers: Vec<Box<dyn Subdissector>>,
    by_port: AHashMap<u16, usize>,
    heuristics: Vec<usize>,
    by_stream: AHashMap<u32, usize>,
}

impl SubdissectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_port(&mut self, port: u16, handler: Box<dyn Subdissector>) {
        let idx = self.handlers.len();
        self.handlers.push(handler);
        self.by_port.insert(port, idx);
    }

    pub fn register_heuristic(&mut self, handler: Box<dyn Subdissector>) {
        let idx = self.handlers.len();
        self.handlers.push(handler);
        self.heuristics.push(idx);
    }

    /// Pin a conversation to a handler by name. Later segments of the stream
    /// skip the lookup.
    pub fn bind_conversation(&mut self, stream_id: u32, name: &str) -> bool {
        match self.handlers.iter().position(|h| h.name() == name) {
            Some(idx) => {
                self.by_stream.insert(stream_id, idx);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Find a handler for this payload and run it. A conversation binding
    /// wins; otherwise the port table and the heuristic list are tried in
    /// the configured order. The first handler that does not reject gets the
    /// conversation bound to it.
    pub fn dissect(
        &mut self,
        ctx: &PduContext,
        data: &[u8],
        try_heuristic_first: bool,
    ) -> Option<(&'static str, DissectAction)> {
        if let Some(&idx) = self.by_stream.get(&ctx.stream_id) {
            let handler = &mut self.handlers[idx];
            let action = handler.dissect(ctx, data);
            let name = handler.name();
            if action != DissectAction::Rejected {
                return Some((name, action));
            }
        }

        let port_candidate = self
            .by_port
            .get(&ctx.dst_port)
            .or_else(|| self.by_port.get(&ctx.src_port))
            .copied();

        let mut candidates: Vec<usize> = Vec::new();
        if try_heuristic_first {
            candidates.extend(&self.heuristics);
            candidates.extend(port_candidate);
        } else {
            candidates.extend(port_candidate);
            candidates.extend(&self.heuristics);
        }

        for idx in candidates {
            let handler = &mut self.handlers[idx];
            let action = handler.dissect(ctx, data);
            let name = handler.name();
            if action != DissectAction::Rejected {
                self.by_stream.insert(ctx.stream_id, idx);
                return Some((name, action));
            }
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Wants PDUs of a fixed size; asks for the difference otherwise.
    /// The shape most line-oriented handlers reduce to in tests.
    pub struct FixedSizePdus {
        pub pdu_len: usize,
        pub delivered: Vec<Vec<u8>>,
    }

    impl FixedSizePdus {
        pub fn new(pdu_len: usize) -> Self {
            FixedSizePdus {
                pdu_len,
                delivered: Vec::new(),
            }
        }
    }

    impl Subdissector for FixedSizePdus {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn dissect(&mut self, _ctx: &PduContext, data: &[u8]) -> DissectAction {
            let mut consumed = 0;
            while data.len() - consumed >= self.pdu_len {
                self.delivered
                    .push(data[consumed..consumed + self.pdu_len].to_vec());
                consumed += self.pdu_len;
            }
            if consumed == data.len() {
                DissectAction::Consumed(consumed)
            } else {
                DissectAction::NeedMore {
                    consumed,
                    need: Desegment::Bytes((self.pdu_len - (data.len() - consumed)) as u32),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FixedSizePdus;
    use super::*;

    struct Accepting(&'static str);

    impl Subdissector for Accepting {
        fn name(&self) -> &'static str {
            self.0
        }
        fn dissect(&mut self, _ctx: &PduContext, data: &[u8]) -> DissectAction {
            DissectAction::Consumed(data.len())
        }
    }

    struct Rejecting;

    impl Subdissector for Rejecting {
        fn name(&self) -> &'static str {
            "picky"
        }
        fn dissect(&mut self, _ctx: &PduContext, _data: &[u8]) -> DissectAction {
            DissectAction::Rejected
        }
    }

    fn ctx(stream_id: u32, dst_port: u16) -> PduContext {
        PduContext {
            stream_id,
            frame: 1,
            ts: 0.0,
            visited: false,
            src_port: 40000,
            dst_port,
            seq: 1,
            is_reassembled: false,
        }
    }

    #[test]
    fn port_lookup_wins_by_default() {
        let mut reg = SubdissectorRegistry::new();
        reg.register_port(80, Box::new(Accepting("http")));
        reg.register_heuristic(Box::new(Accepting("heur")));
        let (name, _) = reg.dissect(&ctx(0, 80), b"x", false).unwrap();
        assert_eq!(name, "http");
    }

    #[test]
    fn heuristic_first_when_configured() {
        let mut reg = SubdissectorRegistry::new();
        reg.register_port(80, Box::new(Accepting("http")));
        reg.register_heuristic(Box::new(Accepting("heur")));
        let (name, _) = reg.dissect(&ctx(0, 80), b"x", true).unwrap();
        assert_eq!(name, "heur");
    }

    #[test]
    fn rejection_falls_through_and_accept_binds() {
        let mut reg = SubdissectorRegistry::new();
        reg.register_heuristic(Box::new(Rejecting));
        reg.register_heuristic(Box::new(Accepting("second")));
        let (name, _) = reg.dissect(&ctx(7, 9999), b"x", false).unwrap();
        assert_eq!(name, "second");
        // The accept bound the stream; the picky heuristic is skipped now.
        let (name, _) = reg.dissect(&ctx(7, 9999), b"y", false).unwrap();
        assert_eq!(name, "second");
    }

    #[test]
    fn explicit_binding_overrides_port() {
        let mut reg = SubdissectorRegistry::new();
        reg.register_port(80, Box::new(Accepting("http")));
        reg.register_heuristic(Box::new(Accepting("tls")));
        assert!(reg.bind_conversation(3, "tls"));
        let (name, _) = reg.dissect(&ctx(3, 80), b"x", false).unwrap();
        assert_eq!(name, "tls");
    }

    #[test]
    fn fixed_size_pdu_helper_requests_remainder() {
        let mut handler = FixedSizePdus::new(10);
        let action = handler.dissect(&ctx(0, 80), &[0u8; 14]);
        assert_eq!(
            action,
            DissectAction::NeedMore {
                consumed: 10,
                need: Desegment::Bytes(6)
            }
        );
        assert_eq!(handler.delivered.len(), 1);
    }
}
