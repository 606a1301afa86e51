//! TCP option parsing.
//!
//! A single pass over the options area produces a tagged-sum representation;
//! downstream analyzers dispatch with a `match` instead of a function-pointer
//! table. Unknown kinds are preserved with their raw payload. A length byte
//! pointing past the end of the area is fatal for the remainder of the list;
//! everything already parsed is kept.

use crate::expert::{ExpertNote, NoteKind};
use crate::mptcp::MptcpOpt;
use serde::Serialize;
use std::net::Ipv4Addr;

pub const KIND_EOL: u8 = 0;
pub const KIND_NOP: u8 = 1;
pub const KIND_MSS: u8 = 2;
pub const KIND_WINDOW_SCALE: u8 = 3;
pub const KIND_SACK_PERMITTED: u8 = 4;
pub const KIND_SACK: u8 = 5;
pub const KIND_ECHO: u8 = 6;
pub const KIND_ECHO_REPLY: u8 = 7;
pub const KIND_TIMESTAMPS: u8 = 8;
pub const KIND_CC: u8 = 11;
pub const KIND_CC_NEW: u8 = 12;
pub const KIND_CC_ECHO: u8 = 13;
pub const KIND_MD5: u8 = 19;
pub const KIND_SCPS_CAPABILITIES: u8 = 20;
pub const KIND_SCPS_SNACK: u8 = 21;
pub const KIND_SCPS_RECORD_BOUNDARY: u8 = 22;
pub const KIND_SCPS_CORRUPTION: u8 = 23;
pub const KIND_QUICK_START: u8 = 27;
pub const KIND_USER_TIMEOUT: u8 = 28;
pub const KIND_MPTCP: u8 = 30;
pub const KIND_TFO: u8 = 34;
pub const KIND_RVBD_PROBE: u8 = 76;
pub const KIND_RVBD_TRPY: u8 = 78;
pub const KIND_EXPERIMENTAL_1: u8 = 253;
pub const KIND_EXPERIMENTAL_2: u8 = 254;

/// Magic number marking a TCP Fast Open payload inside an experimental
/// option (RFC 7413 appendix A).
pub const TFO_MAGIC: u16 = 0xF989;

/// Maximum window-scale shift (RFC 1323 / RFC 7323).
pub const MAX_WINDOW_SHIFT: u8 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScpsCapabilities {
    pub bets: bool,
    pub snack1: bool,
    pub snack2: bool,
    pub compress: bool,
    pub nlts: bool,
    pub connection_id: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RvbdProbe {
    pub probe_type: u8,
    pub version: u8,
    /// Client-side host IP, present on probe queries.
    pub csh_ip: Option<Ipv4Addr>,
    /// Proxy address and port, present on probe responses.
    pub proxy: Option<(Ipv4Addr, u16)>,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RvbdTransparency {
    pub flags: u16,
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
    pub client_port: Option<u16>,
}

/// One parsed TCP option.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TcpOption {
    Eol,
    Nop,
    Mss(u16),
    WindowScale {
        shift: u8,
        /// True when the wire value exceeded 14 and was clamped.
        clamped: bool,
    },
    SackPermitted,
    Sack(Vec<(u32, u32)>),
    Echo(u32),
    EchoReply(u32),
    Timestamps {
        tsval: u32,
        tsecr: u32,
    },
    Cc(u32),
    CcNew(u32),
    CcEcho(u32),
    Md5([u8; 16]),
    ScpsCapabilities {
        caps: ScpsCapabilities,
        /// Extended capability bytes (length > 4 forms), kept raw.
        extended: Vec<u8>,
    },
    ScpsSnack {
        offset: u16,
        size: u16,
    },
    ScpsRecordBoundary,
    ScpsCorruptionExperienced,
    QuickStart {
        func: u8,
        rate: u8,
        ttl_diff: u8,
        nonce: u32,
    },
    UserTimeout {
        granularity_minutes: bool,
        timeout: u16,
    },
    Mptcp(MptcpOpt),
    /// TCP Fast Open: empty cookie is a cookie request.
    Tfo {
        cookie: Vec<u8>,
    },
    RvbdProbe(RvbdProbe),
    RvbdTransparency(RvbdTransparency),
    Experimental {
        kind: u8,
        magic: Option<u16>,
        payload: Vec<u8>,
    },
    Unknown {
        kind: u8,
        payload: Vec<u8>,
    },
}

impl TcpOption {
    pub fn kind(&self) -> u8 {
        match self {
            TcpOption::Eol => KIND_EOL,
            TcpOption::Nop => KIND_NOP,
            TcpOption::Mss(_) => KIND_MSS,
            TcpOption::WindowScale { .. } => KIND_WINDOW_SCALE,
            TcpOption::SackPermitted => KIND_SACK_PERMITTED,
            TcpOption::Sack(_) => KIND_SACK,
            TcpOption::Echo(_) => KIND_ECHO,
            TcpOption::EchoReply(_) => KIND_ECHO_REPLY,
            TcpOption::Timestamps { .. } => KIND_TIMESTAMPS,
            TcpOption::Cc(_) => KIND_CC,
            TcpOption::CcNew(_) => KIND_CC_NEW,
            TcpOption::CcEcho(_) => KIND_CC_ECHO,
            TcpOption::Md5(_) => KIND_MD5,
            TcpOption::ScpsCapabilities { .. } => KIND_SCPS_CAPABILITIES,
            TcpOption::ScpsSnack { .. } => KIND_SCPS_SNACK,
            TcpOption::ScpsRecordBoundary => KIND_SCPS_RECORD_BOUNDARY,
            TcpOption::ScpsCorruptionExperienced => KIND_SCPS_CORRUPTION,
            TcpOption::QuickStart { .. } => KIND_QUICK_START,
            TcpOption::UserTimeout { .. } => KIND_USER_TIMEOUT,
            TcpOption::Mptcp(_) => KIND_MPTCP,
            TcpOption::Tfo { .. } => KIND_TFO,
            TcpOption::RvbdProbe(_) => KIND_RVBD_PROBE,
            TcpOption::RvbdTransparency(_) => KIND_RVBD_TRPY,
            TcpOption::Experimental { kind, .. } | TcpOption::Unknown { kind, .. } => *kind,
        }
    }
}

/// Parse the options area of one TCP header.
pub fn parse(bytes: &[u8], exp_options_with_magic: bool, notes: &mut Vec<ExpertNote>) -> Vec<TcpOption> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    let mut nop_run = 0u32;

    while pos < bytes.len() {
        let kind = bytes[pos];

        if kind == KIND_EOL {
            out.push(TcpOption::Eol);
            break;
        }
        if kind == KIND_NOP {
            nop_run += 1;
            if nop_run == 4 {
                notes.push(ExpertNote::note(
                    NoteKind::FourConsecutiveNops,
                    "4 NOP in a row - a router may have removed some options",
                ));
            }
            out.push(TcpOption::Nop);
            pos += 1;
            continue;
        }
        nop_run = 0;

        if pos + 1 >= bytes.len() {
            notes.push(ExpertNote::warn(
                NoteKind::OptionLengthInvalid,
                format!("option kind {} is missing its length byte", kind),
            ));
            break;
        }
        let len = bytes[pos + 1] as usize;
        if len < 2 || pos + len > bytes.len() {
            notes.push(ExpertNote::warn(
                NoteKind::OptionLengthInvalid,
                format!("option kind {} has invalid length {}", kind, len),
            ));
            break;
        }

        let payload = &bytes[pos + 2..pos + len];
        match decode(kind, len, payload, exp_options_with_magic, notes) {
            Decoded::Option(opt) => out.push(opt),
            // Wrong fixed length for a known kind: the list can no longer be
            // trusted, keep what we have.
            Decoded::FatalLength => {
                notes.push(ExpertNote::warn(
                    NoteKind::OptionLengthInvalid,
                    format!("option kind {} has length {} which does not match its format", kind, len),
                ));
                break;
            }
        }
        pos += len;
    }

    out
}

enum Decoded {
    Option(TcpOption),
    FatalLength,
}

fn decode(
    kind: u8,
    len: usize,
    payload: &[u8],
    exp_options_with_magic: bool,
    notes: &mut Vec<ExpertNote>,
) -> Decoded {
    let opt = match kind {
        KIND_MSS => {
            if len != 4 {
                return Decoded::FatalLength;
            }
            TcpOption::Mss(u16::from_be_bytes([payload[0], payload[1]]))
        }
        KIND_WINDOW_SCALE => {
            if len != 3 {
                return Decoded::FatalLength;
            }
            let raw = payload[0];
            let clamped = raw > MAX_WINDOW_SHIFT;
            if clamped {
                notes.push(ExpertNote::warn(
                    NoteKind::WindowScaleClamped,
                    format!("window scale shift {} exceeds 14, using 14 (RFC 1323)", raw),
                ));
            }
            TcpOption::WindowScale {
                shift: raw.min(MAX_WINDOW_SHIFT),
                clamped,
            }
        }
        KIND_SACK_PERMITTED => {
            if len != 2 {
                return Decoded::FatalLength;
            }
            TcpOption::SackPermitted
        }
        KIND_SACK => {
            let mut ranges = Vec::new();
            let mut chunk = payload;
            while chunk.len() >= 8 {
                let left = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let right = u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
                ranges.push((left, right));
                chunk = &chunk[8..];
            }
            if !chunk.is_empty() {
                notes.push(ExpertNote::warn(
                    NoteKind::SubOptionMalformed,
                    format!("SACK option has {} trailing bytes, not a full edge pair", chunk.len()),
                ));
            }
            TcpOption::Sack(ranges)
        }
        KIND_ECHO | KIND_ECHO_REPLY | KIND_CC | KIND_CC_NEW | KIND_CC_ECHO => {
            if len != 6 {
                return Decoded::FatalLength;
            }
            let v = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            match kind {
                KIND_ECHO => TcpOption::Echo(v),
                KIND_ECHO_REPLY => TcpOption::EchoReply(v),
                KIND_CC => TcpOption::Cc(v),
                KIND_CC_NEW => TcpOption::CcNew(v),
                _ => TcpOption::CcEcho(v),
            }
        }
        KIND_TIMESTAMPS => {
            if len != 10 {
                return Decoded::FatalLength;
            }
            TcpOption::Timestamps {
                tsval: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                tsecr: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
            }
        }
        KIND_MD5 => {
            if len != 18 {
                return Decoded::FatalLength;
            }
            let mut digest = [0u8; 16];
            digest.copy_from_slice(payload);
            TcpOption::Md5(digest)
        }
        KIND_SCPS_CAPABILITIES => {
            if len < 4 {
                return Decoded::FatalLength;
            }
            let b = payload[0];
            TcpOption::ScpsCapabilities {
                caps: ScpsCapabilities {
                    bets: b & 0x80 != 0,
                    snack1: b & 0x40 != 0,
                    snack2: b & 0x20 != 0,
                    compress: b & 0x10 != 0,
                    nlts: b & 0x08 != 0,
                    connection_id: payload[1],
                },
                extended: payload[2..].to_vec(),
            }
        }
        KIND_SCPS_SNACK => {
            if len != 6 {
                return Decoded::FatalLength;
            }
            TcpOption::ScpsSnack {
                offset: u16::from_be_bytes([payload[0], payload[1]]),
                size: u16::from_be_bytes([payload[2], payload[3]]),
            }
        }
        KIND_SCPS_RECORD_BOUNDARY => {
            if len != 2 {
                return Decoded::FatalLength;
            }
            TcpOption::ScpsRecordBoundary
        }
        KIND_SCPS_CORRUPTION => {
            if len != 2 {
                return Decoded::FatalLength;
            }
            TcpOption::ScpsCorruptionExperienced
        }
        KIND_QUICK_START => {
            if len != 8 {
                return Decoded::FatalLength;
            }
            TcpOption::QuickStart {
                func: payload[0] >> 4,
                rate: payload[0] & 0x0F,
                ttl_diff: payload[1],
                nonce: u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]) >> 2,
            }
        }
        KIND_USER_TIMEOUT => {
            if len != 4 {
                return Decoded::FatalLength;
            }
            let raw = u16::from_be_bytes([payload[0], payload[1]]);
            TcpOption::UserTimeout {
                granularity_minutes: raw & 0x8000 != 0,
                timeout: raw & 0x7FFF,
            }
        }
        KIND_MPTCP => match MptcpOpt::parse(payload, notes) {
            Some(m) => TcpOption::Mptcp(m),
            None => TcpOption::Unknown {
                kind,
                payload: payload.to_vec(),
            },
        },
        KIND_TFO => TcpOption::Tfo {
            cookie: payload.to_vec(),
        },
        KIND_RVBD_PROBE => {
            if payload.is_empty() {
                return Decoded::FatalLength;
            }
            let probe_type = payload[0] >> 4;
            let version = payload[0] & 0x0F;
            let mut probe = RvbdProbe {
                probe_type,
                version,
                csh_ip: None,
                proxy: None,
                raw: payload[1..].to_vec(),
            };
            match probe_type {
                // Probe query: reserved byte then client-side host IP.
                0 if payload.len() >= 6 => {
                    probe.csh_ip = Some(Ipv4Addr::new(
                        payload[2], payload[3], payload[4], payload[5],
                    ));
                }
                // Probe response: reserved byte, proxy IP and port.
                1 if payload.len() >= 8 => {
                    probe.proxy = Some((
                        Ipv4Addr::new(payload[2], payload[3], payload[4], payload[5]),
                        u16::from_be_bytes([payload[6], payload[7]]),
                    ));
                }
                _ => {}
            }
            TcpOption::RvbdProbe(probe)
        }
        KIND_RVBD_TRPY => {
            if len < 16 {
                return Decoded::FatalLength;
            }
            TcpOption::RvbdTransparency(RvbdTransparency {
                flags: u16::from_be_bytes([payload[0], payload[1]]),
                src: Ipv4Addr::new(payload[2], payload[3], payload[4], payload[5]),
                src_port: u16::from_be_bytes([payload[6], payload[7]]),
                dst: Ipv4Addr::new(payload[8], payload[9], payload[10], payload[11]),
                dst_port: u16::from_be_bytes([payload[12], payload[13]]),
                client_port: if payload.len() >= 16 {
                    Some(u16::from_be_bytes([payload[14], payload[15]]))
                } else {
                    None
                },
            })
        }
        KIND_EXPERIMENTAL_1 | KIND_EXPERIMENTAL_2 => {
            if exp_options_with_magic && payload.len() >= 2 {
                let magic = u16::from_be_bytes([payload[0], payload[1]]);
                if magic == TFO_MAGIC {
                    TcpOption::Tfo {
                        cookie: payload[2..].to_vec(),
                    }
                } else {
                    TcpOption::Experimental {
                        kind,
                        magic: Some(magic),
                        payload: payload[2..].to_vec(),
                    }
                }
            } else {
                TcpOption::Experimental {
                    kind,
                    magic: None,
                    payload: payload.to_vec(),
                }
            }
        }
        _ => TcpOption::Unknown {
            kind,
            payload: payload.to_vec(),
        },
    };
    Decoded::Option(opt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(bytes: &[u8]) -> (Vec<TcpOption>, Vec<ExpertNote>) {
        let mut notes = Vec::new();
        let opts = parse(bytes, true, &mut notes);
        (opts, notes)
    }

    #[test]
    fn mss_and_sack_permitted() {
        let (opts, notes) = parse_ok(&[2, 4, 0x05, 0xB4, 4, 2, 1, 1]);
        assert_eq!(opts.len(), 4);
        assert_eq!(opts[0], TcpOption::Mss(1460));
        assert_eq!(opts[1], TcpOption::SackPermitted);
        assert!(notes.is_empty());
    }

    #[test]
    fn window_scale_clamped_above_14() {
        let (opts, notes) = parse_ok(&[3, 3, 15]);
        assert_eq!(
            opts[0],
            TcpOption::WindowScale {
                shift: 14,
                clamped: true
            }
        );
        assert_eq!(notes[0].kind, NoteKind::WindowScaleClamped);
    }

    #[test]
    fn sack_edges_parsed() {
        let mut bytes = vec![5, 18];
        bytes.extend_from_slice(&100u32.to_be_bytes());
        bytes.extend_from_slice(&200u32.to_be_bytes());
        bytes.extend_from_slice(&300u32.to_be_bytes());
        bytes.extend_from_slice(&400u32.to_be_bytes());
        let (opts, notes) = parse_ok(&bytes);
        assert_eq!(opts[0], TcpOption::Sack(vec![(100, 200), (300, 400)]));
        assert!(notes.is_empty());
    }

    #[test]
    fn sack_with_partial_edge_flagged() {
        let mut bytes = vec![5, 14];
        bytes.extend_from_slice(&100u32.to_be_bytes());
        bytes.extend_from_slice(&200u32.to_be_bytes());
        bytes.extend_from_slice(&[0xAA; 4]); // half an edge pair
        let (opts, notes) = parse_ok(&bytes);
        assert_eq!(opts[0], TcpOption::Sack(vec![(100, 200)]));
        assert_eq!(notes[0].kind, NoteKind::SubOptionMalformed);
    }

    #[test]
    fn length_past_end_drops_remainder() {
        // MSS parses, then a timestamps option claims 10 bytes with 4 left.
        let (opts, notes) = parse_ok(&[2, 4, 0x05, 0xB4, 8, 10, 0, 0]);
        assert_eq!(opts.len(), 1);
        assert_eq!(opts[0], TcpOption::Mss(1460));
        assert_eq!(notes[0].kind, NoteKind::OptionLengthInvalid);
    }

    #[test]
    fn four_nops_flagged_once() {
        let (opts, notes) = parse_ok(&[1, 1, 1, 1, 1]);
        assert_eq!(opts.len(), 5);
        let count = notes
            .iter()
            .filter(|n| n.kind == NoteKind::FourConsecutiveNops)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn experimental_tfo_magic_dispatch() {
        let mut bytes = vec![254, 10, 0xF9, 0x89];
        bytes.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        let (opts, _) = parse_ok(&bytes);
        assert_eq!(
            opts[0],
            TcpOption::Tfo {
                cookie: vec![1, 2, 3, 4, 5, 6]
            }
        );
    }

    #[test]
    fn experimental_without_magic_match_is_raw() {
        let (opts, notes) = parse_ok(&[253, 4, 0xAB, 0xCD]);
        assert_eq!(
            opts[0],
            TcpOption::Experimental {
                kind: 253,
                magic: Some(0xABCD),
                payload: vec![]
            }
        );
        assert!(notes.is_empty());
    }

    #[test]
    fn experimental_magic_disabled() {
        let mut notes = Vec::new();
        let opts = parse(&[253, 4, 0xF9, 0x89], false, &mut notes);
        assert_eq!(
            opts[0],
            TcpOption::Experimental {
                kind: 253,
                magic: None,
                payload: vec![0xF9, 0x89]
            }
        );
    }

    #[test]
    fn unknown_kind_preserved() {
        let (opts, notes) = parse_ok(&[99, 4, 0xDE, 0xAD, 2, 4, 0x05, 0xB4]);
        assert_eq!(
            opts[0],
            TcpOption::Unknown {
                kind: 99,
                payload: vec![0xDE, 0xAD]
            }
        );
        // Parsing continued past the unknown option.
        assert_eq!(opts[1], TcpOption::Mss(1460));
        assert!(notes.is_empty());
    }

    #[test]
    fn user_timeout_granularity_bit() {
        let (opts, _) = parse_ok(&[28, 4, 0x80, 0x0A]);
        assert_eq!(
            opts[0],
            TcpOption::UserTimeout {
                granularity_minutes: true,
                timeout: 10
            }
        );
    }

    #[test]
    fn eol_terminates_list() {
        let (opts, _) = parse_ok(&[0, 2, 4, 0x05, 0xB4]);
        assert_eq!(opts, vec![TcpOption::Eol]);
    }
}
