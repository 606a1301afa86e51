//! Column rendering for the display surface.
//!
//! Formats one segment into the strings a packet list shows: the twelve
//! flag glyphs, the comma-joined flag names, and the info column with its
//! prepended analysis annotations. Pure functions over the per-segment
//! records; no state here.

use crate::analysis::{flags as a, AnalysisRecord};
use crate::config::EngineConfig;
use crate::options::TcpOption;
use crate::segment::{flags as th, HeaderRecord};

/// The 12 one-character glyphs for reserved/NS/CWR/ECE/URG/ACK/PSH/RST/SYN/
/// FIN, middle-dot for unset bits.
pub fn flag_glyphs(flags: u16) -> String {
    let bits: [(u16, char); 12] = [
        (0x800, 'R'),
        (0x400, 'R'),
        (0x200, 'R'),
        (th::NS, 'N'),
        (th::CWR, 'C'),
        (th::ECE, 'E'),
        (th::URG, 'U'),
        (th::ACK, 'A'),
        (th::PSH, 'P'),
        (th::RST, 'R'),
        (th::SYN, 'S'),
        (th::FIN, 'F'),
    ];
    bits.iter()
        .map(|&(mask, glyph)| if flags & mask != 0 { glyph } else { '\u{00B7}' })
        .collect()
}

/// Comma-joined flag names, `Reserved` included when any of the three
/// reserved bits is set.
pub fn flag_names(flags: u16) -> String {
    let named: [(u16, &str); 9] = [
        (th::FIN, "FIN"),
        (th::SYN, "SYN"),
        (th::RST, "RST"),
        (th::PSH, "PSH"),
        (th::ACK, "ACK"),
        (th::URG, "URG"),
        (th::ECE, "ECE"),
        (th::CWR, "CWR"),
        (th::NS, "NS"),
    ];
    let mut parts: Vec<&str> = named
        .iter()
        .filter(|&&(mask, _)| flags & mask != 0)
        .map(|&(_, name)| name)
        .collect();
    if flags & th::RESERVED != 0 {
        parts.push("Reserved");
    }
    parts.join(", ")
}

/// Annotations prepended to the info column, most significant first.
pub fn analysis_annotations(analysis: &AnalysisRecord) -> Vec<String> {
    let mut out = Vec::new();
    if analysis.has(a::REUSED_PORTS) {
        out.push("[TCP Port numbers reused]".to_string());
    }
    if analysis.has(a::RETRANSMISSION) {
        out.push("[TCP Retransmission]".to_string());
    }
    if analysis.has(a::FAST_RETRANSMISSION) {
        out.push("[TCP Fast Retransmission]".to_string());
    }
    if analysis.has(a::SPURIOUS_RETRANSMISSION) {
        out.push("[TCP Spurious Retransmission]".to_string());
    }
    if analysis.has(a::OUT_OF_ORDER) {
        out.push("[TCP Out-Of-Order]".to_string());
    }
    if analysis.has(a::LOST_PACKET) {
        out.push("[TCP Previous segment not captured]".to_string());
    }
    if analysis.has(a::ACK_LOST_PACKET) {
        out.push("[TCP ACKed unseen segment]".to_string());
    }
    if analysis.has(a::KEEP_ALIVE) {
        out.push("[TCP Keep-Alive]".to_string());
    }
    if analysis.has(a::KEEP_ALIVE_ACK) {
        out.push("[TCP Keep-Alive ACK]".to_string());
    }
    if analysis.has(a::ZERO_WINDOW_PROBE) {
        out.push("[TCP ZeroWindowProbe]".to_string());
    }
    if analysis.has(a::ZERO_WINDOW) {
        out.push("[TCP ZeroWindow]".to_string());
    }
    if analysis.has(a::ZERO_WINDOW_PROBE_ACK) {
        out.push("[TCP ZeroWindowProbeAck]".to_string());
    }
    if analysis.has(a::WINDOW_FULL) {
        out.push("[TCP Window Full]".to_string());
    }
    if analysis.has(a::WINDOW_UPDATE) {
        out.push("[TCP Window Update]".to_string());
    }
    if analysis.has(a::DUPLICATE_ACK) {
        let frame = analysis.dupack_frame.unwrap_or(0);
        let num = analysis.dupack_num.unwrap_or(0);
        out.push(format!("[TCP Dup ACK {}#{}]", frame, num));
    }
    out
}

/// The info column: annotations, port pair, flags, Seq/Ack/Win/Len, and the
/// option summary.
pub fn info_column(
    header: &HeaderRecord,
    analysis: Option<&AnalysisRecord>,
    cfg: &EngineConfig,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(analysis) = analysis {
        parts.extend(analysis_annotations(analysis));
    }

    parts.push(format!(
        "{} \u{2192} {}",
        header.src_port, header.dst_port
    ));
    parts.push(format!("[{}]", flag_names(header.flags)));

    let seq = header.rel_seq.unwrap_or(header.seq);
    parts.push(format!("Seq={}", seq));
    if header.is_ack() {
        let ack = header.rel_ack.unwrap_or(header.ack);
        parts.push(format!("Ack={}", ack));
    }
    let win = header
        .effective_window
        .unwrap_or(header.window as u32);
    parts.push(format!("Win={}", win));
    parts.push(format!("Len={}", header.seglen));
    if header.has(th::URG) {
        parts.push(format!("Urg={}", header.urgent_ptr));
    }

    for opt in &header.options {
        match opt {
            TcpOption::Mss(mss) => parts.push(format!("MSS={}", mss)),
            TcpOption::WindowScale { shift, .. } => {
                parts.push(format!("WS={}", 1u32 << shift))
            }
            TcpOption::SackPermitted => parts.push("SACK_PERM".to_string()),
            TcpOption::Timestamps { tsval, tsecr } if !cfg.ignore_timestamps => {
                parts.push(format!("TSval={} TSecr={}", tsval, tsecr))
            }
            TcpOption::Tfo { cookie } if cookie.is_empty() => {
                parts.push("TFO=R".to_string())
            }
            TcpOption::Tfo { .. } => parts.push("TFO=C".to_string()),
            _ => {}
        }
    }

    parts.join(" ")
}

/// Field rows for a detail pane, one `(name, value)` pair per line.
pub fn header_fields(header: &HeaderRecord) -> Vec<(String, String)> {
    let mut fields = vec![
        ("Source Port".into(), format!("{}", header.src_port)),
        ("Destination Port".into(), format!("{}", header.dst_port)),
        ("Stream index".into(), format!("{}", header.stream_id)),
        (
            "Sequence Number".into(),
            match header.rel_seq {
                Some(rel) => format!("{} (raw: {})", rel, header.seq),
                None => format!("{}", header.seq),
            },
        ),
        (
            "Acknowledgment Number".into(),
            match header.rel_ack {
                Some(rel) => format!("{} (raw: {})", rel, header.ack),
                None => format!("{}", header.ack),
            },
        ),
        (
            "Header Length".into(),
            format!("{} bytes ({})", header.header_len, header.data_offset),
        ),
        (
            "Flags".into(),
            format!("[{}] {}", flag_names(header.flags), flag_glyphs(header.flags)),
        ),
        ("Window".into(), format!("{}", header.window)),
    ];
    if let Some(win) = header.effective_window {
        fields.push(("Calculated window size".into(), format!("{}", win)));
    }
    fields.push(("Checksum".into(), format!("0x{:04x}", header.checksum)));
    if header.has(th::URG) {
        fields.push(("Urgent Pointer".into(), format!("{}", header.urgent_ptr)));
    }
    for opt in &header.options {
        fields.push(("Option".into(), option_detail(opt)));
    }
    fields
}

/// One-line description of a parsed option.
pub fn option_detail(opt: &TcpOption) -> String {
    match opt {
        TcpOption::Eol => "End of Option List".into(),
        TcpOption::Nop => "No-Operation".into(),
        TcpOption::Mss(mss) => format!("Maximum segment size: {} bytes", mss),
        TcpOption::WindowScale { shift, clamped } => {
            if *clamped {
                format!("Window scale: {} (clamped, multiply by {})", shift, 1u32 << shift)
            } else {
                format!("Window scale: {} (multiply by {})", shift, 1u32 << shift)
            }
        }
        TcpOption::SackPermitted => "SACK permitted".into(),
        TcpOption::Sack(ranges) => {
            let edges: Vec<String> = ranges
                .iter()
                .map(|(l, r)| format!("{}-{}", l, r))
                .collect();
            format!("SACK: {}", edges.join(" "))
        }
        TcpOption::Echo(v) => format!("Echo: {}", v),
        TcpOption::EchoReply(v) => format!("Echo reply: {}", v),
        TcpOption::Timestamps { tsval, tsecr } => {
            format!("Timestamps: TSval {}, TSecr {}", tsval, tsecr)
        }
        TcpOption::Cc(v) => format!("CC: {}", v),
        TcpOption::CcNew(v) => format!("CC.NEW: {}", v),
        TcpOption::CcEcho(v) => format!("CC.ECHO: {}", v),
        TcpOption::Md5(digest) => {
            let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
            format!("MD5 signature: {}", hex)
        }
        TcpOption::ScpsCapabilities { caps, .. } => format!(
            "SCPS capabilities: bets={} snack1={} snack2={} comp={} nlts={} connection id {}",
            caps.bets, caps.snack1, caps.snack2, caps.compress, caps.nlts, caps.connection_id
        ),
        TcpOption::ScpsSnack { offset, size } => {
            format!("SCPS SNACK: offset {}, size {}", offset, size)
        }
        TcpOption::ScpsRecordBoundary => "SCPS record boundary".into(),
        TcpOption::ScpsCorruptionExperienced => "SCPS corruption experienced".into(),
        TcpOption::QuickStart {
            func,
            rate,
            ttl_diff,
            nonce,
        } => format!(
            "Quick-Start: func {}, rate {}, TTL diff {}, nonce 0x{:08x}",
            func, rate, ttl_diff, nonce
        ),
        TcpOption::UserTimeout {
            granularity_minutes,
            timeout,
        } => format!(
            "User timeout: {} {}",
            timeout,
            if *granularity_minutes { "minutes" } else { "seconds" }
        ),
        TcpOption::Mptcp(m) => mptcp_detail(m),
        TcpOption::Tfo { cookie } if cookie.is_empty() => "TCP Fast Open: cookie request".into(),
        TcpOption::Tfo { cookie } => {
            let hex: String = cookie.iter().map(|b| format!("{:02x}", b)).collect();
            format!("TCP Fast Open: cookie {}", hex)
        }
        TcpOption::RvbdProbe(probe) => {
            let mut s = format!(
                "Riverbed probe: type {}, version {}",
                probe.probe_type, probe.version
            );
            if let Some(ip) = probe.csh_ip {
                s.push_str(&format!(", CSH {}", ip));
            }
            if let Some((ip, port)) = probe.proxy {
                s.push_str(&format!(", proxy {}:{}", ip, port));
            }
            s
        }
        TcpOption::RvbdTransparency(trpy) => format!(
            "Riverbed transparency: {}:{} -> {}:{} (flags 0x{:04x})",
            trpy.src, trpy.src_port, trpy.dst, trpy.dst_port, trpy.flags
        ),
        TcpOption::Experimental { kind, magic, payload } => match magic {
            Some(m) => format!(
                "Experimental (kind {}): magic 0x{:04x}, {} bytes",
                kind,
                m,
                payload.len()
            ),
            None => format!("Experimental (kind {}): {} bytes", kind, payload.len()),
        },
        TcpOption::Unknown { kind, payload } => {
            format!("Unknown (kind {}): {} bytes", kind, payload.len())
        }
    }
}

fn mptcp_detail(opt: &crate::mptcp::MptcpOpt) -> String {
    use crate::mptcp::{MpJoin, MptcpOpt};
    match opt {
        MptcpOpt::Capable {
            version,
            sender_key,
            receiver_key,
            ..
        } => {
            let mut s = format!("MPTCP MP_CAPABLE v{}", version);
            if let Some(k) = sender_key {
                s.push_str(&format!(", sender key 0x{:016x}", k));
            }
            if let Some(k) = receiver_key {
                s.push_str(&format!(", receiver key 0x{:016x}", k));
            }
            s
        }
        MptcpOpt::Join(MpJoin::Syn {
            address_id, token, ..
        }) => format!("MPTCP MP_JOIN SYN: address id {}, token 0x{:08x}", address_id, token),
        MptcpOpt::Join(MpJoin::SynAck { address_id, .. }) => {
            format!("MPTCP MP_JOIN SYN/ACK: address id {}", address_id)
        }
        MptcpOpt::Join(MpJoin::Ack { .. }) => "MPTCP MP_JOIN ACK".into(),
        MptcpOpt::Dss(dss) => {
            let mut s = String::from("MPTCP DSS");
            if let Some(ack) = dss.data_ack {
                s.push_str(&format!(", data ack {}", ack));
            }
            if let (Some(dsn), Some(ssn), Some(len)) = (dss.raw_dsn, dss.ssn, dss.data_len) {
                s.push_str(&format!(", mapping dsn {} ssn {} len {}", dsn, ssn, len));
            }
            if dss.data_fin() {
                s.push_str(", DATA_FIN");
            }
            s
        }
        MptcpOpt::AddAddr {
            address_id, addr, ..
        } => match addr {
            Some(ip) => format!("MPTCP ADD_ADDR: id {}, {}", address_id, ip),
            None => format!("MPTCP ADD_ADDR: id {}", address_id),
        },
        MptcpOpt::RemoveAddr { address_ids } => {
            format!("MPTCP REMOVE_ADDR: ids {:?}", address_ids)
        }
        MptcpOpt::Prio { backup, address_id } => match address_id {
            Some(id) => format!("MPTCP MP_PRIO: backup={}, id {}", backup, id),
            None => format!("MPTCP MP_PRIO: backup={}", backup),
        },
        MptcpOpt::Fail { dsn } => format!("MPTCP MP_FAIL: dsn {}", dsn),
        MptcpOpt::FastClose { receiver_key } => {
            format!("MPTCP MP_FASTCLOSE: receiver key 0x{:016x}", receiver_key)
        }
        MptcpOpt::Unknown { subtype, .. } => format!("MPTCP subtype {}", subtype),
    }
}
