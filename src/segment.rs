//! TCP segment parsing: the fixed 20-byte header, length validation, and the
//! pseudo-header checksum.
//!
//! TCP header layout (20-60 bytes):
//!   0                   1                   2                   3
//!   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |          Source Port          |       Destination Port        |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                        Sequence Number                       |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                    Acknowledgment Number                     |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |  Data |     |N|C|E|U|A|P|R|S|F|                               |
//!  | Offset| Rsv |S|W|C|R|C|S|S|Y|I|            Window             |
//!  |       |     | |R|E|G|K|H|T|N|N|                               |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |           Checksum            |         Urgent Pointer        |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                    Options                    |    Padding    |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

use crate::expert::{ExpertNote, NoteKind};
use crate::mptcp::MptcpOpt;
use crate::options::{self, TcpOption};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

/// Minimum TCP header length (no options).
pub const TCP_MIN_HEADER_LEN: usize = 20;

/// TCP flag bitmask constants over the low 12 bits of bytes 12-13
/// (data offset excluded, the three reserved bits included).
pub mod flags {
    pub const FIN: u16 = 0x001;
    pub const SYN: u16 = 0x002;
    pub const RST: u16 = 0x004;
    pub const PSH: u16 = 0x008;
    pub const ACK: u16 = 0x010;
    pub const URG: u16 = 0x020;
    pub const ECE: u16 = 0x040;
    pub const CWR: u16 = 0x080;
    pub const NS: u16 = 0x100;
    pub const RESERVED: u16 = 0xE00;
}

/// Capture-supplied metadata for one segment. Addresses and the IP protocol
/// are pre-parsed by the caller; the engine never sees link or IP bytes.
#[derive(Debug, Clone, Copy)]
pub struct SegmentMeta {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Arrival timestamp, seconds since epoch (pcap-style).
    pub ts: f64,
    /// Capture-wide monotonically increasing frame number.
    pub frame: u32,
    /// True on re-dissection passes; the engine must not mutate flow state.
    pub visited: bool,
    /// Segment arrived inside an IP fragment train; checksum is skipped.
    pub fragmented: bool,
    /// Segment is quoted inside an ICMP error packet.
    pub in_error: bool,
}

/// Structural parse failures. All are local to one segment; conversation
/// state is never unwound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    /// Fewer than 20 bytes on the wire.
    ShortSegment { needed: usize, got: usize },
    /// Data offset below 5 or past the end of the segment. The ports are
    /// still reported so ICMP-error dissection can show them.
    BogusHeaderLength {
        src_port: u16,
        dst_port: u16,
        data_offset: u8,
    },
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentError::ShortSegment { needed, got } => {
                write!(f, "segment too short: need {} bytes, got {}", needed, got)
            }
            SegmentError::BogusHeaderLength {
                src_port,
                dst_port,
                data_offset,
            } => write!(
                f,
                "bogus header length (data offset {}) on {} -> {}",
                data_offset, src_port, dst_port
            ),
        }
    }
}

impl std::error::Error for SegmentError {}

/// Outcome of the checksum pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumStatus {
    /// Verification disabled, or the segment was fragmented / in an ICMP
    /// error packet.
    NotChecked,
    Valid,
    /// Received 0xFFFF where 0x0000 was computed. RFC 1624 fixup artifact;
    /// reassembly is still permitted.
    Ffff,
    Bad { computed: u16 },
}

impl ChecksumStatus {
    /// Whether desegmentation may use this segment's payload.
    pub fn desegment_ok(&self) -> bool {
        !matches!(self, ChecksumStatus::Bad { .. })
    }
}

/// One parsed TCP segment. Raw sequence fields are always preserved; the
/// relative view and the scaled window are filled in by the engine when
/// sequence analysis is on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeaderRecord {
    pub src_port: u16,
    pub dst_port: u16,
    /// Raw sequence number as seen on the wire.
    pub seq: u32,
    /// Raw acknowledgment number as seen on the wire.
    pub ack: u32,
    pub data_offset: u8,
    pub header_len: usize,
    /// 12-bit flag field; see [`flags`].
    pub flags: u16,
    /// Raw (unscaled) window.
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
    /// Payload length in bytes. SYN/FIN phantom bytes are not included.
    pub seglen: u32,
    pub options: Vec<TcpOption>,
    /// First ≤4 SACK ranges, copied out of the option for quick access.
    pub sack_ranges: Vec<(u32, u32)>,
    /// The MPTCP option, when one was present.
    pub mptcp: Option<MptcpOpt>,
    pub checksum_status: ChecksumStatus,
    /// Dense conversation id; filled by the engine.
    pub stream_id: u32,
    /// Relative sequence number (`seq - base_seq`, mod 2^32), when enabled.
    pub rel_seq: Option<u32>,
    /// Relative acknowledgment number, when enabled.
    pub rel_ack: Option<u32>,
    /// `window << win_scale` once the scale for this direction is known.
    /// SYN segments are never scaled.
    pub effective_window: Option<u32>,
}

impl HeaderRecord {
    #[inline]
    pub fn has(&self, mask: u16) -> bool {
        self.flags & mask != 0
    }

    #[inline]
    pub fn is_syn(&self) -> bool {
        self.has(flags::SYN)
    }

    #[inline]
    pub fn is_fin(&self) -> bool {
        self.has(flags::FIN)
    }

    #[inline]
    pub fn is_rst(&self) -> bool {
        self.has(flags::RST)
    }

    #[inline]
    pub fn is_ack(&self) -> bool {
        self.has(flags::ACK)
    }

    /// SYN without ACK: a connection-opening segment.
    #[inline]
    pub fn is_pure_syn(&self) -> bool {
        self.flags & (flags::SYN | flags::ACK) == flags::SYN
    }

    #[inline]
    pub fn is_syn_ack(&self) -> bool {
        self.flags & (flags::SYN | flags::ACK) == (flags::SYN | flags::ACK)
    }

    /// Sequence-space footprint: payload plus one phantom byte for SYN and
    /// for FIN.
    #[inline]
    pub fn seq_footprint(&self) -> u32 {
        let mut len = self.seglen;
        if self.is_syn() {
            len = len.wrapping_add(1);
        }
        if self.is_fin() {
            len = len.wrapping_add(1);
        }
        len
    }
}

/// Parse one TCP segment. `data` is the full segment (header + payload) as
/// handed up by the IP layer. Option-level warnings land in `notes`.
pub fn parse(
    data: &[u8],
    exp_options_with_magic: bool,
    notes: &mut Vec<ExpertNote>,
) -> Result<HeaderRecord, SegmentError> {
    if data.len() < TCP_MIN_HEADER_LEN {
        return Err(SegmentError::ShortSegment {
            needed: TCP_MIN_HEADER_LEN,
            got: data.len(),
        });
    }

    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dst_port = u16::from_be_bytes([data[2], data[3]]);

    let data_offset = (data[12] >> 4) & 0x0F;
    let header_len = data_offset as usize * 4;
    if header_len < TCP_MIN_HEADER_LEN || header_len > data.len() {
        return Err(SegmentError::BogusHeaderLength {
            src_port,
            dst_port,
            data_offset,
        });
    }

    let flag_bits = u16::from_be_bytes([data[12] & 0x0F, data[13]]);

    let mut record = HeaderRecord {
        src_port,
        dst_port,
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        data_offset,
        header_len,
        flags: flag_bits,
        window: u16::from_be_bytes([data[14], data[15]]),
        checksum: u16::from_be_bytes([data[16], data[17]]),
        urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
        seglen: (data.len() - header_len) as u32,
        options: Vec::new(),
        sack_ranges: Vec::new(),
        mptcp: None,
        checksum_status: ChecksumStatus::NotChecked,
        stream_id: 0,
        rel_seq: None,
        rel_ack: None,
        effective_window: None,
    };

    if header_len > TCP_MIN_HEADER_LEN {
        record.options = options::parse(
            &data[TCP_MIN_HEADER_LEN..header_len],
            exp_options_with_magic,
            notes,
        );
        for opt in &record.options {
            match opt {
                TcpOption::Sack(ranges) => {
                    record.sack_ranges = ranges.iter().take(4).copied().collect();
                }
                TcpOption::Mptcp(m) => record.mptcp = Some(m.clone()),
                _ => {}
            }
        }
    }

    if record.is_syn() && !record.is_ack() && record.ack != 0 {
        notes.push(ExpertNote::warn(
            NoteKind::SynWithNonzeroAck,
            "SYN carries a non-zero acknowledgment field",
        ));
    } else if !record.is_ack() && record.ack != 0 {
        notes.push(ExpertNote::note(
            NoteKind::NonzeroAckFieldWithoutAckFlag,
            "acknowledgment field is non-zero but the ACK flag is not set",
        ));
    }

    Ok(record)
}

/// Compute the TCP checksum over the pseudo-header and segment bytes.
/// Returns the 16-bit value the checksum field should carry.
pub fn compute_checksum(src: IpAddr, dst: IpAddr, segment: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            sum += sum_words(&s.octets());
            sum += sum_words(&d.octets());
            sum += 6; // protocol
            sum += segment.len() as u32;
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            sum += sum_words(&s.octets());
            sum += sum_words(&d.octets());
            sum += segment.len() as u32;
            sum += 6; // next header
        }
        // Mixed families cannot occur for a real segment; fold to zero input.
        _ => {}
    }

    // Segment bytes with the checksum field (offset 16-17) treated as zero.
    for (i, chunk) in segment.chunks(2).enumerate() {
        let off = i * 2;
        if off == 16 {
            continue;
        }
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn sum_words(bytes: &[u8]) -> u32 {
    let mut sum = 0u32;
    for chunk in bytes.chunks(2) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    sum
}

/// Classify the received checksum against the computed one.
pub fn verify_checksum(src: IpAddr, dst: IpAddr, segment: &[u8], received: u16) -> ChecksumStatus {
    let computed = compute_checksum(src, dst, segment);
    if computed == received {
        ChecksumStatus::Valid
    } else if received == 0xFFFF && computed == 0x0000 {
        ChecksumStatus::Ffff
    } else {
        ChecksumStatus::Bad { computed }
    }
}
