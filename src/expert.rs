//! Expert annotations attached to a per-segment outcome.
//!
//! The engine never aborts on malformed input; everything that would be a
//! warning in a UI is collected here as a typed note and handed back on the
//! `Outcome` for the display surface to render.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Chat,
    Note,
    Warn,
    Error,
}

/// What a note is about. One variant per distinct condition so callers can
/// filter without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    ChecksumBad,
    ChecksumFfff,
    OptionLengthInvalid,
    SubOptionMalformed,
    FourConsecutiveNops,
    WindowScaleClamped,
    SynWithNonzeroAck,
    NonzeroAckFieldWithoutAckFlag,
    ScpsSnackHole,
    MptcpEchoedKeyMismatch,
    MptcpMissingAlgorithm,
    MptcpUnsupportedAlgorithm,
    MptcpInfiniteMapping,
    MptcpMappingMissing,
    MptcpReinjectionOf,
    MptcpReinjectedIn,
    RetransmittedSegmentData,
    SubdissectorFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpertNote {
    pub severity: Severity,
    pub kind: NoteKind,
    pub detail: String,
}

impl ExpertNote {
    pub fn note(kind: NoteKind, detail: impl Into<String>) -> Self {
        ExpertNote {
            severity: Severity::Note,
            kind,
            detail: detail.into(),
        }
    }

    pub fn warn(kind: NoteKind, detail: impl Into<String>) -> Self {
        ExpertNote {
            severity: Severity::Warn,
            kind,
            detail: detail.into(),
        }
    }

    pub fn error(kind: NoteKind, detail: impl Into<String>) -> Self {
        ExpertNote {
            severity: Severity::Error,
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ExpertNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.severity, self.detail)
    }
}
