use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    /// A value outside its documented range.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "config io error: {}", err),
            ConfigError::Parse(err) => write!(f, "config parse error: {}", err),
            ConfigError::Invalid(msg) => write!(f, "config invalid: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Engine configuration: a flat set of switches fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Verify the TCP checksum; a mismatch disallows reassembly for that
    /// segment.
    pub check_checksum: bool,
    /// Allow subdissectors to reassemble PDUs across segments.
    pub allow_desegment: bool,
    /// Buffer out-of-order segments into unfinished PDUs. Only effective
    /// together with `allow_desegment`.
    pub reassemble_out_of_order: bool,
    /// Run sequence-number analysis.
    pub analyze_seq: bool,
    /// Present seq/ack relative to the initial sequence number.
    pub relative_seq: bool,
    /// Window scale shift assumed when no window-scale option was captured;
    /// -1 disables the fallback.
    pub default_window_scaling: i8,
    /// Compute bytes in flight per data segment.
    pub track_bytes_in_flight: bool,
    /// Compute conversation-relative timestamps.
    pub calculate_ts: bool,
    /// Leave the timestamps option out of the info column.
    pub ignore_timestamps: bool,
    /// Skip the subdissector on retransmitted or out-of-order segments.
    pub no_subdissector_on_error: bool,
    /// Try heuristic subdissectors before the port table.
    pub try_heuristic_first: bool,
    /// Treat option kinds 253/254 as carrying a magic number.
    pub exp_options_with_magic: bool,
    pub mptcp: MptcpConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            check_checksum: false,
            allow_desegment: true,
            reassemble_out_of_order: false,
            analyze_seq: true,
            relative_seq: true,
            default_window_scaling: -1,
            track_bytes_in_flight: true,
            calculate_ts: true,
            ignore_timestamps: false,
            no_subdissector_on_error: true,
            try_heuristic_first: false,
            exp_options_with_magic: true,
            mptcp: MptcpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MptcpConfig {
    /// Link subflows and surface MPTCP analysis.
    pub analyze_mptcp: bool,
    /// Present DSNs relative to the base DSN.
    pub relative_seq: bool,
    /// Build the DSS mapping interval tree.
    pub analyze_mappings: bool,
    /// Match DSN ranges across subflows to spot reinjections.
    pub intersubflows_retransmission: bool,
}

impl Default for MptcpConfig {
    fn default() -> Self {
        MptcpConfig {
            analyze_mptcp: true,
            relative_seq: true,
            analyze_mappings: false,
            intersubflows_retransmission: false,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: EngineConfig = toml::from_str(&raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-1..=14).contains(&self.default_window_scaling) {
            return Err(ConfigError::Invalid(format!(
                "default_window_scaling must be -1..=14, got {}",
                self.default_window_scaling
            )));
        }
        if self.reassemble_out_of_order && !self.allow_desegment {
            return Err(ConfigError::Invalid(
                "reassemble_out_of_order requires allow_desegment".into(),
            ));
        }
        Ok(())
    }
}
