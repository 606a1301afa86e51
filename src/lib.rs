//! streamscope — TCP dissection and stream-analysis engine.
//!
//! A pure, per-packet pipeline: parse a raw TCP segment (over IPv4 or IPv6),
//! maintain per-flow state, classify sequence-number anomalies, reassemble
//! application-layer PDUs across segment boundaries, link MPTCP subflows,
//! and compute conversation-wide timing and bytes-in-flight.
//!
//! The entry point is [`engine::Engine`]: feed it segments in capture order
//! via [`engine::Engine::process_segment`] and collect reassembled PDUs from
//! [`engine::Engine::iter_reassembled`]. Capture, IP dissection, and display
//! are the caller's business.

pub mod analysis;
pub mod config;
pub mod conversation;
pub mod display;
pub mod engine;
pub mod expert;
pub mod flow;
pub mod mptcp;
pub mod options;
pub mod reassembly;
pub mod segment;
pub mod subdissector;

pub use config::EngineConfig;
pub use engine::{Engine, Outcome, SegmentInput};
pub use segment::{SegmentError, SegmentMeta};
