//! Decoding of Nexpose-style XML scan reports into an owned tree of records.
//!
//! [`decode`] is the single entry point. It performs no I/O and returns
//! either a fully populated [`ScanRun`] or a [`DecodeError`], never both.

pub mod decode;
pub mod error;
pub mod model;

pub use decode::{decode, MAX_EVIDENCE_DEPTH};
pub use error::DecodeError;
pub use model::{
    Configuration, Endpoint, EvidenceNode, Fingerprint, HostName, ListItem, ScanRun, Service, Test,
};
