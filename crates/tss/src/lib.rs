//! Threshold signature coordination
//!
//! Client side of the signer cluster: asks the cluster to sign batches of state roots,
//! requests slash transactions for misbehaving sequencers and runs the keygen ceremony.
//! Culprit responses surface as `TssError::Culprit` so callers escalate to slashing
//! instead of retrying.

pub mod client;
pub mod error;
pub mod http;
pub mod serde_helpers;
pub mod types;

pub use client::{SignerTransport, ThresholdSignatureCoordinator};
pub use error::{FailureClass, Result, TssError};
pub use http::HttpSignerTransport;
pub use types::*;
