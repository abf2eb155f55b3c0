//! Normalization, similarity scoring, and tiered fuzzy matching for
//! commercial-property records.
//!
//! Everything in this crate is pure and deterministic: callers own the
//! candidate pools and the [`matcher::CandidateIndex`] built over them, and
//! nothing here touches storage or the network.

pub mod matcher;
pub mod normalize;
pub mod score;

pub use matcher::{Candidate, CandidateIndex, Thresholds};
pub use matcher::{match_address, match_company, match_person};

pub const CRATE_NAME: &str = "lotline-match";
