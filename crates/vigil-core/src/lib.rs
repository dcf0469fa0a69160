//! Vigil core library: static analysis of submitted source snippets behind
//! per-identity admission control.
//!
//! The crate provides the metrics extractor, the heuristic detector
//! registry, the suggestion synthesizer and the time-budgeted orchestrator,
//! together with the sliding-window rate limiter, token identity and the
//! activity ledger that guard them. With the `python` feature it is also
//! compiled as a Python extension module (`_vigil_core`) via PyO3.

pub mod activity;
pub mod analysis;
pub mod config;
pub mod errors;
pub mod identity;
pub mod limiter;
pub mod models;
pub mod service;
pub mod store;

#[cfg(feature = "python")]
mod python;

pub use errors::{VigilError, VigilResult};
pub use service::{AnalysisRequest, AnalysisService};
