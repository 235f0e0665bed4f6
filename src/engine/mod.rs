//! Diagnosis engine adapter.
//!
//! Wire types for the three engine calls, the [`EngineClient`] seam and its
//! HTTP implementation. Response-shape handling lives in
//! [`normalize_diagnosis_payload`] and nowhere else.

mod client;
mod types;


pub use client::*;
pub use types::*;
