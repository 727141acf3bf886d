//! Release-gate - verification controller for candidate release tags
//!
//! Release-gate watches image streams whose tags are candidate release
//! payloads and drives every tag through its configured verification and
//! test jobs until the tag has the inputs another component needs to mark
//! it Accepted or Rejected.
//!
//! # Architecture
//!
//! Per tag, a reconcile is a pure fold over external state: decode the
//! status annotations, consult the job facade for every configured slot
//! (creating jobs as needed), write the updated status back in a single
//! annotation patch, and hand the earliest retry backoff to the work
//! queue as a delayed re-enqueue. The controller never sleeps and never
//! overwrites a terminal attempt.
//!
//! # Modules
//!
//! - [`config`] - Release and verification configuration types
//! - [`release`] - Streams, tags, phases, and annotation keys
//! - [`status`] - Persisted status shapes, codec, and completeness evaluators
//! - [`backoff`] - Exponential retry backoff
//! - [`upgrades`] - Upgrade graph, stable index, and upgrade-source resolver
//! - [`jobs`] - Job naming, environment contract, and the prow job facade
//! - [`queue`] - Work queue with delayed re-enqueue
//! - [`controller`] - Per-tag reconciliation
//! - [`error`] - Error types for the controller

pub mod backoff;
pub mod config;
pub mod controller;
pub mod error;
pub mod jobs;
pub mod queue;
pub mod release;
pub mod status;
pub mod upgrades;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
