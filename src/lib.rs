//! Gateward - Multi-Layer Admission Control
//!
//! This crate implements the admission-control core for a request-serving
//! application backed by an expensive inference service. Three cooperating
//! throttles are composed into a single allow/reject decision: a global
//! token bucket capping aggregate throughput, a per-client sliding window
//! enforcing fairness, and a feedback-driven adaptive limiter that tightens
//! under backend degradation. A background sweeper bounds the memory used
//! by per-client state.
//!
//! The crate performs no I/O of its own: the embedding middleware layer
//! extracts a [`ratelimit::ClientKey`] from request metadata, calls
//! [`ratelimit::RateLimitCoordinator::check`], and maps the returned
//! [`ratelimit::Decision`] onto transport-level signals.

pub mod config;
pub mod error;
pub mod ratelimit;
