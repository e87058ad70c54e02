//! HTTP API server for NeuroChron.
//!
//! Exposes job submission, status queries, listing and cancellation over
//! a JSON REST API.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
