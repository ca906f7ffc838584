//! HTTP facilitator service for turnpike x402 payments.
//!
//! Verification and settlement logic live in the core [`turnpike`] crate;
//! this crate provides the HTTP surface, shared state, webhook registry and
//! delivery, metrics, and bootstrap.
//!
//! # Modules
//!
//! - [`routes`] — the JSON endpoints (`/verify`, `/settle`, `/supported`, ...)
//! - [`state`] — shared [`AppState`](state::AppState)
//! - [`webhook`] — sqlite-backed registry and signed, fire-and-forget delivery
//! - [`discovery`] — the priced-endpoint catalog behind `/discovery/resources`
//! - [`metrics`] — prometheus counters for verify/settle/webhook operations
//! - [`bootstrap`] — constructs the whole service from a validated config

pub mod bootstrap;
pub mod discovery;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod webhook;
