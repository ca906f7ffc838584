//! Security invariant tests for the turnpike payment facilitator.
//!
//! This crate contains no production code. Its test suite scans the
//! workspace sources and fails the build when a security property regresses;
//! see `tests/security_invariants.rs`.
