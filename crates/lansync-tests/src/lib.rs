//! LanSync integration testing support
//!
//! Shared fixtures for the end-to-end tests under `tests/`: node
//! configurations that stay off the real network, deterministic file
//! content, and helpers that make one node see another as alive.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Fixtures shared by the integration tests
pub mod test_utils;
