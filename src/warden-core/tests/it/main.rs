//! Consolidated integration tests for warden-core.
//!
//! One test binary keeps proptest suites from running as parallel
//! processes. See: https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html

mod common;

mod cache;
mod scenario;
mod security;
mod signature;
mod validation;
