//! # Darkstar Testing Utils
//!
//! Shared test doubles for the workspace crates: runnables with scripted
//! outcomes, an in-memory data store with failure injection, and polling helpers.
//!
//! ```toml
//! [dev-dependencies]
//! darkstar-testing-utils = { path = "../testing-utils" }
//! ```

pub mod helpers;
pub mod mocks;

pub use helpers::*;
pub use mocks::*;
