//! Deterministic, pure logic shared by the solver core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod finalize;
pub mod invariants;
pub mod policy;
pub mod sanity;
pub mod state_update;
pub mod types;
