// tests/property/mod.rs

//! Property-based tests for replgate

pub mod engine_test;
pub mod journal_test;
pub mod topology_test;
