//! Integration test binary -- all integration tests consolidated into a single
//! binary.

// Allow unwrap/expect in test code
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod helpers;

mod recurrence_engine;
mod rule_cache;
mod rule_validation;
mod scheduler_end_to_end;
mod scheduler_recovery;
