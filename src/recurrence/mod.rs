//! Recurrence computation.
//!
//! Turns a [`Frequency`] and a reference instant into the next occurrence,
//! with calendar arithmetic done in a configurable timezone and custom
//! RRULE frequencies compiled once and cached.

pub mod cache;
pub mod engine;
pub mod frequency;
pub mod rule;
pub mod timezone;
pub mod validator;

pub use cache::{RuleCache, RuleCacheEntry, RuleCacheStats};
pub use engine::RecurrenceEngine;
pub use frequency::Frequency;
pub use rule::{CompiledRule, RuleFrequency, RuleParts};
pub use timezone::TimezoneHandler;
pub use validator::{ValidationResult, is_expired, validate, validate_syntax};
