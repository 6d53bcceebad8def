//! Cross-module integration tests for the state database.

pub mod destruction;
pub mod lifecycle;
pub mod parallel;
