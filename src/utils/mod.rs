//! Shared helpers used across the codebase.

pub mod retry;

pub use retry::with_retry;
