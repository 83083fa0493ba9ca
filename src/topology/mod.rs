//! Built-in, config-driven stage kinds. Each one is grounded on a teacher
//! processor of the same shape (a `*Params` struct built via
//! [`crate::config::StageParams`], a thin stage wrapping it) and is
//! registered under its `kind` string by [`crate::registry`].

pub mod filter;
pub mod map;
pub mod merge;
pub mod metrics;
pub mod passthrough;
pub mod router;
pub mod tracing_wrapper;
