//! # Tristore Configuration Module
//!
//! Centralizes the configuration constants of the page persistence layer.
//! Interdependent values live next to each other and the dependencies are
//! enforced through compile-time assertions.
//!
//! Runtime configuration (paths, page size, cache policy, background writes)
//! lives on [`crate::PageStoreBuilder`] and [`crate::cache::PageCacheConfig`];
//! the values here are their defaults.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency documentation

pub mod constants;
pub use constants::*;
