//! HTTP surface of the cache daemon.
//!
//! Provides the axum router with the read-through object endpoint, the
//! write-hash event receiver, and the status/health/metrics endpoints.

pub mod handler;
