//! Shared helpers for integration tests.

#[allow(dead_code)]
pub mod connect_proxy;
pub mod socket_guard;
