//! Houston - request/reply gateway for the Voyager services
//!
//! Bridges synchronous HTTP callers to services reachable only through a
//! message broker: each call becomes one correlated request, answered by
//! exactly one matching reply or a bounded timeout.

pub mod api;
pub mod bus;
pub mod config;
pub mod context;
pub mod gateway;
pub mod inbox;
pub mod inventory;
pub mod ipam;
pub mod storage;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
