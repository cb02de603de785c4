//! Integration tests for Undertow
//!
//! Exercise the storage layer and the torrent server together through their
//! public interfaces, with the swarm engine replaced by the test-utils mocks.

#[path = "integration/cache_eviction.rs"]
mod cache_eviction;
#[path = "integration/server_lifecycle.rs"]
mod server_lifecycle;
