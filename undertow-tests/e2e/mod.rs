//! End-to-end tests for Undertow
//!
//! Drive the torrent server against the simulated swarm: metadata retrieval,
//! streaming through the bounded cache, preload and restart from disk.

mod streaming_workflow;
