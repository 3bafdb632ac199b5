//! # Chat fan-out engine
//!
//! Real-time group chat backend: clients join named rooms over WebSocket,
//! receive recent history on join, post messages that are persisted and then
//! fanned out to every member of the room across all backend instances.
//!
//! Shared state (recent-message cache, presence, rate-limit counters) lives
//! behind the [`store`] seams so several processes can coordinate through
//! Redis, or a single process can run entirely in memory.

pub mod config;
pub mod server;
pub mod store;
pub mod utils;
