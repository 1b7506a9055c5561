//! shelfcache: a tag-indexed HTTP response cache with real-time invalidation
//! and WebSocket event fan-out.

pub mod cache;
pub mod config;
pub mod context;
pub mod events;
pub mod infra;
pub mod realtime;
mod util;
