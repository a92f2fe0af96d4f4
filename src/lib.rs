//! Offline engine for the CarbonOS dashboard: request interception, tiered
//! response caching, cache generations and durable replay of mutations made
//! while offline.

pub mod cache;
pub mod classify;
pub mod config;
pub mod control;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod http;
pub mod lifecycle;
pub mod notify;
pub mod queue;
pub mod router;
pub mod transport;

#[cfg(test)]
mod testing;
