//! Offline-first caching and sync layer for the memorial web client.
//!
//! - [`cache`]: request interception, caching strategies and cache lifecycle.
//! - [`sync`]: the durable write queues and their drain.
//! - [`db`]: the local persistent store behind both.
//! - [`proxy`]: the local HTTP front the client talks to.

pub mod api;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod model;
pub mod proxy;
pub mod sync;
