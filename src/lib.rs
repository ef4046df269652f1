//! Rampart - Adaptive Abuse-Protection Engine
//!
//! This crate implements a per-request abuse-protection and rate-limiting
//! engine. For each request it decides whether an actor (IP, device, account)
//! should be allowed, soft-blocked, or hard-blocked, based on a decaying risk
//! score, device-identity confidence, and per-endpoint policy. All mutable
//! state lives behind external store traits, making the engine itself
//! stateless and safe for concurrent invocation.

pub mod config;
pub mod error;
pub mod identity;
pub mod limiter;
pub mod signal;
pub mod store;
