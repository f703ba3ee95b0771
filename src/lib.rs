//! Floodgate - In-Memory Request Admission Core
//!
//! This crate decides whether an incoming request may proceed. It enforces
//! token-bucket limits at global, per-identity and per-endpoint scope, blocks
//! identities that fire bursts of requests, and keeps its limiter state
//! bounded with idle eviction.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
