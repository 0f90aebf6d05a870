//! Gatekeeper - Distributed Rate Limiting for gRPC Services
//!
//! This crate enforces per-endpoint request quotas in front of tonic handlers.
//! Counters live in Redis and are updated atomically by a server-side script,
//! so every replica of a service shares the same fixed-window budget. Any
//! failure inside the rate limiter lets the call through.

pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
