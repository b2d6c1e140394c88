//! Mesh path layer: proactive gateway-aware path discovery.
//!
//! This crate maintains per-destination mesh paths learned from Proactive
//! Announcement (PANN) floods, selects a preferred gateway with hysteresis,
//! and reconciles the resulting next-hops into the forwarding table through
//! a pluggable FIB client.
//!
//! The protocol state machine ([`engine::RoutingState`]) is pure and
//! synchronous; [`service::RoutingService`] wraps it in a single tokio task
//! owning the UDP sockets and timers.

pub mod constants;
pub mod engine;
pub mod error;
pub mod fib;
pub mod gateway;
pub mod metric;
pub mod path;
pub mod service;
