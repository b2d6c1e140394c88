//! Core types for the meshpath routing stack.
//!
//! This crate holds the pieces shared by the routing and prefix layers:
//! the MAC address newtype, the PANN wire codec, and the counters context
//! handed to each subsystem at construction.

pub mod error;
pub mod pann;
pub mod stats;
pub mod types;
