#![deny(missing_docs)]
//! The petal node engine.
//!
//! [router::Router] is the per-node state machine: it routes messages by
//! key prefix, answers lookups and inserts, runs the join protocol and the
//! periodic cleaning service. [bootstrap] pre-builds consistent node state
//! for a whole ring at once, and [mem_transport] is the in-process message
//! fabric the engine is tested against.

pub mod bootstrap;
pub mod mem_transport;
pub mod router;
