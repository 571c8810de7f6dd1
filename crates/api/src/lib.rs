#![deny(missing_docs)]
//! Petal API contains the shared types and the module traits that make up
//! the boundary of the prefix-routed overlay core.
//!
//! A petal node owns a prefix-indexed [RoutingTable] and a [LeafSet] of its
//! nearest ring neighbors, and routes [Message]s toward the live node whose
//! key is numerically closest to the target. The node engine itself lives in
//! the petal_core crate; this crate defines the data model and the two
//! collaborator seams: the downward [transport::Transport] and the upward
//! [app::AppHandler].

pub mod app;
pub mod transport;

mod config;
pub use config::*;

mod error;
pub use error::*;

mod key;
pub use key::*;

mod timestamp;
pub use timestamp::*;

mod routing_table;
pub use routing_table::*;

mod leaf_set;
pub use leaf_set::*;

mod message;
pub use message::*;
