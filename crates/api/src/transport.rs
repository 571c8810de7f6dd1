//! Types and traits for moving messages between overlay nodes.

use crate::{Message, NodeKey, PetalResult};

/// The receive side of a node's message inbox, as handed out by
/// [Transport::bind].
pub type MessageRecv = tokio::sync::mpsc::UnboundedReceiver<Message>;

/// A direction of travel around the key ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingDirection {
    /// Toward numerically greater keys, wrapping at the top.
    Clockwise,
    /// Toward numerically smaller keys, wrapping at zero.
    CounterClockwise,
}

/// An addressable peer as known to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandle {
    /// The peer's overlay key.
    pub key: NodeKey,
}

/// Trait-object [Transport].
pub type DynTransport = std::sync::Arc<dyn Transport>;

/// The message fabric connecting overlay nodes.
///
/// Routers only ever address peers through this trait. Besides delivery it
/// exposes the liveness and proximity queries routers need for joining and
/// repair. A networked deployment would back these with its discovery and
/// probing machinery; the in-memory implementation answers them from its
/// peer map.
pub trait Transport: 'static + Send + Sync + std::fmt::Debug {
    /// Register `key` as a live node and get its message inbox.
    ///
    /// Errors if the key is already bound.
    fn bind(&self, key: NodeKey) -> PetalResult<MessageRecv>;

    /// Deliver `msg` to the node bound at `to`.
    ///
    /// Errors if `to` is unknown or down. A self-send (`from == to`) is
    /// delivered without simulated delay.
    fn send(&self, from: NodeKey, to: NodeKey, msg: Message)
        -> PetalResult<()>;

    /// Look up the peer bound at `key`, live or not.
    fn resolve(&self, key: &NodeKey) -> Option<NodeHandle>;

    /// Whether the peer is currently reachable.
    fn is_up(&self, handle: &NodeHandle) -> bool;

    /// Mark a bound key reachable or unreachable. Test and fault-injection
    /// hook.
    fn set_up(&self, key: NodeKey, up: bool);

    /// The one-way latency between two bound keys.
    fn latency(&self, a: &NodeKey, b: &NodeKey) -> std::time::Duration;

    /// Up to `count` distinct live keys, excluding `exclude`, in no
    /// particular order. Used to pick join seeds.
    fn sample_up(&self, count: usize, exclude: &NodeKey) -> Vec<NodeKey>;

    /// Up to `count` live keys nearest to `from` walking the ring in
    /// `direction`, excluding `from` itself, nearest first. Backs leaf set
    /// repair.
    fn nearest_up(
        &self,
        from: &NodeKey,
        direction: RingDirection,
        count: usize,
    ) -> Vec<NodeKey>;
}
