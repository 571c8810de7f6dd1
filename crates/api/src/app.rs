//! The callback surface applications register with a router.

use crate::Delivery;

/// Trait-object [AppHandler].
pub type DynAppHandler = std::sync::Arc<dyn AppHandler>;

/// Receives completed operations from a router.
///
/// Called on the router's receive task, so implementations should hand
/// work off rather than block.
pub trait AppHandler: 'static + Send + Sync + std::fmt::Debug {
    /// A routed operation completed at the local node.
    fn receive(&self, delivery: Delivery);
}
