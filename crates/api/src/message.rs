//! The messages routed across the overlay.

use crate::{LeafSet, NodeKey, RoutingTable, Timestamp};

/// Maximum number of hops kept in a message trace. Older hops are dropped
/// first once the bound is reached.
pub const MAX_TRACE: usize = 20;

static NEXT_ID: std::sync::atomic::AtomicU64 =
    std::sync::atomic::AtomicU64::new(1);

/// The operation a [Message] carries, tagged per variant.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Payload {
    /// Ask the node owning the message key for the value stored there.
    Lookup,
    /// Store a value at the node owning the message key.
    Insert {
        /// The value to store.
        value: bytes::Bytes,
    },
    /// A lookup answer, sent directly back to the requester.
    Result {
        /// The stored value.
        value: bytes::Bytes,
    },
    /// A join request being routed toward the joiner's own key.
    JoinRequest {
        /// The key of the node that is joining.
        joiner: NodeKey,
        /// Routing table rows accumulated hop by hop along the path.
        table: RoutingTable,
    },
    /// The terminal node's answer to a join request, sent directly back.
    JoinReply {
        /// The accumulated routing table, completed by the terminal node.
        table: RoutingTable,
        /// The terminal node's leaf set, for the joiner to adopt.
        leaf_set: LeafSet,
    },
    /// A freshly joined node announcing itself to a leaf set member.
    LeafProbe {
        /// The key of the announcing node.
        prober: NodeKey,
    },
    /// A self-addressed tick driving the periodic cleaning service.
    ServicePoll,
}

impl Payload {
    /// A short static name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Lookup => "lookup",
            Payload::Insert { .. } => "insert",
            Payload::Result { .. } => "result",
            Payload::JoinRequest { .. } => "joinRequest",
            Payload::JoinReply { .. } => "joinReply",
            Payload::LeafProbe { .. } => "leafProbe",
            Payload::ServicePoll => "servicePoll",
        }
    }
}

/// One message traveling through the overlay.
///
/// `key` is the routing target in key space; `dest` is the concrete node
/// the current hop is addressed to and changes at every forward. The trace
/// records the nodes already visited (bounded by [MAX_TRACE]) and backs
/// the routing loop guard.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Process-unique message id, for log correlation.
    pub id: u64,
    /// What this message does when it reaches the key's owner.
    pub payload: Payload,
    /// The routing target in key space.
    pub key: NodeKey,
    /// The node that created the message.
    pub source: NodeKey,
    /// The node the current hop is addressed to.
    pub dest: NodeKey,
    /// Number of hops taken so far.
    pub hops: u32,
    /// The most recent nodes this message passed through.
    pub trace: Vec<NodeKey>,
    /// When the message was created.
    pub timestamp: Timestamp,
}

impl Message {
    /// Create a new message with a fresh id, zero hops and an empty trace.
    pub fn new(
        payload: Payload,
        source: NodeKey,
        dest: NodeKey,
        key: NodeKey,
    ) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            payload,
            key,
            source,
            dest,
            hops: 0,
            trace: Vec::new(),
            timestamp: Timestamp::now(),
        }
    }

    /// Record a hop through `node`: bump the hop count and append to the
    /// trace, dropping the oldest entry when the trace is full.
    pub fn record_hop(&mut self, node: NodeKey) {
        self.hops += 1;
        if self.trace.len() == MAX_TRACE {
            self.trace.remove(0);
        }
        self.trace.push(node);
    }

    /// The node most recently recorded in the trace, if any.
    pub fn last_hop(&self) -> Option<NodeKey> {
        self.trace.last().copied()
    }
}

/// What an application listener receives when a routed operation completes
/// at the local node.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The key the completed operation targeted.
    pub key: NodeKey,
    /// The value looked up, if the operation produced one.
    pub value: Option<bytes::Bytes>,
    /// Hops the operation took through the overlay.
    pub hops: u32,
    /// When the originating message was created.
    pub timestamp: Timestamp,
    /// The nodes the operation passed through, oldest first.
    pub path: Vec<NodeKey>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trace_is_bounded_and_drops_oldest() {
        let k = NodeKey(7);
        let mut msg = Message::new(Payload::Lookup, k, k, k);
        for i in 0..(MAX_TRACE as u128 + 5) {
            msg.record_hop(NodeKey(i));
        }
        assert_eq!(MAX_TRACE, msg.trace.len());
        assert_eq!(MAX_TRACE as u32 + 5, msg.hops);
        assert_eq!(Some(NodeKey(MAX_TRACE as u128 + 4)), msg.last_hop());
        assert_eq!(NodeKey(5), msg.trace[0]);
    }

    #[test]
    fn ids_are_unique() {
        let k = NodeKey(1);
        let a = Message::new(Payload::Lookup, k, k, k);
        let b = Message::new(Payload::ServicePoll, k, k, k);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn payload_serde_is_tagged() {
        let p = Payload::Insert {
            value: bytes::Bytes::from_static(b"hi"),
        };
        let enc = serde_json::to_string(&p).unwrap();
        assert!(enc.contains("\"type\":\"insert\""), "{enc}");
        let dec: Payload = serde_json::from_str(&enc).unwrap();
        assert_eq!(p, dec);
    }
}
