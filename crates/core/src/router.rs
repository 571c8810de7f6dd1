//! The per-node overlay engine.
//!
//! A [Router] owns one routing table and one leaf set, and does four jobs:
//! pick the next hop for every message addressed to a key, store and
//! answer values for the keys it owns, run the join protocol when it
//! enters the ring dynamically, and sweep its tables for dead entries on a
//! jittered timer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use petal_api::app::*;
use petal_api::transport::*;
use petal_api::*;

/// Tunables for one [Router].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    /// Base delay between cleaning sweeps in milliseconds.
    pub cleaning_interval_ms: u64,
    /// Upper bound of the random extra delay added before each sweep.
    pub cleaning_jitter_ms: u64,
    /// How many live candidates to sample when picking a join seed.
    pub join_sample: usize,
    /// How many times to regenerate a colliding join key before giving up.
    pub join_key_attempts: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cleaning_interval_ms: 1000,
            cleaning_jitter_ms: 1000,
            join_sample: 10,
            join_key_attempts: 8,
        }
    }
}

/// Where a node is in its join lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    /// Not yet part of the ring.
    Unjoined,
    /// Join request sent, waiting for the reply.
    AwaitingReply,
    /// Full ring member.
    Joined,
}

struct RouterState {
    table: RoutingTable,
    leaf_set: LeafSet,
    join_state: JoinState,
    store: HashMap<NodeKey, bytes::Bytes>,
}

/// One overlay node.
pub struct Router {
    key: NodeKey,
    ring: RingConfig,
    transport: DynTransport,
    state: Mutex<RouterState>,
    listener: Mutex<Option<DynAppHandler>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("key", &self.key).finish()
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Router {
    /// Construct a node that is already a ring member, with empty tables.
    ///
    /// This is the static-membership entry point: the caller typically
    /// follows up with [Router::install_state] using bootstrap-built
    /// state. `key` must not be bound on the transport yet.
    pub fn new(
        ring: RingConfig,
        config: RouterConfig,
        key: NodeKey,
        transport: DynTransport,
        listener: Option<DynAppHandler>,
    ) -> PetalResult<Arc<Self>> {
        ring.validate()?;
        let recv = transport.bind(key)?;
        let state = RouterState {
            table: RoutingTable::new(&ring),
            leaf_set: LeafSet::new(key, &ring),
            join_state: JoinState::Joined,
            store: HashMap::new(),
        };
        Ok(Self::spawn(ring, config, key, transport, listener, state, recv))
    }

    /// Construct a node that joins the ring dynamically.
    ///
    /// Generates a fresh random key (regenerating on collision with a key
    /// the transport already knows), binds it, and routes a join request
    /// toward that key through the lowest-latency seed of a random node
    /// sample. Comes up as an immediately joined singleton when the
    /// transport knows no other live node.
    pub fn join(
        ring: RingConfig,
        config: RouterConfig,
        transport: DynTransport,
        listener: Option<DynAppHandler>,
    ) -> PetalResult<Arc<Self>> {
        ring.validate()?;
        let key = generate_join_key(
            transport.as_ref(),
            &mut rand::thread_rng(),
            config.join_key_attempts,
        )?;
        let seed =
            lowest_latency_seed(transport.as_ref(), &key, config.join_sample);
        let recv = transport.bind(key)?;
        let state = RouterState {
            table: RoutingTable::new(&ring),
            leaf_set: LeafSet::new(key, &ring),
            join_state: if seed.is_some() {
                JoinState::AwaitingReply
            } else {
                JoinState::Joined
            },
            store: HashMap::new(),
        };
        let this =
            Self::spawn(ring, config, key, transport, listener, state, recv);
        if let Some(seed) = seed {
            let table = RoutingTable::new(&this.ring);
            let msg = Message::new(
                Payload::JoinRequest { joiner: key, table },
                key,
                seed,
                key,
            );
            this.transport.send(key, seed, msg)?;
            tracing::info!(
                node = %key.short(),
                seed = %seed.short(),
                "join request sent"
            );
        }
        Ok(this)
    }

    fn spawn(
        ring: RingConfig,
        config: RouterConfig,
        key: NodeKey,
        transport: DynTransport,
        listener: Option<DynAppHandler>,
        state: RouterState,
        mut recv: MessageRecv,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            key,
            ring,
            transport,
            state: Mutex::new(state),
            listener: Mutex::new(listener),
            tasks: Mutex::new(Vec::new()),
        });

        // tasks hold only weak references so dropping the last outside
        // handle shuts the node down
        let weak = Arc::downgrade(&this);
        let recv_task = tokio::task::spawn(async move {
            while let Some(msg) = recv.recv().await {
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.handle_message(msg);
            }
        });

        let weak = Arc::downgrade(&this);
        let transport = this.transport.clone();
        let interval = config.cleaning_interval_ms;
        let jitter = config.cleaning_jitter_ms;
        let clean_task = tokio::task::spawn(async move {
            loop {
                let extra = rand::Rng::gen_range(
                    &mut rand::thread_rng(),
                    0..=jitter,
                );
                tokio::time::sleep(std::time::Duration::from_millis(
                    interval + extra,
                ))
                .await;
                if weak.upgrade().is_none() {
                    break;
                }
                let poll =
                    Message::new(Payload::ServicePoll, key, key, key);
                if let Err(err) = transport.send(key, key, poll) {
                    tracing::debug!(?err, "cleaning poll skipped");
                }
            }
        });

        *this.tasks.lock().unwrap() = vec![recv_task, clean_task];
        this
    }

    /// This node's overlay key.
    pub fn local_key(&self) -> NodeKey {
        self.key
    }

    /// Where this node is in its join lifecycle.
    pub fn join_state(&self) -> JoinState {
        self.state.lock().unwrap().join_state
    }

    /// True once the node is a full ring member.
    pub fn is_joined(&self) -> bool {
        self.join_state() == JoinState::Joined
    }

    /// Snapshot of the routing table.
    pub fn routing_table(&self) -> RoutingTable {
        self.state.lock().unwrap().table.clone()
    }

    /// Snapshot of the leaf set.
    pub fn leaf_set(&self) -> LeafSet {
        self.state.lock().unwrap().leaf_set.clone()
    }

    /// The value stored locally at `key`, if this node holds one.
    pub fn stored_value(&self, key: &NodeKey) -> Option<bytes::Bytes> {
        self.state.lock().unwrap().store.get(key).cloned()
    }

    /// Replace the registered application listener.
    pub fn set_listener(&self, listener: Option<DynAppHandler>) {
        *self.listener.lock().unwrap() = listener;
    }

    /// Install externally built routing state, as produced by the
    /// bootstrap builder. The leaf set is repointed at this node's key.
    pub fn install_state(&self, table: RoutingTable, mut leaf_set: LeafSet) {
        leaf_set.set_pivot(self.key);
        let mut state = self.state.lock().unwrap();
        state.table = table;
        state.leaf_set = leaf_set;
        state.join_state = JoinState::Joined;
    }

    /// Route a lookup for `key` from this node. The answer arrives at the
    /// registered listener.
    pub fn lookup(&self, key: NodeKey) -> PetalResult<()> {
        self.send_local(Payload::Lookup, key)
    }

    /// Route an insert storing `value` at the live node closest to `key`.
    pub fn insert(
        &self,
        key: NodeKey,
        value: bytes::Bytes,
    ) -> PetalResult<()> {
        self.send_local(Payload::Insert { value }, key)
    }

    // Local operations enter through the node's own inbox so they take
    // the same dispatch path as forwarded traffic.
    fn send_local(&self, payload: Payload, key: NodeKey) -> PetalResult<()> {
        let msg = Message::new(payload, self.key, self.key, key);
        self.transport.send(self.key, self.key, msg)
    }

    fn handle_message(&self, mut msg: Message) {
        tracing::trace!(
            node = %self.key.short(),
            id = msg.id,
            ty = msg.payload.type_name(),
            "received"
        );
        match &msg.payload {
            Payload::ServicePoll => self.cleaning_sweep(),
            Payload::Result { .. } => self.deliver(msg),
            Payload::JoinReply { .. } => self.handle_join_reply(msg),
            Payload::LeafProbe { prober } => {
                let prober = *prober;
                self.handle_leaf_probe(prober);
            }
            Payload::JoinRequest { joiner, .. } => {
                let joiner = *joiner;
                self.absorb_join_request(joiner, &mut msg);
                self.route(msg);
            }
            Payload::Lookup | Payload::Insert { .. } => self.route(msg),
        }
    }

    // Every node a join request passes through contributes one row of
    // routing knowledge to the accumulating table it carries.
    fn absorb_join_request(&self, joiner: NodeKey, msg: &mut Message) {
        if joiner == self.key {
            return;
        }
        let row = self.key.prefix_len(&joiner, &self.ring) + 1;
        let state = self.state.lock().unwrap();
        if let Payload::JoinRequest { table, .. } = &mut msg.payload {
            table.copy_row_from(&state.table, row);
        }
    }

    /// Forward `msg` one hop toward its key, or consume it here when this
    /// node is the closest it will get.
    fn route(&self, mut msg: Message) {
        msg.record_hop(self.key);
        let target = msg.key;
        let next = {
            let state = self.state.lock().unwrap();
            next_hop(&state.table, &state.leaf_set, self.key, target, &self.ring)
        };
        match next {
            // refuse a hop that makes no ring progress past the latest
            // trace entry (this node itself)
            Some(next)
                if next.ring_distance(&target)
                    < self.key.ring_distance(&target) =>
            {
                msg.dest = next;
                if let Err(err) = self.transport.send(self.key, next, msg) {
                    tracing::warn!(
                        node = %self.key.short(),
                        next = %next.short(),
                        ?err,
                        "next hop unreachable, dropping message"
                    );
                }
            }
            _ => self.handle_terminal(msg),
        }
    }

    // The message resolved to this node.
    fn handle_terminal(&self, msg: Message) {
        match msg.payload.clone() {
            Payload::Lookup => self.answer_lookup(msg),
            Payload::Insert { value } => {
                tracing::debug!(
                    node = %self.key.short(),
                    key = %msg.key,
                    "storing value"
                );
                self.state.lock().unwrap().store.insert(msg.key, value);
            }
            Payload::JoinRequest { joiner, table } => {
                self.answer_join(joiner, table);
            }
            other => {
                tracing::debug!(
                    ty = other.type_name(),
                    "unroutable message resolved locally, dropping"
                );
            }
        }
    }

    fn answer_lookup(&self, msg: Message) {
        let value = self.state.lock().unwrap().store.get(&msg.key).cloned();
        let Some(value) = value else {
            tracing::debug!(
                node = %self.key.short(),
                key = %msg.key,
                "lookup missed, nothing stored"
            );
            return;
        };
        // transform in place so the hop count and trace survive into the
        // requester's delivery
        let mut reply = msg;
        reply.payload = Payload::Result { value };
        reply.dest = reply.source;
        reply.source = self.key;
        let to = reply.dest;
        if let Err(err) = self.transport.send(self.key, to, reply) {
            tracing::warn!(?err, "lookup requester unreachable");
        }
    }

    fn answer_join(&self, joiner: NodeKey, table: RoutingTable) {
        if joiner == self.key {
            tracing::warn!(
                node = %self.key.short(),
                "join request for our own key, dropping"
            );
            return;
        }
        let leaf_set = self.state.lock().unwrap().leaf_set.clone();
        let reply = Message::new(
            Payload::JoinReply { table, leaf_set },
            self.key,
            joiner,
            joiner,
        );
        if let Err(err) = self.transport.send(self.key, joiner, reply) {
            tracing::warn!(?err, "joiner unreachable, dropping join reply");
        }
    }

    fn handle_join_reply(&self, msg: Message) {
        let Payload::JoinReply { table, leaf_set } = msg.payload else {
            return;
        };
        let from = msg.source;
        let mut probe_targets = leaf_set.list_all_nodes();
        probe_targets.push(from);
        {
            let mut state = self.state.lock().unwrap();
            if state.join_state != JoinState::AwaitingReply {
                tracing::debug!(
                    node = %self.key.short(),
                    "unexpected join reply, dropping"
                );
                return;
            }
            // the accumulated rows were indexed by each contributing
            // hop's own prefix relationships, so re-place every entry at
            // the cell it belongs to from our point of view
            let mut rebuilt = RoutingTable::new(&self.ring);
            for (_, _, key) in table.entries() {
                if key == self.key {
                    continue;
                }
                let row = self.key.prefix_len(&key, &self.ring);
                let col = key.digit_at(row, &self.ring);
                rebuilt.set(row, col, Some(key));
            }
            state.table = rebuilt;
            let mut adopted = leaf_set;
            adopted.set_pivot(self.key);
            // the replying node is the pivot of the set it sent, so it is
            // not among the entries; it is our nearest known neighbor
            adopted.push(from);
            for key in &probe_targets {
                if *key == self.key {
                    continue;
                }
                let row = self.key.prefix_len(key, &self.ring);
                let col = key.digit_at(row, &self.ring);
                state.table.set(row, col, Some(*key));
            }
            state.leaf_set = adopted;
            state.join_state = JoinState::Joined;
        }
        tracing::info!(node = %self.key.short(), "joined the ring");
        for key in probe_targets {
            if key == self.key {
                continue;
            }
            let probe = Message::new(
                Payload::LeafProbe { prober: self.key },
                self.key,
                key,
                key,
            );
            if let Err(err) = self.transport.send(self.key, key, probe) {
                tracing::debug!(?err, "leaf neighbor unreachable, skipping probe");
            }
        }
    }

    // A freshly joined neighbor announced itself.
    fn handle_leaf_probe(&self, prober: NodeKey) {
        if prober == self.key {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.leaf_set.push(prober);
        let row = self.key.prefix_len(&prober, &self.ring);
        let col = prober.digit_at(row, &self.ring);
        let replace = match state.table.get(row, col) {
            None => true,
            Some(incumbent) => {
                self.transport.latency(&self.key, &prober)
                    <= self.transport.latency(&self.key, &incumbent)
            }
        };
        if replace {
            state.table.set(row, col, Some(prober));
        }
    }

    /// Drop dead entries from both tables and refill leaf set holes from
    /// the nearest live nodes in each ring direction.
    fn cleaning_sweep(&self) {
        let mut state = self.state.lock().unwrap();
        let dead: Vec<(usize, usize, NodeKey)> = state
            .table
            .entries()
            .filter(|(_, _, key)| !self.alive(key))
            .collect();
        for (row, col, key) in dead {
            tracing::debug!(
                node = %self.key.short(),
                dead = %key.short(),
                "clearing dead routing entry"
            );
            state.table.set(row, col, None);
        }
        for key in state.leaf_set.list_all_nodes() {
            if !self.alive(&key) {
                state.leaf_set.remove_node_id(&key);
            }
        }
        let half = state.leaf_set.half_size();
        if state.leaf_set.need_repair_right() {
            for key in self.transport.nearest_up(
                &self.key,
                RingDirection::Clockwise,
                half,
            ) {
                state.leaf_set.push_to_right(key);
            }
        }
        if state.leaf_set.need_repair_left() {
            for key in self.transport.nearest_up(
                &self.key,
                RingDirection::CounterClockwise,
                half,
            ) {
                state.leaf_set.push_to_left(key);
            }
        }
    }

    fn alive(&self, key: &NodeKey) -> bool {
        self.transport
            .resolve(key)
            .map(|handle| self.transport.is_up(&handle))
            .unwrap_or(false)
    }

    fn deliver(&self, msg: Message) {
        let Payload::Result { value } = msg.payload else {
            return;
        };
        let delivery = Delivery {
            key: msg.key,
            value: Some(value),
            hops: msg.hops,
            timestamp: msg.timestamp,
            path: msg.trace,
        };
        match &*self.listener.lock().unwrap() {
            Some(listener) => listener.receive(delivery),
            None => tracing::debug!(
                node = %self.key.short(),
                "no listener registered, dropping delivery"
            ),
        }
    }
}

/// Pick the next hop for `target` from one node's tables.
///
/// `None` means the local node is the terminal: either the key is its own,
/// or no known node is numerically closer. The order is the classic one:
/// leaf set when the target falls inside the covered arc, then the routing
/// table cell for the first differing digit, then a fallback scan over
/// everything known for any node that is both prefix-no-worse and
/// numerically closer.
fn next_hop(
    table: &RoutingTable,
    leaf_set: &LeafSet,
    self_key: NodeKey,
    target: NodeKey,
    ring: &RingConfig,
) -> Option<NodeKey> {
    if target == self_key {
        return None;
    }
    if leaf_set.encompass(&target) {
        // shorter-arc metric here so neighbors across the ring seam are
        // still eligible
        let mut best = self_key;
        for key in leaf_set.list_all_nodes() {
            if key.ring_distance(&target) < best.ring_distance(&target) {
                best = key;
            }
        }
        return if best == self_key { None } else { Some(best) };
    }
    let row = self_key.prefix_len(&target, ring);
    if row >= ring.digits() {
        return None;
    }
    if let Some(key) = table.get(row, target.digit_at(row, ring)) {
        return Some(key);
    }
    let self_dist = self_key.distance(&target);
    let mut candidates = table
        .entries()
        .map(|(_, _, key)| key)
        .chain(leaf_set.list_all_nodes());
    candidates.find(|key| {
        key.distance(&target) < self_dist
            && key.prefix_len(&target, ring) >= row
    })
}

fn generate_join_key<R: rand::Rng>(
    transport: &dyn Transport,
    rng: &mut R,
    attempts: usize,
) -> PetalResult<NodeKey> {
    for _ in 0..attempts {
        let key = NodeKey::random(rng);
        if transport.resolve(&key).is_none() {
            return Ok(key);
        }
        tracing::warn!(
            key = %key.short(),
            "generated join key collides with a bound node, regenerating"
        );
    }
    Err(PetalError::other("could not generate an unused join key"))
}

fn lowest_latency_seed(
    transport: &dyn Transport,
    from: &NodeKey,
    sample: usize,
) -> Option<NodeKey> {
    transport
        .sample_up(sample, from)
        .into_iter()
        .min_by_key(|key| transport.latency(from, key))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mem_transport::*;

    fn ring() -> RingConfig {
        RingConfig::new(4, 8).unwrap()
    }

    // keyed by their first hex digit for readable prefix relationships
    fn key(first_digit: u128, rest: u128) -> NodeKey {
        NodeKey((first_digit << 124) | rest)
    }

    #[test]
    fn next_hop_prefers_the_routing_table_cell() {
        let ring = ring();
        let me = key(1, 0);
        let target = key(7, 99);
        let candidate = key(7, 5);
        let mut table = RoutingTable::new(&ring);
        table.set(0, 7, Some(candidate));
        let ls = LeafSet::new(me, &ring);
        assert_eq!(
            Some(candidate),
            next_hop(&table, &ls, me, target, &ring)
        );
    }

    #[test]
    fn next_hop_uses_the_leaf_set_inside_its_arc() {
        let ring = ring();
        let me = NodeKey(1000);
        let mut ls = LeafSet::new(me, &ring);
        ls.push(NodeKey(900));
        ls.push(NodeKey(1100));
        let table = RoutingTable::new(&ring);
        // 1080 is encompassed and 1100 is numerically closest to it
        assert_eq!(
            Some(NodeKey(1100)),
            next_hop(&table, &ls, me, NodeKey(1080), &ring)
        );
        // 1040 is encompassed but we are the closest ourselves
        assert_eq!(None, next_hop(&table, &ls, me, NodeKey(1040), &ring));
    }

    #[test]
    fn next_hop_falls_back_to_any_closer_prefix_match() {
        let ring = ring();
        let me = key(1, 0);
        let target = key(7, 99);
        let mut table = RoutingTable::new(&ring);
        // nothing in the (0, 7) cell, but a closer node elsewhere in row 0
        let candidate = key(6, 0);
        table.set(0, 6, Some(candidate));
        let ls = LeafSet::new(me, &ring);
        assert_eq!(
            Some(candidate),
            next_hop(&table, &ls, me, target, &ring)
        );
    }

    #[test]
    fn next_hop_terminates_with_no_better_candidate() {
        let ring = ring();
        let me = key(1, 0);
        let table = RoutingTable::new(&ring);
        let ls = LeafSet::new(me, &ring);
        assert_eq!(None, next_hop(&table, &ls, me, key(7, 99), &ring));
        assert_eq!(None, next_hop(&table, &ls, me, me, &ring));
    }

    #[test]
    fn join_key_generation_avoids_bound_keys() {
        let transport =
            MemTransport::create(MemTransportConfig::default());
        let mut rng = rand::rngs::mock::StepRng::new(5, 0);
        let expect = NodeKey((5u128 << 64) | 5);
        assert_eq!(
            expect,
            generate_join_key(transport.as_ref(), &mut rng, 3).unwrap()
        );
        transport.bind(expect).unwrap();
        // the rng only ever produces the bound key now
        let mut rng = rand::rngs::mock::StepRng::new(5, 0);
        assert!(generate_join_key(transport.as_ref(), &mut rng, 3).is_err());
    }

    #[test]
    fn config_defaults_and_serde() {
        let config = RouterConfig::default();
        assert_eq!(1000, config.cleaning_interval_ms);
        assert_eq!(10, config.join_sample);
        let enc = serde_json::to_string(&config).unwrap();
        assert!(enc.contains("cleaningIntervalMs"), "{enc}");
    }
}
