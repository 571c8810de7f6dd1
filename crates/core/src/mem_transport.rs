//! An in-process message fabric for driving overlay nodes in one runtime.
//!
//! Every bound key gets an unbounded inbox. Cross-node sends are delayed
//! by a deterministic pseudo-latency derived from the two keys, so timing
//! behavior is repeatable under tokio's paused test clock. Self-sends are
//! delivered inline.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use petal_api::transport::*;
use petal_api::*;

/// Configuration for [MemTransport].
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemTransportConfig {
    /// Lower bound of simulated one-way latency in milliseconds.
    pub latency_min_ms: u64,
    /// Upper bound of simulated one-way latency in milliseconds.
    pub latency_max_ms: u64,
}

impl Default for MemTransportConfig {
    fn default() -> Self {
        Self {
            latency_min_ms: 1,
            latency_max_ms: 30,
        }
    }
}

struct Peer {
    send: tokio::sync::mpsc::UnboundedSender<Message>,
    up: bool,
}

/// An in-memory [Transport] connecting every node bound to it.
pub struct MemTransport {
    config: MemTransportConfig,
    peers: Mutex<BTreeMap<NodeKey, Peer>>,
}

impl std::fmt::Debug for MemTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTransport")
            .field("config", &self.config)
            .finish()
    }
}

impl MemTransport {
    /// Construct a transport with the given latency profile.
    pub fn create(config: MemTransportConfig) -> DynTransport {
        Arc::new(Self {
            config,
            peers: Mutex::new(BTreeMap::new()),
        })
    }

    fn sorted_keys(&self) -> Vec<(NodeKey, bool)> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .map(|(k, p)| (*k, p.up))
            .collect()
    }
}

impl Transport for MemTransport {
    fn bind(&self, key: NodeKey) -> PetalResult<MessageRecv> {
        let mut peers = self.peers.lock().unwrap();
        if peers.contains_key(&key) {
            return Err(PetalError::other(format!(
                "key {key} is already bound"
            )));
        }
        let (send, recv) = tokio::sync::mpsc::unbounded_channel();
        peers.insert(key, Peer { send, up: true });
        Ok(recv)
    }

    fn send(
        &self,
        from: NodeKey,
        to: NodeKey,
        msg: Message,
    ) -> PetalResult<()> {
        let send = {
            let peers = self.peers.lock().unwrap();
            let peer = peers.get(&to).ok_or_else(|| {
                PetalError::other(format!("no node bound at {to}"))
            })?;
            if !peer.up {
                return Err(PetalError::other(format!("node {to} is down")));
            }
            peer.send.clone()
        };
        if from == to {
            return send
                .send(msg)
                .map_err(|_| PetalError::other("inbox closed"));
        }
        let delay = self.latency(&from, &to);
        tokio::task::spawn(async move {
            tokio::time::sleep(delay).await;
            // receiver may have shut down in the meantime
            let _ = send.send(msg);
        });
        Ok(())
    }

    fn resolve(&self, key: &NodeKey) -> Option<NodeHandle> {
        self.peers
            .lock()
            .unwrap()
            .get(key)
            .map(|_| NodeHandle { key: *key })
    }

    fn is_up(&self, handle: &NodeHandle) -> bool {
        self.peers
            .lock()
            .unwrap()
            .get(&handle.key)
            .map(|p| p.up)
            .unwrap_or(false)
    }

    fn set_up(&self, key: NodeKey, up: bool) {
        if let Some(peer) = self.peers.lock().unwrap().get_mut(&key) {
            peer.up = up;
        }
    }

    fn latency(&self, a: &NodeKey, b: &NodeKey) -> std::time::Duration {
        let x = a.0 ^ b.0;
        let folded = (x as u64) ^ ((x >> 64) as u64);
        let span = self
            .config
            .latency_max_ms
            .saturating_sub(self.config.latency_min_ms);
        let ms = self.config.latency_min_ms + folded % (span + 1);
        std::time::Duration::from_millis(ms)
    }

    fn sample_up(&self, count: usize, exclude: &NodeKey) -> Vec<NodeKey> {
        use rand::seq::SliceRandom;
        let mut keys: Vec<NodeKey> = self
            .sorted_keys()
            .into_iter()
            .filter(|(k, up)| *up && k != exclude)
            .map(|(k, _)| k)
            .collect();
        keys.shuffle(&mut rand::thread_rng());
        keys.truncate(count);
        keys
    }

    fn nearest_up(
        &self,
        from: &NodeKey,
        direction: RingDirection,
        count: usize,
    ) -> Vec<NodeKey> {
        let keys = self.sorted_keys();
        let n = keys.len();
        let mut out = Vec::with_capacity(count);
        if n == 0 {
            return out;
        }
        // first index at or after `from`, walk outward from there wrapping
        // around the end of the sorted key list
        let start = keys.partition_point(|(k, _)| k < from);
        for i in 0..n {
            let (key, up) = match direction {
                RingDirection::Clockwise => keys[(start + i) % n],
                RingDirection::CounterClockwise => {
                    keys[(start + n - 1 - i) % n]
                }
            };
            if key == *from {
                continue;
            }
            if up {
                out.push(key);
                if out.len() == count {
                    break;
                }
            }
        }
        out
    }
}
