//! Per-peer session records and the gateway's bounded node table.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::counter::{ReplayWindow, TxCounter};
use crate::error::Error;
use crate::frame::MessageType;
use crate::session::SessionKeys;
use crate::types::{Mac, PayloadEncoding};

/// Session state of a peer. The same set serves both roles; a node only ever
/// holds one record (its gateway) while the gateway holds one per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// No session. Initial state and the result of any invalidation.
    Unregistered,
    /// Node role: CLIENT_HELLO sent, waiting for the gateway's reply.
    InitPending,
    /// Gateway role: SERVER_HELLO sent, first data frame not yet seen.
    ServerHelloSent,
    /// Node role: SERVER_HELLO received, key derivation in progress.
    WaitingConfirmation,
    /// Handshake complete; data may flow.
    Registered,
    /// Session outlived `MAX_KEY_VALIDITY`; must re-handshake.
    KeyExpired,
    /// Registered and flagged as a deep-sleep peer.
    Sleepy,
}

impl NodeStatus {
    /// True when the peer holds a live session key.
    pub fn is_registered(&self) -> bool {
        matches!(self, NodeStatus::Registered | NodeStatus::Sleepy)
    }
}

/// A downstream message parked for a sleepy peer until its next wake.
#[derive(Debug, Clone)]
pub struct PendingDownstream {
    pub msg_type: MessageType,
    pub encoding: PayloadEncoding,
    pub payload: Vec<u8>,
    pub queued_at_ms: u64,
}

/// Everything the gateway tracks about one peer (and the node about its
/// gateway).
#[derive(Debug)]
pub struct NodeInfo {
    pub mac: Mac,
    pub node_id: u16,
    pub status: NodeStatus,
    /// Present only while registered. Zeroizes on drop and on invalidation.
    pub keys: Option<SessionKeys>,
    pub key_id: u8,
    /// Receive window for frames arriving from this peer.
    pub rx_window: ReplayWindow,
    /// Transmit counter for frames sent to this peer.
    pub tx_counter: TxCounter,
    /// Receive window for broadcast frames originated by this peer.
    pub broadcast_rx_window: ReplayWindow,
    pub last_activity_ms: u64,
    pub registered_at_ms: u64,
    pub node_name: Option<String>,
    pub sleepy: bool,
    pub rssi: i8,
    pub packets_ok: u32,
    pub packets_err: u32,
    pub broadcast_key_sent: bool,
    /// Downstream messages waiting for a sleepy peer's next wake.
    pub pending_downstream: VecDeque<PendingDownstream>,
}

impl NodeInfo {
    pub fn new(mac: Mac, node_id: u16) -> Self {
        Self {
            mac,
            node_id,
            status: NodeStatus::Unregistered,
            keys: None,
            key_id: 0,
            rx_window: ReplayWindow::default(),
            tx_counter: TxCounter::default(),
            broadcast_rx_window: ReplayWindow::default(),
            last_activity_ms: 0,
            registered_at_ms: 0,
            node_name: None,
            sleepy: false,
            rssi: 0,
            packets_ok: 0,
            packets_err: 0,
            broadcast_key_sent: false,
            pending_downstream: VecDeque::new(),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.status.is_registered()
    }

    /// Installs a freshly derived session: new epoch, counters reset, clock
    /// restarted. Idempotent over repeated handshakes; `key_id` strictly
    /// increments (mod 256) each time.
    pub fn install_session(&mut self, keys: SessionKeys, key_id: u8, now_ms: u64) {
        self.keys = Some(keys);
        self.key_id = key_id;
        self.rx_window.reset();
        self.tx_counter.reset();
        self.broadcast_rx_window.reset();
        self.last_activity_ms = now_ms;
        self.registered_at_ms = now_ms;
        self.broadcast_key_sent = false;
        self.status = if self.sleepy {
            NodeStatus::Sleepy
        } else {
            NodeStatus::Registered
        };
    }

    /// Tears the session down. Key material is zeroized by `SessionKeys`'
    /// drop; the record itself survives so the peer can re-register.
    pub fn invalidate(&mut self) {
        self.keys = None;
        self.status = NodeStatus::Unregistered;
        self.rx_window.reset();
        self.tx_counter.reset();
        self.broadcast_rx_window.reset();
        self.broadcast_key_sent = false;
        self.pending_downstream.clear();
    }

    /// Packet error rate over everything seen this registration.
    pub fn per(&self) -> f64 {
        let total = self.packets_ok + self.packets_err;
        if total == 0 {
            0.0
        } else {
            f64::from(self.packets_err) / f64::from(total)
        }
    }

    /// Accepted packets per hour since registration.
    pub fn packets_per_hour(&self, now_ms: u64) -> f64 {
        let elapsed_ms = now_ms.saturating_sub(self.registered_at_ms);
        if elapsed_ms == 0 {
            return 0.0;
        }
        f64::from(self.packets_ok) * 3_600_000.0 / elapsed_ms as f64
    }
}

/// Bounded associative store of peers, keyed by MAC. Owned exclusively by
/// the dispatcher; lookups are O(1) amortized and iteration order is
/// unspecified.
#[derive(Debug)]
pub struct NodeTable {
    nodes: HashMap<Mac, NodeInfo>,
    capacity: usize,
    next_node_id: u16,
}

impl NodeTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: HashMap::with_capacity(capacity),
            capacity,
            next_node_id: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find_by_mac(&self, mac: &Mac) -> Option<&NodeInfo> {
        self.nodes.get(mac)
    }

    pub fn find_by_mac_mut(&mut self, mac: &Mac) -> Option<&mut NodeInfo> {
        self.nodes.get_mut(mac)
    }

    /// Looks a registered peer up by its claimed name.
    pub fn find_by_name(&self, name: &str) -> Option<&NodeInfo> {
        self.nodes
            .values()
            .find(|n| n.is_registered() && n.node_name.as_deref() == Some(name))
    }

    /// True when a different registered peer already claims `name`.
    pub fn name_taken(&self, name: &str, claimant: &Mac) -> bool {
        self.nodes.values().any(|n| {
            n.mac != *claimant && n.is_registered() && n.node_name.as_deref() == Some(name)
        })
    }

    /// Returns the record for `mac`, creating it if the table has room. A
    /// MAC collision reuses the existing record (re-handshake replaces the
    /// prior session); capacity overflow fails the insert.
    pub fn insert(&mut self, mac: Mac) -> Result<&mut NodeInfo, Error> {
        if !self.nodes.contains_key(&mac) {
            if self.nodes.len() >= self.capacity {
                debug!(%mac, capacity = self.capacity, "node table full, rejecting insert");
                return Err(Error::TableFull);
            }
            let node_id = self.next_node_id;
            self.next_node_id = self.next_node_id.wrapping_add(1);
            self.nodes.insert(mac, NodeInfo::new(mac, node_id));
        }
        Ok(self.nodes.get_mut(&mac).expect("just inserted"))
    }

    pub fn remove(&mut self, mac: &Mac) -> Option<NodeInfo> {
        self.nodes.remove(mac)
    }

    /// Iterates peers holding a live session.
    pub fn iterate_active(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values().filter(|n| n.is_registered())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NodeInfo> {
        self.nodes.values_mut()
    }

    pub fn count_active(&self) -> usize {
        self.iterate_active().count()
    }

    /// MACs of peers idle longer than `idle_limit_ms`, regardless of status:
    /// expired and unregistered leftovers occupy table slots too.
    pub fn idle_peers(&self, now_ms: u64, idle_limit_ms: u64) -> Vec<Mac> {
        self.nodes
            .values()
            .filter(|n| now_ms.saturating_sub(n.last_activity_ms) > idle_limit_ms)
            .map(|n| n.mac)
            .collect()
    }
}
