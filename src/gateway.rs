//! Gateway runtime.
//!
//! Multiplexes the session state machine across a bounded node table, fed by
//! the single-producer receive ring. Everything here runs on the main loop;
//! the only structure shared with the radio callback context is the ring
//! behind the [`RxInjector`] handle.
//!
//! The dispatcher owns all session state. Frames from a peer are processed in
//! arrival order after dequeue; counter checks stay safe across overflow
//! reordering because they are monotonic.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::GatewayConfig;
use crate::counter::{CounterVerdict, TxCounter};
use crate::crypto;
use crate::error::{Error, FrameError};
use crate::frame::{
    self, EncryptedFrame, Frame, HelloBody, MessageType, MAX_DATA_PAYLOAD,
};
use crate::nodelist::{NodeInfo, NodeStatus, NodeTable, PendingDownstream};
use crate::radio::{Radio, RxInjector, RxRecord};
use crate::ring::SpscRing;
use crate::session::{self, SessionKeys};
use crate::time::{MonotonicClock, TimeSource};
use crate::types::{
    InvalidateReason, Mac, NameResult, PayloadEncoding, DOWNSTREAM_TTL_MS, EVICT_IDLE_FACTOR,
    KEY_LENGTH, MAX_KEY_VALIDITY_MS, MAX_NODES, MAX_NODE_NAME_LENGTH, OVERFLOW_CAPACITY,
    RX_QUEUE_CAPACITY,
};

/// Per-node cap on parked downstream messages for sleepy peers.
const MAX_PENDING_DOWNSTREAM: usize = 8;

/// Control-plane opcodes carried as the first plaintext byte of
/// CONTROL_DATA frames.
pub mod control_op {
    /// Node announces its sleep interval in seconds (4-byte LE payload).
    /// Zero clears the sleepy flag.
    pub const SLEEP_SET: u8 = 0x01;
    /// Node asks the gateway host to restart.
    pub const GATEWAY_RESTART: u8 = 0x02;
}

/// Which downstream channel a message rides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamKind {
    /// User command setting state on the node.
    Set,
    /// User query expecting the node to answer upstream.
    Get,
    /// Internal control message (OTA, settings and the like).
    Control,
}

impl DownstreamKind {
    fn unicast_type(self) -> MessageType {
        match self {
            DownstreamKind::Set => MessageType::DownstreamDataSet,
            DownstreamKind::Get => MessageType::DownstreamDataGet,
            DownstreamKind::Control => MessageType::DownstreamCtrlData,
        }
    }

    fn broadcast_type(self) -> MessageType {
        match self {
            DownstreamKind::Set => MessageType::DownstreamBroadcastDataSet,
            DownstreamKind::Get => MessageType::DownstreamBroadcastDataGet,
            DownstreamKind::Control => MessageType::DownstreamBroadcastCtrlData,
        }
    }
}

type DataRxHandler = Box<dyn FnMut(Mac, &[u8], u16, bool, PayloadEncoding, Option<&str>)>;
type NewNodeHandler = Box<dyn FnMut(Mac, u16, Option<&str>)>;
type DisconnectHandler = Box<dyn FnMut(Mac, InvalidateReason)>;
type HaDiscoveryHandler = Box<dyn FnMut(&str, &[u8])>;
type EventHandler = Box<dyn FnMut()>;

#[derive(Default)]
struct Callbacks {
    data_rx: Option<DataRxHandler>,
    new_node: Option<NewNodeHandler>,
    node_disconnected: Option<DisconnectHandler>,
    ha_discovery: Option<HaDiscoveryHandler>,
    restart_requested: Option<EventHandler>,
}

/// Coordinator for a network of sensor nodes.
pub struct Gateway<R: Radio, T: TimeSource = MonotonicClock> {
    radio: R,
    clock: T,
    local: Mac,
    config: GatewayConfig,
    use_counter: bool,
    nodes: NodeTable,
    rx_ring: Arc<Mutex<SpscRing<RxRecord>>>,
    broadcast_master: [u8; KEY_LENGTH],
    broadcast_epoch: u8,
    broadcast_keys: SessionKeys,
    broadcast_tx_counter: TxCounter,
    callbacks: Callbacks,
}

impl<R: Radio> Gateway<R, MonotonicClock> {
    /// Creates a gateway with the default monotonic clock.
    pub fn new(radio: R, config: GatewayConfig) -> Result<Self, Error> {
        Self::with_clock(radio, config, MonotonicClock::new())
    }
}

impl<R: Radio, T: TimeSource> Gateway<R, T> {
    /// Creates a gateway with an explicit time source.
    pub fn with_clock(radio: R, config: GatewayConfig, clock: T) -> Result<Self, Error> {
        let mut broadcast_master = [0u8; KEY_LENGTH];
        crypto::random_bytes(&mut broadcast_master);
        let broadcast_epoch = 1;
        let broadcast_keys =
            session::broadcast_session(session::derive_broadcast(&broadcast_master, broadcast_epoch)?)?;
        let local = radio.local_addr();
        Ok(Self {
            radio,
            clock,
            local,
            config,
            use_counter: true,
            nodes: NodeTable::new(MAX_NODES),
            rx_ring: Arc::new(Mutex::new(SpscRing::new(
                RX_QUEUE_CAPACITY,
                OVERFLOW_CAPACITY,
            ))),
            broadcast_master,
            broadcast_epoch,
            broadcast_keys,
            broadcast_tx_counter: TxCounter::default(),
            callbacks: Callbacks::default(),
        })
    }

    /// Producer handle for the radio receive callback.
    pub fn injector(&self) -> RxInjector {
        RxInjector::new(Arc::clone(&self.rx_ring))
    }

    /// Disables counter checking. Replay protection then degrades to nonce
    /// uniqueness within a session.
    pub fn set_use_counter(&mut self, enabled: bool) {
        self.use_counter = enabled;
    }

    pub fn local_addr(&self) -> Mac {
        self.local
    }

    pub fn network_name(&self) -> &str {
        &self.config.network_name
    }

    /// Registers the handler for data delivered by nodes.
    pub fn on_data_rx(
        &mut self,
        handler: impl FnMut(Mac, &[u8], u16, bool, PayloadEncoding, Option<&str>) + 'static,
    ) {
        self.callbacks.data_rx = Some(Box::new(handler));
    }

    /// Registers the handler called when a node completes a handshake.
    pub fn on_new_node(&mut self, handler: impl FnMut(Mac, u16, Option<&str>) + 'static) {
        self.callbacks.new_node = Some(Box::new(handler));
    }

    /// Registers the handler called when a node's session is invalidated.
    pub fn on_node_disconnected(
        &mut self,
        handler: impl FnMut(Mac, InvalidateReason) + 'static,
    ) {
        self.callbacks.node_disconnected = Some(Box::new(handler));
    }

    /// Registers the handler for forwarded Home Assistant discovery payloads.
    pub fn on_ha_discovery(&mut self, handler: impl FnMut(&str, &[u8]) + 'static) {
        self.callbacks.ha_discovery = Some(Box::new(handler));
    }

    /// Registers the handler for a node-initiated gateway restart request.
    pub fn on_gateway_restart_requested(&mut self, handler: impl FnMut() + 'static) {
        self.callbacks.restart_requested = Some(Box::new(handler));
    }

    pub fn active_nodes(&self) -> usize {
        self.nodes.count_active()
    }

    pub fn node_table(&self) -> &NodeTable {
        &self.nodes
    }

    /// Packet error rate of a peer, if known.
    pub fn per(&self, mac: &Mac) -> Option<f64> {
        self.nodes.find_by_mac(mac).map(NodeInfo::per)
    }

    /// Total packets seen from a peer this registration.
    pub fn total_packets(&self, mac: &Mac) -> Option<u32> {
        self.nodes
            .find_by_mac(mac)
            .map(|n| n.packets_ok + n.packets_err)
    }

    /// Errored packets seen from a peer this registration.
    pub fn error_packets(&self, mac: &Mac) -> Option<u32> {
        self.nodes.find_by_mac(mac).map(|n| n.packets_err)
    }

    /// Accepted packets per hour for a peer.
    pub fn packets_per_hour(&self, mac: &Mac) -> Option<f64> {
        let now = self.clock.now_ms();
        self.nodes
            .find_by_mac(mac)
            .map(|n| n.packets_per_hour(now))
    }

    /// Main-loop step: drains the receive ring, then runs session expiry,
    /// idle eviction and downstream TTL maintenance. Returns the number of
    /// frames processed.
    pub fn handle(&mut self) -> usize {
        let mut processed = 0;
        loop {
            let record = self.rx_ring.lock().pop();
            let Some(record) = record else { break };
            processed += 1;
            self.process_frame(record.src, record.bytes());
        }
        self.run_maintenance();
        processed
    }

    fn run_maintenance(&mut self) {
        let now = self.clock.now_ms();

        // Sessions past their validity window lose their keys; the peer gets
        // told when it next shows up (or re-handshakes on its own).
        let mut expired = Vec::new();
        for node in self.nodes.iter_mut() {
            if node.is_registered()
                && now.saturating_sub(node.last_activity_ms) > MAX_KEY_VALIDITY_MS
            {
                node.status = NodeStatus::KeyExpired;
                node.keys = None;
                expired.push(node.mac);
            }
            // Parked downstream messages do not outlive their TTL.
            node.pending_downstream
                .retain(|p| now.saturating_sub(p.queued_at_ms) <= DOWNSTREAM_TTL_MS);
        }
        for mac in expired {
            debug!(%mac, "session key expired");
        }

        // Idle eviction frees table slots for good.
        for mac in self
            .nodes
            .idle_peers(now, EVICT_IDLE_FACTOR * MAX_KEY_VALIDITY_MS)
        {
            debug!(%mac, "evicting idle peer");
            self.nodes.remove(&mac);
        }
    }

    fn process_frame(&mut self, src: Mac, bytes: &[u8]) {
        let frame = match frame::decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                // Malformed frames are dropped without a reply.
                trace!(%src, %err, "dropping undecodable frame");
                return;
            }
        };
        match frame {
            Frame::ClientHello(body) => self.handle_client_hello(src, body),
            Frame::Encrypted(ef) => self.handle_encrypted(src, ef),
            Frame::UnencryptedData { counter, payload } => {
                self.handle_unencrypted(src, counter, &payload)
            }
            Frame::ServerHello(_) | Frame::InvalidateKey { .. } => {
                trace!(%src, "ignoring downstream-only frame at gateway");
            }
        }
    }

    fn handle_client_hello(&mut self, src: Mac, body: HelloBody) {
        if !session::verify_hello(&self.config.network_key, MessageType::ClientHello, &body) {
            debug!(%src, "CLIENT_HELLO failed network-key authentication");
            self.send_invalidate(src, InvalidateReason::WrongClientHello);
            return;
        }

        let now = self.clock.now_ms();
        let (gw_secret, gw_public) = crypto::generate_keypair();
        let gw_iv = crypto::random_iv();
        let shared = crypto::shared_secret(gw_secret, &body.public_key);
        let keys = match session::derive_session(&shared, &body.iv, &gw_iv) {
            Ok(keys) => keys,
            Err(err) => {
                warn!(%src, %err, "session key derivation failed");
                return;
            }
        };

        let (node_id, name, rekey) = match self.nodes.insert(src) {
            Ok(node) => {
                let rekey = node.is_registered();
                let key_id = session::next_key_id(node.key_id);
                node.install_session(keys, key_id, now);
                (node.node_id, node.node_name.clone(), rekey)
            }
            Err(_) => {
                warn!(%src, "node table full, rejecting handshake");
                self.send_invalidate(src, InvalidateReason::UnknownError);
                return;
            }
        };

        let reply = session::build_hello(
            &self.config.network_key,
            MessageType::ServerHello,
            *gw_public.as_bytes(),
            gw_iv,
        );
        if !self
            .radio
            .send(src, &frame::encode_hello(MessageType::ServerHello, &reply))
        {
            warn!(%src, "SERVER_HELLO send failed");
        }
        debug!(%src, node_id, rekey, "node registered");

        // The broadcast key rides on the fresh session right away.
        if let Err(err) = self.push_broadcast_key(src) {
            debug!(%src, %err, "broadcast key delivery failed");
        }

        if !rekey {
            if let Some(handler) = self.callbacks.new_node.as_mut() {
                handler(src, node_id, name.as_deref());
            }
        }
    }

    fn handle_unencrypted(&mut self, src: Mac, counter: u16, payload: &[u8]) {
        let now = self.clock.now_ms();
        let Some(node) = self.nodes.find_by_mac_mut(&src) else {
            self.send_invalidate(src, InvalidateReason::UnregisteredNode);
            return;
        };
        if !node.is_registered() {
            self.handle_unregistered_or_expired(src);
            return;
        }
        let lost = if self.use_counter {
            match node.rx_window.check(counter) {
                CounterVerdict::Accept { lost } => lost,
                CounterVerdict::Reject => {
                    node.packets_err += 1;
                    let invalidate = node.rx_window.should_invalidate();
                    trace!(%src, counter, "unencrypted counter reject");
                    if invalidate {
                        self.invalidate_session(src, InvalidateReason::WrongData);
                    }
                    return;
                }
            }
        } else {
            0
        };
        node.packets_ok += 1;
        node.last_activity_ms = now;
        let name = node.node_name.clone();
        let encoding = PayloadEncoding::try_from(payload[0]).unwrap_or(PayloadEncoding::Raw);
        let data = payload[1..].to_vec();
        self.flush_pending_downstream(src);
        if let Some(handler) = self.callbacks.data_rx.as_mut() {
            handler(src, &data, lost, false, encoding, name.as_deref());
        }
    }

    fn handle_encrypted(&mut self, src: Mac, ef: EncryptedFrame) {
        if ef.msg_type.is_downstream() {
            trace!(%src, msg_type = ?ef.msg_type, "ignoring downstream frame at gateway");
            return;
        }
        let now = self.clock.now_ms();

        let Some(node) = self.nodes.find_by_mac(&src) else {
            debug!(%src, "data from unknown peer");
            self.send_invalidate(src, InvalidateReason::UnregisteredNode);
            return;
        };
        if !node.is_registered() {
            self.handle_unregistered_or_expired(src);
            return;
        }
        if now.saturating_sub(node.last_activity_ms) > MAX_KEY_VALIDITY_MS {
            debug!(%src, "frame from expired session");
            self.invalidate_session(src, InvalidateReason::KeyExpired);
            return;
        }

        let (plaintext, lost) = match self.accept_upstream(src, &ef, now) {
            Ok(accepted) => accepted,
            Err(err @ Error::StaleKeyId { .. }) => {
                // Mid-flight frames from a previous epoch are dropped
                // silently; this tolerates crossed handshakes without
                // oscillation.
                trace!(%src, %err, "dropping frame");
                return;
            }
            Err(Error::ReplayReject) => {
                trace!(%src, counter = ef.counter, "replay reject");
                let invalidate = self
                    .nodes
                    .find_by_mac(&src)
                    .map(|n| {
                        if ef.msg_type.is_broadcast() {
                            n.broadcast_rx_window.should_invalidate()
                        } else {
                            n.rx_window.should_invalidate()
                        }
                    })
                    .unwrap_or(false);
                if invalidate {
                    self.invalidate_session(src, InvalidateReason::WrongData);
                }
                return;
            }
            Err(Error::Crypto(_)) => {
                debug!(%src, msg_type = ?ef.msg_type, "decrypt failure, invalidating session");
                self.invalidate_session(src, InvalidateReason::WrongData);
                return;
            }
            Err(err) => {
                debug!(%src, %err, "upstream frame not accepted");
                return;
            }
        };

        self.flush_pending_downstream(src);
        self.dispatch_plaintext(src, ef.msg_type, &plaintext, lost);
    }

    /// Validates an upstream encrypted frame against the peer's session:
    /// key epoch, AEAD opening, replay window. On success the peer's stats
    /// and activity clock advance and the plaintext plus lost-frame count
    /// are returned; the error says exactly why the frame was refused.
    fn accept_upstream(
        &mut self,
        src: Mac,
        ef: &EncryptedFrame,
        now: u64,
    ) -> Result<(Vec<u8>, u16), Error> {
        let node = self
            .nodes
            .find_by_mac(&src)
            .ok_or(Error::UnknownPeer(src))?;
        let expected_epoch = if ef.msg_type.is_broadcast() {
            self.broadcast_epoch
        } else {
            node.key_id
        };
        if ef.key_id != expected_epoch {
            return Err(Error::StaleKeyId {
                got: ef.key_id,
                current: expected_epoch,
            });
        }

        let keys = if ef.msg_type.is_broadcast() {
            self.broadcast_keys.clone()
        } else {
            node.keys.clone().ok_or(Error::NotRegistered)?
        };
        let dst = if ef.msg_type.is_broadcast() {
            Mac::BROADCAST
        } else {
            self.local
        };

        let plaintext = match session::open_frame(&keys, ef, &src, &dst) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                if let Some(node) = self.nodes.find_by_mac_mut(&src) {
                    node.packets_err += 1;
                }
                return Err(Error::Crypto(err));
            }
        };

        let node = self
            .nodes
            .find_by_mac_mut(&src)
            .expect("looked up above; dispatcher is the only mutator");
        let lost = if self.use_counter {
            let window = if ef.msg_type.is_broadcast() {
                &mut node.broadcast_rx_window
            } else {
                &mut node.rx_window
            };
            match window.check(ef.counter) {
                CounterVerdict::Accept { lost } => lost,
                CounterVerdict::Reject => {
                    node.packets_err += 1;
                    return Err(Error::ReplayReject);
                }
            }
        } else {
            0
        };
        node.packets_ok += 1;
        node.last_activity_ms = now;
        Ok((plaintext, lost))
    }

    /// Routes the decrypted payload of an accepted upstream frame.
    fn dispatch_plaintext(
        &mut self,
        src: Mac,
        msg_type: MessageType,
        plaintext: &[u8],
        lost: u16,
    ) {
        match msg_type {
            MessageType::SensorData | MessageType::SensorBroadcastData => {
                self.deliver_data(src, plaintext, lost, false)
            }
            MessageType::ControlData => {
                self.handle_control(src, plaintext);
                self.deliver_data(src, plaintext, lost, true);
            }
            MessageType::ClockRequest => self.handle_clock_request(src, plaintext),
            MessageType::NodeNameSet => self.handle_node_name_set(src, plaintext),
            MessageType::HaDiscovery => self.handle_ha_discovery(src, plaintext),
            MessageType::BroadcastKeyRequest => {
                if let Err(err) = self.push_broadcast_key(src) {
                    debug!(%src, %err, "broadcast key send failed");
                }
            }
            other => {
                trace!(%src, ?other, "unexpected upstream frame type");
            }
        }
    }

    fn deliver_data(&mut self, src: Mac, plaintext: &[u8], lost: u16, control: bool) {
        if plaintext.is_empty() {
            trace!(%src, "empty data payload");
            return;
        }
        let encoding = PayloadEncoding::try_from(plaintext[0]).unwrap_or(PayloadEncoding::Raw);
        let name = self
            .nodes
            .find_by_mac(&src)
            .and_then(|n| n.node_name.clone());
        if let Some(handler) = self.callbacks.data_rx.as_mut() {
            handler(src, &plaintext[1..], lost, control, encoding, name.as_deref());
        }
    }

    fn handle_control(&mut self, src: Mac, plaintext: &[u8]) {
        // plaintext[0] is the payload encoding, plaintext[1] the opcode.
        let Some(&op) = plaintext.get(1) else { return };
        match op {
            control_op::SLEEP_SET => {
                let seconds = plaintext
                    .get(2..6)
                    .and_then(|b| b.try_into().ok())
                    .map(u32::from_le_bytes)
                    .unwrap_or(0);
                if let Some(node) = self.nodes.find_by_mac_mut(&src) {
                    node.sleepy = seconds > 0;
                    if node.is_registered() {
                        node.status = if node.sleepy {
                            NodeStatus::Sleepy
                        } else {
                            NodeStatus::Registered
                        };
                    }
                    debug!(%src, seconds, sleepy = node.sleepy, "sleep setting updated");
                }
            }
            control_op::GATEWAY_RESTART => {
                debug!(%src, "gateway restart requested");
                if let Some(handler) = self.callbacks.restart_requested.as_mut() {
                    handler();
                }
            }
            other => trace!(%src, opcode = other, "unhandled control opcode"),
        }
    }

    fn handle_clock_request(&mut self, src: Mac, plaintext: &[u8]) {
        let Some(t1) = crate::timesync::decode_request(plaintext) else {
            trace!(%src, "malformed clock request");
            return;
        };
        let t2 = self.clock.now_us();
        let t3 = self.clock.now_us();
        let payload = crate::timesync::encode_response(t1, t2, t3);
        if let Err(err) = self.send_session_frame(src, MessageType::ClockResponse, &payload) {
            debug!(%src, %err, "clock response send failed");
        }
    }

    fn handle_node_name_set(&mut self, src: Mac, plaintext: &[u8]) {
        let code = match self.try_set_node_name(&src, plaintext) {
            Ok(()) => NameResult::Ok,
            Err(Error::NameTaken) => NameResult::AlreadyUsed,
            Err(Error::NameTooLong) => NameResult::TooLong,
            Err(Error::EmptyName) => NameResult::Empty,
            Err(err) => {
                debug!(%src, %err, "name set failed");
                NameResult::MessageError
            }
        };
        debug!(%src, ?code, "node name set");
        let reply = [code as i8 as u8];
        if let Err(err) = self.send_session_frame(src, MessageType::NodeNameResult, &reply) {
            debug!(%src, %err, "name result send failed");
        }
    }

    fn try_set_node_name(&mut self, src: &Mac, raw: &[u8]) -> Result<(), Error> {
        if raw.is_empty() {
            return Err(Error::EmptyName);
        }
        if raw.len() > MAX_NODE_NAME_LENGTH {
            return Err(Error::NameTooLong);
        }
        let name = std::str::from_utf8(raw).map_err(|_| {
            Error::Frame(FrameError::BadField {
                field: "name",
                len: raw.len(),
            })
        })?;
        if self.nodes.name_taken(name, src) {
            return Err(Error::NameTaken);
        }
        let node = self
            .nodes
            .find_by_mac_mut(src)
            .ok_or(Error::UnknownPeer(*src))?;
        node.node_name = Some(name.to_owned());
        Ok(())
    }

    fn handle_ha_discovery(&mut self, src: Mac, plaintext: &[u8]) {
        if plaintext.is_empty() {
            return;
        }
        let node_label = self
            .nodes
            .find_by_mac(&src)
            .and_then(|n| n.node_name.clone())
            .unwrap_or_else(|| src.to_string());
        let topic = format!("{}/{}/ha", self.config.network_name, node_label);
        // Skip the encoding byte; the payload itself is opaque MsgPack.
        if let Some(handler) = self.callbacks.ha_discovery.as_mut() {
            handler(&topic, &plaintext[1..]);
        }
    }

    /// Sends (or parks, for sleepy peers) the current broadcast key.
    fn push_broadcast_key(&mut self, mac: Mac) -> Result<(), Error> {
        let mut payload = [0u8; 1 + KEY_LENGTH];
        payload[0] = self.broadcast_epoch;
        payload[1..].copy_from_slice(self.broadcast_keys.key.as_bytes());
        self.send_session_frame(mac, MessageType::BroadcastKeyResponse, &payload)?;
        if let Some(node) = self.nodes.find_by_mac_mut(&mac) {
            node.broadcast_key_sent = true;
        }
        Ok(())
    }

    /// Seals and transmits a session-keyed downstream frame to a registered
    /// peer, advancing its downstream counter.
    fn send_session_frame(
        &mut self,
        mac: Mac,
        msg_type: MessageType,
        plaintext: &[u8],
    ) -> Result<(), Error> {
        let node = self
            .nodes
            .find_by_mac_mut(&mac)
            .ok_or(Error::UnknownPeer(mac))?;
        let keys = node.keys.clone().ok_or(Error::NotRegistered)?;
        let key_id = node.key_id;
        let counter = node.tx_counter.advance();
        let ef = session::seal_frame(&keys, msg_type, key_id, counter, &self.local, &mac, plaintext)?;
        let bytes = frame::encode_encrypted(&ef)?;
        if self.radio.send(mac, &bytes) {
            Ok(())
        } else {
            Err(Error::SendFailed)
        }
    }

    /// Starts a downstream data transmission to a node addressed by MAC.
    /// Sleepy peers get the message parked until their next upstream frame.
    pub fn send_downstream(
        &mut self,
        mac: Mac,
        payload: &[u8],
        kind: DownstreamKind,
        encoding: PayloadEncoding,
    ) -> Result<(), Error> {
        if payload.len() + 1 > MAX_DATA_PAYLOAD {
            return Err(Error::Frame(FrameError::PayloadTooLarge {
                len: payload.len(),
            }));
        }
        let now = self.clock.now_ms();
        let node = self
            .nodes
            .find_by_mac_mut(&mac)
            .ok_or(Error::UnknownPeer(mac))?;
        if node.status == NodeStatus::KeyExpired {
            return Err(Error::KeyExpired(mac));
        }
        if !node.is_registered() {
            return Err(Error::NotRegistered);
        }
        if node.sleepy {
            if node.pending_downstream.len() >= MAX_PENDING_DOWNSTREAM {
                node.pending_downstream.pop_front();
                debug!(%mac, "pending downstream queue full, oldest dropped");
            }
            node.pending_downstream.push_back(PendingDownstream {
                msg_type: kind.unicast_type(),
                encoding,
                payload: payload.to_vec(),
                queued_at_ms: now,
            });
            return Ok(());
        }
        let mut plaintext = Vec::with_capacity(1 + payload.len());
        plaintext.push(encoding as u8);
        plaintext.extend_from_slice(payload);
        self.send_session_frame(mac, kind.unicast_type(), &plaintext)
    }

    /// Starts a downstream transmission addressed by registered node name.
    pub fn send_downstream_by_name(
        &mut self,
        name: &str,
        payload: &[u8],
        kind: DownstreamKind,
        encoding: PayloadEncoding,
    ) -> Result<(), Error> {
        let mac = self
            .nodes
            .find_by_name(name)
            .map(|n| n.mac)
            .ok_or_else(|| Error::NameUnknown(name.to_owned()))?;
        self.send_downstream(mac, payload, kind, encoding)
    }

    /// Sends a broadcast-keyed downstream frame to every listening node.
    pub fn send_broadcast(
        &mut self,
        payload: &[u8],
        kind: DownstreamKind,
        encoding: PayloadEncoding,
    ) -> Result<(), Error> {
        let mut plaintext = Vec::with_capacity(1 + payload.len());
        plaintext.push(encoding as u8);
        plaintext.extend_from_slice(payload);
        let counter = self.broadcast_tx_counter.advance();
        let ef = session::seal_frame(
            &self.broadcast_keys,
            kind.broadcast_type(),
            self.broadcast_epoch,
            counter,
            &self.local,
            &Mac::BROADCAST,
            &plaintext,
        )?;
        let bytes = frame::encode_encrypted(&ef)?;
        if self.radio.send(Mac::BROADCAST, &bytes) {
            Ok(())
        } else {
            Err(Error::SendFailed)
        }
    }

    /// Rotates the broadcast key to a new epoch and redistributes it to all
    /// registered peers.
    pub fn rotate_broadcast_key(&mut self) -> Result<(), Error> {
        self.broadcast_epoch = self.broadcast_epoch.wrapping_add(1);
        self.broadcast_keys = session::broadcast_session(session::derive_broadcast(
            &self.broadcast_master,
            self.broadcast_epoch,
        )?)?;
        self.broadcast_tx_counter.reset();
        let peers: Vec<Mac> = self.nodes.iterate_active().map(|n| n.mac).collect();
        for node in self.nodes.iter_mut() {
            node.broadcast_key_sent = false;
            node.broadcast_rx_window.reset();
        }
        for mac in peers {
            if let Err(err) = self.push_broadcast_key(mac) {
                debug!(%mac, %err, "broadcast key redistribution failed");
            }
        }
        Ok(())
    }

    /// Administratively disconnects a peer.
    pub fn kick(&mut self, mac: Mac) -> Result<(), Error> {
        if self.nodes.find_by_mac(&mac).is_none() {
            return Err(Error::UnknownPeer(mac));
        }
        self.invalidate_session(mac, InvalidateReason::Kicked);
        Ok(())
    }

    fn handle_unregistered_or_expired(&mut self, src: Mac) {
        let expired = self
            .nodes
            .find_by_mac(&src)
            .map(|n| n.status == NodeStatus::KeyExpired)
            .unwrap_or(false);
        if expired {
            self.invalidate_session(src, InvalidateReason::KeyExpired);
        } else {
            self.send_invalidate(src, InvalidateReason::UnregisteredNode);
        }
    }

    /// Tears down a session: INVALIDATE_KEY on the wire, key material
    /// zeroized, disconnect callback fired.
    fn invalidate_session(&mut self, mac: Mac, reason: InvalidateReason) {
        self.send_invalidate(mac, reason);
        if let Some(node) = self.nodes.find_by_mac_mut(&mac) {
            node.invalidate();
        }
        if let Some(handler) = self.callbacks.node_disconnected.as_mut() {
            handler(mac, reason);
        }
    }

    fn send_invalidate(&mut self, mac: Mac, reason: InvalidateReason) {
        let hmac = session::invalidate_mac(&self.config.network_key, reason);
        let bytes = frame::encode_invalidate(reason, &hmac);
        if !self.radio.send(mac, &bytes) {
            debug!(%mac, ?reason, "invalidate send failed");
        }
    }

    /// Delivers messages parked while a sleepy peer slept. Called right after
    /// any accepted upstream frame, i.e. while the peer is known awake.
    fn flush_pending_downstream(&mut self, mac: Mac) {
        let now = self.clock.now_ms();
        let pending: Vec<PendingDownstream> = match self.nodes.find_by_mac_mut(&mac) {
            Some(node) if !node.pending_downstream.is_empty() => {
                node.pending_downstream.drain(..).collect()
            }
            _ => return,
        };
        for item in pending {
            if now.saturating_sub(item.queued_at_ms) > DOWNSTREAM_TTL_MS {
                trace!(%mac, "dropping expired pending downstream");
                continue;
            }
            let mut plaintext = Vec::with_capacity(1 + item.payload.len());
            plaintext.push(item.encoding as u8);
            plaintext.extend_from_slice(&item.payload);
            if let Err(err) = self.send_session_frame(mac, item.msg_type, &plaintext) {
                debug!(%mac, %err, "pending downstream send failed");
            }
        }
    }
}
