//! Node runtime.
//!
//! A node holds exactly one session, with its gateway. The same cooperative
//! model as the gateway applies: the radio callback captures frames into a
//! small ring via [`RxInjector`]; [`NodeRuntime::handle`] drains it, runs the
//! handshake state machine, paces queued Home Assistant discovery calls and
//! gives the attached [`Controller`] its loop slice.
//!
//! Registration epoch: the SERVER_HELLO does not carry the key epoch, so the
//! node derives the session key, parks in `WaitingConfirmation`, and adopts
//! the epoch from the first downstream frame that decrypts under the fresh
//! key (normally the broadcast-key push the gateway issues on registration).

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::NodeConfig;
use crate::counter::{CounterVerdict, ReplayWindow, TxCounter};
use crate::crypto::{self, EphemeralSecret};
use crate::error::{Error, FrameError};
use crate::frame::{self, EncryptedFrame, Frame, HelloBody, MessageType, MAX_DATA_PAYLOAD};
use crate::gateway::control_op;
use crate::nodelist::NodeStatus;
use crate::radio::{Radio, RxInjector, RxRecord};
use crate::ring::SpscRing;
use crate::session::{self, SessionKeys};
use crate::time::{MonotonicClock, TimeSource};
use crate::timesync::{self, ClockSync};
use crate::types::{
    InvalidateReason, Mac, NameResult, PayloadEncoding, HANDSHAKE_TIMEOUT_MS,
    HA_FIRST_DISCOVERY_DELAY_MS, HA_NEXT_DISCOVERY_DELAY_MS, IV_LENGTH, KEY_LENGTH,
    MAX_KEY_VALIDITY_MS, MAX_NODE_NAME_LENGTH, OVERFLOW_CAPACITY,
};

/// Node-side receive ring depth. One gateway peer needs far less than the
/// gateway's multiplexed queue.
const NODE_RX_QUEUE_CAPACITY: usize = 8;

/// Application module plugged into the node runtime.
///
/// Replaces subclass-style extension with plain trait dispatch: the runtime
/// calls `on_setup` once at attach, `on_loop` every handle pass, and `on_rx`
/// for each downstream command.
pub trait Controller {
    fn on_setup(&mut self, link: &mut dyn ControllerLink);

    fn on_loop(&mut self, link: &mut dyn ControllerLink);

    /// Handles a downstream command. Return `false` to signal the command
    /// was not understood.
    fn on_rx(
        &mut self,
        link: &mut dyn ControllerLink,
        msg_type: MessageType,
        encoding: PayloadEncoding,
        payload: &[u8],
    ) -> bool;
}

/// Capabilities the runtime lends to its controller.
pub trait ControllerLink {
    /// Sends sensor data upstream. `false` when unregistered or refused by
    /// the radio.
    fn send_data(&mut self, payload: &[u8], encoding: PayloadEncoding) -> bool;

    /// Queues a Home Assistant discovery payload for paced delivery.
    fn queue_ha_discovery(&mut self, payload: Vec<u8>);

    fn is_registered(&self) -> bool;

    fn is_sleepy(&self) -> bool;
}

/// Paced queue of Home Assistant discovery payloads.
///
/// The first item waits `HA_FIRST_DISCOVERY_DELAY` after registration, the
/// rest go out every `HA_NEXT_DISCOVERY_DELAY`; both stretch by 2x for
/// sleepy nodes so the radio window is not saturated right after wake.
#[derive(Debug, Default)]
struct DiscoveryCallQueue {
    queue: VecDeque<Vec<u8>>,
    next_due_ms: Option<u64>,
}

impl DiscoveryCallQueue {
    fn schedule_first(&mut self, now_ms: u64, sleepy: bool) {
        let factor = if sleepy { 2 } else { 1 };
        self.next_due_ms = Some(now_ms + HA_FIRST_DISCOVERY_DELAY_MS * factor);
    }

    fn push(&mut self, payload: Vec<u8>) {
        self.queue.push_back(payload);
    }

    fn pop_due(&mut self, now_ms: u64, sleepy: bool) -> Option<Vec<u8>> {
        let due = self.next_due_ms?;
        if now_ms < due || self.queue.is_empty() {
            return None;
        }
        let factor = if sleepy { 2 } else { 1 };
        self.next_due_ms = Some(now_ms + HA_NEXT_DISCOVERY_DELAY_MS * factor);
        self.queue.pop_front()
    }
}

type DownstreamHandler = Box<dyn FnMut(MessageType, PayloadEncoding, &[u8])>;
type ConnectedHandler = Box<dyn FnMut()>;
type DisconnectedHandler = Box<dyn FnMut(InvalidateReason)>;
type NameResultHandler = Box<dyn FnMut(NameResult)>;
type TimeSyncHandler = Box<dyn FnMut(ClockSync)>;

#[derive(Default)]
struct Callbacks {
    data_rx: Option<DownstreamHandler>,
    connected: Option<ConnectedHandler>,
    disconnected: Option<DisconnectedHandler>,
    name_result: Option<NameResultHandler>,
    time_sync: Option<TimeSyncHandler>,
}

/// Sensor endpoint holding one session to its gateway.
pub struct NodeRuntime<R: Radio, T: TimeSource = MonotonicClock> {
    radio: R,
    clock: T,
    local: Mac,
    config: NodeConfig,
    status: NodeStatus,
    keys: Option<SessionKeys>,
    key_id: u8,
    dh_secret: Option<EphemeralSecret>,
    client_iv: [u8; IV_LENGTH],
    handshake_started_ms: u64,
    registered_at_ms: u64,
    up_counter: TxCounter,
    down_window: ReplayWindow,
    broadcast_keys: Option<SessionKeys>,
    broadcast_epoch: u8,
    broadcast_rx_window: ReplayWindow,
    broadcast_tx_counter: TxCounter,
    sleepy: bool,
    sleep_seconds: u32,
    pending_name: Option<String>,
    pending_t1: Option<u64>,
    last_sync: Option<ClockSync>,
    rx_ring: Arc<Mutex<SpscRing<RxRecord>>>,
    controller: Option<Box<dyn Controller>>,
    ha_queue: DiscoveryCallQueue,
    callbacks: Callbacks,
    auto_reregister: bool,
}

impl<R: Radio> NodeRuntime<R, MonotonicClock> {
    /// Creates a node runtime with the default monotonic clock.
    pub fn new(radio: R, config: NodeConfig) -> Self {
        Self::with_clock(radio, config, MonotonicClock::new())
    }
}

impl<R: Radio, T: TimeSource> NodeRuntime<R, T> {
    /// Creates a node runtime with an explicit time source.
    pub fn with_clock(radio: R, config: NodeConfig, clock: T) -> Self {
        let local = radio.local_addr();
        Self {
            radio,
            clock,
            local,
            config,
            status: NodeStatus::Unregistered,
            keys: None,
            key_id: 0,
            dh_secret: None,
            client_iv: [0u8; IV_LENGTH],
            handshake_started_ms: 0,
            registered_at_ms: 0,
            up_counter: TxCounter::default(),
            down_window: ReplayWindow::default(),
            broadcast_keys: None,
            broadcast_epoch: 0,
            broadcast_rx_window: ReplayWindow::default(),
            broadcast_tx_counter: TxCounter::default(),
            sleepy: false,
            sleep_seconds: 0,
            pending_name: None,
            pending_t1: None,
            last_sync: None,
            rx_ring: Arc::new(Mutex::new(SpscRing::new(
                NODE_RX_QUEUE_CAPACITY,
                OVERFLOW_CAPACITY,
            ))),
            controller: None,
            ha_queue: DiscoveryCallQueue::default(),
            callbacks: Callbacks::default(),
            auto_reregister: true,
        }
    }

    /// Producer handle for the radio receive callback.
    pub fn injector(&self) -> RxInjector {
        RxInjector::new(Arc::clone(&self.rx_ring))
    }

    pub fn local_addr(&self) -> Mac {
        self.local
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn is_registered(&self) -> bool {
        self.status.is_registered()
    }

    pub fn key_id(&self) -> u8 {
        self.key_id
    }

    pub fn node_name(&self) -> Option<&str> {
        self.config.node_name.as_deref()
    }

    /// Last completed clock-sync result, if any.
    pub fn clock_sync(&self) -> Option<ClockSync> {
        self.last_sync
    }

    /// Disables the automatic re-handshake after invalidation or expiry.
    pub fn set_auto_reregister(&mut self, enabled: bool) {
        self.auto_reregister = enabled;
    }

    /// Attaches the application controller and runs its setup hook.
    pub fn set_controller(&mut self, mut controller: Box<dyn Controller>) {
        controller.on_setup(&mut link(self));
        self.controller = Some(controller);
    }

    /// Registers the handler for downstream data and control commands.
    pub fn on_data_rx(
        &mut self,
        handler: impl FnMut(MessageType, PayloadEncoding, &[u8]) + 'static,
    ) {
        self.callbacks.data_rx = Some(Box::new(handler));
    }

    /// Registers the handler fired when registration completes.
    pub fn on_connected(&mut self, handler: impl FnMut() + 'static) {
        self.callbacks.connected = Some(Box::new(handler));
    }

    /// Registers the handler fired when the session is invalidated.
    pub fn on_disconnected(&mut self, handler: impl FnMut(InvalidateReason) + 'static) {
        self.callbacks.disconnected = Some(Box::new(handler));
    }

    /// Registers the handler for NODE_NAME_RESULT codes.
    pub fn on_name_result(&mut self, handler: impl FnMut(NameResult) + 'static) {
        self.callbacks.name_result = Some(Box::new(handler));
    }

    /// Registers the handler for completed clock-sync exchanges.
    pub fn on_time_sync(&mut self, handler: impl FnMut(ClockSync) + 'static) {
        self.callbacks.time_sync = Some(Box::new(handler));
    }

    /// Starts (or restarts) the handshake with a fresh ephemeral keypair.
    pub fn start_registration(&mut self) -> Result<(), Error> {
        let (secret, public) = crypto::generate_keypair();
        self.client_iv = crypto::random_iv();
        let hello = session::build_hello(
            &self.config.network_key,
            MessageType::ClientHello,
            *public.as_bytes(),
            self.client_iv,
        );
        self.dh_secret = Some(secret);
        self.status = NodeStatus::InitPending;
        self.handshake_started_ms = self.clock.now_ms();
        let bytes = frame::encode_hello(MessageType::ClientHello, &hello);
        if self.radio.send(self.config.gateway_mac, &bytes) {
            debug!(gateway = %self.config.gateway_mac, "CLIENT_HELLO sent");
            Ok(())
        } else {
            self.status = NodeStatus::Unregistered;
            self.dh_secret = None;
            Err(Error::SendFailed)
        }
    }

    /// Main-loop step: drains the receive ring, enforces handshake and key
    /// lifetimes, paces discovery calls and runs the controller loop hook.
    /// Returns the number of frames processed.
    pub fn handle(&mut self) -> usize {
        let mut processed = 0;
        loop {
            let record = self.rx_ring.lock().pop();
            let Some(record) = record else { break };
            processed += 1;
            self.process_frame(record.src, record.bytes());
        }

        let now = self.clock.now_ms();
        match self.status {
            NodeStatus::InitPending | NodeStatus::WaitingConfirmation => {
                if now.saturating_sub(self.handshake_started_ms) > HANDSHAKE_TIMEOUT_MS {
                    debug!("handshake timed out, restarting");
                    self.drop_session();
                    let _ = self.start_registration();
                }
            }
            NodeStatus::Registered | NodeStatus::Sleepy => {
                if now.saturating_sub(self.registered_at_ms) > MAX_KEY_VALIDITY_MS {
                    debug!("session key expired, re-registering");
                    self.status = NodeStatus::KeyExpired;
                    self.keys = None;
                    if self.auto_reregister {
                        let _ = self.start_registration();
                    }
                }
            }
            _ => {}
        }

        if self.is_registered() {
            if let Some(payload) = self.ha_queue.pop_due(now, self.sleepy) {
                if let Err(err) = self.send_ha_discovery(&payload) {
                    debug!(%err, "HA discovery send failed");
                }
            }
        }

        if let Some(mut controller) = self.controller.take() {
            controller.on_loop(&mut link(self));
            self.controller = Some(controller);
        }
        processed
    }

    fn process_frame(&mut self, src: Mac, bytes: &[u8]) {
        if src != self.config.gateway_mac {
            trace!(%src, "ignoring frame from foreign sender");
            return;
        }
        let frame = match frame::decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                trace!(%err, "dropping undecodable frame");
                return;
            }
        };
        match frame {
            Frame::ServerHello(body) => self.handle_server_hello(body),
            Frame::InvalidateKey { reason, hmac } => self.handle_invalidate(reason, &hmac),
            Frame::Encrypted(ef) => self.handle_encrypted(ef),
            Frame::ClientHello(_) | Frame::UnencryptedData { .. } => {
                trace!("ignoring upstream-only frame at node");
            }
        }
    }

    fn handle_server_hello(&mut self, body: HelloBody) {
        if self.status != NodeStatus::InitPending {
            trace!("unexpected SERVER_HELLO");
            return;
        }
        if !session::verify_hello(&self.config.network_key, MessageType::ServerHello, &body) {
            warn!("SERVER_HELLO failed network-key authentication");
            return;
        }
        let Some(secret) = self.dh_secret.take() else {
            return;
        };
        let shared = crypto::shared_secret(secret, &body.public_key);
        match session::derive_session(&shared, &self.client_iv, &body.iv) {
            Ok(keys) => {
                self.keys = Some(keys);
                self.up_counter.reset();
                self.down_window.reset();
                self.status = NodeStatus::WaitingConfirmation;
                debug!("session derived, waiting for epoch confirmation");
            }
            Err(err) => {
                warn!(%err, "session derivation failed");
                self.drop_session();
            }
        }
    }

    fn handle_invalidate(&mut self, reason: InvalidateReason, hmac: &[u8]) {
        if !session::verify_invalidate(&self.config.network_key, reason, hmac) {
            trace!("INVALIDATE_KEY with bad MAC ignored");
            return;
        }
        debug!(?reason, "session invalidated by gateway");
        self.drop_session();
        if let Some(handler) = self.callbacks.disconnected.as_mut() {
            handler(reason);
        }
        if self.auto_reregister && reason != InvalidateReason::Kicked {
            let _ = self.start_registration();
        }
    }

    fn handle_encrypted(&mut self, ef: EncryptedFrame) {
        if !ef.msg_type.is_downstream() {
            trace!(msg_type = ?ef.msg_type, "ignoring upstream frame type at node");
            return;
        }
        if ef.msg_type.is_broadcast() {
            self.handle_broadcast(ef);
            return;
        }

        let confirming = self.status == NodeStatus::WaitingConfirmation;
        if !confirming && !self.is_registered() {
            trace!("downstream frame while unregistered");
            return;
        }
        let plaintext = match self.open_downstream(&ef, confirming) {
            Ok(plaintext) => plaintext,
            Err(err @ Error::StaleKeyId { .. }) => {
                trace!(%err, "dropping downstream frame");
                return;
            }
            Err(err) => {
                debug!(msg_type = ?ef.msg_type, %err, "downstream frame not accepted");
                return;
            }
        };
        if confirming {
            // First frame under the fresh key fixes the epoch.
            self.key_id = ef.key_id;
            self.registered_at_ms = self.clock.now_ms();
            self.status = if self.sleepy {
                NodeStatus::Sleepy
            } else {
                NodeStatus::Registered
            };
            self.ha_queue
                .schedule_first(self.registered_at_ms, self.sleepy);
            debug!(key_id = self.key_id, "registration confirmed");
            if let Some(handler) = self.callbacks.connected.as_mut() {
                handler();
            }
        }
        match self.down_window.check(ef.counter) {
            CounterVerdict::Accept { .. } => {}
            CounterVerdict::Reject => {
                trace!(counter = ef.counter, "downstream replay reject");
                return;
            }
        }
        self.dispatch_downstream(ef.msg_type, &plaintext);
    }

    /// Opens a unicast downstream frame under the session key. During epoch
    /// confirmation the carried key_id is accepted as-is; afterwards a
    /// mismatch is refused before any AEAD work.
    fn open_downstream(
        &self,
        ef: &EncryptedFrame,
        confirming: bool,
    ) -> Result<Vec<u8>, Error> {
        if !confirming && ef.key_id != self.key_id {
            return Err(Error::StaleKeyId {
                got: ef.key_id,
                current: self.key_id,
            });
        }
        let keys = self.keys.clone().ok_or(Error::NotRegistered)?;
        let gateway = self.config.gateway_mac;
        Ok(session::open_frame(&keys, ef, &gateway, &self.local)?)
    }

    /// Opens a broadcast frame under the distributed broadcast key.
    fn open_broadcast(&self, ef: &EncryptedFrame) -> Result<Vec<u8>, Error> {
        let keys = self.broadcast_keys.clone().ok_or(Error::NotRegistered)?;
        if ef.key_id != self.broadcast_epoch {
            return Err(Error::StaleKeyId {
                got: ef.key_id,
                current: self.broadcast_epoch,
            });
        }
        let gateway = self.config.gateway_mac;
        Ok(session::open_frame(&keys, ef, &gateway, &Mac::BROADCAST)?)
    }

    fn handle_broadcast(&mut self, ef: EncryptedFrame) {
        let plaintext = match self.open_broadcast(&ef) {
            Ok(plaintext) => plaintext,
            Err(err @ Error::StaleKeyId { .. }) => {
                trace!(%err, "dropping broadcast frame");
                return;
            }
            Err(err) => {
                debug!(%err, "broadcast frame not accepted");
                return;
            }
        };
        match self.broadcast_rx_window.check(ef.counter) {
            CounterVerdict::Accept { .. } => {}
            CounterVerdict::Reject => {
                trace!(counter = ef.counter, "broadcast replay reject");
                return;
            }
        }
        self.dispatch_downstream(ef.msg_type, &plaintext);
    }

    fn dispatch_downstream(&mut self, msg_type: MessageType, plaintext: &[u8]) {
        match msg_type {
            MessageType::DownstreamDataSet
            | MessageType::DownstreamDataGet
            | MessageType::DownstreamCtrlData
            | MessageType::DownstreamBroadcastDataSet
            | MessageType::DownstreamBroadcastDataGet
            | MessageType::DownstreamBroadcastCtrlData => {
                if plaintext.is_empty() {
                    return;
                }
                let encoding =
                    PayloadEncoding::try_from(plaintext[0]).unwrap_or(PayloadEncoding::Raw);
                let payload = plaintext[1..].to_vec();
                if let Some(mut controller) = self.controller.take() {
                    let handled =
                        controller.on_rx(&mut link(self), msg_type, encoding, &payload);
                    if !handled {
                        trace!(msg_type = ?msg_type, "controller did not handle command");
                    }
                    self.controller = Some(controller);
                }
                if let Some(handler) = self.callbacks.data_rx.as_mut() {
                    handler(msg_type, encoding, &payload);
                }
            }
            MessageType::ClockResponse => self.handle_clock_response(plaintext),
            MessageType::NodeNameResult => self.handle_name_result(plaintext),
            MessageType::BroadcastKeyResponse => self.handle_broadcast_key(plaintext),
            other => trace!(msg_type = ?other, "unexpected downstream frame type"),
        }
    }

    fn handle_clock_response(&mut self, plaintext: &[u8]) {
        let Some((t1, t2, t3)) = timesync::decode_response(plaintext) else {
            trace!("malformed clock response");
            return;
        };
        // Stale or unsolicited responses are ignored.
        if self.pending_t1.take() != Some(t1) {
            trace!("clock response does not match pending request");
            return;
        }
        let t4 = self.clock.now_us();
        let sync = ClockSync::evaluate(t1, t2, t3, t4);
        debug!(offset_us = sync.offset_us, round_trip_us = sync.round_trip_us, "clock synced");
        self.last_sync = Some(sync);
        if let Some(handler) = self.callbacks.time_sync.as_mut() {
            handler(sync);
        }
    }

    fn handle_name_result(&mut self, plaintext: &[u8]) {
        let Some(&code) = plaintext.first() else { return };
        let result = NameResult::try_from(code as i8).unwrap_or(NameResult::MessageError);
        if result == NameResult::Ok {
            if let Some(name) = self.pending_name.take() {
                self.config.node_name = Some(name);
            }
        } else {
            // Rejected: the previously accepted name stays in force.
            self.pending_name = None;
        }
        debug!(?result, "node name result");
        if let Some(handler) = self.callbacks.name_result.as_mut() {
            handler(result);
        }
    }

    fn handle_broadcast_key(&mut self, plaintext: &[u8]) {
        if plaintext.len() != 1 + KEY_LENGTH {
            trace!("malformed broadcast key response");
            return;
        }
        let epoch = plaintext[0];
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&plaintext[1..]);
        match session::broadcast_session(crate::crypto::SymmetricKey(key)) {
            Ok(keys) => {
                self.broadcast_keys = Some(keys);
                self.broadcast_epoch = epoch;
                self.broadcast_rx_window.reset();
                self.broadcast_tx_counter.reset();
                debug!(epoch, "broadcast key installed");
            }
            Err(err) => warn!(%err, "broadcast key expansion failed"),
        }
    }

    /// Sends sensor data upstream on the encrypted channel.
    pub fn send_data(&mut self, payload: &[u8], encoding: PayloadEncoding) -> Result<(), Error> {
        self.send_upstream(MessageType::SensorData, encoding, payload)
    }

    /// Sends an internal control message upstream.
    pub fn send_control(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.send_upstream(MessageType::ControlData, PayloadEncoding::Enigma, payload)
    }

    /// Sends sensor data in the clear (counter still enforced by the
    /// gateway).
    pub fn send_unencrypted_data(
        &mut self,
        payload: &[u8],
        encoding: PayloadEncoding,
    ) -> Result<(), Error> {
        if !self.is_registered() {
            return Err(Error::NotRegistered);
        }
        let mut body = Vec::with_capacity(1 + payload.len());
        body.push(encoding as u8);
        body.extend_from_slice(payload);
        let counter = self.up_counter.advance();
        let bytes = frame::encode_unencrypted_data(counter, &body)?;
        if self.radio.send(self.config.gateway_mac, &bytes) {
            Ok(())
        } else {
            Err(Error::SendFailed)
        }
    }

    /// Sends sensor data under the broadcast key to every listener.
    pub fn send_broadcast_data(
        &mut self,
        payload: &[u8],
        encoding: PayloadEncoding,
    ) -> Result<(), Error> {
        let keys = self.broadcast_keys.clone().ok_or(Error::NotRegistered)?;
        if payload.len() + 1 > MAX_DATA_PAYLOAD {
            return Err(Error::Frame(FrameError::PayloadTooLarge {
                len: payload.len(),
            }));
        }
        let mut plaintext = Vec::with_capacity(1 + payload.len());
        plaintext.push(encoding as u8);
        plaintext.extend_from_slice(payload);
        let counter = self.broadcast_tx_counter.advance();
        let ef = session::seal_frame(
            &keys,
            MessageType::SensorBroadcastData,
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

    /// Requests a clock-sync exchange.
    pub fn request_clock_sync(&mut self) -> Result<(), Error> {
        let t1 = self.clock.now_us();
        self.pending_t1 = Some(t1);
        self.send_raw_upstream(MessageType::ClockRequest, &timesync::encode_request(t1))
    }

    /// Asks the gateway to register a node name. The result arrives as a
    /// NODE_NAME_RESULT frame; on success the local config adopts the name.
    pub fn set_node_name(&mut self, name: &str) -> Result<(), Error> {
        if name.is_empty() {
            return Err(Error::EmptyName);
        }
        if name.len() > MAX_NODE_NAME_LENGTH {
            return Err(Error::NameTooLong);
        }
        self.pending_name = Some(name.to_owned());
        self.send_raw_upstream(MessageType::NodeNameSet, name.as_bytes())
    }

    /// Explicitly requests the current broadcast key.
    pub fn request_broadcast_key(&mut self) -> Result<(), Error> {
        self.send_raw_upstream(MessageType::BroadcastKeyRequest, &[])
    }

    /// Declares this node's sleep interval to the gateway. Zero clears the
    /// sleepy capability.
    pub fn announce_sleep(&mut self, seconds: u32) -> Result<(), Error> {
        self.sleepy = seconds > 0;
        self.sleep_seconds = seconds;
        if self.is_registered() {
            self.status = if self.sleepy {
                NodeStatus::Sleepy
            } else {
                NodeStatus::Registered
            };
        }
        let mut payload = [0u8; 5];
        payload[0] = control_op::SLEEP_SET;
        payload[1..].copy_from_slice(&seconds.to_le_bytes());
        self.send_control(&payload)
    }

    /// Declared sleep interval in seconds (zero when not sleepy).
    pub fn sleep_seconds(&self) -> u32 {
        self.sleep_seconds
    }

    fn send_ha_discovery(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.send_upstream(MessageType::HaDiscovery, PayloadEncoding::MsgPack, payload)
    }

    /// Seals `encoding ‖ payload` into an upstream frame.
    fn send_upstream(
        &mut self,
        msg_type: MessageType,
        encoding: PayloadEncoding,
        payload: &[u8],
    ) -> Result<(), Error> {
        if payload.len() + 1 > MAX_DATA_PAYLOAD {
            return Err(Error::Frame(FrameError::PayloadTooLarge {
                len: payload.len(),
            }));
        }
        let mut plaintext = Vec::with_capacity(1 + payload.len());
        plaintext.push(encoding as u8);
        plaintext.extend_from_slice(payload);
        self.send_raw_upstream(msg_type, &plaintext)
    }

    /// Seals a raw plaintext into an upstream frame (no encoding byte).
    fn send_raw_upstream(&mut self, msg_type: MessageType, plaintext: &[u8]) -> Result<(), Error> {
        if !self.is_registered() {
            return Err(Error::NotRegistered);
        }
        let keys = self.keys.clone().ok_or(Error::NotRegistered)?;
        let counter = self.up_counter.advance();
        let gateway = self.config.gateway_mac;
        let ef = session::seal_frame(
            &keys,
            msg_type,
            self.key_id,
            counter,
            &self.local,
            &gateway,
            plaintext,
        )?;
        let bytes = frame::encode_encrypted(&ef)?;
        if self.radio.send(gateway, &bytes) {
            Ok(())
        } else {
            Err(Error::SendFailed)
        }
    }

    /// Clears all session state; key material zeroizes on drop.
    fn drop_session(&mut self) {
        self.keys = None;
        self.dh_secret = None;
        self.status = NodeStatus::Unregistered;
        self.up_counter.reset();
        self.down_window.reset();
        self.pending_t1 = None;
    }
}

/// Builds the controller-facing view of the runtime. Free function so the
/// borrow of `self` is scoped to the call site.
fn link<R: Radio, T: TimeSource>(runtime: &mut NodeRuntime<R, T>) -> Link<'_, R, T> {
    Link { runtime }
}

struct Link<'a, R: Radio, T: TimeSource> {
    runtime: &'a mut NodeRuntime<R, T>,
}

impl<R: Radio, T: TimeSource> ControllerLink for Link<'_, R, T> {
    fn send_data(&mut self, payload: &[u8], encoding: PayloadEncoding) -> bool {
        self.runtime.send_data(payload, encoding).is_ok()
    }

    fn queue_ha_discovery(&mut self, payload: Vec<u8>) {
        self.runtime.ha_queue.push(payload);
    }

    fn is_registered(&self) -> bool {
        self.runtime.is_registered()
    }

    fn is_sleepy(&self) -> bool {
        self.runtime.sleepy
    }
}
