//! End-to-end scenarios over a loopback radio pair: handshake, replay
//! defence, expiry, strangers, naming, rekey, broadcast, clock sync and
//! sleepy delivery.

use std::sync::{Arc, Mutex};

use enigmaiot::frame;
use enigmaiot::gateway::DownstreamKind;
use enigmaiot::{
    network_key_from_passphrase, ClockSync, Controller, ControllerLink, Frame, Gateway,
    GatewayConfig, InvalidateReason, LoopbackMedium, LoopbackRadio, Mac, ManualClock,
    MessageType, NameResult, NodeConfig, NodeRuntime, NodeStatus, PayloadEncoding, Radio,
};

const PASSPHRASE: &str = "test-network-secret";

type TestGateway = Gateway<LoopbackRadio, ManualClock>;
type TestNode = NodeRuntime<LoopbackRadio, ManualClock>;

/// Raw frames seen at the gateway's antenna, with a gate to withhold
/// delivery for loss/replay scenarios.
struct TapState {
    frames: Vec<(Mac, Vec<u8>)>,
    pass: bool,
}

type Tap = Arc<Mutex<TapState>>;

fn gw_mac() -> Mac {
    Mac([0xE0, 0x00, 0x00, 0x00, 0x00, 0xFE])
}

fn node_mac() -> Mac {
    Mac([0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0x01])
}

fn second_node_mac() -> Mac {
    Mac([0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0x03])
}

fn stranger_mac() -> Mac {
    Mac([0xBB, 0xBB, 0xBB, 0xBB, 0xBB, 0x02])
}

fn spawn_gateway(medium: &LoopbackMedium, clock: &ManualClock) -> (TestGateway, Tap) {
    let radio = medium.endpoint(gw_mac());
    let config = GatewayConfig::new(6, network_key_from_passphrase(PASSPHRASE), "testnet");
    let gateway = Gateway::with_clock(radio, config, clock.clone()).unwrap();
    let tap: Tap = Arc::new(Mutex::new(TapState {
        frames: Vec::new(),
        pass: true,
    }));
    let injector = gateway.injector();
    let hook_tap = Arc::clone(&tap);
    medium.set_rx_hook(
        gw_mac(),
        Box::new(move |src, bytes| {
            let mut tap = hook_tap.lock().unwrap();
            tap.frames.push((src, bytes.to_vec()));
            if tap.pass {
                injector.inject(src, bytes);
            }
        }),
    );
    (gateway, tap)
}

fn spawn_node(medium: &LoopbackMedium, clock: &ManualClock, mac: Mac) -> TestNode {
    let radio = medium.endpoint(mac);
    let config = NodeConfig::new(gw_mac(), network_key_from_passphrase(PASSPHRASE));
    let node = NodeRuntime::with_clock(radio, config, clock.clone());
    let injector = node.injector();
    medium.set_rx_hook(mac, Box::new(move |src, bytes| injector.inject(src, bytes)));
    node
}

/// Runs deliveries and both main loops until the network goes quiet.
fn pump(medium: &LoopbackMedium, gateway: &mut TestGateway, nodes: &mut [&mut TestNode]) {
    for _ in 0..16 {
        let delivered = medium.deliver_all();
        let gw_work = gateway.handle();
        let mut node_work = 0;
        for node in nodes.iter_mut() {
            node_work += node.handle();
        }
        if delivered == 0 && gw_work == 0 && node_work == 0 {
            break;
        }
    }
}

fn register(medium: &LoopbackMedium, gateway: &mut TestGateway, node: &mut TestNode) {
    node.start_registration().unwrap();
    pump(medium, gateway, &mut [node]);
    assert!(node.is_registered(), "node failed to register");
}

type DataEvents = Arc<Mutex<Vec<(Mac, Vec<u8>, u16, bool)>>>;

fn attach_data_sink(gateway: &mut TestGateway) -> DataEvents {
    let events: DataEvents = Arc::default();
    let sink = Arc::clone(&events);
    gateway.on_data_rx(move |src, payload, lost, control, _encoding, _name| {
        sink.lock().unwrap().push((src, payload.to_vec(), lost, control));
    });
    events
}

/// Counter value of a recorded upstream data frame, if it is one.
fn recorded_counter(bytes: &[u8]) -> Option<u16> {
    match frame::decode(bytes) {
        Ok(Frame::Encrypted(ef)) if ef.msg_type == MessageType::SensorData => Some(ef.counter),
        _ => None,
    }
}

#[test]
fn happy_path_handshake_and_first_data() {
    let medium = LoopbackMedium::new();
    let clock = ManualClock::new();
    let (mut gateway, _tap) = spawn_gateway(&medium, &clock);
    let events = attach_data_sink(&mut gateway);

    let new_nodes: Arc<Mutex<Vec<Mac>>> = Arc::default();
    let sink = Arc::clone(&new_nodes);
    gateway.on_new_node(move |mac, _id, _name| sink.lock().unwrap().push(mac));

    let mut node = spawn_node(&medium, &clock, node_mac());
    register(&medium, &mut gateway, &mut node);

    assert_eq!(node.key_id(), 1);
    assert_eq!(new_nodes.lock().unwrap().as_slice(), &[node_mac()]);
    assert_eq!(gateway.active_nodes(), 1);

    node.send_data(b"hello", PayloadEncoding::Raw).unwrap();
    pump(&medium, &mut gateway, &mut [&mut node]);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    let (src, payload, lost, control) = &events[0];
    assert_eq!(*src, node_mac());
    assert_eq!(payload, b"hello");
    assert_eq!(*lost, 0);
    assert!(!control);
}

#[test]
fn replayed_frame_is_rejected() {
    let medium = LoopbackMedium::new();
    let clock = ManualClock::new();
    let (mut gateway, tap) = spawn_gateway(&medium, &clock);
    let events = attach_data_sink(&mut gateway);
    let mut node = spawn_node(&medium, &clock, node_mac());
    register(&medium, &mut gateway, &mut node);

    node.send_data(b"hello", PayloadEncoding::Raw).unwrap();
    pump(&medium, &mut gateway, &mut [&mut node]);
    assert_eq!(events.lock().unwrap().len(), 1);

    // Replay the exact bytes of the data frame.
    let replay = tap
        .lock()
        .unwrap()
        .frames
        .iter()
        .rev()
        .find(|(src, bytes)| *src == node_mac() && recorded_counter(bytes).is_some())
        .map(|(_, bytes)| bytes.clone())
        .expect("data frame recorded");
    gateway.injector().inject(node_mac(), &replay);
    gateway.handle();

    assert_eq!(events.lock().unwrap().len(), 1, "replay must not be delivered");
    assert_eq!(gateway.error_packets(&node_mac()), Some(1));
    // One reject does not tear the session down.
    assert!(gateway
        .node_table()
        .find_by_mac(&node_mac())
        .unwrap()
        .is_registered());
}

#[test]
fn out_of_order_within_window() {
    let medium = LoopbackMedium::new();
    let clock = ManualClock::new();
    let (mut gateway, tap) = spawn_gateway(&medium, &clock);
    let events = attach_data_sink(&mut gateway);
    let mut node = spawn_node(&medium, &clock, node_mac());
    register(&medium, &mut gateway, &mut node);

    node.send_data(b"first", PayloadEncoding::Raw).unwrap();
    pump(&medium, &mut gateway, &mut [&mut node]);

    // Withhold counters 2..=5 from the gateway.
    tap.lock().unwrap().pass = false;
    for payload in [b"c2", b"c3", b"c4", b"c5"] {
        node.send_data(payload, PayloadEncoding::Raw).unwrap();
    }
    pump(&medium, &mut gateway, &mut [&mut node]);
    tap.lock().unwrap().pass = true;

    let gated: Vec<(u16, Vec<u8>)> = tap
        .lock()
        .unwrap()
        .frames
        .iter()
        .filter_map(|(_, bytes)| recorded_counter(bytes).map(|c| (c, bytes.clone())))
        .collect();
    let frame_5 = gated.iter().find(|(c, _)| *c == 5).unwrap().1.clone();
    let frame_3 = gated.iter().find(|(c, _)| *c == 3).unwrap().1.clone();

    // Counter 5 after 1: accepted with three frames reported lost.
    gateway.injector().inject(node_mac(), &frame_5);
    gateway.handle();
    {
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].1, b"c5");
        assert_eq!(events[1].2, 3, "lost count");
    }

    // Counter 3 is now behind the window edge: rejected.
    gateway.injector().inject(node_mac(), &frame_3);
    gateway.handle();
    assert_eq!(events.lock().unwrap().len(), 2);
    assert_eq!(gateway.error_packets(&node_mac()), Some(1));
}

#[test]
fn key_expiry_invalidates_on_next_frame() {
    let medium = LoopbackMedium::new();
    let clock = ManualClock::new();
    let (mut gateway, _tap) = spawn_gateway(&medium, &clock);
    let events = attach_data_sink(&mut gateway);

    let disconnects: Arc<Mutex<Vec<(Mac, InvalidateReason)>>> = Arc::default();
    let sink = Arc::clone(&disconnects);
    gateway.on_node_disconnected(move |mac, reason| sink.lock().unwrap().push((mac, reason)));

    let mut node = spawn_node(&medium, &clock, node_mac());
    node.set_auto_reregister(false);
    register(&medium, &mut gateway, &mut node);

    let node_disconnects: Arc<Mutex<Vec<InvalidateReason>>> = Arc::default();
    let sink = Arc::clone(&node_disconnects);
    node.on_disconnected(move |reason| sink.lock().unwrap().push(reason));

    clock.advance_ms(enigmaiot::types::MAX_KEY_VALIDITY_MS + 1_000);

    // The stale frame triggers the expiry reply instead of delivery.
    node.send_data(b"late", PayloadEncoding::Raw).unwrap();
    medium.deliver_all();
    gateway.handle();

    assert!(events.lock().unwrap().is_empty());
    assert_eq!(
        disconnects.lock().unwrap().as_slice(),
        &[(node_mac(), InvalidateReason::KeyExpired)]
    );
    assert_eq!(
        gateway
            .node_table()
            .find_by_mac(&node_mac())
            .unwrap()
            .status,
        NodeStatus::Unregistered
    );

    // The node hears the INVALIDATE_KEY and drops its session too.
    medium.deliver_all();
    node.handle();
    assert_eq!(
        node_disconnects.lock().unwrap().as_slice(),
        &[InvalidateReason::KeyExpired]
    );
    assert!(!node.is_registered());
}

#[test]
fn stranger_data_gets_unregistered_reply() {
    let medium = LoopbackMedium::new();
    let clock = ManualClock::new();
    let (mut gateway, _tap) = spawn_gateway(&medium, &clock);
    let events = attach_data_sink(&mut gateway);

    // Capture whatever comes back to the stranger.
    let mut stranger = medium.endpoint(stranger_mac());
    let replies: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
    let sink = Arc::clone(&replies);
    medium.set_rx_hook(
        stranger_mac(),
        Box::new(move |_, bytes| sink.lock().unwrap().push(bytes.to_vec())),
    );

    // A plausible-looking SENSOR_DATA frame from a MAC with no session.
    let mut fake = vec![0x01u8, 1, 1, 0];
    fake.extend_from_slice(&[0u8; 12]); // nonce
    fake.extend_from_slice(&[0xEEu8; 21]); // ciphertext + tag
    assert!(stranger.send(gw_mac(), &fake));
    medium.deliver_all();
    gateway.handle();
    medium.deliver_all();

    assert!(events.lock().unwrap().is_empty());
    assert!(
        gateway.node_table().find_by_mac(&stranger_mac()).is_none(),
        "no session may be allocated for a stranger"
    );
    let replies = replies.lock().unwrap();
    assert_eq!(replies.len(), 1);
    match frame::decode(&replies[0]).unwrap() {
        Frame::InvalidateKey { reason, .. } => {
            assert_eq!(reason, InvalidateReason::UnregisteredNode)
        }
        other => panic!("expected INVALIDATE_KEY, got {other:?}"),
    }
}

#[test]
fn node_name_collision() {
    let medium = LoopbackMedium::new();
    let clock = ManualClock::new();
    let (mut gateway, _tap) = spawn_gateway(&medium, &clock);

    let mut node_a = spawn_node(&medium, &clock, node_mac());
    let mut node_b = spawn_node(&medium, &clock, second_node_mac());
    register(&medium, &mut gateway, &mut node_a);
    register(&medium, &mut gateway, &mut node_b);

    let a_results: Arc<Mutex<Vec<NameResult>>> = Arc::default();
    let sink = Arc::clone(&a_results);
    node_a.on_name_result(move |r| sink.lock().unwrap().push(r));
    let b_results: Arc<Mutex<Vec<NameResult>>> = Arc::default();
    let sink = Arc::clone(&b_results);
    node_b.on_name_result(move |r| sink.lock().unwrap().push(r));

    node_a.set_node_name("kitchen").unwrap();
    pump(&medium, &mut gateway, &mut [&mut node_a, &mut node_b]);
    assert_eq!(a_results.lock().unwrap().as_slice(), &[NameResult::Ok]);
    assert_eq!(node_a.node_name(), Some("kitchen"));

    node_b.set_node_name("kitchen").unwrap();
    pump(&medium, &mut gateway, &mut [&mut node_a, &mut node_b]);
    assert_eq!(
        b_results.lock().unwrap().as_slice(),
        &[NameResult::AlreadyUsed]
    );
    assert_eq!(node_b.node_name(), None, "rejected name must not stick");
    assert_eq!(
        gateway.node_table().find_by_name("kitchen").unwrap().mac,
        node_mac()
    );

    // Downstream addressing by name resolves to node A.
    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
    let sink = Arc::clone(&received);
    node_a.on_data_rx(move |_msg_type, _encoding, payload| {
        sink.lock().unwrap().push(payload.to_vec());
    });
    gateway
        .send_downstream_by_name(
            "kitchen",
            b"blink",
            DownstreamKind::Set,
            PayloadEncoding::Raw,
        )
        .unwrap();
    pump(&medium, &mut gateway, &mut [&mut node_a, &mut node_b]);
    assert_eq!(received.lock().unwrap().as_slice(), &[b"blink".to_vec()]);
}

/// Minimal application module: announces one discovery payload and records
/// downstream commands.
struct LampController {
    commands: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Controller for LampController {
    fn on_setup(&mut self, link: &mut dyn ControllerLink) {
        link.queue_ha_discovery(b"\x81\xa4name\xa4lamp".to_vec());
    }

    fn on_loop(&mut self, _link: &mut dyn ControllerLink) {}

    fn on_rx(
        &mut self,
        _link: &mut dyn ControllerLink,
        _msg_type: MessageType,
        _encoding: PayloadEncoding,
        payload: &[u8],
    ) -> bool {
        self.commands.lock().unwrap().push(payload.to_vec());
        true
    }
}

#[test]
fn ha_discovery_is_paced_and_forwarded_with_topic() {
    let medium = LoopbackMedium::new();
    let clock = ManualClock::new();
    let (mut gateway, _tap) = spawn_gateway(&medium, &clock);
    let mut node = spawn_node(&medium, &clock, node_mac());

    let commands: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
    node.set_controller(Box::new(LampController {
        commands: Arc::clone(&commands),
    }));

    let discoveries: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::default();
    let sink = Arc::clone(&discoveries);
    gateway.on_ha_discovery(move |topic, payload| {
        sink.lock().unwrap().push((topic.to_owned(), payload.to_vec()));
    });

    register(&medium, &mut gateway, &mut node);

    // Nothing goes out before the first-delivery delay elapses.
    pump(&medium, &mut gateway, &mut [&mut node]);
    assert!(discoveries.lock().unwrap().is_empty());

    clock.advance_ms(enigmaiot::types::HA_FIRST_DISCOVERY_DELAY_MS + 1);
    pump(&medium, &mut gateway, &mut [&mut node]);

    let discoveries = discoveries.lock().unwrap();
    assert_eq!(discoveries.len(), 1);
    let (topic, payload) = &discoveries[0];
    assert_eq!(topic, &format!("testnet/{}/ha", node_mac()));
    assert_eq!(payload, b"\x81\xa4name\xa4lamp");

    // The controller also sees downstream commands.
    drop(discoveries);
    gateway
        .send_downstream(node_mac(), b"on", DownstreamKind::Set, PayloadEncoding::Raw)
        .unwrap();
    pump(&medium, &mut gateway, &mut [&mut node]);
    assert_eq!(commands.lock().unwrap().as_slice(), &[b"on".to_vec()]);
}

#[test]
fn rekey_bumps_epoch_and_drops_stale_frames() {
    let medium = LoopbackMedium::new();
    let clock = ManualClock::new();
    let (mut gateway, tap) = spawn_gateway(&medium, &clock);
    let events = attach_data_sink(&mut gateway);
    let mut node = spawn_node(&medium, &clock, node_mac());
    register(&medium, &mut gateway, &mut node);
    assert_eq!(node.key_id(), 1);

    node.send_data(b"epoch-one", PayloadEncoding::Raw).unwrap();
    pump(&medium, &mut gateway, &mut [&mut node]);
    let stale = tap
        .lock()
        .unwrap()
        .frames
        .iter()
        .rev()
        .find(|(_, bytes)| recorded_counter(bytes).is_some())
        .map(|(_, bytes)| bytes.clone())
        .unwrap();

    // A second handshake from the same MAC: last writer wins, epoch bumps.
    node.start_registration().unwrap();
    pump(&medium, &mut gateway, &mut [&mut node]);
    assert!(node.is_registered());
    assert_eq!(node.key_id(), 2);
    assert_eq!(
        gateway.node_table().find_by_mac(&node_mac()).unwrap().key_id,
        2
    );

    // The frame from the previous epoch is dropped without side effects.
    let before = events.lock().unwrap().len();
    gateway.injector().inject(node_mac(), &stale);
    gateway.handle();
    assert_eq!(events.lock().unwrap().len(), before);
    assert!(gateway
        .node_table()
        .find_by_mac(&node_mac())
        .unwrap()
        .is_registered());

    // The fresh session still works.
    node.send_data(b"epoch-two", PayloadEncoding::Raw).unwrap();
    pump(&medium, &mut gateway, &mut [&mut node]);
    assert_eq!(events.lock().unwrap().last().unwrap().1, b"epoch-two");
}

#[test]
fn broadcast_downstream_reaches_node() {
    let medium = LoopbackMedium::new();
    let clock = ManualClock::new();
    let (mut gateway, _tap) = spawn_gateway(&medium, &clock);
    let mut node = spawn_node(&medium, &clock, node_mac());
    register(&medium, &mut gateway, &mut node);

    let received: Arc<Mutex<Vec<(MessageType, Vec<u8>)>>> = Arc::default();
    let sink = Arc::clone(&received);
    node.on_data_rx(move |msg_type, _encoding, payload| {
        sink.lock().unwrap().push((msg_type, payload.to_vec()));
    });

    gateway
        .send_broadcast(b"lights-off", DownstreamKind::Set, PayloadEncoding::Raw)
        .unwrap();
    pump(&medium, &mut gateway, &mut [&mut node]);

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0],
        (
            MessageType::DownstreamBroadcastDataSet,
            b"lights-off".to_vec()
        )
    );
}

#[test]
fn clock_sync_measures_offset_and_round_trip() {
    let medium = LoopbackMedium::new();
    let clock = ManualClock::new();
    let (mut gateway, _tap) = spawn_gateway(&medium, &clock);
    let mut node = spawn_node(&medium, &clock, node_mac());
    register(&medium, &mut gateway, &mut node);

    node.request_clock_sync().unwrap();
    clock.advance_ms(10);
    medium.deliver_all();
    gateway.handle();
    clock.advance_ms(10);
    medium.deliver_all();
    node.handle();

    // Shared test clock: symmetric 10ms legs cancel to zero offset.
    let sync = node.clock_sync().expect("sync completed");
    assert_eq!(
        sync,
        ClockSync {
            offset_us: 0,
            round_trip_us: 20_000
        }
    );
}

#[test]
fn sleepy_downstream_parked_until_wake() {
    let medium = LoopbackMedium::new();
    let clock = ManualClock::new();
    let (mut gateway, _tap) = spawn_gateway(&medium, &clock);
    let mut node = spawn_node(&medium, &clock, node_mac());
    register(&medium, &mut gateway, &mut node);

    node.announce_sleep(300).unwrap();
    pump(&medium, &mut gateway, &mut [&mut node]);
    assert_eq!(
        gateway.node_table().find_by_mac(&node_mac()).unwrap().status,
        NodeStatus::Sleepy
    );

    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
    let sink = Arc::clone(&received);
    node.on_data_rx(move |_msg_type, _encoding, payload| {
        sink.lock().unwrap().push(payload.to_vec());
    });

    // Parked while the node sleeps.
    gateway
        .send_downstream(
            node_mac(),
            b"config",
            DownstreamKind::Set,
            PayloadEncoding::Raw,
        )
        .unwrap();
    medium.deliver_all();
    node.handle();
    assert!(received.lock().unwrap().is_empty(), "must wait for wake");

    // The next upstream frame marks the wake window; delivery follows.
    node.send_data(b"awake", PayloadEncoding::Raw).unwrap();
    pump(&medium, &mut gateway, &mut [&mut node]);
    assert_eq!(received.lock().unwrap().as_slice(), &[b"config".to_vec()]);

    // A parked message past its TTL is dropped instead of delivered.
    gateway
        .send_downstream(
            node_mac(),
            b"stale",
            DownstreamKind::Set,
            PayloadEncoding::Raw,
        )
        .unwrap();
    clock.advance_ms(enigmaiot::types::DOWNSTREAM_TTL_MS + 1_000);
    node.send_data(b"awake-again", PayloadEncoding::Raw).unwrap();
    pump(&medium, &mut gateway, &mut [&mut node]);
    assert_eq!(received.lock().unwrap().len(), 1, "expired message dropped");
}

#[test]
fn unencrypted_data_path() {
    let medium = LoopbackMedium::new();
    let clock = ManualClock::new();
    let (mut gateway, _tap) = spawn_gateway(&medium, &clock);
    let events = attach_data_sink(&mut gateway);
    let mut node = spawn_node(&medium, &clock, node_mac());
    register(&medium, &mut gateway, &mut node);

    node.send_unencrypted_data(b"plain", PayloadEncoding::Raw)
        .unwrap();
    pump(&medium, &mut gateway, &mut [&mut node]);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, b"plain");
    assert!(!events[0].3);
}
