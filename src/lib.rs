//! EnigmaIOT: a secure link-layer protocol for low-power sensor networks
//! over a connectionless broadcast radio (ESP-NOW style: 6-byte addresses,
//! 250-byte MTU, no sessions, no ordering).
//!
//! Nodes perform an ephemeral X25519 handshake with a coordinating gateway,
//! derive per-session and broadcast keys, and exchange ChaCha20-Poly1305
//! frames with monotonic counters for replay defence. The gateway
//! multiplexes every session across a bounded node table behind a
//! single-producer receive ring; nodes sleep aggressively between
//! transmissions and can coarse-sync their clocks to schedule wake windows.
//!
//! Both runtimes are plain values driven by a cooperative main loop: the
//! radio receive callback only captures frames, `handle()` does everything
//! else.

pub mod config;
pub mod counter;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod node;
pub mod nodelist;
pub mod radio;
pub mod ring;
pub mod session;
pub mod time;
pub mod timesync;
pub mod types;

pub use config::{network_key_from_passphrase, GatewayConfig, NodeConfig};
pub use counter::{CounterVerdict, ReplayWindow, TxCounter};
pub use error::{CryptoError, Error, FrameError, Result};
pub use frame::{Frame, MessageType};
pub use gateway::{DownstreamKind, Gateway};
pub use node::{Controller, ControllerLink, NodeRuntime};
pub use nodelist::{NodeInfo, NodeStatus, NodeTable};
pub use radio::{LoopbackMedium, LoopbackRadio, Radio, RxInjector};
pub use ring::SpscRing;
pub use time::{ManualClock, MonotonicClock, TimeSource};
pub use timesync::ClockSync;
pub use types::{InvalidateReason, Mac, NameResult, PayloadEncoding};
