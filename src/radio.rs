//! Radio abstraction.
//!
//! The protocol core only needs two things from the physical layer: a
//! fire-and-forget `send` addressed by MAC, and a receive hook that may fire
//! from driver or interrupt context. The hook's sole job is to capture the
//! frame into the runtime's receive ring; all processing happens later on the
//! main loop.
//!
//! [`LoopbackMedium`] wires several in-memory radios together for tests and
//! examples, the way a shared RF channel would.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::ring::{PushOutcome, SpscRing};
use crate::types::{Mac, MAX_MESSAGE_LENGTH};

/// Physical transmit interface.
pub trait Radio {
    /// Sends a raw frame to `dst`. Fire-and-forget; `false` means the driver
    /// refused the frame (no retry is attempted by the core).
    fn send(&mut self, dst: Mac, payload: &[u8]) -> bool;

    /// Address this radio answers to.
    fn local_addr(&self) -> Mac;
}

/// One captured frame, fixed-size so ring storage never allocates.
#[derive(Clone, Copy)]
pub struct RxRecord {
    pub src: Mac,
    len: u8,
    data: [u8; MAX_MESSAGE_LENGTH],
}

impl RxRecord {
    /// Copies a received frame. Returns `None` when the frame exceeds the
    /// radio MTU (such frames cannot be valid and are not worth queuing).
    pub fn capture(src: Mac, payload: &[u8]) -> Option<Self> {
        if payload.is_empty() || payload.len() > MAX_MESSAGE_LENGTH {
            return None;
        }
        let mut data = [0u8; MAX_MESSAGE_LENGTH];
        data[..payload.len()].copy_from_slice(payload);
        Some(Self {
            src,
            len: payload.len() as u8,
            data,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl std::fmt::Debug for RxRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxRecord")
            .field("src", &self.src)
            .field("len", &self.len)
            .finish()
    }
}

/// Cloneable producer handle for a runtime's receive ring. This is the only
/// structure shared between the radio callback context and the main loop.
#[derive(Clone)]
pub struct RxInjector {
    ring: Arc<Mutex<SpscRing<RxRecord>>>,
}

impl RxInjector {
    pub(crate) fn new(ring: Arc<Mutex<SpscRing<RxRecord>>>) -> Self {
        Self { ring }
    }

    /// Captures a frame into the ring. Safe to call from the driver's
    /// receive callback; copies and returns immediately.
    pub fn inject(&self, src: Mac, payload: &[u8]) {
        let Some(record) = RxRecord::capture(src, payload) else {
            trace!(%src, len = payload.len(), "dropping frame outside MTU bounds");
            return;
        };
        let outcome = self.ring.lock().push(record);
        if outcome == PushOutcome::Dropped {
            trace!(%src, "receive ring and overflow area full, frame dropped");
        }
    }
}

type RxHook = Box<dyn FnMut(Mac, &[u8]) + Send>;

#[derive(Default)]
struct MediumInner {
    inboxes: HashMap<Mac, VecDeque<(Mac, Vec<u8>)>>,
    hooks: HashMap<Mac, RxHook>,
}

/// Shared in-memory channel connecting [`LoopbackRadio`] endpoints.
#[derive(Clone, Default)]
pub struct LoopbackMedium {
    inner: Arc<Mutex<MediumInner>>,
}

impl LoopbackMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a radio endpoint with the given address.
    pub fn endpoint(&self, addr: Mac) -> LoopbackRadio {
        self.inner.lock().inboxes.entry(addr).or_default();
        LoopbackRadio {
            addr,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Registers the receive hook for an endpoint. Hooks run inline during
    /// [`deliver_all`](Self::deliver_all) and must only capture the frame
    /// (mirroring the interrupt-context constraint).
    pub fn set_rx_hook(&self, addr: Mac, hook: RxHook) {
        self.inner.lock().hooks.insert(addr, hook);
    }

    /// Delivers every queued frame to its endpoint's hook. Returns the number
    /// of frames delivered.
    pub fn deliver_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut delivered = 0;
        let addrs: Vec<Mac> = inner.inboxes.keys().copied().collect();
        for addr in addrs {
            loop {
                let Some((src, bytes)) = inner
                    .inboxes
                    .get_mut(&addr)
                    .and_then(|inbox| inbox.pop_front())
                else {
                    break;
                };
                if let Some(hook) = inner.hooks.get_mut(&addr) {
                    hook(src, &bytes);
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

/// In-memory radio endpoint, addressable over a [`LoopbackMedium`].
pub struct LoopbackRadio {
    addr: Mac,
    inner: Arc<Mutex<MediumInner>>,
}

impl Radio for LoopbackRadio {
    fn send(&mut self, dst: Mac, payload: &[u8]) -> bool {
        if payload.len() > MAX_MESSAGE_LENGTH {
            return false;
        }
        let mut inner = self.inner.lock();
        if dst.is_broadcast() {
            let targets: Vec<Mac> = inner
                .inboxes
                .keys()
                .copied()
                .filter(|a| *a != self.addr)
                .collect();
            for target in targets {
                if let Some(inbox) = inner.inboxes.get_mut(&target) {
                    inbox.push_back((self.addr, payload.to_vec()));
                }
            }
            true
        } else {
            match inner.inboxes.get_mut(&dst) {
                Some(inbox) => {
                    inbox.push_back((self.addr, payload.to_vec()));
                    true
                }
                None => false,
            }
        }
    }

    fn local_addr(&self) -> Mac {
        self.addr
    }
}
