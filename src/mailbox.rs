//! Frame routing between the demultiplexer and protocol tasks.
//!
//! The demultiplexer pushes parsed frames into per-protocol mailboxes.
//! A mailbox exists only while its owner task is alive: registration
//! returns a guard that unregisters on drop, so frames arriving during
//! phase changes fall through and are dropped silently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::codec::ppp::PppPacket;
use crate::codec::sstp::ControlPacket;

/// Depth of each protocol mailbox.
const MAILBOX_DEPTH: usize = 32;

#[derive(Default)]
struct RouterInner {
    ppp: HashMap<u16, mpsc::Sender<PppPacket>>,
    fallback: Option<mpsc::Sender<PppPacket>>,
    sstp: Option<mpsc::Sender<ControlPacket>>,
    data: Option<mpsc::Sender<Vec<u8>>>,
}

/// Shared routing table.
#[derive(Clone, Default)]
pub struct FrameRouter {
    inner: Arc<Mutex<RouterInner>>,
}

/// What became of a routed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Delivered to a registered mailbox.
    Delivered,
    /// No receiver (or a full/closed mailbox); the frame was dropped.
    Dropped,
    /// No handler claims this protocol at all.
    Unclaimed,
}

impl FrameRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mailbox for a PPP protocol, replacing any stale entry.
    pub fn register_ppp(&self, protocol: u16) -> PppMailbox {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        self.inner.lock().unwrap().ppp.insert(protocol, tx.clone());
        PppMailbox {
            rx,
            tx: tx.clone(),
            _guard: Guard {
                router: self.clone(),
                slot: Slot::Ppp(protocol, tx),
            },
        }
    }

    /// Bind an existing PPP mailbox sender to a second protocol number.
    pub fn attach_ppp(&self, protocol: u16, tx: mpsc::Sender<PppPacket>) -> Guard {
        self.inner.lock().unwrap().ppp.insert(protocol, tx.clone());
        Guard {
            router: self.clone(),
            slot: Slot::Ppp(protocol, tx),
        }
    }

    /// Route every PPP protocol nobody else claims to this sender. The
    /// owner answers unknown protocols with Protocol-Reject.
    pub fn attach_fallback(&self, tx: mpsc::Sender<PppPacket>) -> Guard {
        self.inner.lock().unwrap().fallback = Some(tx.clone());
        Guard {
            router: self.clone(),
            slot: Slot::Fallback(tx),
        }
    }

    /// Register the SSTP control mailbox.
    pub fn register_sstp(&self) -> SstpMailbox {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        self.inner.lock().unwrap().sstp = Some(tx.clone());
        SstpMailbox {
            rx,
            _guard: Guard {
                router: self.clone(),
                slot: Slot::Sstp(tx),
            },
        }
    }

    /// Register the sink for inbound L3 payloads (the device writer).
    pub fn register_data(&self) -> DataMailbox {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        self.inner.lock().unwrap().data = Some(tx.clone());
        DataMailbox {
            rx,
            _guard: Guard {
                router: self.clone(),
                slot: Slot::Data(tx),
            },
        }
    }

    /// Route a parsed PPP control frame.
    pub fn route_ppp(&self, packet: PppPacket) -> Routed {
        let inner = self.inner.lock().unwrap();
        match inner.ppp.get(&packet.protocol) {
            Some(tx) => match tx.try_send(packet) {
                Ok(()) => Routed::Delivered,
                Err(_) => Routed::Dropped,
            },
            None => Routed::Dropped,
        }
    }

    /// Route a frame of a protocol we do not implement.
    pub fn route_unknown(&self, packet: PppPacket) -> Routed {
        let inner = self.inner.lock().unwrap();
        match &inner.fallback {
            Some(tx) => match tx.try_send(packet) {
                Ok(()) => Routed::Delivered,
                Err(_) => Routed::Dropped,
            },
            None => Routed::Unclaimed,
        }
    }

    /// Route a parsed SSTP control packet.
    pub fn route_sstp(&self, packet: ControlPacket) -> Routed {
        let inner = self.inner.lock().unwrap();
        match &inner.sstp {
            Some(tx) => match tx.try_send(packet) {
                Ok(()) => Routed::Delivered,
                Err(_) => Routed::Dropped,
            },
            None => Routed::Dropped,
        }
    }

    /// Route an inbound L3 payload toward the device.
    pub fn route_data(&self, payload: Vec<u8>) -> Routed {
        let inner = self.inner.lock().unwrap();
        match &inner.data {
            Some(tx) => match tx.try_send(payload) {
                Ok(()) => Routed::Delivered,
                Err(_) => Routed::Dropped,
            },
            None => Routed::Dropped,
        }
    }

    /// Remove a slot, but only while it still points at the sender the
    /// guard was created with; a newer registration is left alone.
    fn unregister(&self, slot: &Slot) {
        let mut inner = self.inner.lock().unwrap();
        match slot {
            Slot::Ppp(protocol, tx) => {
                if inner
                    .ppp
                    .get(protocol)
                    .is_some_and(|current| current.same_channel(tx))
                {
                    inner.ppp.remove(protocol);
                }
            }
            Slot::Fallback(tx) => {
                if inner
                    .fallback
                    .as_ref()
                    .is_some_and(|current| current.same_channel(tx))
                {
                    inner.fallback = None;
                }
            }
            Slot::Sstp(tx) => {
                if inner
                    .sstp
                    .as_ref()
                    .is_some_and(|current| current.same_channel(tx))
                {
                    inner.sstp = None;
                }
            }
            Slot::Data(tx) => {
                if inner
                    .data
                    .as_ref()
                    .is_some_and(|current| current.same_channel(tx))
                {
                    inner.data = None;
                }
            }
        }
    }
}

enum Slot {
    Ppp(u16, mpsc::Sender<PppPacket>),
    Fallback(mpsc::Sender<PppPacket>),
    Sstp(mpsc::Sender<ControlPacket>),
    Data(mpsc::Sender<Vec<u8>>),
}

/// Unregisters its slot when dropped.
pub struct Guard {
    router: FrameRouter,
    slot: Slot,
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.router.unregister(&self.slot);
    }
}

/// Receiving end of a PPP protocol mailbox.
pub struct PppMailbox {
    rx: mpsc::Receiver<PppPacket>,
    tx: mpsc::Sender<PppPacket>,
    _guard: Guard,
}

impl PppMailbox {
    /// Wait for the next frame. `None` when the router side is gone.
    pub async fn recv(&mut self) -> Option<PppPacket> {
        self.rx.recv().await
    }

    /// A sender for binding this mailbox to additional slots.
    pub fn sender(&self) -> mpsc::Sender<PppPacket> {
        self.tx.clone()
    }
}

/// Receiving end of the SSTP control mailbox.
pub struct SstpMailbox {
    rx: mpsc::Receiver<ControlPacket>,
    _guard: Guard,
}

impl SstpMailbox {
    pub async fn recv(&mut self) -> Option<ControlPacket> {
        self.rx.recv().await
    }
}

/// Receiving end of the inbound data mailbox.
pub struct DataMailbox {
    rx: mpsc::Receiver<Vec<u8>>,
    _guard: Guard,
}

impl DataMailbox {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ppp::{codes, protocols};

    fn frame(protocol: u16) -> PppPacket {
        PppPacket::new(protocol, codes::CONFIGURE_REQUEST, 1, vec![])
    }

    #[tokio::test]
    async fn routes_to_registered_mailbox() {
        let router = FrameRouter::new();
        let mut mailbox = router.register_ppp(protocols::LCP);

        assert_eq!(router.route_ppp(frame(protocols::LCP)), Routed::Delivered);
        assert_eq!(mailbox.recv().await.unwrap().protocol, protocols::LCP);
    }

    #[tokio::test]
    async fn unregistered_protocol_drops_silently() {
        let router = FrameRouter::new();
        assert_eq!(router.route_ppp(frame(protocols::IPCP)), Routed::Dropped);
    }

    #[tokio::test]
    async fn guard_unregisters_on_drop() {
        let router = FrameRouter::new();
        let mailbox = router.register_ppp(protocols::LCP);
        drop(mailbox);
        assert_eq!(router.route_ppp(frame(protocols::LCP)), Routed::Dropped);
    }

    #[tokio::test]
    async fn unknown_protocols_need_the_fallback() {
        let router = FrameRouter::new();
        assert_eq!(router.route_unknown(frame(0x8035)), Routed::Unclaimed);

        let mut mailbox = router.register_ppp(protocols::LCP);
        let _fallback = router.attach_fallback(mailbox.sender());
        assert_eq!(router.route_unknown(frame(0x8035)), Routed::Delivered);
        assert_eq!(mailbox.recv().await.unwrap().protocol, 0x8035);
    }

    #[tokio::test]
    async fn stale_guard_leaves_new_registration_alone() {
        let router = FrameRouter::new();
        let first = router.register_ppp(protocols::LCP);
        let mut second = router.register_ppp(protocols::LCP);
        drop(first);
        assert_eq!(router.route_ppp(frame(protocols::LCP)), Routed::Delivered);
        assert!(second.recv().await.is_some());
    }
}
