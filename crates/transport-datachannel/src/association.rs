use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::dcep::{Dcep, PPID_CONTROL};
use crate::queue::{DeferredSendBuffer, PendingMessage};
use crate::TransportError;

/// Which side of the association open this peer performs, derived from the
/// resolved session role: the offering side connects, the answering side
/// listens and accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationSide {
    Connect,
    Accept,
}

/// Out-of-band association lifecycle notices. Only established/failed feed
/// the bring-up state machine; the rest are logged or dispatched as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    PeerAddressChange,
    StreamReset { sid: u16 },
    Shutdown,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationEvent {
    Established,
    Failed(String),
    Received {
        payload: Bytes,
        sid: u16,
        ppid: u32,
    },
    Notification(NotificationKind),
}

/// The opaque reliable-multiplexing engine. `open` only initiates; the
/// outcome arrives later as an [`AssociationEvent`] so no adapter lock is
/// ever held across a blocking accept.
pub trait AssociationEngine: Send {
    fn local_port(&self) -> u16;
    fn set_remote_port(&mut self, port: u16);
    fn open(&mut self, side: AssociationSide) -> Result<(), TransportError>;
    /// Feed association-layer bytes decrypted out of the tunnel.
    fn push_transport(&mut self, bytes: &[u8]);
    /// Next association-layer frame to encrypt into the tunnel, if any.
    fn pull_transport(&mut self) -> Option<Bytes>;
    fn send(
        &mut self,
        payload: Bytes,
        sid: u16,
        ppid: u32,
        unordered: bool,
    ) -> Result<(), TransportError>;
    fn poll_event(&mut self) -> Option<AssociationEvent>;
}

/// Wraps the multiplexing engine under its own lock (distinct from the
/// handshake adapter's) and carries the deferred-send buffer. The readiness
/// toggle lives inside the same guarded state as the buffer so the one-time
/// flush and the enable happen in a single critical section. Sealing engine
/// frames into the tunnel belongs to the association pump alone, which
/// keeps tunnel bytes in engine order without a lock spanning two adapters.
pub struct AssociationAdapter {
    inner: Mutex<AdapterInner>,
    established: AtomicBool,
}

struct AdapterInner {
    engine: Box<dyn AssociationEngine>,
    deferred: DeferredSendBuffer,
    ready: bool,
}

impl AssociationAdapter {
    pub fn new(engine: Box<dyn AssociationEngine>) -> Self {
        Self {
            inner: Mutex::new(AdapterInner {
                engine,
                deferred: DeferredSendBuffer::new(),
                ready: false,
            }),
            established: AtomicBool::new(false),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.inner.lock().engine.local_port()
    }

    pub fn set_remote_port(&self, port: u16) {
        self.inner.lock().engine.set_remote_port(port);
    }

    pub fn open(&self, side: AssociationSide) -> Result<(), TransportError> {
        self.inner.lock().engine.open(side)
    }

    /// Engine-level association established (connect completed or accept
    /// produced a live association). Readiness for outbound traffic is a
    /// separate gate flipped by [`mark_ready`](Self::mark_ready).
    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    pub(crate) fn mark_established(&self) {
        self.established.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    pub fn deferred_len(&self) -> usize {
        self.inner.lock().deferred.len()
    }

    /// Send one application message. Before readiness the message parks in
    /// the deferred buffer and the call still succeeds; afterwards it goes
    /// to the engine, whose output the association pump seals into the
    /// tunnel.
    pub fn send(
        &self,
        payload: Bytes,
        sid: u16,
        ppid: u32,
        unordered: bool,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if !inner.ready {
            tracing::trace!(
                target = "datachannel::association",
                sid,
                ppid,
                queued = inner.deferred.len() + 1,
                "association not ready; deferring send"
            );
            inner.deferred.push(PendingMessage {
                payload,
                sid,
                ppid,
                unordered,
            });
            return Ok(());
        }
        // Deferred leftovers always go first so cross-channel order matches
        // enqueue order.
        for message in inner.deferred.take_all() {
            inner.engine.send(
                message.payload,
                message.sid,
                message.ppid,
                message.unordered,
            )?;
        }
        inner.engine.send(payload, sid, ppid, unordered)
    }

    /// Flush every deferred message to the engine, in original enqueue
    /// order, and only then admit new sends. Returns how many messages were
    /// flushed.
    pub fn mark_ready(&self) -> Result<usize, TransportError> {
        let mut inner = self.inner.lock();
        let pending = inner.deferred.take_all();
        let flushed = pending.len();
        for message in pending {
            inner.engine.send(
                message.payload,
                message.sid,
                message.ppid,
                message.unordered,
            )?;
        }
        inner.ready = true;
        Ok(flushed)
    }

    /// Feed decrypted tunnel bytes into the engine.
    pub fn push_transport(&self, bytes: &[u8]) {
        self.inner.lock().engine.push_transport(bytes);
    }

    /// Drain the engine's pending transport frames, in engine order. The
    /// association pump is the single consumer.
    pub fn pull_transport_frames(&self) -> Vec<Bytes> {
        let mut inner = self.inner.lock();
        let mut frames = Vec::new();
        while let Some(frame) = inner.engine.pull_transport() {
            frames.push(frame);
        }
        frames
    }

    /// Drain the engine's pending events. Processed by the caller with no
    /// adapter lock held.
    pub fn poll_events(&self) -> Vec<AssociationEvent> {
        let mut inner = self.inner.lock();
        let mut events = Vec::new();
        while let Some(event) = inner.engine.poll_event() {
            events.push(event);
        }
        events
    }

    /// Demultiplex one inbound message: control traffic to the negotiation
    /// protocol, everything else to the channel owning the stream id.
    pub fn on_received(&self, dcep: &Dcep, payload: Bytes, sid: u16, ppid: u32) {
        if ppid == PPID_CONTROL {
            dcep.handle_control(sid, &payload);
        } else if !dcep.on_data_received(sid, ppid, payload) {
            tracing::warn!(
                target = "datachannel::association",
                sid,
                ppid,
                "dropping message for unknown stream"
            );
        }
    }

    pub fn on_notification(&self, dcep: &Dcep, kind: &NotificationKind) {
        match kind {
            NotificationKind::StreamReset { sid } => {
                tracing::debug!(target = "datachannel::association", sid, "stream reset");
                dcep.on_stream_reset(*sid);
            }
            other => {
                tracing::debug!(
                    target = "datachannel::association",
                    notification = ?other,
                    "association notification"
                );
            }
        }
    }
}

/// The outbound send gate handed to channels and the negotiation protocol.
pub struct OutboundPath {
    association: Arc<AssociationAdapter>,
    shutdown: Arc<AtomicBool>,
}

impl OutboundPath {
    pub(crate) fn new(
        association: Arc<AssociationAdapter>,
        shutdown: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            association,
            shutdown,
        })
    }

    pub(crate) fn send(
        &self,
        payload: Bytes,
        sid: u16,
        ppid: u32,
        unordered: bool,
    ) -> Result<(), TransportError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::SessionClosed);
        }
        self.association.send(payload, sid, ppid, unordered)
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Arc<Self> {
        struct NullEngine;
        impl AssociationEngine for NullEngine {
            fn local_port(&self) -> u16 {
                0
            }
            fn set_remote_port(&mut self, _port: u16) {}
            fn open(&mut self, _side: AssociationSide) -> Result<(), TransportError> {
                Ok(())
            }
            fn push_transport(&mut self, _bytes: &[u8]) {}
            fn pull_transport(&mut self) -> Option<Bytes> {
                None
            }
            fn send(
                &mut self,
                _payload: Bytes,
                _sid: u16,
                _ppid: u32,
                _unordered: bool,
            ) -> Result<(), TransportError> {
                Ok(())
            }
            fn poll_event(&mut self) -> Option<AssociationEvent> {
                None
            }
        }

        OutboundPath::new(
            Arc::new(AssociationAdapter::new(Box::new(NullEngine))),
            Arc::new(AtomicBool::new(false)),
        )
    }
}
