use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::association::OutboundPath;
use crate::dcep;
use crate::session::SessionRole;
use crate::TransportError;

/// Registry slots grow by this increment when exhausted.
pub const CHANNEL_SLOT_STEP: usize = 16;
/// Hard cap on channels per session.
pub const MAX_CHANNELS: usize = 128;

pub const PRIORITY_BELOW_NORMAL: u16 = 128;
pub const PRIORITY_NORMAL: u16 = 256;
pub const PRIORITY_HIGH: u16 = 512;
pub const PRIORITY_EXTRA_HIGH: u16 = 1024;

const CHANNEL_TYPE_PARTIAL_REXMIT: u8 = 0x01;
const CHANNEL_TYPE_PARTIAL_TIMED: u8 = 0x02;
const CHANNEL_TYPE_UNORDERED: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// What a channel promises about delivery of its messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reliability {
    pub mode: ReliabilityMode,
    pub unordered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReliabilityMode {
    Reliable,
    /// Give up after this many retransmissions.
    MaxRetransmits(u32),
    /// Give up once the message is older than this many milliseconds.
    MaxLifetimeMs(u32),
}

impl Reliability {
    pub fn reliable() -> Self {
        Self {
            mode: ReliabilityMode::Reliable,
            unordered: false,
        }
    }

    /// The (channel_type, reliability_param) pair carried by an OPEN message.
    pub fn to_wire(self) -> (u8, u32) {
        let (mut channel_type, param) = match self.mode {
            ReliabilityMode::Reliable => (0x00, 0),
            ReliabilityMode::MaxRetransmits(count) => (CHANNEL_TYPE_PARTIAL_REXMIT, count),
            ReliabilityMode::MaxLifetimeMs(ms) => (CHANNEL_TYPE_PARTIAL_TIMED, ms),
        };
        if self.unordered {
            channel_type |= CHANNEL_TYPE_UNORDERED;
        }
        (channel_type, param)
    }

    pub fn from_wire(channel_type: u8, param: u32) -> Self {
        let mode = if channel_type & CHANNEL_TYPE_PARTIAL_REXMIT != 0 {
            ReliabilityMode::MaxRetransmits(param)
        } else if channel_type & CHANNEL_TYPE_PARTIAL_TIMED != 0 {
            ReliabilityMode::MaxLifetimeMs(param)
        } else {
            ReliabilityMode::Reliable
        };
        Self {
            mode,
            unordered: channel_type & CHANNEL_TYPE_UNORDERED != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    Text,
    Binary,
}

/// One application message delivered on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub kind: PayloadKind,
    pub payload: Bytes,
}

/// Handle to one multiplexed application stream. Clones share state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    sid: u16,
    label: String,
    protocol: String,
    reliability: Reliability,
    priority: u16,
    state: Mutex<ChannelState>,
    inbound_tx: mpsc::UnboundedSender<ChannelMessage>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelMessage>>>,
    outbound: Arc<OutboundPath>,
}

impl Channel {
    pub(crate) fn new(
        sid: u16,
        label: String,
        protocol: String,
        reliability: Reliability,
        priority: u16,
        state: ChannelState,
        outbound: Arc<OutboundPath>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ChannelInner {
                sid,
                label,
                protocol,
                reliability,
                priority,
                state: Mutex::new(state),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                outbound,
            }),
        }
    }

    pub fn sid(&self) -> u16 {
        self.inner.sid
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    pub fn reliability(&self) -> Reliability {
        self.inner.reliability
    }

    pub fn priority(&self) -> u16 {
        self.inner.priority
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    pub fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.send(PayloadKind::Text, Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn send_binary(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.send(PayloadKind::Binary, Bytes::copy_from_slice(bytes))
    }

    /// Queue a message for the peer. Sends issued before the association is
    /// ready are buffered and flushed in order once it becomes ready.
    pub fn send(&self, kind: PayloadKind, payload: Bytes) -> Result<(), TransportError> {
        let empty = payload.is_empty();
        let ppid = dcep::ppid_for(kind, empty);
        // An empty message still needs one byte on the wire; the empty ppid
        // tells the receiver to discard the placeholder.
        let payload = if empty {
            Bytes::from_static(&[0])
        } else {
            payload
        };
        self.inner.outbound.send(
            payload,
            self.inner.sid,
            ppid,
            self.inner.reliability.unordered,
        )
    }

    /// Take the inbound message receiver. Yields `None` after the first call.
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<ChannelMessage>> {
        self.inner.inbound_rx.lock().take()
    }

    /// Mark the channel closed locally. There is no in-band close in the
    /// negotiation protocol; streams are reset out of band.
    pub fn close(&self) {
        *self.inner.state.lock() = ChannelState::Closed;
    }

    pub(crate) fn acknowledge_open(&self) -> bool {
        let mut state = self.inner.state.lock();
        if *state == ChannelState::Connecting {
            *state = ChannelState::Open;
            true
        } else {
            false
        }
    }

    pub(crate) fn mark_closed(&self) {
        *self.inner.state.lock() = ChannelState::Closed;
    }

    /// Deliver an inbound message. A closed channel reopens on first
    /// post-close data instead of requiring a fresh OPEN exchange.
    pub(crate) fn deliver(&self, kind: PayloadKind, payload: Bytes) {
        {
            let mut state = self.inner.state.lock();
            if *state == ChannelState::Closed {
                tracing::debug!(
                    target = "datachannel::channel",
                    sid = self.inner.sid,
                    "closed channel reopened by inbound data"
                );
                *state = ChannelState::Open;
            }
        }
        if self.inner.inbound_tx.send(ChannelMessage { kind, payload }).is_err() {
            tracing::trace!(
                target = "datachannel::channel",
                sid = self.inner.sid,
                "inbound receiver dropped; message discarded"
            );
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("sid", &self.inner.sid)
            .field("label", &self.inner.label)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

/// Per-session channel table. Its lock is distinct from the adapters' locks:
/// it is hit from the control-message path and the public API concurrently.
pub struct ChannelRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    slots: Vec<Option<Channel>>,
    stream_cursor: u32,
    allocated_any: bool,
}

impl ChannelRegistry {
    pub fn new(role: SessionRole) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                slots: vec![None; CHANNEL_SLOT_STEP],
                stream_cursor: parity_seed(role),
                allocated_any: false,
            }),
        }
    }

    /// Re-seed the stream-id parity after role resolution. A no-op once any
    /// local channel has been allocated.
    pub(crate) fn seed_parity(&self, role: SessionRole) {
        let mut inner = self.inner.lock();
        if !inner.allocated_any {
            inner.stream_cursor = parity_seed(role);
        }
    }

    pub(crate) fn insert_local(
        &self,
        outbound: &Arc<OutboundPath>,
        label: &str,
        protocol: &str,
        reliability: Reliability,
        priority: u16,
    ) -> Result<Channel, TransportError> {
        let mut inner = self.inner.lock();
        let slot = find_free_slot(&mut inner.slots)?;
        if inner.stream_cursor > u16::MAX as u32 {
            return Err(TransportError::RegistryFull);
        }
        let sid = inner.stream_cursor as u16;
        inner.stream_cursor += 2;
        inner.allocated_any = true;

        let channel = Channel::new(
            sid,
            label.to_string(),
            protocol.to_string(),
            reliability,
            priority,
            ChannelState::Connecting,
            Arc::clone(outbound),
        );
        inner.slots[slot] = Some(channel.clone());
        Ok(channel)
    }

    /// Register a remotely-opened channel. Returns `None` when the sid is
    /// already present (duplicate opens are ignored, not overwritten) or the
    /// registry is full.
    pub(crate) fn insert_remote(
        &self,
        outbound: &Arc<OutboundPath>,
        sid: u16,
        label: String,
        protocol: String,
        reliability: Reliability,
        priority: u16,
    ) -> Option<Channel> {
        let mut inner = self.inner.lock();
        if lookup(&inner.slots, sid).is_some() {
            return None;
        }
        let slot = find_free_slot(&mut inner.slots).ok()?;
        let channel = Channel::new(
            sid,
            label,
            protocol,
            reliability,
            priority,
            ChannelState::Open,
            Arc::clone(outbound),
        );
        inner.slots[slot] = Some(channel.clone());
        Some(channel)
    }

    pub fn get(&self, sid: u16) -> Option<Channel> {
        lookup(&self.inner.lock().slots, sid)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.inner.lock().slots.iter().flatten().cloned().collect()
    }
}

fn parity_seed(role: SessionRole) -> u32 {
    match role {
        SessionRole::Initiator => 0,
        SessionRole::Responder => 1,
    }
}

fn lookup(slots: &[Option<Channel>], sid: u16) -> Option<Channel> {
    slots
        .iter()
        .flatten()
        .find(|channel| channel.sid() == sid)
        .cloned()
}

fn find_free_slot(slots: &mut Vec<Option<Channel>>) -> Result<usize, TransportError> {
    if let Some(index) = slots.iter().position(Option::is_none) {
        return Ok(index);
    }
    if slots.len() >= MAX_CHANNELS {
        return Err(TransportError::RegistryFull);
    }
    let index = slots.len();
    let grown = (slots.len() + CHANNEL_SLOT_STEP).min(MAX_CHANNELS);
    slots.resize(grown, None);
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::OutboundPath;

    fn outbound() -> Arc<OutboundPath> {
        OutboundPath::detached()
    }

    #[test]
    fn reliability_wire_round_trip() {
        let cases = [
            Reliability::reliable(),
            Reliability {
                mode: ReliabilityMode::MaxRetransmits(5),
                unordered: false,
            },
            Reliability {
                mode: ReliabilityMode::MaxLifetimeMs(1500),
                unordered: true,
            },
        ];
        for reliability in cases {
            let (channel_type, param) = reliability.to_wire();
            assert_eq!(Reliability::from_wire(channel_type, param), reliability);
        }
    }

    #[test]
    fn unordered_flag_is_bit_seven() {
        let (channel_type, _) = Reliability {
            mode: ReliabilityMode::Reliable,
            unordered: true,
        }
        .to_wire();
        assert_eq!(channel_type, 0x80);
    }

    #[test]
    fn local_sids_are_even_for_initiator_and_increase() {
        let registry = ChannelRegistry::new(SessionRole::Initiator);
        let outbound = outbound();
        let first = registry
            .insert_local(&outbound, "a", "", Reliability::reliable(), 0)
            .unwrap();
        let second = registry
            .insert_local(&outbound, "b", "", Reliability::reliable(), 0)
            .unwrap();
        assert_eq!(first.sid(), 0);
        assert_eq!(second.sid(), 2);
    }

    #[test]
    fn responder_allocates_odd_sids() {
        let registry = ChannelRegistry::new(SessionRole::Responder);
        let outbound = outbound();
        let channel = registry
            .insert_local(&outbound, "odd", "", Reliability::reliable(), 0)
            .unwrap();
        assert_eq!(channel.sid(), 1);
    }

    #[test]
    fn parity_reseed_is_ignored_after_allocation() {
        let registry = ChannelRegistry::new(SessionRole::Initiator);
        let outbound = outbound();
        registry
            .insert_local(&outbound, "a", "", Reliability::reliable(), 0)
            .unwrap();
        registry.seed_parity(SessionRole::Responder);
        let next = registry
            .insert_local(&outbound, "b", "", Reliability::reliable(), 0)
            .unwrap();
        assert_eq!(next.sid(), 2);
    }

    #[test]
    fn registry_grows_then_reports_exhaustion() {
        let registry = ChannelRegistry::new(SessionRole::Initiator);
        let outbound = outbound();
        for i in 0..MAX_CHANNELS {
            registry
                .insert_local(&outbound, &format!("ch-{i}"), "", Reliability::reliable(), 0)
                .unwrap();
        }
        let err = registry
            .insert_local(&outbound, "overflow", "", Reliability::reliable(), 0)
            .unwrap_err();
        assert!(matches!(err, TransportError::RegistryFull));
    }

    #[test]
    fn duplicate_remote_sid_is_ignored() {
        let registry = ChannelRegistry::new(SessionRole::Responder);
        let outbound = outbound();
        let first = registry.insert_remote(
            &outbound,
            4,
            "one".into(),
            String::new(),
            Reliability::reliable(),
            0,
        );
        assert!(first.is_some());
        let duplicate = registry.insert_remote(
            &outbound,
            4,
            "two".into(),
            String::new(),
            Reliability::reliable(),
            0,
        );
        assert!(duplicate.is_none());
        assert_eq!(registry.get(4).unwrap().label(), "one");
    }
}
