use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::association::OutboundPath;
use crate::channel::{Channel, ChannelRegistry, PayloadKind, Reliability};
use crate::session::SessionEvent;
use crate::TransportError;

// Payload-type tags partitioning the multiplexed transport.
pub const PPID_CONTROL: u32 = 50;
pub const PPID_STRING: u32 = 51;
pub const PPID_BINARY_PARTIAL: u32 = 52;
pub const PPID_BINARY: u32 = 53;
pub const PPID_STRING_PARTIAL: u32 = 54;
pub const PPID_STRING_EMPTY: u32 = 56;
pub const PPID_BINARY_EMPTY: u32 = 57;

pub const MESSAGE_TYPE_ACK: u8 = 0x02;
pub const MESSAGE_TYPE_OPEN: u8 = 0x03;

/// Fixed OPEN header: type, channel_type, priority, reliability_param,
/// label_length, protocol_length.
pub const OPEN_HEADER_LEN: usize = 12;

pub fn ppid_for(kind: PayloadKind, empty: bool) -> u32 {
    match (kind, empty) {
        (PayloadKind::Text, false) => PPID_STRING,
        (PayloadKind::Text, true) => PPID_STRING_EMPTY,
        (PayloadKind::Binary, false) => PPID_BINARY,
        (PayloadKind::Binary, true) => PPID_BINARY_EMPTY,
    }
}

/// Maps a payload-type tag back to its kind. The bool is true when the tag
/// marks an empty message whose placeholder byte must be discarded. Partial
/// tags are recognized but unsupported (`None`, as is any unknown tag).
pub fn kind_from_ppid(ppid: u32) -> Option<(PayloadKind, bool)> {
    match ppid {
        PPID_STRING => Some((PayloadKind::Text, false)),
        PPID_STRING_EMPTY => Some((PayloadKind::Text, true)),
        PPID_BINARY => Some((PayloadKind::Binary, false)),
        PPID_BINARY_EMPTY => Some((PayloadKind::Binary, true)),
        _ => None,
    }
}

/// In-band request to open a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessage {
    pub channel_type: u8,
    pub priority: u16,
    pub reliability_param: u32,
    pub label: String,
    pub protocol: String,
}

impl OpenMessage {
    pub fn encode(&self) -> Bytes {
        let label = self.label.as_bytes();
        let protocol = self.protocol.as_bytes();
        let mut out = Vec::with_capacity(OPEN_HEADER_LEN + label.len() + protocol.len());
        out.push(MESSAGE_TYPE_OPEN);
        out.push(self.channel_type);
        out.extend_from_slice(&self.priority.to_be_bytes());
        out.extend_from_slice(&self.reliability_param.to_be_bytes());
        out.extend_from_slice(&(label.len() as u16).to_be_bytes());
        out.extend_from_slice(&(protocol.len() as u16).to_be_bytes());
        out.extend_from_slice(label);
        out.extend_from_slice(protocol);
        Bytes::from(out)
    }

    /// Decode an OPEN message from untrusted peer input. Returns `None` for
    /// anything truncated or inconsistent; malformed opens never mutate
    /// state.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < OPEN_HEADER_LEN || bytes[0] != MESSAGE_TYPE_OPEN {
            return None;
        }
        let channel_type = bytes[1];
        let priority = u16::from_be_bytes([bytes[2], bytes[3]]);
        let reliability_param = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let label_len = u16::from_be_bytes([bytes[8], bytes[9]]) as usize;
        let protocol_len = u16::from_be_bytes([bytes[10], bytes[11]]) as usize;
        if OPEN_HEADER_LEN + label_len + protocol_len > bytes.len() {
            return None;
        }
        let label_end = OPEN_HEADER_LEN + label_len;
        let label = String::from_utf8_lossy(&bytes[OPEN_HEADER_LEN..label_end]).into_owned();
        let protocol =
            String::from_utf8_lossy(&bytes[label_end..label_end + protocol_len]).into_owned();
        Some(Self {
            channel_type,
            priority,
            reliability_param,
            label,
            protocol,
        })
    }
}

pub fn encode_ack() -> Bytes {
    Bytes::from_static(&[MESSAGE_TYPE_ACK])
}

/// The in-band channel-negotiation protocol: produces and interprets OPEN
/// and ACK control messages and keeps the channel registry current.
pub struct Dcep {
    registry: Arc<ChannelRegistry>,
    outbound: Arc<OutboundPath>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Dcep {
    pub(crate) fn new(
        registry: Arc<ChannelRegistry>,
        outbound: Arc<OutboundPath>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            registry,
            outbound,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Open a channel from this side: allocate the next stream id of our
    /// parity, register it connecting, and send the OPEN request. Returns
    /// the handle immediately; the peer's ACK flips it open asynchronously.
    pub fn open_local(
        &self,
        label: &str,
        protocol: &str,
        reliability: Reliability,
        priority: u16,
    ) -> Result<Channel, TransportError> {
        let channel =
            self.registry
                .insert_local(&self.outbound, label, protocol, reliability, priority)?;
        let (channel_type, reliability_param) = reliability.to_wire();
        let open = OpenMessage {
            channel_type,
            priority,
            reliability_param,
            label: label.to_string(),
            protocol: protocol.to_string(),
        };
        tracing::debug!(
            target = "datachannel::dcep",
            sid = channel.sid(),
            label,
            "sending channel open request"
        );
        self.outbound
            .send(open.encode(), channel.sid(), PPID_CONTROL, false)?;
        Ok(channel)
    }

    /// Dispatch one control message by its type byte.
    pub fn handle_control(&self, sid: u16, payload: &[u8]) {
        match payload.first() {
            Some(&MESSAGE_TYPE_OPEN) => self.on_open_received(sid, payload),
            Some(&MESSAGE_TYPE_ACK) => self.on_ack_received(sid),
            other => {
                tracing::debug!(
                    target = "datachannel::dcep",
                    sid,
                    message_type = ?other,
                    "ignoring unknown control message"
                );
            }
        }
    }

    /// Peer asked to open a channel at `sid`. The request itself is the
    /// open signal: the channel registers already open, we reply with an
    /// ACK on the same stream, and the application hears about it.
    pub fn on_open_received(&self, sid: u16, payload: &[u8]) {
        let Some(open) = OpenMessage::decode(payload) else {
            tracing::debug!(
                target = "datachannel::dcep",
                sid,
                len = payload.len(),
                "ignoring truncated channel open request"
            );
            return;
        };
        let reliability = Reliability::from_wire(open.channel_type, open.reliability_param);
        let Some(channel) = self.registry.insert_remote(
            &self.outbound,
            sid,
            open.label,
            open.protocol,
            reliability,
            open.priority,
        ) else {
            tracing::debug!(
                target = "datachannel::dcep",
                sid,
                "ignoring duplicate channel open request"
            );
            return;
        };
        if let Err(err) = self
            .outbound
            .send(encode_ack(), sid, PPID_CONTROL, false)
        {
            tracing::warn!(
                target = "datachannel::dcep",
                sid,
                error = %err,
                "failed to send channel open acknowledgment"
            );
        }
        tracing::debug!(
            target = "datachannel::dcep",
            sid,
            label = channel.label(),
            "channel opened by peer"
        );
        let _ = self.events.send(SessionEvent::ChannelOpened(channel));
    }

    /// Peer acknowledged our open request. Unknown or repeated ACKs are
    /// ignored; a late duplicate is not an error.
    pub fn on_ack_received(&self, sid: u16) {
        match self.registry.get(sid) {
            Some(channel) => {
                if channel.acknowledge_open() {
                    tracing::debug!(
                        target = "datachannel::dcep",
                        sid,
                        label = channel.label(),
                        "channel open acknowledged"
                    );
                }
            }
            None => {
                tracing::trace!(
                    target = "datachannel::dcep",
                    sid,
                    "ignoring acknowledgment for unknown stream"
                );
            }
        }
    }

    /// Deliver application data for `sid`. Returns false when no channel
    /// owns the stream id or the payload-type tag is unsupported; the
    /// caller drops the message with a diagnostic.
    pub fn on_data_received(&self, sid: u16, ppid: u32, payload: Bytes) -> bool {
        let Some((kind, empty)) = kind_from_ppid(ppid) else {
            return false;
        };
        let Some(channel) = self.registry.get(sid) else {
            return false;
        };
        let payload = if empty { Bytes::new() } else { payload };
        channel.deliver(kind, payload);
        true
    }

    pub fn on_stream_reset(&self, sid: u16) {
        if let Some(channel) = self.registry.get(sid) {
            channel.mark_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelState, ReliabilityMode};
    use crate::session::SessionRole;

    fn dcep_with_events(
        role: SessionRole,
    ) -> (Dcep, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ChannelRegistry::new(role));
        let dcep = Dcep::new(registry, OutboundPath::detached(), events_tx);
        (dcep, events_rx)
    }

    fn open_bytes(label: &str, protocol: &str) -> Bytes {
        OpenMessage {
            channel_type: 0,
            priority: 0,
            reliability_param: 0,
            label: label.into(),
            protocol: protocol.into(),
        }
        .encode()
    }

    #[test]
    fn open_message_round_trips() {
        let original = OpenMessage {
            channel_type: 0x81,
            priority: 512,
            reliability_param: 7,
            label: "chat".into(),
            protocol: "proto".into(),
        };
        let decoded = OpenMessage::decode(&original.encode()).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn open_message_layout_is_fixed() {
        let encoded = OpenMessage {
            channel_type: 0x02,
            priority: 256,
            reliability_param: 3000,
            label: "ab".into(),
            protocol: "c".into(),
        }
        .encode();
        assert_eq!(encoded[0], MESSAGE_TYPE_OPEN);
        assert_eq!(encoded[1], 0x02);
        assert_eq!(&encoded[2..4], &256u16.to_be_bytes());
        assert_eq!(&encoded[4..8], &3000u32.to_be_bytes());
        assert_eq!(&encoded[8..10], &2u16.to_be_bytes());
        assert_eq!(&encoded[10..12], &1u16.to_be_bytes());
        assert_eq!(&encoded[12..14], b"ab");
        assert_eq!(&encoded[14..15], b"c");
    }

    #[test]
    fn truncated_open_is_rejected() {
        assert!(OpenMessage::decode(&[MESSAGE_TYPE_OPEN, 0, 0]).is_none());
        // Declared label length exceeds the buffer.
        let mut lying = open_bytes("chat", "").to_vec();
        lying[8] = 0xff;
        assert!(OpenMessage::decode(&lying).is_none());
    }

    #[test]
    fn truncated_open_registers_nothing() {
        let (dcep, _events) = dcep_with_events(SessionRole::Responder);
        dcep.on_open_received(2, &[MESSAGE_TYPE_OPEN, 0, 0, 0]);
        assert!(dcep.registry().is_empty());
    }

    #[test]
    fn open_request_registers_open_channel_and_emits_event() {
        let (dcep, mut events) = dcep_with_events(SessionRole::Responder);
        dcep.on_open_received(2, &open_bytes("chat", "proto"));

        let channel = dcep.registry().get(2).expect("registered");
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.label(), "chat");
        assert_eq!(channel.protocol(), "proto");
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::ChannelOpened(_))
        ));
    }

    #[test]
    fn open_request_sends_exactly_one_ack() {
        use crate::association::{
            AssociationAdapter, AssociationEngine, AssociationSide, AssociationEvent,
        };
        use parking_lot::Mutex as PlMutex;
        use std::sync::atomic::AtomicBool;

        struct AckRecorder {
            sends: Arc<PlMutex<Vec<(Bytes, u16, u32)>>>,
        }
        impl AssociationEngine for AckRecorder {
            fn local_port(&self) -> u16 {
                5000
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
                payload: Bytes,
                sid: u16,
                ppid: u32,
                _unordered: bool,
            ) -> Result<(), TransportError> {
                self.sends.lock().push((payload, sid, ppid));
                Ok(())
            }
            fn poll_event(&mut self) -> Option<AssociationEvent> {
                None
            }
        }

        let sends = Arc::new(PlMutex::new(Vec::new()));
        let adapter = Arc::new(AssociationAdapter::new(Box::new(AckRecorder {
            sends: Arc::clone(&sends),
        })));
        adapter.mark_ready().expect("ready");
        let outbound = OutboundPath::new(adapter, Arc::new(AtomicBool::new(false)));
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let dcep = Dcep::new(
            Arc::new(ChannelRegistry::new(SessionRole::Responder)),
            outbound,
            events_tx,
        );

        dcep.on_open_received(2, &open_bytes("once", ""));
        dcep.on_open_received(2, &open_bytes("once", ""));

        let recorded = sends.lock();
        assert_eq!(recorded.len(), 1, "duplicate open must not produce a second ack");
        assert_eq!(recorded[0].0.as_ref(), &[MESSAGE_TYPE_ACK]);
        assert_eq!(recorded[0].1, 2);
        assert_eq!(recorded[0].2, PPID_CONTROL);
    }

    #[test]
    fn duplicate_open_is_ignored() {
        let (dcep, mut events) = dcep_with_events(SessionRole::Responder);
        dcep.on_open_received(2, &open_bytes("first", ""));
        dcep.on_open_received(2, &open_bytes("second", ""));

        assert_eq!(dcep.registry().len(), 1);
        assert_eq!(dcep.registry().get(2).unwrap().label(), "first");
        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn ack_flips_connecting_to_open_exactly_once() {
        let (dcep, _events) = dcep_with_events(SessionRole::Initiator);
        let channel = dcep
            .open_local("chat", "proto", Reliability::reliable(), 0)
            .expect("open");
        assert_eq!(channel.state(), ChannelState::Connecting);

        dcep.on_ack_received(channel.sid());
        assert_eq!(channel.state(), ChannelState::Open);

        // Duplicate and unknown acks leave state untouched.
        dcep.on_ack_received(channel.sid());
        dcep.on_ack_received(999);
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[test]
    fn open_local_round_trips_to_peer_registry() {
        let (local, _le) = dcep_with_events(SessionRole::Initiator);
        let (remote, _re) = dcep_with_events(SessionRole::Responder);

        let reliability = Reliability {
            mode: ReliabilityMode::MaxRetransmits(3),
            unordered: true,
        };
        let channel = local
            .open_local("chat", "proto", reliability, 256)
            .expect("open");
        let (channel_type, param) = reliability.to_wire();
        let wire = OpenMessage {
            channel_type,
            priority: 256,
            reliability_param: param,
            label: "chat".into(),
            protocol: "proto".into(),
        }
        .encode();

        remote.on_open_received(channel.sid(), &wire);
        let peer_channel = remote.registry().get(channel.sid()).expect("peer channel");
        assert_eq!(peer_channel.label(), "chat");
        assert_eq!(peer_channel.protocol(), "proto");
        assert_eq!(peer_channel.reliability(), reliability);
        assert_eq!(peer_channel.priority(), 256);
    }

    #[test]
    fn closed_channel_resurrects_on_inbound_data() {
        let (dcep, _events) = dcep_with_events(SessionRole::Responder);
        dcep.on_open_received(3, &open_bytes("zombie", ""));
        let channel = dcep.registry().get(3).unwrap();
        let mut inbound = channel.take_receiver().unwrap();

        dcep.on_stream_reset(3);
        assert_eq!(channel.state(), ChannelState::Closed);

        assert!(dcep.on_data_received(3, PPID_STRING, Bytes::from_static(b"hello")));
        assert_eq!(channel.state(), ChannelState::Open);
        let message = inbound.try_recv().expect("delivered");
        assert_eq!(message.payload.as_ref(), b"hello");
        assert_eq!(message.kind, PayloadKind::Text);
    }

    #[test]
    fn empty_ppid_discards_placeholder_byte() {
        let (dcep, _events) = dcep_with_events(SessionRole::Responder);
        dcep.on_open_received(1, &open_bytes("e", ""));
        let channel = dcep.registry().get(1).unwrap();
        let mut inbound = channel.take_receiver().unwrap();

        assert!(dcep.on_data_received(1, PPID_BINARY_EMPTY, Bytes::from_static(&[0])));
        let message = inbound.try_recv().expect("delivered");
        assert!(message.payload.is_empty());
        assert_eq!(message.kind, PayloadKind::Binary);
    }

    #[test]
    fn unknown_stream_or_ppid_is_reported_undeliverable() {
        let (dcep, _events) = dcep_with_events(SessionRole::Responder);
        assert!(!dcep.on_data_received(9, PPID_STRING, Bytes::from_static(b"x")));
        dcep.on_open_received(1, &open_bytes("k", ""));
        assert!(!dcep.on_data_received(1, PPID_STRING_PARTIAL, Bytes::from_static(b"x")));
        assert!(!dcep.on_data_received(1, 9999, Bytes::from_static(b"x")));
    }
}
