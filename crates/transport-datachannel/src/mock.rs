//! In-memory collaborator implementations: a loopback connectivity pair, a
//! scripted multi-flight handshake, and an ordered in-memory association
//! engine. Enough to run both ends of a session in one process, which is
//! how the integration tests exercise the bring-up pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;

use crate::association::{AssociationEngine, AssociationEvent, AssociationSide, NotificationKind};
use crate::connectivity::{Connectivity, ConnectivityEvent, IceCredentials};
use crate::handshake::{HandshakeDriver, HandshakeRole};
use crate::sdp;
use crate::session::Collaborators;
use crate::TransportError;

const FRAME_HANDSHAKE: u8 = 0x16;
const FRAME_DATA: u8 = 0x17;
const SEAL_MASK: u8 = 0x5a;

const FLIGHT_CONNECT_HELLO: u8 = 1;
const FLIGHT_ACCEPT_REPLY: u8 = 2;
const FLIGHT_CONNECT_FINISH: u8 = 3;

const TAG_INIT: u8 = 0x01;
const TAG_INIT_ACK: u8 = 0x02;
const TAG_DATA: u8 = 0x03;
const DATA_HEADER_LEN: usize = 8;

const DEFAULT_ASSOCIATION_PORT: u16 = 5000;

/// One side of an in-process connectivity pair. Datagrams sent on one side
/// surface as events on the other; negotiation completes once both sides
/// have gathered and learned the peer's candidates.
pub struct LoopbackConnectivity {
    index: usize,
    events_tx: mpsc::UnboundedSender<ConnectivityEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectivityEvent>>>,
    peer_tx: Mutex<Option<mpsc::UnboundedSender<ConnectivityEvent>>>,
    shared: Arc<PairShared>,
    credentials: IceCredentials,
    candidates: Vec<String>,
    gathered: AtomicBool,
    have_remote: AtomicBool,
}

struct PairShared {
    inner: Mutex<PairProgress>,
}

struct PairProgress {
    ready: [bool; 2],
    negotiated: bool,
    senders: [Option<mpsc::UnboundedSender<ConnectivityEvent>>; 2],
}

impl LoopbackConnectivity {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let shared = Arc::new(PairShared {
            inner: Mutex::new(PairProgress {
                ready: [false; 2],
                negotiated: false,
                senders: [None, None],
            }),
        });
        let first = Arc::new(Self::new(0, Arc::clone(&shared)));
        let second = Arc::new(Self::new(1, Arc::clone(&shared)));
        {
            let mut progress = shared.inner.lock();
            progress.senders[0] = Some(first.events_tx.clone());
            progress.senders[1] = Some(second.events_tx.clone());
        }
        *first.peer_tx.lock() = Some(second.events_tx.clone());
        *second.peer_tx.lock() = Some(first.events_tx.clone());
        (first, second)
    }

    fn new(index: usize, shared: Arc<PairShared>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut rng = rand::thread_rng();
        let ufrag: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let pwd: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(22)
            .map(char::from)
            .collect();
        let port: u16 = rng.gen_range(50000..60000);
        Self {
            index,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            peer_tx: Mutex::new(None),
            shared,
            credentials: IceCredentials { ufrag, pwd },
            candidates: vec![format!(
                "a=candidate:1 1 udp 2013266431 127.0.0.1 {port} typ host"
            )],
            gathered: AtomicBool::new(false),
            have_remote: AtomicBool::new(false),
        }
    }

    /// Report a fatal connectivity failure, as a failed candidate pair
    /// would.
    pub fn inject_failure(&self, reason: &str) {
        let _ = self
            .events_tx
            .send(ConnectivityEvent::Failed(reason.to_string()));
    }

    fn try_negotiate(&self) {
        if !self.gathered.load(Ordering::Acquire) || !self.have_remote.load(Ordering::Acquire) {
            return;
        }
        let mut progress = self.shared.inner.lock();
        progress.ready[self.index] = true;
        if progress.negotiated || !progress.ready.iter().all(|r| *r) {
            return;
        }
        progress.negotiated = true;
        for sender in progress.senders.iter().flatten() {
            let _ = sender.send(ConnectivityEvent::Negotiated);
        }
    }
}

#[async_trait]
impl Connectivity for LoopbackConnectivity {
    fn start_gathering(&self) -> Result<(), TransportError> {
        for candidate in &self.candidates {
            let _ = self
                .events_tx
                .send(ConnectivityEvent::LocalCandidate(candidate.clone()));
        }
        let _ = self.events_tx.send(ConnectivityEvent::GatheringComplete);
        self.gathered.store(true, Ordering::Release);
        self.try_negotiate();
        Ok(())
    }

    fn local_credentials(&self) -> IceCredentials {
        self.credentials.clone()
    }

    fn local_candidates(&self) -> Vec<String> {
        self.candidates.clone()
    }

    fn ingest_remote_description(&self, description: &str) -> Result<usize, TransportError> {
        let count = sdp::candidate_lines(description).len();
        if count > 0 {
            self.have_remote.store(true, Ordering::Release);
            self.try_negotiate();
        }
        Ok(count)
    }

    fn ingest_remote_candidates(&self, lines: &[String]) -> Result<usize, TransportError> {
        if !lines.is_empty() {
            self.have_remote.store(true, Ordering::Release);
            self.try_negotiate();
        }
        Ok(lines.len())
    }

    async fn send_datagram(&self, datagram: Bytes) -> Result<(), TransportError> {
        let peer = self.peer_tx.lock().clone();
        let Some(peer) = peer else {
            return Err(TransportError::Connectivity("loopback peer missing".into()));
        };
        peer.send(ConnectivityEvent::Datagram(datagram))
            .map_err(|_| TransportError::Connectivity("loopback peer gone".into()))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectivityEvent>> {
        self.events_rx.lock().take()
    }
}

/// A three-flight handshake standing in for the encryption collaborator:
/// connect hello, accept reply, connect finish. Application traffic is
/// framed and masked so ciphertext on the wire differs from plaintext.
pub struct ScriptedHandshake {
    role: Option<HandshakeRole>,
    finished: bool,
    sent_hello: bool,
    pending_flights: VecDeque<u8>,
    outgoing: VecDeque<Bytes>,
    inbound_app: VecDeque<Bytes>,
    fingerprint: String,
}

impl ScriptedHandshake {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let fingerprint = (0..32)
            .map(|_| format!("{:02X}", rng.gen::<u8>()))
            .collect::<Vec<_>>()
            .join(":");
        Self {
            role: None,
            finished: false,
            sent_hello: false,
            pending_flights: VecDeque::new(),
            outgoing: VecDeque::new(),
            inbound_app: VecDeque::new(),
            fingerprint,
        }
    }

    /// A driver that completes on its first step, for tests that only need
    /// the application tunnel.
    pub fn pre_established() -> Self {
        let mut driver = Self::new();
        driver.finished = true;
        driver
    }

    fn take_flight(&mut self, flight: u8) -> bool {
        if let Some(position) = self.pending_flights.iter().position(|f| *f == flight) {
            self.pending_flights.remove(position);
            true
        } else {
            false
        }
    }
}

impl Default for ScriptedHandshake {
    fn default() -> Self {
        Self::new()
    }
}

fn seal(payload: &[u8]) -> Bytes {
    let mut framed = Vec::with_capacity(payload.len() + 1);
    framed.push(FRAME_DATA);
    framed.extend(payload.iter().map(|b| b ^ SEAL_MASK));
    Bytes::from(framed)
}

fn handshake_flight(flight: u8) -> Bytes {
    Bytes::from(vec![FRAME_HANDSHAKE, flight])
}

impl HandshakeDriver for ScriptedHandshake {
    fn set_role(&mut self, role: HandshakeRole) {
        self.role = Some(role);
    }

    fn push_incoming(&mut self, datagram: &[u8]) {
        match datagram.first() {
            Some(&FRAME_HANDSHAKE) if datagram.len() >= 2 => {
                self.pending_flights.push_back(datagram[1]);
            }
            Some(&FRAME_DATA) => {
                let unmasked: Vec<u8> = datagram[1..].iter().map(|b| b ^ SEAL_MASK).collect();
                self.inbound_app.push_back(Bytes::from(unmasked));
            }
            _ => {}
        }
    }

    fn step(&mut self) -> Result<bool, TransportError> {
        let Some(role) = self.role else {
            return Ok(false);
        };
        if self.finished {
            return Ok(true);
        }
        match role {
            HandshakeRole::Connect => {
                if !self.sent_hello {
                    self.outgoing.push_back(handshake_flight(FLIGHT_CONNECT_HELLO));
                    self.sent_hello = true;
                }
                if self.take_flight(FLIGHT_ACCEPT_REPLY) {
                    self.outgoing
                        .push_back(handshake_flight(FLIGHT_CONNECT_FINISH));
                    self.finished = true;
                }
            }
            HandshakeRole::Accept => {
                if self.take_flight(FLIGHT_CONNECT_HELLO) {
                    self.outgoing.push_back(handshake_flight(FLIGHT_ACCEPT_REPLY));
                }
                if self.take_flight(FLIGHT_CONNECT_FINISH) {
                    self.finished = true;
                }
            }
        }
        Ok(self.finished)
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn pull_outgoing(&mut self) -> Option<Bytes> {
        self.outgoing.pop_front()
    }

    fn write(&mut self, plaintext: &[u8]) -> Result<(), TransportError> {
        if !self.finished {
            return Err(TransportError::Handshake(
                "tunnel write before handshake finished".into(),
            ));
        }
        self.outgoing.push_back(seal(plaintext));
        Ok(())
    }

    fn read(&mut self) -> Option<Bytes> {
        self.inbound_app.pop_front()
    }

    fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }
}

/// Ordered in-memory multiplexing engine. The open exchange is a two-frame
/// INIT / INIT-ACK; the INIT carries the port the connector believes it is
/// dialing, so a wrong remote port fails the association the way a real
/// engine would.
#[derive(Clone)]
pub struct InMemoryAssociation {
    state: Arc<Mutex<AssociationState>>,
}

struct AssociationState {
    local_port: u16,
    remote_port: u16,
    side: Option<AssociationSide>,
    established: bool,
    pending_init: Option<u16>,
    outbox: VecDeque<Bytes>,
    events: VecDeque<AssociationEvent>,
}

impl InMemoryAssociation {
    pub fn new() -> Self {
        Self::with_port(DEFAULT_ASSOCIATION_PORT)
    }

    pub fn with_port(local_port: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(AssociationState {
                local_port,
                remote_port: 0,
                side: None,
                established: false,
                pending_init: None,
                outbox: VecDeque::new(),
                events: VecDeque::new(),
            })),
        }
    }

    /// Surface an out-of-band notification, e.g. a stream reset.
    pub fn push_notification(&self, kind: NotificationKind) {
        self.state
            .lock()
            .events
            .push_back(AssociationEvent::Notification(kind));
    }

    pub fn is_established(&self) -> bool {
        self.state.lock().established
    }
}

impl Default for InMemoryAssociation {
    fn default() -> Self {
        Self::new()
    }
}

fn accept_init(state: &mut AssociationState, port: u16) {
    if port != state.local_port {
        state.events.push_back(AssociationEvent::Failed(format!(
            "association init for port {port} but listening on {}",
            state.local_port
        )));
        return;
    }
    state.outbox.push_back(Bytes::from_static(&[TAG_INIT_ACK]));
    state.established = true;
    state.events.push_back(AssociationEvent::Established);
}

impl AssociationEngine for InMemoryAssociation {
    fn local_port(&self) -> u16 {
        self.state.lock().local_port
    }

    fn set_remote_port(&mut self, port: u16) {
        self.state.lock().remote_port = port;
    }

    fn open(&mut self, side: AssociationSide) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.side = Some(side);
        match side {
            AssociationSide::Connect => {
                let mut frame = Vec::with_capacity(3);
                frame.push(TAG_INIT);
                frame.extend_from_slice(&state.remote_port.to_be_bytes());
                state.outbox.push_back(Bytes::from(frame));
            }
            AssociationSide::Accept => {
                if let Some(port) = state.pending_init.take() {
                    accept_init(&mut state, port);
                }
            }
        }
        Ok(())
    }

    fn push_transport(&mut self, bytes: &[u8]) {
        let mut state = self.state.lock();
        match bytes.first() {
            Some(&TAG_INIT) if bytes.len() >= 3 => {
                let port = u16::from_be_bytes([bytes[1], bytes[2]]);
                match state.side {
                    Some(AssociationSide::Accept) => accept_init(&mut state, port),
                    None => state.pending_init = Some(port),
                    Some(AssociationSide::Connect) => {}
                }
            }
            Some(&TAG_INIT_ACK) => {
                if state.side == Some(AssociationSide::Connect) && !state.established {
                    state.established = true;
                    state.events.push_back(AssociationEvent::Established);
                }
            }
            Some(&TAG_DATA) if bytes.len() >= DATA_HEADER_LEN => {
                let sid = u16::from_be_bytes([bytes[1], bytes[2]]);
                let ppid = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
                state.events.push_back(AssociationEvent::Received {
                    payload: Bytes::copy_from_slice(&bytes[DATA_HEADER_LEN..]),
                    sid,
                    ppid,
                });
            }
            _ => {}
        }
    }

    fn pull_transport(&mut self) -> Option<Bytes> {
        self.state.lock().outbox.pop_front()
    }

    fn send(
        &mut self,
        payload: Bytes,
        sid: u16,
        ppid: u32,
        unordered: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.established {
            return Err(TransportError::Association(
                "send before association established".into(),
            ));
        }
        let mut frame = Vec::with_capacity(DATA_HEADER_LEN + payload.len());
        frame.push(TAG_DATA);
        frame.extend_from_slice(&sid.to_be_bytes());
        frame.extend_from_slice(&ppid.to_be_bytes());
        frame.push(u8::from(unordered));
        frame.extend_from_slice(&payload);
        state.outbox.push_back(Bytes::from(frame));
        Ok(())
    }

    fn poll_event(&mut self) -> Option<AssociationEvent> {
        self.state.lock().events.pop_front()
    }
}

/// One end of a fully in-memory session setup.
pub struct LoopbackEnd {
    pub collaborators: Collaborators,
    pub connectivity: Arc<LoopbackConnectivity>,
    pub association: InMemoryAssociation,
}

/// Build collaborator sets for both peers of an in-process session pair.
pub fn loopback_pair() -> (LoopbackEnd, LoopbackEnd) {
    let (connectivity_a, connectivity_b) = LoopbackConnectivity::pair();
    let association_a = InMemoryAssociation::new();
    let association_b = InMemoryAssociation::new();
    let end_a = LoopbackEnd {
        collaborators: Collaborators {
            connectivity: connectivity_a.clone(),
            handshake: Box::new(ScriptedHandshake::new()),
            association: Box::new(association_a.clone()),
        },
        connectivity: connectivity_a,
        association: association_a,
    };
    let end_b = LoopbackEnd {
        collaborators: Collaborators {
            connectivity: connectivity_b.clone(),
            handshake: Box::new(ScriptedHandshake::new()),
            association: Box::new(association_b.clone()),
        },
        connectivity: connectivity_b,
        association: association_b,
    };
    (end_a, end_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_handshake_completes_in_three_flights() {
        let mut connect = ScriptedHandshake::new();
        let mut accept = ScriptedHandshake::new();
        connect.set_role(HandshakeRole::Connect);
        accept.set_role(HandshakeRole::Accept);

        connect.step().unwrap();
        let hello = connect.pull_outgoing().expect("hello");
        accept.push_incoming(&hello);
        accept.step().unwrap();
        let reply = accept.pull_outgoing().expect("reply");
        connect.push_incoming(&reply);
        assert!(connect.step().unwrap());
        let finish = connect.pull_outgoing().expect("finish");
        accept.push_incoming(&finish);
        assert!(accept.step().unwrap());

        connect.write(b"sealed").unwrap();
        let wire = connect.pull_outgoing().unwrap();
        assert_ne!(&wire[1..], b"sealed");
        accept.push_incoming(&wire);
        assert_eq!(accept.read().unwrap().as_ref(), b"sealed");
    }

    #[test]
    fn association_open_exchange_establishes_both_sides() {
        let mut connector = InMemoryAssociation::with_port(5000);
        let mut listener = InMemoryAssociation::with_port(5000);
        connector.set_remote_port(5000);

        listener.open(AssociationSide::Accept).unwrap();
        connector.open(AssociationSide::Connect).unwrap();

        let init = connector.pull_transport().expect("init frame");
        listener.push_transport(&init);
        assert!(matches!(
            listener.poll_event(),
            Some(AssociationEvent::Established)
        ));

        let ack = listener.pull_transport().expect("init ack");
        connector.push_transport(&ack);
        assert!(matches!(
            connector.poll_event(),
            Some(AssociationEvent::Established)
        ));

        connector
            .send(Bytes::from_static(b"hi"), 2, 51, false)
            .unwrap();
        let data = connector.pull_transport().unwrap();
        listener.push_transport(&data);
        match listener.poll_event() {
            Some(AssociationEvent::Received { payload, sid, ppid }) => {
                assert_eq!(payload.as_ref(), b"hi");
                assert_eq!(sid, 2);
                assert_eq!(ppid, 51);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn association_rejects_wrong_port() {
        let mut connector = InMemoryAssociation::with_port(5000);
        let mut listener = InMemoryAssociation::with_port(6000);
        connector.set_remote_port(5000);

        listener.open(AssociationSide::Accept).unwrap();
        connector.open(AssociationSide::Connect).unwrap();
        let init = connector.pull_transport().unwrap();
        listener.push_transport(&init);
        assert!(matches!(
            listener.poll_event(),
            Some(AssociationEvent::Failed(_))
        ));
    }

    #[test]
    fn init_before_listen_is_honored_on_open() {
        let mut connector = InMemoryAssociation::with_port(5000);
        let mut listener = InMemoryAssociation::with_port(5000);
        connector.set_remote_port(5000);

        connector.open(AssociationSide::Connect).unwrap();
        let init = connector.pull_transport().unwrap();
        listener.push_transport(&init);
        assert!(listener.poll_event().is_none());

        listener.open(AssociationSide::Accept).unwrap();
        assert!(matches!(
            listener.poll_event(),
            Some(AssociationEvent::Established)
        ));
    }
}
