use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::association::{AssociationAdapter, AssociationEngine, OutboundPath};
use crate::channel::{Channel, ChannelRegistry, Reliability};
use crate::config::SessionConfig;
use crate::connectivity::Connectivity;
use crate::dcep::Dcep;
use crate::handshake::{HandshakeAdapter, HandshakeDriver};
use crate::orchestrator::{TransportOrchestrator, TransportParts, TransportStage};
use crate::queue::MessageQueue;
use crate::sdp::{self, SetupRole};
use crate::stack::{StackGuard, TransportStack};
use crate::TransportError;

/// Which peer this session is. The initiator offers first, performs the
/// connect side of both handshakes, and owns even stream ids; the responder
/// accepts and owns odd ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecycle {
    Created,
    Establishing,
    Established,
    Closing,
    Closed,
}

/// Result of ingesting a peer description that parsed successfully: either
/// the description carried candidates and negotiation can proceed, or
/// candidates are still pending. Malformed text is the third outcome,
/// reported as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionOutcome {
    CandidatesPending,
    Ready,
}

/// Notifications delivered to the application in place of re-entrant
/// callbacks, in the order the owning worker loops produced them.
#[derive(Debug)]
pub enum SessionEvent {
    LocalCandidate(String),
    ChannelOpened(Channel),
    Connected,
    Closed { reason: Option<String> },
}

/// The external subsystems a session sequences: connectivity checking,
/// the encryption handshake, and the multiplexing engine.
pub struct Collaborators {
    pub connectivity: Arc<dyn Connectivity>,
    pub handshake: Box<dyn HandshakeDriver>,
    pub association: Box<dyn AssociationEngine>,
}

/// Shared role state with single-flip resolution: the first description
/// proposes a role, and the peer's setup attribute may override it at most
/// once per negotiation.
pub(crate) struct RoleCell {
    inner: Mutex<RoleState>,
}

struct RoleState {
    role: SessionRole,
    flipped: bool,
}

impl RoleCell {
    fn new(initial: SessionRole) -> Self {
        Self {
            inner: Mutex::new(RoleState {
                role: initial,
                flipped: false,
            }),
        }
    }

    pub(crate) fn current(&self) -> SessionRole {
        self.inner.lock().role
    }

    /// Apply a peer's setup attribute. An `active` peer takes the connect
    /// side from a proposed initiator; a `passive` peer pushes it onto a
    /// proposed responder; `actpass` states no preference.
    pub(crate) fn apply_setup(&self, setup: SetupRole) -> Option<SessionRole> {
        let mut state = self.inner.lock();
        let flip_to = match (setup, state.role) {
            (SetupRole::Active, SessionRole::Initiator) => Some(SessionRole::Responder),
            (SetupRole::Passive, SessionRole::Responder) => Some(SessionRole::Initiator),
            _ => None,
        };
        match flip_to {
            Some(role) if !state.flipped => {
                state.role = role;
                state.flipped = true;
                Some(role)
            }
            Some(_) => {
                tracing::trace!(
                    target = "datachannel::session",
                    "ignoring additional role flip"
                );
                None
            }
            None => None,
        }
    }
}

pub struct SessionBuilder {
    config: SessionConfig,
    collaborators: Option<Collaborators>,
    stack: Option<Arc<TransportStack>>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            collaborators: None,
            stack: None,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    pub fn stack(mut self, stack: Arc<TransportStack>) -> Self {
        self.stack = Some(stack);
        self
    }

    pub fn build(self) -> Result<Session, TransportError> {
        let collaborators = self.collaborators.ok_or_else(|| {
            TransportError::Setup("session requires transport collaborators".into())
        })?;
        let stack = self.stack.unwrap_or_else(TransportStack::global);
        let stack_guard = stack.acquire();
        let role = self
            .config
            .preferred_role
            .unwrap_or(SessionRole::Initiator);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Session {
            config: self.config,
            role: Arc::new(RoleCell::new(role)),
            registry: Arc::new(ChannelRegistry::new(role)),
            transport: Mutex::new(None),
            collaborators: Mutex::new(Some(collaborators)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown: Arc::new(AtomicBool::new(false)),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stack,
            _stack_guard: stack_guard,
        })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer-to-peer data-channel session. The transport beneath it is
/// created lazily, on the first description generated or ingested, and torn
/// down exactly once.
pub struct Session {
    config: SessionConfig,
    role: Arc<RoleCell>,
    registry: Arc<ChannelRegistry>,
    transport: Mutex<Option<Arc<TransportOrchestrator>>>,
    collaborators: Mutex<Option<Collaborators>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    shutdown: Arc<AtomicBool>,
    closing: AtomicBool,
    closed: AtomicBool,
    stack: Arc<TransportStack>,
    _stack_guard: StackGuard,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn role(&self) -> SessionRole {
        self.role.current()
    }

    pub fn lifecycle(&self) -> SessionLifecycle {
        if self.closed.load(Ordering::Acquire) {
            return SessionLifecycle::Closed;
        }
        if self.closing.load(Ordering::Acquire) {
            return SessionLifecycle::Closing;
        }
        match self.transport.lock().as_ref() {
            None => SessionLifecycle::Created,
            Some(transport) => match transport.stage() {
                TransportStage::AssociationReady => SessionLifecycle::Established,
                TransportStage::Closed => SessionLifecycle::Closed,
                _ => SessionLifecycle::Establishing,
            },
        }
    }

    /// Current bring-up stage, once the transport exists.
    pub fn transport_stage(&self) -> Option<TransportStage> {
        self.transport.lock().as_ref().map(|t| t.stage())
    }

    /// The session event stream, yielded once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    /// Render the local session description, creating the transport on
    /// first use.
    pub fn local_description(&self) -> Result<String, TransportError> {
        let transport = self.ensure_transport()?;
        let setup = match self.role.current() {
            SessionRole::Initiator => SetupRole::Active,
            SessionRole::Responder => SetupRole::Passive,
        };
        Ok(sdp::generate_local_description(
            transport.association().local_port(),
            &transport.connectivity().local_credentials(),
            &transport.handshake().fingerprint(),
            setup,
        ))
    }

    /// Candidate lines gathered so far, one per line.
    pub fn local_candidate_description(&self) -> Result<String, TransportError> {
        let transport = self.ensure_transport()?;
        let mut out = String::new();
        for candidate in transport.connectivity().local_candidates() {
            out.push_str(&candidate);
            out.push_str("\r\n");
        }
        Ok(out)
    }

    /// Ingest the peer's description. Malformed text errors without side
    /// effects on the registry or the role; otherwise the association's
    /// remote port and the resolved role are updated and the text goes to
    /// the connectivity collaborator.
    pub fn ingest_remote_description(
        &self,
        description: &str,
    ) -> Result<DescriptionOutcome, TransportError> {
        let transport = self.ensure_transport()?;
        let parsed = sdp::parse_remote_description(description)?;
        if let Some(setup) = parsed.setup {
            if let Some(role) = self.role.apply_setup(setup) {
                tracing::debug!(
                    target = "datachannel::session",
                    role = ?role,
                    "session role flipped by remote setup attribute"
                );
                self.registry.seed_parity(role);
            }
        }
        transport.association().set_remote_port(parsed.remote_port);
        let candidates = transport
            .connectivity()
            .ingest_remote_description(&parsed.raw)?;
        Ok(if candidates > 0 {
            DescriptionOutcome::Ready
        } else {
            DescriptionOutcome::CandidatesPending
        })
    }

    /// Ingest candidate lines received out of band. Requires the transport
    /// to exist already.
    pub fn ingest_remote_candidates(&self, candidates: &str) -> Result<usize, TransportError> {
        let transport = self
            .transport
            .lock()
            .clone()
            .ok_or(TransportError::NotInitialized)?;
        let lines = sdp::candidate_lines(candidates);
        transport.connectivity().ingest_remote_candidates(&lines)
    }

    /// Open a channel toward the peer. Returns immediately with the handle
    /// in `Connecting` state; the peer's acknowledgment flips it open. The
    /// OPEN request itself rides the deferred-send path when the
    /// association is not yet ready.
    pub fn open_channel(
        &self,
        label: &str,
        protocol: &str,
        reliability: Reliability,
        priority: u16,
    ) -> Result<Channel, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::SessionClosed);
        }
        let transport = self.ensure_transport()?;
        if transport.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        transport
            .dcep()
            .open_local(label, protocol, reliability, priority)
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.registry.channels()
    }

    /// Drive the session until it reaches its terminal state.
    pub async fn run_until_closed(&self) {
        loop {
            if self.lifecycle() == SessionLifecycle::Closed {
                return;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Close the session: set the shared cancellation flag, then wait,
    /// bounded, for every worker loop to observe it before tearing the
    /// transport down. Idempotent.
    pub async fn close(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.store(true, Ordering::Release);
        let transport = self.transport.lock().clone();
        match transport {
            Some(transport) => transport.close(self.config.close_timeout).await,
            None => {
                let _ = self.events_tx.send(SessionEvent::Closed { reason: None });
            }
        }
        self.closed.store(true, Ordering::Release);
        self.closing.store(false, Ordering::Release);
    }

    fn ensure_transport(&self) -> Result<Arc<TransportOrchestrator>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::SessionClosed);
        }
        let mut slot = self.transport.lock();
        if let Some(transport) = slot.as_ref() {
            return Ok(Arc::clone(transport));
        }
        let collaborators = self.collaborators.lock().take().ok_or_else(|| {
            TransportError::Setup("transport collaborators already consumed".into())
        })?;

        let ciphertext_out = Arc::new(MessageQueue::new());
        let plaintext_in = Arc::new(MessageQueue::new());
        let handshake = Arc::new(HandshakeAdapter::new(collaborators.handshake));
        let association = Arc::new(AssociationAdapter::new(collaborators.association));
        let outbound = OutboundPath::new(Arc::clone(&association), Arc::clone(&self.shutdown));
        let dcep = Arc::new(Dcep::new(
            Arc::clone(&self.registry),
            outbound,
            self.events_tx.clone(),
        ));

        let orchestrator = TransportOrchestrator::new(TransportParts {
            connectivity: collaborators.connectivity,
            handshake,
            association,
            dcep,
            ciphertext_out,
            plaintext_in,
            registry: Arc::clone(&self.registry),
            role: Arc::clone(&self.role),
            events: self.events_tx.clone(),
            shutdown: Arc::clone(&self.shutdown),
            stack: Arc::clone(&self.stack),
            poll_interval: self.config.poll_interval,
            handshake_deadline: self.config.handshake_deadline,
        });
        orchestrator.start()?;
        *slot = Some(Arc::clone(&orchestrator));
        Ok(orchestrator)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Loops observe the flag within one polling interval; the stack
        // guard's release then waits for their drain tickets.
        self.shutdown.store(true, Ordering::Release);
    }
}
