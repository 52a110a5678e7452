use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use crate::association::{AssociationAdapter, AssociationEvent, AssociationSide};
use crate::channel::ChannelRegistry;
use crate::connectivity::{Connectivity, ConnectivityEvent};
use crate::dcep::Dcep;
use crate::handshake::{HandshakeAdapter, HandshakeRole};
use crate::queue::MessageQueue;
use crate::session::{RoleCell, SessionEvent, SessionRole};
use crate::stack::TransportStack;
use crate::TransportError;

/// The ordered bring-up pipeline. Each stage gates the next; `Closed` is
/// terminal and reachable from anywhere via explicit close or a fatal stage
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportStage {
    Idle,
    ConnectivityPending,
    ConnectivityReady,
    HandshakePending,
    HandshakeReady,
    AssociationPending,
    AssociationReady,
    Closed,
}

pub(crate) struct TransportParts {
    pub connectivity: Arc<dyn Connectivity>,
    pub handshake: Arc<HandshakeAdapter>,
    pub association: Arc<AssociationAdapter>,
    pub dcep: Arc<Dcep>,
    pub ciphertext_out: Arc<MessageQueue<Bytes>>,
    pub plaintext_in: Arc<MessageQueue<Bytes>>,
    pub registry: Arc<ChannelRegistry>,
    pub role: Arc<RoleCell>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub shutdown: Arc<AtomicBool>,
    pub stack: Arc<TransportStack>,
    pub poll_interval: Duration,
    pub handshake_deadline: Duration,
}

/// Owns the bring-up state machine and the worker loops pumping each layer
/// boundary: a connectivity pump, an association pump, and the startup
/// sequencer that drives stage transitions. At most one exists per session.
pub struct TransportOrchestrator {
    connectivity: Arc<dyn Connectivity>,
    handshake: Arc<HandshakeAdapter>,
    association: Arc<AssociationAdapter>,
    dcep: Arc<Dcep>,
    ciphertext_out: Arc<MessageQueue<Bytes>>,
    plaintext_in: Arc<MessageQueue<Bytes>>,
    registry: Arc<ChannelRegistry>,
    role: Arc<RoleCell>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: Arc<AtomicBool>,
    stack: Arc<TransportStack>,
    stage: Mutex<TransportStage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    poll_interval: Duration,
    handshake_deadline: Duration,
}

impl TransportOrchestrator {
    pub(crate) fn new(parts: TransportParts) -> Arc<Self> {
        Arc::new(Self {
            connectivity: parts.connectivity,
            handshake: parts.handshake,
            association: parts.association,
            dcep: parts.dcep,
            ciphertext_out: parts.ciphertext_out,
            plaintext_in: parts.plaintext_in,
            registry: parts.registry,
            role: parts.role,
            events: parts.events,
            shutdown: parts.shutdown,
            stack: parts.stack,
            stage: Mutex::new(TransportStage::Idle),
            tasks: Mutex::new(Vec::new()),
            poll_interval: parts.poll_interval,
            handshake_deadline: parts.handshake_deadline,
        })
    }

    /// Kick off candidate gathering and spawn the worker loops. Requires a
    /// running tokio runtime.
    pub(crate) fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        let handle = Handle::try_current().map_err(|_| {
            TransportError::Setup("session transport requires a running tokio runtime".into())
        })?;
        let events = self.connectivity.take_events().ok_or_else(|| {
            TransportError::Setup("connectivity event stream already taken".into())
        })?;

        self.set_stage(TransportStage::ConnectivityPending);
        self.connectivity.start_gathering()?;

        let mut tasks = self.tasks.lock();
        tasks.push(handle.spawn(Arc::clone(self).run_connectivity_pump(events)));
        tasks.push(handle.spawn(Arc::clone(self).run_association_pump()));
        tasks.push(handle.spawn(Arc::clone(self).run_startup_sequencer()));
        Ok(())
    }

    pub fn stage(&self) -> TransportStage {
        *self.stage.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.stage() == TransportStage::Closed
    }

    pub(crate) fn connectivity(&self) -> &Arc<dyn Connectivity> {
        &self.connectivity
    }

    pub(crate) fn handshake(&self) -> &Arc<HandshakeAdapter> {
        &self.handshake
    }

    pub(crate) fn association(&self) -> &Arc<AssociationAdapter> {
        &self.association
    }

    pub(crate) fn dcep(&self) -> &Arc<Dcep> {
        &self.dcep
    }

    /// Set the cancellation flag and wait, bounded, for every worker loop
    /// to observe it. In-flight buffers drain through the loops' own exits
    /// rather than by aborting tasks.
    pub(crate) async fn close(&self, close_timeout: Duration) {
        self.shutdown.store(true, Ordering::Release);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if timeout(close_timeout, task).await.is_err() {
                tracing::warn!(
                    target = "datachannel::orchestrator",
                    "worker loop did not exit within the close timeout"
                );
            }
        }
        if self.transition_closed() {
            let _ = self.events.send(SessionEvent::Closed { reason: None });
        }
    }

    fn set_stage(&self, next: TransportStage) {
        let mut stage = self.stage.lock();
        if *stage == TransportStage::Closed {
            return;
        }
        tracing::debug!(
            target = "datachannel::orchestrator",
            from = ?*stage,
            to = ?next,
            "transport stage transition"
        );
        *stage = next;
    }

    fn advance_stage_if(&self, from: TransportStage, to: TransportStage) -> bool {
        let mut stage = self.stage.lock();
        if *stage != from {
            return false;
        }
        tracing::debug!(
            target = "datachannel::orchestrator",
            from = ?from,
            to = ?to,
            "transport stage transition"
        );
        *stage = to;
        true
    }

    fn transition_closed(&self) -> bool {
        let mut stage = self.stage.lock();
        if *stage == TransportStage::Closed {
            return false;
        }
        *stage = TransportStage::Closed;
        true
    }

    /// Fatal stage failure: terminal state, cancellation of every loop, and
    /// one error notification to the application.
    fn fail(&self, reason: String) {
        let first = self.transition_closed();
        self.shutdown.store(true, Ordering::Release);
        if first {
            tracing::warn!(
                target = "datachannel::orchestrator",
                reason = %reason,
                "transport failed"
            );
            let _ = self.events.send(SessionEvent::Closed {
                reason: Some(reason),
            });
        }
    }

    fn cancelled(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Drain the ciphertext queue into the connectivity layer. Send errors
    /// drop the datagram with a diagnostic; datagram transport is lossy by
    /// contract.
    async fn flush_ciphertext(&self) {
        while let Some(datagram) = self.ciphertext_out.pop() {
            if let Err(err) = self.connectivity.send_datagram(datagram).await {
                tracing::warn!(
                    target = "datachannel::orchestrator",
                    error = %err,
                    "failed to send datagram"
                );
            }
        }
    }

    /// Poll `condition` at the shared cadence until it holds or the session
    /// is cancelled.
    async fn wait_until(&self, condition: impl Fn() -> bool) -> bool {
        loop {
            if self.cancelled() {
                return false;
            }
            if condition() {
                return true;
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Worker: relays between the connectivity layer and the handshake
    /// adapter in both directions.
    async fn run_connectivity_pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ConnectivityEvent>,
    ) {
        let _ticket = self.stack.begin_drain();
        loop {
            if self.cancelled() {
                break;
            }
            self.flush_ciphertext().await;
            match timeout(self.poll_interval, events.recv()).await {
                Err(_) => continue,
                Ok(None) => {
                    tracing::debug!(
                        target = "datachannel::orchestrator",
                        "connectivity event stream ended"
                    );
                    break;
                }
                Ok(Some(event)) => self.handle_connectivity_event(event).await,
            }
        }
        tracing::trace!(target = "datachannel::orchestrator", "connectivity pump exited");
    }

    async fn handle_connectivity_event(&self, event: ConnectivityEvent) {
        match event {
            ConnectivityEvent::LocalCandidate(candidate) => {
                let _ = self.events.send(SessionEvent::LocalCandidate(candidate));
            }
            ConnectivityEvent::GatheringComplete => {
                // Gathering completion is informational; only pair
                // negotiation opens the next stage.
                tracing::debug!(
                    target = "datachannel::orchestrator",
                    "candidate gathering complete"
                );
            }
            ConnectivityEvent::Negotiated => {
                self.advance_stage_if(
                    TransportStage::ConnectivityPending,
                    TransportStage::ConnectivityReady,
                );
            }
            ConnectivityEvent::Failed(reason) => {
                self.fail(format!("connectivity failure: {reason}"));
            }
            ConnectivityEvent::Datagram(datagram) => {
                self.handshake
                    .ingest_datagram(&datagram, &self.ciphertext_out, &self.plaintext_in);
                self.flush_ciphertext().await;
            }
        }
    }

    /// Worker: relays between the handshake adapter's decrypted stream and
    /// the multiplexing engine, and dispatches engine events.
    async fn run_association_pump(self: Arc<Self>) {
        let _ticket = self.stack.begin_drain();
        loop {
            if self.cancelled() {
                break;
            }
            let mut did_work = false;

            for bytes in self.plaintext_in.drain() {
                self.association.push_transport(&bytes);
                did_work = true;
            }

            for frame in self.association.pull_transport_frames() {
                did_work = true;
                if let Err(err) = self
                    .handshake
                    .write_application(&frame, &self.ciphertext_out)
                {
                    tracing::warn!(
                        target = "datachannel::orchestrator",
                        error = %err,
                        "failed to seal association frame into the tunnel"
                    );
                }
            }

            for event in self.association.poll_events() {
                did_work = true;
                match event {
                    AssociationEvent::Established => {
                        tracing::debug!(
                            target = "datachannel::orchestrator",
                            "association established"
                        );
                        self.association.mark_established();
                    }
                    AssociationEvent::Failed(reason) => {
                        self.fail(format!("association failure: {reason}"));
                    }
                    AssociationEvent::Received { payload, sid, ppid } => {
                        self.association.on_received(&self.dcep, payload, sid, ppid);
                    }
                    AssociationEvent::Notification(kind) => {
                        self.association.on_notification(&self.dcep, &kind);
                    }
                }
            }

            if !did_work {
                sleep(self.poll_interval).await;
            }
        }
        tracing::trace!(target = "datachannel::orchestrator", "association pump exited");
    }

    /// Worker: drives the staged bring-up. Also the dedicated worker for
    /// the accept-side association open, which therefore never stalls the
    /// pump loops.
    async fn run_startup_sequencer(self: Arc<Self>) {
        let _ticket = self.stack.begin_drain();

        if !self
            .wait_until(|| self.stage() >= TransportStage::ConnectivityReady)
            .await
        {
            return;
        }

        // Handshake stage. Role resolution is final once connectivity is
        // negotiated: handshake role, association side, and stream parity
        // all derive from it.
        let role = self.role.current();
        let handshake_role = match role {
            SessionRole::Initiator => HandshakeRole::Connect,
            SessionRole::Responder => HandshakeRole::Accept,
        };
        self.handshake.set_role(handshake_role);
        self.set_stage(TransportStage::HandshakePending);
        if let Err(err) = self.handshake.step(&self.ciphertext_out) {
            tracing::trace!(
                target = "datachannel::orchestrator",
                error = %err,
                "initial handshake step incomplete"
            );
        }
        self.flush_ciphertext().await;

        let deadline = Instant::now() + self.handshake_deadline;
        loop {
            if self.cancelled() {
                return;
            }
            if self.handshake.is_established() {
                break;
            }
            if Instant::now() >= deadline {
                self.fail("handshake deadline elapsed".into());
                return;
            }
            sleep(self.poll_interval).await;
        }
        self.set_stage(TransportStage::HandshakeReady);

        // Association stage.
        self.registry.seed_parity(role);
        let side = match role {
            SessionRole::Initiator => AssociationSide::Connect,
            SessionRole::Responder => AssociationSide::Accept,
        };
        self.set_stage(TransportStage::AssociationPending);
        if let Err(err) = self.association.open(side) {
            self.fail(format!("association open failed: {err}"));
            return;
        }
        if !self.wait_until(|| self.association.is_established()).await {
            return;
        }

        // Readiness transition: the deferred sends flush, in original
        // order, before any newer send is admitted. The association pump
        // seals the resulting engine frames into the tunnel.
        match self.association.mark_ready() {
            Ok(flushed) => {
                tracing::debug!(
                    target = "datachannel::orchestrator",
                    flushed,
                    "association ready"
                );
                self.set_stage(TransportStage::AssociationReady);
                let _ = self.events.send(SessionEvent::Connected);
            }
            Err(err) => {
                self.fail(format!("deferred send flush failed: {err}"));
                return;
            }
        }
        self.flush_ciphertext().await;
        tracing::trace!(target = "datachannel::orchestrator", "startup sequencer exited");
    }
}
