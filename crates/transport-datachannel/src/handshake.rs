use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::queue::MessageQueue;
use crate::TransportError;

/// Which side of the encrypted-tunnel handshake this peer performs. Exactly
/// one side connects and one side accepts per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Connect,
    Accept,
}

/// The opaque encryption handshake object. Implementations own the
/// cryptographic state machine; the adapter owns locking and relaying.
pub trait HandshakeDriver: Send {
    fn set_role(&mut self, role: HandshakeRole);
    /// Append raw bytes received from the connectivity layer.
    fn push_incoming(&mut self, datagram: &[u8]);
    /// Advance the handshake. `Ok(true)` once the handshake has finished.
    fn step(&mut self) -> Result<bool, TransportError>;
    fn is_finished(&self) -> bool;
    /// Next pending ciphertext datagram for the connectivity layer, if any.
    fn pull_outgoing(&mut self) -> Option<Bytes>;
    /// Encrypt application bytes into the tunnel.
    fn write(&mut self, plaintext: &[u8]) -> Result<(), TransportError>;
    /// Decrypt the next tunneled application message. `None` means no data
    /// is available yet; that is not an error.
    fn read(&mut self) -> Option<Bytes>;
    /// Fingerprint of the local certificate, for the session description.
    fn fingerprint(&self) -> String;
}

/// Wraps the handshake driver under one adapter-wide lock and relays bytes
/// between the connectivity layer and the association layer. The lock is
/// never held across a call into another adapter.
pub struct HandshakeAdapter {
    driver: Mutex<Box<dyn HandshakeDriver>>,
    established: AtomicBool,
}

impl HandshakeAdapter {
    pub fn new(driver: Box<dyn HandshakeDriver>) -> Self {
        Self {
            driver: Mutex::new(driver),
            established: AtomicBool::new(false),
        }
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    pub fn fingerprint(&self) -> String {
        self.driver.lock().fingerprint()
    }

    pub fn set_role(&self, role: HandshakeRole) {
        self.driver.lock().set_role(role);
    }

    /// Advance the handshake once and move any produced ciphertext into
    /// `ciphertext_out`. Step failures are recoverable: the handshake is
    /// re-stepped on the next inbound datagram.
    pub fn step(&self, ciphertext_out: &MessageQueue<Bytes>) -> Result<bool, TransportError> {
        let mut driver = self.driver.lock();
        let result = driver.step();
        drain_locked(&mut driver, ciphertext_out);
        if driver.is_finished() {
            self.established.store(true, Ordering::Release);
        }
        result
    }

    /// Feed one datagram from the connectivity layer. Before the handshake
    /// completes this steps it; afterwards (including on the very datagram
    /// that completes it) any decrypted application bytes are drained into
    /// `plaintext_out` immediately, so an association accept that is still
    /// pending never stalls early data.
    ///
    /// Returns true when this call transitioned the handshake to complete.
    pub fn ingest_datagram(
        &self,
        datagram: &[u8],
        ciphertext_out: &MessageQueue<Bytes>,
        plaintext_out: &MessageQueue<Bytes>,
    ) -> bool {
        let mut driver = self.driver.lock();
        driver.push_incoming(datagram);

        let mut newly_established = false;
        if !self.established.load(Ordering::Acquire) {
            if driver.is_finished() {
                newly_established = true;
            } else {
                match driver.step() {
                    Ok(finished) => newly_established = finished,
                    Err(err) => {
                        tracing::trace!(
                            target = "datachannel::handshake",
                            error = %err,
                            "handshake step failed; waiting for more data"
                        );
                    }
                }
                drain_locked(&mut driver, ciphertext_out);
            }
            if newly_established {
                self.established.store(true, Ordering::Release);
                tracing::debug!(target = "datachannel::handshake", "handshake complete");
            }
        }

        if self.established.load(Ordering::Acquire) {
            while let Some(plaintext) = driver.read() {
                plaintext_out.push(plaintext);
            }
            drain_locked(&mut driver, ciphertext_out);
        }
        newly_established
    }

    /// Encrypt application bytes and drain the resulting ciphertext. Only
    /// valid once the handshake is complete.
    pub fn write_application(
        &self,
        plaintext: &[u8],
        ciphertext_out: &MessageQueue<Bytes>,
    ) -> Result<(), TransportError> {
        if !self.is_established() {
            return Err(TransportError::Handshake(
                "application write before handshake complete".into(),
            ));
        }
        let mut driver = self.driver.lock();
        driver.write(plaintext)?;
        drain_locked(&mut driver, ciphertext_out);
        Ok(())
    }

    /// Next decrypted application message, if any. A `None` is "no data
    /// yet", never an error.
    pub fn read_application(&self) -> Option<Bytes> {
        if !self.is_established() {
            return None;
        }
        self.driver.lock().read()
    }

    /// Move every pending ciphertext datagram into `ciphertext_out`.
    pub fn drain_outgoing(&self, ciphertext_out: &MessageQueue<Bytes>) {
        drain_locked(&mut self.driver.lock(), ciphertext_out);
    }
}

/// Drains to empty in one call so the connectivity worker never sees a
/// partial flush.
fn drain_locked(driver: &mut Box<dyn HandshakeDriver>, ciphertext_out: &MessageQueue<Bytes>) {
    while let Some(ciphertext) = driver.pull_outgoing() {
        ciphertext_out.push(ciphertext);
    }
}
