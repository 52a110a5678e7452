use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::TransportError;

/// Local ICE credentials advertised in the session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

/// Everything the connectivity collaborator reports, in arrival order.
/// Gathering completion and pair negotiation are distinct signals: only
/// `Negotiated` authorizes the handshake stage.
#[derive(Debug)]
pub enum ConnectivityEvent {
    LocalCandidate(String),
    GatheringComplete,
    Negotiated,
    Failed(String),
    Datagram(Bytes),
}

/// The connectivity collaborator: candidate gathering, path validation, and
/// raw datagram transport between the peers. Consumed opaquely; this crate
/// only sequences around its events.
#[async_trait]
pub trait Connectivity: Send + Sync {
    fn start_gathering(&self) -> Result<(), TransportError>;
    fn local_credentials(&self) -> IceCredentials;
    fn local_candidates(&self) -> Vec<String>;
    /// Feed the peer's description. Returns the number of candidates it
    /// carried; zero means candidates are still pending.
    fn ingest_remote_description(&self, description: &str) -> Result<usize, TransportError>;
    fn ingest_remote_candidates(&self, lines: &[String]) -> Result<usize, TransportError>;
    async fn send_datagram(&self, datagram: Bytes) -> Result<(), TransportError>;
    /// The event stream, yielded once; `None` on later calls.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectivityEvent>>;
}
