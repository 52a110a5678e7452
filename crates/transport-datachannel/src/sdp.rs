use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::connectivity::IceCredentials;
use crate::TransportError;

const SESSION_ID_DIGITS: usize = 16;
/// Stream count advertised on the sctpmap line.
const ADVERTISED_STREAMS: u16 = 1024;

/// The role attribute a description proposes for the encrypted-tunnel
/// handshake: `active` connects, `passive` accepts, `actpass` leaves the
/// choice to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupRole {
    Active,
    Passive,
    ActPass,
}

impl SetupRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SetupRole::Active => "active",
            SetupRole::Passive => "passive",
            SetupRole::ActPass => "actpass",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SetupRole::Active),
            "passive" => Some(SetupRole::Passive),
            "actpass" => Some(SetupRole::ActPass),
            _ => None,
        }
    }
}

/// The parts of a peer's description this layer consumes; the rest is
/// forwarded verbatim to the connectivity collaborator.
#[derive(Debug, Clone)]
pub struct RemoteDescription {
    pub remote_port: u16,
    pub setup: Option<SetupRole>,
    pub raw: String,
}

pub fn random_session_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_ID_DIGITS)
        .map(|i| {
            // No leading zero, matching common session-id conventions.
            let low: u8 = if i == 0 { 1 } else { 0 };
            char::from(b'0' + rng.gen_range(low..10))
        })
        .collect()
}

/// Render the local session description: the application media line carries
/// the local multiplexing-layer port, followed by ICE credentials, the
/// certificate fingerprint, the proposed setup role, and the sctpmap
/// advertisement the peer parses back into its remote port.
pub fn generate_local_description(
    local_port: u16,
    credentials: &IceCredentials,
    fingerprint: &str,
    setup: SetupRole,
) -> String {
    let mut out = String::new();
    out.push_str("v=0\r\n");
    out.push_str(&format!(
        "o=- {} 2 IN IP4 127.0.0.1\r\n",
        random_session_id()
    ));
    out.push_str("s=-\r\n");
    out.push_str("t=0 0\r\n");
    out.push_str("a=msid-semantic: WMS\r\n");
    out.push_str(&format!("m=application 1 DTLS/SCTP {local_port}\r\n"));
    out.push_str("c=IN IP4 0.0.0.0\r\n");
    out.push_str(&format!("a=ice-ufrag:{}\r\n", credentials.ufrag));
    out.push_str(&format!("a=ice-pwd:{}\r\n", credentials.pwd));
    out.push_str(&format!("a=fingerprint:sha-256 {fingerprint}\r\n"));
    out.push_str(&format!("a=setup:{}\r\n", setup.as_str()));
    out.push_str("a=mid:data\r\n");
    out.push_str(&format!(
        "a=sctpmap:{local_port} webrtc-datachannel {ADVERTISED_STREAMS}\r\n"
    ));
    out
}

/// Parse a peer description as untrusted input. Anything without a usable
/// application media line is malformed; unknown lines pass through to the
/// connectivity collaborator untouched.
pub fn parse_remote_description(text: &str) -> Result<RemoteDescription, TransportError> {
    let mut remote_port = None;
    let mut setup = None;
    for line in text.lines().map(|l| l.trim_end_matches('\r')) {
        if let Some(rest) = line.strip_prefix("m=application") {
            let columns: Vec<&str> = rest.split_whitespace().collect();
            let port = columns
                .get(2)
                .and_then(|p| p.parse::<u16>().ok())
                .filter(|p| *p > 0)
                .ok_or_else(|| {
                    TransportError::MalformedDescription(format!(
                        "unusable application media line: {line}"
                    ))
                })?;
            remote_port = Some(port);
        } else if let Some(value) = line.strip_prefix("a=setup:") {
            setup = SetupRole::parse(value);
        }
    }
    let remote_port = remote_port.ok_or_else(|| {
        TransportError::MalformedDescription("missing application media line".into())
    })?;
    Ok(RemoteDescription {
        remote_port,
        setup,
        raw: text.to_string(),
    })
}

/// Extract candidate attribute lines from a description fragment.
pub fn candidate_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| l.starts_with("a=candidate:"))
        .map(|l| l.to_string())
        .collect()
}
