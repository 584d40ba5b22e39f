//! Pairing sessions, tokens and connection descriptors
//!
//! The descriptor is the out-of-band half of the handshake: rendered as a
//! QR code by the presentation layer and scanned by the companion device.

use super::RelayError;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

/// Random per-session token; never resumed across sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Generate a fresh 32-byte token
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Parse a token received out of band
    pub fn parse(s: &str) -> Result<Self, RelayError> {
        let valid = s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
        if !valid {
            return Err(RelayError::InvalidDescriptor(format!(
                "malformed session token '{}'",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the companion reaches this client
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PairingTransport {
    /// Companion connects straight to our listening socket
    Direct,
    /// Both ends dial out to the relay service
    Relayed,
}

impl PairingTransport {
    fn mode_str(&self) -> &'static str {
        match self {
            PairingTransport::Direct => "direct",
            PairingTransport::Relayed => "relay",
        }
    }
}

/// Channel state as observed by the presentation layer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PairingState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Connection descriptor for out-of-band transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingDescriptor {
    /// host:port the companion should reach (ours or the relay's)
    pub endpoint: String,
    pub token: SessionToken,
    pub transport: PairingTransport,
}

impl PairingDescriptor {
    /// Render as a sablepair:// URI
    pub fn encode(&self) -> String {
        format!(
            "sablepair://{}/{}?mode={}",
            self.endpoint,
            self.token,
            self.transport.mode_str()
        )
    }

    /// Parse a sablepair:// URI
    pub fn parse(s: &str) -> Result<Self, RelayError> {
        let url = Url::parse(s)
            .map_err(|e| RelayError::InvalidDescriptor(format!("{}: {}", s, e)))?;

        if url.scheme() != "sablepair" {
            return Err(RelayError::InvalidDescriptor(format!(
                "unexpected scheme '{}'",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| RelayError::InvalidDescriptor("missing host".to_string()))?;
        let port = url
            .port()
            .ok_or_else(|| RelayError::InvalidDescriptor("missing port".to_string()))?;

        let token_str = url
            .path_segments()
            .and_then(|mut segments| segments.next())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RelayError::InvalidDescriptor("missing token".to_string()))?;
        let token = SessionToken::parse(token_str)?;

        let transport = match url
            .query_pairs()
            .find(|(k, _)| k == "mode")
            .map(|(_, v)| v.to_string())
            .as_deref()
        {
            Some("relay") => PairingTransport::Relayed,
            Some("direct") | None => PairingTransport::Direct,
            Some(other) => {
                return Err(RelayError::InvalidDescriptor(format!(
                    "unknown mode '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            endpoint: format!("{}:{}", host, port),
            token,
            transport,
        })
    }
}

/// A live pairing session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingSession {
    pub token: SessionToken,
    pub transport: PairingTransport,
    /// Unix timestamp of the last envelope from the companion
    pub peer_last_seen: u64,
    pub established_at: u64,
}

impl PairingSession {
    pub fn new(token: SessionToken, transport: PairingTransport) -> Self {
        let now = unix_now();
        Self {
            token,
            transport,
            peer_last_seen: now,
            established_at: now,
        }
    }

    /// Record companion activity
    pub fn touch(&mut self) {
        self.peer_last_seen = unix_now();
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_generation_is_unique_and_parseable() {
        let a = SessionToken::generate();
        let b = SessionToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(SessionToken::parse(a.as_str()).unwrap(), a);
    }

    #[test]
    fn test_token_parse_rejects_garbage() {
        assert!(SessionToken::parse("").is_err());
        assert!(SessionToken::parse("zzzz").is_err());
        assert!(SessionToken::parse(&"A".repeat(64)).is_err());
        assert!(SessionToken::parse(&"g".repeat(64)).is_err());
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let descriptor = PairingDescriptor {
            endpoint: "192.168.1.20:8777".to_string(),
            token: SessionToken::generate(),
            transport: PairingTransport::Direct,
        };

        let encoded = descriptor.encode();
        assert!(encoded.starts_with("sablepair://192.168.1.20:8777/"));
        assert!(encoded.ends_with("?mode=direct"));

        let parsed = PairingDescriptor::parse(&encoded).unwrap();
        assert_eq!(parsed, descriptor);
    }

    #[test]
    fn test_descriptor_relay_mode() {
        let descriptor = PairingDescriptor {
            endpoint: "relay.sablewallet.org:8777".to_string(),
            token: SessionToken::generate(),
            transport: PairingTransport::Relayed,
        };
        let parsed = PairingDescriptor::parse(&descriptor.encode()).unwrap();
        assert_eq!(parsed.transport, PairingTransport::Relayed);
    }

    #[test]
    fn test_descriptor_rejects_wrong_scheme() {
        let token = SessionToken::generate();
        let uri = format!("https://example.com:1234/{}", token);
        assert!(PairingDescriptor::parse(&uri).is_err());
    }

    #[test]
    fn test_descriptor_rejects_missing_token() {
        assert!(PairingDescriptor::parse("sablepair://10.0.0.2:8777/").is_err());
        assert!(PairingDescriptor::parse("sablepair://10.0.0.2:8777").is_err());
    }
}
