//! Envelope wire format and channel establishment
//!
//! Both transports speak the same wire format: one JSON envelope per line.
//! The relay never interprets payloads; it forwards whole lines keyed by the
//! session token carried in each envelope.

use super::session::SessionToken;
use super::RelayError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// One relayed message
///
/// Sequence numbers are monotonic per session in each direction; receivers
/// drop anything at or below the last applied number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub token: String,
    pub seq: u64,
    pub payload: EnvelopePayload,
}

/// Envelope payload kinds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EnvelopePayload {
    /// Session announcement; doubles as the relay join message
    Hello,
    /// Liveness beacon
    Heartbeat,
    /// Application data, opaque to the channel
    Data { value: serde_json::Value },
}

/// Reader half of an established channel
pub type ChannelLines = Lines<BufReader<OwnedReadHalf>>;

/// Writer half of an established channel
pub type ChannelWriter = OwnedWriteHalf;

/// Encode an envelope as one newline-terminated JSON line
pub fn encode_line(envelope: &Envelope) -> Result<String, RelayError> {
    let mut line = serde_json::to_string(envelope)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line into an envelope
///
/// A line that fails to parse is a protocol violation from the peer and
/// surfaces as a codec error rather than being skipped.
pub fn decode_line(line: &str) -> Result<Envelope, RelayError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Write one envelope
pub async fn write_envelope(
    writer: &mut ChannelWriter,
    envelope: &Envelope,
) -> Result<(), RelayError> {
    let line = encode_line(envelope)?;
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Read the next envelope; None on a cleanly closed connection
///
/// Line reads are cancel safe, so this can sit inside a select loop without
/// losing partial input.
pub async fn next_envelope(lines: &mut ChannelLines) -> Result<Option<Envelope>, RelayError> {
    match lines.next_line().await? {
        None => Ok(None),
        Some(line) => decode_line(&line).map(Some),
    }
}

/// Split an established stream into the channel halves
pub fn into_channel(stream: TcpStream) -> (ChannelLines, ChannelWriter) {
    let (read_half, write_half) = stream.into_split();
    (BufReader::new(read_half).lines(), write_half)
}

/// Direct transport: wait for the companion to reach our listener
pub async fn accept_companion(listener: &TcpListener) -> Result<TcpStream, RelayError> {
    let (stream, peer) = listener.accept().await?;
    log::info!("Companion connected from {}", peer);
    Ok(stream)
}

/// Relayed transport: dial out to the relay and announce the session
///
/// The Hello envelope carries the token the relay uses to match the two
/// ends of the session.
pub async fn dial_relay(
    relay_addr: &str,
    token: &SessionToken,
) -> Result<TcpStream, RelayError> {
    log::info!("Connecting to relay at {}", relay_addr);
    let mut stream = TcpStream::connect(relay_addr).await?;

    let hello = Envelope {
        token: token.as_str().to_string(),
        seq: 0,
        payload: EnvelopePayload::Hello,
    };
    let line = encode_line(&hello)?;
    stream.write_all(line.as_bytes()).await?;

    Ok(stream)
}
