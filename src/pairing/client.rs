//! Pairing channel client
//!
//! Runs one session at a time: handshake, heartbeats, sequence-ordered
//! delivery and liveness tracking. Both transports share this loop; only
//! connection establishment differs. A lost session is never resumed, the
//! user pairs again with a fresh token.

use super::session::{
    PairingDescriptor, PairingSession, PairingState, PairingTransport, SessionToken,
};
use super::transport::{self, ChannelLines, ChannelWriter, Envelope, EnvelopePayload};
use super::RelayError;
use crate::events::{AppEvent, EventBus};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Channel configuration
#[derive(Debug, Clone)]
pub struct PairingConfig {
    pub transport: PairingTransport,
    /// Direct mode: where to listen; port 0 picks an ephemeral port
    pub listen_addr: String,
    /// Direct mode: host advertised in the descriptor (LAN address);
    /// falls back to the bound address
    pub public_host: Option<String>,
    /// Relayed mode: the relay service endpoint
    pub relay_addr: String,
    pub heartbeat_interval: Duration,
    /// No envelope for this long means the peer is gone
    pub liveness_timeout: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            transport: PairingTransport::Direct,
            listen_addr: "0.0.0.0:0".to_string(),
            public_host: None,
            relay_addr: "relay.sablewallet.org:8777".to_string(),
            heartbeat_interval: Duration::from_secs(15),
            liveness_timeout: Duration::from_secs(45),
        }
    }
}

/// Client side of the companion pairing channel
pub struct PairingClient {
    state_rx: watch::Receiver<PairingState>,
    session: Arc<Mutex<Option<PairingSession>>>,
    outbound_tx: mpsc::UnboundedSender<Value>,
    inbound_tx: broadcast::Sender<Value>,
    shutdown: watch::Sender<bool>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PairingClient {
    /// Start a pairing attempt and return the descriptor to show the user
    ///
    /// The returned client is `Connecting` until a companion completes the
    /// handshake with the session token from the descriptor.
    pub async fn begin(
        config: PairingConfig,
        events: EventBus,
    ) -> Result<(Self, PairingDescriptor), RelayError> {
        let token = SessionToken::generate();

        let (listener, endpoint) = match config.transport {
            PairingTransport::Direct => {
                let listener = TcpListener::bind(&config.listen_addr).await?;
                let local = listener.local_addr()?;
                let host = match &config.public_host {
                    Some(host) => host.clone(),
                    None if local.ip().is_unspecified() => "127.0.0.1".to_string(),
                    None => local.ip().to_string(),
                };
                (Some(listener), format!("{}:{}", host, local.port()))
            }
            PairingTransport::Relayed => (None, config.relay_addr.clone()),
        };

        let descriptor = PairingDescriptor {
            endpoint,
            token: token.clone(),
            transport: config.transport,
        };

        let (state_tx, state_rx) = watch::channel(PairingState::Connecting);
        events.emit(AppEvent::PairingStateChanged {
            state: PairingState::Connecting,
        });

        let session: Arc<Mutex<Option<PairingSession>>> = Arc::new(Mutex::new(None));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, _) = broadcast::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        log::info!(
            "Pairing started ({:?} via {})",
            config.transport,
            descriptor.endpoint
        );

        let worker = tokio::spawn(run_session(
            config,
            listener,
            token,
            state_tx,
            Arc::clone(&session),
            outbound_rx,
            inbound_tx.clone(),
            shutdown_rx,
            events,
        ));

        Ok((
            Self {
                state_rx,
                session,
                outbound_tx,
                inbound_tx,
                shutdown: shutdown_tx,
                worker: tokio::sync::Mutex::new(Some(worker)),
            },
            descriptor,
        ))
    }

    /// Queue a payload for the companion
    ///
    /// Payloads queued before the handshake completes are delivered once the
    /// session is up.
    pub fn send(&self, payload: Value) -> Result<(), RelayError> {
        self.outbound_tx
            .send(payload)
            .map_err(|_| RelayError::ChannelClosed)
    }

    /// Current channel state
    pub fn state(&self) -> PairingState {
        *self.state_rx.borrow()
    }

    /// Subscribe to channel state replacements
    pub fn subscribe_state(&self) -> watch::Receiver<PairingState> {
        self.state_rx.clone()
    }

    /// Subscribe to payloads received from the companion
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Value> {
        self.inbound_tx.subscribe()
    }

    /// Read-only copy of the live session, if any
    pub fn session(&self) -> Option<PairingSession> {
        self.session.lock().unwrap().clone()
    }

    /// Tear the channel down explicitly
    pub async fn disconnect(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// One full session: establish, handshake, pump, tear down
#[allow(clippy::too_many_arguments)]
async fn run_session(
    config: PairingConfig,
    listener: Option<TcpListener>,
    token: SessionToken,
    state_tx: watch::Sender<PairingState>,
    session: Arc<Mutex<Option<PairingSession>>>,
    mut outbound_rx: mpsc::UnboundedReceiver<Value>,
    inbound_tx: broadcast::Sender<Value>,
    mut shutdown_rx: watch::Receiver<bool>,
    events: EventBus,
) {
    let finish = |reason: &str| {
        log::info!("Pairing session ended: {}", reason);
        *session.lock().unwrap() = None;
        state_tx.send_replace(PairingState::Disconnected);
        events.emit(AppEvent::PairingStateChanged {
            state: PairingState::Disconnected,
        });
    };

    // Establish the raw stream
    let stream = match config.transport {
        PairingTransport::Direct => {
            let listener = match listener {
                Some(listener) => listener,
                None => {
                    finish("no listener for direct transport");
                    return;
                }
            };
            tokio::select! {
                accepted = transport::accept_companion(&listener) => match accepted {
                    Ok(stream) => stream,
                    Err(e) => {
                        finish(&format!("accept failed: {}", e));
                        return;
                    }
                },
                _ = shutdown_rx.changed() => {
                    finish("cancelled while waiting for companion");
                    return;
                }
            }
        }
        PairingTransport::Relayed => match transport::dial_relay(&config.relay_addr, &token).await {
            Ok(stream) => stream,
            Err(e) => {
                finish(&format!("relay unreachable: {}", e));
                return;
            }
        },
    };

    let (mut lines, mut writer) = match into_channel_with_hello(stream, &config, &token).await {
        Ok(halves) => halves,
        Err(e) => {
            finish(&format!("failed to announce session: {}", e));
            return;
        }
    };
    let mut out_seq: u64 = 0;

    // Handshake: first envelope carrying our token
    let token_str = token.as_str().to_string();
    let first = tokio::select! {
        result = time::timeout(config.liveness_timeout, wait_for_token(&mut lines, &token_str)) => {
            match result {
                Err(_) => {
                    finish(&RelayError::HandshakeTimeout.to_string());
                    return;
                }
                Ok(Err(e)) => {
                    finish(&format!("handshake failed: {}", e));
                    return;
                }
                Ok(Ok(envelope)) => envelope,
            }
        }
        _ = shutdown_rx.changed() => {
            finish("cancelled during handshake");
            return;
        }
    };

    *session.lock().unwrap() = Some(PairingSession::new(token.clone(), config.transport));
    state_tx.send_replace(PairingState::Connected);
    events.emit(AppEvent::PairingStateChanged {
        state: PairingState::Connected,
    });
    log::info!("Companion paired (session {})", token);

    let mut last_applied = first.seq;
    let mut last_seen = Instant::now();
    if let EnvelopePayload::Data { value } = first.payload {
        let _ = inbound_tx.send(value);
        events.emit(AppEvent::CompanionMessage);
    }

    let mut heartbeat = time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let liveness_check = (config.liveness_timeout / 4).max(Duration::from_millis(10));
    let mut liveness = time::interval(liveness_check);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let reason = loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break "disconnect requested".to_string();
                }
            }
            maybe_payload = outbound_rx.recv() => {
                let Some(payload) = maybe_payload else {
                    break "client dropped".to_string();
                };
                out_seq += 1;
                let envelope = Envelope {
                    token: token_str.clone(),
                    seq: out_seq,
                    payload: EnvelopePayload::Data { value: payload },
                };
                if let Err(e) = transport::write_envelope(&mut writer, &envelope).await {
                    break format!("write failed: {}", e);
                }
            }
            _ = heartbeat.tick() => {
                out_seq += 1;
                let envelope = Envelope {
                    token: token_str.clone(),
                    seq: out_seq,
                    payload: EnvelopePayload::Heartbeat,
                };
                if let Err(e) = transport::write_envelope(&mut writer, &envelope).await {
                    break format!("heartbeat write failed: {}", e);
                }
            }
            _ = liveness.tick() => {
                if last_seen.elapsed() > config.liveness_timeout {
                    break RelayError::PeerLost.to_string();
                }
            }
            received = transport::next_envelope(&mut lines) => {
                match received {
                    Ok(Some(envelope)) => {
                        if envelope.token != token_str {
                            log::warn!("Dropping envelope with foreign session token");
                            continue;
                        }

                        last_seen = Instant::now();
                        if let Some(ref mut s) = *session.lock().unwrap() {
                            s.touch();
                        }

                        // Duplicate or stale redelivery
                        if envelope.seq <= last_applied {
                            log::debug!(
                                "Dropping duplicate envelope seq {} (last applied {})",
                                envelope.seq,
                                last_applied
                            );
                            continue;
                        }
                        last_applied = envelope.seq;

                        if let EnvelopePayload::Data { value } = envelope.payload {
                            let _ = inbound_tx.send(value);
                            events.emit(AppEvent::CompanionMessage);
                        }
                    }
                    Ok(None) => break "companion closed the connection".to_string(),
                    Err(e) => break format!("receive failed: {}", e),
                }
            }
        }
    };

    finish(&reason);
}

/// Split the stream and send our own Hello announcement
///
/// Relayed mode already announced in dial_relay; direct mode announces
/// here, right after the companion connects.
async fn into_channel_with_hello(
    stream: tokio::net::TcpStream,
    config: &PairingConfig,
    token: &SessionToken,
) -> Result<(ChannelLines, ChannelWriter), RelayError> {
    let (lines, mut writer) = transport::into_channel(stream);

    if config.transport == PairingTransport::Direct {
        let hello = Envelope {
            token: token.as_str().to_string(),
            seq: 0,
            payload: EnvelopePayload::Hello,
        };
        transport::write_envelope(&mut writer, &hello).await?;
    }

    Ok((lines, writer))
}

/// Read envelopes until one carries our session token
async fn wait_for_token(
    lines: &mut ChannelLines,
    token: &str,
) -> Result<Envelope, RelayError> {
    loop {
        match transport::next_envelope(lines).await? {
            Some(envelope) if envelope.token == token => return Ok(envelope),
            Some(_) => log::warn!("Ignoring handshake envelope with foreign token"),
            None => return Err(RelayError::PeerLost),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpStream;

    fn test_config(transport: PairingTransport, relay_addr: &str) -> PairingConfig {
        PairingConfig {
            transport,
            listen_addr: "127.0.0.1:0".to_string(),
            public_host: None,
            relay_addr: relay_addr.to_string(),
            heartbeat_interval: Duration::from_millis(50),
            liveness_timeout: Duration::from_secs(2),
        }
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<PairingState>,
        wanted: PairingState,
    ) -> bool {
        let deadline = Duration::from_secs(5);
        time::timeout(deadline, async {
            loop {
                if *rx.borrow() == wanted {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
            && *rx.borrow() == wanted
    }

    /// Connect as the companion device using the descriptor
    async fn companion_connect(
        descriptor: &PairingDescriptor,
    ) -> (ChannelLines, ChannelWriter) {
        let stream = TcpStream::connect(&descriptor.endpoint).await.unwrap();
        transport::into_channel(stream)
    }

    fn companion_envelope(descriptor: &PairingDescriptor, seq: u64, payload: EnvelopePayload) -> Envelope {
        Envelope {
            token: descriptor.token.as_str().to_string(),
            seq,
            payload,
        }
    }

    #[tokio::test]
    async fn test_direct_pairing_handshake_and_data() {
        let (client, descriptor) =
            PairingClient::begin(test_config(PairingTransport::Direct, "unused"), EventBus::new())
                .await
                .unwrap();
        assert_eq!(client.state(), PairingState::Connecting);

        // Round-trip the descriptor the way a QR scan would
        let descriptor = PairingDescriptor::parse(&descriptor.encode()).unwrap();
        let (mut lines, mut writer) = companion_connect(&descriptor).await;

        // The wallet announces itself first in direct mode
        let hello = transport::next_envelope(&mut lines).await.unwrap().unwrap();
        assert_eq!(hello.payload, EnvelopePayload::Hello);
        assert_eq!(hello.token, descriptor.token.as_str());

        transport::write_envelope(
            &mut writer,
            &companion_envelope(&descriptor, 1, EnvelopePayload::Hello),
        )
        .await
        .unwrap();

        let mut state_rx = client.subscribe_state();
        assert!(wait_for_state(&mut state_rx, PairingState::Connected).await);
        assert!(client.session().is_some());

        // Companion -> wallet data
        let mut messages = client.subscribe_messages();
        transport::write_envelope(
            &mut writer,
            &companion_envelope(
                &descriptor,
                2,
                EnvelopePayload::Data { value: json!("ping") },
            ),
        )
        .await
        .unwrap();
        assert_eq!(messages.recv().await.unwrap(), json!("ping"));

        // Wallet -> companion data
        client.send(json!("pong")).unwrap();
        loop {
            let envelope = transport::next_envelope(&mut lines).await.unwrap().unwrap();
            match envelope.payload {
                EnvelopePayload::Data { value } => {
                    assert_eq!(value, json!("pong"));
                    assert!(envelope.seq >= 1);
                    break;
                }
                // Heartbeats interleave freely
                _ => continue,
            }
        }

        client.disconnect().await;
        assert_eq!(client.state(), PairingState::Disconnected);
    }

    #[tokio::test]
    async fn test_duplicate_and_stale_envelopes_are_dropped() {
        let (client, descriptor) =
            PairingClient::begin(test_config(PairingTransport::Direct, "unused"), EventBus::new())
                .await
                .unwrap();
        let (mut lines, mut writer) = companion_connect(&descriptor).await;
        let _ = transport::next_envelope(&mut lines).await.unwrap();

        transport::write_envelope(
            &mut writer,
            &companion_envelope(&descriptor, 1, EnvelopePayload::Hello),
        )
        .await
        .unwrap();

        let mut state_rx = client.subscribe_state();
        assert!(wait_for_state(&mut state_rx, PairingState::Connected).await);

        let mut messages = client.subscribe_messages();

        // seq 2 applied; the redelivered seq 2 and the stale seq 1 must not be
        for (seq, value) in [(2, "first"), (2, "first-again"), (1, "stale"), (3, "second")] {
            transport::write_envelope(
                &mut writer,
                &companion_envelope(
                    &descriptor,
                    seq,
                    EnvelopePayload::Data { value: json!(value) },
                ),
            )
            .await
            .unwrap();
        }

        // Delivery preserves queue order, so receiving "second" right after
        // "first" proves the middle two were discarded
        assert_eq!(messages.recv().await.unwrap(), json!("first"));
        assert_eq!(messages.recv().await.unwrap(), json!("second"));

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_foreign_token_envelopes_are_ignored() {
        let (client, descriptor) =
            PairingClient::begin(test_config(PairingTransport::Direct, "unused"), EventBus::new())
                .await
                .unwrap();
        let (mut lines, mut writer) = companion_connect(&descriptor).await;
        let _ = transport::next_envelope(&mut lines).await.unwrap();

        // A wrong-token hello must not complete the handshake
        let foreign = Envelope {
            token: SessionToken::generate().as_str().to_string(),
            seq: 1,
            payload: EnvelopePayload::Hello,
        };
        transport::write_envelope(&mut writer, &foreign).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.state(), PairingState::Connecting);

        transport::write_envelope(
            &mut writer,
            &companion_envelope(&descriptor, 1, EnvelopePayload::Hello),
        )
        .await
        .unwrap();
        let mut state_rx = client.subscribe_state();
        assert!(wait_for_state(&mut state_rx, PairingState::Connected).await);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_silent_peer_forces_disconnect() {
        let mut config = test_config(PairingTransport::Direct, "unused");
        config.liveness_timeout = Duration::from_millis(150);
        config.heartbeat_interval = Duration::from_millis(40);

        let (client, descriptor) = PairingClient::begin(config, EventBus::new()).await.unwrap();
        let (mut lines, mut writer) = companion_connect(&descriptor).await;
        let _ = transport::next_envelope(&mut lines).await.unwrap();

        transport::write_envelope(
            &mut writer,
            &companion_envelope(&descriptor, 1, EnvelopePayload::Hello),
        )
        .await
        .unwrap();

        let mut state_rx = client.subscribe_state();
        assert!(wait_for_state(&mut state_rx, PairingState::Connected).await);

        // Companion goes silent: no heartbeat, no data
        assert!(wait_for_state(&mut state_rx, PairingState::Disconnected).await);
        assert!(client.session().is_none());
    }

    #[tokio::test]
    async fn test_relayed_pairing_through_store_and_forward() {
        // Minimal relay: accept both ends, then pipe bytes blindly
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut a, _) = relay.accept().await.unwrap();
            let (mut b, _) = relay.accept().await.unwrap();
            let _ = tokio::io::copy_bidirectional(&mut a, &mut b).await;
        });

        let (client, descriptor) = PairingClient::begin(
            test_config(PairingTransport::Relayed, &relay_addr),
            EventBus::new(),
        )
        .await
        .unwrap();
        assert_eq!(descriptor.endpoint, relay_addr);
        assert_eq!(descriptor.transport, PairingTransport::Relayed);

        // Companion dials the relay like the descriptor says
        let (mut lines, mut writer) = companion_connect(&descriptor).await;

        // The wallet's join hello was stored and forwarded to us
        let hello = transport::next_envelope(&mut lines).await.unwrap().unwrap();
        assert_eq!(hello.payload, EnvelopePayload::Hello);

        transport::write_envelope(
            &mut writer,
            &companion_envelope(&descriptor, 1, EnvelopePayload::Hello),
        )
        .await
        .unwrap();

        let mut state_rx = client.subscribe_state();
        assert!(wait_for_state(&mut state_rx, PairingState::Connected).await);

        let mut messages = client.subscribe_messages();
        transport::write_envelope(
            &mut writer,
            &companion_envelope(
                &descriptor,
                2,
                EnvelopePayload::Data { value: json!({"cmd": "balance"}) },
            ),
        )
        .await
        .unwrap();
        assert_eq!(messages.recv().await.unwrap(), json!({"cmd": "balance"}));

        client.disconnect().await;
    }
}
