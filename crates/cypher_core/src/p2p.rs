//! Direct peer-to-peer channel.
//!
//! Layered on top of an already-established ratchet session: the factory
//! only moves byte frames, the channel proves peer identity with a
//! two-phase handshake (nonce → ratchet-sealed echo), and every
//! post-handshake frame is sealed with a fresh ratchet message key.
//!
//! Frames carry a monotonically increasing packet id and an ack correlator.
//! `send_message` frames that stay unacked past the configured timeout are
//! retried through the server transport, so a dying direct link degrades
//! instead of losing messages.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use cypher_crypto::ratchet::RatchetHeader;
use cypher_proto::{codec, DeviceAddress, PushType};

use crate::{
    config::MessengerConfig,
    error::MessengerError,
    events::{EventBus, MessengerEvent},
    sessions::SessionManager,
    traits::{InboundEnvelope, P2pConnection, P2pTransportFactory, Transport},
};

const HANDSHAKE_AAD: &[u8] = b"p2p-handshake";

/// Presence/status beacon exchanged over an open channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    #[serde(rename = "t")]
    pub is_typing: bool,
    #[serde(rename = "m", default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
enum FrameBody {
    /// Phase 1: initiator's challenge.
    #[serde(rename = "h")]
    Handshake { nonce: Vec<u8> },
    /// Phase 2: responder echoes the nonce sealed under the ratchet
    /// session, proving it owns the session keys.
    #[serde(rename = "e")]
    HandshakeEcho {
        header: RatchetHeader,
        sealed: Vec<u8>,
    },
    /// Post-handshake traffic: a ratchet-sealed `P2pPayload`.
    #[serde(rename = "s")]
    Sealed {
        header: RatchetHeader,
        sealed: Vec<u8>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct P2pFrame {
    #[serde(rename = "i")]
    packet_id: u64,
    #[serde(rename = "a", skip_serializing_if = "Option::is_none", default)]
    ack: Option<u64>,
    #[serde(rename = "b")]
    body: FrameBody,
}

#[derive(Debug, Serialize, Deserialize)]
enum P2pPayload {
    #[serde(rename = "st")]
    Status(PeerStatus),
    #[serde(rename = "m")]
    SendMessage { envelope: Vec<u8> },
    #[serde(rename = "a")]
    Ack,
    #[serde(rename = "bc")]
    Broadcast { envelope: Vec<u8> },
}

struct PendingSend {
    envelope: Vec<u8>,
    sent_at: Instant,
}

// ── Channel ──────────────────────────────────────────────────────────────────

pub struct P2pChannel {
    peer: DeviceAddress,
    conn: Box<dyn P2pConnection>,
    sessions: Arc<SessionManager>,
    transport: Arc<dyn Transport>,
    events: EventBus,
    config: MessengerConfig,
    inbound_tx: mpsc::Sender<InboundEnvelope>,
    next_packet: AtomicU64,
    pending: Mutex<HashMap<u64, PendingSend>>,
    remote_status: Mutex<Option<PeerStatus>>,
    closed: AtomicBool,
}

impl P2pChannel {
    #[allow(clippy::too_many_arguments)]
    fn new(
        peer: DeviceAddress,
        conn: Box<dyn P2pConnection>,
        sessions: Arc<SessionManager>,
        transport: Arc<dyn Transport>,
        events: EventBus,
        config: MessengerConfig,
        inbound_tx: mpsc::Sender<InboundEnvelope>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            conn,
            sessions,
            transport,
            events,
            config,
            inbound_tx,
            next_packet: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            remote_status: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Initiator side of the handshake: challenge, verify the sealed echo,
    /// ack it.
    async fn handshake_outbound(&self) -> Result<(), MessengerError> {
        let mut nonce = vec![0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce);

        let challenge_id = self.next_packet.fetch_add(1, Ordering::SeqCst);
        let frame = P2pFrame {
            packet_id: challenge_id,
            ack: None,
            body: FrameBody::Handshake { nonce: nonce.clone() },
        };
        self.conn.send(codec::encode(&frame)?).await?;

        loop {
            let Some(bytes) = self.conn.recv().await? else {
                return Err(MessengerError::TransportUnavailable(
                    "peer closed during handshake".into(),
                ));
            };
            let frame: P2pFrame = codec::decode(&bytes)?;
            if let FrameBody::HandshakeEcho { header, sealed } = frame.body {
                let echoed = self
                    .sessions
                    .open_frame(&self.peer, &header, &sealed, HANDSHAKE_AAD, None)
                    .await?;
                if echoed != nonce {
                    return Err(MessengerError::InvalidMac);
                }
                self.send_payload(P2pPayload::Ack, Some(frame.packet_id)).await?;
                return Ok(());
            }
        }
    }

    /// Responder side: receive the challenge, echo it sealed under the
    /// ratchet session, wait for the initiator's ack.
    async fn handshake_inbound(&self) -> Result<(), MessengerError> {
        loop {
            let Some(bytes) = self.conn.recv().await? else {
                return Err(MessengerError::TransportUnavailable(
                    "peer closed during handshake".into(),
                ));
            };
            let frame: P2pFrame = codec::decode(&bytes)?;
            match frame.body {
                FrameBody::Handshake { nonce } => {
                    let (header, sealed, _) = self
                        .sessions
                        .seal_frame(&self.peer, &nonce, HANDSHAKE_AAD)
                        .await?;
                    let echo = P2pFrame {
                        packet_id: self.next_packet.fetch_add(1, Ordering::SeqCst),
                        ack: Some(frame.packet_id),
                        body: FrameBody::HandshakeEcho { header, sealed },
                    };
                    self.conn.send(codec::encode(&echo)?).await?;
                }
                // Any authenticated frame from the initiator completes the
                // handshake (it could already be application traffic).
                FrameBody::Sealed { .. } => {
                    self.handle_frame(bytes_to_frame(bytes)?).await;
                    return Ok(());
                }
                FrameBody::HandshakeEcho { .. } => {}
            }
        }
    }

    async fn sealed_payload(
        &self,
        payload: &P2pPayload,
        packet_id: u64,
    ) -> Result<(RatchetHeader, Vec<u8>), MessengerError> {
        let plaintext = codec::encode(payload)?;
        let aad = frame_aad(packet_id);
        let (header, sealed, _) = self.sessions.seal_frame(&self.peer, &plaintext, &aad).await?;
        Ok((header, sealed))
    }

    async fn send_payload(
        &self,
        payload: P2pPayload,
        ack: Option<u64>,
    ) -> Result<u64, MessengerError> {
        let packet_id = self.next_packet.fetch_add(1, Ordering::SeqCst);
        let (header, sealed) = self.sealed_payload(&payload, packet_id).await?;
        let frame = P2pFrame {
            packet_id,
            ack,
            body: FrameBody::Sealed { header, sealed },
        };
        self.conn.send(codec::encode(&frame)?).await?;
        Ok(packet_id)
    }

    /// Send a status beacon (typing flags and friends). Fire-and-forget.
    pub async fn send_status(&self, status: PeerStatus) -> Result<(), MessengerError> {
        self.send_payload(P2pPayload::Status(status), None).await?;
        Ok(())
    }

    /// Ship an already-sealed envelope over the direct link. Tracked until
    /// acked; falls back to the server transport on timeout.
    pub async fn send_envelope(&self, envelope: Vec<u8>) -> Result<(), MessengerError> {
        let packet_id = self
            .send_payload(
                P2pPayload::SendMessage {
                    envelope: envelope.clone(),
                },
                None,
            )
            .await?;
        self.pending.lock().await.insert(
            packet_id,
            PendingSend {
                envelope,
                sent_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Last status observed from the peer.
    pub async fn remote_status(&self) -> Option<PeerStatus> {
        self.remote_status.lock().await.clone()
    }

    pub fn peer(&self) -> &DeviceAddress {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.conn.close().await;
        }
    }

    async fn handle_frame(&self, frame: P2pFrame) {
        if let Some(acked) = frame.ack {
            self.pending.lock().await.remove(&acked);
        }
        let FrameBody::Sealed { header, sealed } = frame.body else {
            return; // stray handshake frame after authentication
        };
        let aad = frame_aad(frame.packet_id);
        let payload = match self
            .sessions
            .open_frame(&self.peer, &header, &sealed, &aad, None)
            .await
        {
            Ok(plaintext) => match codec::decode::<P2pPayload>(&plaintext) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(target: "cypher_core", event = "p2p_payload_undecodable", error = %err);
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(
                    target: "cypher_core",
                    event = "p2p_frame_undecryptable",
                    peer = %self.peer,
                    error = %err,
                );
                return;
            }
        };

        match payload {
            P2pPayload::Status(status) => {
                *self.remote_status.lock().await = Some(status);
            }
            P2pPayload::SendMessage { envelope } => {
                if let Err(err) = self.send_payload(P2pPayload::Ack, Some(frame.packet_id)).await {
                    tracing::warn!(target: "cypher_core", event = "p2p_ack_failed", error = %err);
                }
                let _ = self
                    .inbound_tx
                    .send(InboundEnvelope {
                        sender: self.peer.clone(),
                        bytes: envelope,
                    })
                    .await;
            }
            P2pPayload::Broadcast { envelope } => {
                // Forwarded traffic; the router drops it if misaddressed.
                let _ = self
                    .inbound_tx
                    .send(InboundEnvelope {
                        sender: self.peer.clone(),
                        bytes: envelope,
                    })
                    .await;
            }
            P2pPayload::Ack => {}
        }
    }

    /// Retry unacked sendMessage frames through the server transport once
    /// they outlive the P2P send timeout.
    async fn flush_expired(&self) {
        let timeout = self.config.p2p_send_timeout;
        let expired: Vec<(u64, Vec<u8>)> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.sent_at.elapsed() >= timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p.envelope)))
                .collect()
        };
        for (packet_id, envelope) in expired {
            tracing::debug!(
                target: "cypher_core",
                event = "p2p_send_fallback",
                peer = %self.peer,
                packet_id,
            );
            if let Err(err) = self
                .transport
                .send_message(&self.peer, envelope, PushType::Message)
                .await
            {
                tracing::warn!(
                    target: "cypher_core",
                    event = "p2p_fallback_failed",
                    peer = %self.peer,
                    error = %err,
                );
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let mut flush = tokio::time::interval(self.config.p2p_send_timeout / 4);
        loop {
            tokio::select! {
                received = self.conn.recv() => match received {
                    Ok(Some(bytes)) => match bytes_to_frame(bytes) {
                        Ok(frame) => self.handle_frame(frame).await,
                        Err(err) => {
                            tracing::warn!(target: "cypher_core", event = "p2p_frame_undecodable", error = %err);
                        }
                    },
                    Ok(None) | Err(_) => break,
                },
                _ = flush.tick() => self.flush_expired().await,
            }
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
        }
        self.closed.store(true, Ordering::SeqCst);
        self.flush_expired().await;
        self.events.emit(MessengerEvent::P2pClose {
            address: self.peer.clone(),
        });
    }
}

fn bytes_to_frame(bytes: Vec<u8>) -> Result<P2pFrame, MessengerError> {
    Ok(codec::decode(&bytes)?)
}

fn frame_aad(packet_id: u64) -> Vec<u8> {
    format!("p2p/{packet_id}").into_bytes()
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Owns the open channels of one messenger and the optional factory used to
/// dial new ones.
pub struct P2pManager {
    sessions: Arc<SessionManager>,
    transport: Arc<dyn Transport>,
    events: EventBus,
    config: MessengerConfig,
    factory: Option<Arc<dyn P2pTransportFactory>>,
    inbound_tx: mpsc::Sender<InboundEnvelope>,
    channels: Mutex<HashMap<DeviceAddress, Arc<P2pChannel>>>,
}

impl P2pManager {
    pub fn new(
        sessions: Arc<SessionManager>,
        transport: Arc<dyn Transport>,
        events: EventBus,
        config: MessengerConfig,
        factory: Option<Arc<dyn P2pTransportFactory>>,
        inbound_tx: mpsc::Sender<InboundEnvelope>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            transport,
            events,
            config,
            factory,
            inbound_tx,
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn channel_for(
        &self,
        peer: DeviceAddress,
        conn: Box<dyn P2pConnection>,
    ) -> Arc<P2pChannel> {
        P2pChannel::new(
            peer,
            conn,
            self.sessions.clone(),
            self.transport.clone(),
            self.events.clone(),
            self.config.clone(),
            self.inbound_tx.clone(),
        )
    }

    async fn register(&self, channel: Arc<P2pChannel>) {
        self.events.emit(MessengerEvent::P2pOpen {
            address: channel.peer().clone(),
        });
        self.channels
            .lock()
            .await
            .insert(channel.peer().clone(), channel.clone());
        tokio::spawn(channel.run());
    }

    /// Dial the peer over a caller-supplied connection (initiator side).
    pub async fn open_with(
        &self,
        peer: DeviceAddress,
        conn: Box<dyn P2pConnection>,
    ) -> Result<Arc<P2pChannel>, MessengerError> {
        let channel = self.channel_for(peer, conn);
        tokio::time::timeout(self.config.p2p_handshake_timeout, channel.handshake_outbound())
            .await
            .map_err(|_| MessengerError::Timeout("p2p handshake"))??;
        self.register(channel.clone()).await;
        Ok(channel)
    }

    /// Answer the peer over a caller-supplied connection (responder side).
    pub async fn accept_with(
        &self,
        peer: DeviceAddress,
        conn: Box<dyn P2pConnection>,
    ) -> Result<Arc<P2pChannel>, MessengerError> {
        let channel = self.channel_for(peer, conn);
        tokio::time::timeout(self.config.p2p_handshake_timeout, channel.handshake_inbound())
            .await
            .map_err(|_| MessengerError::Timeout("p2p handshake"))??;
        self.register(channel.clone()).await;
        Ok(channel)
    }

    /// Dial via the registered factory using rendezvous metadata from a
    /// `p2p.offer` magic message.
    pub async fn open(
        &self,
        peer: DeviceAddress,
        metadata: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Arc<P2pChannel>, MessengerError> {
        let factory = self.factory.clone().ok_or_else(|| {
            MessengerError::TransportUnavailable("no p2p factory registered".into())
        })?;
        let conn = factory.create_outbound(metadata).await?;
        self.open_with(peer, conn).await
    }

    /// Wait for the peer to dial us via the registered factory.
    pub async fn accept(
        &self,
        peer: DeviceAddress,
        metadata: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Arc<P2pChannel>, MessengerError> {
        let factory = self.factory.clone().ok_or_else(|| {
            MessengerError::TransportUnavailable("no p2p factory registered".into())
        })?;
        let conn = factory.create_inbound(metadata).await?;
        self.accept_with(peer, conn).await
    }

    /// Fire-and-forget dial in response to an inbound offer.
    pub fn connect_from_offer(
        self: Arc<Self>,
        peer: DeviceAddress,
        metadata: BTreeMap<String, serde_json::Value>,
    ) {
        if self.factory.is_none() {
            tracing::debug!(target: "cypher_core", event = "p2p_offer_ignored", peer = %peer);
            return;
        }
        tokio::spawn(async move {
            if let Err(err) = self.open(peer.clone(), &metadata).await {
                tracing::warn!(
                    target: "cypher_core",
                    event = "p2p_offer_connect_failed",
                    peer = %peer,
                    error = %err,
                );
            }
        });
    }

    /// Try to ship an envelope over an open channel. `false` means the
    /// caller should use the server transport.
    pub async fn try_send_envelope(&self, to: &DeviceAddress, bytes: &[u8]) -> bool {
        let channel = {
            let channels = self.channels.lock().await;
            channels.get(to).cloned()
        };
        match channel {
            Some(channel) if channel.is_open() => {
                channel.send_envelope(bytes.to_vec()).await.is_ok()
            }
            _ => false,
        }
    }

    pub async fn channel(&self, peer: &DeviceAddress) -> Option<Arc<P2pChannel>> {
        self.channels.lock().await.get(peer).cloned()
    }

    pub async fn close_all(&self) {
        let channels: Vec<_> = self.channels.lock().await.drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.close().await;
        }
    }
}
