//! # sigil-client
//!
//! Device-side drivers for the sigil wallet service: authentication against
//! the hub, then the four ceremonies (DKG, signing, device registration on
//! the new device, device acceptance on an existing device), each over a
//! single
//! WebSocket session, plus the private-key export call.

mod ws;

use sigil_core::{
    ClientAdd, ClientDkg, ClientSigner, DkgResult, ExistingClientAdd, Signature,
};
use sigil_session::{Envelope, EnvelopeKind, StageGate};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use ws::{
    close, connect, flush_outbound, recv_envelope, send_envelope, spawn_drain_all, CancelGuard,
};

/// Ceremony deadline mirrored from the hub
const SESSION_DEADLINE: Duration = Duration::from_secs(60);

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request")]
    BadRequest,
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("tss process failed")]
    TssProcessFailed,
    #[error("ceremony deadline exceeded")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ClientError {
    fn from_status(status: u16) -> Self {
        match status {
            401 => ClientError::Unauthorized,
            400 => ClientError::BadRequest,
            404 => ClientError::NotFound,
            409 => ClientError::Conflict,
            other => ClientError::Internal(format!("unexpected status {other}")),
        }
    }
}

impl From<sigil_core::Error> for ClientError {
    fn from(err: sigil_core::Error) -> Self {
        match err {
            sigil_core::Error::TssProcessFailed | sigil_core::Error::InvalidSignature => {
                ClientError::TssProcessFailed
            }
            other => ClientError::Internal(other.to_string()),
        }
    }
}

impl From<sigil_session::SessionError> for ClientError {
    fn from(err: sigil_session::SessionError) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

/// A device's connection to the wallet hub
pub struct Client {
    host: String,
    http: reqwest::Client,
}

impl Client {
    /// `host` is the hub's base URL, e.g. `http://127.0.0.1:8080`
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn http_url(&self, path: &str) -> String {
        format!("{}{}", self.host, path)
    }

    fn ws_url(&self, path: &str) -> Result<String> {
        let mut parsed = url::Url::parse(&self.host)
            .map_err(|err| ClientError::Internal(format!("invalid host: {err}")))?;
        let scheme = match parsed.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        parsed
            .set_scheme(scheme)
            .map_err(|_| ClientError::Internal("invalid host scheme".into()))?;
        Ok(format!("{}{}", String::from(parsed).trim_end_matches('/'), path))
    }

    /// Resolve this device's user identity at the hub.
    pub async fn identify(&self, auth_data: &str) -> Result<String> {
        self.auth_request("/identify", auth_data, None).await
    }

    /// Mint a single-use access token; `metadata` rides the custody header.
    pub async fn authorize(&self, auth_data: &str, metadata: Option<&str>) -> Result<String> {
        self.auth_request("/authorize", auth_data, metadata).await
    }

    async fn auth_request(
        &self,
        path: &str,
        auth_data: &str,
        metadata: Option<&str>,
    ) -> Result<String> {
        let mut request = self
            .http
            .get(self.http_url(path))
            .bearer_auth(auth_data);
        if let Some(metadata) = metadata {
            request = request.header("M-METADATA", metadata);
        }
        let response = request
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(ClientError::from_status(status));
        }
        response
            .text()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))
    }

    /// Run distributed key generation; returns this device's wallet and the
    /// custody metadata the hub's share is sealed under.
    #[instrument(skip_all)]
    pub async fn dkg(&self, auth_data: &str) -> Result<(DkgResult, String)> {
        let token = self.authorize(auth_data, None).await?;
        let peer_id = Uuid::new_v4().to_string();
        let url = self.ws_url(&format!("/dkg?token={token}"))?;
        let (sink, mut reader) = connect(&url).await?;

        let outcome = tokio::time::timeout(SESSION_DEADLINE, async {
            send_envelope(&sink, &Envelope::peer_id(&peer_id)).await?;
            let dkg = ClientDkg::new(&peer_id)?;

            let (_guard, cancel_rx) = CancelGuard::new();
            let drain = spawn_drain_all(dkg.peer_manager(), sink.clone(), cancel_rx);

            let mut gate = StageGate::new();
            let process = dkg.process();
            tokio::pin!(process);
            let mut wallet: Option<DkgResult> = None;
            let mut metadata: Option<String> = None;

            loop {
                if wallet.is_some() && metadata.is_some() {
                    drain.abort();
                    let wallet = wallet.take().ok_or_else(|| never("wallet"))?;
                    let metadata = metadata.take().ok_or_else(|| never("metadata"))?;
                    return Ok((wallet, metadata));
                }
                tokio::select! {
                    result = &mut process, if wallet.is_none() => {
                        wallet = Some(result?);
                        gate.advance(40);
                        debug!("dkg primitive complete");
                    }
                    maybe = recv_envelope(&mut reader) => {
                        let envelope = maybe?.ok_or_else(transport_closed)?;
                        match envelope.kind {
                            EnvelopeKind::Tss => {
                                if !gate.admit(&envelope) {
                                    continue;
                                }
                                dkg.handle_relay(envelope.tss_frame()?)?;
                            }
                            // the custody key arrives after the rounds, past
                            // the gate's last stage
                            EnvelopeKind::Metadata => {
                                send_envelope(&sink, &Envelope::metadata_ack()).await?;
                                metadata = Some(envelope.payload);
                            }
                            EnvelopeKind::Error => {
                                return Err(ClientError::Protocol(envelope.payload))
                            }
                            _ => {
                                if !gate.admit(&envelope) {
                                    continue;
                                }
                                return Err(unexpected(&envelope));
                            }
                        }
                    }
                }
            }
        })
        .await
        .map_err(|_| ClientError::Timeout)?;

        close(&sink).await;
        let (wallet, metadata) = outcome?;
        info!(address = %wallet.address, "wallet created");
        Ok((wallet, metadata))
    }

    /// Jointly sign a 32-byte digest with the hub.
    #[instrument(skip_all)]
    pub async fn sign(
        &self,
        auth_data: &str,
        digest: &[u8; 32],
        wallet: &DkgResult,
        metadata: &str,
    ) -> Result<Signature> {
        let token = self.authorize(auth_data, Some(metadata)).await?;
        let url = self.ws_url(&format!(
            "/sign?token={token}&msg={}&peer={}",
            hex::encode(digest),
            wallet.peer_id
        ))?;
        let (sink, mut reader) = connect(&url).await?;

        let signer = ClientSigner::new(
            &wallet.peer_id,
            &wallet.pubkey,
            &wallet.share,
            &wallet.bks,
            *digest,
        )?;

        let outcome = tokio::time::timeout(SESSION_DEADLINE, async {
            let (_guard, cancel_rx) = CancelGuard::new();
            let drain = spawn_drain_all(signer.peer_manager(), sink.clone(), cancel_rx);

            let gate = StageGate::new();
            let process = signer.process();
            tokio::pin!(process);
            let signature = loop {
                tokio::select! {
                    result = &mut process => break result?,
                    maybe = recv_envelope(&mut reader) => {
                        let envelope = maybe?.ok_or_else(transport_closed)?;
                        if !gate.admit(&envelope) {
                            continue;
                        }
                        match envelope.kind {
                            EnvelopeKind::Tss => signer.handle_relay(envelope.tss_frame()?)?,
                            EnvelopeKind::Error => {
                                return Err(ClientError::Protocol(envelope.payload))
                            }
                            _ => return Err(unexpected(&envelope)),
                        }
                    }
                }
            };

            // The hub may still be waiting on this side's final round.
            flush_outbound(&signer.peer_manager()).await;
            drain.abort();
            Ok(signature)
        })
        .await
        .map_err(|_| ClientError::Timeout)?;

        close(&sink).await;
        outcome
    }

    /// Enrol this device into an existing wallet (new-device side).
    #[instrument(skip_all)]
    pub async fn register_device(
        &self,
        auth_data: &str,
        device: &str,
    ) -> Result<(DkgResult, String)> {
        let token = self.authorize(auth_data, None).await?;
        let peer_id = Uuid::new_v4().to_string();
        let url = self.ws_url(&format!("/register?token={token}"))?;
        let (sink, mut reader) = connect(&url).await?;

        let outcome = tokio::time::timeout(SESSION_DEADLINE, async {
            send_envelope(&sink, &Envelope::peer_id(&peer_id)).await?;
            let mut gate = StageGate::new();

            let existing_id = expect_kind(&mut reader, &gate, EnvelopeKind::PeerId)
                .await?
                .payload;
            send_envelope(&sink, &Envelope::device(device)).await?;

            let public_wallet = expect_kind(&mut reader, &gate, EnvelopeKind::Pubkey)
                .await?
                .public_wallet_payload()?;
            let adder = ClientAdd::new(
                &peer_id,
                &existing_id,
                &public_wallet.public_key,
                &public_wallet.bks,
            )?;
            gate.advance(30);

            let (_guard, cancel_rx) = CancelGuard::new();
            let drain = spawn_drain_all(adder.peer_manager(), sink.clone(), cancel_rx);

            let process = adder.process();
            tokio::pin!(process);
            let mut wallet: Option<DkgResult> = None;
            let mut metadata: Option<String> = None;
            let mut existing_done = false;

            loop {
                if wallet.is_some() && metadata.is_some() && existing_done {
                    drain.abort();
                    let wallet = wallet.take().ok_or_else(|| never("wallet"))?;
                    let metadata = metadata.take().ok_or_else(|| never("metadata"))?;
                    return Ok((wallet, metadata));
                }
                tokio::select! {
                    result = &mut process, if wallet.is_none() => {
                        wallet = Some(result?);
                        gate.advance(40);
                        debug!("share-adding primitive complete");
                    }
                    maybe = recv_envelope(&mut reader) => {
                        let envelope = maybe?.ok_or_else(transport_closed)?;
                        match envelope.kind {
                            EnvelopeKind::Tss => {
                                if !gate.admit(&envelope) {
                                    continue;
                                }
                                adder.handle_relay(envelope.tss_frame()?)?;
                            }
                            // arrives after the rounds, past the gate's last
                            // stage
                            EnvelopeKind::Metadata => {
                                metadata = Some(envelope.payload);
                                send_envelope(&sink, &Envelope::stored_client()).await?;
                            }
                            EnvelopeKind::ExistingDeviceDone => {
                                send_envelope(&sink, &Envelope::new_device_done()).await?;
                                existing_done = true;
                            }
                            EnvelopeKind::Error => {
                                return Err(ClientError::Protocol(envelope.payload))
                            }
                            _ => {
                                if !gate.admit(&envelope) {
                                    continue;
                                }
                                return Err(unexpected(&envelope));
                            }
                        }
                    }
                }
            }
        })
        .await
        .map_err(|_| ClientError::Timeout)?;

        close(&sink).await;
        let (wallet, metadata) = outcome?;
        info!(address = %wallet.address, "device enrolled");
        Ok((wallet, metadata))
    }

    /// Approve the enrolment of a new device (existing-device side); returns
    /// this device's refreshed wallet.
    #[instrument(skip_all)]
    pub async fn accept_device(
        &self,
        auth_data: &str,
        wallet: &DkgResult,
        metadata: &str,
    ) -> Result<DkgResult> {
        let token = self.authorize(auth_data, None).await?;
        let url = self.ws_url(&format!("/accept?token={token}"))?;
        let (sink, mut reader) = connect(&url).await?;

        let outcome = tokio::time::timeout(SESSION_DEADLINE, async {
            send_envelope(&sink, &Envelope::peer_id(&wallet.peer_id)).await?;
            let mut gate = StageGate::new();

            let new_id = expect_kind(&mut reader, &gate, EnvelopeKind::PeerId)
                .await?
                .payload;
            let adder = ExistingClientAdd::new(
                &wallet.peer_id,
                &new_id,
                &wallet.pubkey,
                &wallet.share,
                &wallet.bks,
            )?;

            send_envelope(&sink, &Envelope::metadata(metadata)).await?;

            // Primitive frames can overtake the acknowledgement; feed them in.
            loop {
                let envelope = recv_envelope(&mut reader)
                    .await?
                    .ok_or_else(transport_closed)?;
                if !gate.admit(&envelope) {
                    continue;
                }
                match envelope.kind {
                    EnvelopeKind::MetadataAck => break,
                    EnvelopeKind::Tss => adder.handle_relay(envelope.tss_frame()?)?,
                    EnvelopeKind::Error => return Err(ClientError::Protocol(envelope.payload)),
                    _ => return Err(unexpected(&envelope)),
                }
            }
            gate.advance(30);

            let (_guard, cancel_rx) = CancelGuard::new();
            let drain = spawn_drain_all(adder.peer_manager(), sink.clone(), cancel_rx);

            let process = adder.process();
            tokio::pin!(process);
            let updated = loop {
                tokio::select! {
                    result = &mut process => break result?,
                    maybe = recv_envelope(&mut reader) => {
                        let envelope = maybe?.ok_or_else(transport_closed)?;
                        if !gate.admit(&envelope) {
                            continue;
                        }
                        match envelope.kind {
                            EnvelopeKind::Tss => adder.handle_relay(envelope.tss_frame()?)?,
                            EnvelopeKind::Error => {
                                return Err(ClientError::Protocol(envelope.payload))
                            }
                            _ => return Err(unexpected(&envelope)),
                        }
                    }
                }
            };
            gate.advance(40);

            flush_outbound(&adder.peer_manager()).await;
            send_envelope(&sink, &Envelope::tss_done()).await?;
            send_envelope(&sink, &Envelope::existing_device_done()).await?;

            loop {
                let envelope = recv_envelope(&mut reader)
                    .await?
                    .ok_or_else(transport_closed)?;
                match envelope.kind {
                    EnvelopeKind::NewDeviceDone => break,
                    EnvelopeKind::Tss => continue,
                    EnvelopeKind::Error => return Err(ClientError::Protocol(envelope.payload)),
                    _ => continue,
                }
            }

            drain.abort();
            Ok(updated)
        })
        .await
        .map_err(|_| ClientError::Timeout)?;

        close(&sink).await;
        let updated = outcome?;
        info!(address = %updated.address, "device accepted");
        Ok(updated)
    }

    /// Export the wallet's private key through server-side reconstruction.
    #[instrument(skip_all)]
    pub async fn export(
        &self,
        auth_data: &str,
        wallet: &DkgResult,
        metadata: &str,
    ) -> Result<String> {
        let token = self.authorize(auth_data, Some(metadata)).await?;
        let response = self
            .http
            .post(self.http_url(&format!("/recover?token={token}")))
            .form(&[
                ("share", wallet.share.as_str()),
                ("clientPeerID", wallet.peer_id.as_str()),
            ])
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(ClientError::from_status(status));
        }
        response
            .text()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))
    }
}

/// Skip gated-out envelopes until one of the wanted kind arrives.
async fn expect_kind(
    reader: &mut ws::WsReader,
    gate: &StageGate,
    kind: EnvelopeKind,
) -> Result<Envelope> {
    loop {
        let envelope = recv_envelope(reader).await?.ok_or_else(transport_closed)?;
        if envelope.kind == kind {
            if !gate.admit(&envelope) {
                continue;
            }
            return Ok(envelope);
        }
        match envelope.kind {
            EnvelopeKind::Error => return Err(ClientError::Protocol(envelope.payload)),
            _ if !gate.admit(&envelope) => continue,
            _ => return Err(unexpected(&envelope)),
        }
    }
}

fn transport_closed() -> ClientError {
    ClientError::Transport("hub closed the session before completion".into())
}

fn unexpected(envelope: &Envelope) -> ClientError {
    ClientError::Protocol(format!("unexpected {} envelope", envelope.kind.as_str()))
}

fn never(what: &str) -> ClientError {
    ClientError::Internal(format!("{what} missing at completion"))
}
