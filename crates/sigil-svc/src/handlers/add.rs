//! Hub side of share-adding: two cooperating WebSocket handlers
//!
//! The joining device dials `/register`, the already enrolled device dials
//! `/accept`; the two handler sessions meet through the per-user rendezvous
//! of capacity-1 channels. The hub participates in the re-sharing with its
//! own old-peer service while relaying the frames the two devices address
//! to each other: each handler's drain task serves the socket of its own
//! device, and frames consumed from one socket but addressed to the other
//! device are re-queued onto the shared peer manager.

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitStream;
use sigil_core::{ServerAdd, SERVER_ID};
use sigil_session::{Envelope, EnvelopeKind, PublicWallet, StageGate};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, instrument};

use crate::error::{Result, SvcError};
use crate::handlers::{authorize_ceremony, user_agent, CeremonyQuery};
use crate::registry::{AcceptSide, RegisterSide};
use crate::session::{
    close_error, close_normal, recv_envelope, send_envelope, spawn_drain, split_socket,
    CancelGuard, SharedSink,
};
use crate::AppState;

/// Removes the rendezvous entry when the register session ends, claimed
/// or not.
struct RendezvousGuard {
    state: AppState,
    user_id: String,
}

impl Drop for RendezvousGuard {
    fn drop(&mut self) {
        self.state.rendezvous.end(&self.user_id);
    }
}

// ---------------------------------------------------------------------------
// /register: the joining device's session

pub async fn register(
    ws: WebSocketUpgrade,
    query: CeremonyQuery,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let (token, entry) = match authorize_ceremony(&state, &query) {
        Ok(authorized) => authorized,
        Err(err) => return err.into_response(),
    };

    // A wallet must exist before devices can be added to it.
    match state.vault.wallet_exists(&entry.user_id) {
        Ok(true) => {}
        Ok(false) => return SvcError::NotFound.into_response(),
        Err(err) => return err.into_response(),
    }

    // Only one add-share session per user at a time.
    let rendezvous = match state.rendezvous.begin(&entry.user_id) {
        Ok(side) => side,
        Err(err) => return err.into_response(),
    };

    let agent = user_agent(&headers);
    let user_id = entry.user_id.clone();
    ws.on_upgrade(move |socket| async move {
        let _guard = RendezvousGuard {
            state: state.clone(),
            user_id: user_id.clone(),
        };
        let result = run_register(state.clone(), socket, rendezvous, &user_id, agent).await;
        match result {
            Ok(()) => {
                state.tokens.delete(&token);
                info!(user_id = %user_id, "register session complete");
            }
            Err(err) => error!(error = %err, "register session aborted"),
        }
    })
}

#[instrument(skip_all, fields(user_id = %user_id))]
async fn run_register(
    state: AppState,
    socket: WebSocket,
    rendezvous: RegisterSide,
    user_id: &str,
    agent: String,
) -> Result<()> {
    let (sink, mut stream) = split_socket(socket);
    let outcome = tokio::time::timeout(
        state.config.session_deadline,
        drive_register(&state, &sink, &mut stream, rendezvous, user_id, &agent),
    )
    .await;

    match outcome {
        Ok(Ok(())) => {
            close_normal(&sink).await;
            Ok(())
        }
        Ok(Err(err)) => {
            close_error(&sink).await;
            Err(err)
        }
        Err(_) => {
            close_error(&sink).await;
            Err(SvcError::Timeout)
        }
    }
}

async fn drive_register(
    state: &AppState,
    sink: &SharedSink,
    stream: &mut SplitStream<WebSocket>,
    mut rendezvous: RegisterSide,
    user_id: &str,
    agent: &str,
) -> Result<()> {
    let mut gate = StageGate::new();

    // Peer-id swap with the accept session.
    let new_id = expect_peer_id(stream, &gate).await?;
    rendezvous
        .new_peer_id_tx
        .send(new_id.clone())
        .await
        .map_err(|_| SvcError::Internal("rendezvous dropped".into()))?;
    let existing_id = rendezvous
        .existing_peer_id_rx
        .recv()
        .await
        .ok_or(SvcError::TransportClosed)?;
    send_envelope(sink, &Envelope::peer_id(&existing_id)).await?;
    info!(new_id = %new_id, existing_id = %existing_id, "add-share peers matched");

    // Device descriptor from the joining device; custody key from the
    // enrolled one. Only then can the stored wallet be opened.
    let descriptor = loop {
        let envelope = recv_envelope(stream)
            .await?
            .ok_or(SvcError::TransportClosed)?;
        match envelope.kind {
            EnvelopeKind::Device => {
                if !gate.admit(&envelope) {
                    continue;
                }
                break envelope.payload;
            }
            EnvelopeKind::Error => return Err(SvcError::ProtocolViolation(envelope.payload)),
            _ => {
                if !gate.admit(&envelope) {
                    continue;
                }
                send_envelope(sink, &Envelope::error("unexpected envelope kind")).await?;
                return Err(SvcError::ProtocolViolation(format!(
                    "{} during device exchange",
                    envelope.kind.as_str()
                )));
            }
        }
    };
    rendezvous
        .user_agent_tx
        .send(if descriptor.is_empty() {
            agent.to_string()
        } else {
            descriptor
        })
        .await
        .map_err(|_| SvcError::Internal("rendezvous dropped".into()))?;

    let metadata = rendezvous
        .metadata_rx
        .recv()
        .await
        .ok_or(SvcError::TransportClosed)?;
    let wallet = state.vault.retrieve_wallet(user_id, &metadata)?;

    let adder = Arc::new(ServerAdd::new(
        &new_id,
        &existing_id,
        &wallet.pubkey,
        &wallet.share,
        &wallet.bks,
    )?);
    rendezvous
        .adder_tx
        .send(Arc::clone(&adder))
        .await
        .map_err(|_| SvcError::Internal("rendezvous dropped".into()))?;

    // Hand the joining device the shareable half of the wallet.
    let public_wallet = PublicWallet {
        public_key: wallet.pubkey.clone(),
        bks: wallet.bks.clone(),
    };
    send_envelope(sink, &Envelope::public_wallet(&public_wallet)?).await?;
    gate.advance(30);

    let (_cancel_guard, cancel_rx) = CancelGuard::new();
    let (errs_tx, mut errs_rx) = mpsc::channel(2);
    let drain = spawn_drain(
        adder.peer_manager(),
        new_id.clone(),
        sink.clone(),
        cancel_rx,
        errs_tx,
    );

    // Route frames until the hub's own old-peer service terminates; the
    // accept session drives `process`, this session observes `done`.
    let mut done = adder.done();
    if *done.borrow() {
        // already terminal
    } else {
        loop {
            tokio::select! {
                changed = done.changed() => {
                    changed.map_err(|_| SvcError::Internal("done channel closed".into()))?;
                    if *done.borrow() {
                        break;
                    }
                }
                maybe = recv_envelope(stream) => {
                    relay_register_envelope(maybe?, &gate, &adder, sink).await?;
                }
                Some(err) = errs_rx.recv() => return Err(err),
            }
        }
    }
    gate.advance(40);

    // The enrolled device signals the end of its rounds through the accept
    // session; frames for it may still pass through here meanwhile.
    loop {
        tokio::select! {
            signalled = rendezvous.existing_tss_done_rx.recv() => {
                signalled.ok_or(SvcError::TransportClosed)?;
                break;
            }
            maybe = recv_envelope(stream) => {
                relay_register_envelope(maybe?, &gate, &adder, sink).await?;
            }
            Some(err) = errs_rx.recv() => return Err(err),
        }
    }

    // Metadata is never rotated: the joining device receives the wallet's
    // original custody key.
    send_envelope(sink, &Envelope::metadata(&metadata)).await?;

    // Terminal handshake: existing-device-done travels hub-ward through the
    // accept session, is forwarded here to the joining device, which answers
    // with new-device-done for the reverse path.
    loop {
        tokio::select! {
            signalled = rendezvous.existing_device_done_rx.recv() => {
                signalled.ok_or(SvcError::TransportClosed)?;
                break;
            }
            maybe = recv_envelope(stream) => {
                relay_register_envelope(maybe?, &gate, &adder, sink).await?;
            }
        }
    }
    send_envelope(sink, &Envelope::existing_device_done()).await?;

    loop {
        let envelope = recv_envelope(stream)
            .await?
            .ok_or(SvcError::TransportClosed)?;
        match envelope.kind {
            EnvelopeKind::NewDeviceDone => {
                let _ = rendezvous.new_device_done_tx.try_send(());
                break;
            }
            EnvelopeKind::StoredClient | EnvelopeKind::Tss => continue,
            EnvelopeKind::Error => return Err(SvcError::ProtocolViolation(envelope.payload)),
            _ => {
                if !gate.admit(&envelope) {
                    continue;
                }
                send_envelope(sink, &Envelope::error("unexpected envelope kind")).await?;
                return Err(SvcError::ProtocolViolation(format!(
                    "{} during terminal handshake",
                    envelope.kind.as_str()
                )));
            }
        }
    }

    drain.abort();
    Ok(())
}

/// Inbound handling shared by the register session's routing phases.
async fn relay_register_envelope(
    envelope: Option<Envelope>,
    gate: &StageGate,
    adder: &ServerAdd,
    sink: &SharedSink,
) -> Result<()> {
    let envelope = envelope.ok_or(SvcError::TransportClosed)?;
    if !gate.admit(&envelope) {
        return Ok(());
    }
    match envelope.kind {
        EnvelopeKind::Tss => adder.handle_relay(envelope.tss_frame()?).map_err(Into::into),
        EnvelopeKind::StoredClient => Ok(()),
        EnvelopeKind::Error => Err(SvcError::ProtocolViolation(envelope.payload)),
        _ => {
            send_envelope(sink, &Envelope::error("unexpected envelope kind")).await?;
            Err(SvcError::ProtocolViolation(format!(
                "{} during share-adding",
                envelope.kind.as_str()
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// /accept: the enrolled device's session

pub async fn accept(
    ws: WebSocketUpgrade,
    query: CeremonyQuery,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let (token, entry) = match authorize_ceremony(&state, &query) {
        Ok(authorized) => authorized,
        Err(err) => return err.into_response(),
    };

    // The register session must have opened the rendezvous first.
    let rendezvous = match state.rendezvous.claim(&entry.user_id) {
        Ok(side) => side,
        Err(err) => return err.into_response(),
    };

    let agent = user_agent(&headers);
    let user_id = entry.user_id.clone();
    ws.on_upgrade(move |socket| async move {
        let result = run_accept(state.clone(), socket, rendezvous, &user_id, agent).await;
        match result {
            Ok(()) => {
                state.tokens.delete(&token);
                info!(user_id = %user_id, "accept session complete");
            }
            Err(err) => error!(error = %err, "accept session aborted"),
        }
    })
}

#[instrument(skip_all, fields(user_id = %user_id))]
async fn run_accept(
    state: AppState,
    socket: WebSocket,
    rendezvous: AcceptSide,
    user_id: &str,
    agent: String,
) -> Result<()> {
    let (sink, mut stream) = split_socket(socket);
    let outcome = tokio::time::timeout(
        state.config.session_deadline,
        drive_accept(&state, &sink, &mut stream, rendezvous, user_id, &agent),
    )
    .await;

    match outcome {
        Ok(Ok(())) => {
            close_normal(&sink).await;
            Ok(())
        }
        Ok(Err(err)) => {
            close_error(&sink).await;
            Err(err)
        }
        Err(_) => {
            close_error(&sink).await;
            Err(SvcError::Timeout)
        }
    }
}

async fn drive_accept(
    state: &AppState,
    sink: &SharedSink,
    stream: &mut SplitStream<WebSocket>,
    mut rendezvous: AcceptSide,
    user_id: &str,
    _agent: &str,
) -> Result<()> {
    let mut gate = StageGate::new();

    // Peer-id swap with the register session.
    let existing_id = expect_peer_id(stream, &gate).await?;
    rendezvous
        .existing_peer_id_tx
        .send(existing_id.clone())
        .await
        .map_err(|_| SvcError::Internal("rendezvous dropped".into()))?;
    let new_id = rendezvous
        .new_peer_id_rx
        .recv()
        .await
        .ok_or(SvcError::TransportClosed)?;
    send_envelope(sink, &Envelope::peer_id(&new_id)).await?;

    // The enrolled device supplies the custody key that opens the wallet.
    let metadata = loop {
        let envelope = recv_envelope(stream)
            .await?
            .ok_or(SvcError::TransportClosed)?;
        match envelope.kind {
            EnvelopeKind::Metadata => {
                if !gate.admit(&envelope) {
                    continue;
                }
                if envelope.payload.is_empty() {
                    return Err(SvcError::BadRequest("missing metadata".into()));
                }
                break envelope.payload;
            }
            EnvelopeKind::Error => return Err(SvcError::ProtocolViolation(envelope.payload)),
            _ => {
                if !gate.admit(&envelope) {
                    continue;
                }
                send_envelope(sink, &Envelope::error("unexpected envelope kind")).await?;
                return Err(SvcError::ProtocolViolation(format!(
                    "{} during metadata exchange",
                    envelope.kind.as_str()
                )));
            }
        }
    };
    rendezvous
        .metadata_tx
        .send(metadata.clone())
        .await
        .map_err(|_| SvcError::Internal("rendezvous dropped".into()))?;

    // The register session builds the shared old-peer service.
    let adder = rendezvous
        .adder_rx
        .recv()
        .await
        .ok_or(SvcError::TransportClosed)?;
    let new_device_agent = rendezvous
        .user_agent_rx
        .recv()
        .await
        .ok_or(SvcError::TransportClosed)?;

    send_envelope(sink, &Envelope::metadata_ack()).await?;
    gate.advance(30);

    let (_cancel_guard, cancel_rx) = CancelGuard::new();
    let (errs_tx, mut errs_rx) = mpsc::channel(2);
    let drain = spawn_drain(
        adder.peer_manager(),
        existing_id.clone(),
        sink.clone(),
        cancel_rx,
        errs_tx,
    );

    // Drive the hub's own old-peer primitive while routing the enrolled
    // device's frames.
    let process = adder.process();
    tokio::pin!(process);
    let updated = loop {
        tokio::select! {
            result = &mut process => break result?,
            maybe = recv_envelope(stream) => {
                let envelope = maybe?.ok_or(SvcError::TransportClosed)?;
                if !gate.admit(&envelope) {
                    continue;
                }
                match envelope.kind {
                    EnvelopeKind::Tss => adder.handle_relay(envelope.tss_frame()?)?,
                    EnvelopeKind::TssDone => {
                        let _ = rendezvous.existing_tss_done_tx.try_send(());
                    }
                    // The device can conclude before the hub's own primitive
                    // is polled to completion; the signal is buffered for the
                    // register session either way.
                    EnvelopeKind::ExistingDeviceDone => {
                        let _ = rendezvous.existing_device_done_tx.try_send(());
                    }
                    EnvelopeKind::Error => {
                        return Err(SvcError::ProtocolViolation(envelope.payload))
                    }
                    _ => {
                        send_envelope(sink, &Envelope::error("unexpected envelope kind")).await?;
                        return Err(SvcError::ProtocolViolation(format!(
                            "{} during share-adding",
                            envelope.kind.as_str()
                        )));
                    }
                }
            }
            Some(err) = errs_rx.recv() => return Err(err),
        }
    };
    gate.advance(40);

    // Merge the refreshed material into the stored wallet and re-seal it
    // under the unchanged metadata.
    let original = adder.original_wallet();
    if updated.pubkey != original.pubkey {
        return Err(SvcError::InconsistentState);
    }
    let merged_bks = crate::vault::merge_bks(&original.bks, &updated.bks)?;
    let mut merged = updated.clone();
    merged.bks = merged_bks;
    state
        .vault
        .add_peer(user_id, &new_id, &new_device_agent, &metadata, &merged)?;
    info!(new_id = %new_id, "wallet re-sealed with the enrolled device");

    // Terminal handshake relays, in both directions.
    loop {
        tokio::select! {
            maybe = recv_envelope(stream) => {
                let envelope = maybe?.ok_or(SvcError::TransportClosed)?;
                match envelope.kind {
                    EnvelopeKind::ExistingDeviceDone => {
                        let _ = rendezvous.existing_device_done_tx.try_send(());
                    }
                    EnvelopeKind::TssDone => {
                        let _ = rendezvous.existing_tss_done_tx.try_send(());
                    }
                    EnvelopeKind::Tss => {
                        adder.handle_relay(envelope.tss_frame()?)?;
                    }
                    EnvelopeKind::Error => {
                        return Err(SvcError::ProtocolViolation(envelope.payload))
                    }
                    _ => continue,
                }
            }
            signalled = rendezvous.new_device_done_rx.recv() => {
                signalled.ok_or(SvcError::TransportClosed)?;
                break;
            }
        }
    }
    send_envelope(sink, &Envelope::new_device_done()).await?;

    drain.abort();
    Ok(())
}

/// First envelope of every add-share session: the dialler's participant id.
async fn expect_peer_id(
    stream: &mut SplitStream<WebSocket>,
    gate: &StageGate,
) -> Result<String> {
    loop {
        let envelope = recv_envelope(stream)
            .await?
            .ok_or(SvcError::TransportClosed)?;
        match envelope.kind {
            EnvelopeKind::PeerId => {
                if !gate.admit(&envelope) {
                    continue;
                }
                if envelope.payload.is_empty() || envelope.payload == SERVER_ID {
                    return Err(SvcError::BadRequest("invalid participant id".into()));
                }
                return Ok(envelope.payload);
            }
            EnvelopeKind::Error => return Err(SvcError::ProtocolViolation(envelope.payload)),
            _ => {
                if !gate.admit(&envelope) {
                    continue;
                }
                return Err(SvcError::ProtocolViolation(format!(
                    "{} during peer exchange",
                    envelope.kind.as_str()
                )));
            }
        }
    }
}
