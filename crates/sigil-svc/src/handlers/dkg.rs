//! Hub side of the DKG ceremony
//!
//! The client dials in, announces its participant id, and both sides run
//! their DKG services over `tss` envelopes. On success the hub seals the
//! resulting wallet into the vault, hands the metadata to the client and
//! waits for the acknowledgement before closing.

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use sigil_core::{ServerDkg, SERVER_ID};
use sigil_session::{Envelope, EnvelopeKind, StageGate};
use tokio::sync::mpsc;
use tracing::{error, info, instrument};

use crate::error::{Result, SvcError};
use crate::handlers::{authorize_ceremony, user_agent, CeremonyQuery};
use crate::registry::TokenEntry;
use crate::session::{
    close_error, close_normal, recv_envelope, send_envelope, spawn_drain, split_socket,
    CancelGuard, SharedSink,
};
use crate::AppState;

pub async fn handler(
    ws: WebSocketUpgrade,
    query: CeremonyQuery,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let (token, entry) = match authorize_ceremony(&state, &query) {
        Ok(authorized) => authorized,
        Err(err) => return err.into_response(),
    };

    // One wallet per user: a second DKG is a conflict.
    match state.vault.wallet_exists(&entry.user_id) {
        Ok(false) => {}
        Ok(true) => return SvcError::Conflict.into_response(),
        Err(err) => return err.into_response(),
    }

    let agent = user_agent(&headers);
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = run(state, socket, token, entry, agent).await {
            error!(error = %err, "dkg session aborted");
        }
    })
}

#[instrument(skip_all, fields(user_id = %entry.user_id))]
async fn run(
    state: AppState,
    socket: WebSocket,
    token: String,
    entry: TokenEntry,
    agent: String,
) -> Result<()> {
    let (sink, mut stream) = split_socket(socket);

    let outcome = tokio::time::timeout(
        state.config.session_deadline,
        drive(&state, &sink, &mut stream, &entry, &agent),
    )
    .await;

    match outcome {
        Ok(Ok(())) => {
            state.tokens.delete(&token);
            close_normal(&sink).await;
            info!("dkg session complete");
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

async fn drive(
    state: &AppState,
    sink: &SharedSink,
    stream: &mut futures_util::stream::SplitStream<WebSocket>,
    entry: &TokenEntry,
    agent: &str,
) -> Result<()> {
    let mut gate = StageGate::new();

    // The client announces its participant id first.
    let client_id = loop {
        let envelope = recv_envelope(stream)
            .await?
            .ok_or(SvcError::TransportClosed)?;
        match envelope.kind {
            EnvelopeKind::Error => return Err(SvcError::ProtocolViolation(envelope.payload)),
            EnvelopeKind::PeerId => {
                if !gate.admit(&envelope) {
                    continue;
                }
                if envelope.payload.is_empty() || envelope.payload == SERVER_ID {
                    return Err(SvcError::BadRequest("invalid participant id".into()));
                }
                break envelope.payload;
            }
            _ => {
                if !gate.admit(&envelope) {
                    continue;
                }
                send_envelope(sink, &Envelope::error("unexpected envelope kind")).await?;
                return Err(SvcError::ProtocolViolation(format!(
                    "{} during peer exchange",
                    envelope.kind.as_str()
                )));
            }
        }
    };
    info!(client_id = %client_id, "dkg peer announced");

    let dkg = ServerDkg::new(&client_id)?;
    gate.advance(30);

    let (_cancel_guard, cancel_rx) = CancelGuard::new();
    let (errs_tx, mut errs_rx) = mpsc::channel(2);
    let drain = spawn_drain(
        dkg.peer_manager(),
        client_id.clone(),
        sink.clone(),
        cancel_rx,
        errs_tx,
    );

    // Run the primitive while feeding it the client's frames.
    let process = dkg.process();
    tokio::pin!(process);
    let dkg_result = loop {
        tokio::select! {
            result = &mut process => break result?,
            maybe = recv_envelope(stream) => {
                let envelope = maybe?.ok_or(SvcError::TransportClosed)?;
                if !gate.admit(&envelope) {
                    continue;
                }
                match envelope.kind {
                    EnvelopeKind::Tss => dkg.handle_relay(envelope.tss_frame()?)?,
                    EnvelopeKind::Error => {
                        return Err(SvcError::ProtocolViolation(envelope.payload))
                    }
                    _ => {
                        send_envelope(sink, &Envelope::error("unexpected envelope kind")).await?;
                        return Err(SvcError::ProtocolViolation(format!(
                            "{} during key generation",
                            envelope.kind.as_str()
                        )));
                    }
                }
            }
            Some(err) = errs_rx.recv() => return Err(err),
        }
    };
    gate.advance(40);

    // Seal the server's material; the hex client key becomes the metadata.
    let metadata = state
        .vault
        .store_wallet(&entry.user_id, &client_id, agent, &dkg_result)?;
    send_envelope(sink, &Envelope::metadata(&metadata)).await?;

    // The session only concludes once the client confirmed storage.
    loop {
        let envelope = recv_envelope(stream)
            .await?
            .ok_or(SvcError::TransportClosed)?;
        match envelope.kind {
            EnvelopeKind::MetadataAck => break,
            EnvelopeKind::Tss => continue,
            EnvelopeKind::Error => return Err(SvcError::ProtocolViolation(envelope.payload)),
            _ => {
                if !gate.admit(&envelope) {
                    continue;
                }
                send_envelope(sink, &Envelope::error("unexpected envelope kind")).await?;
                return Err(SvcError::ProtocolViolation(format!(
                    "{} while awaiting acknowledgement",
                    envelope.kind.as_str()
                )));
            }
        }
    }

    drain.abort();
    Ok(())
}
