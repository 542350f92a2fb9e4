//! Hub side of the signing ceremony
//!
//! The digest and the client's participant id arrive as query parameters;
//! the stored wallet is unsealed with the metadata bound to the access
//! token, and the two signer services exchange rounds until both terminate.
//! The hub never returns the signature; the client assembles its own copy.

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use sigil_core::ServerSigner;
use sigil_session::{Envelope, EnvelopeKind, StageGate};
use tokio::sync::mpsc;
use tracing::{error, info, instrument};

use crate::error::{Result, SvcError};
use crate::handlers::{authorize_ceremony, CeremonyQuery};
use crate::session::{
    close_error, close_normal, flush_outbound, recv_envelope, send_envelope, spawn_drain,
    split_socket, CancelGuard,
};
use crate::AppState;

pub async fn handler(
    ws: WebSocketUpgrade,
    query: CeremonyQuery,
    State(state): State<AppState>,
) -> Response {
    let (token, entry) = match authorize_ceremony(&state, &query) {
        Ok(authorized) => authorized,
        Err(err) => return err.into_response(),
    };

    let digest = match query
        .get("msg")
        .ok_or_else(|| SvcError::BadRequest("no message to be signed".into()))
        .and_then(|hex_digest| parse_digest(hex_digest))
    {
        Ok(digest) => digest,
        Err(err) => return err.into_response(),
    };
    let client_id = match query
        .get("peer")
        .filter(|peer| !peer.is_empty())
        .ok_or_else(|| SvcError::BadRequest("no client participant id".into()))
    {
        Ok(peer) => peer.clone(),
        Err(err) => return err.into_response(),
    };

    // Unseal the wallet with the custody key bound to this token.
    let metadata = entry.metadata.clone().unwrap_or_default();
    let wallet = match state.vault.retrieve_wallet(&entry.user_id, &metadata) {
        Ok(wallet) => wallet,
        Err(err) => return err.into_response(),
    };

    let signer = match ServerSigner::new(
        &client_id,
        &wallet.pubkey,
        &wallet.share,
        &wallet.bks,
        digest,
    ) {
        Ok(signer) => signer,
        Err(err) => return SvcError::from(err).into_response(),
    };

    let user_id = entry.user_id.clone();
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = run(state, socket, token, user_id, client_id, signer).await {
            error!(error = %err, "sign session aborted");
        }
    })
}

fn parse_digest(hex_digest: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_digest)
        .map_err(|_| SvcError::BadRequest("malformed message digest".into()))?;
    bytes
        .try_into()
        .map_err(|_| SvcError::BadRequest("digest must be 32 bytes".into()))
}

#[instrument(skip_all, fields(user_id = %user_id, client_id = %client_id))]
async fn run(
    state: AppState,
    socket: WebSocket,
    token: String,
    user_id: String,
    client_id: String,
    signer: ServerSigner,
) -> Result<()> {
    let (sink, mut stream) = split_socket(socket);

    let (_cancel_guard, cancel_rx) = CancelGuard::new();
    let (errs_tx, mut errs_rx) = mpsc::channel(2);
    let drain = spawn_drain(
        signer.peer_manager(),
        client_id.clone(),
        sink.clone(),
        cancel_rx,
        errs_tx,
    );

    let gate = StageGate::new();
    let outcome = tokio::time::timeout(state.config.session_deadline, async {
        let process = signer.process();
        tokio::pin!(process);
        loop {
            tokio::select! {
                result = &mut process => return result.map_err(SvcError::from).map(|_| ()),
                maybe = recv_envelope(&mut stream) => {
                    let envelope = maybe?.ok_or(SvcError::TransportClosed)?;
                    if !gate.admit(&envelope) {
                        continue;
                    }
                    match envelope.kind {
                        EnvelopeKind::Tss => signer.handle_relay(envelope.tss_frame()?)?,
                        EnvelopeKind::Error => {
                            return Err(SvcError::ProtocolViolation(envelope.payload))
                        }
                        _ => {
                            send_envelope(&sink, &Envelope::error("unexpected envelope kind"))
                                .await?;
                            return Err(SvcError::ProtocolViolation(format!(
                                "{} during signing",
                                envelope.kind.as_str()
                            )));
                        }
                    }
                }
                Some(err) = errs_rx.recv() => return Err(err),
            }
        }
    })
    .await;

    match outcome {
        Ok(Ok(())) => {
            // The client may still be waiting on this side's final round.
            flush_outbound(&signer.peer_manager(), &client_id).await;
            drain.abort();
            close_normal(&sink).await;
            state.tokens.delete(&token);
            info!("sign session complete");
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
