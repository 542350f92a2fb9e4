//! Private-key export: server-side full reconstruction
//!
//! POST with form fields `share` and `clientPeerID`. The hub unseals its
//! own share with the metadata bound to the access token, interpolates the
//! secret from the two holders' shares at x = 0, validates it against the
//! wallet key and returns the 32-byte scalar hex-encoded. The token is
//! consumed immediately.

use axum::extract::State;
use axum::Form;
use serde::Deserialize;
use sigil_core::recover::{recover_private_key, RecoveryHolder};
use sigil_core::{decimal_to_scalar, SERVER_ID};
use tracing::{info, instrument};

use crate::error::{Result, SvcError};
use crate::handlers::{authorize_ceremony, CeremonyQuery};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RecoverForm {
    #[serde(default)]
    share: String,
    #[serde(default, rename = "clientPeerID")]
    client_peer_id: String,
}

#[instrument(skip_all)]
pub async fn handler(
    State(state): State<AppState>,
    query: CeremonyQuery,
    Form(form): Form<RecoverForm>,
) -> Result<String> {
    let (token, entry) = authorize_ceremony(&state, &query)?;

    if form.share.is_empty() || form.client_peer_id.is_empty() {
        return Err(SvcError::BadRequest("missing share or participant id".into()));
    }

    let metadata = entry.metadata.clone().unwrap_or_default();
    let wallet = state.vault.retrieve_wallet(&entry.user_id, &metadata)?;

    let server_bk = wallet
        .bks
        .get(SERVER_ID)
        .ok_or_else(|| SvcError::Internal("stored wallet lacks the server entry".into()))?;
    let client_bk = wallet
        .bks
        .get(&form.client_peer_id)
        .ok_or_else(|| SvcError::BadRequest("unknown participant id".into()))?;

    let holders = [
        RecoveryHolder {
            share: decimal_to_scalar(&wallet.share).map_err(SvcError::from)?,
            x: server_bk.x_scalar().map_err(SvcError::from)?,
        },
        RecoveryHolder {
            share: decimal_to_scalar(&form.share).map_err(SvcError::from)?,
            x: client_bk.x_scalar().map_err(SvcError::from)?,
        },
    ];

    let pubkey = wallet.pubkey.to_point().map_err(SvcError::from)?;
    let private_key = recover_private_key(&pubkey, &holders).map_err(SvcError::from)?;

    state.tokens.delete(&token);
    info!(user_id = %entry.user_id, "private key exported");
    Ok(hex::encode(private_key))
}
