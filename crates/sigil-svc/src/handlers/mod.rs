//! HTTP and WebSocket endpoint handlers

pub mod add;
pub mod dkg;
pub mod recover;
pub mod sign;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Extension;
use std::collections::HashMap;

use crate::auth::{bearer_from_headers, CustodyHeaders};
use crate::error::{Result, SvcError};
use crate::registry::TokenEntry;
use crate::AppState;

/// Resolve the caller's identity through the configured auth provider.
pub async fn identify(State(state): State<AppState>, headers: HeaderMap) -> Result<String> {
    let bearer = bearer_from_headers(&headers)?;
    state.auth.user_id(&bearer).await
}

/// Mint a single-use access token bound to `{userId, metadata}`.
pub async fn authorize(
    State(state): State<AppState>,
    Extension(custody): Extension<CustodyHeaders>,
    headers: HeaderMap,
) -> Result<String> {
    let bearer = bearer_from_headers(&headers)?;
    let user_id = state.auth.user_id(&bearer).await?;
    let metadata = custody.metadata().map(str::to_string);
    Ok(state.tokens.mint(&user_id, metadata))
}

/// Validate the `?token=` query parameter of a ceremony request.
pub(crate) fn authorize_ceremony(
    state: &AppState,
    params: &HashMap<String, String>,
) -> Result<(String, TokenEntry)> {
    let token = params.get("token").ok_or(SvcError::Unauthorized)?;
    let entry = state.tokens.get(token)?;
    Ok((token.clone(), entry))
}

pub(crate) fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

// Re-export the query alias the ws handlers share.
pub(crate) type CeremonyQuery = Query<HashMap<String, String>>;
