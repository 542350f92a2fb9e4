//! Process-wide registries: access tokens and the add-share rendezvous
//!
//! Both caches are shared by every session but hand out only short-lived
//! handles; nothing stored here outlives the ceremony it serves.

use dashmap::DashMap;
use sigil_core::ServerAdd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Result, SvcError};

/// One minted access token: user binding, optional custody key, expiry
#[derive(Debug, Clone)]
pub struct TokenEntry {
    pub user_id: String,
    pub metadata: Option<String>,
    expires_at: Instant,
}

/// Single-use access tokens with a short TTL.
///
/// Tokens are minted by `authorize`, looked up by every ceremony endpoint
/// and deleted on ceremony success; expired entries are swept periodically.
pub struct TokenCache {
    entries: DashMap<String, TokenEntry>,
    ttl: Duration,
}

impl TokenCache {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            ttl,
        })
    }

    /// Mint a fresh token bound to `{user_id, metadata}`
    pub fn mint(&self, user_id: &str, metadata: Option<String>) -> String {
        let token = Uuid::new_v4().to_string();
        self.entries.insert(
            token.clone(),
            TokenEntry {
                user_id: user_id.to_string(),
                metadata,
                expires_at: Instant::now() + self.ttl,
            },
        );
        token
    }

    /// Resolve a token, dropping it if expired.
    pub fn get(&self, token: &str) -> Result<TokenEntry> {
        let entry = self
            .entries
            .get(token)
            .ok_or(SvcError::Unauthorized)?
            .clone();
        if entry.expires_at <= Instant::now() {
            self.entries.remove(token);
            return Err(SvcError::Unauthorized);
        }
        Ok(entry)
    }

    /// Consume a token after the ceremony it authorised.
    pub fn delete(&self, token: &str) {
        self.entries.remove(token);
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Background task removing expired tokens.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                cache.sweep();
            }
        })
    }
}

/// Capacity-1 handoffs between the two hub handlers of one add-share session.
///
/// The `/register` handler (serving the joining device) holds one side, the
/// `/accept` handler (serving the enrolled device) claims the other; each
/// value crosses exactly once.
pub struct RegisterSide {
    pub new_peer_id_tx: mpsc::Sender<String>,
    pub existing_peer_id_rx: mpsc::Receiver<String>,
    pub user_agent_tx: mpsc::Sender<String>,
    pub metadata_rx: mpsc::Receiver<String>,
    pub adder_tx: mpsc::Sender<Arc<ServerAdd>>,
    pub existing_tss_done_rx: mpsc::Receiver<()>,
    pub new_device_done_tx: mpsc::Sender<()>,
    pub existing_device_done_rx: mpsc::Receiver<()>,
}

pub struct AcceptSide {
    pub new_peer_id_rx: mpsc::Receiver<String>,
    pub existing_peer_id_tx: mpsc::Sender<String>,
    pub user_agent_rx: mpsc::Receiver<String>,
    pub metadata_tx: mpsc::Sender<String>,
    pub adder_rx: mpsc::Receiver<Arc<ServerAdd>>,
    pub existing_tss_done_tx: mpsc::Sender<()>,
    pub new_device_done_rx: mpsc::Receiver<()>,
    pub existing_device_done_tx: mpsc::Sender<()>,
}

fn rendezvous_pair() -> (RegisterSide, AcceptSide) {
    let (new_peer_id_tx, new_peer_id_rx) = mpsc::channel(1);
    let (existing_peer_id_tx, existing_peer_id_rx) = mpsc::channel(1);
    let (user_agent_tx, user_agent_rx) = mpsc::channel(1);
    let (metadata_tx, metadata_rx) = mpsc::channel(1);
    let (adder_tx, adder_rx) = mpsc::channel(1);
    let (existing_tss_done_tx, existing_tss_done_rx) = mpsc::channel(1);
    let (new_device_done_tx, new_device_done_rx) = mpsc::channel(1);
    let (existing_device_done_tx, existing_device_done_rx) = mpsc::channel(1);

    (
        RegisterSide {
            new_peer_id_tx,
            existing_peer_id_rx,
            user_agent_tx,
            metadata_rx,
            adder_tx,
            existing_tss_done_rx,
            new_device_done_tx,
            existing_device_done_rx,
        },
        AcceptSide {
            new_peer_id_rx,
            existing_peer_id_tx,
            user_agent_rx,
            metadata_tx,
            adder_rx,
            existing_tss_done_tx,
            new_device_done_rx,
            existing_device_done_tx,
        },
    )
}

/// Per-user rendezvous map for in-flight add-share sessions
#[derive(Default)]
pub struct AddShareRegistry {
    pending: DashMap<String, AcceptSide>,
}

impl AddShareRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a rendezvous for `user_id`. A second concurrent add-share for
    /// the same user is a conflict.
    pub fn begin(&self, user_id: &str) -> Result<RegisterSide> {
        let (register, accept) = rendezvous_pair();
        match self.pending.entry(user_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SvcError::Conflict),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(accept);
                Ok(register)
            }
        }
    }

    /// Claim the accept side of an open rendezvous.
    pub fn claim(&self, user_id: &str) -> Result<AcceptSide> {
        self.pending
            .remove(user_id)
            .map(|(_, side)| side)
            .ok_or(SvcError::Unauthorized)
    }

    /// Drop a rendezvous that never got claimed (session teardown).
    pub fn end(&self, user_id: &str) {
        self.pending.remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_single_use_by_deletion() {
        let cache = TokenCache::new(Duration::from_secs(60));
        let token = cache.mint("u", Some("aa".into()));

        let entry = cache.get(&token).unwrap();
        assert_eq!(entry.user_id, "u");
        assert_eq!(entry.metadata.as_deref(), Some("aa"));

        cache.delete(&token);
        assert!(matches!(cache.get(&token), Err(SvcError::Unauthorized)));
    }

    #[test]
    fn expired_tokens_are_rejected_and_swept() {
        let cache = TokenCache::new(Duration::from_millis(0));
        let token = cache.mint("u", None);
        assert!(cache.get(&token).is_err());

        let token = cache.mint("u", None);
        cache.sweep();
        assert!(cache.entries.get(&token).is_none());
    }

    #[test]
    fn unknown_token_is_unauthorized() {
        let cache = TokenCache::new(Duration::from_secs(60));
        assert!(matches!(
            cache.get("missing"),
            Err(SvcError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn rendezvous_hands_each_value_across_once() {
        let registry = AddShareRegistry::new();
        let register = registry.begin("u").unwrap();
        let mut accept = registry.claim("u").unwrap();

        register.new_peer_id_tx.send("n".into()).await.unwrap();
        assert_eq!(accept.new_peer_id_rx.recv().await.unwrap(), "n");
    }

    #[test]
    fn concurrent_add_share_for_one_user_conflicts() {
        let registry = AddShareRegistry::new();
        let _register = registry.begin("u").unwrap();
        assert!(matches!(registry.begin("u"), Err(SvcError::Conflict)));

        // a different user is unaffected
        registry.begin("v").unwrap();
    }

    #[test]
    fn claim_without_begin_is_unauthorized() {
        let registry = AddShareRegistry::new();
        assert!(matches!(
            registry.claim("nobody"),
            Err(SvcError::Unauthorized)
        ));
    }
}
