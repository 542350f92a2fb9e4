//! Share custody: the server's wallet material encrypted under a key only
//! clients hold
//!
//! On DKG success the vault mints a random 32-byte client key, seals the
//! server's `DkgResult` with AES-256-GCM under a fresh nonce and persists
//! ciphertext + nonce. The hex key is returned to the client as the
//! metadata string and the server keeps no copy: every later use of the
//! stored share requires the client to present it again. Add-share
//! re-encrypts under the same key: the metadata is constant for the
//! wallet's lifetime.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use dashmap::DashMap;
use rand::RngCore;
use sigil_core::{Bk, DkgResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::error::{Result, SvcError};

const CLIENT_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// One persisted row: a (user, enrolled device) pair
#[derive(Debug, Clone)]
pub struct WalletRow {
    pub foreign_key: String,
    pub peer_id: String,
    pub user_agent: String,
    pub public_address: String,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// Persistence adapter for encrypted wallet rows.
///
/// Implementations must serialise writes per user.
pub trait WalletStore: Send + Sync {
    /// Insert or replace the row of one enrolled device.
    fn put_device(&self, row: WalletRow) -> Result<()>;

    /// Apply re-encrypted wallet material to every row of the user.
    fn refresh_ciphertext(&self, foreign_key: &str, ciphertext: &[u8], nonce: &[u8])
        -> Result<()>;

    /// Any row suitable for server-side use of the wallet.
    fn fetch_any(&self, foreign_key: &str) -> Result<Option<WalletRow>>;

    fn exists(&self, foreign_key: &str) -> Result<bool>;
}

/// In-memory store; the per-user entry lock serialises writes.
#[derive(Default)]
pub struct MemoryStore {
    rows: DashMap<String, Vec<WalletRow>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl WalletStore for MemoryStore {
    fn put_device(&self, row: WalletRow) -> Result<()> {
        let mut rows = self.rows.entry(row.foreign_key.clone()).or_default();
        if let Some(existing) = rows.iter_mut().find(|r| r.peer_id == row.peer_id) {
            *existing = row;
        } else {
            rows.push(row);
        }
        Ok(())
    }

    fn refresh_ciphertext(
        &self,
        foreign_key: &str,
        ciphertext: &[u8],
        nonce: &[u8],
    ) -> Result<()> {
        let mut rows = self
            .rows
            .get_mut(foreign_key)
            .ok_or(SvcError::NotFound)?;
        for row in rows.iter_mut() {
            row.ciphertext = ciphertext.to_vec();
            row.nonce = nonce.to_vec();
        }
        Ok(())
    }

    fn fetch_any(&self, foreign_key: &str) -> Result<Option<WalletRow>> {
        Ok(self
            .rows
            .get(foreign_key)
            .and_then(|rows| rows.first().cloned()))
    }

    fn exists(&self, foreign_key: &str) -> Result<bool> {
        Ok(self
            .rows
            .get(foreign_key)
            .map(|rows| !rows.is_empty())
            .unwrap_or(false))
    }
}

/// Custody layer over a [`WalletStore`]
pub struct Vault {
    store: Arc<dyn WalletStore>,
}

impl Vault {
    pub fn new(store: Arc<dyn WalletStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    pub fn wallet_exists(&self, foreign_key: &str) -> Result<bool> {
        self.store.exists(foreign_key)
    }

    /// Seal and persist a fresh wallet; returns the metadata hex string.
    pub fn store_wallet(
        &self,
        foreign_key: &str,
        peer_id: &str,
        user_agent: &str,
        dkg_result: &DkgResult,
    ) -> Result<String> {
        let mut client_key = Zeroizing::new([0u8; CLIENT_KEY_LEN]);
        rand::rngs::OsRng.fill_bytes(&mut client_key[..]);

        let (nonce, ciphertext) = encrypt_wallet(&client_key, dkg_result)?;
        self.store.put_device(WalletRow {
            foreign_key: foreign_key.to_string(),
            peer_id: peer_id.to_string(),
            user_agent: user_agent.to_string(),
            public_address: dkg_result.address.clone(),
            ciphertext,
            nonce,
        })?;

        Ok(hex::encode(&client_key[..]))
    }

    /// Persist the post-add-share wallet: every row re-encrypted under the
    /// unchanged metadata, plus a row for the newly enrolled device.
    pub fn add_peer(
        &self,
        foreign_key: &str,
        peer_id: &str,
        user_agent: &str,
        metadata: &str,
        dkg_result: &DkgResult,
    ) -> Result<()> {
        let client_key = decode_metadata(metadata)?;
        let (nonce, ciphertext) = encrypt_wallet(&client_key, dkg_result)?;

        self.store
            .refresh_ciphertext(foreign_key, &ciphertext, &nonce)?;
        self.store.put_device(WalletRow {
            foreign_key: foreign_key.to_string(),
            peer_id: peer_id.to_string(),
            user_agent: user_agent.to_string(),
            public_address: dkg_result.address.clone(),
            ciphertext,
            nonce,
        })
    }

    /// Load and unseal the server's wallet material.
    pub fn retrieve_wallet(&self, foreign_key: &str, metadata: &str) -> Result<DkgResult> {
        let row = self
            .store
            .fetch_any(foreign_key)?
            .ok_or(SvcError::NotFound)?;
        let client_key = decode_metadata(metadata)?;
        decrypt_wallet(&client_key, &row.nonce, &row.ciphertext)
    }
}

fn decode_metadata(metadata: &str) -> Result<Zeroizing<[u8; CLIENT_KEY_LEN]>> {
    if metadata.is_empty() {
        return Err(SvcError::BadRequest("missing metadata".into()));
    }
    let bytes = hex::decode(metadata)
        .map_err(|_| SvcError::BadRequest("malformed metadata".into()))?;
    let key: [u8; CLIENT_KEY_LEN] = bytes
        .try_into()
        .map_err(|_| SvcError::BadRequest("malformed metadata".into()))?;
    Ok(Zeroizing::new(key))
}

fn encrypt_wallet(
    key: &Zeroizing<[u8; CLIENT_KEY_LEN]>,
    dkg_result: &DkgResult,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let plaintext = serde_json::to_vec(dkg_result)
        .map_err(|e| SvcError::Internal(format!("wallet encoding: {e}")))?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|_| SvcError::Internal("wallet encryption failed".into()))?;
    Ok((nonce_bytes.to_vec(), ciphertext))
}

fn decrypt_wallet(
    key: &Zeroizing<[u8; CLIENT_KEY_LEN]>,
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<DkgResult> {
    if nonce.len() != NONCE_LEN {
        return Err(SvcError::Internal("malformed stored nonce".into()));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
    // Authentication failure means the presented metadata is not this
    // wallet's key.
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SvcError::Unauthorized)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| SvcError::Internal(format!("wallet decoding: {e}")))
}

/// Merge the pre-ceremony Birkhoff map with the primitive's refreshed one:
/// set union, the primitive's value winning for participants it refreshed.
/// Disagreement on a shared participant means the stored wallet and the
/// ceremony diverged.
pub fn merge_bks(
    original: &BTreeMap<String, Bk>,
    updated: &BTreeMap<String, Bk>,
) -> Result<BTreeMap<String, Bk>> {
    let mut merged = updated.clone();
    for (id, bk) in original {
        match merged.get(id) {
            Some(existing) if existing != bk => return Err(SvcError::InconsistentState),
            Some(_) => {}
            None => {
                merged.insert(id.clone(), bk.clone());
            }
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigil_core::Pubkey;

    fn sample_wallet() -> DkgResult {
        let mut bks = BTreeMap::new();
        bks.insert(
            "server".to_string(),
            Bk {
                x: "7".into(),
                rank: 0,
            },
        );
        bks.insert(
            "device-1".to_string(),
            Bk {
                x: "11".into(),
                rank: 0,
            },
        );
        DkgResult {
            pubkey: Pubkey {
                x: "1".into(),
                y: "2".into(),
            },
            bks,
            share: "42".into(),
            address: "0x00".into(),
            peer_id: "server".into(),
        }
    }

    #[test]
    fn custody_round_trip() {
        let vault = Vault::new(MemoryStore::new());
        let wallet = sample_wallet();

        let metadata = vault
            .store_wallet("u", "device-1", "agent", &wallet)
            .unwrap();
        assert_eq!(metadata.len(), CLIENT_KEY_LEN * 2);

        let restored = vault.retrieve_wallet("u", &metadata).unwrap();
        assert_eq!(restored.share, wallet.share);
        assert_eq!(restored.bks, wallet.bks);
    }

    #[test]
    fn wrong_metadata_is_unauthorized() {
        let vault = Vault::new(MemoryStore::new());
        let wallet = sample_wallet();
        vault
            .store_wallet("u", "device-1", "agent", &wallet)
            .unwrap();

        let wrong = hex::encode([9u8; CLIENT_KEY_LEN]);
        assert!(matches!(
            vault.retrieve_wallet("u", &wrong),
            Err(SvcError::Unauthorized)
        ));
    }

    #[test]
    fn malformed_metadata_is_a_bad_request() {
        let vault = Vault::new(MemoryStore::new());
        let wallet = sample_wallet();
        vault
            .store_wallet("u", "device-1", "agent", &wallet)
            .unwrap();

        assert!(matches!(
            vault.retrieve_wallet("u", "zz"),
            Err(SvcError::BadRequest(_))
        ));
        assert!(matches!(
            vault.retrieve_wallet("u", ""),
            Err(SvcError::BadRequest(_))
        ));
    }

    #[test]
    fn missing_wallet_is_not_found() {
        let vault = Vault::new(MemoryStore::new());
        assert!(matches!(
            vault.retrieve_wallet("ghost", &hex::encode([0u8; 32])),
            Err(SvcError::NotFound)
        ));
    }

    #[test]
    fn add_peer_keeps_the_metadata_constant() {
        let vault = Vault::new(MemoryStore::new());
        let mut wallet = sample_wallet();
        let metadata = vault
            .store_wallet("u", "device-1", "agent", &wallet)
            .unwrap();

        wallet.bks.insert(
            "device-2".to_string(),
            Bk {
                x: "13".into(),
                rank: 0,
            },
        );
        wallet.share = "43".into();
        vault
            .add_peer("u", "device-2", "agent-2", &metadata, &wallet)
            .unwrap();

        let restored = vault.retrieve_wallet("u", &metadata).unwrap();
        assert_eq!(restored.share, "43");
        assert_eq!(restored.bks.len(), 3);
    }

    #[test]
    fn merge_preserves_union_and_detects_divergence() {
        let wallet = sample_wallet();
        let mut updated = wallet.bks.clone();
        updated.insert(
            "device-2".to_string(),
            Bk {
                x: "13".into(),
                rank: 0,
            },
        );
        let mut original = wallet.bks.clone();
        original.insert(
            "device-0".to_string(),
            Bk {
                x: "5".into(),
                rank: 0,
            },
        );

        let merged = merge_bks(&original, &updated).unwrap();
        let keys: Vec<&str> = merged.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["device-0", "device-1", "device-2", "server"]);

        let mut diverged = original.clone();
        diverged.insert(
            "server".to_string(),
            Bk {
                x: "999".into(),
                rank: 0,
            },
        );
        assert!(matches!(
            merge_bks(&diverged, &updated),
            Err(SvcError::InconsistentState)
        ));
    }
}
