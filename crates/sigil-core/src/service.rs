//! Ceremony services: lifecycle control around a primitive state machine
//!
//! A [`CeremonyService`] binds one primitive to a [`PeerManager`], installs
//! the inbound handler that feeds the machine, and exposes `process()`:
//! start, wait for the terminal state, extract the result. It also offers a
//! `done` channel that becomes observable before `process` returns. The role
//! constructors at the bottom build the peer manager and machine for each
//! (ceremony, role) pair.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::addshare::{NewPeerMachine, OldPeerMachine};
use crate::dkg::DkgMachine;
use crate::peer::{PeerManager, RelayFrame};
use crate::sign::SignerMachine;
use crate::types::{scalar_to_decimal, Bk, DkgResult, Pubkey, Signature, SERVER_ID};
use crate::types::{decimal_to_scalar, finalize_signature};
use crate::{Error, Result};

/// Lifecycle states of a primitive state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Pending,
    Running,
    Done,
    Failed,
}

/// The uniform surface of a primitive state machine
pub trait Ceremony: Send + 'static {
    type Output: Send + 'static;

    /// Begin the protocol, emitting any first-round messages.
    fn start(&mut self) -> Result<()>;

    /// Feed one inbound primitive message.
    fn add_message(&mut self, from: &str, body: &[u8]) -> Result<()>;

    fn state(&self) -> MachineState;

    /// Take the terminal output; `Some` exactly once after `Done`.
    fn take_outcome(&mut self) -> Option<Self::Output>;
}

/// Lifecycle wrapper around one primitive instance
pub struct CeremonyService<C: Ceremony> {
    machine: Arc<Mutex<C>>,
    pm: Arc<PeerManager>,
    done_tx: Arc<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
}

impl<C: Ceremony> CeremonyService<C> {
    /// Bind `machine` to `pm` and register the inbound handler. Must be
    /// called exactly once per ceremony, before any message is delivered.
    pub fn new(machine: C, pm: Arc<PeerManager>) -> Result<Arc<Self>> {
        let machine = Arc::new(Mutex::new(machine));
        let (done_tx, done_rx) = watch::channel(false);
        let done_tx = Arc::new(done_tx);

        let handler_machine = Arc::clone(&machine);
        let handler_done = Arc::clone(&done_tx);
        pm.register_inbound(move |from, body| {
            let mut guard = handler_machine
                .lock()
                .map_err(|_| Error::Internal("machine lock poisoned".into()))?;
            let result = guard.add_message(from, body);
            if matches!(guard.state(), MachineState::Done | MachineState::Failed) {
                let _ = handler_done.send(true);
            }
            result
        })?;

        Ok(Arc::new(Self {
            machine,
            pm,
            done_tx,
            done_rx,
        }))
    }

    pub fn peer_manager(&self) -> Arc<PeerManager> {
        Arc::clone(&self.pm)
    }

    /// Terminal-state signal; flips to `true` once, on success or failure.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Consume a frame routed through this participant: deliver it to the
    /// local primitive when addressed here, re-queue it outbound otherwise.
    pub fn handle_relay(&self, frame: RelayFrame) -> Result<()> {
        if frame.to == self.pm.self_id() {
            self.pm.handle_inbound(&frame.from, &frame.body)
        } else {
            self.pm.requeue(frame);
            Ok(())
        }
    }

    /// Start the primitive, wait until it terminates, return its output.
    pub async fn process(&self) -> Result<C::Output> {
        {
            let mut guard = self
                .machine
                .lock()
                .map_err(|_| Error::Internal("machine lock poisoned".into()))?;
            guard.start()?;
            // Buffered messages replayed by start can already be terminal.
            if matches!(guard.state(), MachineState::Done | MachineState::Failed) {
                let _ = self.done_tx.send(true);
            }
        }

        let mut rx = self.done_rx.clone();
        loop {
            {
                let guard = self
                    .machine
                    .lock()
                    .map_err(|_| Error::Internal("machine lock poisoned".into()))?;
                match guard.state() {
                    MachineState::Done | MachineState::Failed => break,
                    _ => {}
                }
            }
            rx.changed()
                .await
                .map_err(|_| Error::Internal("done channel closed".into()))?;
        }
        let _ = self.done_tx.send(true);

        let mut guard = self
            .machine
            .lock()
            .map_err(|_| Error::Internal("machine lock poisoned".into()))?;
        match guard.state() {
            MachineState::Done => guard
                .take_outcome()
                .ok_or_else(|| Error::Internal("terminal state without outcome".into())),
            _ => Err(Error::TssProcessFailed),
        }
    }
}

fn key_material(
    pubkey: &k256::ProjectivePoint,
    share: &k256::Scalar,
    bks: BTreeMap<String, Bk>,
    peer_id: &str,
) -> Result<DkgResult> {
    let pubkey = Pubkey::from_point(pubkey)?;
    let address = pubkey.address()?;
    Ok(DkgResult {
        pubkey,
        bks,
        share: scalar_to_decimal(share),
        address,
        peer_id: peer_id.to_string(),
    })
}

/// Pick the Birkhoff entries of the two current holders out of a wallet's map
fn sub_bks(
    bks: &BTreeMap<String, Bk>,
    first: &str,
    second: &str,
) -> Result<BTreeMap<String, Bk>> {
    let mut subset = BTreeMap::new();
    for id in [first, second] {
        let bk = bks
            .get(id)
            .ok_or_else(|| Error::InvalidConfig(format!("no Birkhoff entry for {id}")))?;
        subset.insert(id.to_string(), bk.clone());
    }
    Ok(subset)
}

// ---------------------------------------------------------------------------
// DKG roles

/// Hub side of distributed key generation
pub struct ServerDkg {
    svc: Arc<CeremonyService<DkgMachine>>,
}

impl ServerDkg {
    pub fn new(client_id: &str) -> Result<Self> {
        let pm = Arc::new(PeerManager::new(SERVER_ID));
        pm.add_peer(client_id);
        let machine = DkgMachine::new(Arc::clone(&pm))?;
        Ok(Self {
            svc: CeremonyService::new(machine, pm)?,
        })
    }

    pub async fn process(&self) -> Result<DkgResult> {
        let outcome = self.svc.process().await?;
        key_material(&outcome.pubkey, &outcome.share, outcome.bks, SERVER_ID)
    }

    pub fn peer_manager(&self) -> Arc<PeerManager> {
        self.svc.peer_manager()
    }

    pub fn handle_relay(&self, frame: RelayFrame) -> Result<()> {
        self.svc.handle_relay(frame)
    }

    pub fn done(&self) -> watch::Receiver<bool> {
        self.svc.done()
    }
}

/// Device side of distributed key generation
pub struct ClientDkg {
    svc: Arc<CeremonyService<DkgMachine>>,
    peer_id: String,
}

impl ClientDkg {
    pub fn new(peer_id: &str) -> Result<Self> {
        let pm = Arc::new(PeerManager::new(peer_id));
        pm.add_peer(SERVER_ID);
        let machine = DkgMachine::new(Arc::clone(&pm))?;
        Ok(Self {
            svc: CeremonyService::new(machine, pm)?,
            peer_id: peer_id.to_string(),
        })
    }

    pub async fn process(&self) -> Result<DkgResult> {
        let outcome = self.svc.process().await?;
        key_material(&outcome.pubkey, &outcome.share, outcome.bks, &self.peer_id)
    }

    pub fn peer_manager(&self) -> Arc<PeerManager> {
        self.svc.peer_manager()
    }

    pub fn handle_relay(&self, frame: RelayFrame) -> Result<()> {
        self.svc.handle_relay(frame)
    }

    pub fn done(&self) -> watch::Receiver<bool> {
        self.svc.done()
    }
}

// ---------------------------------------------------------------------------
// Signing roles

fn signer_service(
    self_id: &str,
    peer_id: &str,
    pubkey: &Pubkey,
    share: &str,
    bks: &BTreeMap<String, Bk>,
    digest: [u8; 32],
) -> Result<Arc<CeremonyService<SignerMachine>>> {
    let pm = Arc::new(PeerManager::new(self_id));
    pm.add_peer(peer_id);
    let machine = SignerMachine::new(Arc::clone(&pm), pubkey, share, bks, digest)?;
    CeremonyService::new(machine, pm)
}

/// Hub side of a signing ceremony
pub struct ServerSigner {
    svc: Arc<CeremonyService<SignerMachine>>,
    pubkey: Pubkey,
    digest: [u8; 32],
}

impl ServerSigner {
    pub fn new(
        client_id: &str,
        pubkey: &Pubkey,
        share: &str,
        bks: &BTreeMap<String, Bk>,
        digest: [u8; 32],
    ) -> Result<Self> {
        Ok(Self {
            svc: signer_service(SERVER_ID, client_id, pubkey, share, bks, digest)?,
            pubkey: pubkey.clone(),
            digest,
        })
    }

    pub async fn process(&self) -> Result<Signature> {
        let outcome = self.svc.process().await?;
        finalize_signature(&self.pubkey, &self.digest, &outcome.r, &outcome.s)
    }

    pub fn peer_manager(&self) -> Arc<PeerManager> {
        self.svc.peer_manager()
    }

    pub fn handle_relay(&self, frame: RelayFrame) -> Result<()> {
        self.svc.handle_relay(frame)
    }

    pub fn done(&self) -> watch::Receiver<bool> {
        self.svc.done()
    }
}

/// Device side of a signing ceremony
pub struct ClientSigner {
    svc: Arc<CeremonyService<SignerMachine>>,
    pubkey: Pubkey,
    digest: [u8; 32],
}

impl ClientSigner {
    pub fn new(
        peer_id: &str,
        pubkey: &Pubkey,
        share: &str,
        bks: &BTreeMap<String, Bk>,
        digest: [u8; 32],
    ) -> Result<Self> {
        Ok(Self {
            svc: signer_service(peer_id, SERVER_ID, pubkey, share, bks, digest)?,
            pubkey: pubkey.clone(),
            digest,
        })
    }

    pub async fn process(&self) -> Result<Signature> {
        let outcome = self.svc.process().await?;
        finalize_signature(&self.pubkey, &self.digest, &outcome.r, &outcome.s)
    }

    pub fn peer_manager(&self) -> Arc<PeerManager> {
        self.svc.peer_manager()
    }

    pub fn handle_relay(&self, frame: RelayFrame) -> Result<()> {
        self.svc.handle_relay(frame)
    }

    pub fn done(&self) -> watch::Receiver<bool> {
        self.svc.done()
    }
}

// ---------------------------------------------------------------------------
// Add-share roles

/// Hub side of share-adding: the old-peer role at the server
pub struct ServerAdd {
    svc: Arc<CeremonyService<OldPeerMachine>>,
    original: DkgResult,
}

impl ServerAdd {
    pub fn new(
        new_id: &str,
        existing_id: &str,
        pubkey: &Pubkey,
        share: &str,
        bks: &BTreeMap<String, Bk>,
    ) -> Result<Self> {
        let pm = Arc::new(PeerManager::new(SERVER_ID));
        pm.add_peer(existing_id);
        pm.add_peer(new_id);
        let machine = OldPeerMachine::new(
            Arc::clone(&pm),
            pubkey,
            &decimal_to_scalar(share)?,
            sub_bks(bks, SERVER_ID, existing_id)?,
            new_id,
        )?;
        let original = DkgResult {
            pubkey: pubkey.clone(),
            bks: bks.clone(),
            share: share.to_string(),
            address: pubkey.address()?,
            peer_id: SERVER_ID.to_string(),
        };
        Ok(Self {
            svc: CeremonyService::new(machine, pm)?,
            original,
        })
    }

    /// The wallet state this ceremony started from.
    pub fn original_wallet(&self) -> &DkgResult {
        &self.original
    }

    /// The refreshed server-side key material, with the primitive's BKs:
    /// the caller merges them with the pre-ceremony wallet state.
    pub async fn process(&self) -> Result<DkgResult> {
        let outcome = self.svc.process().await?;
        key_material(&outcome.pubkey, &outcome.share, outcome.bks, SERVER_ID)
    }

    pub fn peer_manager(&self) -> Arc<PeerManager> {
        self.svc.peer_manager()
    }

    pub fn handle_relay(&self, frame: RelayFrame) -> Result<()> {
        self.svc.handle_relay(frame)
    }

    pub fn done(&self) -> watch::Receiver<bool> {
        self.svc.done()
    }
}

/// Old-peer role at an already enrolled device
pub struct ExistingClientAdd {
    svc: Arc<CeremonyService<OldPeerMachine>>,
    peer_id: String,
    wallet_bks: BTreeMap<String, Bk>,
}

impl ExistingClientAdd {
    pub fn new(
        peer_id: &str,
        new_id: &str,
        pubkey: &Pubkey,
        share: &str,
        bks: &BTreeMap<String, Bk>,
    ) -> Result<Self> {
        let pm = Arc::new(PeerManager::new(peer_id));
        pm.add_peer(SERVER_ID);
        pm.add_peer(new_id);
        let machine = OldPeerMachine::new(
            Arc::clone(&pm),
            pubkey,
            &decimal_to_scalar(share)?,
            sub_bks(bks, SERVER_ID, peer_id)?,
            new_id,
        )?;
        Ok(Self {
            svc: CeremonyService::new(machine, pm)?,
            peer_id: peer_id.to_string(),
            wallet_bks: bks.clone(),
        })
    }

    pub async fn process(&self) -> Result<DkgResult> {
        let outcome = self.svc.process().await?;
        let mut result =
            key_material(&outcome.pubkey, &outcome.share, outcome.bks, &self.peer_id)?;
        // Keep entries of enrolled devices that sat out this ceremony.
        for (id, bk) in &self.wallet_bks {
            result.bks.entry(id.clone()).or_insert_with(|| bk.clone());
        }
        Ok(result)
    }

    pub fn peer_manager(&self) -> Arc<PeerManager> {
        self.svc.peer_manager()
    }

    pub fn handle_relay(&self, frame: RelayFrame) -> Result<()> {
        self.svc.handle_relay(frame)
    }

    pub fn done(&self) -> watch::Receiver<bool> {
        self.svc.done()
    }
}

/// New-peer role at the joining device
pub struct ClientAdd {
    svc: Arc<CeremonyService<NewPeerMachine>>,
    peer_id: String,
    wallet_bks: BTreeMap<String, Bk>,
}

impl ClientAdd {
    pub fn new(
        peer_id: &str,
        existing_id: &str,
        pubkey: &Pubkey,
        bks: &BTreeMap<String, Bk>,
    ) -> Result<Self> {
        let pm = Arc::new(PeerManager::new(peer_id));
        pm.add_peer(SERVER_ID);
        pm.add_peer(existing_id);
        let machine = NewPeerMachine::new(
            Arc::clone(&pm),
            pubkey,
            sub_bks(bks, SERVER_ID, existing_id)?,
        )?;
        Ok(Self {
            svc: CeremonyService::new(machine, pm)?,
            peer_id: peer_id.to_string(),
            wallet_bks: bks.clone(),
        })
    }

    pub async fn process(&self) -> Result<DkgResult> {
        let outcome = self.svc.process().await?;
        let mut result =
            key_material(&outcome.pubkey, &outcome.share, outcome.bks, &self.peer_id)?;
        for (id, bk) in &self.wallet_bks {
            result.bks.entry(id.clone()).or_insert_with(|| bk.clone());
        }
        Ok(result)
    }

    pub fn peer_manager(&self) -> Arc<PeerManager> {
        self.svc.peer_manager()
    }

    pub fn handle_relay(&self, frame: RelayFrame) -> Result<()> {
        self.svc.handle_relay(frame)
    }

    pub fn done(&self) -> watch::Receiver<bool> {
        self.svc.done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Shuttle frames between two peer managers until both sides settle.
    fn pump_pair(a: Arc<PeerManager>, b: Arc<PeerManager>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let mut moved = false;
                while let Some(frame) = a.next_outbound_any() {
                    b.handle_inbound(&frame.from, &frame.body).expect("deliver");
                    moved = true;
                }
                while let Some(frame) = b.next_outbound_any() {
                    a.handle_inbound(&frame.from, &frame.body).expect("deliver");
                    moved = true;
                }
                if !moved {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            }
        })
    }

    #[tokio::test]
    async fn dkg_services_agree_end_to_end() {
        let server = ServerDkg::new("device-1").unwrap();
        let client = ClientDkg::new("device-1").unwrap();

        let pump = pump_pair(server.peer_manager(), client.peer_manager());
        let (server_result, client_result) = tokio::join!(server.process(), client.process());
        pump.abort();

        let server_result = server_result.unwrap();
        let client_result = client_result.unwrap();

        assert_eq!(server_result.pubkey, client_result.pubkey);
        assert_eq!(server_result.bks, client_result.bks);
        assert_eq!(server_result.address, client_result.address);
        assert_ne!(server_result.share, client_result.share);
        assert_eq!(server_result.peer_id, SERVER_ID);
        assert_eq!(client_result.peer_id, "device-1");
    }

    #[tokio::test]
    async fn done_channel_is_observable_while_processing() {
        let server = ServerDkg::new("device-2").unwrap();
        let client = ClientDkg::new("device-2").unwrap();
        let mut done = server.done();
        assert!(!*done.borrow());

        let pump = pump_pair(server.peer_manager(), client.peer_manager());
        let (server_result, _client_result) = tokio::join!(server.process(), client.process());
        pump.abort();
        server_result.unwrap();

        done.wait_for(|flag| *flag).await.unwrap();
    }

    #[tokio::test]
    async fn signer_services_produce_a_verifiable_signature() {
        // Key material from a real DKG round.
        let server = ServerDkg::new("device-3").unwrap();
        let client = ClientDkg::new("device-3").unwrap();
        let pump = pump_pair(server.peer_manager(), client.peer_manager());
        let (server_wallet, client_wallet) = tokio::join!(server.process(), client.process());
        pump.abort();
        let server_wallet = server_wallet.unwrap();
        let client_wallet = client_wallet.unwrap();

        let digest = [7u8; 32];
        let server_signer = ServerSigner::new(
            "device-3",
            &server_wallet.pubkey,
            &server_wallet.share,
            &server_wallet.bks,
            digest,
        )
        .unwrap();
        let client_signer = ClientSigner::new(
            "device-3",
            &client_wallet.pubkey,
            &client_wallet.share,
            &client_wallet.bks,
            digest,
        )
        .unwrap();

        let pump = pump_pair(server_signer.peer_manager(), client_signer.peer_manager());
        let (server_sig, client_sig) =
            tokio::join!(server_signer.process(), client_signer.process());
        pump.abort();

        let server_sig = server_sig.unwrap();
        let client_sig = client_sig.unwrap();
        assert_eq!(server_sig.to_bytes(), client_sig.to_bytes());
        assert!(client_sig.v == 0 || client_sig.v == 1);
    }
}
