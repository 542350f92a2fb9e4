//! Share-adding: enrolling a new device into an existing wallet
//!
//! The two current holders re-share the wallet secret to the widened
//! participant set. The joining peer announces a fresh Birkhoff
//! x-coordinate; each old peer then commits to a fresh degree-1 polynomial
//! whose constant term is its Lagrange-localised share and distributes
//! per-participant subshares. Summing the verified contributions yields a
//! refreshed share for everyone, the new peer included, while the public key
//! provably stays put: the constant-term commitments must sum to it.

use k256::elliptic_curve::Field;
use k256::{ProjectivePoint, Scalar};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::dkg::{evaluate_polynomial, verify_subshare};
use crate::peer::PeerManager;
use crate::recover::lagrange_at_zero;
use crate::service::{Ceremony, MachineState};
use crate::types::{decode_point, encode_point, scalar_from_bytes, Bk, Pubkey, THRESHOLD};
use crate::{Error, Result};

/// Add-share round messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "round", rename_all = "snake_case")]
pub enum AddMessage {
    /// The joining peer's freshly sampled Birkhoff x-coordinate
    Announce { bk_x: Vec<u8> },
    /// One old peer's re-sharing contribution for the receiver
    Reshare {
        commitments: Vec<Vec<u8>>,
        subshare: Vec<u8>,
    },
}

/// Terminal output: refreshed share, widened BKs, unchanged public key
pub struct AddOutcome {
    pub pubkey: ProjectivePoint,
    pub share: Scalar,
    pub bks: BTreeMap<String, Bk>,
}

/// State machine for a current holder (hub or existing device)
pub struct OldPeerMachine {
    pm: Arc<PeerManager>,
    state: MachineState,
    pubkey: ProjectivePoint,
    share: Scalar,
    old_bks: BTreeMap<String, Bk>,
    other_old: String,
    new_peer: String,
    my_x: Scalar,
    new_x: Option<Scalar>,
    coefficients: Vec<Scalar>,
    my_subshare: Option<Scalar>,
    contributions: BTreeMap<String, (Vec<ProjectivePoint>, Scalar)>,
    pending: Vec<(String, AddMessage)>,
    outcome: Option<AddOutcome>,
}

impl OldPeerMachine {
    /// `old_bks` are the sub-BKs of the two current ceremony holders
    pub fn new(
        pm: Arc<PeerManager>,
        pubkey: &Pubkey,
        share: &Scalar,
        old_bks: BTreeMap<String, Bk>,
        new_peer: &str,
    ) -> Result<Self> {
        let self_id = pm.self_id().to_string();
        if old_bks.len() != THRESHOLD as usize || !old_bks.contains_key(&self_id) {
            return Err(Error::InvalidConfig(
                "re-sharing requires the two current holders' Birkhoff entries".into(),
            ));
        }
        let other_old = old_bks
            .keys()
            .find(|id| *id != &self_id)
            .cloned()
            .ok_or_else(|| Error::InvalidConfig("missing counterpart holder".into()))?;
        if old_bks.contains_key(new_peer) {
            return Err(Error::InvalidConfig(format!(
                "{new_peer} is already enrolled"
            )));
        }
        let my_x = old_bks[&self_id].x_scalar()?;

        Ok(Self {
            pm,
            state: MachineState::Pending,
            pubkey: pubkey.to_point()?,
            share: *share,
            old_bks,
            other_old,
            new_peer: new_peer.to_string(),
            my_x,
            new_x: None,
            coefficients: Vec::new(),
            my_subshare: None,
            contributions: BTreeMap::new(),
            pending: Vec::new(),
            outcome: None,
        })
    }

    fn on_announce(&mut self, raw: Vec<u8>) -> Result<()> {
        if self.new_x.is_some() {
            return Ok(());
        }
        let new_x = scalar_from_bytes(&raw)?;
        if bool::from(new_x.is_zero()) {
            self.state = MachineState::Failed;
            return Err(Error::VerificationFailed(
                "joining peer announced a zero x-coordinate".into(),
            ));
        }
        self.new_x = Some(new_x);

        // Localise this holder's share and re-share it with a fresh polynomial.
        let other_x = self.old_bks[&self.other_old].x_scalar()?;
        let lambda = lagrange_at_zero(&self.my_x, &[self.my_x, other_x])?;
        let mut rng = OsRng;
        self.coefficients = vec![lambda * self.share, Scalar::random(&mut rng)];
        let commitments: Vec<Vec<u8>> = self
            .coefficients
            .iter()
            .map(|coefficient| encode_point(&(ProjectivePoint::GENERATOR * coefficient)))
            .collect();

        for (target, x) in [
            (self.other_old.clone(), other_x),
            (self.new_peer.clone(), new_x),
        ] {
            let subshare = evaluate_polynomial(&self.coefficients, &x);
            let subshare_bytes: [u8; 32] = subshare.to_bytes().into();
            let message = serde_json::to_vec(&AddMessage::Reshare {
                commitments: commitments.clone(),
                subshare: subshare_bytes.to_vec(),
            })?;
            self.pm.must_send(&target, message);
        }

        let own_subshare = evaluate_polynomial(&self.coefficients, &self.my_x);
        self.my_subshare = Some(own_subshare);
        let own_points = self
            .coefficients
            .iter()
            .map(|coefficient| ProjectivePoint::GENERATOR * coefficient)
            .collect();
        self.contributions
            .insert(self.pm.self_id().to_string(), (own_points, own_subshare));

        // The counterpart's contribution may have arrived first.
        if let Some(position) = self
            .pending
            .iter()
            .position(|(_, message)| matches!(message, AddMessage::Reshare { .. }))
        {
            let (from, message) = self.pending.remove(position);
            self.dispatch(&from, message)?;
        }
        Ok(())
    }

    fn on_reshare(&mut self, from: &str, raw_commitments: Vec<Vec<u8>>, raw: Vec<u8>) -> Result<()> {
        if from != self.other_old {
            return Err(Error::UnknownPeer(from.to_string()));
        }
        if self.new_x.is_none() {
            self.pending.push((
                from.to_string(),
                AddMessage::Reshare {
                    commitments: raw_commitments,
                    subshare: raw,
                },
            ));
            return Ok(());
        }

        let commitments = raw_commitments
            .iter()
            .map(|bytes| decode_point(bytes))
            .collect::<Result<Vec<_>>>()?;
        let subshare = scalar_from_bytes(&raw)?;
        if commitments.len() != THRESHOLD as usize
            || !verify_subshare(&subshare, &self.my_x, &commitments)
        {
            self.state = MachineState::Failed;
            return Err(Error::VerificationFailed(format!(
                "re-share from {from} does not match its commitments"
            )));
        }
        self.contributions
            .insert(from.to_string(), (commitments, subshare));
        Ok(())
    }

    fn dispatch(&mut self, from: &str, message: AddMessage) -> Result<()> {
        match message {
            AddMessage::Announce { bk_x } => {
                if from != self.new_peer {
                    return Err(Error::UnknownPeer(from.to_string()));
                }
                self.on_announce(bk_x)
            }
            AddMessage::Reshare {
                commitments,
                subshare,
            } => self.on_reshare(from, commitments, subshare),
        }
    }

    fn try_finalize(&mut self) -> Result<()> {
        if self.state != MachineState::Running || self.contributions.len() < THRESHOLD as usize {
            return Ok(());
        }
        let Some(new_x) = self.new_x else {
            return Ok(());
        };

        let constant_sum = self
            .contributions
            .values()
            .fold(ProjectivePoint::IDENTITY, |acc, (c, _)| acc + c[0]);
        if constant_sum != self.pubkey {
            self.state = MachineState::Failed;
            return Err(Error::VerificationFailed(
                "re-sharing does not preserve the public key".into(),
            ));
        }

        let share = self
            .contributions
            .values()
            .fold(Scalar::ZERO, |acc, (_, s)| acc + s);
        let mut bks = self.old_bks.clone();
        bks.insert(self.new_peer.clone(), Bk::new(&new_x));

        debug!(participant = self.pm.self_id(), "share-adding complete");
        self.outcome = Some(AddOutcome {
            pubkey: self.pubkey,
            share,
            bks,
        });
        self.state = MachineState::Done;
        Ok(())
    }
}

impl Ceremony for OldPeerMachine {
    type Output = AddOutcome;

    fn start(&mut self) -> Result<()> {
        self.state = MachineState::Running;
        let buffered = std::mem::take(&mut self.pending);
        for (from, message) in buffered {
            self.dispatch(&from, message)?;
        }
        self.try_finalize()
    }

    fn add_message(&mut self, from: &str, body: &[u8]) -> Result<()> {
        let message: AddMessage = serde_json::from_slice(body)?;
        match self.state {
            MachineState::Pending => {
                self.pending.push((from.to_string(), message));
                Ok(())
            }
            MachineState::Running => {
                self.dispatch(from, message)?;
                self.try_finalize()
            }
            _ => Ok(()),
        }
    }

    fn state(&self) -> MachineState {
        self.state
    }

    fn take_outcome(&mut self) -> Option<AddOutcome> {
        self.outcome.take()
    }
}

/// State machine for the joining device
pub struct NewPeerMachine {
    pm: Arc<PeerManager>,
    state: MachineState,
    pubkey: ProjectivePoint,
    old_bks: BTreeMap<String, Bk>,
    my_x: Scalar,
    contributions: BTreeMap<String, (Vec<ProjectivePoint>, Scalar)>,
    pending: Vec<(String, AddMessage)>,
    outcome: Option<AddOutcome>,
}

impl NewPeerMachine {
    /// `old_bks` are the Birkhoff entries of the two re-sharing holders
    pub fn new(pm: Arc<PeerManager>, pubkey: &Pubkey, old_bks: BTreeMap<String, Bk>) -> Result<Self> {
        if old_bks.len() != THRESHOLD as usize {
            return Err(Error::InvalidConfig(
                "re-sharing requires exactly two current holders".into(),
            ));
        }
        let self_id = pm.self_id();
        if old_bks.contains_key(self_id) {
            return Err(Error::InvalidConfig(format!(
                "{self_id} is already enrolled"
            )));
        }
        for holder in old_bks.keys() {
            if !pm.peer_ids().iter().any(|peer| peer == holder) {
                return Err(Error::InvalidConfig(format!(
                    "holder {holder} is not a session peer"
                )));
            }
        }

        let mut rng = OsRng;
        let mut my_x = Scalar::random(&mut rng);
        while bool::from(my_x.is_zero()) {
            my_x = Scalar::random(&mut rng);
        }

        Ok(Self {
            pm,
            state: MachineState::Pending,
            pubkey: pubkey.to_point()?,
            old_bks,
            my_x,
            contributions: BTreeMap::new(),
            pending: Vec::new(),
            outcome: None,
        })
    }

    fn on_reshare(&mut self, from: &str, raw_commitments: Vec<Vec<u8>>, raw: Vec<u8>) -> Result<()> {
        if !self.old_bks.contains_key(from) {
            return Err(Error::UnknownPeer(from.to_string()));
        }
        let commitments = raw_commitments
            .iter()
            .map(|bytes| decode_point(bytes))
            .collect::<Result<Vec<_>>>()?;
        let subshare = scalar_from_bytes(&raw)?;
        if commitments.len() != THRESHOLD as usize
            || !verify_subshare(&subshare, &self.my_x, &commitments)
        {
            self.state = MachineState::Failed;
            return Err(Error::VerificationFailed(format!(
                "re-share from {from} does not match its commitments"
            )));
        }
        self.contributions
            .insert(from.to_string(), (commitments, subshare));
        Ok(())
    }

    fn try_finalize(&mut self) -> Result<()> {
        if self.state != MachineState::Running
            || self.contributions.len() < self.old_bks.len()
        {
            return Ok(());
        }

        let constant_sum = self
            .contributions
            .values()
            .fold(ProjectivePoint::IDENTITY, |acc, (c, _)| acc + c[0]);
        if constant_sum != self.pubkey {
            self.state = MachineState::Failed;
            return Err(Error::VerificationFailed(
                "re-sharing does not preserve the public key".into(),
            ));
        }

        let share = self
            .contributions
            .values()
            .fold(Scalar::ZERO, |acc, (_, s)| acc + s);
        let mut bks = self.old_bks.clone();
        bks.insert(self.pm.self_id().to_string(), Bk::new(&self.my_x));

        debug!(participant = self.pm.self_id(), "share-adding complete");
        self.outcome = Some(AddOutcome {
            pubkey: self.pubkey,
            share,
            bks,
        });
        self.state = MachineState::Done;
        Ok(())
    }
}

impl Ceremony for NewPeerMachine {
    type Output = AddOutcome;

    fn start(&mut self) -> Result<()> {
        let x_bytes: [u8; 32] = self.my_x.to_bytes().into();
        let message = serde_json::to_vec(&AddMessage::Announce {
            bk_x: x_bytes.to_vec(),
        })?;
        for peer in self.pm.peer_ids() {
            self.pm.must_send(&peer, message.clone());
        }
        self.state = MachineState::Running;

        let buffered = std::mem::take(&mut self.pending);
        for (from, message) in buffered {
            self.on_message(&from, message)?;
        }
        self.try_finalize()
    }

    fn add_message(&mut self, from: &str, body: &[u8]) -> Result<()> {
        let message: AddMessage = serde_json::from_slice(body)?;
        match self.state {
            MachineState::Pending => {
                self.pending.push((from.to_string(), message));
                Ok(())
            }
            MachineState::Running => {
                self.on_message(from, message)?;
                self.try_finalize()
            }
            _ => Ok(()),
        }
    }

    fn state(&self) -> MachineState {
        self.state
    }

    fn take_outcome(&mut self) -> Option<AddOutcome> {
        self.outcome.take()
    }
}

impl NewPeerMachine {
    fn on_message(&mut self, from: &str, message: AddMessage) -> Result<()> {
        match message {
            // Only the joining peer announces; a stray announce is dropped.
            AddMessage::Announce { .. } => Ok(()),
            AddMessage::Reshare {
                commitments,
                subshare,
            } => self.on_reshare(from, commitments, subshare),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::bk_x_for_id;

    struct Party<'a> {
        machine: &'a mut dyn Ceremony<Output = AddOutcome>,
        pm: Arc<PeerManager>,
    }

    fn pump(parties: &mut [Party<'_>]) -> Result<()> {
        loop {
            let mut frame = None;
            for party in parties.iter() {
                if let Some(next) = party.pm.next_outbound_any() {
                    frame = Some(next);
                    break;
                }
            }
            let Some(frame) = frame else { return Ok(()) };
            if let Some(target) = parties
                .iter_mut()
                .find(|party| party.pm.self_id() == frame.to)
            {
                target.machine.add_message(&frame.from, &frame.body)?;
            }
        }
    }

    fn seeded_wallet() -> (Pubkey, BTreeMap<String, Bk>, Scalar, Scalar) {
        let mut rng = OsRng;
        let secret = Scalar::random(&mut rng);
        let slope = Scalar::random(&mut rng);
        let x_server = bk_x_for_id("server");
        let x_existing = bk_x_for_id("existing");

        let pubkey = Pubkey::from_point(&(ProjectivePoint::GENERATOR * secret)).unwrap();
        let mut bks = BTreeMap::new();
        bks.insert("server".to_string(), Bk::new(&x_server));
        bks.insert("existing".to_string(), Bk::new(&x_existing));
        (
            pubkey,
            bks,
            secret + slope * x_server,
            secret + slope * x_existing,
        )
    }

    #[test]
    fn three_party_resharing_enrolls_the_new_device() {
        let (pubkey, bks, share_server, share_existing) = seeded_wallet();

        let server_pm = Arc::new(PeerManager::new("server"));
        server_pm.add_peer("existing");
        server_pm.add_peer("new");
        let existing_pm = Arc::new(PeerManager::new("existing"));
        existing_pm.add_peer("server");
        existing_pm.add_peer("new");
        let new_pm = Arc::new(PeerManager::new("new"));
        new_pm.add_peer("server");
        new_pm.add_peer("existing");

        let mut server = OldPeerMachine::new(
            Arc::clone(&server_pm),
            &pubkey,
            &share_server,
            bks.clone(),
            "new",
        )
        .unwrap();
        let mut existing = OldPeerMachine::new(
            Arc::clone(&existing_pm),
            &pubkey,
            &share_existing,
            bks.clone(),
            "new",
        )
        .unwrap();
        let mut new = NewPeerMachine::new(Arc::clone(&new_pm), &pubkey, bks.clone()).unwrap();

        server.start().unwrap();
        existing.start().unwrap();
        new.start().unwrap();
        pump(&mut [
            Party {
                machine: &mut server,
                pm: Arc::clone(&server_pm),
            },
            Party {
                machine: &mut existing,
                pm: Arc::clone(&existing_pm),
            },
            Party {
                machine: &mut new,
                pm: Arc::clone(&new_pm),
            },
        ])
        .unwrap();

        assert_eq!(server.state(), MachineState::Done);
        assert_eq!(existing.state(), MachineState::Done);
        assert_eq!(new.state(), MachineState::Done);

        let server_out = server.take_outcome().unwrap();
        let existing_out = existing.take_outcome().unwrap();
        let new_out = new.take_outcome().unwrap();

        // Public key is preserved and the keysets widened identically.
        let expected_keys: Vec<&str> = vec!["existing", "new", "server"];
        for out in [&server_out, &existing_out, &new_out] {
            assert_eq!(out.pubkey, pubkey.to_point().unwrap());
            let keys: Vec<&str> = out.bks.keys().map(String::as_str).collect();
            assert_eq!(keys, expected_keys);
        }
        assert_eq!(server_out.bks, new_out.bks);
        assert_eq!(existing_out.bks, new_out.bks);

        // Any two refreshed shares reconstruct the original secret.
        let holders = vec![
            crate::recover::RecoveryHolder {
                share: server_out.share,
                x: server_out.bks["server"].x_scalar().unwrap(),
            },
            crate::recover::RecoveryHolder {
                share: new_out.share,
                x: new_out.bks["new"].x_scalar().unwrap(),
            },
        ];
        crate::recover::recover_private_key(&server_out.pubkey, &holders).unwrap();
    }

    #[test]
    fn rejects_an_already_enrolled_joiner() {
        let (pubkey, bks, share_server, _) = seeded_wallet();
        let pm = Arc::new(PeerManager::new("server"));
        pm.add_peer("existing");
        let result = OldPeerMachine::new(pm, &pubkey, &share_server, bks, "existing");
        assert!(result.is_err());
    }
}
