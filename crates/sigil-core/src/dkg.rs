//! Distributed key generation
//!
//! Joint-Feldman DKG over degree-1 polynomials: each participant commits to
//! its polynomial coefficients, sends every other participant a subshare
//! evaluated at that participant's Birkhoff x-coordinate, and verifies the
//! subshares it receives against the commitments. The joint public key is the
//! sum of the constant-term commitments; no party ever sees the secret.

use k256::elliptic_curve::Field;
use k256::{ProjectivePoint, Scalar};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::peer::PeerManager;
use crate::service::{Ceremony, MachineState};
use crate::types::{bk_x_for_id, decode_point, encode_point, scalar_from_bytes, Bk, THRESHOLD};
use crate::{Error, Result};

/// DKG round messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "round", rename_all = "snake_case")]
pub enum DkgMessage {
    /// Feldman commitments to the sender's polynomial coefficients
    Commitments { commitments: Vec<Vec<u8>> },
    /// The sender's polynomial evaluated at the receiver's x-coordinate
    Subshare { share: Vec<u8> },
}

/// Terminal output of a successful DKG
pub struct DkgOutcome {
    pub pubkey: ProjectivePoint,
    pub share: Scalar,
    pub bks: BTreeMap<String, Bk>,
}

/// One participant's DKG state machine
pub struct DkgMachine {
    pm: Arc<PeerManager>,
    state: MachineState,
    my_x: Scalar,
    xs: BTreeMap<String, Scalar>,
    coefficients: Vec<Scalar>,
    commitments: BTreeMap<String, Vec<ProjectivePoint>>,
    subshares: BTreeMap<String, Scalar>,
    pending: Vec<(String, DkgMessage)>,
    outcome: Option<DkgOutcome>,
}

impl DkgMachine {
    pub fn new(pm: Arc<PeerManager>) -> Result<Self> {
        let peers = pm.peer_ids();
        if peers.is_empty() {
            return Err(Error::InvalidConfig("dkg requires at least one peer".into()));
        }

        let mut xs = BTreeMap::new();
        xs.insert(pm.self_id().to_string(), bk_x_for_id(pm.self_id()));
        for peer in &peers {
            xs.insert(peer.clone(), bk_x_for_id(peer));
        }
        if xs.len() != peers.len() + 1 {
            return Err(Error::InvalidConfig("duplicate participant id".into()));
        }
        let my_x = xs[pm.self_id()];

        Ok(Self {
            pm,
            state: MachineState::Pending,
            my_x,
            xs,
            coefficients: Vec::new(),
            commitments: BTreeMap::new(),
            subshares: BTreeMap::new(),
            pending: Vec::new(),
            outcome: None,
        })
    }

    fn on_commitments(&mut self, from: &str, raw: Vec<Vec<u8>>) -> Result<()> {
        if raw.len() != THRESHOLD as usize {
            self.state = MachineState::Failed;
            return Err(Error::VerificationFailed(format!(
                "expected {THRESHOLD} commitments from {from}"
            )));
        }
        let points = raw
            .iter()
            .map(|bytes| decode_point(bytes))
            .collect::<Result<Vec<_>>>()?;
        self.commitments.insert(from.to_string(), points);

        // A subshare may have overtaken its commitments; replay it.
        if let Some(position) = self
            .pending
            .iter()
            .position(|(id, message)| id == from && matches!(message, DkgMessage::Subshare { .. }))
        {
            let (id, message) = self.pending.remove(position);
            self.dispatch(&id, message)?;
        }
        Ok(())
    }

    fn on_subshare(&mut self, from: &str, raw: Vec<u8>) -> Result<()> {
        let Some(commitments) = self.commitments.get(from) else {
            self.pending
                .push((from.to_string(), DkgMessage::Subshare { share: raw }));
            return Ok(());
        };

        let share = scalar_from_bytes(&raw)?;
        if !verify_subshare(&share, &self.my_x, commitments) {
            self.state = MachineState::Failed;
            return Err(Error::VerificationFailed(format!(
                "subshare from {from} does not match its commitments"
            )));
        }
        self.subshares.insert(from.to_string(), share);
        Ok(())
    }

    fn dispatch(&mut self, from: &str, message: DkgMessage) -> Result<()> {
        match message {
            DkgMessage::Commitments { commitments } => self.on_commitments(from, commitments),
            DkgMessage::Subshare { share } => self.on_subshare(from, share),
        }
    }

    fn try_finalize(&mut self) {
        let participants = self.xs.len();
        if self.commitments.len() < participants || self.subshares.len() < participants {
            return;
        }

        let share = self
            .subshares
            .values()
            .fold(Scalar::ZERO, |acc, s| acc + s);
        let pubkey = self
            .commitments
            .values()
            .fold(ProjectivePoint::IDENTITY, |acc, c| acc + c[0]);

        let bks = self
            .xs
            .iter()
            .map(|(id, x)| (id.clone(), Bk::new(x)))
            .collect();

        debug!(participant = self.pm.self_id(), "dkg complete");
        self.outcome = Some(DkgOutcome { pubkey, share, bks });
        self.state = MachineState::Done;
    }
}

impl Ceremony for DkgMachine {
    type Output = DkgOutcome;

    fn start(&mut self) -> Result<()> {
        let mut rng = OsRng;
        self.coefficients = (0..THRESHOLD).map(|_| Scalar::random(&mut rng)).collect();
        let commitments: Vec<Vec<u8>> = self
            .coefficients
            .iter()
            .map(|coefficient| encode_point(&(ProjectivePoint::GENERATOR * coefficient)))
            .collect();

        let self_id = self.pm.self_id().to_string();
        for peer in self.pm.peer_ids() {
            let commit = serde_json::to_vec(&DkgMessage::Commitments {
                commitments: commitments.clone(),
            })?;
            self.pm.must_send(&peer, commit);

            let at_peer = evaluate_polynomial(&self.coefficients, &self.xs[&peer]);
            let share_bytes: [u8; 32] = at_peer.to_bytes().into();
            let subshare = serde_json::to_vec(&DkgMessage::Subshare {
                share: share_bytes.to_vec(),
            })?;
            self.pm.must_send(&peer, subshare);
        }

        // Record this participant's own contribution.
        let own_points = self
            .coefficients
            .iter()
            .map(|coefficient| ProjectivePoint::GENERATOR * coefficient)
            .collect();
        self.commitments.insert(self_id.clone(), own_points);
        self.subshares.insert(
            self_id,
            evaluate_polynomial(&self.coefficients, &self.my_x),
        );

        self.state = MachineState::Running;

        // Messages that arrived before start are replayed now.
        let buffered = std::mem::take(&mut self.pending);
        for (from, message) in buffered {
            self.dispatch(&from, message)?;
        }
        self.try_finalize();
        Ok(())
    }

    fn add_message(&mut self, from: &str, body: &[u8]) -> Result<()> {
        if !self.xs.contains_key(from) || from == self.pm.self_id() {
            return Err(Error::UnknownPeer(from.to_string()));
        }
        let message: DkgMessage = serde_json::from_slice(body)?;

        if self.state == MachineState::Pending {
            self.pending.push((from.to_string(), message));
            return Ok(());
        }
        if self.state != MachineState::Running {
            return Ok(());
        }

        self.dispatch(from, message)?;
        self.try_finalize();
        Ok(())
    }

    fn state(&self) -> MachineState {
        self.state
    }

    fn take_outcome(&mut self) -> Option<DkgOutcome> {
        self.outcome.take()
    }
}

/// Evaluate a polynomial given by its coefficients at `x`
pub(crate) fn evaluate_polynomial(coefficients: &[Scalar], x: &Scalar) -> Scalar {
    let mut result = Scalar::ZERO;
    let mut x_power = Scalar::ONE;
    for coefficient in coefficients {
        result += *coefficient * x_power;
        x_power *= x;
    }
    result
}

/// Check a subshare against Feldman commitments: `share·G == Σ C_k · x^k`
pub(crate) fn verify_subshare(
    share: &Scalar,
    x: &Scalar,
    commitments: &[ProjectivePoint],
) -> bool {
    let expected = ProjectivePoint::GENERATOR * share;
    let mut actual = ProjectivePoint::IDENTITY;
    let mut x_power = Scalar::ONE;
    for commitment in commitments {
        actual += *commitment * x_power;
        x_power *= x;
    }
    expected == actual
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::run_to_completion;

    fn machine_pair() -> (DkgMachine, DkgMachine, Arc<PeerManager>, Arc<PeerManager>) {
        let server_pm = Arc::new(PeerManager::new("server"));
        server_pm.add_peer("client");
        let client_pm = Arc::new(PeerManager::new("client"));
        client_pm.add_peer("server");

        let server = DkgMachine::new(Arc::clone(&server_pm)).unwrap();
        let client = DkgMachine::new(Arc::clone(&client_pm)).unwrap();
        (server, client, server_pm, client_pm)
    }

    #[test]
    fn two_party_dkg_agrees() {
        let (mut server, mut client, server_pm, client_pm) = machine_pair();
        server.start().unwrap();
        client.start().unwrap();
        run_to_completion(&mut [(&mut server, &server_pm), (&mut client, &client_pm)]).unwrap();

        assert_eq!(server.state(), MachineState::Done);
        assert_eq!(client.state(), MachineState::Done);

        let server_out = server.take_outcome().unwrap();
        let client_out = client.take_outcome().unwrap();

        assert_eq!(server_out.pubkey, client_out.pubkey);
        assert_ne!(server_out.pubkey, ProjectivePoint::IDENTITY);
        assert_eq!(server_out.bks, client_out.bks);
        assert_eq!(server_out.bks.len(), 2);
        assert!(server_out.bks.contains_key("server"));
        assert!(server_out.bks.contains_key("client"));
        assert_ne!(server_out.share, client_out.share);
    }

    #[test]
    fn shares_interpolate_to_the_public_key() {
        let (mut server, mut client, server_pm, client_pm) = machine_pair();
        server.start().unwrap();
        client.start().unwrap();
        run_to_completion(&mut [(&mut server, &server_pm), (&mut client, &client_pm)]).unwrap();

        let server_out = server.take_outcome().unwrap();
        let client_out = client.take_outcome().unwrap();

        let holders = vec![
            crate::recover::RecoveryHolder {
                share: server_out.share,
                x: server_out.bks["server"].x_scalar().unwrap(),
            },
            crate::recover::RecoveryHolder {
                share: client_out.share,
                x: client_out.bks["client"].x_scalar().unwrap(),
            },
        ];
        let secret = crate::recover::recover_private_key(&server_out.pubkey, &holders).unwrap();
        assert_ne!(secret, [0u8; 32]);
    }

    #[test]
    fn tampered_subshare_fails_verification() {
        let (mut server, mut client, server_pm, _client_pm) = machine_pair();
        server.start().unwrap();
        client.start().unwrap();

        // Deliver the server's commitments, then a corrupted subshare.
        let commitments = server_pm.next_outbound("client").unwrap();
        client.add_message("server", &commitments.body).unwrap();
        let mut subshare = server_pm.next_outbound("client").unwrap();
        let parsed: DkgMessage = serde_json::from_slice(&subshare.body).unwrap();
        if let DkgMessage::Subshare { mut share } = parsed {
            share[0] ^= 0xff;
            subshare.body = serde_json::to_vec(&DkgMessage::Subshare { share }).unwrap();
        }
        let err = client.add_message("server", &subshare.body).unwrap_err();
        assert!(matches!(err, Error::VerificationFailed(_)));
        assert_eq!(client.state(), MachineState::Failed);
    }

    #[test]
    fn buffers_subshare_ahead_of_commitments() {
        let (mut server, mut client, server_pm, _client_pm) = machine_pair();
        server.start().unwrap();
        client.start().unwrap();

        let commitments = server_pm.next_outbound("client").unwrap();
        let subshare = server_pm.next_outbound("client").unwrap();

        // Reversed delivery order must still converge.
        client.add_message("server", &subshare.body).unwrap();
        assert_eq!(client.state(), MachineState::Running);
        client.add_message("server", &commitments.body).unwrap();
        assert_eq!(client.state(), MachineState::Done);
    }
}
