//! Two-party threshold signing
//!
//! GG18-style signing specialised to the 2-of-n wallet: the two signers
//! localise their Birkhoff shares to additive form with Lagrange
//! coefficients, run two Paillier MtA instances per direction to obtain
//! additive shares of `kγ` and `k·d`, open `δ = kγ` to derive
//! `R = δ⁻¹·(Σγ_i·G) = k⁻¹·G`, and finally open the signature shares
//! `s_i = m·k_i + r·σ_i`. The machine refuses to terminate in `Done` unless
//! the combined `(r, s)` verifies against the wallet key.

mod mta;

use k256::ecdsa;
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::VerifyingKey;
use k256::elliptic_curve::{bigint::U256, ops::Reduce, Field};
use k256::{ProjectivePoint, Scalar};
use libpaillier::unknown_order::BigNumber;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::peer::PeerManager;
use crate::recover::lagrange_at_zero;
use crate::service::{Ceremony, MachineState};
use crate::types::{decimal_to_scalar, decode_point, encode_point, scalar_from_bytes, to_low_s};
use crate::types::{Bk, Pubkey};
use crate::{Error, Result};

/// Signing round messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "round", rename_all = "snake_case")]
pub enum SignMessage {
    /// Nonce commitment `γ_i·G`, the sender's Paillier modulus and `Enc(k_i)`
    Round1 {
        gamma_point: Vec<u8>,
        paillier_n: Vec<u8>,
        enc_k: Vec<u8>,
    },
    /// MtA responses for the `γ` and `w` instances
    Round2 { c_gamma: Vec<u8>, c_w: Vec<u8> },
    /// Opening of the sender's `δ_i` share
    Round3 { delta: Vec<u8> },
    /// Opening of the sender's signature share
    Round4 { sig_share: Vec<u8> },
}

/// Terminal output of a successful signing ceremony: a low-S `(r, s)` pair
pub struct SignOutcome {
    pub r: Scalar,
    pub s: Scalar,
}

/// One signer's state machine
pub struct SignerMachine {
    pm: Arc<PeerManager>,
    state: MachineState,
    peer: String,
    pubkey: ProjectivePoint,
    digest: [u8; 32],
    m: Scalar,
    w: Scalar,

    k: Scalar,
    gamma: Scalar,
    gamma_point: ProjectivePoint,
    paillier: Option<mta::PaillierKeypair>,

    peer_gamma: Option<ProjectivePoint>,
    alpha_gamma: Option<Scalar>,
    alpha_w: Option<Scalar>,
    beta_gamma: Option<Scalar>,
    beta_w: Option<Scalar>,

    my_delta: Option<Scalar>,
    peer_delta: Option<Scalar>,
    r: Option<Scalar>,
    my_sig_share: Option<Scalar>,
    peer_sig_share: Option<Scalar>,

    delta_sent: bool,
    sig_share_sent: bool,
    pending: Vec<SignMessage>,
    outcome: Option<SignOutcome>,
}

impl SignerMachine {
    pub fn new(
        pm: Arc<PeerManager>,
        pubkey: &Pubkey,
        share: &str,
        bks: &BTreeMap<String, Bk>,
        digest: [u8; 32],
    ) -> Result<Self> {
        let peers = pm.peer_ids();
        if peers.len() != 1 {
            return Err(Error::InvalidConfig(
                "signing runs between exactly two participants".into(),
            ));
        }
        let peer = peers.into_iter().next().expect("one peer");
        let self_id = pm.self_id().to_string();

        let my_bk = bks
            .get(&self_id)
            .ok_or_else(|| Error::InvalidConfig(format!("no Birkhoff entry for {self_id}")))?;
        let peer_bk = bks
            .get(&peer)
            .ok_or_else(|| Error::InvalidConfig(format!("no Birkhoff entry for {peer}")))?;

        let my_x = my_bk.x_scalar()?;
        let xs = [my_x, peer_bk.x_scalar()?];
        let lambda = lagrange_at_zero(&my_x, &xs)?;
        let w = decimal_to_scalar(share)? * lambda;

        Ok(Self {
            pm,
            state: MachineState::Pending,
            peer,
            pubkey: pubkey.to_point()?,
            digest,
            m: <Scalar as Reduce<U256>>::reduce_bytes(&digest.into()),
            w,
            k: Scalar::ZERO,
            gamma: Scalar::ZERO,
            gamma_point: ProjectivePoint::IDENTITY,
            paillier: None,
            peer_gamma: None,
            alpha_gamma: None,
            alpha_w: None,
            beta_gamma: None,
            beta_w: None,
            my_delta: None,
            peer_delta: None,
            r: None,
            my_sig_share: None,
            peer_sig_share: None,
            delta_sent: false,
            sig_share_sent: false,
            pending: Vec::new(),
            outcome: None,
        })
    }

    fn on_round1(&mut self, gamma_point: &[u8], paillier_n: &[u8], enc_k: &[u8]) -> Result<()> {
        self.peer_gamma = Some(decode_point(gamma_point)?);

        let peer_n = BigNumber::from_slice(paillier_n);
        let enc_k = BigNumber::from_slice(enc_k);
        let gamma_response = mta::respond(&peer_n, &enc_k, &self.gamma)?;
        let w_response = mta::respond(&peer_n, &enc_k, &self.w)?;
        self.beta_gamma = Some(gamma_response.beta);
        self.beta_w = Some(w_response.beta);

        let reply = serde_json::to_vec(&SignMessage::Round2 {
            c_gamma: gamma_response.ciphertext.to_bytes(),
            c_w: w_response.ciphertext.to_bytes(),
        })?;
        self.pm.must_send(&self.peer, reply);
        Ok(())
    }

    fn on_round2(&mut self, c_gamma: &[u8], c_w: &[u8]) -> Result<()> {
        let paillier = self
            .paillier
            .as_ref()
            .ok_or_else(|| Error::Internal("round 2 before start".into()))?;
        self.alpha_gamma = Some(mta::extract(&paillier.dk, &BigNumber::from_slice(c_gamma))?);
        self.alpha_w = Some(mta::extract(&paillier.dk, &BigNumber::from_slice(c_w))?);
        Ok(())
    }

    /// Open `δ_i` once both MtA halves of the γ instance are in.
    fn try_send_delta(&mut self) -> Result<()> {
        if self.delta_sent {
            return Ok(());
        }
        let (Some(alpha), Some(beta)) = (self.alpha_gamma, self.beta_gamma) else {
            return Ok(());
        };
        let delta = self.k * self.gamma + alpha + beta;
        self.my_delta = Some(delta);
        self.delta_sent = true;

        let delta_bytes: [u8; 32] = delta.to_bytes().into();
        let message = serde_json::to_vec(&SignMessage::Round3 {
            delta: delta_bytes.to_vec(),
        })?;
        self.pm.must_send(&self.peer, message);
        Ok(())
    }

    /// Derive `R = δ⁻¹·ΣΓ` and open this signer's signature share.
    fn try_send_sig_share(&mut self) -> Result<()> {
        if self.sig_share_sent {
            return Ok(());
        }
        let (Some(my_delta), Some(peer_delta), Some(peer_gamma)) =
            (self.my_delta, self.peer_delta, self.peer_gamma)
        else {
            return Ok(());
        };
        let (Some(alpha_w), Some(beta_w)) = (self.alpha_w, self.beta_w) else {
            return Ok(());
        };

        let delta = my_delta + peer_delta;
        let delta_inv = Option::<Scalar>::from(delta.invert()).ok_or_else(|| {
            self.state = MachineState::Failed;
            Error::Crypto("zero nonce product".into())
        })?;
        let big_r = (self.gamma_point + peer_gamma) * delta_inv;
        // x-coordinate of R, reduced mod the order
        let r_bytes = encode_point(&big_r);
        let r = scalar_from_bytes(&r_bytes[1..33])?;
        if bool::from(r.is_zero()) {
            self.state = MachineState::Failed;
            return Err(Error::Crypto("zero r".into()));
        }
        self.r = Some(r);

        let sigma = self.k * self.w + alpha_w + beta_w;
        let sig_share = self.m * self.k + r * sigma;
        self.my_sig_share = Some(sig_share);
        self.sig_share_sent = true;

        let share_bytes: [u8; 32] = sig_share.to_bytes().into();
        let message = serde_json::to_vec(&SignMessage::Round4 {
            sig_share: share_bytes.to_vec(),
        })?;
        self.pm.must_send(&self.peer, message);
        Ok(())
    }

    fn try_finalize(&mut self) -> Result<()> {
        if self.state != MachineState::Running {
            return Ok(());
        }
        let (Some(r), Some(mine), Some(peers)) = (self.r, self.my_sig_share, self.peer_sig_share)
        else {
            return Ok(());
        };

        let s = to_low_s(&(mine + peers));
        let signature = ecdsa::Signature::from_scalars(r.to_bytes(), s.to_bytes())
            .map_err(|_| Error::InvalidSignature);
        let verified = signature.and_then(|sig| {
            VerifyingKey::from_affine(self.pubkey.to_affine())
                .map_err(|_| Error::InvalidSignature)?
                .verify_prehash(&self.digest, &sig)
                .map_err(|_| Error::InvalidSignature)
        });
        if let Err(err) = verified {
            self.state = MachineState::Failed;
            return Err(err);
        }

        debug!(participant = self.pm.self_id(), "signing complete");
        self.outcome = Some(SignOutcome { r, s });
        self.state = MachineState::Done;
        Ok(())
    }

    fn dispatch(&mut self, message: SignMessage) -> Result<()> {
        match message {
            SignMessage::Round1 {
                gamma_point,
                paillier_n,
                enc_k,
            } => self.on_round1(&gamma_point, &paillier_n, &enc_k)?,
            SignMessage::Round2 { c_gamma, c_w } => self.on_round2(&c_gamma, &c_w)?,
            SignMessage::Round3 { delta } => {
                self.peer_delta = Some(scalar_from_bytes(&delta)?);
            }
            SignMessage::Round4 { sig_share } => {
                self.peer_sig_share = Some(scalar_from_bytes(&sig_share)?);
            }
        }
        self.try_send_delta()?;
        self.try_send_sig_share()?;
        self.try_finalize()
    }
}

impl Ceremony for SignerMachine {
    type Output = SignOutcome;

    fn start(&mut self) -> Result<()> {
        let mut rng = OsRng;
        self.k = Scalar::random(&mut rng);
        self.gamma = Scalar::random(&mut rng);
        self.gamma_point = ProjectivePoint::GENERATOR * self.gamma;

        let paillier = mta::generate_keypair()?;
        let enc_k = mta::encrypt(&paillier.n, &mta::scalar_to_bn(&self.k))?;
        let message = serde_json::to_vec(&SignMessage::Round1 {
            gamma_point: encode_point(&self.gamma_point),
            paillier_n: paillier.n.to_bytes(),
            enc_k: enc_k.to_bytes(),
        })?;
        self.paillier = Some(paillier);
        self.pm.must_send(&self.peer, message);
        self.state = MachineState::Running;

        let buffered = std::mem::take(&mut self.pending);
        for message in buffered {
            self.dispatch(message)?;
        }
        Ok(())
    }

    fn add_message(&mut self, from: &str, body: &[u8]) -> Result<()> {
        if from != self.peer {
            return Err(Error::UnknownPeer(from.to_string()));
        }
        let message: SignMessage = serde_json::from_slice(body)?;
        match self.state {
            MachineState::Pending => {
                self.pending.push(message);
                Ok(())
            }
            MachineState::Running => self.dispatch(message),
            _ => Ok(()),
        }
    }

    fn state(&self) -> MachineState {
        self.state
    }

    fn take_outcome(&mut self) -> Option<SignOutcome> {
        self.outcome.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::run_to_completion;
    use crate::types::{bk_x_for_id, finalize_signature, scalar_to_decimal};
    use sha3::Digest;

    /// Build a synthetic 2-of-2 wallet: a degree-1 polynomial through the
    /// secret with Birkhoff points for "server" and "client".
    fn wallet() -> (Pubkey, BTreeMap<String, Bk>, Scalar, Scalar, Scalar) {
        let mut rng = OsRng;
        let secret = Scalar::random(&mut rng);
        let slope = Scalar::random(&mut rng);

        let x_server = bk_x_for_id("server");
        let x_client = bk_x_for_id("client");
        let share_server = secret + slope * x_server;
        let share_client = secret + slope * x_client;

        let pubkey = Pubkey::from_point(&(ProjectivePoint::GENERATOR * secret)).unwrap();
        let mut bks = BTreeMap::new();
        bks.insert("server".to_string(), Bk::new(&x_server));
        bks.insert("client".to_string(), Bk::new(&x_client));
        (pubkey, bks, secret, share_server, share_client)
    }

    fn machine(
        self_id: &str,
        peer_id: &str,
        pubkey: &Pubkey,
        bks: &BTreeMap<String, Bk>,
        share: &Scalar,
        digest: [u8; 32],
    ) -> (SignerMachine, Arc<PeerManager>) {
        let pm = Arc::new(PeerManager::new(self_id));
        pm.add_peer(peer_id);
        let machine = SignerMachine::new(
            Arc::clone(&pm),
            pubkey,
            &scalar_to_decimal(share),
            bks,
            digest,
        )
        .unwrap();
        (machine, pm)
    }

    #[test]
    fn two_party_signing_produces_a_valid_signature() {
        let (pubkey, bks, _, share_server, share_client) = wallet();
        let digest: [u8; 32] = sha3::Keccak256::digest(b"test").into();

        let (mut server, server_pm) =
            machine("server", "client", &pubkey, &bks, &share_server, digest);
        let (mut client, client_pm) =
            machine("client", "server", &pubkey, &bks, &share_client, digest);

        server.start().unwrap();
        client.start().unwrap();
        run_to_completion(&mut [(&mut server, &server_pm), (&mut client, &client_pm)]).unwrap();

        assert_eq!(server.state(), MachineState::Done);
        assert_eq!(client.state(), MachineState::Done);

        let server_out = server.take_outcome().unwrap();
        let client_out = client.take_outcome().unwrap();
        assert_eq!(server_out.r, client_out.r);
        assert_eq!(server_out.s, client_out.s);

        // s is canonical
        use k256::elliptic_curve::scalar::IsHigh;
        assert!(!bool::from(client_out.s.is_high()));

        // and the finalized 65-byte signature carries a valid recovery byte
        let signature = finalize_signature(&pubkey, &digest, &client_out.r, &client_out.s).unwrap();
        assert!(signature.v == 0 || signature.v == 1);
        assert_eq!(signature.to_bytes().len(), 65);
    }

    #[test]
    fn tampered_share_fails_the_ceremony() {
        let (pubkey, bks, _, share_server, share_client) = wallet();
        let digest: [u8; 32] = sha3::Keccak256::digest(b"test").into();

        // Corrupt the server's share: the rounds complete but the combined
        // signature cannot verify.
        let bad_share = share_server + Scalar::ONE;
        let (mut server, server_pm) = machine("server", "client", &pubkey, &bks, &bad_share, digest);
        let (mut client, client_pm) =
            machine("client", "server", &pubkey, &bks, &share_client, digest);

        server.start().unwrap();
        client.start().unwrap();
        let err = run_to_completion(&mut [(&mut server, &server_pm), (&mut client, &client_pm)])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSignature));
    }
}
