//! # sigil-core
//!
//! Ceremony primitives for the sigil threshold-ECDSA wallet service.
//!
//! This crate provides the building blocks the hub and device orchestrators
//! drive over a duplex channel:
//! - Distributed Key Generation (DKG)
//! - Two-party threshold signing
//! - Share-adding (enrolling a new device)
//! - Private-key recovery
//!
//! Each primitive is a message-driven state machine wrapped by a
//! [`service::CeremonyService`] that owns its lifecycle, wired to a
//! per-ceremony [`peer::PeerManager`] that routes framed messages.

pub mod addshare;
pub mod dkg;
pub mod error;
pub mod peer;
pub mod recover;
pub mod service;
pub mod sign;
pub mod types;

pub use error::{Error, Result};
pub use peer::{PeerManager, RelayFrame};
pub use service::{
    Ceremony, CeremonyService, ClientAdd, ClientDkg, ClientSigner, ExistingClientAdd,
    MachineState, ServerAdd, ServerDkg, ServerSigner,
};
pub use types::{
    decimal_to_scalar, finalize_signature, scalar_to_decimal, Bk, DkgResult, Pubkey, Signature,
    RANK, SERVER_ID, THRESHOLD,
};

#[cfg(test)]
pub(crate) mod testing {
    use crate::peer::PeerManager;
    use crate::service::Ceremony;
    use crate::Result;
    use std::sync::Arc;

    /// Deliver queued frames between machines until no traffic remains.
    pub(crate) fn run_to_completion<C: Ceremony>(
        parties: &mut [(&mut C, &Arc<PeerManager>)],
    ) -> Result<()> {
        loop {
            let mut frame = None;
            for (_, pm) in parties.iter() {
                if let Some(next) = pm.next_outbound_any() {
                    frame = Some(next);
                    break;
                }
            }
            let Some(frame) = frame else { return Ok(()) };
            if let Some((machine, _)) = parties
                .iter_mut()
                .find(|(_, pm)| pm.self_id() == frame.to)
            {
                machine.add_message(&frame.from, &frame.body)?;
            }
        }
    }
}
