//! # sigil-session
//!
//! The typed envelope protocol carried over each ceremony's duplex channel.
//! Envelopes multiplex control messages, primitive traffic, metadata
//! exchange and done signalling; every kind carries a stage number and a
//! hex payload. The [`StageGate`] enforces stage monotonicity: envelopes
//! from a concluded stage are silently discarded.

use serde::{Deserialize, Serialize};
use sigil_core::{Bk, Pubkey, RelayFrame};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),
    #[error("Unsupported envelope kind: {0}")]
    UnsupportedKind(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Envelope kinds and their protocol stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Participant-id broadcast at session start
    PeerId,
    /// New device → hub: device descriptor during add-share bootstrap
    Device,
    /// Hub → new device: the wallet's public key and Birkhoff entries
    Pubkey,
    /// Custody key exchange (old device → hub, then hub → new device)
    Metadata,
    /// Hub → old device: proceed with the primitive rounds
    MetadataAck,
    /// A framed primitive message, any participant to any, via the hub
    Tss,
    /// Old device → hub: primitive rounds complete
    TssDone,
    /// New device → hub: result stored client-side
    StoredClient,
    /// Cross-client terminal handshake, existing-device half
    ExistingDeviceDone,
    /// Cross-client terminal handshake, new-device half
    NewDeviceDone,
    /// Abort with message
    Error,
}

impl EnvelopeKind {
    pub fn stage(&self) -> u32 {
        match self {
            EnvelopeKind::PeerId => 10,
            EnvelopeKind::Device | EnvelopeKind::Pubkey | EnvelopeKind::Metadata => 20,
            EnvelopeKind::MetadataAck => 30,
            EnvelopeKind::Tss => 40,
            EnvelopeKind::TssDone => 50,
            EnvelopeKind::StoredClient => 70,
            EnvelopeKind::ExistingDeviceDone | EnvelopeKind::NewDeviceDone => 80,
            EnvelopeKind::Error => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::PeerId => "peer",
            EnvelopeKind::Device => "device",
            EnvelopeKind::Pubkey => "pubkey",
            EnvelopeKind::Metadata => "metadata",
            EnvelopeKind::MetadataAck => "metadata-ack",
            EnvelopeKind::Tss => "tss",
            EnvelopeKind::TssDone => "tss-done",
            EnvelopeKind::StoredClient => "stored-client",
            EnvelopeKind::ExistingDeviceDone => "existing-device-done",
            EnvelopeKind::NewDeviceDone => "new-device-done",
            EnvelopeKind::Error => "error",
        }
    }

    fn from_str(kind: &str) -> Result<Self> {
        Ok(match kind {
            "peer" => EnvelopeKind::PeerId,
            "device" => EnvelopeKind::Device,
            "pubkey" => EnvelopeKind::Pubkey,
            "metadata" => EnvelopeKind::Metadata,
            "metadata-ack" => EnvelopeKind::MetadataAck,
            "tss" => EnvelopeKind::Tss,
            "tss-done" => EnvelopeKind::TssDone,
            "stored-client" => EnvelopeKind::StoredClient,
            "existing-device-done" => EnvelopeKind::ExistingDeviceDone,
            "new-device-done" => EnvelopeKind::NewDeviceDone,
            "error" => EnvelopeKind::Error,
            other => return Err(SessionError::UnsupportedKind(other.to_string())),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireType {
    #[serde(rename = "msgType")]
    msg_type: String,
    #[serde(rename = "msgStage")]
    msg_stage: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: WireType,
    payload: String,
}

/// One message on the duplex channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub stage: u32,
    pub payload: String,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            stage: kind.stage(),
            payload: payload.into(),
        }
    }

    pub fn peer_id(id: &str) -> Self {
        Self::new(EnvelopeKind::PeerId, id)
    }

    pub fn device(descriptor: &str) -> Self {
        Self::new(EnvelopeKind::Device, descriptor)
    }

    pub fn metadata(metadata: &str) -> Self {
        Self::new(EnvelopeKind::Metadata, metadata)
    }

    pub fn metadata_ack() -> Self {
        Self::new(EnvelopeKind::MetadataAck, "")
    }

    pub fn tss_done() -> Self {
        Self::new(EnvelopeKind::TssDone, "")
    }

    pub fn stored_client() -> Self {
        Self::new(EnvelopeKind::StoredClient, "")
    }

    pub fn existing_device_done() -> Self {
        Self::new(EnvelopeKind::ExistingDeviceDone, "")
    }

    pub fn new_device_done() -> Self {
        Self::new(EnvelopeKind::NewDeviceDone, "")
    }

    pub fn error(message: &str) -> Self {
        Self::new(EnvelopeKind::Error, message)
    }

    /// Wrap a primitive frame in a `tss` envelope
    pub fn tss(frame: &RelayFrame) -> Result<Self> {
        let json =
            serde_json::to_vec(frame).map_err(|e| SessionError::Malformed(e.to_string()))?;
        Ok(Self::new(EnvelopeKind::Tss, hex::encode(json)))
    }

    /// Unwrap a `tss` envelope into its primitive frame
    pub fn tss_frame(&self) -> Result<RelayFrame> {
        let bytes =
            hex::decode(&self.payload).map_err(|e| SessionError::Malformed(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| SessionError::Malformed(e.to_string()))
    }

    /// Wrap the public wallet blob in a `pubkey` envelope
    pub fn public_wallet(wallet: &PublicWallet) -> Result<Self> {
        let json =
            serde_json::to_vec(wallet).map_err(|e| SessionError::Malformed(e.to_string()))?;
        Ok(Self::new(EnvelopeKind::Pubkey, hex::encode(json)))
    }

    pub fn public_wallet_payload(&self) -> Result<PublicWallet> {
        let bytes =
            hex::decode(&self.payload).map_err(|e| SessionError::Malformed(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| SessionError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        let wire = WireEnvelope {
            kind: WireType {
                msg_type: self.kind.as_str().to_string(),
                msg_stage: self.stage,
            },
            payload: self.payload.clone(),
        };
        serde_json::to_string(&wire).expect("envelope serialization is infallible")
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let wire: WireEnvelope =
            serde_json::from_str(text).map_err(|e| SessionError::Malformed(e.to_string()))?;
        let kind = EnvelopeKind::from_str(&wire.kind.msg_type)?;
        Ok(Self {
            kind,
            stage: wire.kind.msg_stage,
            payload: wire.payload,
        })
    }
}

/// The shareable half of a wallet sent to a joining device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicWallet {
    pub public_key: Pubkey,
    pub bks: BTreeMap<String, Bk>,
}

/// Monotone per-session stage filter.
///
/// `admit` decides whether an inbound envelope may be processed; late
/// envelopes are dropped, never errors. `advance` is called at ceremony
/// milestones and never moves backwards.
#[derive(Debug, Default)]
pub struct StageGate {
    current: u32,
}

impl StageGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// An envelope is admitted iff its stage has not been concluded.
    pub fn admit(&self, envelope: &Envelope) -> bool {
        envelope.stage >= self.current
    }

    pub fn advance(&mut self, stage: u32) {
        if stage > self.current {
            self.current = stage;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = Envelope::peer_id("device-7");
        let parsed = Envelope::from_json(&envelope.to_json()).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(parsed.stage, 10);
    }

    #[test]
    fn wire_format_matches_the_envelope_schema() {
        let json = Envelope::metadata_ack().to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"]["msgType"], "metadata-ack");
        assert_eq!(value["type"]["msgStage"], 30);
        assert_eq!(value["payload"], "");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let text = r#"{"type":{"msgType":"gossip","msgStage":10},"payload":""}"#;
        assert!(matches!(
            Envelope::from_json(text),
            Err(SessionError::UnsupportedKind(_))
        ));
    }

    #[test]
    fn tss_frame_round_trip() {
        let frame = RelayFrame {
            from: "a".into(),
            to: "b".into(),
            body: vec![1, 2, 3],
        };
        let envelope = Envelope::tss(&frame).unwrap();
        assert_eq!(envelope.stage, 40);
        let recovered = envelope.tss_frame().unwrap();
        assert_eq!(recovered.from, "a");
        assert_eq!(recovered.to, "b");
        assert_eq!(recovered.body, vec![1, 2, 3]);
    }

    #[test]
    fn stage_gate_is_monotone() {
        let mut gate = StageGate::new();
        let peer = Envelope::peer_id("x");
        let tss = Envelope::new(EnvelopeKind::Tss, "");

        assert!(gate.admit(&peer));
        assert!(gate.admit(&tss));

        gate.advance(30);
        assert!(!gate.admit(&peer), "stage 10 after stage 30 is discarded");
        assert!(gate.admit(&tss));

        // advancing never moves backwards
        gate.advance(10);
        assert_eq!(gate.current(), 30);

        gate.advance(40);
        assert!(gate.admit(&tss), "stage == current is still admitted");
        gate.advance(50);
        assert!(!gate.admit(&tss));
    }

    #[test]
    fn error_envelopes_bypass_the_gate_check_value() {
        // error carries stage 0 and is matched on kind before gating
        assert_eq!(Envelope::error("boom").stage, 0);
    }
}
