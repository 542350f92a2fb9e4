//! Wire and curve-native forms of wallet state
//!
//! Long-term wallet state (public key, shares, Birkhoff parameters) travels
//! and persists as decimal strings; ceremony primitives work on `k256`
//! scalars and points. The conversions between the two live here, together
//! with the Ethereum address derivation and the 65-byte signature assembly.

use k256::{
    ecdsa,
    ecdsa::signature::hazmat::PrehashVerifier,
    ecdsa::{RecoveryId, VerifyingKey},
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        scalar::IsHigh,
        sec1::{FromEncodedPoint, ToEncodedPoint},
    },
    AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar,
};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;

use crate::{Error, Result};

/// Participant identifier of the hub
pub const SERVER_ID: &str = "server";

/// Signing threshold; every ceremony in this service is 2-of-n
pub const THRESHOLD: u32 = 2;

/// Birkhoff rank of every participant
pub const RANK: u32 = 0;

/// Public key in its long-term wire form: decimal affine coordinates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pubkey {
    pub x: String,
    pub y: String,
}

impl Pubkey {
    /// Build the wire form from a curve point
    pub fn from_point(point: &ProjectivePoint) -> Result<Self> {
        let encoded = point.to_affine().to_encoded_point(false);
        let x = encoded
            .x()
            .ok_or_else(|| Error::Conversion("point at infinity".into()))?;
        let y = encoded
            .y()
            .ok_or_else(|| Error::Conversion("point at infinity".into()))?;
        Ok(Self {
            x: BigUint::from_bytes_be(x).to_str_radix(10),
            y: BigUint::from_bytes_be(y).to_str_radix(10),
        })
    }

    /// Parse the wire form back into a curve point
    pub fn to_point(&self) -> Result<ProjectivePoint> {
        let x = decimal_to_field_bytes(&self.x)?;
        let y = decimal_to_field_bytes(&self.y)?;
        let encoded = EncodedPoint::from_affine_coordinates(&x, &y, false);
        let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
            .ok_or_else(|| Error::Conversion("invalid point".into()))?;
        Ok(ProjectivePoint::from(affine))
    }

    /// Uncompressed SEC1 encoding (65 bytes, leading 0x04)
    pub fn to_uncompressed(&self) -> Result<Vec<u8>> {
        let point = self.to_point()?;
        Ok(point.to_affine().to_encoded_point(false).as_bytes().to_vec())
    }

    /// Ethereum address: last 20 bytes of keccak-256 over the 64-byte X‖Y
    /// encoding, without the 0x04 prefix
    pub fn address(&self) -> Result<String> {
        let uncompressed = self.to_uncompressed()?;
        Ok(eth_address(&uncompressed))
    }
}

/// Birkhoff parameter of one participant: decimal x-coordinate and rank
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bk {
    pub x: String,
    pub rank: u32,
}

impl Bk {
    pub fn new(x: &Scalar) -> Self {
        Self {
            x: scalar_to_decimal(x),
            rank: RANK,
        }
    }

    pub fn x_scalar(&self) -> Result<Scalar> {
        let x = decimal_to_scalar(&self.x)?;
        if bool::from(x.is_zero()) {
            return Err(Error::Conversion("zero Birkhoff x-coordinate".into()));
        }
        Ok(x)
    }
}

/// Result of a DKG or add-share ceremony, as held by one participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgResult {
    pub pubkey: Pubkey,
    pub bks: BTreeMap<String, Bk>,
    pub share: String,
    pub address: String,
    pub peer_id: String,
}

/// Ethereum-compatible ECDSA signature: `r ‖ s ‖ v`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub v: u8,
}

impl Signature {
    /// Serialize to the 65-byte `r ‖ s ‖ v` form
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut bytes = [0u8; 65];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..64].copy_from_slice(&self.s);
        bytes[64] = self.v;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 65 {
            return Err(Error::Deserialization("signature must be 65 bytes".into()));
        }
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        Ok(Self { r, s, v: bytes[64] })
    }
}

/// Post-process a raw `(r, s)` pair into an Ethereum-compatible signature.
///
/// `s` is normalised to its low half; the recovery byte is found by compact
/// recovery: the candidate `v` whose recovered key maps to the wallet's
/// address is accepted. The pair must ECDSA-verify against the wallet key.
pub fn finalize_signature(
    pubkey: &Pubkey,
    digest: &[u8; 32],
    r: &Scalar,
    s: &Scalar,
) -> Result<Signature> {
    let s = to_low_s(s);

    let r_bytes: [u8; 32] = r.to_bytes().into();
    let s_bytes: [u8; 32] = s.to_bytes().into();

    let sig = ecdsa::Signature::from_scalars(r.to_bytes(), s.to_bytes())
        .map_err(|_| Error::InvalidSignature)?;

    let point = pubkey.to_point()?;
    let verifying_key =
        VerifyingKey::from_affine(point.to_affine()).map_err(|_| Error::InvalidSignature)?;
    verifying_key
        .verify_prehash(digest, &sig)
        .map_err(|_| Error::InvalidSignature)?;

    let wallet_address = pubkey.address()?;
    for v in 0u8..2 {
        let recovery_id = RecoveryId::from_byte(v)
            .ok_or_else(|| Error::Internal("invalid recovery id".into()))?;
        let Ok(recovered) = VerifyingKey::recover_from_prehash(digest, &sig, recovery_id) else {
            continue;
        };
        let recovered_address = eth_address(recovered.to_encoded_point(false).as_bytes());
        if recovered_address == wallet_address {
            return Ok(Signature {
                r: r_bytes,
                s: s_bytes,
                v,
            });
        }
    }

    Err(Error::InvalidSignature)
}

/// Normalise a scalar to the low half of the signature space
pub fn to_low_s(s: &Scalar) -> Scalar {
    if bool::from(s.is_high()) {
        -*s
    } else {
        *s
    }
}

/// Ethereum address for an uncompressed (0x04-prefixed) public key encoding
pub fn eth_address(uncompressed: &[u8]) -> String {
    let digest = Keccak256::digest(&uncompressed[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

/// Derive a participant's Birkhoff x-coordinate from its identifier.
///
/// Identifiers are fresh UUIDs (or the literal "server"), so the hash is
/// collision-free in practice; a zero scalar is rehashed.
pub(crate) fn bk_x_for_id(id: &str) -> Scalar {
    let mut counter = 0u8;
    loop {
        let mut hasher = sha3::Sha3_256::new();
        hasher.update(b"sigil/bk-x");
        hasher.update([counter]);
        hasher.update(id.as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        let x = <Scalar as Reduce<U256>>::reduce_bytes(&digest.into());
        if !bool::from(x.is_zero()) {
            return x;
        }
        counter = counter.wrapping_add(1);
    }
}

/// Compressed SEC1 bytes of a point, as carried in primitive messages
pub(crate) fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

pub(crate) fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    let encoded =
        EncodedPoint::from_bytes(bytes).map_err(|e| Error::Deserialization(e.to_string()))?;
    let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or_else(|| Error::Deserialization("invalid curve point".into()))?;
    Ok(ProjectivePoint::from(affine))
}

pub(crate) fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Deserialization("invalid scalar length".into()))?;
    Ok(<Scalar as Reduce<U256>>::reduce_bytes(&array.into()))
}

/// Parse a decimal string into a scalar (reduced mod the curve order)
pub fn decimal_to_scalar(value: &str) -> Result<Scalar> {
    let bytes = decimal_to_field_bytes(value)?;
    Ok(<Scalar as Reduce<U256>>::reduce_bytes(&bytes))
}

/// Decimal form of a scalar
pub fn scalar_to_decimal(value: &Scalar) -> String {
    let bytes: [u8; 32] = value.to_bytes().into();
    BigUint::from_bytes_be(&bytes).to_str_radix(10)
}

fn decimal_to_field_bytes(value: &str) -> Result<FieldBytes> {
    let parsed = BigUint::parse_bytes(value.as_bytes(), 10)
        .ok_or_else(|| Error::Conversion(format!("invalid decimal integer: {value}")))?;
    let bytes = parsed.to_bytes_be();
    if bytes.len() > 32 {
        return Err(Error::Conversion("integer exceeds field size".into()));
    }
    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(padded.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::elliptic_curve::Field;
    use rand::rngs::OsRng;

    #[test]
    fn pubkey_round_trip() {
        let point = ProjectivePoint::GENERATOR * Scalar::random(&mut OsRng);
        let pubkey = Pubkey::from_point(&point).unwrap();
        assert_eq!(pubkey.to_point().unwrap(), point);
    }

    #[test]
    fn share_round_trip() {
        let share = Scalar::random(&mut OsRng);
        let decimal = scalar_to_decimal(&share);
        assert_eq!(decimal_to_scalar(&decimal).unwrap(), share);
    }

    #[test]
    fn address_matches_known_vector() {
        // Private key 1: the generator point itself. Its Ethereum address is
        // the well-known 0x7e5f4552091a69125d5dfcb7b8c2659029395bdf.
        let pubkey = Pubkey::from_point(&ProjectivePoint::GENERATOR).unwrap();
        assert_eq!(
            pubkey.address().unwrap(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn bk_x_is_stable_and_nonzero() {
        let a = bk_x_for_id("server");
        let b = bk_x_for_id("server");
        let c = bk_x_for_id("not-server");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!bool::from(a.is_zero()));
    }

    #[test]
    fn rejects_malformed_decimal() {
        assert!(decimal_to_scalar("not-a-number").is_err());
        assert!(Pubkey {
            x: "12".into(),
            y: "xyz".into()
        }
        .to_point()
        .is_err());
    }
}
