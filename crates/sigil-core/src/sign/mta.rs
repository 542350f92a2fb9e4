//! Paillier-based multiplicative-to-additive conversion
//!
//! The two-party signer needs additive shares of the cross products
//! `k_i·γ_j` and `k_i·w_j`. Each instance runs over the initiator's Paillier
//! modulus: the initiator sends `Enc(k_i)`, the responder multiplies in its
//! secret homomorphically and masks the product with a wide random `β'`,
//! keeping `-β' mod q` as its own additive share. Masks are sampled small
//! enough that the plaintext never wraps the modulus.

use k256::elliptic_curve::bigint::Encoding;
use k256::elliptic_curve::Curve;
use k256::Scalar;
use libpaillier::unknown_order::BigNumber;
use libpaillier::DecryptionKey;
use rand::rngs::OsRng;

use crate::types::scalar_from_bytes;
use crate::{Error, Result};

/// Bit length of each Paillier prime; the modulus is twice this.
pub(crate) const PAILLIER_PRIME_BITS: usize = 1024;

/// Smallest acceptable modulus from a counterparty.
const MIN_MODULUS_BITS: usize = 1536;

/// Head-room between the masked plaintext and the modulus.
const MASK_MARGIN_BITS: usize = 64;

const KEYGEN_RETRY_MAX: usize = 8;

pub(crate) struct PaillierKeypair {
    pub dk: DecryptionKey,
    pub n: BigNumber,
}

/// Generate a fresh Paillier keypair for one signing ceremony.
pub(crate) fn generate_keypair() -> Result<PaillierKeypair> {
    for _ in 0..KEYGEN_RETRY_MAX {
        let p = BigNumber::prime(PAILLIER_PRIME_BITS);
        let q = BigNumber::prime(PAILLIER_PRIME_BITS);
        if p == q {
            continue;
        }
        let n = &p * &q;
        // Two b-bit primes occasionally multiply to a (2b-1)-bit modulus.
        if n.bit_length() != 2 * PAILLIER_PRIME_BITS {
            continue;
        }
        if let Some(dk) = DecryptionKey::with_primes(&p, &q) {
            return Ok(PaillierKeypair { dk, n });
        }
    }
    Err(Error::Crypto(
        "could not generate a Paillier modulus".into(),
    ))
}

/// Encrypt a plaintext under the modulus `n`
pub(crate) fn encrypt(n: &BigNumber, m: &BigNumber) -> Result<BigNumber> {
    let nn = n * n;
    let nonce = random_in_z_star(n)?;
    let a = (BigNumber::one() + n).modpow(m, &nn);
    let b = nonce.modpow(n, &nn);
    Ok(a.modmul(&b, &nn))
}

/// The responder's half of one MtA instance
pub(crate) struct MtaResponse {
    /// `Enc(k·x + β')` under the initiator's key
    pub ciphertext: BigNumber,
    /// The responder's additive share `-β' mod q`
    pub beta: Scalar,
}

/// Answer an initiator's `Enc(k)` with this party's secret multiplicand `x`.
pub(crate) fn respond(peer_n: &BigNumber, enc_k: &BigNumber, x: &Scalar) -> Result<MtaResponse> {
    let n_bits = peer_n.bit_length();
    if n_bits < MIN_MODULUS_BITS {
        return Err(Error::Crypto("counterparty Paillier modulus too small".into()));
    }

    let mask_bits = n_bits - 2 * 256 - MASK_MARGIN_BITS;
    let bound = BigNumber::one() << mask_bits;
    let beta_prime = BigNumber::from_rng(&bound, &mut OsRng);

    let nn = peer_n * peer_n;
    let scaled = enc_k.modpow(&scalar_to_bn(x), &nn);
    let ciphertext = scaled.modmul(&encrypt(peer_n, &beta_prime)?, &nn);

    Ok(MtaResponse {
        ciphertext,
        beta: -bn_to_scalar(&beta_prime)?,
    })
}

/// Decrypt this party's additive share `k·x + β' mod q` from a response.
pub(crate) fn extract(dk: &DecryptionKey, ciphertext: &BigNumber) -> Result<Scalar> {
    let plaintext = dk
        .decrypt(ciphertext)
        .ok_or_else(|| Error::Crypto("Paillier decryption failed".into()))?;
    bn_to_scalar(&BigNumber::from_slice(&plaintext))
}

pub(crate) fn scalar_to_bn(x: &Scalar) -> BigNumber {
    let bytes: [u8; 32] = x.to_bytes().into();
    BigNumber::from_slice(bytes)
}

/// Reduce a non-negative big number mod the secp256k1 order
pub(crate) fn bn_to_scalar(x: &BigNumber) -> Result<Scalar> {
    let reduced = x % k256_order();
    let bytes = reduced.to_bytes();
    if bytes.len() > 32 {
        return Err(Error::Conversion("reduced value exceeds 32 bytes".into()));
    }
    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(&bytes);
    scalar_from_bytes(&padded)
}

fn k256_order() -> BigNumber {
    let order_bytes: [u8; 32] = k256::Secp256k1::ORDER.to_be_bytes();
    BigNumber::from_slice(order_bytes)
}

fn random_in_z_star(n: &BigNumber) -> Result<BigNumber> {
    let mut rng = OsRng;
    std::iter::repeat_with(|| BigNumber::from_rng(n, &mut rng))
        .take(KEYGEN_RETRY_MAX)
        .find(|candidate| candidate != &BigNumber::zero() && candidate.gcd(n) == BigNumber::one())
        .ok_or_else(|| Error::Crypto("could not sample a unit mod n".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::elliptic_curve::Field;

    #[test]
    fn mta_produces_additive_shares_of_the_product() {
        let keypair = generate_keypair().unwrap();
        let mut rng = OsRng;
        let k = Scalar::random(&mut rng);
        let x = Scalar::random(&mut rng);

        let enc_k = encrypt(&keypair.n, &scalar_to_bn(&k)).unwrap();
        let response = respond(&keypair.n, &enc_k, &x).unwrap();
        let alpha = extract(&keypair.dk, &response.ciphertext).unwrap();

        assert_eq!(alpha + response.beta, k * x);
    }

    #[test]
    fn rejects_undersized_modulus() {
        let p = BigNumber::prime(256);
        let q = BigNumber::prime(256);
        let n = &p * &q;
        let enc = encrypt(&n, &BigNumber::one()).unwrap();
        assert!(respond(&n, &enc, &Scalar::ONE).is_err());
    }
}
