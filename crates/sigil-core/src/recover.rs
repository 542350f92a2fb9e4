//! Private-key reconstruction from a quorum of shares
//!
//! Export-time interpolation: Lagrange coefficients at x = 0 over the two
//! holders' Birkhoff points recombine the shares into the secret scalar,
//! which is only released if it reproduces the wallet's public key.

use k256::{ProjectivePoint, Scalar};

use crate::types::THRESHOLD;
use crate::{Error, Result};

/// One share-holder's input to reconstruction
pub struct RecoveryHolder {
    pub share: Scalar,
    pub x: Scalar,
}

/// Reconstruct the wallet secret from exactly a threshold of holders.
///
/// Returns the 32-byte big-endian scalar; fails with [`Error::InvalidShares`]
/// when the interpolated secret does not reproduce `pubkey`.
pub fn recover_private_key(
    pubkey: &ProjectivePoint,
    holders: &[RecoveryHolder],
) -> Result<[u8; 32]> {
    if holders.len() != THRESHOLD as usize {
        return Err(Error::InvalidConfig(format!(
            "reconstruction requires exactly {THRESHOLD} holders"
        )));
    }
    let xs: Vec<Scalar> = holders.iter().map(|holder| holder.x).collect();

    let mut secret = Scalar::ZERO;
    for holder in holders {
        let lambda = lagrange_at_zero(&holder.x, &xs)?;
        secret += holder.share * lambda;
    }

    if ProjectivePoint::GENERATOR * secret != *pubkey {
        return Err(Error::InvalidShares);
    }
    Ok(secret.to_bytes().into())
}

/// Lagrange coefficient at x = 0 for the holder at `own_x` within `xs`.
///
/// All participants have rank 0, so plain Lagrange interpolation applies.
pub(crate) fn lagrange_at_zero(own_x: &Scalar, xs: &[Scalar]) -> Result<Scalar> {
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for x in xs {
        if x == own_x {
            continue;
        }
        numerator *= x;
        denominator *= x - own_x;
    }
    let inverted = Option::<Scalar>::from(denominator.invert())
        .ok_or_else(|| Error::InvalidConfig("duplicate Birkhoff x-coordinates".into()))?;
    Ok(numerator * inverted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::elliptic_curve::Field;
    use rand::rngs::OsRng;

    fn shares_of(secret: &Scalar, xs: &[Scalar; 2]) -> [Scalar; 2] {
        let slope = Scalar::random(&mut OsRng);
        [*secret + slope * xs[0], *secret + slope * xs[1]]
    }

    #[test]
    fn reconstructs_the_secret() {
        let mut rng = OsRng;
        let secret = Scalar::random(&mut rng);
        let xs = [Scalar::random(&mut rng), Scalar::random(&mut rng)];
        let shares = shares_of(&secret, &xs);
        let pubkey = ProjectivePoint::GENERATOR * secret;

        let holders = vec![
            RecoveryHolder {
                share: shares[0],
                x: xs[0],
            },
            RecoveryHolder {
                share: shares[1],
                x: xs[1],
            },
        ];
        let recovered = recover_private_key(&pubkey, &holders).unwrap();
        let expected: [u8; 32] = secret.to_bytes().into();
        assert_eq!(recovered, expected);
    }

    #[test]
    fn tampered_share_is_rejected() {
        let mut rng = OsRng;
        let secret = Scalar::random(&mut rng);
        let xs = [Scalar::random(&mut rng), Scalar::random(&mut rng)];
        let shares = shares_of(&secret, &xs);
        let pubkey = ProjectivePoint::GENERATOR * secret;

        let holders = vec![
            RecoveryHolder {
                share: shares[0] + Scalar::ONE,
                x: xs[0],
            },
            RecoveryHolder {
                share: shares[1],
                x: xs[1],
            },
        ];
        assert!(matches!(
            recover_private_key(&pubkey, &holders),
            Err(Error::InvalidShares)
        ));
    }

    #[test]
    fn wrong_holder_count_is_rejected() {
        let pubkey = ProjectivePoint::GENERATOR;
        assert!(recover_private_key(&pubkey, &[]).is_err());
    }
}
