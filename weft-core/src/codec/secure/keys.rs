//! Key material for the secure-channel handshake.
//!
//! The initiator generates a modular-exponentiation key pair, publishes
//! `(e, n)` and the acceptor answers with a random session key raised to
//! `e` mod `n`. Only the holder of `d` can recover it.
//!
//! All numbers travel as fixed-width big-endian byte strings of
//! `key_bits / 8` bytes, left-padded with zeros.

use num_bigint_dig::{BigUint, ModInverse, RandPrime};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::WeftError;

/// Private half, kept by the initiator until the session key arrives.
pub struct KeyPair {
    e: BigUint,
    d: BigUint,
    n: BigUint,
    size: usize,
}

impl KeyPair {
    /// Generate a pair with a `bits`-wide encoding.
    ///
    /// `p` and `q` are `bits/2 - 1` bit primes, so `n` always fits;
    /// `e` is a random prime just below the bit length of `phi`.
    pub fn generate(bits: usize) -> Result<Self, WeftError> {
        if bits < 128 || bits % 8 != 0 {
            return Err(WeftError::Config(format!("unsupported key size: {bits} bits")));
        }
        let mut rng = OsRng;
        let one = BigUint::from(1u32);
        loop {
            let p = rng.gen_prime(bits / 2 - 1);
            let q = rng.gen_prime(bits / 2 - 1);
            if p == q {
                continue;
            }
            let n = &p * &q;
            let phi = (&p - &one) * (&q - &one);
            let e = rng.gen_prime(phi.bits() - 1);
            let Some(d) = e.clone().mod_inverse(&phi).and_then(|d| d.to_biguint()) else {
                continue;
            };
            return Ok(Self {
                e,
                d,
                n,
                size: bits / 8,
            });
        }
    }

    /// `e ‖ n`, each `size` bytes.
    pub fn public_bytes(&self) -> Vec<u8> {
        let mut out = fixed_width(&self.e.to_bytes_be(), self.size);
        out.extend(fixed_width(&self.n.to_bytes_be(), self.size));
        out
    }

    /// Recover the session key from the acceptor's reply.
    pub fn open_session_key(&self, sealed: &[u8]) -> Result<Vec<u8>, WeftError> {
        if sealed.len() != self.size {
            return Err(WeftError::KeyLength {
                expected: self.size,
                actual: sealed.len(),
            });
        }
        let key = BigUint::from_bytes_be(sealed).modpow(&self.d, &self.n).to_bytes_be();
        let width = self.size - 1;
        if key.len() > width {
            return Err(WeftError::KeyLength {
                expected: width,
                actual: key.len(),
            });
        }
        Ok(fixed_width(&key, width))
    }
}

/// The acceptor's view of the initiator's key.
pub struct PublicKey {
    e: BigUint,
    n: BigUint,
    size: usize,
}

impl PublicKey {
    /// Parse `e ‖ n` as sent by the initiator.
    pub fn from_bytes(bytes: &[u8], size: usize) -> Result<Self, WeftError> {
        if bytes.len() != 2 * size {
            return Err(WeftError::KeyLength {
                expected: 2 * size,
                actual: bytes.len(),
            });
        }
        let (e, n) = bytes.split_at(size);
        Ok(Self {
            e: BigUint::from_bytes_be(e),
            n: BigUint::from_bytes_be(n),
            size,
        })
    }

    /// Raise `key` to `e` mod `n`.
    pub fn seal_session_key(&self, key: &[u8]) -> Result<Vec<u8>, WeftError> {
        let m = BigUint::from_bytes_be(key);
        // The key must be smaller than the modulus or it cannot come back.
        if m >= self.n {
            return Err(WeftError::KeyLength {
                expected: self.n.bits().div_ceil(8),
                actual: key.len(),
            });
        }
        Ok(fixed_width(&m.modpow(&self.e, &self.n).to_bytes_be(), self.size))
    }
}

/// `size - 1` random bytes with a non-zero leading byte.
pub fn generate_session_key(size: usize) -> Vec<u8> {
    let mut key = vec![0u8; size.saturating_sub(1)];
    OsRng.fill_bytes(&mut key);
    if let Some(first) = key.first_mut() {
        while *first == 0 {
            *first = (OsRng.next_u32() & 0xff) as u8;
        }
    }
    key
}

/// Left-pad `bytes` with zeros to `width`, or keep the trailing `width`
/// bytes if it is longer.
pub fn fixed_width(bytes: &[u8], width: usize) -> Vec<u8> {
    if bytes.len() >= width {
        return bytes[bytes.len() - width..].to_vec();
    }
    let mut out = vec![0u8; width - bytes.len()];
    out.extend_from_slice(bytes);
    out
}
