//! Application-data protection once the session key is known.
//!
//! ```text
//! body  = tag:4 ‖ inner        inner = zstd(payload) | payload
//! wire  = 0x0D ‖ flag:1 ‖ len:4 (BE) ‖ xor(body, key)
//! ```
//!
//! The tag is the first four bytes of `blake3(key ‖ inner)`, so a body
//! opened with the wrong key is rejected rather than handed on. Peers
//! that send the untagged body `xor(inner, key)` cannot talk to this one.

use crate::error::WeftError;

/// Flag byte for a compressed payload.
pub const COMPRESSED: u8 = 21;
/// Flag byte for a payload sent as is.
pub const UNCOMPRESSED: u8 = 22;

const TAG_LEN: usize = 4;

pub struct SessionCipher {
    key: Vec<u8>,
    threshold: usize,
    level: i32,
}

impl SessionCipher {
    pub fn new(key: Vec<u8>, threshold: usize, level: i32) -> Result<Self, WeftError> {
        if key.is_empty() {
            return Err(WeftError::KeyLength {
                expected: 1,
                actual: 0,
            });
        }
        Ok(Self {
            key,
            threshold,
            level,
        })
    }

    /// Protect `payload`, returning the flag byte and ciphertext.
    pub fn seal(&self, payload: &[u8]) -> Result<(u8, Vec<u8>), WeftError> {
        let (flag, inner) = if payload.len() > self.threshold {
            (COMPRESSED, zstd::encode_all(payload, self.level)?)
        } else {
            (UNCOMPRESSED, payload.to_vec())
        };
        let mut body = Vec::with_capacity(TAG_LEN + inner.len());
        body.extend_from_slice(&self.tag(&inner).to_le_bytes());
        body.extend_from_slice(&inner);
        self.apply(&mut body);
        Ok((flag, body))
    }

    /// Reverse [`seal`](Self::seal).
    pub fn open(&self, flag: u8, mut body: Vec<u8>) -> Result<Vec<u8>, WeftError> {
        check_flag(flag)?;
        if body.len() < TAG_LEN {
            return Err(WeftError::IntegrityCheckFailed);
        }
        self.apply(&mut body);
        let inner = body.split_off(TAG_LEN);
        let tag = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        if tag != self.tag(&inner) {
            return Err(WeftError::IntegrityCheckFailed);
        }
        if flag == COMPRESSED {
            zstd::decode_all(inner.as_slice()).map_err(|e| WeftError::Decompress(e.to_string()))
        } else {
            Ok(inner)
        }
    }

    /// Repeating-key XOR, restarted at the first key byte for every body.
    fn apply(&self, data: &mut [u8]) {
        for (byte, k) in data.iter_mut().zip(self.key.iter().cycle()) {
            *byte ^= k;
        }
    }

    fn tag(&self, inner: &[u8]) -> u32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.key);
        hasher.update(inner);
        let hash = hasher.finalize();
        let b = hash.as_bytes();
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }
}

pub fn check_flag(flag: u8) -> Result<(), WeftError> {
    match flag {
        COMPRESSED | UNCOMPRESSED => Ok(()),
        other => Err(WeftError::UnknownCompressionFlag(other)),
    }
}
