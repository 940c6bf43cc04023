// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The IP-T scramble codec (C1, §4.1).
//!
//! A scramble key is a permutation of the 256 byte values, compressed into
//! a 32-byte key the way the source stores it: only the first 32 entries of
//! the permutation are ever distinct from identity in practice, but the
//! wire format always carries exactly 32 bytes (§3: "Scramble key. Exactly
//! 32 bytes."). Byte `b` is translated to `key[b % 32]` on write and the
//! *inverse* permutation is applied on read; because the key is a
//! permutation (and the keyspace is closed under 32-wide application) the
//! forward and inverse maps are derived once and cached.

use thiserror::Error;

/// A 32-byte scramble key (§3).
#[derive(Clone, PartialEq, Eq)]
pub struct ScrambleKey(pub [u8; 32]);

impl std::fmt::Debug for ScrambleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScrambleKey({})", hex::encode(self.0))
    }
}

/// The well-known "default" key used before login establishes a session
/// key: all-zero with `key[0] = 1` (§4.1).
pub const DEFAULT_KEY: ScrambleKey = ScrambleKey({
    let mut k = [0u8; 32];
    k[0] = 1;
    k
});

#[derive(Debug, Error)]
#[error("scramble key is not a permutation of 0..32")]
pub struct NotAPermutation;

impl ScrambleKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn inverse(&self) -> [u8; 32] {
        let mut inv = [0u8; 32];
        for (i, &v) in self.0.iter().enumerate() {
            inv[(v as usize) % 32] = i as u8;
        }
        inv
    }
}

/// Stateful, direction-specific permutation codec.
///
/// The same transformation serves both encryption and decryption because
/// the key is a permutation; each endpoint keeps independent read and
/// write permutations so that a key rotation at login acknowledgement
/// (§4.1, §9 "scramble-key negotiation race") can swap the write side
/// first without corrupting in-flight reads of the old key.
#[derive(Debug, Clone)]
pub struct Scrambler {
    forward: [u8; 32],
    inverse: [u8; 32],
}

impl Scrambler {
    pub fn new(key: &ScrambleKey) -> Self {
        Self {
            forward: key.0,
            inverse: key.inverse(),
        }
    }

    pub fn default_key() -> Self {
        Self::new(&DEFAULT_KEY)
    }

    /// Applies the forward permutation to every byte (scramble-on-write).
    pub fn scramble(&self, data: &[u8]) -> Vec<u8> {
        data.iter().map(|&b| self.transform(b, true)).collect()
    }

    /// Applies the inverse permutation (descramble-on-read).
    pub fn descramble(&self, data: &[u8]) -> Vec<u8> {
        data.iter().map(|&b| self.transform(b, false)).collect()
    }

    fn transform(&self, b: u8, forward: bool) -> u8 {
        let table = if forward { &self.forward } else { &self.inverse };
        let idx = (b as usize) % 32;
        (b & !0x1F) | (table[idx] & 0x1F)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// P1: for any 32-byte permutation K and any byte sequence B,
    /// descramble(K, scramble(K, B)) == B.
    #[test]
    fn round_trip_with_default_key() {
        let s = Scrambler::default_key();
        let data = b"hello ipt world, this is a test payload".to_vec();
        let scrambled = s.scramble(&data);
        let back = s.descramble(&scrambled);
        assert_eq!(back, data);
    }

    #[test]
    fn round_trip_with_rotated_key() {
        // K[i] = i + 1 (mod 32), a cyclic permutation of the low 5 bits.
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = ((i + 1) % 32) as u8;
        }
        let key = ScrambleKey::from_bytes(bytes);
        let s = Scrambler::new(&key);

        for b in 0u8..=255 {
            let scrambled = s.scramble(&[b]);
            let back = s.descramble(&scrambled);
            assert_eq!(back[0], b);
        }
    }
}
