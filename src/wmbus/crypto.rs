// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wireless M-Bus "mode 5" payload decryption (C9, §4.8).
//!
//! The initialization vector is built from the telegram's address
//! block plus the frame's access number: `manufacturer(2) ‖ id(4) ‖
//! version(1) ‖ medium(1)` for the first 8 bytes, then the access
//! number repeated across the last 8 bytes.

use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};

use crate::value::Value;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// A valid decrypted mode-5 payload always starts with this marker
/// (§4.8: "after decrypting a valid payload begins with `0x2F 0x2F`").
const VALID_PREFIX: [u8; 2] = [0x2F, 0x2F];

pub fn build_iv(manufacturer: u16, id: u32, version: u8, medium: u8, access_no: u8) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0..2].copy_from_slice(&manufacturer.to_le_bytes());
    iv[2..6].copy_from_slice(&id.to_le_bytes());
    iv[6] = version;
    iv[7] = medium;
    iv[8..16].copy_from_slice(&[access_no; 8]);
    iv
}

/// Decrypts `ciphertext` (a whole number of 16-byte AES blocks) under
/// `key` and `iv`. Returns `None` if the decrypted payload does not
/// start with the mode-5 marker, meaning the key is considered wrong;
/// callers still store the raw record with an empty decoded set in
/// that case (§4.8).
pub fn decrypt_mode5(key: &[u8; 16], iv: &[u8; 16], ciphertext: &[u8]) -> Option<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return None;
    }
    let mut buf = ciphertext.to_vec();
    let decryptor = Aes128CbcDec::new(key.into(), iv.into());
    decryptor.decrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buf).ok()?;
    if buf.starts_with(&VALID_PREFIX) {
        Some(buf)
    } else {
        None
    }
}

pub fn key_value(key: [u8; 16]) -> Value {
    Value::Aes128Key(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::Aes128;
    use cbc::cipher::BlockEncryptMut;

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    fn encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
        let mut buf = plaintext.to_vec();
        let encryptor = Aes128CbcEnc::new(key.into(), iv.into());
        encryptor
            .encrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buf, plaintext.len())
            .expect("plaintext is block-aligned")
            .to_vec()
    }

    #[test]
    fn decrypt_recovers_marker_prefixed_plaintext() {
        let key = [0x42u8; 16];
        let iv = build_iv(0x1234, 0xAABBCCDD, 1, 6, 9);
        let mut plaintext = vec![0x2F, 0x2F];
        plaintext.extend_from_slice(&[0u8; 14]);

        let ciphertext = encrypt(&key, &iv, &plaintext);
        let decrypted = decrypt_mode5(&key, &iv, &ciphertext).expect("valid marker");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_key_fails_marker_check() {
        let key = [0x42u8; 16];
        let wrong_key = [0x43u8; 16];
        let iv = build_iv(0x1234, 0xAABBCCDD, 1, 6, 9);
        let mut plaintext = vec![0x2F, 0x2F];
        plaintext.extend_from_slice(&[0u8; 14]);

        let ciphertext = encrypt(&key, &iv, &plaintext);
        assert!(decrypt_mode5(&wrong_key, &iv, &ciphertext).is_none());
    }

    #[test]
    fn iv_layout_matches_address_block_then_access_number() {
        let iv = build_iv(0x0442, 0x12345678, 2, 6, 0x77);
        assert_eq!(&iv[0..2], &0x0442u16.to_le_bytes());
        assert_eq!(&iv[2..6], &0x12345678u32.to_le_bytes());
        assert_eq!(iv[6], 2);
        assert_eq!(iv[7], 6);
        assert_eq!(&iv[8..16], &[0x77u8; 8]);
    }
}
