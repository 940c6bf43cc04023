// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Ties frame parsing, mode-5 decryption and VDB decoding together and
//! writes the results into the configuration cache (C9, §4.8 steps 1-3).

use crate::{
    cache::{self, Cache},
    obis::ObisPath,
    value::Value,
    wmbus::{crypto, frame, vdb},
};

/// Address-block fields needed to build the mode-5 IV and the gateway's
/// `srv_id`; carried by a long-header telegram, or supplied from a
/// previously observed long header when a short-header telegram arrives
/// (§4.8: "Short header: ... else as short").
#[derive(Debug, Clone, Copy)]
pub struct DeviceAddress {
    pub manufacturer: u16,
    pub id: u32,
    pub version: u8,
    pub medium: u8,
}

impl DeviceAddress {
    pub fn srv_id(&self) -> Vec<u8> {
        let mut id = vec![0x01];
        id.extend_from_slice(&self.manufacturer.to_le_bytes());
        id.extend_from_slice(&self.id.to_le_bytes());
        id.push(self.version);
        id.push(self.medium);
        id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Frame(#[from] frame::WMBusFrameError),
    #[error("short header telegram with no known device address on this channel")]
    NoKnownAddress,
    #[error("AES key not configured for this device")]
    NoKey,
}

/// Processes one telegram body. `known` supplies the address block for
/// a short-header telegram; ignored (and updated) for a long header.
pub fn process_telegram(
    cache: &Cache,
    buf: &[u8],
    known: &mut Option<DeviceAddress>,
) -> Result<(), PipelineError> {
    let telegram = frame::parse(buf)?;

    let (address, short) = match &telegram.header {
        frame::Header::Long(h) => {
            let addr = DeviceAddress {
                manufacturer: h.manufacturer,
                id: h.id,
                version: h.version,
                medium: h.medium,
            };
            *known = Some(addr);
            (addr, &h.short)
        },
        frame::Header::Short(s) => {
            let addr = known.ok_or(PipelineError::NoKnownAddress)?;
            (addr, s)
        },
    };

    let srv_id = address.srv_id();
    let table = cache.table(cache::TABLE_DEVICE_MBUS);
    let key = cache::key([Value::Buffer(srv_id.clone())]);
    let now = Value::Timestamp(crate::readout::now_unix());

    let decoded = match short.mode {
        frame::Mode::None => vdb::decode_all(&telegram.payload).unwrap_or_default(),
        frame::Mode::AesCbc => {
            let Some(key_row) = table.get(&key) else {
                table.merge(key.clone(), cache::row([("last_seen", now.clone())]), None);
                return Err(PipelineError::NoKey);
            };
            let Some(Value::Aes128Key(aes_key)) = key_row.get("aes_key") else {
                return Err(PipelineError::NoKey);
            };
            let iv = crypto::build_iv(address.manufacturer, address.id, address.version, address.medium, short.access_no);
            match crypto::decrypt_mode5(aes_key, &iv, &telegram.payload) {
                Some(plaintext) => vdb::decode_all(&plaintext).unwrap_or_default(),
                None => Vec::new(),
            }
        },
        frame::Mode::Unsupported(_) => Vec::new(),
    };

    table.merge(
        key,
        cache::row([
            ("last_seen", now.clone()),
            ("status", Value::U32(short.status as u32)),
            ("active", Value::Bool(true)),
        ]),
        None,
    );

    let readout_uuid = cache::uuid_lite::Uuid::new_v4();
    cache.table(cache::TABLE_READOUT).insert(
        cache::key([Value::Str(format!("{readout_uuid:?}"))]),
        cache::row([
            ("srv_id", Value::Buffer(srv_id.clone())),
            ("timestamp", now),
            ("frame_type", Value::U8(if matches!(telegram.header, frame::Header::Long(_)) { 0x72 } else { 0x7A })),
        ]),
        None,
    );

    for field in &decoded {
        let path = ObisPath::new().push(field.obis);
        cache.table(cache::TABLE_READOUT_DATA).insert(
            cache::key([Value::Buffer(srv_id.clone()), Value::Str(path.to_legacy_text())]),
            cache::row([
                ("obis", Value::Str(path.to_legacy_text())),
                ("value", field.value.clone()),
                ("scaler", Value::I8(field.scaler)),
                ("unit", Value::U8(field.unit)),
            ]),
            None,
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_telegram_plaintext() -> Vec<u8> {
        let mut buf = vec![0x44, 0x72];
        buf.extend_from_slice(&0x1234u16.to_le_bytes());
        buf.extend_from_slice(&0xAABBCCDDu32.to_le_bytes());
        buf.push(1);
        buf.push(6);
        buf.push(9); // access_no
        buf.push(0); // status
        buf.extend_from_slice(&0u16.to_le_bytes()); // mode 0 (no encryption)
        buf.extend_from_slice(&[0x01, 0x00, 0x05]); // DIF int8, VIF, value=5
        buf
    }

    #[test]
    fn unencrypted_long_header_populates_device_and_readout() {
        let cache = Cache::new();
        let mut known = None;
        process_telegram(&cache, &long_telegram_plaintext(), &mut known).expect("process");

        assert_eq!(cache.table(cache::TABLE_DEVICE_MBUS).len(), 1);
        assert_eq!(cache.table(cache::TABLE_READOUT).len(), 1);
        assert_eq!(cache.table(cache::TABLE_READOUT_DATA).len(), 1);
        assert!(known.is_some());
    }

    #[test]
    fn short_header_without_known_address_errors() {
        let cache = Cache::new();
        let mut known = None;
        let mut buf = vec![0x44, 0x7A, 9, 0];
        buf.extend_from_slice(&0u16.to_le_bytes());
        let result = process_telegram(&cache, &buf, &mut known);
        assert!(matches!(result, Err(PipelineError::NoKnownAddress)));
    }

    /// Two telegrams from the same `srv_id` must merge onto one
    /// `_DeviceMBUS` row, with `last_seen` advancing to the latest
    /// frame rather than a second row being inserted.
    #[test]
    fn repeated_telegrams_from_same_device_merge_into_one_row() {
        let cache = Cache::new();
        let mut known = None;

        process_telegram(&cache, &long_telegram_plaintext(), &mut known).expect("process first");
        let table = cache.table(cache::TABLE_DEVICE_MBUS);
        let key = cache::key([Value::Buffer(known.expect("known address").srv_id())]);
        let first_seen = match table.get(&key).and_then(|row| row.get("last_seen").cloned()) {
            Some(Value::Timestamp(ts)) => ts,
            other => panic!("expected a timestamp row, got {other:?}"),
        };

        let mut second = long_telegram_plaintext();
        second[10] = 7; // different access_no, same srv_id
        process_telegram(&cache, &second, &mut known).expect("process second");

        assert_eq!(table.len(), 1, "repeated frames must not duplicate the device row");
        let second_seen = match table.get(&key).and_then(|row| row.get("last_seen").cloned()) {
            Some(Value::Timestamp(ts)) => ts,
            other => panic!("expected a timestamp row, got {other:?}"),
        };
        assert!(second_seen >= first_seen, "last_seen must advance to the latest frame");
    }

    /// A mode-5 long-header telegram from the device address `01-E6-1E-
    /// 29-43-65-87-BF-03` under its AES key decrypts to a marker-prefixed
    /// payload carrying one energy field with unit Wh and scaler -1.
    #[test]
    fn mode5_telegram_decodes_energy_field_in_wh() {
        use aes::Aes128;
        use cbc::cipher::{BlockEncryptMut, KeyIvInit};

        let manufacturer = 0x1EE6u16;
        let id = 0x8765_4329u32;
        let version = 0xBFu8;
        let medium = 0x03u8;
        let access_no = 0x2Au8;
        let key: [u8; 16] = [
            0x51, 0x72, 0x89, 0x10, 0xE6, 0x6D, 0x83, 0xF8, 0x51, 0x72, 0x89, 0x10, 0xE6, 0x6D, 0x83, 0xF8,
        ];

        // DIF=0x04 (4-byte int), VIF=0x02 (energy, 10^(2-3) Wh = scaler -1),
        // value=12345, padded to one AES block with the 0x2F filler byte.
        let mut plaintext = vec![0x2F, 0x2F, 0x04, 0x02];
        plaintext.extend_from_slice(&12345i32.to_le_bytes());
        plaintext.resize(16, 0x2F);

        let iv = crypto::build_iv(manufacturer, id, version, medium, access_no);
        let mut ciphertext = plaintext.clone();
        cbc::Encryptor::<Aes128>::new(&key.into(), &iv.into())
            .encrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut ciphertext, plaintext.len())
            .expect("plaintext is block-aligned");

        let mut telegram = vec![0x44, 0x72];
        telegram.extend_from_slice(&manufacturer.to_le_bytes());
        telegram.extend_from_slice(&id.to_le_bytes());
        telegram.push(version);
        telegram.push(medium);
        telegram.push(access_no);
        telegram.push(0); // status
        telegram.extend_from_slice(&(5u16 << 8).to_le_bytes()); // mode 5, AES-CBC
        telegram.extend_from_slice(&ciphertext);

        let cache = Cache::new();
        let srv_id = DeviceAddress { manufacturer, id, version, medium }.srv_id();
        assert_eq!(srv_id, vec![0x01, 0xE6, 0x1E, 0x29, 0x43, 0x65, 0x87, 0xBF, 0x03]);

        cache.table(cache::TABLE_DEVICE_MBUS).insert(
            cache::key([Value::Buffer(srv_id.clone())]),
            cache::row([("aes_key", crypto::key_value(key))]),
            None,
        );

        let mut known = None;
        process_telegram(&cache, &telegram, &mut known).expect("process");

        let data_table = cache.table(cache::TABLE_READOUT_DATA);
        assert_eq!(data_table.len(), 1);
        let mut found = false;
        data_table.for_each(|_, row| {
            if row.get("unit") == Some(&Value::U8(30)) && row.get("scaler") == Some(&Value::I8(-1)) {
                assert_eq!(row.get("value"), Some(&Value::I32(12345)));
                found = true;
            }
        });
        assert!(found, "expected a Wh/-1-scaled energy field");
    }
}
