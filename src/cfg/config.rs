// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The `--config <file>` JSON bootstrap document (§4.13/§6). Seeds the
//! configuration cache's initial rows on `init-db`; not consulted again
//! once the cache/SQL store holds the live configuration tree.

use std::{fs, net::SocketAddr, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// IP-T tunnel parameters: redundancy list, scramble key, watchdog.
    pub ipt: IptConfig,
    /// Network time source used to validate the gateway's clock (§3:
    /// `TIME_VALID` status bit).
    pub ntp: NtpConfig,
    /// Login credentials this gateway presents to its IP-T master(s).
    pub security: SecurityConfig,
    /// Local meter-bus (LMN) serial port configuration.
    pub serial: SerialConfig,
    /// Relational mirror settings.
    pub storage: StorageConfig,
    /// Local customer-facing SML/TCP interface.
    pub customer_if: CustomerIfConfig,
    /// Defaults applied to push operations that don't override them.
    pub push: PushDefaults,
}

/// One candidate IP-T master, tried in order on connect failure
/// (`cfg_ipt.h`'s redundancy list).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct IptHost {
    pub address: SocketAddr,
    pub account: String,
    pub password: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct IptConfig {
    /// Primary and fallback masters, tried in order on connect failure.
    pub redundancy: Vec<IptHost>,
    /// Scrambled-login key proposed by this gateway. All-zero with
    /// `key[0] = 1` is the public/default key (§4.1).
    #[serde(with = "hex_32")]
    pub scramble_key: [u8; 32],
    /// Watchdog period proposed at login, in minutes (§4.3).
    pub watchdog_minutes: u16,
    /// `srv_id` this gateway identifies itself with.
    #[serde(with = "hex_bytes")]
    pub server_id: Vec<u8>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NtpConfig {
    pub servers: Vec<String>,
    #[serde(with = "serde_secs")]
    pub poll_interval: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SecurityConfig {
    pub user: String,
    pub password: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SerialConfig {
    /// Wired M-Bus device path (e.g. `/dev/ttyAPP0`).
    pub wired_mbus_port: String,
    /// Wireless M-Bus receiver device path (e.g. `/dev/ttyAPP1`).
    pub wireless_mbus_port: String,
    pub baud_rate: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CustomerIfConfig {
    pub bind_address: SocketAddr,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PushDefaults {
    #[serde(with = "serde_secs")]
    pub raster_interval: Duration,
    pub packet_size: usize,
    pub window_size: usize,
}

impl Config {
    /// Loads the bootstrap document from JSON, validates it, and returns
    /// the ready-to-use value (§6: "A `--config <file>` flag selects the
    /// JSON bootstrap file").
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config = serde_json::from_str(&s).context("failed to parse config JSON")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants that don't belong in the JSON schema itself.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.ipt.redundancy.is_empty(), "ipt.redundancy must list at least one master");
        ensure!(!self.ipt.server_id.is_empty(), "ipt.server_id must not be empty");
        ensure!(self.push.packet_size >= 1, "push.packet_size must be >= 1");
        ensure!(self.push.window_size >= 1, "push.window_size must be >= 1");
        if self.ipt.scramble_key == [0u8; 32] {
            self.ipt.scramble_key[0] = 1;
        }
        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helpers for a fixed-size byte array carried as a hex string.
mod hex_32 {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(key: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        bytes.try_into().map_err(|v: Vec<u8>| D::Error::custom(format!("expected 32 bytes, got {}", v.len())))
    }
}

/// Serde helpers for a variable-length byte buffer carried as a hex string.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(&text).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json(redundancy: &str, scramble_key_hex: &str) -> String {
        format!(
            r#"{{
                "ipt": {{
                    "redundancy": {redundancy},
                    "scramble_key": "{scramble_key_hex}",
                    "watchdog_minutes": 30,
                    "server_id": "0102030405"
                }},
                "ntp": {{"servers": ["pool.ntp.org"], "poll_interval": 3600}},
                "security": {{"user": "operator", "password": "pw"}},
                "serial": {{"wired_mbus_port": "/dev/ttyAPP0", "wireless_mbus_port": "/dev/ttyAPP1", "baud_rate": 2400}},
                "storage": {{"sqlite_path": "/var/lib/segw/store.sqlite"}},
                "customer_if": {{"bind_address": "0.0.0.0:7259"}},
                "push": {{"raster_interval": 900, "packet_size": 20, "window_size": 1}}
            }}"#
        )
    }

    const ONE_HOST: &str = r#"[{"address": "10.0.0.1:26862", "account": "gw1", "password": "secret"}]"#;
    const ALL_ZERO_KEY: &str = "0000000000000000000000000000000000000000000000000000000000000000";

    #[test]
    fn scramble_key_all_zero_is_normalized_to_default() {
        let json = sample_json(ONE_HOST, &ALL_ZERO_KEY[..64]);
        let mut cfg: Config = serde_json::from_str(&json).expect("parse");
        cfg.validate_and_normalize().expect("validate");
        assert_eq!(cfg.ipt.scramble_key[0], 1);
        assert!(cfg.ipt.scramble_key[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn missing_redundancy_list_is_rejected() {
        let json = sample_json("[]", &ALL_ZERO_KEY[..64]);
        let mut cfg: Config = serde_json::from_str(&json).expect("parse");
        assert!(cfg.validate_and_normalize().is_err());
    }
}
