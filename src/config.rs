//! Miner configuration resolution and serialization.
//!
//! The human-authored configuration is a TOML document with `miner` and
//! `net` tables. The device-native configuration is a flat key/value
//! environment store; [`serialize_miner_cfg`] bridges the two by rendering
//! the known fields into the script format consumed by the device's
//! environment-write utility.

use std::fs;
use std::path::Path;

use anyhow::Context;
use toml::{Table, Value};

use crate::error::RestoreAbort;
use crate::probe::DeviceState;

/// One field of the device-native configuration.
struct CfgField {
    /// Environment key written to the device.
    key: &'static str,
    /// Source location in the TOML document.
    section: &'static str,
    name: &'static str,
    /// Built-in default, applied only when rewriting from scratch.
    default: Option<&'static str>,
}

const fn field(
    key: &'static str,
    section: &'static str,
    name: &'static str,
    default: Option<&'static str>,
) -> CfgField {
    CfgField {
        key,
        section,
        name,
        default,
    }
}

/// Every environment key the restoration may write, in write order.
const MINER_CFG_FIELDS: &[CfgField] = &[
    field("ethaddr", "net", "mac", None),
    field("net_ip", "net", "ip", None),
    field("net_mask", "net", "mask", None),
    field("net_gateway", "net", "gateway", None),
    field("net_dns_servers", "net", "dns_servers", None),
    field("net_hostname", "net", "hostname", None),
    field("miner_freq", "miner", "frequency", Some("650")),
    field("miner_voltage", "miner", "voltage", Some("8.9")),
];

/// The user-facing configuration document.
#[derive(Debug, Clone, Default)]
pub struct MinerConfig(Table);

impl MinerConfig {
    /// Load a configuration file, or start from an empty document. The
    /// `miner` and `net` tables always exist afterwards.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut table = match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("cannot read {}", path.display()))?;
                content
                    .parse::<Table>()
                    .with_context(|| format!("cannot parse {}", path.display()))?
            }
            None => Table::new(),
        };

        for section in ["miner", "net"] {
            table
                .entry(section)
                .or_insert_with(|| Value::Table(Table::new()));
        }

        Ok(Self(table))
    }

    /// Look up `section.name`, rendering scalars to their plain string form.
    pub fn get(&self, section: &str, name: &str) -> Option<String> {
        let value = self.0.get(section)?.as_table()?.get(name)?;
        Some(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn set(&mut self, section: &str, name: &str, value: &str) {
        let section = self
            .0
            .entry(section)
            .or_insert_with(|| Value::Table(Table::new()));
        if let Some(table) = section.as_table_mut() {
            table.insert(name.to_string(), Value::String(value.to_string()));
        }
    }
}

/// Whether the device-native configuration should be rewritten from scratch:
/// either the caller asked for it, or the device has none to preserve.
pub fn should_rewrite(requested: bool, device: &DeviceState) -> bool {
    requested || !device.has_miner_cfg
}

/// Merge the user configuration with device-derived defaults.
///
/// An explicit MAC override always wins. Otherwise, when rewriting and the
/// document carries no MAC, the device's own address is used so the rewrite
/// does not change the device's network identity.
pub fn resolve(
    path: Option<&Path>,
    device: &DeviceState,
    mac_override: Option<&str>,
    rewrite: bool,
) -> anyhow::Result<MinerConfig> {
    let mut config = MinerConfig::load(path)?;

    if let Some(mac) = mac_override {
        config.set("net", "mac", mac);
    } else if rewrite && config.get("net", "mac").is_none() {
        config.set("net", "mac", &device.ethernet_address);
    }

    Ok(config)
}

/// Render the configuration into the environment-write script format, one
/// `name value` line per known field.
///
/// With `use_defaults`, fields absent from the document fall back to their
/// built-in defaults. A present-but-empty value aborts the restoration: it
/// signals a malformed document, and writing it would wipe the field on the
/// device. An overall-empty payload is valid; the caller skips the push.
pub fn serialize_miner_cfg(
    config: &MinerConfig,
    use_defaults: bool,
) -> Result<Vec<u8>, RestoreAbort> {
    let mut payload = Vec::new();

    for field in MINER_CFG_FIELDS {
        let value = config.get(field.section, field.name).or_else(|| {
            if use_defaults {
                field.default.map(str::to_string)
            } else {
                None
            }
        });

        if let Some(value) = value {
            if value.is_empty() {
                return Err(RestoreAbort::EmptyConfig(format!(
                    "{}.{}",
                    field.section, field.name
                )));
            }
            payload.extend_from_slice(field.key.as_bytes());
            payload.push(b' ');
            payload.extend_from_slice(value.as_bytes());
            payload.push(b'\n');
        }
    }

    Ok(payload)
}

#[cfg(test)]
use crate::probe::BootMode;

#[cfg(test)]
fn test_device(has_miner_cfg: bool) -> DeviceState {
    DeviceState {
        platform: "am1-s9".to_string(),
        mode: BootMode::Nand,
        ethernet_address: "00:11:22:33:44:55".to_string(),
        active_slot: Some(1),
        has_miner_cfg,
    }
}

#[test]
fn test_should_rewrite() {
    assert!(should_rewrite(true, &test_device(true)));
    assert!(should_rewrite(false, &test_device(false)));
    assert!(!should_rewrite(false, &test_device(true)));
}

#[test]
fn test_mac_override_wins() {
    let device = test_device(false);
    let config = resolve(None, &device, Some("aa:bb:cc:dd:ee:ff"), true).unwrap();
    assert_eq!(config.get("net", "mac").unwrap(), "aa:bb:cc:dd:ee:ff");

    // Regardless of the rewrite flag
    let config = resolve(None, &device, Some("aa:bb:cc:dd:ee:ff"), false).unwrap();
    assert_eq!(config.get("net", "mac").unwrap(), "aa:bb:cc:dd:ee:ff");
}

#[test]
fn test_mac_derived_from_device_on_rewrite() {
    let device = test_device(false);

    let config = resolve(None, &device, None, true).unwrap();
    assert_eq!(config.get("net", "mac").unwrap(), "00:11:22:33:44:55");

    // Not rewriting: the device keeps whatever it has
    let config = resolve(None, &device, None, false).unwrap();
    assert!(config.get("net", "mac").is_none());
}

#[test]
fn test_serialize_with_defaults() {
    let device = test_device(false);
    let config = resolve(None, &device, None, true).unwrap();

    let payload = serialize_miner_cfg(&config, true).unwrap();
    let payload = String::from_utf8(payload).unwrap();
    assert_eq!(
        payload,
        "ethaddr 00:11:22:33:44:55\nminer_freq 650\nminer_voltage 8.9\n"
    );
}

#[test]
fn test_serialize_override_only_writes_present_fields() {
    let mut config = MinerConfig::load(None).unwrap();
    config.set("net", "hostname", "miner-07");

    let payload = serialize_miner_cfg(&config, false).unwrap();
    assert_eq!(payload, b"net_hostname miner-07\n");

    // Nothing set at all is a valid no-op
    let config = MinerConfig::load(None).unwrap();
    assert!(serialize_miner_cfg(&config, false).unwrap().is_empty());
}

#[test]
fn test_serialize_rejects_empty_value() {
    let mut config = MinerConfig::load(None).unwrap();
    config.set("net", "ip", "");

    assert!(matches!(
        serialize_miner_cfg(&config, false),
        Err(RestoreAbort::EmptyConfig(field)) if field == "net.ip"
    ));
}

#[test]
fn test_scalar_values_render_plain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("miner.toml");
    fs::write(&path, "[miner]\nfrequency = 700\n[net]\n").unwrap();

    let config = MinerConfig::load(Some(&path)).unwrap();
    assert_eq!(config.get("miner", "frequency").unwrap(), "700");
}
