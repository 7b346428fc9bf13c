//! Read-only queries against the connected device.
//!
//! Each query is a single remote command with no retries; a transport
//! failure here is fatal to the whole restoration.

use std::fmt;

use crate::error::RestoreError;
use crate::transport::{CommandOutput, Transport, TransportError};

pub const BOARD_NAME_PATH: &str = "/tmp/sysinfo/board_name";
pub const CMDLINE_PATH: &str = "/proc/cmdline";
pub const ETH0_ADDRESS_PATH: &str = "/sys/class/net/eth0/address";

/// Environment variable holding the index of the active firmware slot.
pub const FIRMWARE_SLOT_VAR: &str = "firmware";

/// How the device was booted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Booted from removable media; nothing in NAND is live yet.
    Sd,
    /// Booted from NAND; one firmware slot is active and must not be erased.
    Nand,
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootMode::Sd => write!(f, "SD"),
            BootMode::Nand => write!(f, "NAND"),
        }
    }
}

fn single_line(output: CommandOutput, what: &str) -> Result<String, TransportError> {
    output
        .stdout
        .first()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| TransportError::CommandFailed {
            cmd: what.to_string(),
            detail: "no output".to_string(),
        })
}

/// Board name of the connected device, e.g. `am1-s9`.
pub fn platform<T: Transport>(transport: &mut T) -> Result<String, TransportError> {
    single_line(transport.run(&["cat", BOARD_NAME_PATH])?, BOARD_NAME_PATH)
}

/// Boot mode, derived from the kernel command line: a root device on
/// removable media means SD boot.
pub fn boot_mode<T: Transport>(transport: &mut T) -> Result<BootMode, TransportError> {
    let cmdline = single_line(transport.run(&["cat", CMDLINE_PATH])?, CMDLINE_PATH)?;
    if cmdline.contains("mmcblk") {
        Ok(BootMode::Sd)
    } else {
        Ok(BootMode::Nand)
    }
}

/// MAC address of the device's primary interface.
pub fn ethernet_address<T: Transport>(transport: &mut T) -> Result<String, TransportError> {
    single_line(
        transport.run(&["cat", ETH0_ADDRESS_PATH])?,
        ETH0_ADDRESS_PATH,
    )
}

/// Read one variable from the device's main environment store.
pub fn environment_variable<T: Transport>(
    transport: &mut T,
    name: &str,
) -> Result<String, TransportError> {
    single_line(transport.run(&["fw_printenv", "-n", name])?, name)
}

/// Whether the device has a stored miner configuration.
///
/// The read goes through the staged layout file, so this must run after that
/// file has been uploaded. A failing or complaining read means "no stored
/// configuration", not a fatal error.
pub fn has_stored_miner_config<T: Transport>(
    transport: &mut T,
    staging_cfg_path: &str,
) -> Result<bool, TransportError> {
    match transport.run(&["fw_printenv", "-c", staging_cfg_path]) {
        Ok(output) => Ok(output.stderr.is_empty()),
        Err(TransportError::CommandFailed { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Snapshot of the device state, taken once per session and never mutated.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub platform: String,
    pub mode: BootMode,
    pub ethernet_address: String,
    /// Active firmware slot (1 or 2); only meaningful in NAND mode.
    pub active_slot: Option<u32>,
    pub has_miner_cfg: bool,
}

impl DeviceState {
    /// Gather the full snapshot. The staged configuration layout file must
    /// already be present at `staging_cfg_path`.
    pub fn probe<T: Transport>(
        transport: &mut T,
        staging_cfg_path: &str,
    ) -> Result<Self, RestoreError> {
        let platform = platform(transport)?;
        let mode = boot_mode(transport)?;
        let ethernet_address = ethernet_address(transport)?;

        let active_slot = match mode {
            BootMode::Nand => {
                let value = environment_variable(transport, FIRMWARE_SLOT_VAR)?;
                let slot = value
                    .parse::<u32>()
                    .map_err(|_| anyhow::anyhow!("invalid active firmware slot '{value}'"))?;
                Some(slot)
            }
            BootMode::Sd => None,
        };

        let has_miner_cfg = has_stored_miner_config(transport, staging_cfg_path)?;

        Ok(Self {
            platform,
            mode,
            ethernet_address,
            active_slot,
            has_miner_cfg,
        })
    }
}

#[cfg(test)]
use crate::transport::SimTransport;

#[cfg(test)]
fn nand_device_sim() -> SimTransport {
    let mut sim = SimTransport::new();
    sim.reply("cat /tmp/sysinfo/board_name", &["am1-s9"], &[]);
    sim.reply(
        "cat /proc/cmdline",
        &["console=ttyPS0,115200 ubi.mtd=firmware1 root=ubi0:rootfs"],
        &[],
    );
    sim.reply("cat /sys/class/net/eth0/address", &["00:11:22:33:44:55"], &[]);
    sim.reply("fw_printenv -n firmware", &["1"], &[]);
    sim.reply("fw_printenv -c /tmp/miner_cfg.config", &["ethaddr=..."], &[]);
    sim
}

#[test]
fn test_probe_nand_device() {
    let mut sim = nand_device_sim();
    let device = DeviceState::probe(&mut sim, "/tmp/miner_cfg.config").unwrap();

    assert_eq!(device.platform, "am1-s9");
    assert_eq!(device.mode, BootMode::Nand);
    assert_eq!(device.ethernet_address, "00:11:22:33:44:55");
    assert_eq!(device.active_slot, Some(1));
    assert!(device.has_miner_cfg);
}

#[test]
fn test_probe_sd_device_skips_slot() {
    let mut sim = nand_device_sim();
    sim.reply(
        "cat /proc/cmdline",
        &["console=ttyPS0,115200 root=/dev/mmcblk0p2 rw rootwait"],
        &[],
    );

    let device = DeviceState::probe(&mut sim, "/tmp/miner_cfg.config").unwrap();
    assert_eq!(device.mode, BootMode::Sd);
    assert_eq!(device.active_slot, None);
    // The slot variable is never queried in SD mode
    assert!(!sim.run_commands().contains(&"fw_printenv -n firmware"));
}

#[test]
fn test_stored_config_detection() {
    let mut sim = nand_device_sim();
    assert!(has_stored_miner_config(&mut sim, "/tmp/miner_cfg.config").unwrap());

    // Error output means the stored configuration is unreadable
    sim.reply(
        "fw_printenv -c /tmp/miner_cfg.config",
        &[],
        &["Warning: Bad CRC, using default environment"],
    );
    assert!(!has_stored_miner_config(&mut sim, "/tmp/miner_cfg.config").unwrap());

    // So does a failing read
    sim.fail("fw_printenv -c /tmp/miner_cfg.config", "no such file");
    assert!(!has_stored_miner_config(&mut sim, "/tmp/miner_cfg.config").unwrap());
}
