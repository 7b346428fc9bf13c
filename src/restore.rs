//! The end-to-end restoration sequence.
//!
//! `deploy` owns the transport session for its whole lifetime and drives the
//! fixed sequence: stage the configuration layout, snapshot the device,
//! check compatibility, resolve the configuration, write the boot and
//! recovery chains, push the miner configuration, erase obsolete partitions,
//! and finalize. Any failure aborts immediately; flash writes already issued
//! are never rolled back.

use std::path::PathBuf;

use crate::bundle::{BundleLayout, FirmwareDescriptor};
use crate::config;
use crate::error::{RestoreAbort, RestoreError};
use crate::flash;
use crate::probe::{BootMode, DeviceState};
use crate::transport::Transport;

/// The platforms a bundle signature may name, both with and without the
/// architecture prefix.
pub const PLATFORMS: &[&str] = &[
    "zynq-am1-s9",
    "zynq-dm1-g9",
    "zynq-dm1-g19",
    "am1-s9",
    "dm1-g9",
    "dm1-g19",
];

pub const ARCH_PREFIX: &str = "zynq-";

/// Fixed connection and staging conventions of the target devices.
///
/// Immutable; constructed once and passed through, so tests can substitute
/// their own values.
#[derive(Debug, Clone)]
pub struct RestoreSettings {
    /// Login for the transport session. The devices authenticate this user
    /// with no password.
    pub username: &'static str,
    /// Where the configuration layout file is staged on the device.
    pub staging_cfg_path: &'static str,
    pub platforms: &'static [&'static str],
    pub arch_prefix: &'static str,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            username: "root",
            staging_cfg_path: "/tmp/miner_cfg.config",
            platforms: PLATFORMS,
            arch_prefix: ARCH_PREFIX,
        }
    }
}

/// Caller choices for one restoration run.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub config: Option<PathBuf>,
    pub rewrite_config: bool,
    pub mac: Option<String>,
    pub force: bool,
}

/// Execute the restoration against an unpacked bundle over an open session.
///
/// `confirm` runs once after all validation and before the first flash
/// write; returning `false` aborts with nothing mutated.
pub fn deploy<T: Transport>(
    transport: &mut T,
    layout: &BundleLayout,
    descriptor: &FirmwareDescriptor,
    opts: &RestoreOptions,
    settings: &RestoreSettings,
    confirm: impl FnOnce() -> bool,
) -> Result<(), RestoreError> {
    // The stored-configuration query reads the staged layout file, so the
    // upload has to happen before the snapshot is taken.
    println!("Uploading miner configuration layout...");
    transport.put(&layout.miner_cfg_config, settings.staging_cfg_path)?;

    let device = DeviceState::probe(transport, settings.staging_cfg_path)?;
    println!("Detected platform: {}", device.platform);
    println!("Detected boot mode: {}", device.mode);

    if device.platform != descriptor.platform {
        if opts.force {
            println!(
                "Firmware platform '{}' does not match the device; forcing restoration...",
                descriptor.platform
            );
        } else {
            return Err(RestoreAbort::IncompatiblePlatform {
                bundle: descriptor.platform.clone(),
                device: device.platform.clone(),
            }
            .into());
        }
    }

    let rewrite = config::should_rewrite(opts.rewrite_config, &device);
    let cfg = config::resolve(opts.config.as_deref(), &device, opts.mac.as_deref(), rewrite)?;
    // Serialize before touching the flash, so a malformed configuration
    // aborts while the device is still intact.
    let payload = config::serialize_miner_cfg(&cfg, rewrite)?;

    if !confirm() {
        return Err(RestoreAbort::Declined.into());
    }

    let plan = flash::write_plan(layout, rewrite);
    let erase_list = flash::obsolete_partitions(&device)?;

    let rpt = howudoin::new()
        .label("Restoring firmware")
        .set_len(u64::try_from(plan.len() + erase_list.len() + 1).ok());

    for spec in &plan {
        rpt.desc(format!("Writing {} to '{}'", spec.label, spec.partition));
        rpt.inc();
        flash::write_partition(transport, spec)?;
    }

    if !payload.is_empty() {
        if rewrite {
            rpt.add_info("Setting default miner configuration");
        } else {
            rpt.add_info("Overriding miner configuration");
        }
        transport.pipe(
            &["fw_setenv", "-c", settings.staging_cfg_path, "-s", "-"],
            &mut payload.as_slice(),
        )?;
    }

    for partition in &erase_list {
        rpt.desc(format!("Erasing '{partition}'"));
        rpt.inc();
        flash::erase_partition(transport, partition)?;
    }

    rpt.desc("Flushing filesystem buffers");
    rpt.inc();
    transport.run(&["sync"])?;
    rpt.finish();

    match device.mode {
        BootMode::Sd => {
            println!("Halting the miner...");
            println!("Power off the miner and switch the jumper to boot from NAND.");
            // The connection drops as the device goes down; the outcome of
            // the final command carries no information.
            let _ = transport.run(&["halt"]);
        }
        BootMode::Nand => {
            println!("Rebooting to the restored firmware...");
            let _ = transport.run(&["reboot"]);
        }
    }

    Ok(())
}

#[cfg(test)]
use crate::transport::{SimCall, SimTransport};
#[cfg(test)]
use std::path::Path;

#[cfg(test)]
fn test_layout(dir: &Path, legacy: bool) -> BundleLayout {
    let file = |name: &str| {
        let path = dir.join(name);
        std::fs::write(&path, name.as_bytes()).unwrap();
        path
    };
    BundleLayout {
        boot_bin: file("boot.bin"),
        uboot_img: file("u-boot.img"),
        fit_itb: file("fit.itb"),
        factory_bin_gz: file("factory.bin.gz"),
        system_bit_gz: file("system.bit.gz"),
        legacy_boot_bin_gz: legacy.then(|| file("boot.bin.gz")),
        miner_cfg_bin: file("miner_cfg.bin"),
        miner_cfg_config: file("miner_cfg.config"),
    }
}

#[cfg(test)]
fn test_descriptor(platform: &str) -> FirmwareDescriptor {
    FirmwareDescriptor {
        version: "2018-09-22-0-853643de".to_string(),
        platform: platform.to_string(),
    }
}

/// A NAND-booted dm1-g19 with a stored configuration and slot 1 active.
#[cfg(test)]
fn test_transport() -> SimTransport {
    let mut sim = SimTransport::new();
    sim.reply("cat /tmp/sysinfo/board_name", &["dm1-g19"], &[]);
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
fn test_incompatible_platform_aborts_before_any_write() {
    let dir = tempfile::tempdir().unwrap();
    let layout = test_layout(dir.path(), false);
    let mut sim = test_transport();

    let result = deploy(
        &mut sim,
        &layout,
        &test_descriptor("dm1-g9"),
        &RestoreOptions::default(),
        &RestoreSettings::default(),
        || true,
    );

    assert!(matches!(
        result,
        Err(RestoreError::Abort(RestoreAbort::IncompatiblePlatform { .. }))
    ));
    assert!(sim.piped_commands().is_empty());
    assert!(!sim.run_commands().iter().any(|cmd| cmd.starts_with("mtd")));
}

#[test]
fn test_force_overrides_platform_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let layout = test_layout(dir.path(), false);
    let mut sim = test_transport();

    let opts = RestoreOptions {
        force: true,
        ..Default::default()
    };
    deploy(
        &mut sim,
        &layout,
        &test_descriptor("dm1-g9"),
        &opts,
        &RestoreSettings::default(),
        || true,
    )
    .unwrap();

    // The full write sequence ran despite the mismatch
    assert_eq!(
        sim.piped_commands(),
        vec![
            "mtd -e boot write - boot",
            "mtd -e uboot write - uboot",
            "mtd -e recovery write - recovery",
            "mtd -n -p 0x800000 write - recovery",
            "mtd -n -p 0x1400000 write - recovery",
        ]
    );
}

#[test]
fn test_full_sequence_on_matching_platform() {
    let dir = tempfile::tempdir().unwrap();
    let layout = test_layout(dir.path(), true);
    let mut sim = test_transport();

    deploy(
        &mut sim,
        &layout,
        &test_descriptor("dm1-g19"),
        &RestoreOptions::default(),
        &RestoreSettings::default(),
        || true,
    )
    .unwrap();

    // Staging upload happened first
    assert!(matches!(
        sim.calls.first(),
        Some(SimCall::Put { dest, .. }) if dest == "/tmp/miner_cfg.config"
    ));

    // Config present and no rewrite requested: miner_cfg untouched, no push
    assert_eq!(
        sim.piped_commands(),
        vec![
            "mtd -e boot write - boot",
            "mtd -e uboot write - uboot",
            "mtd -e recovery write - recovery",
            "mtd -n -p 0x800000 write - recovery",
            "mtd -n -p 0x1400000 write - recovery",
            "mtd -n -p 0x1500000 write - recovery",
        ]
    );

    // Erase pass spares the active slot, then sync and reboot
    let runs = sim.run_commands();
    let tail: Vec<&str> = runs[runs.len() - 6..].to_vec();
    assert_eq!(
        tail,
        vec![
            "mtd erase fpga1",
            "mtd erase fpga2",
            "mtd erase uboot_env",
            "mtd erase firmware2",
            "sync",
            "reboot",
        ]
    );
}

#[test]
fn test_missing_config_triggers_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let layout = test_layout(dir.path(), false);
    let mut sim = test_transport();
    sim.fail("fw_printenv -c /tmp/miner_cfg.config", "no such file");

    // Neither --rewrite-config nor --mac passed
    deploy(
        &mut sim,
        &layout,
        &test_descriptor("dm1-g19"),
        &RestoreOptions::default(),
        &RestoreSettings::default(),
        || true,
    )
    .unwrap();

    let piped = sim.piped_commands();
    assert!(piped.contains(&"mtd -e miner_cfg write - miner_cfg"));

    // The pushed configuration derives its MAC from the device
    let push = sim
        .calls
        .iter()
        .find_map(|call| match call {
            SimCall::Pipe { cmd, payload }
                if cmd == "fw_setenv -c /tmp/miner_cfg.config -s -" =>
            {
                Some(payload.clone())
            }
            _ => None,
        })
        .expect("miner configuration was pushed");
    let push = String::from_utf8(push).unwrap();
    assert!(push.contains("ethaddr 00:11:22:33:44:55"));
}

#[test]
fn test_sd_mode_erases_both_slots_and_halts() {
    let dir = tempfile::tempdir().unwrap();
    let layout = test_layout(dir.path(), false);
    let mut sim = test_transport();
    sim.reply(
        "cat /proc/cmdline",
        &["console=ttyPS0,115200 root=/dev/mmcblk0p2 rw rootwait"],
        &[],
    );

    deploy(
        &mut sim,
        &layout,
        &test_descriptor("dm1-g19"),
        &RestoreOptions::default(),
        &RestoreSettings::default(),
        || true,
    )
    .unwrap();

    let runs = sim.run_commands();
    assert!(runs.contains(&"mtd erase firmware1"));
    assert!(runs.contains(&"mtd erase firmware2"));
    assert_eq!(runs.last(), Some(&"halt"));
}

#[test]
fn test_declined_confirmation_aborts_clean() {
    let dir = tempfile::tempdir().unwrap();
    let layout = test_layout(dir.path(), false);
    let mut sim = test_transport();

    let result = deploy(
        &mut sim,
        &layout,
        &test_descriptor("dm1-g19"),
        &RestoreOptions::default(),
        &RestoreSettings::default(),
        || false,
    );

    assert!(matches!(
        result,
        Err(RestoreError::Abort(RestoreAbort::Declined))
    ));
    assert!(sim.piped_commands().is_empty());
}

#[test]
fn test_mac_override_reaches_pushed_config() {
    let dir = tempfile::tempdir().unwrap();
    let layout = test_layout(dir.path(), false);
    let mut sim = test_transport();

    let opts = RestoreOptions {
        rewrite_config: true,
        mac: Some("aa:bb:cc:dd:ee:ff".to_string()),
        ..Default::default()
    };
    deploy(
        &mut sim,
        &layout,
        &test_descriptor("dm1-g19"),
        &opts,
        &RestoreSettings::default(),
        || true,
    )
    .unwrap();

    let push = sim
        .calls
        .iter()
        .find_map(|call| match call {
            SimCall::Pipe { cmd, payload }
                if cmd == "fw_setenv -c /tmp/miner_cfg.config -s -" =>
            {
                Some(String::from_utf8(payload.clone()).unwrap())
            }
            _ => None,
        })
        .expect("miner configuration was pushed");
    assert!(push.contains("ethaddr aa:bb:cc:dd:ee:ff"));
    assert!(!push.contains("00:11:22:33:44:55"));
}
