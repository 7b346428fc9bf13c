//! Ordered, offset-aware writes of firmware components to flash partitions.
//!
//! The recovery partition is one physical region subdivided by offset
//! convention: the FIT image starts it (with an erase), and the factory
//! image, bitstream, and optional legacy boot image are appended at fixed
//! offsets with no erase. Writing those sub-images out of order, or with
//! erase enabled on an offset write, would destroy previously written
//! neighbors — the plan in [`write_plan`] must be executed exactly as given.

use std::fs::File;
use std::path::Path;

use anyhow::Context;

use crate::bundle::BundleLayout;
use crate::error::RestoreError;
use crate::probe::{BootMode, DeviceState};
use crate::transport::Transport;

/// Byte offsets of the sub-images appended into the recovery partition.
pub const FACTORY_OFFSET: u64 = 0x800000;
pub const BITSTREAM_OFFSET: u64 = 0x1400000;
pub const LEGACY_BOOT_OFFSET: u64 = 0x1500000;

/// Auxiliary partitions left blank after every restoration.
const AUX_ERASE_PARTITIONS: &[&str] = &["fpga1", "fpga2", "uboot_env"];

/// One partition write: source file, target partition, and erase/offset
/// semantics. The constructors keep erase and offset mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSpec<'a> {
    pub source: &'a Path,
    pub partition: &'static str,
    pub label: &'static str,
    pub erase: bool,
    pub offset: u64,
}

impl<'a> WriteSpec<'a> {
    /// A full-partition write, erasing the partition first.
    fn new(source: &'a Path, partition: &'static str, label: &'static str) -> Self {
        Self {
            source,
            partition,
            label,
            erase: true,
            offset: 0,
        }
    }

    /// An append into previously erased space: positioned, never erasing.
    fn append(
        source: &'a Path,
        partition: &'static str,
        label: &'static str,
        offset: u64,
    ) -> Self {
        Self {
            source,
            partition,
            label,
            erase: false,
            offset,
        }
    }
}

/// The fixed write order for one restoration pass.
pub fn write_plan(layout: &BundleLayout, rewrite_miner_cfg: bool) -> Vec<WriteSpec<'_>> {
    let mut plan = vec![
        WriteSpec::new(&layout.boot_bin, "boot", "SPL"),
        WriteSpec::new(&layout.uboot_img, "uboot", "U-Boot"),
        WriteSpec::new(&layout.fit_itb, "recovery", "recovery FIT image"),
        WriteSpec::append(
            &layout.factory_bin_gz,
            "recovery",
            "factory image",
            FACTORY_OFFSET,
        ),
        WriteSpec::append(
            &layout.system_bit_gz,
            "recovery",
            "bitstream",
            BITSTREAM_OFFSET,
        ),
    ];

    // Stock-firmware recovery partitions lack the SPL boot loader
    if let Some(legacy) = &layout.legacy_boot_bin_gz {
        plan.push(WriteSpec::append(
            legacy,
            "recovery",
            "SPL bootloader",
            LEGACY_BOOT_OFFSET,
        ));
    }

    if rewrite_miner_cfg {
        plan.push(WriteSpec::new(
            &layout.miner_cfg_bin,
            "miner_cfg",
            "miner configuration",
        ));
    }

    plan
}

/// Stream one component into its flash partition.
///
/// There is no partial-write recovery: a transport failure aborts the whole
/// restoration with the flash left as-is.
pub fn write_partition<T: Transport>(
    transport: &mut T,
    spec: &WriteSpec<'_>,
) -> Result<(), RestoreError> {
    let offset = format!("{:#x}", spec.offset);
    let mut cmd = vec!["mtd"];
    if spec.erase {
        cmd.extend(["-e", spec.partition]);
    }
    if spec.offset > 0 {
        cmd.extend(["-n", "-p", offset.as_str()]);
    }
    cmd.extend(["write", "-", spec.partition]);

    let mut source = File::open(spec.source)
        .with_context(|| format!("cannot open {}", spec.source.display()))?;
    transport.pipe(&cmd, &mut source)?;

    Ok(())
}

/// Destructively erase a named partition.
pub fn erase_partition<T: Transport>(
    transport: &mut T,
    partition: &str,
) -> Result<(), RestoreError> {
    transport.run(&["mtd", "erase", partition])?;
    Ok(())
}

/// Partitions to erase after all writes have completed.
///
/// In NAND mode only the inactive firmware slot is erased; the active slot
/// is running the session and must survive. SD-booted devices have no live
/// slot, so both are erased.
pub fn obsolete_partitions(device: &DeviceState) -> anyhow::Result<Vec<String>> {
    let mut partitions: Vec<String> = AUX_ERASE_PARTITIONS
        .iter()
        .map(|s| s.to_string())
        .collect();

    match device.mode {
        BootMode::Nand => {
            let active = device
                .active_slot
                .ok_or_else(|| anyhow::anyhow!("active firmware slot unknown in NAND mode"))?;
            partitions.push(format!("firmware{}", (active % 2) + 1));
        }
        BootMode::Sd => {
            partitions.push("firmware1".to_string());
            partitions.push("firmware2".to_string());
        }
    }

    Ok(partitions)
}

#[cfg(test)]
use crate::transport::{SimCall, SimTransport};

#[cfg(test)]
fn test_device(mode: BootMode, active_slot: Option<u32>) -> DeviceState {
    DeviceState {
        platform: "am1-s9".to_string(),
        mode,
        ethernet_address: "00:11:22:33:44:55".to_string(),
        active_slot,
        has_miner_cfg: true,
    }
}

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

#[test]
fn test_write_plan_order() {
    let dir = tempfile::tempdir().unwrap();
    let layout = test_layout(dir.path(), true);

    let plan = write_plan(&layout, true);
    let order: Vec<(&str, u64, bool)> = plan
        .iter()
        .map(|spec| (spec.partition, spec.offset, spec.erase))
        .collect();
    assert_eq!(
        order,
        vec![
            ("boot", 0, true),
            ("uboot", 0, true),
            ("recovery", 0, true),
            ("recovery", FACTORY_OFFSET, false),
            ("recovery", BITSTREAM_OFFSET, false),
            ("recovery", LEGACY_BOOT_OFFSET, false),
            ("miner_cfg", 0, true),
        ]
    );
}

#[test]
fn test_write_plan_optional_entries() {
    let dir = tempfile::tempdir().unwrap();
    let layout = test_layout(dir.path(), false);

    let plan = write_plan(&layout, false);
    assert_eq!(plan.len(), 5);
    assert!(plan.iter().all(|spec| spec.partition != "miner_cfg"));

    // Offset writes never erase
    assert!(plan.iter().all(|spec| !(spec.erase && spec.offset > 0)));
}

#[test]
fn test_write_partition_command_shape() {
    let dir = tempfile::tempdir().unwrap();
    let layout = test_layout(dir.path(), false);
    let mut sim = SimTransport::new();

    let plan = write_plan(&layout, false);
    for spec in &plan {
        write_partition(&mut sim, spec).unwrap();
    }

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

    // The streamed payload is the source file's content
    match &sim.calls[0] {
        SimCall::Pipe { payload, .. } => assert_eq!(payload, b"boot.bin"),
        other => panic!("unexpected call {other:?}"),
    }
}

#[test]
fn test_erase_pass_avoids_active_slot() {
    let erased = obsolete_partitions(&test_device(BootMode::Nand, Some(1))).unwrap();
    assert_eq!(erased, vec!["fpga1", "fpga2", "uboot_env", "firmware2"]);

    let erased = obsolete_partitions(&test_device(BootMode::Nand, Some(2))).unwrap();
    assert_eq!(erased, vec!["fpga1", "fpga2", "uboot_env", "firmware1"]);
}

#[test]
fn test_erase_pass_sd_mode_targets_both_slots() {
    let erased = obsolete_partitions(&test_device(BootMode::Sd, None)).unwrap();
    assert_eq!(
        erased,
        vec!["fpga1", "fpga2", "uboot_env", "firmware1", "firmware2"]
    );
}

#[test]
fn test_erase_partition_command() {
    let mut sim = SimTransport::new();
    erase_partition(&mut sim, "uboot_env").unwrap();
    assert_eq!(sim.run_commands(), vec!["mtd erase uboot_env"]);
}
