//! Firmware bundle unpacking and validation.
//!
//! A bundle is a streamed archive whose extraction yields, at some depth, a
//! `firmware` directory named by a signature of the form
//! `<prefix>_<platform>_..._<version>`. That directory carries the boot
//! chain images and a nested `stage2.tgz` holding the images written to the
//! recovery chain.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use crate::error::{RestoreAbort, RestoreError};

pub const STAGE2_ARCHIVE: &str = "stage2.tgz";

/// Exact shape of the version field: 5 dash-separated fields, 21 chars total.
const VERSION_LEN: usize = 21;
const VERSION_FIELDS: usize = 5;

/// What a bundle signature claims about its content. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareDescriptor {
    pub version: String,
    /// Platform with any architecture prefix already stripped, so it compares
    /// directly against the device's board name.
    pub platform: String,
}

/// Parse a firmware signature into a descriptor.
///
/// Returns `None` for anything malformed or unknown; an unparsable signature
/// means "unsupported bundle", not a hard error. Membership in `platforms` is
/// checked before the `arch_prefix` is stripped (the set carries both forms).
pub fn parse_signature(
    signature: &str,
    platforms: &[&str],
    arch_prefix: &str,
) -> Option<FirmwareDescriptor> {
    let parts: Vec<&str> = signature.split('_').collect();
    if parts.len() < 3 {
        return None;
    }

    let version = parts[parts.len() - 1];
    let platform = parts[1];
    if version.len() != VERSION_LEN || version.split('-').count() != VERSION_FIELDS {
        return None;
    }
    if !platforms.contains(&platform) {
        return None;
    }

    let platform = platform.strip_prefix(arch_prefix).unwrap_or(platform);
    Some(FirmwareDescriptor {
        version: version.to_string(),
        platform: platform.to_string(),
    })
}

/// Unpack the outer bundle archive into `dest`.
///
/// The stream may be gzip-compressed or a plain tar; gzip is detected by its
/// magic bytes so the source can be a pipe or HTTP body.
pub fn unpack_archive<R: Read>(reader: R, dest: &Path) -> Result<(), RestoreError> {
    let mut reader = BufReader::new(reader);
    let gzipped = reader.fill_buf()?.starts_with(&[0x1f, 0x8b]);

    if gzipped {
        Archive::new(GzDecoder::new(reader)).unpack(dest)?;
    } else {
        Archive::new(reader).unpack(dest)?;
    }

    Ok(())
}

/// Recursively find the first directory named `firmware`, in sorted order so
/// the choice is deterministic.
fn find_firmware_dir(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if entry.file_name() == "firmware" {
            return Ok(Some(path));
        }
        if let Some(found) = find_firmware_dir(&path)? {
            return Ok(Some(found));
        }
    }

    Ok(None)
}

/// Locate the firmware directory inside an unpacked bundle and parse the
/// signature it sits under.
pub fn locate_bundle(
    root: &Path,
    platforms: &[&str],
    arch_prefix: &str,
) -> Result<(FirmwareDescriptor, PathBuf), RestoreError> {
    let firmware_dir = find_firmware_dir(root)?.ok_or_else(|| {
        RestoreAbort::UnsupportedBundle("no firmware directory in bundle".into())
    })?;

    // The signature is the first path component between the extraction root
    // and the firmware directory.
    let signature = firmware_dir
        .strip_prefix(root)
        .ok()
        .and_then(|rel| rel.components().next())
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .unwrap_or_default();

    let descriptor = parse_signature(&signature, platforms, arch_prefix).ok_or_else(|| {
        RestoreAbort::UnsupportedBundle(format!("unrecognized firmware signature '{signature}'"))
    })?;

    if !firmware_dir.join(STAGE2_ARCHIVE).is_file() {
        return Err(RestoreAbort::UnsupportedBundle(format!("missing {STAGE2_ARCHIVE}")).into());
    }

    Ok((descriptor, firmware_dir))
}

/// Extract `stage2.tgz` into a `stage2` directory next to it.
pub fn unpack_stage2(firmware_dir: &Path) -> Result<PathBuf, RestoreError> {
    let dest = firmware_dir.join("stage2");
    fs::create_dir_all(&dest)?;

    let archive = File::open(firmware_dir.join(STAGE2_ARCHIVE))?;
    Archive::new(GzDecoder::new(archive)).unpack(&dest)?;

    Ok(dest)
}

/// Resolved paths of every component the restoration writes.
#[derive(Debug, Clone)]
pub struct BundleLayout {
    pub boot_bin: PathBuf,
    pub uboot_img: PathBuf,
    pub fit_itb: PathBuf,
    pub factory_bin_gz: PathBuf,
    pub system_bit_gz: PathBuf,
    /// Bundles transitioning from the stock firmware carry an extra SPL-less
    /// boot image; absent otherwise.
    pub legacy_boot_bin_gz: Option<PathBuf>,
    pub miner_cfg_bin: PathBuf,
    pub miner_cfg_config: PathBuf,
}

impl BundleLayout {
    /// Resolve component paths and check that every required file exists, so
    /// nothing past unpacking can trip over a half-complete bundle.
    pub fn assemble(firmware_dir: &Path, stage2_dir: &Path) -> Result<Self, RestoreAbort> {
        fn required(dir: &Path, name: &str) -> Result<PathBuf, RestoreAbort> {
            let path = dir.join(name);
            if path.is_file() {
                Ok(path)
            } else {
                Err(RestoreAbort::UnsupportedBundle(format!("missing {name}")))
            }
        }

        let legacy = stage2_dir.join("boot.bin.gz");
        Ok(Self {
            boot_bin: required(firmware_dir, "boot.bin")?,
            uboot_img: required(firmware_dir, "u-boot.img")?,
            fit_itb: required(stage2_dir, "fit.itb")?,
            factory_bin_gz: required(stage2_dir, "factory.bin.gz")?,
            system_bit_gz: required(stage2_dir, "system.bit.gz")?,
            legacy_boot_bin_gz: legacy.is_file().then_some(legacy),
            miner_cfg_bin: required(stage2_dir, "miner_cfg.bin")?,
            miner_cfg_config: required(stage2_dir, "miner_cfg.config")?,
        })
    }
}

#[cfg(test)]
const TEST_PLATFORMS: &[&str] = &[
    "zynq-am1-s9",
    "zynq-dm1-g9",
    "zynq-dm1-g19",
    "am1-s9",
    "dm1-g9",
    "dm1-g19",
];

#[cfg(test)]
const TEST_SIGNATURE: &str = "braiins-os_zynq-am1-s9_ssh_2018-09-22-0-853643de";

#[test]
fn test_parse_signature_valid() {
    let descriptor = parse_signature(TEST_SIGNATURE, TEST_PLATFORMS, "zynq-").unwrap();
    assert_eq!(descriptor.platform, "am1-s9");
    assert_eq!(descriptor.version, "2018-09-22-0-853643de");
}

#[test]
fn test_parse_signature_bare_platform() {
    // Only two underscore-separated parts
    assert!(parse_signature("fw_dm1-g19", TEST_PLATFORMS, "zynq-").is_none());

    let descriptor =
        parse_signature("fw_dm1-g19_x_2018-09-22-0-853643de", TEST_PLATFORMS, "zynq-").unwrap();
    assert_eq!(descriptor.platform, "dm1-g19");
}

#[test]
fn test_parse_signature_rejects_bad_version() {
    // Wrong total length
    assert!(parse_signature("fw_am1-s9_x_2018-09-22-0-853643d", TEST_PLATFORMS, "zynq-").is_none());
    // Right length, wrong field count
    assert!(parse_signature("fw_am1-s9_x_2018-09-22-0853643de2", TEST_PLATFORMS, "zynq-").is_none());
}

#[test]
fn test_parse_signature_rejects_unknown_platform() {
    assert!(parse_signature(
        "braiins-os_zynq-xyz-t1_ssh_2018-09-22-0-853643de",
        TEST_PLATFORMS,
        "zynq-"
    )
    .is_none());
}

#[cfg(test)]
fn make_test_bundle(root: &Path) -> (PathBuf, PathBuf) {
    let firmware_dir = root.join(TEST_SIGNATURE).join("firmware");
    let stage2_dir = firmware_dir.join("stage2");
    fs::create_dir_all(&stage2_dir).unwrap();
    for name in ["boot.bin", "u-boot.img", STAGE2_ARCHIVE] {
        fs::write(firmware_dir.join(name), b"x").unwrap();
    }
    for name in [
        "fit.itb",
        "factory.bin.gz",
        "system.bit.gz",
        "miner_cfg.bin",
        "miner_cfg.config",
    ] {
        fs::write(stage2_dir.join(name), b"x").unwrap();
    }
    (firmware_dir, stage2_dir)
}

#[test]
fn test_locate_bundle() {
    let root = tempfile::tempdir().unwrap();
    let (firmware_dir, _) = make_test_bundle(root.path());

    let (descriptor, located) =
        locate_bundle(root.path(), TEST_PLATFORMS, "zynq-").unwrap();
    assert_eq!(located, firmware_dir);
    assert_eq!(descriptor.platform, "am1-s9");
}

#[test]
fn test_locate_bundle_missing_firmware_dir() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir_all(root.path().join("something/else")).unwrap();

    let result = locate_bundle(root.path(), TEST_PLATFORMS, "zynq-");
    assert!(matches!(
        result,
        Err(RestoreError::Abort(RestoreAbort::UnsupportedBundle(_)))
    ));
}

#[test]
fn test_locate_bundle_missing_stage2() {
    let root = tempfile::tempdir().unwrap();
    let (firmware_dir, _) = make_test_bundle(root.path());
    fs::remove_file(firmware_dir.join(STAGE2_ARCHIVE)).unwrap();

    let result = locate_bundle(root.path(), TEST_PLATFORMS, "zynq-");
    assert!(matches!(
        result,
        Err(RestoreError::Abort(RestoreAbort::UnsupportedBundle(_)))
    ));
}

#[test]
fn test_assemble_layout() {
    let root = tempfile::tempdir().unwrap();
    let (firmware_dir, stage2_dir) = make_test_bundle(root.path());

    let layout = BundleLayout::assemble(&firmware_dir, &stage2_dir).unwrap();
    assert!(layout.legacy_boot_bin_gz.is_none());

    fs::write(stage2_dir.join("boot.bin.gz"), b"x").unwrap();
    let layout = BundleLayout::assemble(&firmware_dir, &stage2_dir).unwrap();
    assert!(layout.legacy_boot_bin_gz.is_some());

    fs::remove_file(stage2_dir.join("fit.itb")).unwrap();
    assert!(matches!(
        BundleLayout::assemble(&firmware_dir, &stage2_dir),
        Err(RestoreAbort::UnsupportedBundle(_))
    ));
}
