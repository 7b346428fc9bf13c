//! Command-line entry point for restoring miner firmware over the network.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use clap::Parser;

use bos_restore::bundle::{self, BundleLayout};
use bos_restore::error::RestoreError;
use bos_restore::fetch::{self, DigestReader};
use bos_restore::restore::{self, RestoreOptions, RestoreSettings};
use bos_restore::transport::ssh::SshTransport;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Path or URL of the firmware bundle tarball
    firmware_source: String,

    /// Hostname of the miner to restore
    hostname: String,

    /// Path to a configuration file
    #[clap(long)]
    config: Option<PathBuf>,

    /// Rewrite all miner settings with new/default configuration
    #[clap(long)]
    rewrite_config: bool,

    /// Override the MAC address
    #[clap(long)]
    mac: Option<String>,

    /// Proceed even if the firmware platform does not match the device
    #[clap(long)]
    force: bool,
}

/// Ask the operator to confirm before the first flash write.
fn confirm_restore() -> bool {
    eprintln!("This will overwrite the firmware partitions of the target device.");
    eprint!("Type \"yes\" to continue: ");
    let _ = io::stderr().flush();

    let mut input = String::new();
    match io::stdin().lock().read_line(&mut input) {
        Ok(_) => input.trim().eq_ignore_ascii_case("yes"),
        Err(_) => false,
    }
}

fn run(cli: &Cli) -> Result<(), RestoreError> {
    let settings = RestoreSettings::default();
    let workdir = tempfile::tempdir()?;

    let source = fetch::open_source(&cli.firmware_source)?;
    let mut source = DigestReader::new(source);
    println!("Extracting firmware bundle...");
    bundle::unpack_archive(&mut source, workdir.path())?;
    println!("Firmware bundle checksum: {:08x}", source.finish());

    let (descriptor, firmware_dir) =
        bundle::locate_bundle(workdir.path(), settings.platforms, settings.arch_prefix)?;
    println!("Extracting stage2 archive...");
    let stage2_dir = bundle::unpack_stage2(&firmware_dir)?;
    let layout = BundleLayout::assemble(&firmware_dir, &stage2_dir)?;
    println!(
        "Detected firmware image: {} ({})",
        descriptor.version, descriptor.platform
    );

    println!("Connecting to {}...", cli.hostname);
    let mut transport = SshTransport::connect(&cli.hostname, settings.username)?;

    let opts = RestoreOptions {
        config: cli.config.clone(),
        rewrite_config: cli.rewrite_config,
        mac: cli.mac.clone(),
        force: cli.force,
    };
    restore::deploy(
        &mut transport,
        &layout,
        &descriptor,
        &opts,
        &settings,
        confirm_restore,
    )
}

fn main() {
    let cli = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let code = match run(&cli) {
        Ok(()) => 0,
        Err(error) => {
            howudoin::disable();
            thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down
            eprintln!("[-] Restoration failed:\n{error:#}");
            error.exit_code()
        }
    };

    howudoin::disable();
    thread::sleep(Duration::from_millis(10));
    process::exit(code);
}
