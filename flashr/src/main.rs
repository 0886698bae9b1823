mod logging;
mod term;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use flashr_core::config::Config;
use flashr_core::device::DeviceDescriptor;
use flashr_core::error::FlashError;
use flashr_core::history::{ImageHistoryStore, JsonImageHistory};
use flashr_core::identity::{DeviceIdentity, DeviceIdentityResolver};
use flashr_core::image::ImageDescriptor;
use flashr_core::inventory::{DeviceType, InventoryRecord, InventoryStore, JsonInventoryStore};
use flashr_core::orchestrator::{FlashOrchestrator, FlashState};
use flashr_core::platform::{DeviceEnumerator, SystemEnumerator};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "flashr")]
#[command(about = "A guarded, interactive disk image flasher", version)]
struct Cli {
    /// Configuration file (defaults to ~/.config/flashr/flashr.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to a removable device
    Write {
        /// Image file to write
        #[arg(required = true)]
        image: PathBuf,

        /// Whole-disk node to write to (e.g. /dev/disk4); prompts if omitted
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Skip computing or re-checking the image checksum
        #[arg(long = "no-checksum")]
        no_checksum: bool,

        /// Expected SHA-256 of the image, checked before writing (enables the
        /// checksum phase even when the config turns it off)
        #[arg(long, value_name = "HEX", conflicts_with = "no_checksum")]
        sha256: Option<String>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// List attached removable devices
    List,
    /// Show every device in the inventory
    Inventory,
    /// Set or clear the name of a known device
    Rename {
        identity: String,
        /// New name; omit to go back to the device's own name
        name: Option<String>,
    },
    /// Classify a known device
    Classify {
        identity: String,
        /// One of: usb-stick, sd-card, external-drive, other
        device_type: DeviceType,
    },
    /// Remove a device from the inventory
    Forget { identity: String },
    /// Show recently flashed images and their checksums
    History,
}

fn open_inventory(config: &Config) -> Result<DeviceIdentityResolver<JsonInventoryStore>> {
    let path = config.storage.inventory_path();
    let store = JsonInventoryStore::open(&path)
        .with_context(|| format!("open inventory: {}", path.display()))?;
    Ok(DeviceIdentityResolver::new(store))
}

/// Enumerates attached devices and records each in the inventory.
fn discover(
    resolver: &DeviceIdentityResolver<JsonInventoryStore>,
) -> Result<Vec<(DeviceDescriptor, InventoryRecord)>> {
    let devices = SystemEnumerator.devices()?;
    Ok(devices
        .into_iter()
        .map(|device| {
            let record = resolver.observe(&device);
            (device, record)
        })
        .collect())
}

/// Presents an interactive menu for the user to select a device.
fn select_device(
    devices: &[(DeviceDescriptor, InventoryRecord)],
    prompt: &str,
) -> Result<DeviceDescriptor> {
    if devices.is_empty() {
        bail!("No removable devices found.");
    }

    let items: Vec<String> = devices
        .iter()
        .map(|(device, record)| format!("{} ({device})", record.display_name()))
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].0.clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn bar_style(color: &str) -> Result<ProgressStyle> {
    let template = format!(
        "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}}) {{msg}}"
    );
    Ok(ProgressStyle::default_bar()
        .template(&template)?
        .progress_chars("■ "))
}

fn short_size(bytes: u64) -> String {
    format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

/// `--no-checksum` turns the checksum phase off; `--sha256` turns it on
/// whatever the config says. clap keeps the two apart.
fn apply_checksum_flags(config: &mut Config, no_checksum: bool, expected_sha256: bool) {
    if no_checksum {
        config.flash.compute_checksum = false;
    } else if expected_sha256 && !config.flash.compute_checksum {
        debug!("--sha256 given; enabling the checksum phase");
        config.flash.compute_checksum = true;
    }
}

fn write_image(
    config: &Config,
    image_path: &Path,
    device_path: Option<&Path>,
    expected_sha256: Option<String>,
    assume_yes: bool,
) -> Result<()> {
    let image_path = image_path
        .canonicalize()
        .with_context(|| format!("image not found: {}", image_path.display()))?;
    let mut image = ImageDescriptor::from_path(&image_path)
        .with_context(|| format!("read image: {}", image_path.display()))?;

    let resolver = open_inventory(config)?;
    let devices = discover(&resolver)?;
    let device = match device_path {
        Some(path) => devices
            .iter()
            .find(|(d, _)| d.path == path)
            .map(|(d, _)| d.clone())
            .ok_or_else(|| anyhow!("'{}' is not an attached removable device", path.display()))?,
        None => select_device(&devices, "Select the target device to WRITE to")?,
    };
    info!(device = %device.path.display(), image = %image_path.display(), "target selected");
    let name = devices
        .iter()
        .find(|(d, _)| d.path == device.path)
        .map(|(_, r)| r.display_name().to_string())
        .unwrap_or_else(|| device.display_name());

    let checking = config.flash.compute_checksum;
    let checksum_pb = if checking {
        ProgressBar::new(image.size())
    } else {
        ProgressBar::hidden()
    };
    let write_pb = ProgressBar::new(image.size());
    checksum_pb.set_style(bar_style("blue")?);
    write_pb.set_style(bar_style("green")?);
    write_pb.set_prefix("Writing");

    let orchestrator = {
        let checksum_pb = checksum_pb.clone();
        let write_pb = write_pb.clone();
        let size = image.size();
        FlashOrchestrator::from_config(config)?.with_observer(move |state| match state {
            FlashState::CalculatingChecksum(p) => {
                checksum_pb.set_position((p * size as f64) as u64);
            }
            FlashState::Flashing(p) => {
                if !checksum_pb.is_finished() {
                    checksum_pb.finish_with_message("done");
                }
                write_pb.set_position((p * size as f64) as u64);
                if *p >= 1.0 {
                    write_pb.set_message("verifying...");
                }
            }
            _ => {}
        })
    };
    let orchestrator = Arc::new(orchestrator);

    if checking {
        let known = expected_sha256.or_else(|| orchestrator.history().checksum_for(image.path()));
        match known {
            Some(sum) => {
                image.attach_checksum(sum);
                checksum_pb.set_prefix("Checking");
            }
            None => checksum_pb.set_prefix("Checksum"),
        }
    }

    println!(
        "{} This will erase all data on '{}' ({}).",
        style("WARNING:").red().bold(),
        name,
        short_size(device.size),
    );
    println!("  Device: {}", style(device.path.display()).cyan());
    println!("  Image:  {} ({})", style(image.path().display()).cyan(), image.kind());
    if device.is_mounted() {
        println!("  The device is mounted and will be unmounted first.");
    }
    println!();

    if !assume_yes && !confirm_operation("Are you sure you want to proceed?")? {
        println!("Write operation cancelled.");
        return Ok(());
    }
    println!();

    let _echo = term::EchoGuard::new();
    let handle = Arc::clone(&orchestrator);
    ctrlc::set_handler(move || {
        warn!("interrupt received, cancelling flash");
        handle.cancel();
    })?;

    match orchestrator.flash(&mut image, &device) {
        Ok(report) => {
            write_pb.finish_with_message("verified");
            println!(
                "\n✨ Successfully flashed {} with {}.",
                style(report.raw_device_path.display()).cyan(),
                style(image.path().display()).cyan()
            );
            if let Some(sum) = &report.checksum {
                println!("  SHA-256: {sum}");
            }
            for warning in &report.warnings {
                println!("  {} {warning}", style("warning:").yellow().bold());
            }
            Ok(())
        }
        Err(failure) => {
            checksum_pb.abandon();
            write_pb.abandon();
            if failure.error == FlashError::OperationCancelled {
                println!("\nOperation cancelled.");
            }
            if !failure.device.is_untouched() {
                println!(
                    "{} {} may hold a partial image; do not boot from it.",
                    style("WARNING:").red().bold(),
                    device.path.display()
                );
            }
            Err(failure.into())
        }
    }
}

fn list_devices(config: &Config) -> Result<()> {
    let resolver = open_inventory(config)?;
    let devices = discover(&resolver)?;
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!(
        "\n  {:<12} {:<25} {:<10} {:<15} {}",
        "DEVICE", "NAME", "SIZE", "TYPE", "LOCATION"
    );
    println!("  {:-<12} {:-<25} {:-<10} {:-<15} {:-<20}", "", "", "", "", "");
    for (device, record) in &devices {
        let location = device
            .mount_points()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let location = if location.is_empty() {
            "(Not mounted)".to_string()
        } else {
            location
        };
        let kind = record.device_type.map(|t| t.to_string()).unwrap_or_default();
        println!(
            "  {:<12} {:<25} {:>10} {:<15} {}",
            device.path.display(),
            record.display_name(),
            short_size(device.size),
            kind,
            location
        );
    }
    Ok(())
}

fn show_inventory(config: &Config) -> Result<()> {
    let resolver = open_inventory(config)?;
    let records = resolver.store().records();
    if records.is_empty() {
        println!("The inventory is empty.");
        return Ok(());
    }

    println!(
        "  {:<36} {:<25} {:<10} {:<15} {}",
        "IDENTITY", "NAME", "SIZE", "TYPE", "LAST SEEN"
    );
    println!("  {:-<36} {:-<25} {:-<10} {:-<15} {:-<20}", "", "", "", "", "");
    for record in records {
        println!(
            "  {:<36} {:<25} {:>10} {:<15} {}",
            record.identity,
            record.display_name(),
            short_size(record.size),
            record.device_type.map(|t| t.to_string()).unwrap_or_default(),
            record.last_seen.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn show_history(config: &Config) -> Result<()> {
    let path = config.storage.history_path();
    let history = JsonImageHistory::open(&path, config.storage.history_capacity)
        .with_context(|| format!("open image history: {}", path.display()))?;
    let entries = history.entries();
    if entries.is_empty() {
        println!("No images have been flashed yet.");
        return Ok(());
    }
    for entry in entries {
        println!(
            "  {}  {}  {}",
            entry.recorded_at.format("%Y-%m-%d %H:%M"),
            style(&entry.checksum).dim(),
            entry.path.display()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref())?;
    logging::init(&config.logging.level);
    debug!(config = ?cli.config, "configuration loaded");

    match cli.command {
        Commands::Write {
            image,
            device,
            no_checksum,
            sha256,
            yes,
        } => {
            let mut config = config;
            apply_checksum_flags(&mut config, no_checksum, sha256.is_some());
            write_image(&config, &image, device.as_deref(), sha256, yes)?;
        }
        Commands::List => list_devices(&config)?,
        Commands::Inventory => show_inventory(&config)?,
        Commands::Rename { identity, name } => {
            let resolver = open_inventory(&config)?;
            let record = resolver
                .store()
                .set_custom_name(&DeviceIdentity::from(identity), name)?;
            println!("{} is now '{}'.", record.identity, record.display_name());
        }
        Commands::Classify {
            identity,
            device_type,
        } => {
            let resolver = open_inventory(&config)?;
            let record = resolver
                .store()
                .set_device_type(&DeviceIdentity::from(identity), Some(device_type))?;
            println!("{} is now classified as {device_type}.", record.display_name());
        }
        Commands::Forget { identity } => {
            let resolver = open_inventory(&config)?;
            let identity = DeviceIdentity::from(identity);
            match resolver.store().remove(&identity)? {
                Some(record) => println!("Forgot {} ({identity}).", record.display_name()),
                None => bail!("no inventory record for '{identity}'"),
            }
        }
        Commands::History => show_history(&config)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_checksum_overrides_a_disabled_checksum_phase() {
        let mut config = Config::default();
        config.flash.compute_checksum = false;
        apply_checksum_flags(&mut config, false, true);
        assert!(config.flash.compute_checksum);
    }

    #[test]
    fn no_checksum_flag_disables_the_phase() {
        let mut config = Config::default();
        apply_checksum_flags(&mut config, true, false);
        assert!(!config.flash.compute_checksum);

        let mut config = Config::default();
        apply_checksum_flags(&mut config, false, false);
        assert!(config.flash.compute_checksum);
    }

    #[test]
    fn sha256_and_no_checksum_conflict() {
        let result = Cli::try_parse_from([
            "flashr",
            "write",
            "image.img",
            "--no-checksum",
            "--sha256",
            "abcd",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn classify_parses_device_types() {
        let cli = Cli::try_parse_from(["flashr", "classify", "Generic_1.00_6386", "sd-card"])
            .unwrap();
        match cli.command {
            Commands::Classify {
                identity,
                device_type,
            } => {
                assert_eq!(identity, "Generic_1.00_6386");
                assert_eq!(device_type, DeviceType::SdCard);
            }
            _ => panic!("expected classify"),
        }
    }
}
