//! The core, UI-agnostic library for the `flashr` disk imaging utility.
//!
//! `flashr-core` writes a disk image verbatim to a removable device while
//! refusing anything that looks like a mounted volume, a partition slice or a
//! device too small for the image. It also keeps a persistent inventory of
//! the devices it has seen, keyed by an identity that survives unplugging and
//! replugging.
//!
//! The library is structured into several key modules:
//! - [`orchestrator`]: The flash state machine tying every phase together.
//! - [`validate`]: Pre-flight safety checks and raw-device-path derivation.
//! - [`checksum`]: Streaming SHA-256 with progress and cancellation.
//! - [`mount`]: Bounded unmount/remount around the write.
//! - [`mod@write`]: Streaming block copy to the raw device node.
//! - [`verify`]: Post-write sample comparison.
//! - [`identity`] and [`inventory`]: Device identity and the device inventory.
//! - [`history`]: Recently flashed images and their checksums.
//! - [`platform`]: Discovery of removable devices.
//!
//! Every external capability (device discovery, mounting, copying, image
//! access, persistence) sits behind a trait, so front-ends and tests can
//! substitute their own.
//!
//! ## Example: Flashing an Image with Progress Reporting
//!
//! ```rust,no_run
//! use flashr_core::config::Config;
//! use flashr_core::image::ImageDescriptor;
//! use flashr_core::orchestrator::{FlashOrchestrator, FlashState};
//! use flashr_core::platform;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let config = Config::load_or_default(None)?;
//!     let devices = platform::get_removable_devices()?;
//!     let Some(device) = devices.first() else {
//!         anyhow::bail!("no removable devices found");
//!     };
//!
//!     let orchestrator = FlashOrchestrator::from_config(&config)?.with_observer(|state| {
//!         if let FlashState::Flashing(p) = state {
//!             println!("{:.0}% written", p * 100.0);
//!         }
//!     });
//!
//!     let mut image = ImageDescriptor::from_path("path/to/image.img")?;
//!     let report = orchestrator.flash(&mut image, device)?;
//!     println!("wrote {}", report.raw_device_path.display());
//!
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod checksum;
pub mod config;
pub mod device;
pub mod error;
pub mod history;
pub mod identity;
pub mod image;
pub mod inventory;
pub mod mount;
pub mod orchestrator;
mod persist;
pub mod platform;
pub mod validate;
pub mod verify;
pub mod write;
