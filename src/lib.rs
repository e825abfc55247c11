//! Boot slot selection, OTA updates and persistent configuration for a device running from raw
//! NOR flash.
//!
//! Flash is reached only through [`flash::Flash`], so every piece runs the same against the
//! in-memory simulator as against hardware.

pub mod boot;
pub mod config;
pub mod flash;
pub mod image;
pub mod layout;
pub mod logging;
pub mod ota;
pub mod system;
pub mod version;

pub use boot::{BootOptions, BootOutcome, BootReport, BootSelector};
pub use config::{ConfigStore, LoadOutcome};
pub use flash::{Flash, FlashError, MemFlash};
pub use layout::FlashLayout;
pub use ota::{OtaManager, OtaOptions, Updater};
