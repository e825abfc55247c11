use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddrV4, TcpStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use slotboot::boot::{BootConfigStore, BootOptions, BootOutcome, BootSelector, ScriptedPlatform};
use slotboot::config::{ConfigRecord, ConfigStore};
use slotboot::flash::MemFlash;
use slotboot::image::{check_image, write_image, ImageBuilder, IntegrityPolicy};
use slotboot::layout::{FlashLayout, UPGRADE_SLOTS};
use slotboot::ota::updater::{get_boot_slot, set_boot_slot};
use slotboot::ota::{OtaError, OtaOptions, OtaTransport, Updater};
use slotboot::{logging, version};

#[derive(Parser)]
#[command(name = "slotboot")]
#[command(about = "Boot slot, OTA and config tool for NOR flash images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Flash image file, created blank if missing
    #[arg(long, global = true, default_value = "flash.bin")]
    flash: PathBuf,

    /// Flash layout as JSON, default 4 MB map if omitted
    #[arg(long, global = true)]
    layout: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a firmware image file
    Mkimage {
        #[arg(long)]
        out: PathBuf,
        /// Entry point, hex
        #[arg(long, value_parser = parse_hex)]
        entry: u32,
        /// Load address and data file, as addr:file (addr in hex)
        #[arg(long = "section", value_parser = parse_section, required = true)]
        sections: Vec<(u32, PathBuf)>,
        /// Leave out the SHA-256 trailer; header bytes are then covered by nothing
        #[arg(long)]
        no_digest: bool,
    },
    /// Write an image file into a slot
    Flash {
        #[arg(long)]
        slot: u8,
        #[arg(long)]
        image: PathBuf,
    },
    /// Run the boot selector against the flash image
    Boot {
        /// Hold the override pin; only honoured after `slot gpio on <slot>`
        #[arg(long = "override")]
        hold_override: bool,
        /// Hold the factory reset pin
        #[arg(long)]
        factory_reset: bool,
    },
    /// Inspect or change the stored configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect or change the boot slot
    Slot {
        #[command(subcommand)]
        action: SlotAction,
    },
    /// Download an image over HTTP into the inactive slot
    Ota {
        /// host[:port]/path, host must be an IPv4 address
        #[arg(long)]
        url: String,
        /// Expected SHA-256 of the image, hex
        #[arg(long)]
        sha256: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    /// Replace the stored configuration with defaults
    Init,
    SetLoc { n: u8, value: String },
    SetStation { ssid: String, password: String },
}

#[derive(Subcommand)]
enum SlotAction {
    Get,
    Set { slot: String },
    /// Enable or disable the override pin and pick the slot it boots
    Gpio { state: GpioState, slot: u8 },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
enum GpioState {
    On,
    Off,
}

fn parse_hex(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

fn parse_section(s: &str) -> Result<(u32, PathBuf), String> {
    let (addr, file) = s.split_once(':').ok_or_else(|| format!("expected addr:file, got '{}'", s))?;
    Ok((parse_hex(addr)?, PathBuf::from(file)))
}

fn load_layout(path: Option<&Path>) -> Result<FlashLayout> {
    let layout = match path {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => FlashLayout::default(),
    };
    layout.validate()?;
    Ok(layout)
}

fn load_flash(path: &Path, layout: &FlashLayout) -> Result<MemFlash> {
    if !path.exists() {
        info!("Creating blank flash image {}", path.display());
        return Ok(MemFlash::new(layout.flash_size));
    }
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if data.len() != layout.flash_size as usize {
        bail!("{} is {} bytes, layout expects {}", path.display(), data.len(), layout.flash_size);
    }
    Ok(MemFlash::from_bytes(data))
}

fn save_flash(path: &Path, flash: &MemFlash) -> Result<()> {
    fs::write(path, flash.as_bytes()).with_context(|| format!("writing {}", path.display()))
}

fn masked(record: &ConfigRecord) -> ConfigRecord {
    let mut shown = record.clone();
    if !shown.password.is_empty() {
        shown.password.clear();
        let _ = shown.password.push_str("********");
    }
    shown
}

/// Blocking TCP transport for the simulator
struct TcpTransport {
    stream: Option<TcpStream>,
    connect_timeout: Duration,
}

impl TcpTransport {
    fn new(connect_timeout: Duration) -> Self {
        Self { stream: None, connect_timeout }
    }

    fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.read(buf),
            None => Err(ErrorKind::NotConnected.into()),
        }
    }
}

fn io_code(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or(-1)
}

impl OtaTransport for TcpTransport {
    fn connect(&mut self, addr: SocketAddrV4) -> Result<(), OtaError> {
        let stream = TcpStream::connect_timeout(&addr.into(), self.connect_timeout)
            .map_err(|e| OtaError::Transport(io_code(&e)))?;
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .map_err(|e| OtaError::Transport(io_code(&e)))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), OtaError> {
        let stream = self.stream.as_mut().ok_or(OtaError::Transport(-1))?;
        stream.write_all(data).map_err(|e| OtaError::Transport(io_code(&e)))
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }
}

/// `host[:port]/path` to the `ip[:port] path` form the updater takes
fn url_to_args(url: &str) -> Result<String> {
    let url = url.trim_start_matches("http://");
    let (host, path) = url.split_once('/').ok_or_else(|| anyhow!("url has no path: {}", url))?;
    Ok(format!("{} {}", host, path))
}

fn run_ota(flash: &mut MemFlash, layout: &FlashLayout, url: &str, sha256: Option<String>) -> Result<()> {
    let options = OtaOptions { expected_sha256: sha256, ..OtaOptions::default() };
    let transport = TcpTransport::new(options.connect_timeout());
    let mut updater = Updater::new(layout.clone(), transport, options);
    let mut platform = ScriptedPlatform::new();

    let slot = updater
        .start_update(flash, &url_to_args(url)?, Instant::now())
        .map_err(|e| anyhow!("update not started: {}", e))?;
    println!("Updating slot {}", slot);

    // connect() above blocked until the connection was up
    updater.manager_mut().on_connected(Instant::now());
    updater.manager_mut().on_sent(Instant::now());

    let mut buf = vec![0u8; updater.manager().options().max_chunk];
    let result = loop {
        if let Some(result) = updater.service(flash, &mut platform, Instant::now()) {
            break result;
        }
        let received = updater.manager_mut().transport_mut().recv(&mut buf);
        let ota = updater.manager_mut();
        match received {
            Ok(0) => ota.on_disconnected(),
            Ok(n) => ota.on_data(flash, &buf[..n], Instant::now()),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => ota.on_error(io_code(&e)),
        }
    };

    match result {
        Ok(()) => {
            println!("Update written to slot {}, device would reset now", slot);
            Ok(())
        }
        Err(e) => bail!("{}", e),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logger().map_err(|e| anyhow!("logger: {}", e))?;
    if !logging::set_max_level_from_str(&cli.log_level) {
        warn!("Unknown log level '{}', keeping {}", cli.log_level, logging::current_max_level());
    }
    info!("{}", version::version_info());

    let command = match cli.command {
        Commands::Mkimage { out, entry, sections, no_digest } => {
            return mkimage(&out, entry, &sections, !no_digest)
        }
        command => command,
    };

    let layout = load_layout(cli.layout.as_deref())?;
    let mut flash = load_flash(&cli.flash, &layout)?;
    run_command(command, &layout, &mut flash)?;
    save_flash(&cli.flash, &flash)
}

fn mkimage(out: &Path, entry: u32, sections: &[(u32, PathBuf)], digest: bool) -> Result<()> {
    let mut builder = ImageBuilder::new(entry);
    for (addr, file) in sections {
        let data = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        builder = builder.section(*addr, data);
    }
    if digest {
        builder = builder.with_digest();
    }
    let image = builder.build();
    fs::write(out, &image).with_context(|| format!("writing {}", out.display()))?;
    println!("Wrote {} bytes to {}", image.len(), out.display());
    Ok(())
}

fn run_command(command: Commands, layout: &FlashLayout, flash: &mut MemFlash) -> Result<()> {
    match command {
        Commands::Mkimage { .. } => bail!("mkimage does not take a flash image"),
        Commands::Flash { slot, image } => {
            if !UPGRADE_SLOTS.contains(&slot) && slot != slotboot::layout::FACTORY_SLOT {
                bail!("no slot {}", slot);
            }
            let region = layout.slot(slot)?;
            let data = fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
            write_image(flash, &region, &data)?;
            let valid = check_image(flash, &region, IntegrityPolicy::DigestIfPresent)?;
            println!(
                "Slot {} at 0x{:06x}: entry 0x{:08x}, {} sections, {}",
                slot,
                region.base,
                valid.entry,
                valid.sections.len(),
                valid.flash_info
            );
        }
        Commands::Boot { hold_override, factory_reset } => {
            let options = BootOptions::default();
            let mut platform = ScriptedPlatform::new().hold(options.override_pin.pin, !hold_override);
            if let Some(pin) = options.factory_reset_pin {
                platform = platform.hold(pin.pin, !factory_reset);
            }
            let mut selector = BootSelector::new(flash, &mut platform, layout, &options);
            let outcome = selector.run()?;
            let report = selector.into_report();
            println!("{}", serde_json::to_string_pretty(&report)?);
            match outcome {
                BootOutcome::Boot(target) => {
                    println!("Booting slot {} at entry 0x{:08x}", target.slot, target.image.entry)
                }
                BootOutcome::FactoryReset => println!("Factory reset performed"),
                BootOutcome::Halted => println!("No good ROM available"),
            }
            println!("Simulated time {} ms, {} reset(s)", platform.elapsed_ms, platform.resets);
        }
        Commands::Config { action } => {
            let mut store = ConfigStore::init(layout)?;
            let outcome = store.load(flash)?;
            info!("Config load: {:?}", outcome);
            match action {
                ConfigAction::Show => {}
                ConfigAction::Init => store.wipe(flash)?,
                ConfigAction::SetLoc { n, value } => match store.set_location(flash, n, &value) {
                    Ok(change) => println!("{}", change.describe(&value)),
                    Err(e) => bail!("{}", e.reason()),
                },
                ConfigAction::SetStation { ssid, password } => {
                    match store.set_station(flash, &ssid, &password, true) {
                        Ok(change) => println!("{}", change.describe(&ssid)),
                        Err(e) => bail!("{}", e.reason()),
                    }
                }
            }
            let record = store.record().ok_or_else(|| anyhow!("config not loaded"))?;
            println!("{}", serde_json::to_string_pretty(&masked(record))?);
        }
        Commands::Slot { action } => match action {
            SlotAction::Get => {
                let slot = get_boot_slot(flash, layout).map_err(|e| anyhow!("{}", e))?;
                println!("{}", slot);
            }
            SlotAction::Set { slot } => {
                set_boot_slot(flash, layout, Some(&slot)).map_err(|e| anyhow!("{}", e))?;
                println!("Boot slot set to {}", slot);
            }
            SlotAction::Gpio { state, slot } => {
                let store = BootConfigStore::new(layout);
                store.load(flash)?;
                store.set_gpio_mode(flash, state == GpioState::On, slot)?;
                println!("GPIO boot {:?}, slot {}", state, slot);
            }
        },
        Commands::Ota { url, sha256 } => run_ota(flash, layout, &url, sha256)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_section() {
        assert_eq!(parse_section("0x40100000:code.bin"), Ok((0x4010_0000, PathBuf::from("code.bin"))));
        assert!(parse_section("nofile").is_err());
        assert!(parse_section("zz:file").is_err());
    }

    #[test]
    fn test_url_to_args() {
        assert_eq!(url_to_args("http://10.0.0.2:8000/fw/app.bin").unwrap(), "10.0.0.2:8000 fw/app.bin");
        assert!(url_to_args("10.0.0.2").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["slotboot", "--flash", "f.bin", "config", "set-loc", "1", "garage"]).unwrap();
        assert!(matches!(cli.command, Commands::Config { action: ConfigAction::SetLoc { n: 1, .. } }));
        assert!(Cli::try_parse_from(["slotboot", "mkimage", "--out", "x", "--entry", "0x1"]).is_err());
        let cli = Cli::try_parse_from(["slotboot", "slot", "gpio", "on", "2"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Slot { action: SlotAction::Gpio { state: GpioState::On, slot: 2 } }
        ));
    }

    #[test]
    fn test_mkimage_appends_digest_by_default() {
        let dir = std::env::temp_dir().join(format!("slotboot-mkimage-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let code = dir.join("code.bin");
        let out = dir.join("app.bin");
        fs::write(&code, vec![0x5A; 600]).unwrap();
        let cli = Cli::try_parse_from([
            "slotboot",
            "mkimage",
            "--out",
            out.to_str().unwrap(),
            "--entry",
            "0x40100004",
            "--section",
            &format!("0x40100000:{}", code.display()),
        ])
        .unwrap();
        let Commands::Mkimage { out, entry, sections, no_digest } = cli.command else {
            panic!("expected mkimage");
        };
        assert!(!no_digest);
        mkimage(&out, entry, &sections, !no_digest).unwrap();

        let layout = FlashLayout::default();
        let mut flash = MemFlash::new(layout.flash_size);
        let region = layout.slot(0).unwrap();
        write_image(&mut flash, &region, &fs::read(&out).unwrap()).unwrap();
        assert!(check_image(&mut flash, &region, IntegrityPolicy::RequireDigest).is_ok());

        // a flipped entry byte is outside the checksum but inside the digest
        flash.bytes_mut()[region.base as usize + 4] ^= 0x01;
        assert!(check_image(&mut flash, &region, IntegrityPolicy::DigestIfPresent).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_slot_gpio_enables_override() {
        let layout = FlashLayout::default();
        let mut flash = MemFlash::new(layout.flash_size);
        let command = Cli::try_parse_from(["slotboot", "slot", "gpio", "on", "2"]).unwrap().command;
        run_command(command, &layout, &mut flash).unwrap();
        let config = BootConfigStore::new(&layout).read(&mut flash).unwrap().unwrap();
        assert!(config.gpio_mode());
        assert_eq!(config.gpio_slot, 2);
    }
}
