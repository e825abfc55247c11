use log::{Level, LevelFilter, Metadata, Record};
use std::sync::{Mutex, OnceLock};
use std::time::SystemTime;

static BOOT_TIME: OnceLock<SystemTime> = OnceLock::new();
static CAPTURE: Mutex<Option<Vec<String>>> = Mutex::new(None);

#[allow(dead_code)]
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BRIGHT_RED: &str = "\x1b[91m";
    pub const BRIGHT_YELLOW: &str = "\x1b[93m";
    pub const BRIGHT_GREEN: &str = "\x1b[92m";
    pub const BRIGHT_BLUE: &str = "\x1b[94m";
    pub const GRAY: &str = "\x1b[90m";
}

/// Time since the logger started, compact enough for a serial console
fn ts_compact(elapsed: std::time::Duration) -> String {
    let seconds = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    if seconds < 60 {
        format!("{:>3}.{:03}s", seconds, millis)
    } else if seconds < 3600 {
        format!("{:>2}m{:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{:>2}h{:02}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Last `::` component of a module path, cut to the column width
fn module_column(path: Option<&str>) -> &str {
    let module = path.unwrap_or("unknown").rsplit("::").next().unwrap_or("unknown");
    match module.char_indices().nth(12) {
        Some((i, _)) => &module[..i],
        None => module,
    }
}

/// Colored, timestamped console logger. Lines can also be captured for inspection.
struct BootLogger;

impl log::Log for BootLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let boot_time = BOOT_TIME.get_or_init(SystemTime::now);
        let elapsed = SystemTime::now().duration_since(*boot_time).unwrap_or_default();
        let ts = ts_compact(elapsed);

        let (color, level_char) = match record.level() {
            Level::Error => (colors::BRIGHT_RED, 'E'),
            Level::Warn => (colors::BRIGHT_YELLOW, 'W'),
            Level::Info => (colors::BRIGHT_GREEN, 'I'),
            Level::Debug => (colors::BRIGHT_BLUE, 'D'),
            Level::Trace => (colors::GRAY, 'T'),
        };
        let module = module_column(record.module_path());
        let message = format!("{}", record.args());

        // stderr so command output on stdout stays machine readable
        eprintln!("{}{} [{}] {:>12} | {}{}", color, ts, level_char, module, message, colors::RESET);

        if let Ok(mut capture) = CAPTURE.lock() {
            if let Some(lines) = capture.as_mut() {
                lines.push(format!("[{}] {}", level_char, message));
            }
        }
    }

    fn flush(&self) {}
}

static LOGGER: BootLogger = BootLogger;

/// Install the logger with colors and timestamps
pub fn init_logger() -> Result<(), log::SetLoggerError> {
    let _ = BOOT_TIME.set(SystemTime::now());
    log::set_logger(&LOGGER)?;
    log::set_max_level(LevelFilter::Info);

    eprintln!("{}┌─────────────────────────────────────────┐{}", colors::BRIGHT_GREEN, colors::RESET);
    eprintln!(
        "{}│   slotboot {:<8}                     │{}",
        colors::BRIGHT_GREEN,
        crate::version::CARGO_VERSION,
        colors::RESET
    );
    eprintln!("{}└─────────────────────────────────────────┘{}", colors::BRIGHT_GREEN, colors::RESET);
    Ok(())
}

/// Parse and set log level from a string; returns true if applied
pub fn set_max_level_from_str(level: &str) -> bool {
    let lf = match level.to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => return false,
    };
    log::set_max_level(lf);
    true
}

/// Current global max level
pub fn current_max_level() -> LevelFilter {
    log::max_level()
}

/// Start keeping a copy of every logged message
pub fn start_capture() {
    if let Ok(mut capture) = CAPTURE.lock() {
        *capture = Some(Vec::new());
    }
}

/// Stop capturing and return what was logged since `start_capture`
pub fn take_capture() -> Vec<String> {
    CAPTURE.lock().ok().and_then(|mut c| c.take()).unwrap_or_default()
}
