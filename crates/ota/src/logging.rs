#[cfg(debug_assertions)]
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use simplelog::{CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, WriteLogger};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use ota_platform::ConfigStore;

pub const DEFAULT_MAX_LOG_SIZE: u64 = 256 * 1024;

const SECTION_LOG: &str = "SYS.LOG";
const KEY_DEBUG: &str = "DEBUG";

/// Append-only device log. Tools on the device may delete the file while the
/// engine runs; the next record recreates it.
struct DeviceLog {
    path: PathBuf,
    file: File,
}

impl DeviceLog {
    fn open(path: PathBuf) -> io::Result<Self> {
        let file = open_append(&path)?;
        Ok(Self { path, file })
    }

    fn current(&mut self) -> io::Result<&mut File> {
        if !self.path.exists() {
            self.file = open_append(&self.path)?;
        }
        Ok(&mut self.file)
    }
}

impl Write for DeviceLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.current()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

pub(crate) fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Drop the older half of `path` once it grows past `max_size`, keeping whole
/// lines.
pub(crate) fn trim_to_recent_half(path: &Path, max_size: u64) {
    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    if metadata.len() <= max_size {
        return;
    }
    let Ok(contents) = std::fs::read(path) else {
        return;
    };

    let midpoint = contents.len() / 2;
    let start = contents[midpoint..]
        .iter()
        .position(|&byte| byte == b'\n')
        .map_or(contents.len(), |newline| midpoint + newline + 1);
    let _ = ota_platform::write_atomic(path, &contents[start..]);
}

/// Install the global logger at info level. Failing to open the log file
/// still leaves terminal logging in debug builds.
pub fn init_logging(log_path: &Path, max_log_size: u64) {
    trim_to_recent_half(log_path, max_log_size);

    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .add_filter_allow_str("ota")
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();

    #[cfg(debug_assertions)]
    loggers.push(TermLogger::new(
        LevelFilter::Debug,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));

    match DeviceLog::open(log_path.to_path_buf()) {
        Ok(file) => loggers.push(WriteLogger::new(LevelFilter::Debug, config, file)),
        Err(error) => eprintln!("ota: cannot open {}: {error}", log_path.display()),
    }

    if !loggers.is_empty() {
        let _ = CombinedLogger::init(loggers);
    }
    set_debug_logging(false);
}

/// Switch to debug level when the device config asks for it.
pub fn apply_config(config: &dyn ConfigStore) {
    let debug = config.get_bool(SECTION_LOG, KEY_DEBUG).unwrap_or(false);
    set_debug_logging(debug);
    if debug {
        log::debug!("Debug logging enabled");
    }
}

pub fn set_debug_logging(enabled: bool) {
    log::set_max_level(if enabled {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
}
