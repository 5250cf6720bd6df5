//! Store configuration.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

pub const DATA_DIR_ENV: &str = "ARBOR_DATA_DIR";
pub const BUFFER_POOL_SIZE_ENV: &str = "ARBOR_BUFFER_POOL_SIZE";
pub const LOG_BUFFER_SIZE_ENV: &str = "ARBOR_LOG_BUFFER_SIZE";
pub const LOCK_TIMEOUT_ENV: &str = "ARBOR_LOCK_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding the container files and the log.
    pub data_dir: PathBuf,
    /// Number of page frames in the buffer pool.
    pub buffer_pool_size: usize,
    /// Bytes of log records buffered before they are written out.
    pub log_buffer_size: usize,
    /// How long a lock request waits before failing.
    pub lock_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("arbor-data"),
            buffer_pool_size: 1024, // ~8MB with 8KB pages
            log_buffer_size: 64 * 1024,
            lock_timeout: Duration::from_secs(10),
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by the `ARBOR_*` environment variables. Values
    /// that do not parse are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(size) = parse_env::<usize>(BUFFER_POOL_SIZE_ENV).filter(|&n| n > 0) {
            config.buffer_pool_size = size;
        }
        if let Some(size) = parse_env::<usize>(LOG_BUFFER_SIZE_ENV) {
            config.log_buffer_size = size;
        }
        if let Some(ms) = parse_env::<u64>(LOCK_TIMEOUT_ENV) {
            config.lock_timeout = Duration::from_millis(ms);
        }
        config
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_buffer_pool_size(mut self, frames: usize) -> Self {
        self.buffer_pool_size = frames;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
