use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::assembler::{AssemblerConfig, DEFAULT_CAPACITY};
use crate::device::{default_signatures, DeviceSignature, LineParams, Parity, Prober};

const DEFAULT_BAUD_RATE: u32 = 115_200;
const DEFAULT_DATA_BITS: u8 = 8;
const DEFAULT_STOP_BITS: u8 = 1;
const DEFAULT_READ_TIMEOUT_MS: u64 = 100;
const DEFAULT_IDLE_SLEEP_MS: u64 = 5;
const DEFAULT_ERROR_BACKOFF_MS: u64 = 500;
const DEFAULT_JOIN_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_DIAGNOSTIC_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_LINE_SETTLE_MS: u64 = 100;
const DEFAULT_START_DELAY_MS: u64 = 1_000;
const DEFAULT_READ_CHUNK_BYTES: usize = 2_048;

const ENV_CONFIG: &str = "SERIAL_MJPEG_CONFIG";
const ENV_DEVICE: &str = "SERIAL_MJPEG_DEVICE";
const ENV_BAUD: &str = "SERIAL_MJPEG_BAUD";
const ENV_DIAGNOSTIC_MS: &str = "SERIAL_MJPEG_DIAGNOSTIC_MS";
const ENV_BUFFER_BYTES: &str = "SERIAL_MJPEG_BUFFER_BYTES";

#[derive(Debug, Deserialize, Default)]
struct LinkConfigFile {
    serial: Option<SerialConfigFile>,
    buffer: Option<BufferConfigFile>,
    timing: Option<TimingConfigFile>,
    devices: Option<DevicesConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SerialConfigFile {
    device: Option<String>,
    baud_rate: Option<u32>,
    data_bits: Option<u8>,
    stop_bits: Option<u8>,
    parity: Option<Parity>,
}

#[derive(Debug, Deserialize, Default)]
struct BufferConfigFile {
    capacity_bytes: Option<usize>,
    overflow_threshold_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct TimingConfigFile {
    read_timeout_ms: Option<u64>,
    idle_sleep_ms: Option<u64>,
    error_backoff_ms: Option<u64>,
    join_timeout_ms: Option<u64>,
    diagnostic_timeout_ms: Option<u64>,
    line_settle_ms: Option<u64>,
    start_delay_ms: Option<u64>,
    read_chunk_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DevicesConfigFile {
    signatures: Option<Vec<DeviceSignature>>,
    allow_generic_usb: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub serial: SerialSettings,
    pub buffer: BufferSettings,
    pub timing: TimingSettings,
    pub devices: DeviceSettings,
}

#[derive(Debug, Clone)]
pub struct SerialSettings {
    /// Explicit port path, or a `stub://` URI. `None` means scan.
    pub device: Option<String>,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub capacity_bytes: usize,
    /// Defaults to half the capacity when unset.
    pub overflow_threshold_bytes: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct TimingSettings {
    pub read_timeout: Duration,
    pub idle_sleep: Duration,
    pub error_backoff: Duration,
    pub join_timeout: Duration,
    pub diagnostic_timeout: Duration,
    pub line_settle: Duration,
    pub start_delay: Duration,
    pub read_chunk_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub signatures: Vec<DeviceSignature>,
    pub allow_generic_usb: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        // Every default is valid, so this cannot fail.
        Self::from_file(LinkConfigFile::default())
    }
}

impl LinkConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(ENV_CONFIG).ok();
        Self::load_with(config_path.as_deref().map(Path::new))
    }

    /// Like [`LinkConfig::load`] but with an explicit file in place of
    /// `SERIAL_MJPEG_CONFIG`. Environment overrides still apply.
    pub fn load_with(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: LinkConfigFile) -> Self {
        let serial = file.serial.unwrap_or_default();
        let buffer = file.buffer.unwrap_or_default();
        let timing = file.timing.unwrap_or_default();
        let devices = file.devices.unwrap_or_default();
        let ms = |value: Option<u64>, default: u64| Duration::from_millis(value.unwrap_or(default));

        Self {
            serial: SerialSettings {
                device: serial.device.filter(|d| !d.trim().is_empty()),
                baud_rate: serial.baud_rate.unwrap_or(DEFAULT_BAUD_RATE),
                data_bits: serial.data_bits.unwrap_or(DEFAULT_DATA_BITS),
                stop_bits: serial.stop_bits.unwrap_or(DEFAULT_STOP_BITS),
                parity: serial.parity.unwrap_or_default(),
            },
            buffer: BufferSettings {
                capacity_bytes: buffer.capacity_bytes.unwrap_or(DEFAULT_CAPACITY),
                overflow_threshold_bytes: buffer.overflow_threshold_bytes,
            },
            timing: TimingSettings {
                read_timeout: ms(timing.read_timeout_ms, DEFAULT_READ_TIMEOUT_MS),
                idle_sleep: ms(timing.idle_sleep_ms, DEFAULT_IDLE_SLEEP_MS),
                error_backoff: ms(timing.error_backoff_ms, DEFAULT_ERROR_BACKOFF_MS),
                join_timeout: ms(timing.join_timeout_ms, DEFAULT_JOIN_TIMEOUT_MS),
                diagnostic_timeout: ms(timing.diagnostic_timeout_ms, DEFAULT_DIAGNOSTIC_TIMEOUT_MS),
                line_settle: ms(timing.line_settle_ms, DEFAULT_LINE_SETTLE_MS),
                start_delay: ms(timing.start_delay_ms, DEFAULT_START_DELAY_MS),
                read_chunk_bytes: timing.read_chunk_bytes.unwrap_or(DEFAULT_READ_CHUNK_BYTES),
            },
            devices: DeviceSettings {
                signatures: devices.signatures.unwrap_or_else(default_signatures),
                allow_generic_usb: devices.allow_generic_usb.unwrap_or(true),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var(ENV_DEVICE) {
            if !device.trim().is_empty() {
                self.serial.device = Some(device.trim().to_string());
            }
        }
        if let Ok(baud) = std::env::var(ENV_BAUD) {
            self.serial.baud_rate = baud
                .trim()
                .parse()
                .map_err(|_| anyhow!("{} must be an integer baud rate", ENV_BAUD))?;
        }
        if let Ok(ms) = std::env::var(ENV_DIAGNOSTIC_MS) {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| anyhow!("{} must be an integer number of milliseconds", ENV_DIAGNOSTIC_MS))?;
            self.timing.diagnostic_timeout = Duration::from_millis(ms);
        }
        if let Ok(bytes) = std::env::var(ENV_BUFFER_BYTES) {
            self.buffer.capacity_bytes = bytes
                .trim()
                .parse()
                .map_err(|_| anyhow!("{} must be an integer number of bytes", ENV_BUFFER_BYTES))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let capacity = self.buffer.capacity_bytes;
        if capacity < 4 {
            return Err(anyhow!("buffer capacity must be at least 4 bytes (got {})", capacity));
        }
        let threshold = self.buffer.overflow_threshold();
        if threshold < 2 || threshold >= capacity {
            return Err(anyhow!(
                "overflow threshold must be in [2, {}) (got {})",
                capacity,
                threshold
            ));
        }
        if self.serial.baud_rate == 0 {
            return Err(anyhow!("baud rate must be greater than zero"));
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(anyhow!("data bits must be 5..=8 (got {})", self.serial.data_bits));
        }
        if !matches!(self.serial.stop_bits, 1 | 2) {
            return Err(anyhow!("stop bits must be 1 or 2 (got {})", self.serial.stop_bits));
        }
        if self.timing.read_timeout.is_zero() {
            return Err(anyhow!("read timeout must be greater than zero"));
        }
        if self.timing.read_chunk_bytes == 0 {
            return Err(anyhow!("read chunk size must be greater than zero"));
        }
        Ok(())
    }

    pub fn line_params(&self) -> LineParams {
        LineParams {
            baud_rate: self.serial.baud_rate,
            data_bits: self.serial.data_bits,
            stop_bits: self.serial.stop_bits,
            parity: self.serial.parity,
        }
    }

    pub fn assembler_config(&self) -> AssemblerConfig {
        AssemblerConfig {
            capacity: self.buffer.capacity_bytes,
            overflow_threshold: self.buffer.overflow_threshold(),
        }
    }

    pub fn prober(&self) -> Prober {
        Prober::new(self.devices.signatures.clone(), self.devices.allow_generic_usb)
            .with_configured(self.serial.device.clone())
    }
}

impl BufferSettings {
    pub fn overflow_threshold(&self) -> usize {
        self.overflow_threshold_bytes
            .unwrap_or(self.capacity_bytes / 2)
    }
}

fn read_config_file(path: &Path) -> Result<LinkConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
