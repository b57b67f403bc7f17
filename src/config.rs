//! Station configuration
//!
//! A [`Config`] is built once at start-up (usually from command-line arguments)
//! and handed by reference to every component. Nothing reads global state.

use crate::error::{Result, SensorError};
use std::path::PathBuf;
use std::time::Duration;

/// TCA9548A default I2C address
pub const MUX_ADDRESS: u8 = 0x70;
/// ADXL345 I2C address with SDO/ALT tied low
pub const ADXL345_ADDRESS: u8 = 0x53;
/// Highest downstream channel on the TCA9548A
pub const MAX_MUX_CHANNEL: u8 = 7;

/// Complete station configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub bus: BusConfig,
    pub calibration: CalibrationConfig,
    pub sampling: SamplingConfig,
    pub sender: SenderConfig,
    pub rs485: Rs485Config,
    pub log: LogConfig,
}

impl Config {
    /// Check the values that would otherwise break a loop at run time
    pub fn validate(&self) -> Result<()> {
        if let Some(&channel) = self.bus.channels.iter().find(|&&c| c > MAX_MUX_CHANNEL) {
            return Err(SensorError::InvalidChannel(channel));
        }
        if self.sampling.period.is_zero() {
            return Err(SensorError::InvalidParameter(
                "sampling period must be non-zero".to_string(),
            ));
        }
        if self.calibration.samples == 0 {
            return Err(SensorError::InvalidParameter(
                "calibration needs at least one sample".to_string(),
            ));
        }
        if self.sender.batch_size == 0 {
            return Err(SensorError::InvalidParameter(
                "batch size must be non-zero".to_string(),
            ));
        }
        if self.sender.flush_interval.is_zero() {
            return Err(SensorError::InvalidParameter(
                "flush interval must be non-zero".to_string(),
            ));
        }
        if self.rs485.poll_interval.is_zero() {
            return Err(SensorError::InvalidParameter(
                "RS-485 poll interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// I2C bus and device addressing
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Linux I2C character device
    pub device: PathBuf,
    pub mux_address: u8,
    pub accel_address: u8,
    /// Mux channel of each accelerometer, in Z1, Z2, Z3 order
    pub channels: [u8; 3],
    /// Wait after every mux selection write
    pub settle: Duration,
    /// Wait after opening the bus before the first transaction
    pub power_up_delay: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/i2c-1"),
            mux_address: MUX_ADDRESS,
            accel_address: ADXL345_ADDRESS,
            channels: [1, 2, 4],
            settle: Duration::from_micros(500),
            power_up_delay: Duration::from_millis(200),
        }
    }
}

/// Zero-offset estimation
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// Warm-up reads thrown away after switching channel
    pub discard: usize,
    /// Reads kept for the median
    pub samples: usize,
    pub interval: Duration,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            discard: 20,
            samples: 200,
            interval: Duration::from_millis(1),
        }
    }
}

/// Fixed-period acquisition loop
#[derive(Debug, Clone)]
pub struct SamplingConfig {
    pub period: Duration,
    /// Sleep between clock polls while waiting for the next deadline
    pub idle_yield: Duration,
    /// Rate declared in every accelerometer batch
    pub declared_rate_hz: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_micros(2000),
            idle_yield: Duration::from_micros(200),
            declared_rate_hz: 500,
        }
    }
}

/// Ingestion endpoint and batching policy
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub server_url: String,
    pub path: String,
    pub api_key_header: String,
    pub api_key: String,
    pub device_id: String,
    pub request_timeout: Duration,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub idle_sleep: Duration,
}

impl SenderConfig {
    /// Full ingestion URL, tolerating a trailing slash on the base
    pub fn ingest_url(&self) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), self.path)
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            path: "/ingest".to_string(),
            api_key_header: "X-API-Key".to_string(),
            api_key: String::new(),
            device_id: "raspi-01".to_string(),
            request_timeout: Duration::from_secs(2),
            batch_size: 50,
            flush_interval: Duration::from_millis(150),
            idle_sleep: Duration::from_millis(1),
        }
    }
}

/// RS-485 environmental sensors (Modbus RTU)
#[derive(Debug, Clone)]
pub struct Rs485Config {
    /// Run the environmental poller alongside acquisition
    pub enabled: bool,
    pub port: String,
    pub baud_rate: u32,
    pub timeout: Duration,
    pub temp_hum_id: u8,
    pub wind_speed_id: u8,
    pub wind_dir_id: u8,
    pub poll_interval: Duration,
    /// Pause between consecutive register requests
    pub request_gap: Duration,
}

impl Default for Rs485Config {
    fn default() -> Self {
        Self {
            enabled: true,
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            timeout: Duration::from_secs(1),
            temp_hum_id: 1,
            wind_speed_id: 3,
            wind_dir_id: 4,
            poll_interval: Duration::from_millis(1000),
            request_gap: Duration::from_millis(50),
        }
    }
}

/// Local-time stamp used in log file names
pub const LOG_STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Durable CSV logs
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub directory: PathBuf,
    pub accel_prefix: String,
    pub env_prefix: String,
    /// Accelerometer rows buffered before a flush
    pub flush_every: usize,
}

impl LogConfig {
    /// Timestamped path for a new accelerometer log
    pub fn accel_path(&self, stamp: &str) -> PathBuf {
        self.directory.join(format!("{}{}.csv", self.accel_prefix, stamp))
    }

    /// Timestamped path for a new environmental log
    pub fn env_path(&self, stamp: &str) -> PathBuf {
        self.directory.join(format!("{}{}.csv", self.env_prefix, stamp))
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            accel_prefix: "adxl345_log_".to_string(),
            env_prefix: "rs485_log_".to_string(),
            flush_every: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.bus.channels, [1, 2, 4]);
        assert_eq!(config.sampling.period, Duration::from_micros(2000));
        assert_eq!(config.sender.batch_size, 50);
    }

    #[test]
    fn test_validate_rejects_channel_out_of_range() {
        let mut config = Config::default();
        config.bus.channels = [1, 9, 2];
        assert!(matches!(config.validate(), Err(SensorError::InvalidChannel(9))));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = Config::default();
        config.sender.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(SensorError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_ingest_url_trims_trailing_slash() {
        let sender = SenderConfig {
            server_url: "http://10.0.0.5:8080/".to_string(),
            ..SenderConfig::default()
        };
        assert_eq!(sender.ingest_url(), "http://10.0.0.5:8080/ingest");
    }

    #[test]
    fn test_log_paths() {
        let log = LogConfig {
            directory: PathBuf::from("/tmp/run"),
            ..LogConfig::default()
        };
        assert_eq!(
            log.accel_path("2024-01-01_12-00-00"),
            PathBuf::from("/tmp/run/adxl345_log_2024-01-01_12-00-00.csv")
        );
        assert_eq!(
            log.env_path("2024-01-01_12-00-00"),
            PathBuf::from("/tmp/run/rs485_log_2024-01-01_12-00-00.csv")
        );
    }
}
