//! ADXL345 trio acquisition station
//!
//! This library samples three ADXL345 accelerometers behind a TCA9548A I2C
//! multiplexer at a fixed ~500 Hz period, subtracts a per-device zero offset
//! estimated at start-up, logs every sample to CSV and streams batches to an
//! HTTP ingestion endpoint without letting the network touch the sampling
//! cadence. RS-485 environmental sensors (Modbus RTU) are polled once per
//! second and forwarded alongside.
//!
//! # Quick Start
//!
//! ## Running Station
//! ```no_run
//! use adxl345_mux_interface::{Config, Station};
//! use std::time::Duration;
//!
//! let mut config = Config::default();
//! config.sender.server_url = "http://192.168.1.20:8080".to_string();
//! config.sender.api_key = "secret".to_string();
//!
//! let mut station = Station::start(&config)?;
//! std::thread::sleep(Duration::from_secs(5));
//!
//! if let Some(triple) = station.latest_snapshot() {
//!     println!("Z1={} Z2={} Z3={}", triple.z1, triple.z2, triple.z3);
//! }
//! station.stop();
//! # Ok::<(), adxl345_mux_interface::SensorError>(())
//! ```
//!
//! ## Single Device Access
//! ```no_run
//! use adxl345_mux_interface::{Adxl345, HalBus, Tca9548a};
//! use adxl345_mux_interface::config::{ADXL345_ADDRESS, MUX_ADDRESS};
//! use std::time::Duration;
//!
//! let bus = HalBus::open("/dev/i2c-1")?;
//! let mut mux = Tca9548a::new(bus, MUX_ADDRESS, Duration::from_micros(500));
//! let adxl = Adxl345::new(ADXL345_ADDRESS);
//!
//! mux.select(1)?;
//! adxl.initialize(mux.bus());
//! println!("Z raw: {}", adxl.read_axis(mux.bus())?);
//! # Ok::<(), adxl345_mux_interface::SensorError>(())
//! ```

pub mod adxl345;
pub mod bus;
pub mod calibration;
pub mod clock;
pub mod config;
pub mod error;
pub mod mux;
pub mod rs485;
pub mod sample;
pub mod sample_log;
pub mod sampling;
pub mod sender;
pub mod station;

// Re-export public API
pub use adxl345::Adxl345;
pub use bus::{HalBus, RegisterBus};
pub use calibration::{CalibrationReport, ChannelCalibration};
pub use config::Config;
pub use error::{Result, SensorError};
pub use mux::Tca9548a;
pub use sample::{deg_to_cardinal, AxisTriple, EnvironmentalReading, LatestSnapshot};
pub use sample_log::{CsvSampleLog, EnvironmentalLog, SampleLog};
pub use sender::{HttpSink, IngestRequest, IngestSink, Payload, SenderStats};
pub use station::Station;
