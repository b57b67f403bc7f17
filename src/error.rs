//! Error types for the accelerometer station

use thiserror::Error;

/// Error type for bus, acquisition, logging and delivery operations
#[derive(Error, Debug)]
pub enum SensorError {
    /// Mux channel outside 0..=7
    #[error("Invalid mux channel: {0} (expected 0-7)")]
    InvalidChannel(u8),

    /// I2C bus device could not be opened
    #[error("Failed to open I2C bus: {0}")]
    BusOpen(String),

    /// Write rejected by the bus (mux selection or register write)
    #[error("Write to device 0x{address:02X} failed: {reason}")]
    WriteError { address: u8, reason: String },

    /// Register read rejected by the bus
    #[error("Read error: {0}")]
    ReadError(String),

    /// Block read returned the wrong number of bytes
    #[error("Data transfer error: expected {expected} bytes, transferred {actual}")]
    TransferError { expected: usize, actual: usize },

    /// No valid sample was collected while estimating an offset
    #[error("Calibration failed on mux channel {channel}: no valid samples")]
    CalibrationFailure { channel: u8 },

    /// Ingestion request could not be delivered
    #[error("Delivery failed: {0}")]
    DeliveryFailure(String),

    /// HTTP client could not be built
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Malformed or exceptional Modbus response
    #[error("Modbus error: {0}")]
    Modbus(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<serialport::Error> for SensorError {
    fn from(err: serialport::Error) -> Self {
        SensorError::Serial(err.to_string())
    }
}

/// Result type for station operations
pub type Result<T> = std::result::Result<T, SensorError>;
