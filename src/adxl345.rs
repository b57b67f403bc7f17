//! ADXL345 accelerometer driver (Z axis only)
//!
//! The driver keeps no state besides the device address. It always talks to
//! whichever device the mux currently routes to.

use crate::bus::RegisterBus;
use crate::error::{Result, SensorError};
use log::warn;

// ADXL345 register addresses
const REG_BW_RATE: u8 = 0x2C;
const REG_POWER_CTL: u8 = 0x2D;
const REG_DATA_FORMAT: u8 = 0x31;
const REG_DATAZ0: u8 = 0x36;

// Register values
const BW_RATE_400HZ: u8 = 0x0C;
const DATA_FORMAT_FULL_RES_8G: u8 = 0x0A; // FULL_RES | range ±8g
const POWER_CTL_MEASURE: u8 = 0x08;

/// Bytes in one axis sample (DATAZ0, DATAZ1)
pub const AXIS_BYTES: usize = 2;

/// Bring-up sequence: output data rate, range/resolution, measure mode
const INIT_SEQUENCE: [(u8, u8); 3] = [
    (REG_BW_RATE, BW_RATE_400HZ),
    (REG_DATA_FORMAT, DATA_FORMAT_FULL_RES_8G),
    (REG_POWER_CTL, POWER_CTL_MEASURE),
];

/// Decode a little-endian two's-complement axis register pair
pub fn decode_axis(bytes: [u8; AXIS_BYTES]) -> i16 {
    i16::from_le_bytes(bytes)
}

/// ADXL345 on the currently selected mux channel
#[derive(Debug, Clone, Copy)]
pub struct Adxl345 {
    address: u8,
}

impl Adxl345 {
    pub fn new(address: u8) -> Self {
        Self { address }
    }

    /// Configure the selected device for measurement
    ///
    /// Every register is attempted even if an earlier write failed; a device
    /// that misses a write still samples, just possibly at the wrong rate or
    /// range.
    ///
    /// # Returns
    /// The failed writes as `(register, error)` pairs, empty on full success.
    pub fn initialize<B: RegisterBus>(&self, bus: &mut B) -> Vec<(u8, SensorError)> {
        let mut failures = Vec::new();
        for (register, value) in INIT_SEQUENCE {
            if let Err(e) = bus.write(self.address, &[register, value]) {
                warn!(
                    "ADXL345 0x{:02X}: write 0x{:02X}=0x{:02X} failed: {}",
                    self.address, register, value, e
                );
                failures.push((register, e));
            }
        }
        failures
    }

    /// Read the signed Z-axis value
    ///
    /// # Returns
    /// * `Ok(i16)` - Raw axis value
    /// * `Err(SensorError::ReadError)` - Bus error
    /// * `Err(SensorError::TransferError)` - Short read
    pub fn read_axis<B: RegisterBus>(&self, bus: &mut B) -> Result<i16> {
        let mut buf = [0u8; AXIS_BYTES];
        let transferred = bus.read_block(self.address, REG_DATAZ0, &mut buf)?;
        if transferred != AXIS_BYTES {
            return Err(SensorError::TransferError {
                expected: AXIS_BYTES,
                actual: transferred,
            });
        }
        Ok(decode_axis(buf))
    }
}
