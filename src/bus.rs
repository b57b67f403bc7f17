//! Register-level access to the shared I2C bus
//!
//! The mux selector and the accelerometer driver only need two SMBus-shaped
//! primitives, so they talk to a [`RegisterBus`] instead of a concrete device.
//! [`HalBus`] adapts any `embedded-hal` 1.0 I2C implementation, including the
//! Linux `/dev/i2c-N` character device.

use crate::error::{Result, SensorError};
use embedded_hal::i2c::I2c;
use linux_embedded_hal::I2cdev;
use std::path::Path;

/// Minimal register access used by the station
pub trait RegisterBus {
    /// Write raw bytes to a device (mux control byte, or register + value)
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<()>;

    /// Read `buf.len()` bytes starting at `register`.
    ///
    /// Returns the number of bytes actually transferred so callers can detect
    /// short reads.
    fn read_block(&mut self, address: u8, register: u8, buf: &mut [u8]) -> Result<usize>;
}

impl<B: RegisterBus + ?Sized> RegisterBus for &mut B {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<()> {
        (**self).write(address, bytes)
    }

    fn read_block(&mut self, address: u8, register: u8, buf: &mut [u8]) -> Result<usize> {
        (**self).read_block(address, register, buf)
    }
}

/// [`RegisterBus`] over an `embedded-hal` I2C bus
pub struct HalBus<I> {
    i2c: I,
}

impl<I: I2c> HalBus<I> {
    pub fn new(i2c: I) -> Self {
        Self { i2c }
    }
}

impl HalBus<I2cdev> {
    /// Open a Linux I2C character device such as `/dev/i2c-1`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let i2c = I2cdev::new(path)
            .map_err(|e| SensorError::BusOpen(format!("{}: {}", path.display(), e)))?;
        Ok(Self::new(i2c))
    }
}

impl<I: I2c> RegisterBus for HalBus<I> {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<()> {
        self.i2c
            .write(address, bytes)
            .map_err(|e| SensorError::WriteError {
                address,
                reason: format!("{:?}", e),
            })
    }

    fn read_block(&mut self, address: u8, register: u8, buf: &mut [u8]) -> Result<usize> {
        // Repeated START between the register pointer write and the read
        self.i2c
            .write_read(address, &[register], buf)
            .map_err(|e| {
                SensorError::ReadError(format!(
                    "device 0x{:02X} register 0x{:02X}: {:?}",
                    address, register, e
                ))
            })?;
        Ok(buf.len())
    }
}
