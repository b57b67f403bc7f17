//! TCA9548A I2C multiplexer
//!
//! All three accelerometers answer on the same address, so every device
//! access is preceded by a channel selection. The mux owns the bus: a caller
//! holding `&mut Tca9548a` cannot have another select interleaved between its
//! own select and the following read or write.

use crate::bus::RegisterBus;
use crate::config::{BusConfig, MAX_MUX_CHANNEL};
use crate::error::{Result, SensorError};
use std::thread;
use std::time::Duration;

/// Bus channel selector in front of the shared I2C bus
pub struct Tca9548a<B> {
    bus: B,
    address: u8,
    settle: Duration,
    selected: Option<u8>,
}

impl<B: RegisterBus> Tca9548a<B> {
    /// Wrap a bus with a mux at `address`
    ///
    /// # Arguments
    /// * `settle` - Delay imposed after every selection write
    pub fn new(bus: B, address: u8, settle: Duration) -> Self {
        Self {
            bus,
            address,
            settle,
            selected: None,
        }
    }

    pub fn from_config(bus: B, config: &BusConfig) -> Self {
        Self::new(bus, config.mux_address, config.settle)
    }

    /// Route the bus to one downstream segment
    ///
    /// # Returns
    /// * `Ok(())` - Channel selected and settled
    /// * `Err(SensorError::InvalidChannel)` - Channel outside 0-7, nothing written
    /// * `Err(SensorError::WriteError)` - Mux did not acknowledge
    pub fn select(&mut self, channel: u8) -> Result<()> {
        if channel > MAX_MUX_CHANNEL {
            return Err(SensorError::InvalidChannel(channel));
        }

        if let Err(e) = self.bus.write(self.address, &[1 << channel]) {
            self.selected = None;
            return Err(e);
        }

        // Switching transient on the downstream segment
        thread::sleep(self.settle);
        self.selected = Some(channel);
        Ok(())
    }

    /// Channel of the last successful selection
    pub fn selected(&self) -> Option<u8> {
        self.selected
    }

    /// Bus routed to the currently selected channel
    pub fn bus(&mut self) -> &mut B {
        &mut self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake::FakeBus;
    use crate::config::MUX_ADDRESS;
    use std::time::Instant;

    #[test]
    fn test_select_writes_single_bit_mask() {
        for channel in 0..=7u8 {
            let mut mux = Tca9548a::new(FakeBus::new(), MUX_ADDRESS, Duration::ZERO);
            mux.select(channel).unwrap();
            assert_eq!(mux.bus().mux_writes(), vec![1u8 << channel]);
            assert_eq!(mux.selected(), Some(channel));
        }
    }

    #[test]
    fn test_select_out_of_range_writes_nothing() {
        let mut mux = Tca9548a::new(FakeBus::new(), MUX_ADDRESS, Duration::ZERO);
        for channel in [8u8, 9, 200, 255] {
            assert!(matches!(
                mux.select(channel),
                Err(SensorError::InvalidChannel(c)) if c == channel
            ));
        }
        assert!(mux.bus().writes.is_empty());
        assert_eq!(mux.selected(), None);
    }

    #[test]
    fn test_select_settles_before_returning() {
        let settle = Duration::from_millis(5);
        let mut mux = Tca9548a::new(FakeBus::new(), MUX_ADDRESS, settle);
        let start = Instant::now();
        mux.select(2).unwrap();
        assert!(start.elapsed() >= settle);
    }

    #[test]
    fn test_failed_select_clears_selection() {
        let mut mux = Tca9548a::new(FakeBus::new(), MUX_ADDRESS, Duration::ZERO);
        mux.select(1).unwrap();
        mux.bus().fail_writes = true;
        assert!(matches!(mux.select(2), Err(SensorError::WriteError { .. })));
        assert_eq!(mux.selected(), None);
    }
}
