//! Zero-offset estimation
//!
//! Each accelerometer is read at rest for a short run after a warm-up, and the
//! median of the successful reads becomes its offset. The median keeps single
//! spikes out of the offset where a mean would not.

use crate::adxl345::Adxl345;
use crate::bus::RegisterBus;
use crate::clock::Clock;
use crate::config::CalibrationConfig;
use crate::error::{Result, SensorError};
use crate::mux::Tca9548a;
use log::{info, warn};

/// Middle element of the sorted values (upper median for even counts)
///
/// Sorts `values` in place. Returns `None` for an empty slice.
pub fn median(values: &mut [i32]) -> Option<i32> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    Some(values[values.len() / 2])
}

/// Outcome of calibrating one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelCalibration {
    pub channel: u8,
    /// Offset subtracted from every reading of this channel
    pub offset: i32,
    /// Successful measurement reads behind the offset
    pub valid_samples: usize,
    /// Estimation failed and the offset was forced to 0
    pub fell_back: bool,
}

/// Offsets for every configured channel, in sampling order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalibrationReport {
    pub channels: Vec<ChannelCalibration>,
}

impl CalibrationReport {
    pub fn offsets(&self) -> Vec<i32> {
        self.channels.iter().map(|c| c.offset).collect()
    }

    /// True when at least one channel runs uncalibrated
    pub fn has_fallback(&self) -> bool {
        self.channels.iter().any(|c| c.fell_back)
    }
}

/// Estimate the offset of the device on `channel`
///
/// # Returns
/// * `Ok((offset, valid_samples))` - Median of the successful measurement reads
/// * `Err(SensorError::CalibrationFailure)` - Not a single read succeeded
/// * `Err(_)` - Channel selection failed
pub fn estimate_offset<B, C>(
    mux: &mut Tca9548a<B>,
    adxl: &Adxl345,
    channel: u8,
    config: &CalibrationConfig,
    clock: &C,
) -> Result<(i32, usize)>
where
    B: RegisterBus,
    C: Clock,
{
    mux.select(channel)?;

    // Let the device settle after mode change and mux switching
    for _ in 0..config.discard {
        let _ = adxl.read_axis(mux.bus());
        clock.sleep(config.interval);
    }

    let mut values = Vec::with_capacity(config.samples);
    for _ in 0..config.samples {
        if let Ok(value) = adxl.read_axis(mux.bus()) {
            values.push(i32::from(value));
        }
        clock.sleep(config.interval);
    }

    let valid = values.len();
    median(&mut values)
        .map(|offset| (offset, valid))
        .ok_or(SensorError::CalibrationFailure { channel })
}

/// Calibrate every channel in order, falling back to 0 on failure
///
/// Acquisition always proceeds; a fallback is logged and flagged in the
/// report.
pub fn calibrate_all<B, C>(
    mux: &mut Tca9548a<B>,
    adxl: &Adxl345,
    channels: &[u8],
    config: &CalibrationConfig,
    clock: &C,
) -> CalibrationReport
where
    B: RegisterBus,
    C: Clock,
{
    let channels = channels
        .iter()
        .map(|&channel| match estimate_offset(mux, adxl, channel, config, clock) {
            Ok((offset, valid_samples)) => {
                info!(
                    "Channel {}: offset {} from {}/{} samples",
                    channel, offset, valid_samples, config.samples
                );
                ChannelCalibration {
                    channel,
                    offset,
                    valid_samples,
                    fell_back: false,
                }
            }
            Err(e) => {
                warn!("Channel {}: {}; running uncalibrated (offset 0)", channel, e);
                ChannelCalibration {
                    channel,
                    offset: 0,
                    valid_samples: 0,
                    fell_back: true,
                }
            }
        })
        .collect();

    CalibrationReport { channels }
}
