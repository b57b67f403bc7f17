//! ADXL345 trio calibration check
//!
//! Runs bring-up and offset estimation only, then prints the per-channel
//! offsets. A channel that falls back to 0 usually means a wiring fault.
//!
//! Usage:
//!   calibrate --i2c-device /dev/i2c-1 --samples 400

use adxl345_mux_interface::clock::MonotonicClock;
use adxl345_mux_interface::sampling::Sampler;
use adxl345_mux_interface::{Adxl345, Config, HalBus, SensorError, Tca9548a};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "calibrate")]
#[command(about = "Estimate ADXL345 zero offsets without starting acquisition", long_about = None)]
struct Args {
    /// I2C bus device
    #[arg(long, default_value = "/dev/i2c-1")]
    i2c_device: PathBuf,

    /// Mux channels of Z1, Z2 and Z3
    #[arg(long, num_args = 3, default_values_t = [1u8, 2, 4])]
    channels: Vec<u8>,

    /// Warm-up reads discarded per channel
    #[arg(long, default_value = "20")]
    discard: usize,

    /// Reads kept for the median per channel
    #[arg(short, long, default_value = "200")]
    samples: usize,

    /// Interval between reads in milliseconds
    #[arg(long, default_value = "1")]
    interval_ms: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut config = Config::default();
    config.bus.device = args.i2c_device.clone();
    config.bus.channels = args.channels.as_slice().try_into().map_err(|_| {
        SensorError::InvalidParameter(format!("expected 3 channels, got {}", args.channels.len()))
    })?;
    config.calibration.discard = args.discard;
    config.calibration.samples = args.samples;
    config.calibration.interval = Duration::from_millis(args.interval_ms);
    config.validate()?;

    println!("ADXL345 Calibration");
    println!("===================");
    println!("I2C bus: {}", config.bus.device.display());
    println!("Channels: {:?}", config.bus.channels);
    println!(
        "Reads per channel: {} discarded + {} kept, {} ms apart",
        args.discard, args.samples, args.interval_ms
    );
    println!();

    let bus = match HalBus::open(&config.bus.device) {
        Ok(bus) => bus,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Please check:");
            eprintln!("  1. I2C is enabled on this board");
            eprintln!("  2. The device path is correct");
            eprintln!("  3. You have permission to open it (i2c group)");
            return Err(Box::new(e));
        }
    };

    println!("Calibrating (keep the sensors still)...");
    let mux = Tca9548a::from_config(bus, &config.bus);
    let adxl = Adxl345::new(config.bus.accel_address);
    let mut sampler = Sampler::new(mux, adxl, config.bus.channels, &config.sampling);
    let clock = MonotonicClock::new();
    let report = sampler.bring_up(&config.bus, &config.calibration, &clock);

    println!("\nCalibration complete! ({:.2} s)", clock.elapsed_secs());
    for (axis, channel) in report.channels.iter().enumerate() {
        let status = if channel.fell_back {
            "FAILED, no valid reads".to_string()
        } else {
            format!("{}/{} valid reads", channel.valid_samples, args.samples)
        };
        println!(
            "  Z{} (channel {}): offset {:6}  [{}]",
            axis + 1,
            channel.channel,
            channel.offset,
            status
        );
    }

    if report.has_fallback() {
        eprintln!("\nWarning: at least one device did not answer.");
        eprintln!("Check the mux wiring and that each ADXL345 sits at 0x{:02X}", config.bus.accel_address);
    }

    Ok(())
}
