//! ADXL345 trio station
//!
//! Samples the three accelerometers at ~500 Hz, logs to CSV and streams to the
//! ingestion endpoint until Ctrl+C or the optional duration elapses.
//!
//! Usage:
//!   station --server-url http://192.168.1.20:8080 --api-key secret --duration 60

use adxl345_mux_interface::{Config, SensorError, Station};
use clap::Parser;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "station")]
#[command(about = "Acquire ADXL345 trio data and stream it to the ingestion server", long_about = None)]
struct Args {
    /// I2C bus device
    #[arg(long, default_value = "/dev/i2c-1")]
    i2c_device: PathBuf,

    /// Ingestion server base URL
    #[arg(long, env = "STATION_SERVER_URL", default_value = "http://127.0.0.1:8080")]
    server_url: String,

    /// Shared secret sent in the X-API-Key header
    #[arg(long, env = "STATION_API_KEY", default_value = "")]
    api_key: String,

    /// Device identifier reported with every request
    #[arg(long, env = "STATION_DEVICE_ID", default_value = "raspi-01")]
    device_id: String,

    /// Directory for the CSV logs
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// RS-485 serial port
    #[arg(long, default_value = "/dev/ttyUSB0")]
    rs485_port: String,

    /// Do not poll the RS-485 environmental sensors
    #[arg(long)]
    no_rs485: bool,

    /// Samples per accelerometer batch
    #[arg(long, default_value = "50")]
    batch_size: usize,

    /// Flush a partial batch after this many milliseconds
    #[arg(long, default_value = "150")]
    flush_interval_ms: u64,

    /// Duration in seconds (optional, runs until Ctrl+C if omitted)
    #[arg(short, long)]
    duration: Option<u64>,
}

impl Args {
    fn to_config(&self) -> Config {
        let mut config = Config::default();
        config.bus.device = self.i2c_device.clone();
        config.sender.server_url = self.server_url.clone();
        config.sender.api_key = self.api_key.clone();
        config.sender.device_id = self.device_id.clone();
        config.sender.batch_size = self.batch_size;
        config.sender.flush_interval = Duration::from_millis(self.flush_interval_ms);
        config.rs485.port = self.rs485_port.clone();
        config.rs485.enabled = !self.no_rs485;
        config.log.directory = self.output_dir.clone();
        config
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = args.to_config();

    println!("ADXL345 Trio Station");
    println!("====================");
    println!("I2C bus: {}", config.bus.device.display());
    println!("Channels: {:?}", config.bus.channels);
    println!("Period: {} us", config.sampling.period.as_micros());
    println!("Server: {}", config.sender.ingest_url());
    println!("Device ID: {}", config.sender.device_id);
    if config.rs485.enabled {
        println!("RS-485: {} @ {} baud", config.rs485.port, config.rs485.baud_rate);
    } else {
        println!("RS-485: disabled");
    }
    if let Some(duration) = args.duration {
        println!("Duration: {} seconds", duration);
    } else {
        println!("Duration: continuous (Ctrl+C to stop)");
    }
    println!();

    let mut station = match Station::start(&config) {
        Ok(station) => station,
        Err(SensorError::InvalidChannel(channel)) => {
            eprintln!("Error: mux channel {} is out of range (0-7)", channel);
            return Err(Box::new(SensorError::InvalidChannel(channel)));
        }
        Err(SensorError::Io(e)) => {
            eprintln!("Error: cannot create log files in {}: {}", config.log.directory.display(), e);
            return Err(Box::new(SensorError::Io(e)));
        }
        Err(e) => {
            eprintln!("Error starting station: {}", e);
            return Err(Box::new(e));
        }
    };
    if let Some(path) = &station.files().accel_log {
        println!("Accelerometer log: {}", path.display());
    }
    if let Some(path) = &station.files().env_log {
        println!("Environmental log: {}", path.display());
    }

    // Setup Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, stopping acquisition...");
        r.store(false, Ordering::SeqCst);
    })?;

    let start = Instant::now();
    let end_time = args.duration.map(|d| start + Duration::from_secs(d));

    println!("Calibrating (keep the sensors still)...");
    while running.load(Ordering::SeqCst) && station.calibration().is_none() && station.is_sampling() {
        thread::sleep(Duration::from_millis(50));
    }
    if let Some(report) = station.calibration() {
        for channel in &report.channels {
            let note = if channel.fell_back { "  (FAILED, uncalibrated)" } else { "" };
            println!("  Channel {}: offset {:6}{}", channel.channel, channel.offset, note);
        }
        println!();
    }

    println!("Sampling... Press Ctrl+C to stop\n");
    let calibrated_at = Instant::now();
    while running.load(Ordering::SeqCst) {
        if end_time.map_or(false, |end| Instant::now() >= end) {
            break;
        }
        if !station.is_sampling() {
            eprintln!("\nSampling stopped unexpectedly.");
            eprintln!("Please check:");
            eprintln!("  1. I2C is enabled and {} exists", config.bus.device.display());
            eprintln!("  2. The TCA9548A answers at 0x{:02X}", config.bus.mux_address);
            eprintln!("  3. You have permission to open the bus (i2c group)");
            break;
        }

        let published = station.samples_published();
        let elapsed = calibrated_at.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 { published as f64 / elapsed } else { 0.0 };
        match station.latest_snapshot() {
            Some(t) => print!(
                "\rSamples: {:9} | Rate: {:6.1} Hz | Z1 {:6} Z2 {:6} Z3 {:6}   ",
                published, rate, t.z1, t.z2, t.z3
            ),
            None => print!("\rSamples: {:9} | waiting for first sample...", published),
        }
        io::stdout().flush()?;
        thread::sleep(Duration::from_millis(500));
    }

    let published = station.samples_published();
    let stats = station.stop();
    let elapsed = start.elapsed().as_secs_f64();

    println!("\n\nAcquisition complete!");
    println!("Total samples: {}", published);
    println!("Elapsed time: {:.2} seconds", elapsed);
    if let Some(stats) = stats {
        println!(
            "Requests: {} ({} failed), samples delivered: {}",
            stats.requests, stats.failures, stats.samples_sent
        );
    }
    if let Some(path) = &station.files().accel_log {
        println!("File: {}", path.display());
    }

    Ok(())
}
