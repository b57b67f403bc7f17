//! Running station: sampling, delivery and the optional RS-485 poller
//!
//! This is the whole surface a dashboard or CLI needs: start, stop, read the
//! latest triple and push environmental readings onward.

use crate::bus::{HalBus, RegisterBus};
use crate::calibration::CalibrationReport;
use crate::config::{Config, LOG_STAMP_FORMAT};
use crate::error::Result;
use crate::rs485::{EnvironmentalPoller, ModbusTransport, PollerHandle, SerialTransport};
use crate::sample::{AxisTriple, EnvironmentalReading, LatestSnapshot};
use crate::sample_log::{CsvSampleLog, EnvironmentalLog, SampleLog};
use crate::sampling::SamplingHandle;
use crate::sender::{BatchingSender, HttpSink, IngestSink, SenderHandle, SenderStats};
use chrono::Local;
use log::{info, warn};
use std::io::Write;
use std::path::PathBuf;

/// Files created for one acquisition run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFiles {
    pub accel_log: Option<PathBuf>,
    pub env_log: Option<PathBuf>,
}

/// Acquisition station
pub struct Station {
    poller: Option<PollerHandle>,
    sampling: SamplingHandle,
    sender: SenderHandle,
    snapshot: LatestSnapshot,
    files: RunFiles,
}

impl Station {
    /// Start on real hardware
    ///
    /// Creates fresh timestamped logs, opens the I2C bus on the sampling
    /// thread and, if enabled, polls the RS-485 sensors.
    ///
    /// # Returns
    /// * `Ok(Station)` - All threads started
    /// * `Err(SensorError)` - Invalid configuration, log creation failure or
    ///   HTTP client initialisation failure
    pub fn start(config: &Config) -> Result<Self> {
        config.validate()?;
        let stamp = Local::now().format(LOG_STAMP_FORMAT).to_string();

        let sink = HttpSink::new(&config.sender)?;
        info!("Ingestion endpoint: {}", sink.url());
        let accel_path = config.log.accel_path(&stamp);
        let log = CsvSampleLog::create(&accel_path, config.log.flush_every)?;

        let device = config.bus.device.clone();
        let mut station = Self::start_with(config, move || HalBus::open(device), log, sink)?;
        station.files.accel_log = Some(accel_path);

        if config.rs485.enabled {
            let env_path = config.log.env_path(&stamp);
            let env_log = match EnvironmentalLog::create(&env_path) {
                Ok(log) => {
                    station.files.env_log = Some(env_path);
                    Some(log)
                }
                Err(e) => {
                    warn!("Environmental log disabled: {}", e);
                    None
                }
            };
            station.start_environmental_poll(config, SerialTransport::new(&config.rs485), env_log)?;
        }

        Ok(station)
    }

    /// Start with caller-supplied bus, log and sink
    ///
    /// The environmental poller is not started; see
    /// [`Station::start_environmental_poll`].
    pub fn start_with<F, B, L, S>(config: &Config, open_bus: F, log: L, sink: S) -> Result<Self>
    where
        F: FnOnce() -> Result<B> + Send + 'static,
        B: RegisterBus + 'static,
        L: SampleLog + Send + 'static,
        S: IngestSink + Send + 'static,
    {
        config.validate()?;

        let sender = BatchingSender::new(sink, &config.sender, config.sampling.declared_rate_hz).spawn()?;
        let snapshot = LatestSnapshot::new();
        let sampling = SamplingHandle::spawn(config, open_bus, log, sender.inbox(), snapshot.clone())?;
        info!(
            "Station started: channels {:?}, period {:?}",
            config.bus.channels, config.sampling.period
        );

        Ok(Self {
            poller: None,
            sampling,
            sender,
            snapshot,
            files: RunFiles::default(),
        })
    }

    /// Poll the RS-485 sensors every `config.rs485.poll_interval`
    ///
    /// Each reading is appended to `log` when one is given and forwarded to
    /// the sender. Replaces a poller that is already running.
    pub fn start_environmental_poll<T, W>(
        &mut self,
        config: &Config,
        transport: T,
        log: Option<EnvironmentalLog<W>>,
    ) -> Result<()>
    where
        T: ModbusTransport + Send + 'static,
        W: Write + Send + 'static,
    {
        if let Some(mut previous) = self.poller.take() {
            previous.stop();
        }

        let inbox = self.sender.inbox();
        let mut log = log;
        let poller = EnvironmentalPoller::new(transport, &config.rs485);
        let handle = poller.spawn(config.rs485.poll_interval, move |reading| {
            let failed = log.as_mut().and_then(|writer| writer.append(&reading).err());
            if let Some(e) = failed {
                warn!("Environmental log append failed, disabling it: {}", e);
                log = None;
            }
            inbox.submit_environmental(reading);
        })?;
        self.poller = Some(handle);
        Ok(())
    }

    /// Most recent triple, `None` before the first sample
    pub fn latest_snapshot(&self) -> Option<AxisTriple> {
        self.snapshot.get()
    }

    /// Queue an environmental reading for delivery
    pub fn submit_environmental(&self, reading: EnvironmentalReading) {
        self.sender.submit_environmental(reading);
    }

    /// Calibration outcome, `None` while bring-up is still running
    pub fn calibration(&self) -> Option<CalibrationReport> {
        self.sampling.calibration()
    }

    pub fn samples_published(&self) -> u64 {
        self.sampling.published()
    }

    /// True while the sampling thread is alive
    ///
    /// Turns false on its own if the bus could not be opened.
    pub fn is_sampling(&self) -> bool {
        self.sampling.is_running()
    }

    pub fn files(&self) -> &RunFiles {
        &self.files
    }

    /// Stop producers first, then the sender
    ///
    /// Anything still queued for delivery is discarded. Returns the sender's
    /// counters, or `None` if the station was already stopped.
    pub fn stop(&mut self) -> Option<SenderStats> {
        if let Some(mut poller) = self.poller.take() {
            poller.stop();
        }
        self.sampling.stop();
        let stats = self.sender.stop();
        if stats.is_some() {
            info!("Station stopped after {} samples", self.sampling.published());
        }
        stats
    }
}

impl Drop for Station {
    fn drop(&mut self) {
        self.stop();
    }
}
