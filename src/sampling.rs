//! Fixed-period acquisition loop
//!
//! Every period the three accelerometers are read in a fixed order through the
//! mux, their offsets subtracted, and the resulting [`AxisTriple`] published to
//! the shared snapshot, appended to the durable log and handed to the sender.
//!
//! The schedule is deadline-additive: each fired period advances the deadline
//! by exactly one period, never to "now", so the long-run rate does not drift.
//! Between deadlines the loop sleeps for a short idle yield instead of spinning.

use crate::adxl345::Adxl345;
use crate::bus::RegisterBus;
use crate::calibration::{calibrate_all, CalibrationReport};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{BusConfig, CalibrationConfig, Config, SamplingConfig};
use crate::error::Result;
use crate::mux::Tca9548a;
use crate::sample::{AxisTriple, LatestSnapshot};
use crate::sample_log::SampleLog;
use log::{error, info, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Consumer of the per-period triples (the batching sender's inbox)
///
/// Must not block: it is called from the sampling hot path.
pub trait AxisSink {
    fn submit_axis_triple(&self, triple: AxisTriple);
}

/// Mux, driver and offsets for the accelerometer trio
pub struct Sampler<B> {
    mux: Tca9548a<B>,
    adxl: Adxl345,
    channels: [u8; 3],
    offsets: [i32; 3],
    period: Duration,
    idle_yield: Duration,
    published: Arc<AtomicU64>,
}

impl<B: RegisterBus> Sampler<B> {
    /// Create a sampler with zero offsets
    pub fn new(mux: Tca9548a<B>, adxl: Adxl345, channels: [u8; 3], timing: &SamplingConfig) -> Self {
        Self {
            mux,
            adxl,
            channels,
            offsets: [0; 3],
            period: timing.period,
            idle_yield: timing.idle_yield,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn offsets(&self) -> [i32; 3] {
        self.offsets
    }

    /// Total triples published by this sampler, shared with observers
    pub fn published(&self) -> Arc<AtomicU64> {
        self.published.clone()
    }

    /// Configure every device, then estimate and store the offsets
    ///
    /// Nothing here fails: unreachable devices are logged and end up with a
    /// zero offset, flagged in the returned report.
    pub fn bring_up<C: Clock>(
        &mut self,
        bus: &BusConfig,
        calibration: &CalibrationConfig,
        clock: &C,
    ) -> CalibrationReport {
        clock.sleep(bus.power_up_delay);

        for channel in self.channels {
            match self.mux.select(channel) {
                Ok(()) => {
                    let failures = self.adxl.initialize(self.mux.bus());
                    if !failures.is_empty() {
                        warn!(
                            "Channel {}: {} of 3 configuration writes failed",
                            channel,
                            failures.len()
                        );
                    }
                }
                Err(e) => warn!("Channel {}: cannot select for bring-up: {}", channel, e),
            }
        }

        let report = calibrate_all(&mut self.mux, &self.adxl, &self.channels, calibration, clock);
        for (slot, channel) in self.offsets.iter_mut().zip(&report.channels) {
            *slot = channel.offset;
        }
        report
    }

    fn read_channel(&mut self, channel: u8) -> Result<i16> {
        self.mux.select(channel)?;
        self.adxl.read_axis(self.mux.bus())
    }

    /// Read all three devices once and subtract their offsets
    ///
    /// A failed select or read contributes a raw value of 0.
    pub fn sample_round(&mut self) -> AxisTriple {
        let mut values = [0i32; 3];
        for (i, channel) in self.channels.into_iter().enumerate() {
            let raw = match self.read_channel(channel) {
                Ok(value) => i32::from(value),
                Err(e) => {
                    trace!("Channel {}: {}", channel, e);
                    0
                }
            };
            values[i] = raw - self.offsets[i];
        }
        AxisTriple::from(values)
    }

    /// Run the fixed-period loop until `running` is cleared
    ///
    /// # Returns
    /// Number of periods fired during this call.
    pub fn run<L, K, C>(
        &mut self,
        log: &mut L,
        sink: &K,
        snapshot: &LatestSnapshot,
        clock: &C,
        running: &AtomicBool,
    ) -> u64
    where
        L: SampleLog,
        K: AxisSink,
        C: Clock,
    {
        let mut fired = 0u64;
        let mut log_failed = false;
        let mut previous_deadline = clock.now();

        while running.load(Ordering::Relaxed) {
            if clock.now().saturating_sub(previous_deadline) < self.period {
                clock.sleep(self.idle_yield);
                continue;
            }
            previous_deadline += self.period;

            let triple = self.sample_round();
            snapshot.publish(triple);
            if let Err(e) = log.append(&triple) {
                if !log_failed {
                    warn!("Sample log append failed, further rows may be lost: {}", e);
                    log_failed = true;
                }
            }
            sink.submit_axis_triple(triple);

            fired += 1;
            self.published.fetch_add(1, Ordering::Relaxed);
        }

        if let Err(e) = log.flush() {
            warn!("Sample log flush failed: {}", e);
        }
        fired
    }
}

/// Handle to the sampling thread
pub struct SamplingHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    calibration: Arc<Mutex<Option<CalibrationReport>>>,
    published: Arc<AtomicU64>,
}

impl SamplingHandle {
    /// Start bring-up, calibration and sampling on a dedicated thread
    ///
    /// The bus is opened on the sampling thread. Failing to open it ends the
    /// thread with an `error!` log; the caller is never handed the fault.
    pub fn spawn<F, B, L, K>(
        config: &Config,
        open_bus: F,
        mut log: L,
        sink: K,
        snapshot: LatestSnapshot,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<B> + Send + 'static,
        B: RegisterBus + 'static,
        L: SampleLog + Send + 'static,
        K: AxisSink + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let calibration = Arc::new(Mutex::new(None));
        let published = Arc::new(AtomicU64::new(0));

        let bus_config = config.bus.clone();
        let calibration_config = config.calibration.clone();
        let timing = config.sampling.clone();
        let thread_running = running.clone();
        let thread_calibration = calibration.clone();
        let thread_published = published.clone();

        let thread = thread::Builder::new()
            .name("sampling".to_string())
            .spawn(move || {
                let bus = match open_bus() {
                    Ok(bus) => bus,
                    Err(e) => {
                        error!("Sampling thread: {}", e);
                        return;
                    }
                };

                let clock = MonotonicClock::new();
                let mux = Tca9548a::from_config(bus, &bus_config);
                let adxl = Adxl345::new(bus_config.accel_address);
                let mut sampler = Sampler::new(mux, adxl, bus_config.channels, &timing);
                sampler.published = thread_published;

                let report = sampler.bring_up(&bus_config, &calibration_config, &clock);
                if report.has_fallback() {
                    warn!("Sampling with uncalibrated channels: {:?}", report.offsets());
                } else {
                    info!("Calibrated offsets: {:?}", report.offsets());
                }
                *thread_calibration.lock().unwrap_or_else(|e| e.into_inner()) = Some(report);

                let fired = sampler.run(&mut log, &sink, &snapshot, &clock, &thread_running);
                info!(
                    "Sampling stopped after {} periods ({:.1} s)",
                    fired,
                    clock.elapsed_secs()
                );
            })?;

        Ok(Self {
            running,
            thread: Some(thread),
            calibration,
            published,
        })
    }

    /// Calibration outcome, `None` until bring-up has finished
    pub fn calibration(&self) -> Option<CalibrationReport> {
        self.calibration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Triples published so far
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Check if the thread is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Signal the thread to stop and wait for it
    ///
    /// The loop notices within one iteration, after calibration if that is
    /// still in progress.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Sampling thread panicked");
            }
        }
    }
}

impl Drop for SamplingHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake::{FakeBus, Reply};
    use crate::clock::SimulatedClock;
    use crate::config::{ADXL345_ADDRESS, MUX_ADDRESS};
    use crate::error::SensorError;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct MemoryLog {
        rows: Vec<AxisTriple>,
        flushed: bool,
    }

    impl SampleLog for MemoryLog {
        fn append(&mut self, triple: &AxisTriple) -> Result<()> {
            self.rows.push(*triple);
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            self.flushed = true;
            Ok(())
        }
    }

    struct BrokenLog;

    impl SampleLog for BrokenLog {
        fn append(&mut self, _triple: &AxisTriple) -> Result<()> {
            Err(SensorError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }

        fn flush(&mut self) -> Result<()> {
            Err(SensorError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }
    }

    /// Records submit times and clears `running` after `limit` triples
    struct StopAfter<'a> {
        clock: &'a SimulatedClock,
        running: &'a AtomicBool,
        limit: usize,
        seen: RefCell<Vec<(Duration, AxisTriple)>>,
    }

    impl AxisSink for StopAfter<'_> {
        fn submit_axis_triple(&self, triple: AxisTriple) {
            let mut seen = self.seen.borrow_mut();
            seen.push((self.clock.now(), triple));
            if seen.len() >= self.limit {
                self.running.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Bus whose first `slow_reads` reads each take `read_cost` on the clock
    struct SlowBus {
        clock: Rc<SimulatedClock>,
        read_cost: Duration,
        slow_reads: usize,
    }

    impl RegisterBus for SlowBus {
        fn write(&mut self, _address: u8, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }

        fn read_block(&mut self, _address: u8, _register: u8, buf: &mut [u8]) -> Result<usize> {
            if self.slow_reads > 0 {
                self.slow_reads -= 1;
                self.clock.advance(self.read_cost);
            }
            buf.fill(0);
            Ok(buf.len())
        }
    }

    fn sampler(bus: FakeBus) -> Sampler<FakeBus> {
        Sampler::new(
            Tca9548a::new(bus, MUX_ADDRESS, Duration::ZERO),
            Adxl345::new(ADXL345_ADDRESS),
            [1, 2, 4],
            &SamplingConfig::default(),
        )
    }

    fn quick_calibration() -> CalibrationConfig {
        CalibrationConfig {
            discard: 2,
            samples: 5,
            interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_bring_up_configures_and_calibrates() {
        let bus = FakeBus::new()
            .with_fixed(1, 120)
            .with_fixed(2, -30)
            .with_fixed(4, 256);
        let mut sampler = sampler(bus);
        let clock = SimulatedClock::new();
        let bus_config = BusConfig::default();

        let report = sampler.bring_up(&bus_config, &quick_calibration(), &clock);

        assert_eq!(report.offsets(), vec![120, -30, 256]);
        assert_eq!(sampler.offsets(), [120, -30, 256]);
        assert_eq!(sampler.mux.bus().device_writes().len(), 9);
        // Power-up delay plus 7 calibration reads per channel
        assert_eq!(
            clock.now(),
            bus_config.power_up_delay + Duration::from_millis(21)
        );
    }

    #[test]
    fn test_sample_round_subtracts_offsets() {
        let bus = FakeBus::new()
            .with_fixed(1, 120)
            .with_fixed(2, -30)
            .with_fixed(4, 256);
        let mut sampler = sampler(bus);
        sampler.offsets = [100, -40, 256];

        assert_eq!(sampler.sample_round(), AxisTriple::new(20, 10, 0));
        assert_eq!(sampler.mux.bus().mux_writes(), vec![0x02, 0x04, 0x10]);
    }

    #[test]
    fn test_sample_round_substitutes_zero_on_read_error() {
        let bus = FakeBus::new()
            .with_fixed(1, 50)
            .with_script(2, vec![Reply::Fail, Reply::Short])
            .with_fixed(2, 7)
            .with_fixed(4, 9);
        let mut sampler = sampler(bus);
        sampler.offsets = [0, 5, 0];

        assert_eq!(sampler.sample_round(), AxisTriple::new(50, -5, 9));
        assert_eq!(sampler.sample_round(), AxisTriple::new(50, -5, 9));
        assert_eq!(sampler.sample_round(), AxisTriple::new(50, 2, 9));
    }

    #[test]
    fn test_sample_round_survives_mux_failure() {
        let mut sampler = sampler(FakeBus::new().with_fixed(1, 10));
        sampler.offsets = [3, 3, 3];
        sampler.mux.bus().fail_writes = true;
        assert_eq!(sampler.sample_round(), AxisTriple::new(-3, -3, -3));
    }

    #[test]
    fn test_run_fires_once_per_period() {
        let bus = FakeBus::new()
            .with_fixed(1, 1)
            .with_fixed(2, 2)
            .with_fixed(4, 3);
        let mut sampler = sampler(bus);
        let clock = SimulatedClock::new();
        let running = AtomicBool::new(true);
        let snapshot = LatestSnapshot::new();
        let mut log = MemoryLog::default();
        let sink = StopAfter {
            clock: &clock,
            running: &running,
            limit: 250,
            seen: RefCell::new(Vec::new()),
        };

        let fired = sampler.run(&mut log, &sink, &snapshot, &clock, &running);

        let period = SamplingConfig::default().period;
        let seen = sink.seen.into_inner();
        assert_eq!(fired, 250);
        assert_eq!(seen.len(), 250);
        assert_eq!(log.rows.len(), 250);
        assert!(log.flushed);
        assert_eq!(sampler.published().load(Ordering::Relaxed), 250);

        for pair in seen.windows(2) {
            assert_eq!(pair[1].0 - pair[0].0, period);
        }
        // No accumulated drift: period N fires at exactly N periods
        assert_eq!(seen.last().unwrap().0, period * 250);
        assert_eq!(snapshot.get(), Some(AxisTriple::new(1, 2, 3)));
    }

    #[test]
    fn test_run_catches_up_after_slow_rounds() {
        let shared = Rc::new(SimulatedClock::new());
        let clock: &SimulatedClock = &shared;
        // 10 rounds of 3 x 1 ms reads against a 2 ms period, then instant reads
        let bus = SlowBus {
            clock: shared.clone(),
            read_cost: Duration::from_millis(1),
            slow_reads: 30,
        };
        let mut sampler = Sampler::new(
            Tca9548a::new(bus, MUX_ADDRESS, Duration::ZERO),
            Adxl345::new(ADXL345_ADDRESS),
            [1, 2, 4],
            &SamplingConfig::default(),
        );
        let running = AtomicBool::new(true);
        let sink = StopAfter {
            clock,
            running: &running,
            limit: 20,
            seen: RefCell::new(Vec::new()),
        };

        let fired = sampler.run(&mut MemoryLog::default(), &sink, &LatestSnapshot::new(), clock, &running);
        assert_eq!(fired, 20);

        let ms = Duration::from_millis;
        let times: Vec<Duration> = sink.seen.into_inner().iter().map(|(t, _)| *t).collect();

        // Slow rounds run back to back with no idle yield in between
        let slow: Vec<Duration> = (1..=10).map(|k| ms(2 + 3 * k)).collect();
        assert_eq!(times[..10], slow[..]);

        // The deadline lagged 12 ms behind at 32 ms, so six rounds fire back to
        // back before the loop is on schedule again
        assert_eq!(times[10..16], [ms(32); 6]);

        // Round N is due at N periods, exactly as if nothing had been slow
        assert_eq!(times[16..], [ms(34), ms(36), ms(38), ms(40)]);
    }

    #[test]
    fn test_run_keeps_order_across_log_and_sink() {
        let script: Vec<Reply> = (0..20).map(Reply::Value).collect();
        let bus = FakeBus::new().with_script(1, script);
        let mut sampler = sampler(bus);
        let clock = SimulatedClock::new();
        let running = AtomicBool::new(true);
        let mut log = MemoryLog::default();
        let sink = StopAfter {
            clock: &clock,
            running: &running,
            limit: 20,
            seen: RefCell::new(Vec::new()),
        };

        sampler.run(&mut log, &sink, &LatestSnapshot::new(), &clock, &running);

        let z1_log: Vec<i32> = log.rows.iter().map(|t| t.z1).collect();
        let z1_sink: Vec<i32> = sink.seen.into_inner().iter().map(|(_, t)| t.z1).collect();
        assert_eq!(z1_log, (0..20).collect::<Vec<_>>());
        assert_eq!(z1_sink, z1_log);
    }

    #[test]
    fn test_run_survives_failing_log() {
        let mut sampler = sampler(FakeBus::new());
        let clock = SimulatedClock::new();
        let running = AtomicBool::new(true);
        let sink = StopAfter {
            clock: &clock,
            running: &running,
            limit: 10,
            seen: RefCell::new(Vec::new()),
        };

        let fired = sampler.run(&mut BrokenLog, &sink, &LatestSnapshot::new(), &clock, &running);
        assert_eq!(fired, 10);
    }

    #[test]
    fn test_run_returns_immediately_when_stopped() {
        let mut sampler = sampler(FakeBus::new());
        let clock = SimulatedClock::new();
        let running = AtomicBool::new(false);
        let sink = StopAfter {
            clock: &clock,
            running: &running,
            limit: 1,
            seen: RefCell::new(Vec::new()),
        };
        let snapshot = LatestSnapshot::new();

        let fired = sampler.run(&mut MemoryLog::default(), &sink, &snapshot, &clock, &running);
        assert_eq!(fired, 0);
        assert_eq!(snapshot.get(), None);
        assert!(sampler.mux.bus().writes.is_empty());
    }
}
