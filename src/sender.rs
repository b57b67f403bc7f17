//! Batching delivery to the ingestion endpoint
//!
//! Producers only ever touch a [`SenderInbox`]: two FIFO queues behind short
//! critical sections. The delivery thread owns the network side. It forwards
//! environmental readings one at a time and accelerometer triples in batches,
//! flushed when a full batch is waiting or when the flush interval has passed
//! with anything pending.
//!
//! Delivery is at-most-once. A failed request is dropped, never retried or
//! requeued, and nothing that is still queued at stop is sent.

use crate::config::SenderConfig;
use crate::error::{Result, SensorError};
use crate::sample::{AxisTriple, EnvironmentalReading};
use crate::sampling::AxisSink;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::header::{HeaderName, HeaderValue};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Format a UTC instant as `2024-05-17T08:30:01.123456Z`
pub fn utc_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// One ingestion request body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestRequest {
    pub device_id: String,
    pub ts: String,
    #[serde(flatten)]
    pub payload: Payload,
}

/// Request-specific part of the body, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Payload {
    #[serde(rename = "rs485")]
    Environmental { sample: EnvironmentalReading },

    #[serde(rename = "adxl_batch")]
    AccelBatch {
        fs_hz: u32,
        /// First field of the first sample, kept for wire compatibility
        chunk_start_us: i64,
        samples: Vec<AxisTriple>,
    },
}

impl IngestRequest {
    pub fn environmental(device_id: &str, ts: String, sample: EnvironmentalReading) -> Self {
        Self {
            device_id: device_id.to_string(),
            ts,
            payload: Payload::Environmental { sample },
        }
    }

    /// Batch request; `samples` must be non-empty
    pub fn accel_batch(device_id: &str, ts: String, fs_hz: u32, samples: Vec<AxisTriple>) -> Self {
        let chunk_start_us = samples.first().map_or(0, |t| i64::from(t.z1));
        Self {
            device_id: device_id.to_string(),
            ts,
            payload: Payload::AccelBatch {
                fs_hz,
                chunk_start_us,
                samples,
            },
        }
    }
}

/// Network side of the sender
pub trait IngestSink {
    /// Deliver one request. Only a transport fault is an error; the response
    /// itself is not inspected.
    fn deliver(&self, request: &IngestRequest) -> Result<()>;
}

/// JSON-over-HTTP [`IngestSink`]
pub struct HttpSink {
    client: reqwest::blocking::Client,
    url: String,
    api_key_header: HeaderName,
    api_key: HeaderValue,
}

impl HttpSink {
    /// Build the shared client with the configured request timeout
    ///
    /// The API key header is parsed here so a malformed name or key fails at
    /// start-up instead of on every request.
    pub fn new(config: &SenderConfig) -> Result<Self> {
        let api_key_header = HeaderName::from_bytes(config.api_key_header.as_bytes())
            .map_err(|e| SensorError::ClientBuild(format!("API key header name: {}", e)))?;
        let api_key = HeaderValue::from_str(&config.api_key)
            .map_err(|e| SensorError::ClientBuild(format!("API key value: {}", e)))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SensorError::ClientBuild(e.to_string()))?;
        Ok(Self {
            client,
            url: config.ingest_url(),
            api_key_header,
            api_key,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl IngestSink for HttpSink {
    fn deliver(&self, request: &IngestRequest) -> Result<()> {
        self.client
            .post(&self.url)
            .header(self.api_key_header.clone(), self.api_key.clone())
            .json(request)
            .send()
            .map(|_| ())
            .map_err(|e| SensorError::DeliveryFailure(e.to_string()))
    }
}

#[derive(Default)]
struct Queues {
    environmental: Mutex<VecDeque<EnvironmentalReading>>,
    axis: Mutex<VecDeque<AxisTriple>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Producer-side handle of the sender queues
///
/// Cheap to clone; every clone feeds the same sender.
#[derive(Clone, Default)]
pub struct SenderInbox {
    queues: Arc<Queues>,
}

impl SenderInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an environmental reading for individual delivery
    pub fn submit_environmental(&self, reading: EnvironmentalReading) {
        lock(&self.queues.environmental).push_back(reading);
    }

    /// Queue one triple for batched delivery
    pub fn submit_axis_triple(&self, triple: AxisTriple) {
        lock(&self.queues.axis).push_back(triple);
    }

    pub fn pending_environmental(&self) -> usize {
        lock(&self.queues.environmental).len()
    }

    pub fn pending_axis(&self) -> usize {
        lock(&self.queues.axis).len()
    }

    fn pop_environmental(&self) -> Option<EnvironmentalReading> {
        lock(&self.queues.environmental).pop_front()
    }
}

impl AxisSink for SenderInbox {
    fn submit_axis_triple(&self, triple: AxisTriple) {
        SenderInbox::submit_axis_triple(self, triple);
    }
}

/// Size-or-time flush rule for the accelerometer queue
pub fn flush_due(pending: usize, batch_size: usize, since_last: Duration, interval: Duration) -> bool {
    pending >= batch_size || (pending > 0 && since_last >= interval)
}

/// What one delivery step attempted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub environmental_sent: bool,
    /// Size of the batch taken this step, 0 when no flush was due
    pub batch_len: usize,
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    pub requests: u64,
    pub failures: u64,
    /// Accelerometer samples in batches the sink accepted
    pub samples_sent: u64,
}

/// Delivery side of the sender
pub struct BatchingSender<S> {
    inbox: SenderInbox,
    sink: S,
    device_id: String,
    fs_hz: u32,
    batch_size: usize,
    flush_interval: Duration,
    idle_sleep: Duration,
    last_flush: Instant,
    failing: bool,
    stats: SenderStats,
}

impl<S: IngestSink> BatchingSender<S> {
    /// # Arguments
    /// * `fs_hz` - Sample rate declared in every accelerometer batch
    pub fn new(sink: S, config: &SenderConfig, fs_hz: u32) -> Self {
        Self {
            inbox: SenderInbox::new(),
            sink,
            device_id: config.device_id.clone(),
            fs_hz,
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            idle_sleep: config.idle_sleep,
            last_flush: Instant::now(),
            failing: false,
            stats: SenderStats::default(),
        }
    }

    /// Producer handle feeding this sender
    pub fn inbox(&self) -> SenderInbox {
        self.inbox.clone()
    }

    pub fn stats(&self) -> SenderStats {
        self.stats
    }

    /// Deliver one request, returning whether the sink accepted it
    fn send(&mut self, request: &IngestRequest) -> bool {
        self.stats.requests += 1;
        match self.sink.deliver(request) {
            Ok(()) => {
                if self.failing {
                    info!("Delivery to ingestion endpoint recovered");
                    self.failing = false;
                }
                true
            }
            Err(e) => {
                self.stats.failures += 1;
                if self.failing {
                    debug!("Dropped request: {}", e);
                } else {
                    warn!("Dropping undeliverable requests: {}", e);
                    self.failing = true;
                }
                false
            }
        }
    }

    /// One delivery iteration without the trailing idle sleep
    ///
    /// At most one environmental reading and one accelerometer batch are sent.
    /// Queue locks are released before any request goes out.
    pub fn run_once(&mut self, now: Instant) -> StepOutcome {
        let mut outcome = StepOutcome::default();

        if let Some(reading) = self.inbox.pop_environmental() {
            let request = IngestRequest::environmental(&self.device_id, utc_timestamp(Utc::now()), reading);
            self.send(&request);
            outcome.environmental_sent = true;
        }

        let batch: Vec<AxisTriple> = {
            let mut axis = lock(&self.inbox.queues.axis);
            let since_last = now.saturating_duration_since(self.last_flush);
            if !flush_due(axis.len(), self.batch_size, since_last, self.flush_interval) {
                return outcome;
            }
            let take = self.batch_size.min(axis.len());
            self.last_flush = now;
            axis.drain(..take).collect()
        };

        outcome.batch_len = batch.len();
        debug!("Flushing batch of {} samples", batch.len());
        let request = IngestRequest::accel_batch(&self.device_id, utc_timestamp(Utc::now()), self.fs_hz, batch);
        if self.send(&request) {
            self.stats.samples_sent += outcome.batch_len as u64;
        }
        outcome
    }

    /// Deliver until `running` is cleared
    pub fn run(&mut self, running: &AtomicBool) {
        while running.load(Ordering::Relaxed) {
            self.run_once(Instant::now());
            thread::sleep(self.idle_sleep);
        }
    }
}

impl<S: IngestSink + Send + 'static> BatchingSender<S> {
    /// Move the sender onto its own delivery thread
    pub fn spawn(mut self) -> Result<SenderHandle> {
        let inbox = self.inbox();
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();

        let thread = thread::Builder::new()
            .name("sender".to_string())
            .spawn(move || {
                self.run(&thread_running);
                let stats = self.stats();
                info!(
                    "Sender stopped: {} requests, {} failed, {} samples sent, {} left unsent",
                    stats.requests,
                    stats.failures,
                    stats.samples_sent,
                    self.inbox.pending_axis()
                );
                stats
            })?;

        Ok(SenderHandle {
            inbox,
            running,
            thread: Some(thread),
        })
    }
}

/// Handle to the delivery thread
pub struct SenderHandle {
    inbox: SenderInbox,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<SenderStats>>,
}

impl SenderHandle {
    pub fn inbox(&self) -> SenderInbox {
        self.inbox.clone()
    }

    pub fn submit_environmental(&self, reading: EnvironmentalReading) {
        self.inbox.submit_environmental(reading);
    }

    pub fn submit_axis_triple(&self, triple: AxisTriple) {
        self.inbox.submit_axis_triple(triple);
    }

    /// Check if the thread is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Signal the delivery thread to stop and wait for its final counters
    ///
    /// Returns `None` if the thread was already stopped.
    pub fn stop(&mut self) -> Option<SenderStats> {
        self.running.store(false, Ordering::SeqCst);
        self.thread.take().and_then(|thread| thread.join().ok())
    }
}

impl Drop for SenderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
