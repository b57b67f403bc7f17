//! RS-485 environmental sensors (Modbus RTU)
//!
//! Temperature/humidity, wind speed and wind direction sit on one RS-485 line
//! as separate Modbus slaves. Once per poll interval every register is read
//! with function code 3 and the scaled values are combined into one
//! [`EnvironmentalReading`]. A failure anywhere in the cycle makes the whole
//! reading absent.

use crate::config::Rs485Config;
use crate::error::{Result, SensorError};
use crate::sample::EnvironmentalReading;
use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use serialport::{ClearBuffer, DataBits, Parity, StopBits};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Read Holding Registers
pub const FC_READ_HOLDING: u8 = 0x03;
/// Reply to a single-register read: slave, fc, byte count, 2 data, 2 CRC
pub const READ_RESPONSE_LEN: usize = 7;
/// Exception reply: slave, fc | 0x80, exception code, 2 CRC
const EXCEPTION_RESPONSE_LEN: usize = 5;

const REG_TEMPERATURE: u16 = 0;
const REG_HUMIDITY: u16 = 1;
const REG_WIND_SPEED: u16 = 0;
const REG_WIND_DIRECTION: u16 = 0;

/// CRC-16/MODBUS (reflected poly 0xA001, init 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Frame reading one holding register
pub fn read_request(slave: u8, register: u16) -> [u8; 8] {
    let [reg_hi, reg_lo] = register.to_be_bytes();
    let mut frame = [slave, FC_READ_HOLDING, reg_hi, reg_lo, 0x00, 0x01, 0, 0];
    let [crc_lo, crc_hi] = crc16(&frame[..6]).to_le_bytes();
    frame[6] = crc_lo;
    frame[7] = crc_hi;
    frame
}

fn check_crc(frame: &[u8]) -> Result<()> {
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    let computed = crc16(body);
    if received != computed {
        return Err(SensorError::Modbus(format!(
            "CRC mismatch: received 0x{:04X}, computed 0x{:04X}",
            received, computed
        )));
    }
    Ok(())
}

/// Decode the reply to [`read_request`]
///
/// # Returns
/// * `Ok(u16)` - Register value
/// * `Err(SensorError::Modbus)` - Exception reply, bad CRC, wrong length or
///   a reply from another slave
pub fn parse_read_response(slave: u8, frame: &[u8]) -> Result<u16> {
    if frame.len() == EXCEPTION_RESPONSE_LEN && frame[1] == FC_READ_HOLDING | 0x80 {
        check_crc(frame)?;
        return Err(SensorError::Modbus(format!(
            "slave {} exception code 0x{:02X}",
            frame[0], frame[2]
        )));
    }
    if frame.len() != READ_RESPONSE_LEN {
        return Err(SensorError::Modbus(format!(
            "slave {}: expected {} byte reply, got {}",
            slave,
            READ_RESPONSE_LEN,
            frame.len()
        )));
    }
    check_crc(frame)?;
    if frame[0] != slave || frame[1] != FC_READ_HOLDING || frame[2] != 2 {
        return Err(SensorError::Modbus(format!(
            "unexpected reply header {:02X?} for slave {}",
            &frame[..3],
            slave
        )));
    }
    Ok(u16::from_be_bytes([frame[3], frame[4]]))
}

/// Request/response exchange on the RS-485 line
pub trait ModbusTransport {
    /// Send `request` and collect up to `response_len` reply bytes
    ///
    /// May return fewer bytes when the slave answers with an exception.
    fn transact(&mut self, request: &[u8], response_len: usize) -> Result<Vec<u8>>;
}

/// Serial-port transport, 8N1
///
/// The port is opened for every transaction and closed afterwards, with its
/// input buffer cleared before the request goes out.
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialTransport {
    pub fn new(config: &Rs485Config) -> Self {
        Self {
            path: config.port.clone(),
            baud_rate: config.baud_rate,
            timeout: config.timeout,
        }
    }
}

impl ModbusTransport for SerialTransport {
    fn transact(&mut self, request: &[u8], response_len: usize) -> Result<Vec<u8>> {
        let mut port = serialport::new(self.path.as_str(), self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(self.timeout)
            .open()?;
        port.clear(ClearBuffer::Input)?;
        port.write_all(request)?;

        let mut response = vec![0u8; response_len];
        let mut expected = response_len;
        let mut filled = 0;
        while filled < expected {
            let n = port.read(&mut response[filled..expected])?;
            if n == 0 {
                break;
            }
            filled += n;
            if filled >= 2 && response[1] & 0x80 != 0 {
                expected = expected.min(EXCEPTION_RESPONSE_LEN);
            }
        }
        response.truncate(filled);
        Ok(response)
    }
}

/// Modbus RTU master over a [`ModbusTransport`]
pub struct ModbusClient<T> {
    transport: T,
}

impl<T: ModbusTransport> ModbusClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn read_holding_register(&mut self, slave: u8, register: u16) -> Result<u16> {
        let reply = self
            .transport
            .transact(&read_request(slave, register), READ_RESPONSE_LEN)?;
        parse_read_response(slave, &reply)
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}

/// Raw register values of one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RawCycle {
    temperature: u16,
    humidity: u16,
    wind_speed: u16,
    wind_direction: u16,
}

/// One environmental poll cycle per call
pub struct EnvironmentalPoller<T> {
    client: ModbusClient<T>,
    temp_hum_id: u8,
    wind_speed_id: u8,
    wind_dir_id: u8,
    request_gap: Duration,
    failing: bool,
}

impl<T: ModbusTransport> EnvironmentalPoller<T> {
    pub fn new(transport: T, config: &Rs485Config) -> Self {
        Self {
            client: ModbusClient::new(transport),
            temp_hum_id: config.temp_hum_id,
            wind_speed_id: config.wind_speed_id,
            wind_dir_id: config.wind_dir_id,
            request_gap: config.request_gap,
            failing: false,
        }
    }

    fn read_register(&mut self, slave: u8, register: u16) -> Result<u16> {
        let value = self.client.read_holding_register(slave, register)?;
        thread::sleep(self.request_gap);
        Ok(value)
    }

    fn read_cycle(&mut self) -> Result<RawCycle> {
        Ok(RawCycle {
            temperature: self.read_register(self.temp_hum_id, REG_TEMPERATURE)?,
            humidity: self.read_register(self.temp_hum_id, REG_HUMIDITY)?,
            wind_speed: self.read_register(self.wind_speed_id, REG_WIND_SPEED)?,
            wind_direction: self.read_register(self.wind_dir_id, REG_WIND_DIRECTION)?,
        })
    }

    /// Read every sensor and build the reading stamped with `time`
    pub fn poll(&mut self, time: DateTime<Local>) -> EnvironmentalReading {
        match self.read_cycle() {
            Ok(raw) => {
                if self.failing {
                    info!("RS-485 sensors responding again");
                    self.failing = false;
                }
                EnvironmentalReading::new(
                    time,
                    Some(f64::from(raw.temperature) / 10.0),
                    Some(f64::from(raw.humidity) / 10.0),
                    Some(f64::from(raw.wind_direction)),
                    Some(f64::from(raw.wind_speed) / 10.0),
                )
            }
            Err(e) => {
                if self.failing {
                    debug!("RS-485 cycle failed: {}", e);
                } else {
                    warn!("RS-485 cycle failed, reporting absent readings: {}", e);
                    self.failing = true;
                }
                EnvironmentalReading::absent(time)
            }
        }
    }
}

impl<T: ModbusTransport + Send + 'static> EnvironmentalPoller<T> {
    /// Poll every `interval` on a dedicated thread, handing each reading to
    /// `on_reading`
    pub fn spawn<F>(mut self, interval: Duration, mut on_reading: F) -> Result<PollerHandle>
    where
        F: FnMut(EnvironmentalReading) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();

        let thread = thread::Builder::new()
            .name("rs485".to_string())
            .spawn(move || {
                let mut next_poll = Instant::now();
                while thread_running.load(Ordering::Relaxed) {
                    let now = Instant::now();
                    if now < next_poll {
                        // Short naps keep stop() responsive
                        thread::sleep((next_poll - now).min(Duration::from_millis(20)));
                        continue;
                    }
                    next_poll += interval;
                    on_reading(self.poll(Local::now()));
                }
            })?;

        Ok(PollerHandle {
            running,
            thread: Some(thread),
        })
    }
}

/// Handle to the RS-485 poller thread
pub struct PollerHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PollerHandle {
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Signal the thread to stop and wait for the current cycle to finish
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("RS-485 poller thread panicked");
            }
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
