//! Sample types shared between the acquisition loop, the logs and the sender

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Label used when no wind direction is available
pub const NO_DIRECTION: &str = "-";

const COMPASS_POINTS: [&str; 8] = ["N", "NE", "E", "SE", "S", "SW", "W", "NW"];

/// One calibrated reading from each of the three accelerometers
///
/// Serialises as `[z1, z2, z3]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(into = "[i32; 3]")]
pub struct AxisTriple {
    pub z1: i32,
    pub z2: i32,
    pub z3: i32,
}

impl AxisTriple {
    pub fn new(z1: i32, z2: i32, z3: i32) -> Self {
        Self { z1, z2, z3 }
    }

    pub fn to_array(self) -> [i32; 3] {
        [self.z1, self.z2, self.z3]
    }
}

impl From<AxisTriple> for [i32; 3] {
    fn from(triple: AxisTriple) -> Self {
        triple.to_array()
    }
}

impl From<[i32; 3]> for AxisTriple {
    fn from(values: [i32; 3]) -> Self {
        Self::new(values[0], values[1], values[2])
    }
}

/// Most recent [`AxisTriple`], shared between the sampling thread and readers
///
/// Clones share the same cell.
#[derive(Debug, Clone, Default)]
pub struct LatestSnapshot {
    inner: Arc<Mutex<Option<AxisTriple>>>,
}

impl LatestSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot
    pub fn publish(&self, triple: AxisTriple) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(triple);
    }

    /// Copy of the latest triple, `None` before the first sample
    pub fn get(&self) -> Option<AxisTriple> {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Map a bearing in degrees to an 8-point compass label
///
/// # Example
/// ```
/// use adxl345_mux_interface::deg_to_cardinal;
///
/// assert_eq!(deg_to_cardinal(0.0), "N");
/// assert_eq!(deg_to_cardinal(100.0), "E");
/// assert_eq!(deg_to_cardinal(350.0), "N");
/// ```
pub fn deg_to_cardinal(deg: f64) -> &'static str {
    if !deg.is_finite() {
        return NO_DIRECTION;
    }
    let d = deg.rem_euclid(360.0);
    let index = (((d + 22.5) / 45.0).floor() as usize) % COMPASS_POINTS.len();
    COMPASS_POINTS[index]
}

/// One environmental record, produced once per poll cycle
///
/// Any field may be absent when the sensor read failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentalReading {
    /// Local wall-clock time, `%Y-%m-%d %H:%M:%S`
    pub time_local: String,
    pub temp_c: Option<f64>,
    pub hum_pct: Option<f64>,
    /// Normalised to `[0, 360)`
    pub wind_dir_deg: Option<f64>,
    pub wind_dir_txt: String,
    pub wind_spd_ms: Option<f64>,
}

impl EnvironmentalReading {
    /// Build a reading from physical values, deriving the compass label
    pub fn new(
        time: DateTime<Local>,
        temp_c: Option<f64>,
        hum_pct: Option<f64>,
        wind_dir_deg: Option<f64>,
        wind_spd_ms: Option<f64>,
    ) -> Self {
        let wind_dir_deg = wind_dir_deg.map(|d| d.rem_euclid(360.0));
        let wind_dir_txt = wind_dir_deg
            .map(deg_to_cardinal)
            .unwrap_or(NO_DIRECTION)
            .to_string();
        Self {
            time_local: time.format("%Y-%m-%d %H:%M:%S").to_string(),
            temp_c,
            hum_pct,
            wind_dir_deg,
            wind_dir_txt,
            wind_spd_ms,
        }
    }

    /// Reading with every measurement missing
    pub fn absent(time: DateTime<Local>) -> Self {
        Self::new(time, None, None, None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::thread;

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 17, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_axis_triple_serialises_as_array() {
        let json = serde_json::to_string(&AxisTriple::new(1, -2, 3)).unwrap();
        assert_eq!(json, "[1,-2,3]");
    }

    #[test]
    fn test_snapshot_empty_until_published() {
        let snapshot = LatestSnapshot::new();
        assert_eq!(snapshot.get(), None);

        let reader = snapshot.clone();
        snapshot.publish(AxisTriple::new(4, 5, 6));
        assert_eq!(reader.get(), Some(AxisTriple::new(4, 5, 6)));
    }

    #[test]
    fn test_snapshot_is_never_torn() {
        let snapshot = LatestSnapshot::new();
        let writer = snapshot.clone();
        let handle = thread::spawn(move || {
            for i in 0..10_000 {
                writer.publish(AxisTriple::new(i, i, i));
            }
        });
        for _ in 0..10_000 {
            if let Some(t) = snapshot.get() {
                assert!(t.z1 == t.z2 && t.z2 == t.z3);
            }
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_deg_to_cardinal() {
        assert_eq!(deg_to_cardinal(0.0), "N");
        assert_eq!(deg_to_cardinal(22.4), "N");
        assert_eq!(deg_to_cardinal(22.5), "NE");
        assert_eq!(deg_to_cardinal(90.0), "E");
        assert_eq!(deg_to_cardinal(180.0), "S");
        assert_eq!(deg_to_cardinal(247.0), "SW");
        assert_eq!(deg_to_cardinal(337.5), "N");
        assert_eq!(deg_to_cardinal(-90.0), "W");
        assert_eq!(deg_to_cardinal(f64::NAN), "-");
    }

    #[test]
    fn test_reading_normalises_direction() {
        let reading = EnvironmentalReading::new(noon(), Some(23.4), Some(61.0), Some(405.0), Some(3.2));
        assert_eq!(reading.time_local, "2024-05-17 12:00:00");
        assert_eq!(reading.wind_dir_deg, Some(45.0));
        assert_eq!(reading.wind_dir_txt, "NE");
    }

    #[test]
    fn test_absent_reading_serialises_nulls() {
        let reading = EnvironmentalReading::absent(noon());
        let value = serde_json::to_value(&reading).unwrap();
        assert_eq!(value["temp_c"], serde_json::Value::Null);
        assert_eq!(value["wind_dir_txt"], "-");
        assert_eq!(value["time_local"], "2024-05-17 12:00:00");
    }
}
