//! Simulated sensor samples for the demo binary.
//!
//! Produces plausible readings from a handful of sensor types. Readings that
//! fall outside their normal band get a higher priority; vibration sensors
//! can additionally dump a raw waveform file that travels as the sample's
//! related file.

use std::fs;
use std::io;
use std::path::PathBuf;

use rand::Rng;
use serde_json::json;

use crate::sample::Sample;

/// Sensor types for simulated samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorType {
    Temperature,
    Humidity,
    Pressure,
    HeartRate,
    Vibration,
    AirQuality,
}

impl SensorType {
    /// Get all sensor types.
    pub fn all() -> &'static [SensorType] {
        &[
            SensorType::Temperature,
            SensorType::Humidity,
            SensorType::Pressure,
            SensorType::HeartRate,
            SensorType::Vibration,
            SensorType::AirQuality,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            SensorType::Temperature => "temperature",
            SensorType::Humidity => "humidity",
            SensorType::Pressure => "pressure",
            SensorType::HeartRate => "heart_rate",
            SensorType::Vibration => "vibration",
            SensorType::AirQuality => "air_quality",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            SensorType::Temperature => "celsius",
            SensorType::Humidity => "percent",
            SensorType::Pressure => "hpa",
            SensorType::HeartRate => "bpm",
            SensorType::Vibration => "g",
            SensorType::AirQuality => "aqi",
        }
    }

    /// Normal operating band.
    fn normal_range(&self) -> (f64, f64) {
        match self {
            SensorType::Temperature => (18.0, 26.0),
            SensorType::Humidity => (30.0, 70.0),
            SensorType::Pressure => (1000.0, 1025.0),
            SensorType::HeartRate => (55.0, 100.0),
            SensorType::Vibration => (0.0, 0.5),
            SensorType::AirQuality => (0.0, 50.0),
        }
    }
}

/// Configuration for the simulator.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Number of simulated sensors per type
    pub sensors_per_type: usize,

    /// Probability (0.0 - 1.0) that a reading is out of band
    pub anomaly_rate: f64,

    /// Where vibration waveforms are written; none when unset
    pub raw_dir: Option<PathBuf>,

    /// Samples in a dumped waveform
    pub waveform_len: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            sensors_per_type: 3,
            anomaly_rate: 0.05,
            raw_dir: None,
            waveform_len: 256,
        }
    }
}

/// Generator of simulated sensor samples.
#[derive(Debug, Clone)]
pub struct SampleSimulator {
    config: SimulatorConfig,
}

impl SampleSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(SimulatorConfig::default())
    }

    /// Generate a single random sample.
    ///
    /// Fails only when a waveform file cannot be written.
    pub fn generate(&self) -> io::Result<Sample> {
        let mut rng = rand::thread_rng();

        let sensor_types = SensorType::all();
        let sensor = sensor_types[rng.gen_range(0..sensor_types.len())];
        let instance = rng.gen_range(1..=self.config.sensors_per_type.max(1));
        let device_id = format!("{}-{:03}", sensor.name(), instance);

        let anomalous = rng.gen_bool(self.config.anomaly_rate.clamp(0.0, 1.0));
        let (low, high) = sensor.normal_range();
        let reading = if anomalous {
            let span = high - low;
            if rng.gen_bool(0.5) {
                rng.gen_range(high..high + span)
            } else {
                rng.gen_range(low - span..low)
            }
        } else {
            rng.gen_range(low..high)
        };

        let priority = if anomalous { 2 } else { u8::from(rng.gen_bool(0.1)) };
        let payload = json!({
            "sensor_type": sensor.name(),
            "unit": sensor.unit(),
            "reading": (reading * 100.0).round() / 100.0,
            "anomalous": anomalous,
        });

        let mut sample = Sample::new(device_id, priority, payload);
        if rng.gen_bool(0.9) {
            sample = sample.synced();
        }

        if sensor == SensorType::Vibration {
            if let Some(dir) = &self.config.raw_dir {
                let path = dir.join(format!(
                    "{}-{}.raw",
                    sample.device_id, sample.timestamp
                ));
                let waveform: Vec<u8> = (0..self.config.waveform_len)
                    .flat_map(|_| rng.gen_range(-1.0f32..1.0).to_le_bytes())
                    .collect();
                fs::create_dir_all(dir)?;
                fs::write(&path, waveform)?;
                sample = sample.with_related_file(path);
            }
        }

        Ok(sample)
    }

    /// Generate multiple random samples.
    pub fn generate_batch(&self, count: usize) -> io::Result<Vec<Sample>> {
        (0..count).map(|_| self.generate()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sensor_types() {
        assert_eq!(SensorType::all().len(), 6);
        for sensor in SensorType::all() {
            let (low, high) = sensor.normal_range();
            assert!(low < high, "{} has an empty band", sensor.name());
        }
    }

    #[test]
    fn test_generate_sample() {
        let simulator = SampleSimulator::with_defaults();
        let sample = simulator.generate().unwrap();

        assert!(!sample.device_id.is_empty());
        assert!(sample.priority <= 2);
        assert!(sample.payload["reading"].is_number());
        assert!(sample.payload["unit"].is_string());
        assert!(sample.related_file.is_none());
    }

    #[test]
    fn test_anomalies_get_high_priority() {
        let simulator = SampleSimulator::new(SimulatorConfig {
            anomaly_rate: 1.0,
            ..SimulatorConfig::default()
        });

        for sample in simulator.generate_batch(50).unwrap() {
            assert_eq!(sample.priority, 2);
            assert_eq!(sample.payload["anomalous"], true);
        }
    }

    #[test]
    fn test_waveforms_written() {
        let dir = TempDir::new().unwrap();
        let simulator = SampleSimulator::new(SimulatorConfig {
            raw_dir: Some(dir.path().to_path_buf()),
            waveform_len: 16,
            ..SimulatorConfig::default()
        });

        let samples = simulator.generate_batch(200).unwrap();
        let with_files: Vec<_> = samples.iter().filter(|s| s.related_file.is_some()).collect();
        assert!(!with_files.is_empty());

        for sample in with_files {
            assert!(sample.device_id.starts_with("vibration"));
            let path = sample.related_file.as_ref().unwrap();
            assert_eq!(fs::metadata(path).unwrap().len(), 16 * 4);
        }
    }
}
