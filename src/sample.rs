//! Sample records and the batch/metadata envelopes shipped inside archives.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A single sensor reading as handed over by the acquisition layer.
///
/// The payload is opaque to the pipeline; only the device id, timestamp and
/// priority are interpreted (for ordering and eviction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Identifier of the sensor device that produced the reading
    pub device_id: String,

    /// Acquisition time in milliseconds since the Unix epoch
    pub timestamp: i64,

    /// Importance of the sample, 0 being the lowest
    pub priority: u8,

    /// Whether the timestamp was taken from a synchronized clock
    pub time_synced: bool,

    /// Structured reading payload
    pub payload: serde_json::Value,

    /// Optional raw file (recording, image, ...) that belongs to the sample
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_file: Option<PathBuf>,
}

impl Sample {
    /// Create a sample stamped with the current wall-clock time.
    pub fn new(device_id: impl Into<String>, priority: u8, payload: serde_json::Value) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now().timestamp_millis(),
            priority,
            time_synced: false,
            payload,
            related_file: None,
        }
    }

    /// Override the timestamp.
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Mark the timestamp as coming from a synchronized clock.
    pub fn synced(mut self) -> Self {
        self.time_synced = true;
        self
    }

    /// Attach a related raw file.
    pub fn with_related_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.related_file = Some(path.into());
        self
    }

    /// Replace the related file reference with its bare file name.
    ///
    /// Returns the original path so the caller can still read the file.
    pub(crate) fn strip_related_path(&mut self) -> Option<PathBuf> {
        let original = self.related_file.take()?;
        let name = original
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| original.clone());
        self.related_file = Some(name);
        Some(original)
    }
}

/// An ordered group of samples packaged for transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    /// Client-generated batch id, lets the receiver deduplicate retries
    pub batch_id: Uuid,

    /// Creation time in milliseconds since the Unix epoch
    pub created_at: i64,

    /// Samples in the batch
    pub samples: Vec<Sample>,
}

impl SampleBatch {
    /// Create a new batch from a vector of samples.
    pub fn new(samples: Vec<Sample>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            created_at: Utc::now().timestamp_millis(),
            samples,
        }
    }

    /// Get the number of samples in the batch.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Description of the forwarding device, written next to every batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub device_id: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub forwarder_version: String,
    pub generated_at: i64,
}

impl DeviceMetadata {
    /// Collect metadata for the running host.
    pub fn collect(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            hostname: local_hostname(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            forwarder_version: env!("CARGO_PKG_VERSION").to_string(),
            generated_at: Utc::now().timestamp_millis(),
        }
    }

    /// Same device, fresh generation timestamp.
    pub(crate) fn refreshed(&self) -> Self {
        Self {
            generated_at: Utc::now().timestamp_millis(),
            ..self.clone()
        }
    }
}

/// Hostname of the machine, or `"unknown"` when it cannot be read.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// File name component of a path as UTF-8, if any.
pub(crate) fn base_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sample_new() {
        let sample = Sample::new("ecg-01", 2, json!({"hr": 72}));
        assert_eq!(sample.device_id, "ecg-01");
        assert_eq!(sample.priority, 2);
        assert!(!sample.time_synced);
        assert!(sample.related_file.is_none());
        assert!(sample.timestamp > 0);
    }

    #[test]
    fn test_sample_equality_is_structural() {
        let a = Sample::new("dev", 0, json!({"v": 1})).at(1_000);
        let b = Sample::new("dev", 0, json!({"v": 1})).at(1_000);
        assert_eq!(a, b);

        let c = b.clone().synced();
        assert_ne!(a, c);
    }

    #[test]
    fn test_strip_related_path() {
        let mut sample =
            Sample::new("dev", 0, json!(null)).with_related_file("/data/rec/audio-17.wav");

        let original = sample.strip_related_path().unwrap();
        assert_eq!(original, PathBuf::from("/data/rec/audio-17.wav"));
        assert_eq!(sample.related_file, Some(PathBuf::from("audio-17.wav")));
    }

    #[test]
    fn test_strip_related_path_without_file() {
        let mut sample = Sample::new("dev", 0, json!(null));
        assert!(sample.strip_related_path().is_none());
        assert!(sample.related_file.is_none());
    }

    #[test]
    fn test_sample_serialization_skips_missing_file() {
        let sample = Sample::new("dev", 1, json!({"t": 21.5})).at(42);
        let json = serde_json::to_string(&sample).unwrap();
        assert!(!json.contains("related_file"));

        let parsed: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, sample);
    }

    #[test]
    fn test_batch_new() {
        let batch = SampleBatch::new(vec![Sample::new("dev", 0, json!(1))]);
        assert_eq!(batch.len(), 1);
        assert!(!batch.is_empty());
        assert!(batch.created_at > 0);
    }

    #[test]
    fn test_device_metadata_collect() {
        let meta = DeviceMetadata::collect("gateway-7");
        assert_eq!(meta.device_id, "gateway-7");
        assert_eq!(meta.os, std::env::consts::OS);
        assert!(!meta.hostname.is_empty());
        assert_eq!(meta.forwarder_version, env!("CARGO_PKG_VERSION"));
    }
}
