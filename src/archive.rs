//! Batch packaging.
//!
//! An archive is a ZIP (or JAR) container holding:
//!
//! - `samples.json`: the serialized [`SampleBatch`]
//! - `device.json`: the [`DeviceMetadata`] of the forwarding device
//! - every file referenced by a sample, stored under its base name
//!
//! Related file references inside `samples.json` are rewritten to those base
//! names, since paths on the device mean nothing to the receiver.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zip::write::{FileOptions, ZipWriter};
use zip::{CompressionMethod, ZipArchive};

use crate::crypto::ENCRYPTED_EXTENSION;
use crate::sample::{base_name, DeviceMetadata, Sample, SampleBatch};

/// Entry name of the serialized batch.
pub const SAMPLES_ENTRY: &str = "samples.json";

/// Entry name of the device metadata.
pub const DEVICE_ENTRY: &str = "device.json";

const JAR_MANIFEST_ENTRY: &str = "META-INF/MANIFEST.MF";

/// Errors raised while building or reading an archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Every sample was dropped (or none was given)
    #[error("nothing to package ({dropped} samples dropped)")]
    NothingToPackage { dropped: usize },

    #[error("missing archive entry: {0}")]
    MissingEntry(String),
}

/// Container format of the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionFormat {
    #[default]
    Zip,
    /// ZIP with a JAR manifest as first entry
    Jar,
}

impl CompressionFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "zip" => Some(CompressionFormat::Zip),
            "jar" => Some(CompressionFormat::Jar),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            CompressionFormat::Zip => "zip",
            CompressionFormat::Jar => "jar",
        }
    }
}

/// An archive on disk, ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub path: PathBuf,
    pub encrypted: bool,
}

impl Archive {
    pub fn file_name(&self) -> String {
        base_name(&self.path).unwrap_or_else(|| self.path.display().to_string())
    }

    /// Delete the archive file.
    pub fn delete(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Result of packaging a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packaged {
    pub archive: Archive,
    /// Samples written to the archive
    pub packaged: usize,
    /// Samples dropped because their related file is gone
    pub dropped: usize,
}

/// Removes its file on drop unless kept.
struct ScratchFile {
    path: PathBuf,
    keep: bool,
}

impl ScratchFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(mut self) -> PathBuf {
        self.keep = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove scratch file");
            }
        }
    }
}

/// Builds archives inside a dedicated work directory.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    work_dir: PathBuf,
    format: CompressionFormat,
}

impl ArchiveBuilder {
    pub fn new(work_dir: impl Into<PathBuf>, format: CompressionFormat) -> Self {
        Self {
            work_dir: work_dir.into(),
            format,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn format(&self) -> CompressionFormat {
        self.format
    }

    /// Package `samples` and `device` into a new archive.
    ///
    /// Samples whose related file no longer exists are dropped and logged.
    /// Temporary files are removed on every path; a partially written archive
    /// is removed on failure.
    pub fn create_archive(
        &self,
        samples: Vec<Sample>,
        device: &DeviceMetadata,
    ) -> Result<Packaged, ArchiveError> {
        fs::create_dir_all(&self.work_dir)?;

        let (kept, raw_files, dropped) = partition_related_files(samples);
        if kept.is_empty() {
            return Err(ArchiveError::NothingToPackage { dropped });
        }

        let batch = SampleBatch::new(kept);
        let id = Uuid::new_v4();

        let batch_file = ScratchFile::new(self.work_dir.join(format!("batch-{}.json", id)));
        write_json(&batch_file.path, &batch)?;

        let device_file = ScratchFile::new(self.work_dir.join(format!("device-{}.json", id)));
        write_json(&device_file.path, device)?;

        let archive_file = ScratchFile::new(self.work_dir.join(format!(
            "{}-{}-{}.{}",
            sanitize(&device.device_id),
            Utc::now().timestamp_millis(),
            &id.simple().to_string()[..8],
            self.format.extension()
        )));
        self.write_container(&archive_file.path, &batch_file.path, &device_file.path, &raw_files)?;
        let path = archive_file.keep();

        info!(
            path = %path.display(),
            samples = batch.len(),
            files = raw_files.len(),
            dropped,
            "Archive created"
        );

        Ok(Packaged {
            archive: Archive {
                path,
                encrypted: false,
            },
            packaged: batch.len(),
            dropped,
        })
    }

    fn write_container(
        &self,
        target: &Path,
        batch_file: &Path,
        device_file: &Path,
        raw_files: &[(String, PathBuf)],
    ) -> Result<(), ArchiveError> {
        let file = File::create(target)?;
        let mut zip = ZipWriter::new(BufWriter::new(file));

        let options: FileOptions<'_, ()> = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(0o644);

        if self.format == CompressionFormat::Jar {
            zip.start_file(JAR_MANIFEST_ENTRY, options)?;
            zip.write_all(
                format!(
                    "Manifest-Version: 1.0\r\nCreated-By: sample-forwarder {}\r\n\r\n",
                    env!("CARGO_PKG_VERSION")
                )
                .as_bytes(),
            )?;
        }

        zip.start_file(SAMPLES_ENTRY, options)?;
        io::copy(&mut File::open(batch_file)?, &mut zip)?;

        zip.start_file(DEVICE_ENTRY, options)?;
        io::copy(&mut File::open(device_file)?, &mut zip)?;

        for (name, source) in raw_files {
            zip.start_file(name.as_str(), options)?;
            io::copy(&mut File::open(source)?, &mut zip)?;
        }

        let mut writer = zip.finish()?;
        writer.flush()?;
        Ok(())
    }

    /// Delete archives and scratch files left behind by a previous run.
    pub fn cleanup_orphans(&self) -> io::Result<usize> {
        let entries = match fs::read_dir(&self.work_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() || !is_work_file(&path) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    debug!(path = %path.display(), "Removed orphaned archive file");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove orphan"),
            }
        }

        if removed > 0 {
            info!(removed, dir = %self.work_dir.display(), "Cleaned up orphaned archive files");
        }
        Ok(removed)
    }
}

/// Split samples into those that can be packaged and the raw files to add.
fn partition_related_files(samples: Vec<Sample>) -> (Vec<Sample>, Vec<(String, PathBuf)>, usize) {
    let mut kept = Vec::with_capacity(samples.len());
    let mut raw_files: Vec<(String, PathBuf)> = Vec::new();
    let mut names: HashMap<String, PathBuf> = HashMap::new();
    let mut dropped = 0;

    for mut sample in samples {
        let Some(path) = sample.related_file.clone() else {
            kept.push(sample);
            continue;
        };

        let name = match base_name(&path) {
            Some(name) if path.is_file() => name,
            _ => {
                warn!(
                    device_id = %sample.device_id,
                    timestamp = sample.timestamp,
                    path = %path.display(),
                    "Related file missing, dropping sample"
                );
                dropped += 1;
                continue;
            }
        };

        if name == SAMPLES_ENTRY || name == DEVICE_ENTRY || name.starts_with("META-INF") {
            warn!(path = %path.display(), "Related file name clashes with archive entry, dropping sample");
            dropped += 1;
            continue;
        }

        match names.get(&name) {
            Some(existing) if existing != &path => {
                warn!(
                    path = %path.display(),
                    other = %existing.display(),
                    "Two related files share a name, dropping sample"
                );
                dropped += 1;
                continue;
            }
            Some(_) => {}
            None => {
                names.insert(name.clone(), path.clone());
                raw_files.push((name, path));
            }
        }

        sample.strip_related_path();
        kept.push(sample);
    }

    (kept, raw_files, dropped)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), ArchiveError> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

fn sanitize(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "device".to_string()
    } else {
        cleaned
    }
}

fn is_work_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let scratch = (name.starts_with("batch-") || name.starts_with("device-")) && name.ends_with(".json");
    let archive = [
        CompressionFormat::Zip.extension(),
        CompressionFormat::Jar.extension(),
        ENCRYPTED_EXTENSION,
    ]
    .iter()
    .any(|ext| name.ends_with(&format!(".{}", ext)));
    scratch || archive
}

/// Contents of an archive read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedArchive {
    pub batch: SampleBatch,
    pub device: DeviceMetadata,
    /// Raw related files by name
    pub files: BTreeMap<String, Vec<u8>>,
    /// JAR manifest text, if present
    pub manifest: Option<String>,
}

/// Read an (unencrypted) archive.
pub fn open_archive(path: &Path) -> Result<ExtractedArchive, ArchiveError> {
    read_archive(File::open(path)?)
}

/// Read an archive from any seekable source, e.g. decrypted bytes in a cursor.
pub fn read_archive<R: Read + io::Seek>(reader: R) -> Result<ExtractedArchive, ArchiveError> {
    let mut zip = ZipArchive::new(reader)?;
    let mut batch = None;
    let mut device = None;
    let mut manifest = None;
    let mut files = BTreeMap::new();

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let name = entry.name().to_string();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;

        match name.as_str() {
            SAMPLES_ENTRY => batch = Some(serde_json::from_slice(&data)?),
            DEVICE_ENTRY => device = Some(serde_json::from_slice(&data)?),
            JAR_MANIFEST_ENTRY => manifest = Some(String::from_utf8_lossy(&data).into_owned()),
            _ => {
                files.insert(name, data);
            }
        }
    }

    Ok(ExtractedArchive {
        batch: batch.ok_or_else(|| ArchiveError::MissingEntry(SAMPLES_ENTRY.to_string()))?,
        device: device.ok_or_else(|| ArchiveError::MissingEntry(DEVICE_ENTRY.to_string()))?,
        files,
        manifest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn device() -> DeviceMetadata {
        DeviceMetadata::collect("ward-3/bed 2")
    }

    fn only_archives(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    #[test]
    fn test_archive_roundtrip_with_related_files() {
        let work = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();

        let wav = data.path().join("rec-1.wav");
        fs::write(&wav, b"RIFF....WAVE").unwrap();
        let png = data.path().join("snap.png");
        fs::write(&png, b"\x89PNG").unwrap();

        let samples = vec![
            Sample::new("ecg", 1, json!({"hr": 70})).at(1),
            Sample::new("mic", 0, json!({"db": 40})).at(2).with_related_file(&wav),
            Sample::new("cam", 2, json!(null)).at(3).with_related_file(&png),
            Sample::new("mic", 0, json!({"db": 41}))
                .at(4)
                .with_related_file(data.path().join("gone.wav")),
        ];

        let builder = ArchiveBuilder::new(work.path(), CompressionFormat::Zip);
        let packaged = builder.create_archive(samples.clone(), &device()).unwrap();
        assert_eq!(packaged.packaged, 3);
        assert_eq!(packaged.dropped, 1);
        assert!(!packaged.archive.encrypted);
        assert_eq!(packaged.archive.path.extension().unwrap(), "zip");

        // Only the archive itself is left in the work directory.
        assert_eq!(only_archives(work.path()), vec![packaged.archive.path.clone()]);

        let extracted = open_archive(&packaged.archive.path).unwrap();
        assert_eq!(extracted.batch.len(), 3);
        assert_eq!(extracted.device, device_with_time(&extracted.device));
        assert_eq!(extracted.files["rec-1.wav"], b"RIFF....WAVE");
        assert_eq!(extracted.files["snap.png"], b"\x89PNG");
        assert!(extracted.manifest.is_none());

        let mut expected: Vec<Sample> = samples[..3].to_vec();
        expected[1].related_file = Some(PathBuf::from("rec-1.wav"));
        expected[2].related_file = Some(PathBuf::from("snap.png"));
        assert_eq!(extracted.batch.samples, expected);
    }

    fn device_with_time(read: &DeviceMetadata) -> DeviceMetadata {
        DeviceMetadata {
            generated_at: read.generated_at,
            ..device()
        }
    }

    #[test]
    fn test_jar_has_manifest_first() {
        let work = TempDir::new().unwrap();
        let builder = ArchiveBuilder::new(work.path(), CompressionFormat::Jar);
        let packaged = builder
            .create_archive(vec![Sample::new("d", 0, json!(1))], &device())
            .unwrap();
        assert_eq!(packaged.archive.path.extension().unwrap(), "jar");

        let mut zip = ZipArchive::new(File::open(&packaged.archive.path).unwrap()).unwrap();
        assert_eq!(zip.by_index(0).unwrap().name(), JAR_MANIFEST_ENTRY);

        let extracted = open_archive(&packaged.archive.path).unwrap();
        assert!(extracted.manifest.unwrap().starts_with("Manifest-Version: 1.0"));
    }

    #[test]
    fn test_all_samples_missing_files() {
        let work = TempDir::new().unwrap();
        let builder = ArchiveBuilder::new(work.path(), CompressionFormat::Zip);
        let samples = vec![Sample::new("d", 0, json!(1)).with_related_file("/nonexistent/x.bin")];

        let err = builder.create_archive(samples, &device()).unwrap_err();
        assert!(matches!(err, ArchiveError::NothingToPackage { dropped: 1 }));
        assert!(only_archives(work.path()).is_empty());
    }

    #[test]
    fn test_empty_batch_rejected() {
        let work = TempDir::new().unwrap();
        let builder = ArchiveBuilder::new(work.path(), CompressionFormat::Zip);
        assert!(matches!(
            builder.create_archive(Vec::new(), &device()),
            Err(ArchiveError::NothingToPackage { dropped: 0 })
        ));
    }

    #[test]
    fn test_shared_related_file_added_once() {
        let work = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let shared = data.path().join("shared.bin");
        fs::write(&shared, b"abc").unwrap();

        let samples = vec![
            Sample::new("d", 0, json!(1)).at(1).with_related_file(&shared),
            Sample::new("d", 0, json!(2)).at(2).with_related_file(&shared),
        ];
        let builder = ArchiveBuilder::new(work.path(), CompressionFormat::Zip);
        let packaged = builder.create_archive(samples, &device()).unwrap();
        assert_eq!(packaged.packaged, 2);

        let extracted = open_archive(&packaged.archive.path).unwrap();
        assert_eq!(extracted.files.len(), 1);
    }

    #[test]
    fn test_clashing_related_names_drop_sample() {
        let work = TempDir::new().unwrap();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::write(a.path().join("x.bin"), b"a").unwrap();
        fs::write(b.path().join("x.bin"), b"b").unwrap();

        let samples = vec![
            Sample::new("d", 0, json!(1)).with_related_file(a.path().join("x.bin")),
            Sample::new("d", 0, json!(2)).with_related_file(b.path().join("x.bin")),
        ];
        let builder = ArchiveBuilder::new(work.path(), CompressionFormat::Zip);
        let packaged = builder.create_archive(samples, &device()).unwrap();
        assert_eq!(packaged.packaged, 1);
        assert_eq!(packaged.dropped, 1);
    }

    #[test]
    fn test_failure_leaves_no_partial_artifacts() {
        let work = TempDir::new().unwrap();
        let blocker = work.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();

        // The work directory cannot be created below a regular file.
        let builder = ArchiveBuilder::new(blocker.join("out"), CompressionFormat::Zip);
        assert!(builder
            .create_archive(vec![Sample::new("d", 0, json!(1))], &device())
            .is_err());
        assert_eq!(only_archives(work.path()), vec![blocker]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_entry_write_removes_archive_and_scratch() {
        let work = TempDir::new().unwrap();
        let builder = ArchiveBuilder::new(work.path(), CompressionFormat::Zip);

        // A regular file that fails on read, after the JSON entries are written.
        let samples = vec![
            Sample::new("d", 0, json!(1)),
            Sample::new("d", 0, json!(2)).with_related_file("/proc/self/mem"),
        ];

        let result = builder.create_archive(samples, &device());
        assert!(matches!(result, Err(ArchiveError::Io(_))));
        assert!(only_archives(work.path()).is_empty());
    }

    #[test]
    fn test_cleanup_orphans() {
        let work = TempDir::new().unwrap();
        fs::write(work.path().join("a.zip"), b"").unwrap();
        fs::write(work.path().join("b.jar.enc"), b"").unwrap();
        fs::write(work.path().join("batch-123.json"), b"").unwrap();
        fs::write(work.path().join("keep.txt"), b"").unwrap();

        let builder = ArchiveBuilder::new(work.path(), CompressionFormat::Zip);
        assert_eq!(builder.cleanup_orphans().unwrap(), 3);
        assert_eq!(only_archives(work.path()), vec![work.path().join("keep.txt")]);
    }

    #[test]
    fn test_cleanup_missing_dir() {
        let builder = ArchiveBuilder::new("/nonexistent/forwarder/outbox", CompressionFormat::Zip);
        assert_eq!(builder.cleanup_orphans().unwrap(), 0);
    }

    #[test]
    fn test_format_from_name() {
        assert_eq!(CompressionFormat::from_name("ZIP"), Some(CompressionFormat::Zip));
        assert_eq!(CompressionFormat::from_name(" jar "), Some(CompressionFormat::Jar));
        assert_eq!(CompressionFormat::from_name("tar"), None);
    }

    #[test]
    fn test_sanitize_device_id() {
        assert_eq!(sanitize("ward-3/bed 2"), "ward-3_bed_2");
        assert_eq!(sanitize(""), "device");
    }
}
