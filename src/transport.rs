//! Packaging and upload of a transmission batch.
//!
//! [`Transport`] bundles the pieces a transmission attempt needs: the archive
//! builder, the encryption strategy, the connection chain and the upload
//! protocol. It is rebuilt from a [`TransportConfig`] on every reconfigure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::archive::{Archive, ArchiveBuilder, ArchiveError, CompressionFormat, Packaged};
use crate::connection::{ConnectionChain, ConnectionSelection, ConnectionStrategy, Connectivity};
use crate::crypto::{CryptoError, EncryptionStrategy, PublicKeySource};
use crate::protocol::{protocol_for_url, ProtocolError, ProtocolSettings, UploadProtocol};
use crate::sample::{DeviceMetadata, Sample};
use crate::worker::Shutdown;

/// Default endpoint receiving archives.
pub const DEFAULT_ENDPOINT_URL: &str = "http://localhost:8000/api/v1/samples/upload";

/// Default lower target for a transmission batch.
pub const DEFAULT_MIN_BATCH_SIZE: u64 = 100;

/// Default upper bound for a transmission batch.
pub const DEFAULT_MAX_BATCH_SIZE: u64 = 1_000;

/// Default minimum spacing between transmission attempts.
pub const DEFAULT_MIN_TRANSFER_INTERVAL: Duration = Duration::from_secs(60);

/// Errors of a transmission attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("archive build failed: {0}")]
    ArchiveBuild(#[from] ArchiveError),

    #[error("encryption failed: {0}")]
    Encryption(#[from] CryptoError),

    #[error("no connection available")]
    ConnectionUnavailable,

    #[error("upload failed: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Settings of the archive/upload stage.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Directory where archives are built
    pub work_dir: PathBuf,
    pub archive_format: CompressionFormat,
    /// Recipient key; encryption is off when unset
    pub public_key: Option<PublicKeySource>,
    pub min_batch_size: u64,
    pub max_batch_size: u64,
    /// Minimum spacing between two transmission attempts
    pub min_transfer_interval: Duration,
    pub endpoint_url: String,
    pub connection: ConnectionSelection,
    pub protocol: ProtocolSettings,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./forwarder-data/outbox"),
            archive_format: CompressionFormat::Zip,
            public_key: None,
            min_batch_size: DEFAULT_MIN_BATCH_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            min_transfer_interval: DEFAULT_MIN_TRANSFER_INTERVAL,
            endpoint_url: DEFAULT_ENDPOINT_URL.to_string(),
            connection: ConnectionSelection::Any,
            protocol: ProtocolSettings::default(),
        }
    }
}

/// Archive, encrypt and upload.
pub struct Transport {
    builder: ArchiveBuilder,
    encryption: EncryptionStrategy,
    connections: ConnectionChain,
    protocol: Arc<dyn UploadProtocol>,
}

impl Transport {
    /// Build the stage described by `config`.
    pub fn new(config: &TransportConfig) -> Self {
        let protocol = protocol_for_url(&config.endpoint_url, &config.protocol);
        Self::with_protocol(config, protocol)
    }

    /// Build the stage with an explicit upload protocol.
    pub fn with_protocol(config: &TransportConfig, protocol: Arc<dyn UploadProtocol>) -> Self {
        Self {
            builder: ArchiveBuilder::new(&config.work_dir, config.archive_format),
            encryption: EncryptionStrategy::from_source(config.public_key.as_ref()),
            connections: ConnectionChain::from_selection(config.connection),
            protocol,
        }
    }

    pub fn builder(&self) -> &ArchiveBuilder {
        &self.builder
    }

    pub fn encryption(&self) -> &EncryptionStrategy {
        &self.encryption
    }

    pub fn connections(&self) -> &ConnectionChain {
        &self.connections
    }

    pub fn protocol_name(&self) -> &'static str {
        self.protocol.name()
    }

    /// Build the archive for `samples` and encrypt it when configured.
    ///
    /// Blocking; run it off the async executor.
    pub fn package(
        &self,
        samples: Vec<Sample>,
        device: &DeviceMetadata,
    ) -> Result<Packaged, TransportError> {
        let packaged = self.builder.create_archive(samples, device)?;
        let archive = self.encryption.encrypt_archive(packaged.archive)?;
        Ok(Packaged {
            archive,
            ..packaged
        })
    }

    /// Upload `archive` over the first available link.
    pub async fn upload(
        &self,
        connectivity: &dyn Connectivity,
        archive: &Archive,
        shutdown: &Shutdown,
    ) -> Result<ConnectionStrategy, TransportError> {
        debug!(
            archive = %archive.file_name(),
            encrypted = archive.encrypted,
            chain = %self.connections,
            "Starting upload"
        );
        self.connections
            .do_work(connectivity, self.protocol.as_ref(), archive, shutdown)
            .await
    }
}
