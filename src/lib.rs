//! Sample Forwarder Library
//!
//! This library buffers sensor samples on a device and forwards them in
//! batches to a remote endpoint:
//!
//! - **queue** / **worker**: bounded hand-off queue and cancellable background loops
//! - **store**: append-only sample store with a byte quota
//! - **overflow**: strategy chain applied when the store is full
//! - **rate**: adaptive pacing of transmissions
//! - **archive** / **crypto**: ZIP/JAR packaging and optional hybrid encryption
//! - **connection** / **protocol** / **transport**: link selection and upload with retry
//! - **events**: observer channels for pipeline notifications
//! - **pipeline**: wires everything together behind a host-facing handle
//! - **config**: environment-based configuration
//! - **simulator**: simulated sensor samples for testing
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sample_forwarder::config::Config;
//! use sample_forwarder::connection::ManualConnectivity;
//! use sample_forwarder::pipeline::Pipeline;
//! use sample_forwarder::sample::Sample;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let connectivity = Arc::new(ManualConnectivity::default());
//!     let pipeline = Pipeline::new(&config, connectivity).expect("Failed to open store");
//!
//!     pipeline.resume().await;
//!     pipeline
//!         .submit(Sample::new("thermo-001", 0, serde_json::json!({"celsius": 21.5})))
//!         .ok();
//!     pipeline.trigger_transmission();
//!     pipeline.pause().await;
//! }
//! ```

pub mod archive;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod events;
pub mod overflow;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod rate;
pub mod sample;
pub mod simulator;
pub mod store;
pub mod transport;
pub mod worker;

// Re-export commonly used types at crate root for convenience
pub use archive::{Archive, ArchiveBuilder, ArchiveError, CompressionFormat};
pub use config::{Config, ConfigError};
pub use connection::{ConnectionSelection, Connectivity, ManualConnectivity};
pub use crypto::{CryptoError, EncryptionStrategy, KeyPair, PublicKeySource};
pub use events::{EventBus, PipelineEvent};
pub use overflow::{OverflowChain, OverflowChainSpec, OverflowOutcome, OverflowStrategy};
pub use pipeline::{Pipeline, PipelineError, PipelineStatus};
pub use protocol::{HttpProtocol, ProtocolError, ProtocolSettings, UploadProtocol};
pub use queue::{EventQueue, QueueError};
pub use rate::{RateBounds, RateController};
pub use sample::{DeviceMetadata, Sample, SampleBatch};
pub use store::{OrderingPolicy, SampleStore, StoreError, StoreQuota};
pub use transport::{Transport, TransportConfig, TransportError};
pub use worker::{Shutdown, Worker, WorkUnit};
