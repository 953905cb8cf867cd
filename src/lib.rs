//! # DICOM Loader
//!
//! Retrieval, caching and progressive loading of DICOM instances and volumes
//! from DICOMweb servers over WADO-URI and WADO-RS.
//!
//! ## Features
//!
//! - **Two protocols**: WADO-URI query retrieval and WADO-RS path retrieval,
//!   including frames, rendered frames and DICOM-JSON metadata
//! - **Request coalescing**: concurrent loads of one identifier share a single fetch
//! - **Byte-budgeted cache**: least recently accessed images are evicted first
//! - **Bounded concurrency**: volume, session and prefetch loads share a
//!   priority-ordered limit; interactive loads never queue behind them
//! - **Modality processing**: CT, MR, PET, X-ray, RT dose and multi-frame
//!   handlers derive rescale values and default windows
//! - **Progressive sessions**: chunked dataset loading with sequential,
//!   adaptive and predictive strategies
//!
//! ## Architecture
//!
//! - [`protocol`] - Locators, WADO-URI / WADO-RS clients, retry and auth
//! - [`cache`] - Byte-budgeted image cache
//! - [`dicom`] - Metadata and payload model
//! - [`modality`] - Modality handler registry
//! - [`loader`] - The load coordinator, volumes, prefetch and events
//! - [`progressive`] - Progressive session strategies
//! - [`config`] - Options and CLI
//!
//! ## Example
//!
//! ```rust,no_run
//! use dicom_loader::{LoadCoordinator, LoadOptions, LoaderConfig};
//! use dicom_loader::protocol::WadoRsConfig;
//!
//! #[tokio::main]
//! async fn main() -> dicom_loader::Result<()> {
//!     let loader = LoadCoordinator::new(LoaderConfig {
//!         wado_rs: Some(WadoRsConfig::new("http://localhost:8042/dicom-web")),
//!         ..Default::default()
//!     })?;
//!
//!     let ids = vec![
//!         "wadors:1.2.3/1.2.3.4/1.2.3.4.1".to_string(),
//!         "wadors:1.2.3/1.2.3.4/1.2.3.4.2".to_string(),
//!     ];
//!     let volume = loader.load_volume("chest-ct", ids, LoadOptions::default()).await?;
//!     println!("{} slices", volume.images.len());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod dicom;
pub mod error;
pub mod loader;
pub mod modality;
pub mod progressive;
pub mod protocol;

// Re-export commonly used types
pub use cache::{CacheEntry, CacheStats, ImageCache};
pub use config::{Cli, Command, ConfigUpdate, LoaderConfig};
pub use dicom::{DicomMetadata, ImagePayload, Window};
pub use error::{LoaderError, Result};
pub use loader::{
    LoadCoordinator, LoadCoordinatorBuilder, LoadOptions, LoaderEvent, LoaderHooks, PixelDecoder,
    ProgressState, ProgressStatus, RequestType, VolumeResult,
};
pub use modality::{ModalityHandler, ModalityRegistry};
pub use progressive::{
    DatasetProgress, LoadingStrategy, ProgressiveConfig, SessionHandle, SessionOptions,
    SessionOutcome,
};
pub use protocol::{AuthConfig, Locator, Protocol, ProtocolClient, RenderHints};
