//! # geoextract
//!
//! Turn uploaded KML documents and zipped shapefiles into validated GeoJSON.
//!
//! Uploads are untrusted, so the pipeline is built around containment:
//!
//! - The source size is checked against a cap before any byte is downloaded
//! - Zip archives are checked for entry count, total size and per-entry
//!   compression ratio before anything is written, and entries are
//!   flattened to their base names
//! - Decoding runs in a separate worker process under a hard deadline and
//!   is killed when the deadline passes
//! - Shapefile coordinates are reprojected to WGS84 from the `.prj` and
//!   checked against the valid longitude/latitude range
//! - The result is validated and capped in serialized size
//! - Each request gets its own scratch directory, removed on every exit path
//!
//! ## Example
//!
//! ```no_run
//! use geoextract::{Extractor, ExtractorConfig, FileKind, LocalBlobStore, ProcessWorker, SourceLocator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = LocalBlobStore::new("/srv/uploads");
//!     let worker = ProcessWorker::new("/usr/local/bin/geoextract");
//!     let extractor = Extractor::new(store, worker, ExtractorConfig::default());
//!
//!     let source = SourceLocator::new("applications", "site-boundary.zip");
//!     let collection = extractor.extract(&source, FileKind::Shapefile).await?;
//!     println!("{} features", collection.len());
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod decode;
pub mod error;
pub mod extract;
pub mod geojson;
pub mod io;
pub mod kml;
pub mod logging;
pub mod reproject;
pub mod shapefile;
pub mod store;
pub mod worker;
pub mod workspace;
pub mod zip;

pub use cli::Cli;
pub use config::{ArchiveSafetyLimits, DecodeOptions, ExtractorConfig};
pub use decode::{FileKind, decode_file};
pub use error::{ErrorKind, ExtractError, ShapefileErrorCode};
pub use extract::{ExtractionRequest, Extractor};
pub use geojson::{Feature, FeatureCollection, Geometry, Position};
pub use logging::init_logging;
pub use reproject::CoordinateTransformer;
pub use store::{BlobStore, HttpBlobStore, LocalBlobStore, ObjectMeta, SourceLocator, StoreError};
pub use worker::{ParseJob, ParseWorker, ProcessWorker, WorkerHandle, WorkerMessage, WorkerOutcome, dispatch, run_job};
pub use workspace::{CleanupHook, ScratchWorkspace};
pub use zip::{ArchiveError, extract_archive};
