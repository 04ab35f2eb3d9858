//! Top-level extraction pipeline.
//!
//! `workspace -> head -> download -> isolated parse -> validate`, with the
//! workspace released on every exit path.

use tracing::{Instrument, debug, info, info_span};

use crate::config::ExtractorConfig;
use crate::decode::FileKind;
use crate::error::{ExtractError, Result};
use crate::geojson::{self, FeatureCollection};
use crate::store::{BlobStore, SourceLocator};
use crate::worker::{ParseJob, ParseWorker, dispatch};
use crate::workspace::{CleanupHook, ScratchWorkspace, remove_dir_all_hook};

/// One extraction call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRequest {
    pub source: SourceLocator,
    pub kind: FileKind,
}

impl ExtractionRequest {
    pub fn new(source: SourceLocator, kind: FileKind) -> Self {
        Self { source, kind }
    }
}

/// Turns uploaded KML or zipped shapefiles into validated GeoJSON.
///
/// Requests are independent: the extractor holds only read-only settings
/// and can serve any number of concurrent calls.
pub struct Extractor<S, W> {
    store: S,
    worker: W,
    config: ExtractorConfig,
    cleanup: CleanupHook,
}

impl<S: BlobStore, W: ParseWorker> Extractor<S, W> {
    pub fn new(store: S, worker: W, config: ExtractorConfig) -> Self {
        Self {
            store,
            worker,
            config,
            cleanup: remove_dir_all_hook(),
        }
    }

    /// Replace how scratch workspaces are removed.
    pub fn with_cleanup_hook(mut self, hook: CleanupHook) -> Self {
        self.cleanup = hook;
        self
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    pub async fn extract(&self, source: &SourceLocator, kind: FileKind) -> Result<FeatureCollection> {
        let span = info_span!("extract", bucket = %source.bucket, key = %source.key, kind = %kind);
        self.run(source, kind).instrument(span).await
    }

    pub async fn extract_request(&self, request: &ExtractionRequest) -> Result<FeatureCollection> {
        self.extract(&request.source, request.kind).await
    }

    async fn run(&self, source: &SourceLocator, kind: FileKind) -> Result<FeatureCollection> {
        let workspace = ScratchWorkspace::create(&self.config.scratch_root, "geoextract", self.cleanup.clone())
            .map_err(|e| ExtractError::Internal(format!("failed to allocate scratch workspace: {e}")))?;

        let meta = self.store.head_object(&source.bucket, &source.key).await?;
        if meta.size > self.config.max_upload_bytes {
            return Err(ExtractError::EntityTooLarge(format!(
                "{source} is {} bytes, limit is {}",
                meta.size, self.config.max_upload_bytes
            )));
        }

        let upload = workspace.join(kind.upload_file_name());
        self.store
            .download_object(&source.bucket, &source.key, &upload)
            .await?;
        debug!(bytes = meta.size, path = %upload.display(), "source downloaded");

        let job = ParseJob {
            file_path: upload,
            kind,
            options: self.config.decode,
        };
        let payload = dispatch(&self.worker, &job, self.config.parse_deadline).await?;

        geojson::validate(&payload, self.config.max_geojson_bytes)?;
        let collection = geojson::into_feature_collection(payload)?;
        info!(features = collection.len(), "extraction finished");
        Ok(collection)
    }
}
