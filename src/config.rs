//! Process-wide extraction settings.
//!
//! All values are read-only once an [`Extractor`](crate::Extractor) is built.

use std::path::PathBuf;
use std::time::Duration;

/// Largest source object accepted before any byte is downloaded.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;
/// Deadline for the isolated parse worker.
pub const DEFAULT_PARSE_DEADLINE: Duration = Duration::from_secs(30);
/// Ceiling on the serialized size of the decoded GeoJSON.
pub const DEFAULT_MAX_GEOJSON_BYTES: u64 = 500 * 1000 * 1000;
/// Largest accepted `.prj` file, inclusive.
pub const DEFAULT_MAX_PRJ_BYTES: u64 = 50_000;

pub const DEFAULT_MAX_ARCHIVE_ENTRIES: usize = 10_000;
pub const DEFAULT_MAX_ARCHIVE_TOTAL_BYTES: u64 = 1024 * 1024 * 1024;
/// Decompressed/compressed ratio above which an entry is treated as a
/// zip bomb. Attribute tables full of padding routinely reach 50–100x.
pub const DEFAULT_MAX_COMPRESSION_RATIO: f64 = 175.0;

/// Caps applied while unpacking an untrusted zip archive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveSafetyLimits {
    pub max_entries: usize,
    pub max_total_bytes: u64,
    pub max_compression_ratio: f64,
}

impl Default for ArchiveSafetyLimits {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ARCHIVE_ENTRIES,
            max_total_bytes: DEFAULT_MAX_ARCHIVE_TOTAL_BYTES,
            max_compression_ratio: DEFAULT_MAX_COMPRESSION_RATIO,
        }
    }
}

/// Settings the parse worker needs; forwarded to the worker process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeOptions {
    pub archive: ArchiveSafetyLimits,
    pub max_prj_bytes: u64,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            archive: ArchiveSafetyLimits::default(),
            max_prj_bytes: DEFAULT_MAX_PRJ_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub max_upload_bytes: u64,
    pub parse_deadline: Duration,
    pub max_geojson_bytes: u64,
    /// Directory under which per-request scratch workspaces are created.
    pub scratch_root: PathBuf,
    pub decode: DecodeOptions,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            parse_deadline: DEFAULT_PARSE_DEADLINE,
            max_geojson_bytes: DEFAULT_MAX_GEOJSON_BYTES,
            scratch_root: std::env::temp_dir(),
            decode: DecodeOptions::default(),
        }
    }
}

impl ExtractorConfig {
    pub fn max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    pub fn parse_deadline(mut self, deadline: Duration) -> Self {
        self.parse_deadline = deadline;
        self
    }

    pub fn max_geojson_bytes(mut self, bytes: u64) -> Self {
        self.max_geojson_bytes = bytes;
        self
    }

    pub fn scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    pub fn archive_limits(mut self, limits: ArchiveSafetyLimits) -> Self {
        self.decode.archive = limits;
        self
    }

    pub fn max_prj_bytes(mut self, bytes: u64) -> Self {
        self.decode.max_prj_bytes = bytes;
        self
    }
}
