use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{
    ArchiveSafetyLimits, DEFAULT_MAX_ARCHIVE_ENTRIES, DEFAULT_MAX_ARCHIVE_TOTAL_BYTES, DEFAULT_MAX_COMPRESSION_RATIO,
    DEFAULT_MAX_GEOJSON_BYTES, DEFAULT_MAX_PRJ_BYTES, DEFAULT_MAX_UPLOAD_BYTES, DecodeOptions, ExtractorConfig,
};
use crate::decode::FileKind;
use crate::extract::ExtractionRequest;
use crate::store::SourceLocator;

#[derive(Parser, Debug)]
#[command(name = "geoextract")]
#[command(version)]
#[command(about = "Convert uploaded KML or zipped shapefiles into validated GeoJSON", long_about = None)]
#[command(after_help = "Examples:\n  \
  geoextract extract ./store uploads site.kml --kind kml\n  \
  geoextract extract https://blobs.example.com uploads area.zip --kind shapefile -o area.geojson")]
pub struct Cli {
    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count, global = true)]
    pub quiet: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Extract GeoJSON from a stored upload
    Extract(ExtractArgs),

    /// Decode one local file and report a single JSON message on stdout
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Local store root directory or HTTP(S) base URL
    #[arg(value_name = "SOURCE")]
    pub source: String,

    #[arg(value_name = "BUCKET")]
    pub bucket: String,

    #[arg(value_name = "KEY")]
    pub key: String,

    /// Upload format
    #[arg(long, value_enum, ignore_case = true)]
    pub kind: FileKind,

    /// Write GeoJSON to FILE instead of stdout
    #[arg(short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Largest accepted source object
    #[arg(long, env = "GEOEXTRACT_MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: u64,

    /// Largest accepted GeoJSON result
    #[arg(long, env = "GEOEXTRACT_MAX_GEOJSON_BYTES", default_value_t = DEFAULT_MAX_GEOJSON_BYTES)]
    pub max_geojson_bytes: u64,

    /// Parse worker deadline in seconds
    #[arg(long, env = "GEOEXTRACT_PARSE_DEADLINE_SECS", default_value_t = 30)]
    pub parse_deadline_secs: u64,

    /// Directory for per-request scratch workspaces (default: OS temp dir)
    #[arg(long, env = "GEOEXTRACT_SCRATCH_ROOT", value_name = "DIR")]
    pub scratch_root: Option<PathBuf>,

    #[command(flatten)]
    pub decode: DecodeArgs,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    #[arg(long, value_enum)]
    pub kind: FileKind,

    #[command(flatten)]
    pub decode: DecodeArgs,

    #[arg(value_name = "FILE")]
    pub file: PathBuf,
}

/// Decoder limits, shared by `extract` and the worker it spawns.
#[derive(Args, Debug, Clone)]
pub struct DecodeArgs {
    /// Largest accepted .prj file
    #[arg(long, env = "GEOEXTRACT_MAX_PRJ_BYTES", default_value_t = DEFAULT_MAX_PRJ_BYTES)]
    pub max_prj_bytes: u64,

    /// Most entries allowed in a shapefile archive
    #[arg(long, env = "GEOEXTRACT_MAX_ARCHIVE_ENTRIES", default_value_t = DEFAULT_MAX_ARCHIVE_ENTRIES)]
    pub max_archive_entries: usize,

    /// Most decompressed bytes allowed in a shapefile archive
    #[arg(long, env = "GEOEXTRACT_MAX_ARCHIVE_BYTES", default_value_t = DEFAULT_MAX_ARCHIVE_TOTAL_BYTES)]
    pub max_archive_bytes: u64,

    /// Highest per-entry decompressed/compressed ratio
    #[arg(long, env = "GEOEXTRACT_MAX_COMPRESSION_RATIO", default_value_t = DEFAULT_MAX_COMPRESSION_RATIO)]
    pub max_compression_ratio: f64,
}

impl DecodeArgs {
    pub fn options(&self) -> DecodeOptions {
        DecodeOptions {
            archive: ArchiveSafetyLimits {
                max_entries: self.max_archive_entries,
                max_total_bytes: self.max_archive_bytes,
                max_compression_ratio: self.max_compression_ratio,
            },
            max_prj_bytes: self.max_prj_bytes,
        }
    }
}

impl ExtractArgs {
    pub fn is_http_source(&self) -> bool {
        self.source.starts_with("http://") || self.source.starts_with("https://")
    }

    pub fn request(&self) -> ExtractionRequest {
        ExtractionRequest::new(SourceLocator::new(&self.bucket, &self.key), self.kind)
    }

    pub fn config(&self) -> ExtractorConfig {
        let mut config = ExtractorConfig::default()
            .max_upload_bytes(self.max_upload_bytes)
            .max_geojson_bytes(self.max_geojson_bytes)
            .parse_deadline(Duration::from_secs(self.parse_deadline_secs));
        if let Some(root) = &self.scratch_root {
            config = config.scratch_root(root);
        }
        config.decode = self.decode.options();
        config
    }
}
