//! Decoder dispatch by file kind.

use std::fmt;
use std::path::Path;

use crate::config::DecodeOptions;
use crate::error::Result;
use crate::geojson::FeatureCollection;
use crate::{kml, shapefile};

/// Upload formats the pipeline can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum FileKind {
    Kml,
    Shapefile,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Kml => "kml",
            FileKind::Shapefile => "shapefile",
        }
    }

    /// Name given to the downloaded copy inside the scratch workspace.
    pub fn upload_file_name(&self) -> &'static str {
        match self {
            FileKind::Kml => "upload.kml",
            FileKind::Shapefile => "upload.zip",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run the decoder for `kind` on the file at `path`.
pub async fn decode_file(kind: FileKind, path: &Path, options: &DecodeOptions) -> Result<FeatureCollection> {
    match kind {
        FileKind::Kml => kml::parse(path).await,
        FileKind::Shapefile => shapefile::parse(path, options).await,
    }
}
