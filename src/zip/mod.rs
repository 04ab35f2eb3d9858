//! ZIP archive parsing and safe extraction.
//!
//! Uploaded shapefiles arrive as ZIP archives from untrusted clients, so this
//! module treats every archive as hostile until proven otherwise.
//!
//! ## Architecture
//!
//! - [`structures`]: Data structures representing ZIP format elements (EOCD, file headers, etc.)
//! - [`parser`]: Low-level parsing of ZIP structures, bounds-checked against the archive size
//! - [`extractor`]: Extraction under [`ArchiveSafetyLimits`](crate::config::ArchiveSafetyLimits)
//!
//! ## ZIP Format Overview
//!
//! A ZIP file consists of:
//! 1. Local file headers and compressed data for each file
//! 2. Central Directory with metadata for all files
//! 3. End of Central Directory (EOCD) record at the end
//!
//! The EOCD is read first, then the Central Directory. All limits are
//! evaluated against the Central Directory before a single byte is
//! decompressed, and decompression itself is capped at each entry's declared
//! size so a lying header cannot smuggle extra output past the checks.
//!
//! ## Supported Features
//!
//! - Standard ZIP format and ZIP64 extensions
//! - STORED and DEFLATE compression methods
//! - CRC-32 verification of every extracted entry
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk archive support
//! - No BZIP2, LZMA, or other compression methods

mod extractor;
mod parser;
mod structures;

pub use extractor::{ArchiveError, ExtractionReport, ZipExtractor, extract_archive};
pub use parser::ZipParser;
pub use structures::*;
