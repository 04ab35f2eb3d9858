use flate2::CrcWriter;
use flate2::read::DeflateDecoder;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ArchiveSafetyLimits;
use crate::error::ExtractError;
use crate::io::{LocalFileReader, ReadAt};

use super::parser::ZipParser;
use super::structures::{CompressionMethod, ZipFileEntry};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive has more than {limit} entries")]
    TooManyEntries { limit: usize },

    #[error("archive expands past {limit} bytes")]
    TotalSizeExceeded { limit: u64 },

    #[error("entry '{entry}' compression ratio {ratio:.1} exceeds limit of {limit}")]
    CompressionRatioExceeded { entry: String, ratio: f64, limit: f64 },

    #[error("entry '{entry}' uses unsupported compression method {method}")]
    UnsupportedCompression { entry: String, method: u16 },

    #[error("entry '{entry}' is encrypted")]
    Encrypted { entry: String },

    #[error("corrupt archive: {0}")]
    Corrupt(String),

    #[error("failed to write '{path}': {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl From<ArchiveError> for ExtractError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::TotalSizeExceeded { .. } => ExtractError::EntityTooLarge(err.to_string()),
            ArchiveError::Io { .. } => ExtractError::Internal(err.to_string()),
            _ => ExtractError::BadRequest(err.to_string()),
        }
    }
}

/// Summary of a completed extraction.
#[derive(Debug, Default)]
pub struct ExtractionReport {
    pub files: Vec<PathBuf>,
    pub skipped: usize,
    pub bytes_written: u64,
}

/// ZIP extractor that enforces [`ArchiveSafetyLimits`].
///
/// Every entry is checked against the limits before anything is written, so
/// a rejected archive leaves no files behind. Entries are flattened to their
/// base name in the target directory, which neutralizes `..` segments and
/// absolute paths in entry names.
pub struct ZipExtractor<R: ReadAt> {
    parser: ZipParser<R>,
    limits: ArchiveSafetyLimits,
}

impl<R: ReadAt> ZipExtractor<R> {
    pub fn new(reader: Arc<R>, limits: ArchiveSafetyLimits) -> Self {
        Self {
            parser: ZipParser::new(reader),
            limits,
        }
    }

    /// List all entries, refusing archives that declare too many.
    pub async fn list_files(&self) -> Result<Vec<ZipFileEntry>, ArchiveError> {
        let declared = self.parser.declared_entries().await.map_err(corrupt)?;
        if declared > self.limits.max_entries as u64 {
            return Err(ArchiveError::TooManyEntries {
                limit: self.limits.max_entries,
            });
        }
        self.parser.list_files().await.map_err(corrupt)
    }

    /// Validate entry count, cumulative size, and per-entry compression
    /// ratio using the sizes recorded in the Central Directory.
    pub fn check_limits(&self, entries: &[ZipFileEntry]) -> Result<(), ArchiveError> {
        let mut total: u64 = 0;
        for (index, entry) in entries.iter().enumerate() {
            if index + 1 > self.limits.max_entries {
                return Err(ArchiveError::TooManyEntries {
                    limit: self.limits.max_entries,
                });
            }
            if entry.is_directory {
                continue;
            }

            total = total.saturating_add(entry.uncompressed_size);
            if total > self.limits.max_total_bytes {
                return Err(ArchiveError::TotalSizeExceeded {
                    limit: self.limits.max_total_bytes,
                });
            }

            let ratio = entry.compression_ratio();
            if ratio > self.limits.max_compression_ratio {
                return Err(ArchiveError::CompressionRatioExceeded {
                    entry: entry.file_name.clone(),
                    ratio,
                    limit: self.limits.max_compression_ratio,
                });
            }
        }
        Ok(())
    }

    /// Extract every file entry into `target_dir`.
    ///
    /// Directory entries, macOS resource forks, names without a usable base
    /// name, and duplicate base names are skipped. On failure, files written
    /// by this call are removed.
    pub async fn extract_all(&self, target_dir: &Path) -> Result<ExtractionReport, ArchiveError> {
        let entries = self.list_files().await?;
        self.check_limits(&entries)?;

        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|source| ArchiveError::Io {
                path: target_dir.to_path_buf(),
                source,
            })?;

        let mut report = ExtractionReport::default();
        match self.extract_entries(&entries, target_dir, &mut report).await {
            Ok(()) => {
                debug!(
                    files = report.files.len(),
                    skipped = report.skipped,
                    bytes = report.bytes_written,
                    "archive extracted"
                );
                Ok(report)
            }
            Err(e) => {
                for path in &report.files {
                    let _ = tokio::fs::remove_file(path).await;
                }
                Err(e)
            }
        }
    }

    async fn extract_entries(
        &self,
        entries: &[ZipFileEntry],
        target_dir: &Path,
        report: &mut ExtractionReport,
    ) -> Result<(), ArchiveError> {
        for entry in entries {
            if entry.is_directory {
                continue;
            }
            if entry.is_resource_fork() {
                debug!(entry = %entry.file_name, "skipping resource fork");
                report.skipped += 1;
                continue;
            }
            let Some(base_name) = entry.base_name() else {
                warn!(entry = %entry.file_name, "skipping entry without a usable file name");
                report.skipped += 1;
                continue;
            };
            let output_path = target_dir.join(base_name);
            if report.files.contains(&output_path) {
                warn!(entry = %entry.file_name, "skipping entry with duplicate file name");
                report.skipped += 1;
                continue;
            }

            let written = self.extract_to_file(entry, &output_path).await?;
            report.bytes_written += written;
            report.files.push(output_path);

            if report.bytes_written > self.limits.max_total_bytes {
                return Err(ArchiveError::TotalSizeExceeded {
                    limit: self.limits.max_total_bytes,
                });
            }
        }
        Ok(())
    }

    /// Decompress a single entry to `output_path`, which must not exist.
    ///
    /// The output is capped at the entry's declared size and its CRC-32 is
    /// verified, so a header that understates its payload is caught here.
    pub async fn extract_to_file(&self, entry: &ZipFileEntry, output_path: &Path) -> Result<u64, ArchiveError> {
        if entry.is_encrypted() {
            return Err(ArchiveError::Encrypted {
                entry: entry.file_name.clone(),
            });
        }
        let method = entry.compression_method;
        if let CompressionMethod::Unknown(code) = method {
            return Err(ArchiveError::UnsupportedCompression {
                entry: entry.file_name.clone(),
                method: code,
            });
        }

        let data_offset = self.parser.get_data_offset(entry).await.map_err(corrupt)?;
        let mut compressed = vec![0u8; entry.compressed_size as usize];
        self.parser
            .reader()
            .read_exact_at(data_offset, &mut compressed)
            .await
            .map_err(corrupt)?;

        let entry = entry.clone();
        let output_path = output_path.to_path_buf();
        tokio::task::spawn_blocking(move || inflate_to_file(&entry, method, &compressed, &output_path))
            .await
            .map_err(|e| ArchiveError::Corrupt(format!("extraction task failed: {e}")))?
    }
}

fn inflate_to_file(
    entry: &ZipFileEntry,
    method: CompressionMethod,
    compressed: &[u8],
    output_path: &Path,
) -> Result<u64, ArchiveError> {
    let io_err = |source| ArchiveError::Io {
        path: output_path.to_path_buf(),
        source,
    };

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(output_path)
        .map_err(io_err)?;
    let mut writer = CrcWriter::new(BufWriter::new(file));

    let reader: Box<dyn Read + '_> = match method {
        CompressionMethod::Deflate => Box::new(DeflateDecoder::new(compressed)),
        _ => Box::new(compressed),
    };

    let result = io::copy(&mut reader.take(entry.uncompressed_size + 1), &mut writer);
    let written = match result {
        Ok(n) => n,
        // Inflate errors surface as InvalidInput/InvalidData from the decoder.
        Err(e) if matches!(e.kind(), io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData) => {
            let _ = std::fs::remove_file(output_path);
            return Err(ArchiveError::Corrupt(format!("entry '{}': {e}", entry.file_name)));
        }
        Err(e) => return Err(io_err(e)),
    };

    let failure = if written > entry.uncompressed_size {
        Some(format!(
            "entry '{}' expands past its declared size of {} bytes",
            entry.file_name, entry.uncompressed_size
        ))
    } else if written < entry.uncompressed_size {
        Some(format!(
            "entry '{}' is shorter than its declared size of {} bytes",
            entry.file_name, entry.uncompressed_size
        ))
    } else if writer.crc().sum() != entry.crc32 {
        Some(format!("entry '{}' fails its CRC-32 check", entry.file_name))
    } else {
        None
    };
    if let Some(message) = failure {
        drop(writer);
        let _ = std::fs::remove_file(output_path);
        return Err(ArchiveError::Corrupt(message));
    }

    writer.into_inner().flush().map_err(io_err)?;
    Ok(written)
}

fn corrupt(err: anyhow::Error) -> ArchiveError {
    ArchiveError::Corrupt(format!("{err:#}"))
}

/// Unpack the zip archive at `archive_path` into `target_dir` under
/// `limits`, returning the directory holding the extracted files.
pub async fn extract_archive(
    archive_path: &Path,
    target_dir: &Path,
    limits: &ArchiveSafetyLimits,
) -> Result<PathBuf, ArchiveError> {
    let reader = LocalFileReader::new(archive_path).map_err(|e| ArchiveError::Io {
        path: archive_path.to_path_buf(),
        source: e
            .downcast::<io::Error>()
            .unwrap_or_else(|e| io::Error::other(e.to_string())),
    })?;
    let extractor = ZipExtractor::new(Arc::new(reader), *limits);
    extractor.extract_all(target_dir).await?;
    Ok(target_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8], zip::CompressionMethod)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data, method) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, SimpleFileOptions::default()).unwrap();
                continue;
            }
            let options = SimpleFileOptions::default().compression_method(*method);
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn write_archive(dir: &TempDir, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join("upload.zip");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[tokio::test]
    async fn flattens_entries_and_skips_noise() {
        let tmp = TempDir::new().unwrap();
        let archive = write_archive(
            &tmp,
            &build_zip(&[
                ("data/", b"", zip::CompressionMethod::Stored),
                ("data/roads.shp", b"shape bytes", zip::CompressionMethod::Deflated),
                ("../../escape.dbf", b"table", zip::CompressionMethod::Stored),
                ("__MACOSX/data/._roads.shp", b"fork", zip::CompressionMethod::Stored),
                ("other/roads.shp", b"duplicate", zip::CompressionMethod::Stored),
            ]),
        );
        let out = tmp.path().join("out");

        let dir = extract_archive(&archive, &out, &ArchiveSafetyLimits::default())
            .await
            .unwrap();

        assert_eq!(dir, out);
        assert_eq!(listing(&out), vec!["escape.dbf", "roads.shp"]);
        assert_eq!(std::fs::read(out.join("roads.shp")).unwrap(), b"shape bytes");
        assert!(!tmp.path().join("escape.dbf").exists());
    }

    #[tokio::test]
    async fn compression_bomb_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let zeros = vec![0u8; 512 * 1024];
        let archive = write_archive(
            &tmp,
            &build_zip(&[
                ("readme.txt", b"harmless", zip::CompressionMethod::Stored),
                ("bomb.bin", &zeros, zip::CompressionMethod::Deflated),
            ]),
        );
        let out = tmp.path().join("out");

        let err = extract_archive(&archive, &out, &ArchiveSafetyLimits::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::CompressionRatioExceeded { .. }));
        assert!(matches!(ExtractError::from(err), ExtractError::BadRequest(_)));
        assert!(listing(&out).is_empty());
    }

    #[tokio::test]
    async fn entry_count_and_total_size_limits() {
        let tmp = TempDir::new().unwrap();
        let archive = write_archive(
            &tmp,
            &build_zip(&[
                ("a.txt", b"aaaa", zip::CompressionMethod::Stored),
                ("b.txt", b"bbbb", zip::CompressionMethod::Stored),
                ("c.txt", b"cccc", zip::CompressionMethod::Stored),
            ]),
        );

        let few_entries = ArchiveSafetyLimits {
            max_entries: 2,
            ..Default::default()
        };
        let err = extract_archive(&archive, &tmp.path().join("a"), &few_entries)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::TooManyEntries { limit: 2 }));

        let few_bytes = ArchiveSafetyLimits {
            max_total_bytes: 10,
            ..Default::default()
        };
        let err = extract_archive(&archive, &tmp.path().join("b"), &few_bytes)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::TotalSizeExceeded { limit: 10 }));
        assert!(matches!(ExtractError::from(err), ExtractError::EntityTooLarge(_)));
    }

    #[tokio::test]
    async fn corrupted_payload_fails_crc_check() {
        let tmp = TempDir::new().unwrap();
        let mut bytes = build_zip(&[("notes.txt", b"hello world", zip::CompressionMethod::Stored)]);
        let pos = bytes
            .windows(11)
            .position(|w| w == b"hello world")
            .unwrap();
        bytes[pos] = b'j';
        let archive = write_archive(&tmp, &bytes);
        let out = tmp.path().join("out");

        let err = extract_archive(&archive, &out, &ArchiveSafetyLimits::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Corrupt(ref m) if m.contains("CRC")));
        assert!(listing(&out).is_empty());
    }

    #[tokio::test]
    async fn garbage_is_rejected_as_corrupt() {
        let tmp = TempDir::new().unwrap();
        let archive = write_archive(&tmp, b"this is not a zip file at all, sorry");

        let err = extract_archive(&archive, &tmp.path().join("out"), &ArchiveSafetyLimits::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Corrupt(_)));
    }
}
