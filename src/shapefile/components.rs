use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ExtractError, Result, ShapefileErrorCode};

/// The files that make up one shapefile layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapefileLayer {
    pub stem: String,
    pub shp: PathBuf,
    pub shx: PathBuf,
    pub dbf: PathBuf,
    pub prj: PathBuf,
    pub cpg: Option<PathBuf>,
}

/// Extracted files grouped by lower-cased extension, validated once before
/// any decoding starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapefileComponentSet {
    pub layers: Vec<ShapefileLayer>,
}

#[derive(Debug, Default)]
struct Components {
    shp: Option<PathBuf>,
    shx: Option<PathBuf>,
    dbf: Option<PathBuf>,
    prj: Option<PathBuf>,
    cpg: Option<PathBuf>,
}

impl ShapefileComponentSet {
    /// Scan `dir` and check, in order: every layer has `.shp`, `.shx` and
    /// `.dbf`; a `.prj` exists for every layer; no `.prj` is larger than
    /// `max_prj_bytes`.
    ///
    /// Layers pair up by case-insensitive file stem. A layer without its own
    /// `.prj` borrows the archive's only `.prj` when there is exactly one.
    pub fn scan(dir: &Path, max_prj_bytes: u64) -> Result<Self> {
        let by_stem = group_by_stem(dir)
            .map_err(|e| ExtractError::Internal(format!("Failed to parse shapefile: {e}")))?;

        let mut cores = Vec::new();
        for (stem, c) in &by_stem {
            let Some(shp) = &c.shp else { continue };
            match (&c.shx, &c.dbf) {
                (Some(shx), Some(dbf)) => cores.push((stem, c, shp, shx, dbf)),
                (shx, dbf) => {
                    let missing: Vec<&str> = [("shx", shx.is_none()), ("dbf", dbf.is_none())]
                        .into_iter()
                        .filter_map(|(ext, absent)| absent.then_some(ext))
                        .collect();
                    return Err(ExtractError::shapefile(
                        ShapefileErrorCode::MissingCoreFiles,
                        format!("layer '{stem}' is missing .{}", missing.join(", .")),
                    ));
                }
            }
        }
        if cores.is_empty() {
            return Err(ExtractError::shapefile(
                ShapefileErrorCode::MissingCoreFiles,
                "archive contains no .shp file",
            ));
        }

        let all_prj: Vec<&PathBuf> = by_stem.values().filter_map(|c| c.prj.as_ref()).collect();
        let shared_prj = match all_prj.as_slice() {
            [only] => Some(*only),
            _ => None,
        };

        let mut layers = Vec::with_capacity(cores.len());
        for (stem, c, shp, shx, dbf) in cores {
            let prj = c.prj.as_ref().or(shared_prj).ok_or_else(|| {
                ExtractError::shapefile(
                    ShapefileErrorCode::MissingPrjFile,
                    format!("layer '{stem}' has no .prj projection file"),
                )
            })?;
            layers.push(ShapefileLayer {
                stem: stem.clone(),
                shp: shp.clone(),
                shx: shx.clone(),
                dbf: dbf.clone(),
                prj: prj.clone(),
                cpg: c.cpg.clone(),
            });
        }

        for layer in &layers {
            let size = std::fs::metadata(&layer.prj)
                .map_err(|e| ExtractError::Internal(format!("Failed to parse shapefile: {e}")))?
                .len();
            if size > max_prj_bytes {
                return Err(ExtractError::shapefile(
                    ShapefileErrorCode::PrjFileTooLarge,
                    format!("projection file is {size} bytes, limit is {max_prj_bytes}"),
                ));
            }
        }

        debug!(layers = layers.len(), "shapefile components validated");
        Ok(Self { layers })
    }
}

fn group_by_stem(dir: &Path) -> io::Result<BTreeMap<String, Components>> {
    let mut by_stem: BTreeMap<String, Components> = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let (Some(stem), Some(ext)) = (path.file_stem(), path.extension()) else {
            continue;
        };
        let stem = stem.to_string_lossy().to_lowercase();
        let components = by_stem.entry(stem).or_default();
        let slot = match ext.to_string_lossy().to_ascii_lowercase().as_str() {
            "shp" => &mut components.shp,
            "shx" => &mut components.shx,
            "dbf" => &mut components.dbf,
            "prj" => &mut components.prj,
            "cpg" => &mut components.cpg,
            _ => continue,
        };
        slot.get_or_insert(path);
    }
    Ok(by_stem)
}
