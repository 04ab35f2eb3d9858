//! Zipped shapefile to GeoJSON decoding.
//!
//! The archive is unpacked by the safety extractor into a scratch directory
//! next to the upload, the component set is validated, and each layer's
//! `.shp` and `.dbf` are streamed in lockstep, one record at a time.
//! Geometries are reprojected to WGS84 using the layer's `.prj`.

mod components;
mod dbf;
mod shp;

#[cfg(test)]
pub(crate) mod fixtures;

pub use components::{ShapefileComponentSet, ShapefileLayer};
pub use dbf::{DbfReader, Encoding};
pub use shp::{Shape, ShapeType, ShpReader};

use anyhow::Context;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::DecodeOptions;
use crate::error::{ExtractError, Result};
use crate::geojson::{Feature, FeatureCollection};
use crate::reproject::{CoordinateTransformer, reproject};
use crate::workspace::ScratchWorkspace;
use crate::zip::extract_archive;

const CONTEXT: &str = "Failed to parse shapefile";

/// Decode the zipped shapefile at `zip_path`.
pub async fn parse(zip_path: &Path, options: &DecodeOptions) -> Result<FeatureCollection> {
    let parent = zip_path.parent().unwrap_or(Path::new("."));
    let scratch = ScratchWorkspace::create_scoped(parent, "shapefile")
        .map_err(|e| ExtractError::Internal(format!("{CONTEXT}: {e}")))?;

    let dir = extract_archive(zip_path, scratch.path(), &options.archive).await?;

    let max_prj_bytes = options.max_prj_bytes;
    let collection = tokio::task::spawn_blocking(move || {
        let components = ShapefileComponentSet::scan(&dir, max_prj_bytes)?;
        decode_layers(&components).map_err(|e| ExtractError::from_anyhow(e, CONTEXT))
    })
    .await
    .map_err(|e| ExtractError::Internal(format!("{CONTEXT}: {e}")))??;

    drop(scratch);
    Ok(collection)
}

/// Decode every layer of a validated component set into one collection.
pub fn decode_layers(components: &ShapefileComponentSet) -> anyhow::Result<FeatureCollection> {
    let mut features = Vec::new();
    for layer in &components.layers {
        let before = features.len();
        decode_layer(layer, &mut features).with_context(|| format!("layer '{}'", layer.stem))?;
        info!(layer = %layer.stem, features = features.len() - before, "shapefile layer decoded");
    }
    Ok(FeatureCollection::new(features))
}

fn decode_layer(layer: &ShapefileLayer, features: &mut Vec<Feature>) -> anyhow::Result<()> {
    let prj = std::fs::read(&layer.prj).with_context(|| format!("reading {}", layer.prj.display()))?;
    let transformer = CoordinateTransformer::from_prj(&String::from_utf8_lossy(&prj));
    if let Some(t) = &transformer {
        debug!(layer = %layer.stem, definition = t.definition(), "reprojecting to WGS84");
    }

    let encoding = match &layer.cpg {
        Some(path) => Encoding::from_cpg(&String::from_utf8_lossy(&std::fs::read(path)?)),
        None => Encoding::Auto,
    };

    let mut shp = ShpReader::open(&layer.shp)?;
    let mut dbf = DbfReader::open(&layer.dbf, encoding)?;
    debug!(layer = %layer.stem, shape_type = ?shp.shape_type(), fields = dbf.fields().len(), "reading records");

    let mut attributes_exhausted = false;
    while let Some((number, shape)) = shp.next_record()? {
        let properties = match dbf.next_record()? {
            Some(properties) => properties,
            None => {
                if !attributes_exhausted {
                    warn!(layer = %layer.stem, record = number, "attribute table shorter than geometry file");
                    attributes_exhausted = true;
                }
                Default::default()
            }
        };

        let mut geometry = match shape {
            Shape::Geometry(geometry) => geometry,
            Shape::Empty => {
                warn!(layer = %layer.stem, record = number, "skipping record without geometry");
                continue;
            }
            Shape::Unsupported(kind) => {
                warn!(layer = %layer.stem, record = number, ?kind, "skipping unsupported shape type");
                continue;
            }
        };

        if !geometry.is_finite() {
            warn!(layer = %layer.stem, record = number, "skipping record with non-finite coordinates");
            continue;
        }

        reproject(transformer.as_ref(), &mut geometry)
            .map_err(ExtractError::from)
            .with_context(|| format!("record {number}"))?;
        features.push(Feature::new(Some(geometry), properties));
    }
    Ok(())
}
