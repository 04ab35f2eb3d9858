use serde_json::Value;
use std::io;
use tracing::{debug, warn};

use super::{Feature, FeatureCollection};
use crate::error::{ExtractError, Result};

/// Structural and footprint checks on a decoded GeoJSON artifact.
///
/// Checks run in order: the value is an object, its `type` is `Feature` or
/// `FeatureCollection`, a collection's `features` is an array (an empty one
/// is logged, not rejected), and the serialized size stays within
/// `max_bytes`.
pub fn validate(geojson: &Value, max_bytes: u64) -> Result<()> {
    let object = geojson
        .as_object()
        .ok_or_else(|| ExtractError::Internal("invalid GeoJSON: expected an object".into()))?;

    match object.get("type").and_then(Value::as_str) {
        Some("Feature") => {}
        Some("FeatureCollection") => match object.get("features") {
            Some(Value::Array(features)) if features.is_empty() => {
                warn!("GeoJSON feature collection is empty");
            }
            Some(Value::Array(_)) => {}
            _ => {
                return Err(ExtractError::Internal(
                    "invalid GeoJSON: FeatureCollection.features must be an array".into(),
                ));
            }
        },
        Some(other) => {
            return Err(ExtractError::Internal(format!(
                "invalid GeoJSON: unsupported type {other:?}"
            )));
        }
        None => {
            return Err(ExtractError::Internal("invalid GeoJSON: missing type".into()));
        }
    }

    let size = serialized_len(geojson, max_bytes)?;
    if size > max_bytes {
        return Err(ExtractError::EntityTooLarge(format!(
            "GeoJSON exceeds {max_bytes} bytes"
        )));
    }
    debug!(bytes = size, "GeoJSON validated");
    Ok(())
}

/// Serialized byte length of `value`, counting stops just past `limit`.
pub fn serialized_len(value: &Value, limit: u64) -> Result<u64> {
    let mut counter = ByteCounter { written: 0, limit };
    match serde_json::to_writer(&mut counter, value) {
        Ok(()) => Ok(counter.written),
        Err(_) if counter.written > limit => Ok(counter.written),
        Err(e) => Err(ExtractError::Internal(format!("failed to serialize GeoJSON: {e}"))),
    }
}

/// Convert a validated value into a collection, wrapping a lone feature.
pub fn into_feature_collection(geojson: Value) -> Result<FeatureCollection> {
    let is_feature = geojson.get("type").and_then(Value::as_str) == Some("Feature");
    let parsed = if is_feature {
        serde_json::from_value::<Feature>(geojson).map(|f| FeatureCollection::new(vec![f]))
    } else {
        serde_json::from_value::<FeatureCollection>(geojson)
    };
    parsed.map_err(|e| ExtractError::Internal(format!("invalid GeoJSON: {e}")))
}

struct ByteCounter {
    written: u64,
    limit: u64,
}

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written += buf.len() as u64;
        if self.written > self.limit {
            return Err(io::Error::other("size limit exceeded"));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
