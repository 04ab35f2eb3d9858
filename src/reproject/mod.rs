//! Coordinate reprojection into WGS84.
//!
//! A [`CoordinateTransformer`] is built from projection text found in a
//! shapefile's `.prj` (WKT, a PROJ string or an `EPSG:n` reference). The
//! absence of a transformer means the coordinates are already WGS84 (or the
//! CRS could not be detected) and are passed through unchanged.

mod wkt;

use proj4rs::proj::Proj;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, trace, warn};

use crate::error::ExtractError;
use crate::geojson::{Geometry, Position};

const WGS84: &str = "+proj=longlat +datum=WGS84 +no_defs";

/// Definitions consulted before the `crs-definitions` database, for codes
/// whose published PROJ string omits the datum shift.
const WELL_KNOWN: &[(u16, &str)] = &[
    (
        27700,
        "+proj=tmerc +lat_0=49 +lon_0=-2 +k=0.9996012717 +x_0=400000 +y_0=-100000 +ellps=airy \
         +towgs84=446.448,-125.157,542.06,0.15,0.247,0.842,-20.489 +units=m +no_defs",
    ),
    (4326, WGS84),
];

/// CRS names that identify a code when the WKT carries no authority.
const NAMED_CRS: &[(&str, u16)] = &[
    ("british_national_grid", 27700),
    ("osgb_1936_british_national_grid", 27700),
    ("osgb36_british_national_grid", 27700),
    ("gcs_wgs_1984", 4326),
    ("wgs_84", 4326),
];

/// Helmert shifts for datums that ESRI WKT names without a `TOWGS84`.
const DATUM_SHIFTS: &[(&str, &str)] = &[
    ("osgb_1936", "446.448,-125.157,542.06,0.15,0.247,0.842,-20.489"),
    ("etrs_1989", "0,0,0"),
    ("european_terrestrial_reference_system_1989", "0,0,0"),
    ("north_american_datum_1983", "0,0,0"),
];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReprojectError {
    #[error("invalid projection definition: {0}")]
    InvalidDefinition(String),

    #[error("unknown EPSG code {0}")]
    UnknownCode(u16),

    #[error("reprojected coordinate ({lon}, {lat}) is outside WGS84 bounds")]
    OutOfRange { lon: f64, lat: f64 },
}

impl From<ReprojectError> for ExtractError {
    fn from(err: ReprojectError) -> Self {
        match err {
            ReprojectError::OutOfRange { .. } => ExtractError::BadRequest(err.to_string()),
            other => ExtractError::Internal(other.to_string()),
        }
    }
}

/// Forward transform from a source CRS to WGS84 longitude/latitude.
pub struct CoordinateTransformer {
    source: Proj,
    target: Proj,
    source_geographic: bool,
    definition: String,
}

impl fmt::Debug for CoordinateTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinateTransformer")
            .field("definition", &self.definition)
            .finish()
    }
}

impl CoordinateTransformer {
    /// Build a transformer from `.prj` text, logging and returning `None`
    /// when the definition cannot be used.
    pub fn from_prj(text: &str) -> Option<Self> {
        match Self::from_definition(text) {
            Ok(transformer) => transformer,
            Err(e) => {
                warn!(error = %e, "unusable projection definition, assuming WGS84 coordinates");
                None
            }
        }
    }

    /// Build a transformer from WKT, a PROJ string or `EPSG:n`.
    ///
    /// Returns `Ok(None)` when the source is already WGS84 geographic.
    pub fn from_definition(text: &str) -> Result<Option<Self>, ReprojectError> {
        let text = text.trim_start_matches('\u{feff}').trim();
        if text.is_empty() {
            return Err(ReprojectError::InvalidDefinition("empty definition".into()));
        }

        if text.starts_with('+') {
            return Self::from_proj_string(text);
        }

        if let Some(code) = text
            .get(..5)
            .filter(|prefix| prefix.eq_ignore_ascii_case("EPSG:"))
            .map(|_| &text[5..])
        {
            let code: u16 = code
                .trim()
                .parse()
                .map_err(|_| ReprojectError::InvalidDefinition(format!("bad EPSG reference {text:?}")))?;
            let proj = resolve_epsg(code).ok_or(ReprojectError::UnknownCode(code))?;
            return Self::from_proj_string(&proj);
        }

        let root = wkt::parse(text).map_err(|e| ReprojectError::InvalidDefinition(format!("{e:#}")))?;
        let code = root.epsg_code().or_else(|| root.name().and_then(named_code));
        if let Some(proj) = code.and_then(resolve_epsg) {
            debug!(code, "resolved projection by authority code");
            return Self::from_proj_string(&proj);
        }

        let proj = wkt_to_proj(&root).map_err(|e| ReprojectError::InvalidDefinition(format!("{e:#}")))?;
        Self::from_proj_string(&proj)
    }

    pub fn from_proj_string(proj: &str) -> Result<Option<Self>, ReprojectError> {
        let params = proj_params(proj);
        if is_wgs84_geographic(&params) {
            debug!(proj, "source CRS is WGS84, no reprojection needed");
            return Ok(None);
        }

        let source = Proj::from_proj_string(proj)
            .map_err(|e| ReprojectError::InvalidDefinition(format!("{proj}: {e:?}")))?;
        let target = Proj::from_proj_string(WGS84)
            .map_err(|e| ReprojectError::InvalidDefinition(format!("{WGS84}: {e:?}")))?;

        Ok(Some(Self {
            source,
            target,
            source_geographic: is_geographic(&params),
            definition: proj.to_string(),
        }))
    }

    /// The PROJ string this transformer was built from.
    pub fn definition(&self) -> &str {
        &self.definition
    }

    /// Transform one position, rejecting results outside WGS84 bounds.
    ///
    /// A transform that fails or yields non-finite values is treated as not
    /// applying and the original position is returned untouched.
    pub fn transform(&self, position: Position) -> Result<Position, ReprojectError> {
        let (x, y) = if self.source_geographic {
            (position.x.to_radians(), position.y.to_radians())
        } else {
            (position.x, position.y)
        };

        let mut point = (x, y, 0.0);
        if let Err(e) = proj4rs::transform::transform(&self.source, &self.target, &mut point) {
            trace!(x = position.x, y = position.y, error = ?e, "transform did not apply");
            return Ok(position);
        }

        guard(position, point.0.to_degrees(), point.1.to_degrees())
    }

    pub fn transform_geometry(&self, geometry: &mut Geometry) -> Result<(), ReprojectError> {
        geometry.try_for_each_position(&mut |p: &mut Position| {
            *p = self.transform(*p)?;
            Ok(())
        })
    }
}

/// Reproject a geometry in place; `None` is the identity transform.
pub fn reproject(
    transformer: Option<&CoordinateTransformer>,
    geometry: &mut Geometry,
) -> Result<(), ReprojectError> {
    match transformer {
        Some(t) => t.transform_geometry(geometry),
        None => Ok(()),
    }
}

/// Range checkpoint for a freshly transformed coordinate.
fn guard(original: Position, lon: f64, lat: f64) -> Result<Position, ReprojectError> {
    if !lon.is_finite() || !lat.is_finite() {
        return Ok(original);
    }
    if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
        return Err(ReprojectError::OutOfRange { lon, lat });
    }
    Ok(Position {
        x: lon,
        y: lat,
        z: original.z,
    })
}

fn resolve_epsg(code: u16) -> Option<String> {
    WELL_KNOWN
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, proj)| proj.to_string())
        .or_else(|| crs_definitions::from_code(code).map(|def| def.proj4.to_string()))
}

fn named_code(name: &str) -> Option<u16> {
    let name = normalize(name);
    NAMED_CRS.iter().find(|(n, _)| *n == name).map(|(_, code)| *code)
}

/// Lowercase, collapse every run of non-alphanumerics to `_`.
fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_end_matches('_').to_string()
}

fn proj_params(proj: &str) -> HashMap<String, String> {
    proj.split_whitespace()
        .filter_map(|token| token.strip_prefix('+'))
        .map(|token| match token.split_once('=') {
            Some((k, v)) => (k.to_ascii_lowercase(), v.to_string()),
            None => (token.to_ascii_lowercase(), String::new()),
        })
        .collect()
}

fn is_geographic(params: &HashMap<String, String>) -> bool {
    params
        .get("proj")
        .is_some_and(|p| matches!(p.as_str(), "longlat" | "latlong" | "lonlat" | "latlon"))
}

fn is_wgs84_geographic(params: &HashMap<String, String>) -> bool {
    let datum_is_wgs84 = params.get("datum").is_some_and(|d| d.eq_ignore_ascii_case("WGS84"))
        || (params.get("ellps").is_some_and(|e| e.eq_ignore_ascii_case("WGS84"))
            && params
                .get("towgs84")
                .is_none_or(|t| t.split(',').all(|v| v.trim().parse::<f64>() == Ok(0.0))));
    let greenwich = params
        .get("pm")
        .is_none_or(|pm| pm.eq_ignore_ascii_case("greenwich") || pm.parse::<f64>() == Ok(0.0));
    is_geographic(params) && datum_is_wgs84 && greenwich
}

fn wkt_to_proj(root: &wkt::Node) -> anyhow::Result<String> {
    let mut parts = Vec::new();

    let geog = if root.is(&["PROJCS", "PROJCRS"]) {
        let geog = root
            .child(&["GEOGCS", "BASEGEOGCRS", "BASEGEODCRS", "GEOGCRS"])
            .ok_or_else(|| anyhow::anyhow!("projected CRS without a geographic base"))?;

        // WKT2 nests the method and its parameters inside CONVERSION.
        let conversion = root.child(&["CONVERSION"]).unwrap_or(root);
        let method = conversion
            .child(&["PROJECTION", "METHOD"])
            .and_then(wkt::Node::name)
            .ok_or_else(|| anyhow::anyhow!("projected CRS without a projection method"))?;
        let proj = projection_name(method)
            .ok_or_else(|| anyhow::anyhow!("unsupported projection {method:?}"))?;
        parts.push(format!("+proj={proj}"));

        let to_meter = root
            .child(&["UNIT", "LENGTHUNIT"])
            .or_else(|| root.find(&["LENGTHUNIT"]))
            .and_then(|u| u.number(0))
            .unwrap_or(1.0);

        for param in conversion.children().filter(|c| c.is(&["PARAMETER"])) {
            let (Some(name), Some(value)) = (param.name(), param.number(0)) else {
                continue;
            };
            match parameter_key(name) {
                Some(key @ ("x_0" | "y_0")) => parts.push(format!("+{key}={}", value * to_meter)),
                Some(key) => parts.push(format!("+{key}={value}")),
                None => debug!(parameter = name, "ignoring unsupported projection parameter"),
            }
        }
        if to_meter != 1.0 {
            parts.push(format!("+to_meter={to_meter}"));
        } else {
            parts.push("+units=m".to_string());
        }
        geog
    } else if root.is(&["GEOGCS", "GEOGCRS", "GEODCRS"]) {
        parts.push("+proj=longlat".to_string());
        root
    } else {
        anyhow::bail!("unsupported WKT root {}", root.keyword);
    };

    parts.extend(datum_params(geog)?);
    parts.push("+no_defs".to_string());
    Ok(parts.join(" "))
}

fn datum_params(geog: &wkt::Node) -> anyhow::Result<Vec<String>> {
    let mut parts = Vec::new();
    let datum = geog.find(&["DATUM", "TRF"]);
    let datum_name = datum.and_then(wkt::Node::name).map(normalize).unwrap_or_default();
    let datum_name = datum_name.strip_prefix("d_").unwrap_or(&datum_name).to_string();
    let towgs84 = geog.find(&["TOWGS84"]).map(|n| {
        n.numbers()
            .iter()
            .map(f64::to_string)
            .collect::<Vec<_>>()
            .join(",")
    });

    let is_wgs84 = matches!(
        datum_name.as_str(),
        "wgs_1984" | "wgs84" | "wgs_84" | "world_geodetic_system_1984"
    );
    if is_wgs84 && towgs84.is_none() {
        parts.push("+datum=WGS84".to_string());
    } else {
        let spheroid = geog
            .find(&["SPHEROID", "ELLIPSOID"])
            .ok_or_else(|| anyhow::anyhow!("datum {datum_name:?} without an ellipsoid"))?;
        let (Some(a), Some(rf)) = (spheroid.number(0), spheroid.number(1)) else {
            anyhow::bail!("ellipsoid without semi-major axis and inverse flattening");
        };
        parts.push(format!("+a={a}"));
        if rf == 0.0 {
            parts.push(format!("+b={a}"));
        } else {
            parts.push(format!("+rf={rf}"));
        }

        let shift = towgs84.or_else(|| {
            DATUM_SHIFTS
                .iter()
                .find(|(name, _)| *name == datum_name)
                .map(|(_, shift)| shift.to_string())
        });
        match shift {
            Some(shift) => parts.push(format!("+towgs84={shift}")),
            None => warn!(datum = %datum_name, "no datum shift known, treating datum as WGS84-aligned"),
        }
    }

    if let Some(pm) = geog.child(&["PRIMEM", "PRIMEMERIDIAN"]).and_then(|n| n.number(0)) {
        if pm != 0.0 {
            parts.push(format!("+pm={pm}"));
        }
    }
    Ok(parts)
}

fn projection_name(method: &str) -> Option<&'static str> {
    let proj = match normalize(method).as_str() {
        "transverse_mercator" | "gauss_kruger" => "tmerc",
        "mercator" | "mercator_1sp" | "mercator_2sp" | "mercator_variant_a" | "mercator_variant_b"
        | "popular_visualisation_pseudo_mercator" => "merc",
        "lambert_conformal_conic"
        | "lambert_conformal_conic_1sp"
        | "lambert_conformal_conic_2sp"
        | "lambert_conic_conformal_1sp"
        | "lambert_conic_conformal_2sp" => "lcc",
        "albers" | "albers_conic_equal_area" | "albers_equal_area" => "aea",
        "polar_stereographic" | "polar_stereographic_variant_a" => "stere",
        "oblique_stereographic" | "double_stereographic" => "sterea",
        "lambert_azimuthal_equal_area" => "laea",
        _ => return None,
    };
    Some(proj)
}

fn parameter_key(name: &str) -> Option<&'static str> {
    let key = match normalize(name).as_str() {
        "latitude_of_origin"
        | "latitude_of_natural_origin"
        | "latitude_of_center"
        | "latitude_of_false_origin"
        | "latitude_of_projection_centre" => "lat_0",
        "central_meridian"
        | "longitude_of_natural_origin"
        | "longitude_of_center"
        | "longitude_of_origin"
        | "longitude_of_false_origin"
        | "longitude_of_projection_centre" => "lon_0",
        "scale_factor" | "scale_factor_at_natural_origin" => "k",
        "false_easting" | "easting_at_false_origin" => "x_0",
        "false_northing" | "northing_at_false_origin" => "y_0",
        "standard_parallel_1" | "latitude_of_1st_standard_parallel" => "lat_1",
        "standard_parallel_2" | "latitude_of_2nd_standard_parallel" => "lat_2",
        _ => return None,
    };
    Some(key)
}
