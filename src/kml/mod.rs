//! KML to GeoJSON decoding.
//!
//! The document is read as a stream of XML events. Only `Placemark`
//! subtrees are buffered, so memory use tracks the largest placemark rather
//! than the whole document. Custom entities are never expanded: an entity
//! reference that is not one of the five XML built-ins is a malformed
//! document.

use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{ExtractError, Result};
use crate::geojson::{Feature, FeatureCollection, Geometry, Position, Properties};

/// Element nesting accepted before the document is rejected.
const MAX_DEPTH: usize = 256;

const GEOMETRY_ELEMENTS: &[&str] = &["Point", "LineString", "LinearRing", "Polygon", "MultiGeometry"];

/// Decode the KML document at `path`.
pub async fn parse(path: &Path) -> Result<FeatureCollection> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ExtractError::Internal(format!("KML parsing failed: {e}")))?;
    parse_bytes(&bytes)
}

pub fn parse_bytes(bytes: &[u8]) -> Result<FeatureCollection> {
    let text = std::str::from_utf8(bytes).map_err(|e| invalid(e.to_string()))?;
    let collection = parse_document(text).map_err(|Malformed(detail)| invalid(detail))?;
    debug!(features = collection.len(), "KML decoded");
    Ok(collection)
}

fn invalid(detail: String) -> ExtractError {
    warn!(%detail, "rejecting malformed KML");
    ExtractError::BadRequest("invalid KML format".into())
}

struct Malformed(String);

impl From<quick_xml::Error> for Malformed {
    fn from(err: quick_xml::Error) -> Self {
        Malformed(err.to_string())
    }
}

impl From<AttrError> for Malformed {
    fn from(err: AttrError) -> Self {
        Malformed(err.to_string())
    }
}

/// A buffered element inside a placemark.
#[derive(Debug, Default)]
struct Element {
    name: String,
    name_attr: Option<String>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> std::result::Result<Self, Malformed> {
        let mut name_attr = None;
        for attr in start.attributes() {
            let attr = attr?;
            if attr.key.local_name().as_ref() == b"name" {
                name_attr = Some(attr.unescape_value()?.into_owned());
            }
        }
        Ok(Self {
            name: local_name(start),
            name_attr,
            ..Default::default()
        })
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn trimmed_text(&self) -> &str {
        self.text.trim()
    }
}

fn local_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

fn parse_document(text: &str) -> std::result::Result<FeatureCollection, Malformed> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut depth = 0usize;
    let mut seen_root = false;
    let mut open: Vec<Element> = Vec::new();
    let mut features = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Malformed(format!("{e} near byte {}", reader.buffer_position())))?;

        match event {
            Event::Start(start) => {
                if depth == 0 {
                    if seen_root {
                        return Err(Malformed("multiple root elements".into()));
                    }
                    seen_root = true;
                }
                depth += 1;
                if depth > MAX_DEPTH {
                    return Err(Malformed(format!("elements nested deeper than {MAX_DEPTH}")));
                }
                if !open.is_empty() || start.local_name().as_ref() == b"Placemark" {
                    open.push(Element::from_start(&start)?);
                }
            }
            Event::Empty(start) => {
                if depth == 0 {
                    if seen_root {
                        return Err(Malformed("multiple root elements".into()));
                    }
                    seen_root = true;
                }
                if !open.is_empty() || start.local_name().as_ref() == b"Placemark" {
                    close_element(Element::from_start(&start)?, &mut open, &mut features);
                }
            }
            Event::End(_) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| Malformed("unbalanced end tag".into()))?;
                if let Some(element) = open.pop() {
                    if element.name == "coordinates" {
                        check_finite(&element.text)?;
                    }
                    close_element(element, &mut open, &mut features);
                }
            }
            Event::Text(t) => {
                if depth == 0 {
                    return Err(Malformed("text outside the root element".into()));
                }
                let text = t.unescape()?;
                if let Some(element) = open.last_mut() {
                    element.text.push_str(&text);
                }
            }
            Event::CData(c) => {
                if let Some(element) = open.last_mut() {
                    element.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(Malformed("document has no root element".into()));
    }
    if depth != 0 {
        return Err(Malformed("document ends inside an open element".into()));
    }
    Ok(FeatureCollection::new(features))
}

fn close_element(element: Element, open: &mut [Element], features: &mut Vec<Feature>) {
    match open.last_mut() {
        Some(parent) => parent.children.push(element),
        None => features.push(placemark_to_feature(&element)),
    }
}

fn placemark_to_feature(placemark: &Element) -> Feature {
    let mut properties = Properties::new();
    for key in ["name", "description"] {
        if let Some(el) = placemark.child(key) {
            properties.insert(key.to_string(), Value::String(el.trimmed_text().to_string()));
        }
    }
    if let Some(extended) = placemark.child("ExtendedData") {
        extended_data(extended, &mut properties);
    }

    let geometry = placemark
        .children
        .iter()
        .filter(|c| GEOMETRY_ELEMENTS.contains(&c.name.as_str()))
        .find_map(geometry_of);
    if geometry.is_none() {
        debug!(name = ?properties.get("name"), "placemark without geometry");
    }
    Feature::new(geometry, properties)
}

fn extended_data(extended: &Element, properties: &mut Properties) {
    for data in extended.children_named("Data") {
        if let (Some(key), Some(value)) = (&data.name_attr, data.child("value")) {
            properties.insert(key.clone(), Value::String(value.trimmed_text().to_string()));
        }
    }
    for schema_data in extended.children_named("SchemaData") {
        for simple in schema_data.children_named("SimpleData") {
            if let Some(key) = &simple.name_attr {
                properties.insert(key.clone(), Value::String(simple.trimmed_text().to_string()));
            }
        }
    }
}

fn geometry_of(element: &Element) -> Option<Geometry> {
    match element.name.as_str() {
        "Point" => coordinates_of(element)
            .into_iter()
            .next()
            .map(|coordinates| Geometry::Point { coordinates }),
        "LineString" | "LinearRing" => {
            let coordinates = coordinates_of(element);
            (!coordinates.is_empty()).then_some(Geometry::LineString { coordinates })
        }
        "Polygon" => {
            let outer = element
                .child("outerBoundaryIs")
                .and_then(|b| b.child("LinearRing"))
                .map(coordinates_of)
                .filter(|ring| !ring.is_empty())?;
            let mut rings = vec![outer];
            rings.extend(
                element
                    .children_named("innerBoundaryIs")
                    .flat_map(|b| b.children_named("LinearRing"))
                    .map(coordinates_of)
                    .filter(|ring| !ring.is_empty()),
            );
            Some(Geometry::Polygon { coordinates: rings })
        }
        "MultiGeometry" => collapse(element.children.iter().filter_map(geometry_of).collect()),
        _ => None,
    }
}

/// Fold the parts of a `MultiGeometry` into the matching `Multi*` type when
/// they all share one type, else into a `GeometryCollection`.
fn collapse(parts: Vec<Geometry>) -> Option<Geometry> {
    if parts.is_empty() {
        return None;
    }
    if parts.iter().all(|g| matches!(g, Geometry::Point { .. })) {
        let coordinates = parts
            .into_iter()
            .filter_map(|g| match g {
                Geometry::Point { coordinates } => Some(coordinates),
                _ => None,
            })
            .collect();
        return Some(Geometry::MultiPoint { coordinates });
    }
    if parts.iter().all(|g| matches!(g, Geometry::LineString { .. })) {
        let coordinates = parts
            .into_iter()
            .filter_map(|g| match g {
                Geometry::LineString { coordinates } => Some(coordinates),
                _ => None,
            })
            .collect();
        return Some(Geometry::MultiLineString { coordinates });
    }
    if parts.iter().all(|g| matches!(g, Geometry::Polygon { .. })) {
        let coordinates = parts
            .into_iter()
            .filter_map(|g| match g {
                Geometry::Polygon { coordinates } => Some(coordinates),
                _ => None,
            })
            .collect();
        return Some(Geometry::MultiPolygon { coordinates });
    }
    Some(Geometry::GeometryCollection { geometries: parts })
}

fn coordinates_of(element: &Element) -> Vec<Position> {
    element
        .child("coordinates")
        .map(|c| parse_coordinates(&c.text))
        .unwrap_or_default()
}

/// Parse a KML `<coordinates>` body: whitespace-separated `lon,lat[,alt]`
/// tuples. Tuples that do not yield two numbers are dropped.
fn parse_coordinates(text: &str) -> Vec<Position> {
    text.split_whitespace()
        .filter_map(|tuple| {
            let mut parts = tuple.split(',').map(|p| p.trim().parse::<f64>());
            let x = parts.next()?.ok()?;
            let y = parts.next()?.ok()?;
            match parts.next() {
                Some(Ok(z)) => Some(Position::with_z(x, y, z)),
                _ => Some(Position::new(x, y)),
            }
        })
        .collect()
}

/// Reject `nan`, `inf` and overflowing literals such as `1e999`; GeoJSON
/// has no encoding for them.
fn check_finite(text: &str) -> std::result::Result<(), Malformed> {
    let bad = text
        .split_whitespace()
        .flat_map(|tuple| tuple.split(','))
        .filter_map(|part| part.trim().parse::<f64>().ok())
        .any(|value| !value.is_finite());
    if bad {
        return Err(Malformed("non-finite coordinate".into()));
    }
    Ok(())
}
