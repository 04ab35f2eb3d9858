//! Streaming reader for the `.shp` geometry file.
//!
//! The 100-byte file header is big-endian; each record has a big-endian
//! 8-byte header followed by little-endian content. Records are read one at
//! a time, and every count read from the file is checked against the
//! record's declared length before anything is allocated.

use anyhow::{Context, Result, bail, ensure};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;

use crate::geojson::{Geometry, Position};

const FILE_CODE: i32 = 9994;
const HEADER_LEN: u64 = 100;
const RECORD_HEADER_LEN: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeType {
    Null,
    Point,
    PolyLine,
    Polygon,
    MultiPoint,
    PointZ,
    PolyLineZ,
    PolygonZ,
    MultiPointZ,
    PointM,
    PolyLineM,
    PolygonM,
    MultiPointM,
    MultiPatch,
}

impl ShapeType {
    pub fn from_i32(code: i32) -> Result<Self> {
        Ok(match code {
            0 => ShapeType::Null,
            1 => ShapeType::Point,
            3 => ShapeType::PolyLine,
            5 => ShapeType::Polygon,
            8 => ShapeType::MultiPoint,
            11 => ShapeType::PointZ,
            13 => ShapeType::PolyLineZ,
            15 => ShapeType::PolygonZ,
            18 => ShapeType::MultiPointZ,
            21 => ShapeType::PointM,
            23 => ShapeType::PolyLineM,
            25 => ShapeType::PolygonM,
            28 => ShapeType::MultiPointM,
            31 => ShapeType::MultiPatch,
            other => bail!("unknown shape type {other}"),
        })
    }

    fn has_z(self) -> bool {
        matches!(
            self,
            ShapeType::PointZ | ShapeType::PolyLineZ | ShapeType::PolygonZ | ShapeType::MultiPointZ
        )
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Geometry(Geometry),
    /// A null shape, or a shape with no points.
    Empty,
    /// A shape type this reader does not convert.
    Unsupported(ShapeType),
}

pub struct ShpReader<R: Read> {
    reader: R,
    shape_type: ShapeType,
    /// Bytes of record data left according to the header's file length.
    remaining: u64,
}

impl ShpReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let actual_len = file.metadata()?.len();
        let reader = Self::new(BufReader::new(file))?;
        ensure!(
            reader.remaining + HEADER_LEN <= actual_len,
            "{} declares {} bytes but holds {}",
            path.display(),
            reader.remaining + HEADER_LEN,
            actual_len
        );
        Ok(reader)
    }
}

impl<R: Read> ShpReader<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let file_code = reader.read_i32::<BigEndian>().context("reading .shp header")?;
        ensure!(file_code == FILE_CODE, "not a shapefile (file code {file_code})");
        let mut unused = [0u8; 20];
        reader.read_exact(&mut unused)?;
        let length_words = reader.read_i32::<BigEndian>()?;
        ensure!(length_words >= 50, "invalid .shp file length {length_words}");
        let _version = reader.read_i32::<LittleEndian>()?;
        let shape_type = ShapeType::from_i32(reader.read_i32::<LittleEndian>()?)?;
        let mut bbox = [0u8; 64];
        reader.read_exact(&mut bbox)?;

        Ok(Self {
            reader,
            shape_type,
            remaining: length_words as u64 * 2 - HEADER_LEN,
        })
    }

    pub fn shape_type(&self) -> ShapeType {
        self.shape_type
    }

    /// Read the next record as `(record_number, shape)`.
    pub fn next_record(&mut self) -> Result<Option<(u32, Shape)>> {
        if self.remaining < RECORD_HEADER_LEN {
            return Ok(None);
        }
        let number = self.reader.read_i32::<BigEndian>()?;
        let content_words = self.reader.read_i32::<BigEndian>()?;
        ensure!(content_words >= 2, "record {number} has invalid length {content_words}");
        let content_len = content_words as u64 * 2;
        ensure!(
            RECORD_HEADER_LEN + content_len <= self.remaining,
            "record {number} runs past the end of the file"
        );
        self.remaining -= RECORD_HEADER_LEN + content_len;

        let mut content = vec![0u8; content_len as usize];
        self.reader
            .read_exact(&mut content)
            .with_context(|| format!("reading record {number}"))?;
        let shape = decode_shape(&content).with_context(|| format!("decoding record {number}"))?;
        Ok(Some((number as u32, shape)))
    }
}

fn decode_shape(content: &[u8]) -> Result<Shape> {
    let mut cursor = Cursor::new(content);
    let shape_type = ShapeType::from_i32(cursor.read_i32::<LittleEndian>()?)?;

    match shape_type {
        ShapeType::Null => Ok(Shape::Empty),
        ShapeType::MultiPatch => Ok(Shape::Unsupported(shape_type)),
        ShapeType::Point | ShapeType::PointM | ShapeType::PointZ => {
            let x = cursor.read_f64::<LittleEndian>()?;
            let y = cursor.read_f64::<LittleEndian>()?;
            let position = if shape_type.has_z() {
                Position::with_z(x, y, cursor.read_f64::<LittleEndian>()?)
            } else {
                Position::new(x, y)
            };
            Ok(Shape::Geometry(Geometry::Point { coordinates: position }))
        }
        ShapeType::MultiPoint | ShapeType::MultiPointM | ShapeType::MultiPointZ => {
            skip(&mut cursor, 32)?;
            let num_points = read_count(&mut cursor, 16)?;
            let points = read_points(&mut cursor, num_points, shape_type.has_z())?;
            if points.is_empty() {
                return Ok(Shape::Empty);
            }
            Ok(Shape::Geometry(Geometry::MultiPoint { coordinates: points }))
        }
        _ => {
            skip(&mut cursor, 32)?;
            let num_parts = read_count(&mut cursor, 4)?;
            let num_points = read_count(&mut cursor, 16)?;
            let mut starts = Vec::with_capacity(num_parts);
            for _ in 0..num_parts {
                let start = cursor.read_i32::<LittleEndian>()?;
                ensure!(
                    start >= 0 && (start as usize) <= num_points,
                    "part index {start} outside {num_points} points"
                );
                starts.push(start as usize);
            }
            ensure!(starts.windows(2).all(|w| w[0] <= w[1]), "part indices are not ascending");

            let points = read_points(&mut cursor, num_points, shape_type.has_z())?;
            let parts: Vec<Vec<Position>> = starts
                .iter()
                .enumerate()
                .map(|(i, &start)| {
                    let end = starts.get(i + 1).copied().unwrap_or(num_points);
                    points[start..end].to_vec()
                })
                .filter(|part| !part.is_empty())
                .collect();

            let geometry = match shape_type {
                ShapeType::PolyLine | ShapeType::PolyLineM | ShapeType::PolyLineZ => lines(parts),
                _ => polygons(parts),
            };
            Ok(geometry.map_or(Shape::Empty, Shape::Geometry))
        }
    }
}

/// Read an element count, refusing counts the remaining content cannot hold.
fn read_count(cursor: &mut Cursor<&[u8]>, element_size: u64) -> Result<usize> {
    let count = cursor.read_i32::<LittleEndian>()?;
    ensure!(count >= 0, "negative count {count}");
    let available = cursor.get_ref().len() as u64 - cursor.position();
    ensure!(
        count as u64 * element_size <= available,
        "count {count} exceeds record content"
    );
    Ok(count as usize)
}

fn read_points(cursor: &mut Cursor<&[u8]>, count: usize, with_z: bool) -> Result<Vec<Position>> {
    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        let x = cursor.read_f64::<LittleEndian>()?;
        let y = cursor.read_f64::<LittleEndian>()?;
        points.push(Position::new(x, y));
    }
    if with_z {
        // Z range, then one Z per point. The M block that may follow is dropped.
        skip(cursor, 16)?;
        for point in &mut points {
            point.z = Some(cursor.read_f64::<LittleEndian>()?);
        }
    }
    Ok(points)
}

fn skip(cursor: &mut Cursor<&[u8]>, n: u64) -> Result<()> {
    let position = cursor.position() + n;
    ensure!(position <= cursor.get_ref().len() as u64, "record content truncated");
    cursor.set_position(position);
    Ok(())
}

fn lines(mut parts: Vec<Vec<Position>>) -> Option<Geometry> {
    match parts.len() {
        0 => None,
        1 => parts.pop().map(|coordinates| Geometry::LineString { coordinates }),
        _ => Some(Geometry::MultiLineString { coordinates: parts }),
    }
}

/// Group rings into polygons. Shapefile exterior rings run clockwise and
/// holes counter-clockwise; each hole joins the first exterior containing
/// it, and a hole with no container is promoted to an exterior.
fn polygons(rings: Vec<Vec<Position>>) -> Option<Geometry> {
    let (exteriors, holes): (Vec<_>, Vec<_>) = rings.into_iter().partition(|r| signed_area(r) <= 0.0);

    let mut polygons: Vec<Vec<Vec<Position>>> = exteriors.into_iter().map(|ring| vec![ring]).collect();
    for hole in holes {
        let container = hole.first().and_then(|sample| {
            polygons
                .iter()
                .position(|polygon| contains(&polygon[0], *sample))
        });
        match container {
            Some(index) => polygons[index].push(hole),
            None => polygons.push(vec![hole]),
        }
    }

    match polygons.len() {
        0 => None,
        1 => polygons.pop().map(|coordinates| Geometry::Polygon { coordinates }),
        _ => Some(Geometry::MultiPolygon { coordinates: polygons }),
    }
}

/// Shoelace area; negative for clockwise rings.
fn signed_area(ring: &[Position]) -> f64 {
    ring.windows(2)
        .map(|w| w[0].x * w[1].y - w[1].x * w[0].y)
        .sum::<f64>()
        / 2.0
}

/// Even-odd point-in-ring test.
fn contains(ring: &[Position], p: Position) -> bool {
    let mut inside = false;
    for w in ring.windows(2) {
        let (a, b) = (w[0], w[1]);
        if (a.y > p.y) != (b.y > p.y) && p.x < (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x {
            inside = !inside;
        }
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapefile::fixtures::{ShpShape, shp_bytes};

    fn square(x0: f64, y0: f64, size: f64, clockwise: bool) -> Vec<(f64, f64)> {
        let mut ring = vec![(x0, y0), (x0 + size, y0), (x0 + size, y0 + size), (x0, y0 + size), (x0, y0)];
        if clockwise {
            ring.reverse();
        }
        ring
    }

    fn read_all(bytes: Vec<u8>) -> Vec<Shape> {
        let mut reader = ShpReader::new(Cursor::new(bytes)).unwrap();
        let mut shapes = Vec::new();
        while let Some((_, shape)) = reader.next_record().unwrap() {
            shapes.push(shape);
        }
        shapes
    }

    #[test]
    fn reads_points_and_null_records() {
        let shapes = read_all(shp_bytes(&[
            ShpShape::Point(513967.0, 476895.0),
            ShpShape::Null,
            ShpShape::Point(1.5, -2.5),
        ]));
        assert_eq!(
            shapes,
            vec![
                Shape::Geometry(Geometry::Point { coordinates: Position::new(513967.0, 476895.0) }),
                Shape::Empty,
                Shape::Geometry(Geometry::Point { coordinates: Position::new(1.5, -2.5) }),
            ]
        );
    }

    #[test]
    fn polyline_parts_become_multilinestring() {
        let shapes = read_all(shp_bytes(&[ShpShape::PolyLine(vec![
            vec![(0.0, 0.0), (1.0, 1.0)],
            vec![(2.0, 2.0), (3.0, 3.0), (4.0, 2.0)],
        ])]));
        let Shape::Geometry(Geometry::MultiLineString { coordinates }) = &shapes[0] else {
            panic!("unexpected {:?}", shapes[0]);
        };
        assert_eq!(coordinates.len(), 2);
        assert_eq!(coordinates[1].len(), 3);
    }

    #[test]
    fn polygon_rings_are_grouped_by_orientation() {
        let shapes = read_all(shp_bytes(&[ShpShape::Polygon(vec![
            square(0.0, 0.0, 10.0, true),
            square(2.0, 2.0, 2.0, false),
            square(20.0, 20.0, 5.0, true),
        ])]));
        let Shape::Geometry(Geometry::MultiPolygon { coordinates }) = &shapes[0] else {
            panic!("unexpected {:?}", shapes[0]);
        };
        assert_eq!(coordinates.len(), 2);
        assert_eq!(coordinates[0].len(), 2, "hole attached to the enclosing exterior");
        assert_eq!(coordinates[1].len(), 1);
    }

    #[test]
    fn single_ring_is_a_polygon_whatever_its_orientation() {
        for clockwise in [true, false] {
            let shapes = read_all(shp_bytes(&[ShpShape::Polygon(vec![square(0.0, 0.0, 1.0, clockwise)])]));
            assert!(matches!(&shapes[0], Shape::Geometry(Geometry::Polygon { coordinates }) if coordinates.len() == 1));
        }
    }

    #[test]
    fn point_z_keeps_elevation() {
        let shapes = read_all(shp_bytes(&[ShpShape::PointZ(1.0, 2.0, 30.0)]));
        assert_eq!(
            shapes[0],
            Shape::Geometry(Geometry::Point { coordinates: Position::with_z(1.0, 2.0, 30.0) })
        );
    }

    #[test]
    fn rejects_bad_headers_and_lying_counts() {
        assert!(ShpReader::new(Cursor::new(vec![0u8; 100])).is_err());

        let mut bytes = shp_bytes(&[ShpShape::PolyLine(vec![vec![(0.0, 0.0), (1.0, 1.0)]])]);
        // numPoints sits after the record header, shape type, bbox and numParts.
        let num_points_at = 100 + 8 + 4 + 32 + 4;
        bytes[num_points_at..num_points_at + 4].copy_from_slice(&1_000_000i32.to_le_bytes());
        let mut reader = ShpReader::new(Cursor::new(bytes)).unwrap();
        assert!(reader.next_record().is_err());
    }

    #[test]
    fn orientation_helpers() {
        let ccw: Vec<Position> = square(0.0, 0.0, 2.0, false).into_iter().map(|(x, y)| Position::new(x, y)).collect();
        assert!(signed_area(&ccw) > 0.0);
        assert!(contains(&ccw, Position::new(1.0, 1.0)));
        assert!(!contains(&ccw, Position::new(3.0, 1.0)));
    }
}
