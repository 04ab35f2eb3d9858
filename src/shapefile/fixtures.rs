//! Minimal shapefile writers for tests.

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};

pub enum ShpShape {
    Null,
    Point(f64, f64),
    PointZ(f64, f64, f64),
    PolyLine(Vec<Vec<(f64, f64)>>),
    Polygon(Vec<Vec<(f64, f64)>>),
}

impl ShpShape {
    fn type_code(&self) -> i32 {
        match self {
            ShpShape::Null => 0,
            ShpShape::Point(..) => 1,
            ShpShape::PointZ(..) => 11,
            ShpShape::PolyLine(_) => 3,
            ShpShape::Polygon(_) => 5,
        }
    }

    fn content(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_i32::<LittleEndian>(self.type_code()).unwrap();
        match self {
            ShpShape::Null => {}
            ShpShape::Point(x, y) => {
                out.write_f64::<LittleEndian>(*x).unwrap();
                out.write_f64::<LittleEndian>(*y).unwrap();
            }
            ShpShape::PointZ(x, y, z) => {
                for v in [*x, *y, *z, 0.0] {
                    out.write_f64::<LittleEndian>(v).unwrap();
                }
            }
            ShpShape::PolyLine(parts) | ShpShape::Polygon(parts) => {
                let points: Vec<(f64, f64)> = parts.iter().flatten().copied().collect();
                for v in bbox(&points) {
                    out.write_f64::<LittleEndian>(v).unwrap();
                }
                out.write_i32::<LittleEndian>(parts.len() as i32).unwrap();
                out.write_i32::<LittleEndian>(points.len() as i32).unwrap();
                let mut start = 0;
                for part in parts {
                    out.write_i32::<LittleEndian>(start).unwrap();
                    start += part.len() as i32;
                }
                for (x, y) in points {
                    out.write_f64::<LittleEndian>(x).unwrap();
                    out.write_f64::<LittleEndian>(y).unwrap();
                }
            }
        }
        out
    }
}

fn bbox(points: &[(f64, f64)]) -> [f64; 4] {
    points.iter().fold(
        [f64::MAX, f64::MAX, f64::MIN, f64::MIN],
        |[x0, y0, x1, y1], &(x, y)| [x0.min(x), y0.min(y), x1.max(x), y1.max(y)],
    )
}

fn header(shape_type: i32, file_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(100);
    out.write_i32::<BigEndian>(9994).unwrap();
    out.extend_from_slice(&[0u8; 20]);
    out.write_i32::<BigEndian>((file_len / 2) as i32).unwrap();
    out.write_i32::<LittleEndian>(1000).unwrap();
    out.write_i32::<LittleEndian>(shape_type).unwrap();
    out.extend_from_slice(&[0u8; 64]);
    out
}

fn layer_type(shapes: &[ShpShape]) -> i32 {
    shapes
        .iter()
        .map(ShpShape::type_code)
        .find(|&code| code != 0)
        .unwrap_or(0)
}

pub fn shp_bytes(shapes: &[ShpShape]) -> Vec<u8> {
    let mut records = Vec::new();
    for (i, shape) in shapes.iter().enumerate() {
        let content = shape.content();
        records.write_i32::<BigEndian>(i as i32 + 1).unwrap();
        records.write_i32::<BigEndian>((content.len() / 2) as i32).unwrap();
        records.extend_from_slice(&content);
    }
    let mut out = header(layer_type(shapes), 100 + records.len());
    out.extend_from_slice(&records);
    out
}

pub fn shx_bytes(shapes: &[ShpShape]) -> Vec<u8> {
    let mut index = Vec::new();
    let mut offset = 100;
    for shape in shapes {
        let len = shape.content().len();
        index.write_i32::<BigEndian>((offset / 2) as i32).unwrap();
        index.write_i32::<BigEndian>((len / 2) as i32).unwrap();
        offset += 8 + len;
    }
    let mut out = header(layer_type(shapes), 100 + index.len());
    out.extend_from_slice(&index);
    out
}

/// `fields` are `(name, type, length, decimals)`; values are space padded.
pub fn dbf_bytes(fields: &[(&str, u8, u8, u8)], records: &[Vec<&[u8]>]) -> Vec<u8> {
    let record_len: usize = 1 + fields.iter().map(|f| f.2 as usize).sum::<usize>();
    let header_len = 32 + fields.len() * 32 + 1;

    let mut out = vec![0x03, 124, 1, 1];
    out.write_u32::<LittleEndian>(records.len() as u32).unwrap();
    out.write_u16::<LittleEndian>(header_len as u16).unwrap();
    out.write_u16::<LittleEndian>(record_len as u16).unwrap();
    out.extend_from_slice(&[0u8; 20]);
    for (name, kind, length, decimals) in fields {
        let mut descriptor = [0u8; 32];
        descriptor[..name.len()].copy_from_slice(name.as_bytes());
        descriptor[11] = *kind;
        descriptor[16] = *length;
        descriptor[17] = *decimals;
        out.extend_from_slice(&descriptor);
    }
    out.push(0x0D);
    for record in records {
        out.push(b' ');
        for ((_, _, length, _), value) in fields.iter().zip(record) {
            let mut cell = value.to_vec();
            cell.resize(*length as usize, b' ');
            out.extend_from_slice(&cell);
        }
    }
    out.push(0x1A);
    out
}
