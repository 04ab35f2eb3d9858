#![allow(dead_code)]

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use geoextract::workspace::CleanupHook;
use geoextract::{Extractor, ExtractorConfig, LocalBlobStore, ProcessWorker};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

pub const BUCKET: &str = "uploads";

pub const BNG_PRJ: &str = r#"PROJCS["British_National_Grid",GEOGCS["GCS_OSGB_1936",DATUM["D_OSGB_1936",SPHEROID["Airy_1849",6377563.396,299.3249646]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]],PROJECTION["Transverse_Mercator"],PARAMETER["False_Easting",400000.0],PARAMETER["False_Northing",-100000.0],PARAMETER["Central_Meridian",-2.0],PARAMETER["Scale_Factor",0.9996012717],PARAMETER["Latitude_Of_Origin",49.0],UNIT["Meter",1.0]]"#;

/// A store root with one bucket, plus a separate scratch root.
pub struct Harness {
    pub store_root: TempDir,
    pub scratch_root: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let store_root = TempDir::new().unwrap();
        std::fs::create_dir(store_root.path().join(BUCKET)).unwrap();
        Self {
            store_root,
            scratch_root: TempDir::new().unwrap(),
        }
    }

    pub fn put(&self, key: &str, data: &[u8]) {
        std::fs::write(self.store_root.path().join(BUCKET).join(key), data).unwrap();
    }

    pub fn config(&self) -> ExtractorConfig {
        ExtractorConfig::default().scratch_root(self.scratch_root.path())
    }

    pub fn extractor(&self) -> Extractor<LocalBlobStore, ProcessWorker> {
        self.extractor_with(self.config())
    }

    pub fn extractor_with(&self, config: ExtractorConfig) -> Extractor<LocalBlobStore, ProcessWorker> {
        Extractor::new(LocalBlobStore::new(self.store_root.path()), worker(), config)
    }

    pub fn scratch_entries(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.scratch_root.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    /// Background cleanup finishes shortly after the response; poll for it.
    pub async fn wait_for_empty_scratch(&self) {
        for _ in 0..200 {
            if self.scratch_entries().is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("scratch root not empty: {:?}", self.scratch_entries());
    }
}

pub fn worker() -> ProcessWorker {
    ProcessWorker::new(env!("CARGO_BIN_EXE_geoextract"))
}

/// A cleanup hook that counts calls per path and optionally fails after
/// removing the directory.
pub fn counting_hook(fail: bool) -> (CleanupHook, Arc<Mutex<Vec<PathBuf>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let record = calls.clone();
    let hook: CleanupHook = Arc::new(move |path: &Path| {
        record.lock().unwrap().push(path.to_path_buf());
        std::fs::remove_dir_all(path)?;
        if fail {
            return Err(std::io::Error::other("injected cleanup failure"));
        }
        Ok(())
    });
    (hook, calls)
}

pub async fn wait_for_calls(calls: &Arc<Mutex<Vec<PathBuf>>>, expected: usize) -> Vec<PathBuf> {
    for _ in 0..200 {
        if calls.lock().unwrap().len() >= expected {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    calls.lock().unwrap().clone()
}

pub fn kml_points(points: &[(f64, f64)]) -> String {
    let mut doc = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><kml xmlns="http://www.opengis.net/kml/2.2"><Document>"#);
    for (i, (lon, lat)) in points.iter().enumerate() {
        doc.push_str(&format!(
            "<Placemark><name>p{i}</name><description>point {i}</description><Point><coordinates>{lon},{lat}</coordinates></Point></Placemark>"
        ));
    }
    doc.push_str("</Document></kml>");
    doc
}

fn shp_header(file_len: usize, shape_type: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(100);
    out.write_i32::<BigEndian>(9994).unwrap();
    out.extend_from_slice(&[0u8; 20]);
    out.write_i32::<BigEndian>((file_len / 2) as i32).unwrap();
    out.write_i32::<LittleEndian>(1000).unwrap();
    out.write_i32::<LittleEndian>(shape_type).unwrap();
    out.extend_from_slice(&[0u8; 64]);
    out
}

/// `.shp` and `.shx` for a layer of plain points.
pub fn point_layer(points: &[(f64, f64)]) -> (Vec<u8>, Vec<u8>) {
    const CONTENT_LEN: usize = 20;
    let mut records = Vec::new();
    let mut index = Vec::new();
    for (i, (x, y)) in points.iter().enumerate() {
        index.write_i32::<BigEndian>(((100 + records.len()) / 2) as i32).unwrap();
        index.write_i32::<BigEndian>((CONTENT_LEN / 2) as i32).unwrap();
        records.write_i32::<BigEndian>(i as i32 + 1).unwrap();
        records.write_i32::<BigEndian>((CONTENT_LEN / 2) as i32).unwrap();
        records.write_i32::<LittleEndian>(1).unwrap();
        records.write_f64::<LittleEndian>(*x).unwrap();
        records.write_f64::<LittleEndian>(*y).unwrap();
    }
    let mut shp = shp_header(100 + records.len(), 1);
    shp.extend_from_slice(&records);
    let mut shx = shp_header(100 + index.len(), 1);
    shx.extend_from_slice(&index);
    (shp, shx)
}

/// A `.dbf` with a single 16-character `NAME` column.
pub fn name_table(names: &[&str]) -> Vec<u8> {
    const WIDTH: usize = 16;
    let mut out = vec![0x03, 124, 1, 1];
    out.write_u32::<LittleEndian>(names.len() as u32).unwrap();
    out.write_u16::<LittleEndian>(65).unwrap();
    out.write_u16::<LittleEndian>(1 + WIDTH as u16).unwrap();
    out.extend_from_slice(&[0u8; 20]);
    let mut descriptor = [0u8; 32];
    descriptor[..4].copy_from_slice(b"NAME");
    descriptor[11] = b'C';
    descriptor[16] = WIDTH as u8;
    out.extend_from_slice(&descriptor);
    out.push(0x0D);
    for name in names {
        out.push(b' ');
        let mut cell = name.as_bytes().to_vec();
        cell.resize(WIDTH, b' ');
        out.extend_from_slice(&cell);
    }
    out.push(0x1A);
    out
}

/// Files of a valid single-layer shapefile named `site`.
pub fn shapefile_parts(points: &[(f64, f64)], prj: &str) -> Vec<(String, Vec<u8>)> {
    let (shp, shx) = point_layer(points);
    let names: Vec<String> = (0..points.len()).map(|i| format!("site {i}")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    vec![
        ("site.shp".to_string(), shp),
        ("site.shx".to_string(), shx),
        ("site.dbf".to_string(), name_table(&names)),
        ("site.prj".to_string(), prj.as_bytes().to_vec()),
    ]
}

pub fn zip_bytes(files: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in files {
        writer.start_file(name.as_str(), SimpleFileOptions::default()).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
