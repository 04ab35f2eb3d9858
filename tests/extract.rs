mod common;

use async_trait::async_trait;
use common::*;
use geoextract::geojson::Geometry;
use geoextract::{
    ErrorKind, ExtractError, Extractor, FileKind, LocalBlobStore, ParseJob, ParseWorker, ProcessWorker,
    ShapefileErrorCode, SourceLocator, WorkerHandle, WorkerOutcome,
};
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use zip::write::SimpleFileOptions;

fn source(key: &str) -> SourceLocator {
    SourceLocator::new(BUCKET, key)
}

#[tokio::test]
async fn kml_placemarks_round_trip() {
    let harness = Harness::new();
    let points: Vec<(f64, f64)> = (0..25)
        .map(|i| (-3.123456789 + i as f64 * 0.01, 51.987654321 - i as f64 * 0.01))
        .collect();
    harness.put("site.kml", kml_points(&points).as_bytes());

    let collection = harness
        .extractor()
        .extract(&source("site.kml"), FileKind::Kml)
        .await
        .unwrap();

    assert_eq!(collection.len(), points.len());
    for (feature, (lon, lat)) in collection.features.iter().zip(&points) {
        let Some(Geometry::Point { coordinates }) = &feature.geometry else {
            panic!("expected a point, got {:?}", feature.geometry);
        };
        assert_eq!((coordinates.x, coordinates.y), (*lon, *lat));
    }
    assert_eq!(collection.features[3].properties["name"], "p3");
    assert_eq!(collection.features[3].properties["description"], "point 3");
    harness.wait_for_empty_scratch().await;
}

#[tokio::test]
async fn malformed_kml_is_bad_request() {
    let harness = Harness::new();
    harness.put("broken.kml", b"<kml><Document><Placemark></Document></kml>");

    let err = harness
        .extractor()
        .extract(&source("broken.kml"), FileKind::Kml)
        .await
        .unwrap_err();
    assert_eq!(err, ExtractError::BadRequest("invalid KML format".into()));
    harness.wait_for_empty_scratch().await;
}

#[tokio::test]
async fn shapefile_is_reprojected_from_british_national_grid() {
    let harness = Harness::new();
    let archive = zip_bytes(&shapefile_parts(&[(513967.0, 476895.0)], BNG_PRJ));
    harness.put("site.zip", &archive);

    let collection = harness
        .extractor()
        .extract(&source("site.zip"), FileKind::Shapefile)
        .await
        .unwrap();

    assert_eq!(collection.len(), 1);
    let feature = &collection.features[0];
    let Some(Geometry::Point { coordinates }) = &feature.geometry else {
        panic!("expected a point, got {:?}", feature.geometry);
    };
    assert!((coordinates.x - -0.2555).abs() < 1e-4, "lon {}", coordinates.x);
    assert!((coordinates.y - 54.1752).abs() < 1e-4, "lat {}", coordinates.y);
    assert_eq!(feature.properties["NAME"], "site 0");
    harness.wait_for_empty_scratch().await;
}

#[tokio::test]
async fn non_finite_kml_coordinates_are_bad_requests() {
    let harness = Harness::new();
    harness.put("nan.kml", kml_points(&[(f64::NAN, 51.5)]).as_bytes());

    let err = harness
        .extractor()
        .extract(&source("nan.kml"), FileKind::Kml)
        .await
        .unwrap_err();
    assert_eq!(err, ExtractError::BadRequest("invalid KML format".into()));
    harness.wait_for_empty_scratch().await;
}

#[tokio::test]
async fn reprojection_outside_wgs84_bounds_is_bad_request() {
    let harness = Harness::new();
    // Geographic with no datum: longitude passes through unwrapped.
    let prj = "+proj=longlat +ellps=intl +no_defs";
    harness.put("wide.zip", &zip_bytes(&shapefile_parts(&[(200.0, 10.0)], prj)));

    let err = harness
        .extractor()
        .extract(&source("wide.zip"), FileKind::Shapefile)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
    assert!(err.to_string().contains("outside WGS84 bounds"), "{err}");
    harness.wait_for_empty_scratch().await;
}

#[tokio::test]
async fn missing_components_yield_domain_codes() {
    let harness = Harness::new();
    let parts = shapefile_parts(&[(513967.0, 476895.0)], BNG_PRJ);

    for (removed, expected) in [
        ("site.shp", ShapefileErrorCode::MissingCoreFiles),
        ("site.shx", ShapefileErrorCode::MissingCoreFiles),
        ("site.dbf", ShapefileErrorCode::MissingCoreFiles),
        ("site.prj", ShapefileErrorCode::MissingPrjFile),
    ] {
        let remaining: Vec<_> = parts.iter().filter(|(name, _)| name != removed).cloned().collect();
        let key = format!("without-{removed}.zip");
        harness.put(&key, &zip_bytes(&remaining));

        let err = harness
            .extractor()
            .extract(&source(&key), FileKind::Shapefile)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest, "{removed}: {err}");
        assert_eq!(err.shapefile_code(), Some(expected), "{removed}: {err}");
    }
}

#[tokio::test]
async fn prj_size_cap_is_inclusive() {
    let harness = Harness::new();

    let at_limit = format!("{BNG_PRJ:<50000}");
    assert_eq!(at_limit.len(), 50_000);
    harness.put("at-limit.zip", &zip_bytes(&shapefile_parts(&[(513967.0, 476895.0)], &at_limit)));
    let collection = harness
        .extractor()
        .extract(&source("at-limit.zip"), FileKind::Shapefile)
        .await
        .unwrap();
    assert_eq!(collection.len(), 1);

    let over_limit = format!("{BNG_PRJ:<50001}");
    harness.put("over-limit.zip", &zip_bytes(&shapefile_parts(&[(513967.0, 476895.0)], &over_limit)));
    let err = harness
        .extractor()
        .extract(&source("over-limit.zip"), FileKind::Shapefile)
        .await
        .unwrap_err();
    assert_eq!(err.shapefile_code(), Some(ShapefileErrorCode::PrjFileTooLarge));
}

#[tokio::test]
async fn multiple_layers_are_concatenated() {
    let harness = Harness::new();
    let mut files = shapefile_parts(&[(513967.0, 476895.0)], BNG_PRJ);
    let (shp, shx) = point_layer(&[(400000.0, 300000.0), (410000.0, 310000.0)]);
    files.push(("roads/roads.shp".into(), shp));
    files.push(("roads/roads.shx".into(), shx));
    files.push(("roads/roads.dbf".into(), name_table(&["a", "b"])));
    files.push(("roads/roads.prj".into(), BNG_PRJ.as_bytes().to_vec()));
    harness.put("layers.zip", &zip_bytes(&files));

    let collection = harness
        .extractor()
        .extract(&source("layers.zip"), FileKind::Shapefile)
        .await
        .unwrap();
    assert_eq!(collection.len(), 3);
}

#[tokio::test]
async fn zip_bomb_is_rejected() {
    let harness = Harness::new();
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file("site.dbf", SimpleFileOptions::default()).unwrap();
    writer.write_all(&vec![0u8; 4 * 1024 * 1024]).unwrap();
    harness.put("bomb.zip", &writer.finish().unwrap().into_inner());

    let err = harness
        .extractor()
        .extract(&source("bomb.zip"), FileKind::Shapefile)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest, "{err}");
    assert!(err.message().contains("compression ratio"), "{err}");
    harness.wait_for_empty_scratch().await;
}

#[tokio::test]
async fn oversized_upload_is_rejected_before_download() {
    let harness = Harness::new();
    harness.put("big.kml", kml_points(&[(1.0, 2.0)]).as_bytes());

    let extractor = harness.extractor_with(harness.config().max_upload_bytes(10));
    let err = extractor
        .extract(&source("big.kml"), FileKind::Kml)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EntityTooLarge);
    harness.wait_for_empty_scratch().await;
}

#[tokio::test]
async fn oversized_geojson_is_rejected() {
    let harness = Harness::new();
    harness.put("many.kml", kml_points(&[(1.0, 2.0); 50]).as_bytes());

    let extractor = harness.extractor_with(harness.config().max_geojson_bytes(512));
    let err = extractor
        .extract(&source("many.kml"), FileKind::Kml)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EntityTooLarge);
}

#[tokio::test]
async fn missing_object_is_not_found() {
    let harness = Harness::new();
    let err = harness
        .extractor()
        .extract(&source("nope.kml"), FileKind::Kml)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    harness.wait_for_empty_scratch().await;
}

struct SilentWorker {
    terminated: Arc<AtomicBool>,
}

struct SilentHandle {
    terminated: Arc<AtomicBool>,
}

#[async_trait]
impl ParseWorker for SilentWorker {
    type Handle = SilentHandle;

    async fn spawn(&self, _job: &ParseJob) -> anyhow::Result<SilentHandle> {
        Ok(SilentHandle {
            terminated: self.terminated.clone(),
        })
    }
}

#[async_trait]
impl WorkerHandle for SilentHandle {
    async fn outcome(&mut self) -> anyhow::Result<WorkerOutcome> {
        std::future::pending().await
    }

    async fn terminate(&mut self) -> anyhow::Result<()> {
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn unresponsive_worker_times_out_and_is_terminated() {
    let harness = Harness::new();
    harness.put("slow.kml", kml_points(&[(1.0, 2.0)]).as_bytes());
    let terminated = Arc::new(AtomicBool::new(false));
    let worker = SilentWorker {
        terminated: terminated.clone(),
    };
    let config = harness.config().parse_deadline(Duration::from_millis(100));
    let extractor = Extractor::new(LocalBlobStore::new(harness.store_root.path()), worker, config);

    let err = extractor
        .extract(&source("slow.kml"), FileKind::Kml)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "client timeout: processing exceeded budget");
    assert!(terminated.load(Ordering::SeqCst));
    harness.wait_for_empty_scratch().await;
}

#[cfg(unix)]
#[tokio::test]
async fn hung_worker_process_is_killed() {
    let harness = Harness::new();
    harness.put("slow.kml", kml_points(&[(1.0, 2.0)]).as_bytes());
    let worker = ProcessWorker::new("/bin/sh").args(["-c", "sleep 30", "sh"]);
    let config = harness.config().parse_deadline(Duration::from_millis(200));
    let extractor = Extractor::new(LocalBlobStore::new(harness.store_root.path()), worker, config);

    let started = Instant::now();
    let err = extractor
        .extract(&source("slow.kml"), FileKind::Kml)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ClientTimeout);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[cfg(unix)]
#[tokio::test]
async fn crashed_worker_is_internal() {
    let harness = Harness::new();
    harness.put("crash.kml", kml_points(&[(1.0, 2.0)]).as_bytes());
    let worker = ProcessWorker::new("/bin/sh").args(["-c", "exit 3", "sh"]);
    let extractor = Extractor::new(LocalBlobStore::new(harness.store_root.path()), worker, harness.config());

    let err = extractor
        .extract(&source("crash.kml"), FileKind::Kml)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "internal: worker stopped unexpectedly with code 3");
    harness.wait_for_empty_scratch().await;
}

#[tokio::test]
async fn workspace_is_removed_exactly_once_on_success_and_failure() {
    let harness = Harness::new();
    harness.put("ok.kml", kml_points(&[(1.0, 2.0)]).as_bytes());
    let (hook, calls) = counting_hook(false);
    let extractor = harness.extractor().with_cleanup_hook(hook);

    extractor.extract(&source("ok.kml"), FileKind::Kml).await.unwrap();
    extractor
        .extract(&source("missing.kml"), FileKind::Kml)
        .await
        .unwrap_err();

    let calls = wait_for_calls(&calls, 2).await;
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0], calls[1]);
    harness.wait_for_empty_scratch().await;
}

#[tokio::test]
async fn failing_cleanup_does_not_change_the_result() {
    let harness = Harness::new();
    harness.put("ok.kml", kml_points(&[(1.0, 2.0)]).as_bytes());
    let (hook, calls) = counting_hook(true);
    let extractor = harness.extractor().with_cleanup_hook(hook);

    let collection = extractor.extract(&source("ok.kml"), FileKind::Kml).await.unwrap();
    assert_eq!(collection.len(), 1);

    let err = extractor
        .extract(&source("missing.kml"), FileKind::Kml)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert_eq!(wait_for_calls(&calls, 2).await.len(), 2);
}
