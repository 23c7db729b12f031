use anyhow::Result;
use geostudio::Download;
use geostudio::plugin::{
    Extent, LayerGroup, MapHost, RasterCache, RasterLayer, RasterLoader, TaskOutput, WmsLayer,
    find_raster_files,
};
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Serves a fixed archive and counts how often it is asked to.
struct CountingDownloader {
    archive: Vec<u8>,
    calls: AtomicUsize,
}

impl CountingDownloader {
    fn new(archive: Vec<u8>) -> Self {
        Self {
            archive,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Download for &CountingDownloader {
    fn download(&self, _url: &str, target: &Path) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        fs::write(target, &self.archive)?;
        Ok(self.archive.len() as u64)
    }
}

#[derive(Default)]
struct RecordingHost {
    rasters: Vec<RasterLayer>,
    zooms: Vec<Extent>,
    reject: Option<&'static str>,
}

impl MapHost for RecordingHost {
    fn add_raster_layer(&mut self, layer: RasterLayer) -> Result<Extent, String> {
        if self.reject.is_some_and(|r| layer.name.contains(r)) {
            return Err("not a raster".into());
        }
        let offset = self.rasters.len() as f64;
        self.rasters.push(layer);
        Ok(Extent::new(offset, 0.0, offset + 1.0, 1.0))
    }

    fn add_wms_layer(&mut self, _layer: WmsLayer) -> Result<Extent, String> {
        Err("unexpected WMS layer".into())
    }

    fn zoom_to(&mut self, extent: Extent) {
        self.zooms.push(extent);
    }

    fn refresh(&mut self) {}
}

fn zip_bytes(names: &[&str]) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zw = zip::ZipWriter::new(&mut buf);
        let opts = zip::write::SimpleFileOptions::default();
        for name in names {
            zw.start_file(*name, opts).unwrap();
            zw.write_all(b"II*\0").unwrap();
        }
        zw.finish().unwrap();
    }
    buf.into_inner()
}

const URL: &str = "https://store.example.com/out/inf-1_1/archive.zip?X-Amz-Signature=abc";

#[test]
fn second_load_of_an_archive_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = CountingDownloader::new(zip_bytes(&["T1_rgb.tif", "T1.tif_pred.tif", "meta.json"]));
    let cache = RasterCache::at(dir.path().join("cache"));

    let first = cache.materialize(URL, &&downloader).unwrap();
    let first_files = find_raster_files(&first).unwrap();
    assert_eq!(downloader.calls(), 1);

    let second = cache.materialize(URL, &&downloader).unwrap();
    let second_files = find_raster_files(&second).unwrap();
    assert_eq!(downloader.calls(), 1);
    assert_eq!(first_files, second_files);
    assert_eq!(first_files.len(), 2);
}

#[test]
fn cached_archive_without_extraction_is_extracted_again() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = CountingDownloader::new(zip_bytes(&["a_pred.tif"]));
    let cache = RasterCache::at(dir.path());

    let extracted = cache.materialize(URL, &&downloader).unwrap();
    fs::remove_dir_all(&extracted).unwrap();
    let again = cache.materialize(URL, &&downloader).unwrap();

    assert_eq!(downloader.calls(), 1);
    assert!(again.join("a_pred.tif").exists());
}

#[test]
fn corrupt_archive_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = CountingDownloader::new(b"not a zip".to_vec());
    let err = RasterCache::at(dir.path()).materialize(URL, &&downloader).unwrap_err();
    assert!(err.to_string().starts_with("Invalid ZIP file"), "{}", err);
}

#[test]
fn clear_removes_the_cache_root() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("cache");
    let downloader = CountingDownloader::new(zip_bytes(&["a_pred.tif"]));
    let cache = RasterCache::at(&root);
    cache.materialize(URL, &&downloader).unwrap();

    cache.clear().unwrap();
    assert!(!root.exists());
    cache.clear().unwrap();
}

#[test]
fn only_prediction_and_rgb_rasters_are_found() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["a_pred.tif", "b_rgb.tif", "c.jpg", "readme.txt"] {
        fs::write(dir.path().join(name), b"x").unwrap();
    }
    let found = find_raster_files(dir.path()).unwrap();
    let expected: Vec<PathBuf> = vec![dir.path().join("a_pred.tif"), dir.path().join("b_rgb.tif")];
    assert_eq!(found, expected);
}

#[test]
fn outputs_load_into_groups_and_zoom_once_per_archive() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = CountingDownloader::new(zip_bytes(&["T1_rgb.tif", "T1.tif_pred.tif"]));
    let loader = RasterLoader::new(&downloader).with_cache(RasterCache::at(dir.path()));
    let inference = json!({"geoserver_layers": {"predicted_layers": [
        {"display_name": "prediction", "sld_body":
            "<ColorMap><ColorMapEntry color=\"#000000\" quantity=\"1\"/><ColorMapEntry color=\"#ffffff\" quantity=\"0\"/></ColorMap>"}
    ]}});
    let outputs = vec![
        TaskOutput { task_id: "inf-1_1".into(), presigned_url: URL.into() },
        TaskOutput { task_id: "inf-1_2".into(), presigned_url: String::new() },
    ];

    let mut host = RecordingHost::default();
    let mut seen = Vec::new();
    let mut progress = |i: usize, total: usize, task: &str| seen.push((i, total, task.to_string()));
    let summary = loader.load_raster_layers_from_outputs(&mut host, &outputs, Some(&inference), Some(&mut progress));

    assert_eq!((summary.loaded, summary.failed), (1, 1));
    assert_eq!(seen, vec![(0, 2, "inf-1_1".to_string()), (1, 2, "inf-1_2".to_string())]);
    assert_eq!(host.rasters.len(), 2);

    let pred = host.rasters.iter().find(|l| l.name == "T1.tif_pred").unwrap();
    assert_eq!(pred.group, LayerGroup::Predictions);
    assert_eq!(pred.opacity, 0.7);
    let ramp = pred.color_ramp.as_ref().unwrap();
    assert_eq!(ramp.items.iter().map(|i| i.value).collect::<Vec<_>>(), vec![0.0, 1.0]);

    let rgb = host.rasters.iter().find(|l| l.name == "T1_rgb").unwrap();
    assert_eq!(rgb.group, LayerGroup::RgbImages);
    assert!(rgb.color_ramp.is_none());

    assert_eq!(host.zooms, vec![Extent::new(0.0, 0.0, 2.0, 1.0)]);
}

#[test]
fn single_raster_archive_is_named_after_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = CountingDownloader::new(zip_bytes(&["out/T9.tif_pred.tif"]));
    let loader = RasterLoader::new(&downloader).with_cache(RasterCache::at(dir.path()));
    let outputs = vec![TaskOutput { task_id: "inf-9_1".into(), presigned_url: URL.into() }];

    let mut host = RecordingHost::default();
    let summary = loader.load_raster_layers_from_outputs(&mut host, &outputs, None, None);

    assert_eq!(summary.loaded, 1);
    assert_eq!(host.rasters[0].name, "inf-9_1");
    assert!(host.rasters[0].bilinear);
}

#[test]
fn rejected_rasters_do_not_abort_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = CountingDownloader::new(zip_bytes(&["T1_rgb.tif", "T1.tif_pred.tif"]));
    let loader = RasterLoader::new(&downloader).with_cache(RasterCache::at(dir.path()));
    let outputs = vec![TaskOutput { task_id: "t".into(), presigned_url: URL.into() }];

    let mut host = RecordingHost { reject: Some("rgb"), ..RecordingHost::default() };
    let summary = loader.load_raster_layers_from_outputs(&mut host, &outputs, None, None);
    assert_eq!(summary.loaded, 1);
    assert_eq!(host.rasters.len(), 1);

    let mut host = RecordingHost { reject: Some("T1"), ..RecordingHost::default() };
    let summary = loader.load_raster_layers_from_outputs(&mut host, &outputs, None, None);
    assert_eq!((summary.loaded, summary.failed), (0, 1));
    assert!(host.zooms.is_empty());
}

#[test]
fn direct_rasters_skip_the_downloader() {
    let downloader = CountingDownloader::new(Vec::new());
    let loader = RasterLoader::new(&downloader);
    let outputs = vec![TaskOutput {
        task_id: "inf-2_1".into(),
        presigned_url: "https://store.example.com/out/inf-2_1_pred.tif".into(),
    }];

    let mut host = RecordingHost::default();
    let summary = loader.load_raster_layers_from_outputs(&mut host, &outputs, None, None);

    assert_eq!(summary.loaded, 1);
    assert_eq!(downloader.calls(), 0);
    assert_eq!(host.rasters[0].source, "https://store.example.com/out/inf-2_1_pred.tif");
    assert_eq!(host.rasters[0].provider, "gdal");
    assert_eq!(host.zooms.len(), 1);
}
