//! Loading inference outputs into the map as raster layers.
//!
//! Task outputs are either a direct raster URL or a ZIP archive of GeoTIFFs. Archives
//! are cached under the system temp directory keyed by a hash of their URL, so loading
//! the same inference twice does no network I/O.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use super::host::{Extent, LayerGroup, MapHost, RasterLayer};
use super::sld::ColorRamp;
use crate::download::Download;
use crate::util::short_hash;

const PREDICTION_OPACITY: f32 = 0.7;

/// One task's downloadable output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: String,
    pub presigned_url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: usize,
    pub failed: usize,
}

/// SLD bodies for prediction and RGB layers, taken from an inference record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StyleMapping {
    pub pred: Option<String>,
    pub rgb: Option<String>,
}

impl StyleMapping {
    /// Reads `geoserver_layers.predicted_layers[].{display_name, sld_body}`.
    pub fn from_inference(inference: &Value) -> Self {
        let mut mapping = Self::default();
        let layers = inference
            .pointer("/geoserver_layers/predicted_layers")
            .and_then(Value::as_array);
        for layer in layers.into_iter().flatten() {
            let name = layer
                .get("display_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_lowercase();
            let sld = layer
                .get("sld_body")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if name.contains("pred") {
                mapping.pred = Some(sld);
            } else if name.contains("rgb") {
                mapping.rgb = Some(sld);
            }
        }
        mapping
    }

    pub fn is_empty(&self) -> bool {
        self.pred.is_none() && self.rgb.is_none()
    }
}

/// On-disk cache of downloaded output archives.
///
/// `<root>/archive_<hash>.zip` holds the download and `<root>/extracted_<hash>/` its
/// contents. Entries are never invalidated; [`RasterCache::clear`] drops them all.
/// Concurrent processes may race on a miss.
#[derive(Debug, Clone)]
pub struct RasterCache {
    root: PathBuf,
}

impl Default for RasterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RasterCache {
    pub fn new() -> Self {
        Self::at(std::env::temp_dir().join("qgis_raster_cache"))
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_path(&self, url: &str) -> PathBuf {
        self.root.join(format!("archive_{}.zip", short_hash(url)))
    }

    pub fn extract_dir(&self, url: &str) -> PathBuf {
        self.root.join(format!("extracted_{}", short_hash(url)))
    }

    /// Directory holding the extracted archive at `url`, downloading and extracting
    /// only what is not cached yet.
    pub fn materialize<D: Download>(&self, url: &str, downloader: &D) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create cache directory {}", self.root.display()))?;
        let archive = self.archive_path(url);
        let extracted = self.extract_dir(url);

        if archive.exists() && has_entries(&extracted) {
            log::info!(target: "GEOFM", "Using cached ZIP and extracted files from {}", extracted.display());
            return Ok(extracted);
        }

        if archive.exists() {
            log::info!(target: "GEOFM", "Using cached ZIP file {}, extracting", archive.display());
        } else {
            log::info!(target: "GEOFM", "Downloading and caching ZIP file {}", archive.display());
            let partial = archive.with_extension("zip.part");
            downloader
                .download(url, &partial)
                .map_err(|e| anyhow!("Failed to download ZIP file: {:#}", e))?;
            fs::rename(&partial, &archive)
                .with_context(|| format!("failed to move download to {}", archive.display()))?;
        }

        extract_archive(&archive, &extracted)?;
        Ok(extracted)
    }

    /// Removes every cached archive and extraction.
    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)
                .with_context(|| format!("Failed to clear cache {}", self.root.display()))?;
            log::info!(target: "GEOFM", "Raster cache cleared");
        }
        Ok(())
    }
}

fn has_entries(dir: &Path) -> bool {
    fs::read_dir(dir).map(|mut d| d.next().is_some()).unwrap_or(false)
}

fn extract_archive(archive: &Path, target: &Path) -> Result<()> {
    let file = File::open(archive).with_context(|| format!("failed to open {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| anyhow!("Invalid ZIP file: {}", e))?;
    fs::create_dir_all(target)?;
    zip.extract(target).map_err(|e| anyhow!("Invalid ZIP file: {}", e))?;
    Ok(())
}

/// True for URLs that point at an output archive rather than a single raster.
pub fn is_archive_url(url: &str) -> bool {
    url.to_lowercase().ends_with(".zip") || url.contains("archive.zip")
}

/// `*pred.tif` and `*rgb.tif` files under `dir`, recursively, in path order.
pub fn find_raster_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current).with_context(|| format!("failed to read {}", current.display()))? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if name.ends_with("pred.tif") || name.ends_with("rgb.tif") {
                log::debug!(target: "GEOFM", "Found raster file: {}", name);
                found.push(path);
            } else {
                log::debug!(target: "GEOFM", "Skipped file: {}", name);
            }
        }
    }
    found.sort();
    log::info!(target: "GEOFM", "Total target raster files found: {}", found.len());
    Ok(found)
}

/// Loads task outputs into a [`MapHost`], fetching archives through `D`.
#[derive(Debug, Clone)]
pub struct RasterLoader<D> {
    downloader: D,
    cache: RasterCache,
}

impl<D: Download> RasterLoader<D> {
    pub fn new(downloader: D) -> Self {
        Self {
            downloader,
            cache: RasterCache::new(),
        }
    }

    pub fn with_cache(mut self, cache: RasterCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &RasterCache {
        &self.cache
    }

    pub fn clear_raster_cache(&self) -> Result<()> {
        self.cache.clear()
    }

    /// Adds the output at `url` and returns how many layers it produced.
    pub fn add_raster_from_url<H: MapHost>(
        &self,
        host: &mut H,
        url: &str,
        layer_name: &str,
        styles: &StyleMapping,
    ) -> Result<usize, String> {
        if is_archive_url(url) {
            self.add_raster_from_zip(host, url, layer_name, styles)
        } else {
            add_raster_file(host, url, layer_name).map(|_| 1)
        }
    }

    fn add_raster_from_zip<H: MapHost>(
        &self,
        host: &mut H,
        url: &str,
        layer_name: &str,
        styles: &StyleMapping,
    ) -> Result<usize, String> {
        log::info!(target: "GEOFM", "Processing ZIP from: {}", url);
        let dir = self.cache.materialize(url, &self.downloader).map_err(|e| {
            log::error!(target: "GEOFM", "{:#}", e);
            format!("{:#}", e)
        })?;
        let rasters = find_raster_files(&dir).map_err(|e| format!("{:#}", e))?;
        if rasters.is_empty() {
            log::error!(target: "GEOFM", "No raster files found in ZIP archive");
            return Err("No raster files found in ZIP archive".to_string());
        }

        let mut extent: Option<Extent> = None;
        let mut loaded = 0;
        let mut failed = Vec::new();
        for path in &rasters {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let name = if rasters.len() > 1 { stem.clone() } else { layer_name.to_string() };
            let layer = styled_layer(RasterLayer::from_path(name.clone(), path), &stem, styles);
            let group = layer.group;
            match host.add_raster_layer(layer) {
                Ok(e) => {
                    extent = Some(extent.map_or(e, |acc| acc.combine(&e)));
                    loaded += 1;
                    log::info!(target: "GEOFM", "Added {} to {:?} group", name, group);
                }
                Err(e) => {
                    log::error!(target: "GEOFM", "Raster layer invalid for {}: {}", stem, e);
                    failed.push(format!("{}:{}", stem, e));
                }
            }
        }

        if loaded == 0 {
            return Err(format!("Failed to load any raster layers. Errors: {}", failed.join("; ")));
        }
        if let Some(extent) = extent.filter(|e| !e.is_empty()) {
            host.zoom_to(extent);
            host.refresh();
        }
        if failed.is_empty() {
            log::info!(target: "GEOFM", "Successfully loaded {} raster layer(s)", loaded);
        } else {
            log::warn!(
                target: "GEOFM",
                "Successfully loaded {} raster layer(s). Failed to load {} layer(s).",
                loaded,
                failed.len()
            );
        }
        Ok(loaded)
    }

    /// Loads every task output, counting tasks that produced at least one layer as
    /// loaded. `progress` sees `(index, total, task_id)` before each task.
    pub fn load_raster_layers_from_outputs<H: MapHost>(
        &self,
        host: &mut H,
        outputs: &[TaskOutput],
        inference: Option<&Value>,
        mut progress: Option<&mut dyn FnMut(usize, usize, &str)>,
    ) -> LoadSummary {
        let styles = inference.map(StyleMapping::from_inference).unwrap_or_default();
        let mut summary = LoadSummary::default();
        log::info!(target: "WMS Manager", "Starting to load {} task outputs", outputs.len());

        for (i, output) in outputs.iter().enumerate() {
            if let Some(cb) = progress.as_deref_mut() {
                cb(i, outputs.len(), &output.task_id);
            }
            log::info!(
                target: "WMS Manager",
                "Processing task {}/{}: {}",
                i + 1,
                outputs.len(),
                output.task_id
            );
            if output.presigned_url.is_empty() {
                summary.failed += 1;
                continue;
            }
            match self.add_raster_from_url(host, &output.presigned_url, &output.task_id, &styles) {
                Ok(_) => summary.loaded += 1,
                Err(e) => {
                    summary.failed += 1;
                    log::warn!(target: "WMS Manager", "Failed to load task {}: {}", output.task_id, e);
                }
            }
        }

        log::info!(
            target: "WMS Manager",
            "Loading completed: {} tasks processed, {} failed",
            summary.loaded,
            summary.failed
        );
        summary
    }
}

fn add_raster_file<H: MapHost>(host: &mut H, url: &str, layer_name: &str) -> Result<(), String> {
    let extent = host
        .add_raster_layer(RasterLayer::new(layer_name, url))
        .inspect_err(|e| log::error!(target: "GEOFM", "Raster invalid: {}", e))?;
    host.zoom_to(extent);
    host.refresh();
    log::info!(target: "GEOFM", "Raster layer added: {}", layer_name);
    Ok(())
}

/// Picks group, opacity and colour ramp for an extracted raster from its file stem.
fn styled_layer(mut layer: RasterLayer, stem: &str, styles: &StyleMapping) -> RasterLayer {
    layer.bilinear = true;
    if let (true, Some(sld)) = (stem.contains("tif_pred"), styles.pred.as_deref()) {
        layer.color_ramp = ColorRamp::from_sld(sld);
        layer.opacity = PREDICTION_OPACITY;
        layer.group = LayerGroup::Predictions;
        return layer;
    }
    if let (true, Some(sld)) = (stem.contains("rgb"), styles.rgb.as_deref()) {
        layer.color_ramp = ColorRamp::from_sld(sld);
        layer.group = LayerGroup::RgbImages;
        return layer;
    }
    layer.group = LayerGroup::from_name(stem);
    if layer.group == LayerGroup::Predictions {
        layer.opacity = PREDICTION_OPACITY;
    }
    layer
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn archive_detection() {
        assert!(is_archive_url("https://s3/out/T1.ZIP"));
        assert!(is_archive_url("https://s3/out/archive.zip?X-Amz-Signature=abc"));
        assert!(!is_archive_url("https://s3/out/T1_pred.tif?sig=zip"));
    }

    #[test]
    fn cache_paths_use_url_hash() {
        let cache = RasterCache::at("/tmp/c");
        let url = "https://s3/out/archive.zip";
        let h = short_hash(url);
        assert_eq!(cache.archive_path(url), PathBuf::from(format!("/tmp/c/archive_{}.zip", h)));
        assert_eq!(cache.extract_dir(url), PathBuf::from(format!("/tmp/c/extracted_{}", h)));
    }

    #[test]
    fn styles_from_inference_record() {
        let inf = json!({"geoserver_layers": {"predicted_layers": [
            {"display_name": "Flood Prediction", "sld_body": "<pred/>"},
            {"display_name": "Input RGB", "sld_body": "<rgb/>"},
            {"display_name": "other"}
        ]}});
        let m = StyleMapping::from_inference(&inf);
        assert_eq!(m.pred.as_deref(), Some("<pred/>"));
        assert_eq!(m.rgb.as_deref(), Some("<rgb/>"));
        assert!(StyleMapping::from_inference(&json!({})).is_empty());
    }

    #[test]
    fn prediction_layers_are_translucent() {
        let styled = styled_layer(RasterLayer::new("a", "/x"), "T1.tif_pred", &StyleMapping::default());
        assert_eq!(styled.group, LayerGroup::Predictions);
        assert_eq!(styled.opacity, PREDICTION_OPACITY);
        assert!(styled.bilinear);

        let rgb = styled_layer(RasterLayer::new("a", "/x"), "T1_rgb", &StyleMapping::default());
        assert_eq!(rgb.group, LayerGroup::RgbImages);
        assert_eq!(rgb.opacity, 1.0);
    }

    #[test]
    fn sld_styles_prediction_rasters() {
        let styles = StyleMapping {
            pred: Some(r##"<ColorMapEntry color="#ff0000" quantity="1"/>"##.into()),
            rgb: None,
        };
        let styled = styled_layer(RasterLayer::new("a", "/x"), "T1.tif_pred", &styles);
        assert_eq!(styled.color_ramp.map(|r| r.len()), Some(1));
        assert_eq!(styled.group, LayerGroup::Predictions);
    }
}
