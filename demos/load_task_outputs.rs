use anyhow::{Result, anyhow};
use geostudio::plugin::{
    Extent, GeoInferenceApi, MapHost, RasterLayer, RasterLoader, WmsLayer,
};
use geostudio::{HttpDownloader, PluginConfig};
use std::time::Duration;

/// Prints what a GIS host would be asked to draw.
struct PrintingHost;

impl MapHost for PrintingHost {
    fn add_raster_layer(&mut self, layer: RasterLayer) -> Result<Extent, String> {
        println!("raster {:<40} {:?} opacity={} <- {}", layer.name, layer.group, layer.opacity, layer.source);
        Ok(Extent::new(-180.0, -90.0, 180.0, 90.0))
    }

    fn add_wms_layer(&mut self, layer: WmsLayer) -> Result<Extent, String> {
        println!("wms    {:<40} {}", layer.name, layer.uri);
        Ok(Extent::new(-180.0, -90.0, 180.0, 90.0))
    }

    fn zoom_to(&mut self, extent: Extent) {
        println!("zoom   {:?}", extent);
    }

    fn refresh(&mut self) {}
}

fn main() -> Result<()> {
    env_logger::init();

    let inference_id = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("usage: load_task_outputs <inference-id>"))?;
    let api_key = std::env::var("GEOSTUDIO_API_KEY")?;

    let config = PluginConfig::from_env();
    let mut api = GeoInferenceApi::new(&config)?;
    api.set_auth_credentials(api_key, "X-Api-Key");

    let outputs = api.get_task_outputs(&inference_id).map_err(|e| anyhow!(e))?;
    let downloader = HttpDownloader::new(config.verify_tls, Duration::from_secs(600))?;
    let loader = RasterLoader::new(downloader);

    let mut host = PrintingHost;
    let mut progress = |i: usize, total: usize, task: &str| eprintln!("[{}/{}] {}", i + 1, total, task);
    let summary = loader.load_raster_layers_from_outputs(&mut host, &outputs, None, Some(&mut progress));
    println!("loaded {} task(s), {} failed", summary.loaded, summary.failed);
    Ok(())
}
