use super::host::{LayerGroup, MapHost, WmsLayer};

/// GeoServer style applied to prediction layers.
pub const SEGMENTATION_STYLE: &str = "segmentation-generic-20";

pub const DEFAULT_WORKSPACE: &str = "geofm";

/// Segmentation style for prediction layers; inputs and RGB composites keep the
/// server default.
pub fn style_for_layer(layer_name: &str) -> &'static str {
    let lower = layer_name.to_lowercase();
    if lower.contains("pred") && !lower.contains("rgb") && !lower.contains("input") {
        SEGMENTATION_STYLE
    } else {
        ""
    }
}

/// Adds GeoServer-published layers to the map as WMS layers.
#[derive(Debug, Clone)]
pub struct WmsLoader {
    geoserver_url: String,
}

impl WmsLoader {
    pub fn new(geoserver_url: impl Into<String>) -> Self {
        Self {
            geoserver_url: geoserver_url.into(),
        }
    }

    pub fn service_url(&self, workspace: &str) -> String {
        format!("{}/{}/wms", self.geoserver_url.trim_end_matches('/'), workspace)
    }

    pub fn layer_uri(&self, workspace: &str, layer_name: &str) -> String {
        let prefix = format!("{}:", workspace);
        let clean = layer_name.strip_prefix(&prefix).unwrap_or(layer_name);
        format!(
            "url={}&layers={}&format=image/png&styles={}&crs=EPSG:4326&timeout=30000&version=1.3.0",
            self.service_url(workspace),
            clean,
            style_for_layer(layer_name)
        )
    }

    /// Adds one layer and zooms the map to it.
    pub fn add_wms_layer<H: MapHost>(
        &self,
        host: &mut H,
        workspace: &str,
        layer_name: &str,
    ) -> Result<(), String> {
        log::info!(
            target: "WMS Manager",
            "Starting to add WMS layer '{}' from workspace '{}'",
            layer_name,
            workspace
        );
        let layer = WmsLayer {
            name: layer_name.to_string(),
            uri: self.layer_uri(workspace, layer_name),
            group: LayerGroup::from_name(layer_name),
        };
        let extent = host.add_wms_layer(layer).map_err(|e| {
            let msg = format!("Failed to create WMS layer: {} - Layer error: {}", layer_name, e);
            log::error!(target: "WMS Manager", "{}", msg);
            msg
        })?;
        host.zoom_to(extent);
        host.refresh();
        log::info!(target: "WMS Manager", "WMS layer '{}' added", layer_name);
        Ok(())
    }

    /// Adds each layer, logging failures; returns how many were added.
    pub fn load_wms_layers<H, S>(&self, host: &mut H, layers: &[S], workspace: &str) -> usize
    where
        H: MapHost,
        S: AsRef<str>,
    {
        let mut loaded = 0;
        for name in layers {
            match self.add_wms_layer(host, workspace, name.as_ref()) {
                Ok(()) => loaded += 1,
                Err(e) => {
                    log::warn!(target: "WMS Manager", "Error loading WMS layer {}: {}", name.as_ref(), e)
                }
            }
        }
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_prediction_layers_get_segmentation_style() {
        assert_eq!(style_for_layer("geofm:flood_pred"), SEGMENTATION_STYLE);
        assert_eq!(style_for_layer("flood_PRED_rgb"), "");
        assert_eq!(style_for_layer("input_pred"), "");
        assert_eq!(style_for_layer("flood_input"), "");
    }

    #[test]
    fn uri_strips_workspace_prefix() {
        let wms = WmsLoader::new("https://gs.example.com/geoserver/");
        assert_eq!(
            wms.layer_uri("geofm", "geofm:abc_pred"),
            "url=https://gs.example.com/geoserver/geofm/wms&layers=abc_pred&format=image/png\
             &styles=segmentation-generic-20&crs=EPSG:4326&timeout=30000&version=1.3.0"
        );
    }
}
