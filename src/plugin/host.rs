use std::path::PathBuf;

use super::sld::ColorRamp;

/// Name of the group the plugin nests its prediction and RGB groups under.
pub const RESULTS_GROUP: &str = "Inference Results";

/// Map-space bounding rectangle reported by the host for a loaded layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Extent {
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self { xmin, ymin, xmax, ymax }
    }

    pub fn is_empty(&self) -> bool {
        !(self.xmax > self.xmin && self.ymax > self.ymin)
    }

    /// Smallest extent covering both.
    pub fn combine(&self, other: &Extent) -> Extent {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Extent {
            xmin: self.xmin.min(other.xmin),
            ymin: self.ymin.min(other.ymin),
            xmax: self.xmax.max(other.xmax),
            ymax: self.ymax.max(other.ymax),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerGroup {
    /// "Predictions", under [`RESULTS_GROUP`].
    Predictions,
    /// "RGB Images", under [`RESULTS_GROUP`].
    RgbImages,
    /// The project's layer tree root.
    Root,
}

impl LayerGroup {
    pub fn name(&self) -> &'static str {
        match self {
            LayerGroup::Predictions => "Predictions",
            LayerGroup::RgbImages => "RGB Images",
            LayerGroup::Root => "",
        }
    }

    /// Group picked from a layer or file name when no style decides it.
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("rgb") {
            LayerGroup::RgbImages
        } else if lower.contains("pred") {
            LayerGroup::Predictions
        } else {
            LayerGroup::Root
        }
    }
}

/// A raster read through the host's GDAL provider, either a local file or a URL.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterLayer {
    pub name: String,
    pub source: String,
    pub provider: &'static str,
    pub opacity: f32,
    pub color_ramp: Option<ColorRamp>,
    pub group: LayerGroup,
    /// Bilinear resampling when zoomed in and out.
    pub bilinear: bool,
}

impl RasterLayer {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            provider: "gdal",
            opacity: 1.0,
            color_ramp: None,
            group: LayerGroup::Root,
            bilinear: false,
        }
    }

    pub fn from_path(name: impl Into<String>, path: &std::path::Path) -> Self {
        Self::new(name, path.to_string_lossy())
    }

    /// Local path of the source, when it is not a URL.
    pub fn local_path(&self) -> Option<PathBuf> {
        if self.source.contains("://") {
            None
        } else {
            Some(PathBuf::from(&self.source))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WmsLayer {
    pub name: String,
    /// Provider URI (`url=...&layers=...&styles=...`).
    pub uri: String,
    pub group: LayerGroup,
}

/// The GIS desktop application the plugin draws into.
///
/// Adding a layer returns its extent, or the host's reason for rejecting it
/// (unreadable raster, unreachable service).
pub trait MapHost {
    fn add_raster_layer(&mut self, layer: RasterLayer) -> Result<Extent, String>;

    fn add_wms_layer(&mut self, layer: WmsLayer) -> Result<Extent, String>;

    fn zoom_to(&mut self, extent: Extent);

    fn refresh(&mut self);
}
