//! Map-plugin side: submit inferences for a drawn bounding box and load the results
//! into a GIS host as raster or WMS layers.
//!
//! The host application is reached only through [`MapHost`]; everything else here is
//! plain HTTP and filesystem work that can run and be tested without it.

mod api;
mod host;
mod raster;
mod sld;
mod wms;

pub use api::{AuthType, GeoInferenceApi};
pub use host::{Extent, LayerGroup, MapHost, RESULTS_GROUP, RasterLayer, WmsLayer};
pub use raster::{
    LoadSummary, RasterCache, RasterLoader, StyleMapping, TaskOutput, find_raster_files,
    is_archive_url,
};
pub use sld::{ColorRamp, ColorRampItem, Rgba};
pub use wms::{DEFAULT_WORKSPACE, SEGMENTATION_STYLE, WmsLoader, style_for_layer};
