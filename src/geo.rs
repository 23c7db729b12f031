//! Helpers for preparing inference inputs and inspecting their outputs.

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use std::fs::File;
use std::path::Path;

use crate::error::StudioError;
use crate::util::round5;

/// `[west, south, east, north]` of a GeoJSON Feature or bare geometry.
///
/// Polygons and multipolygons are supported. Values are rounded to five decimals and
/// a west or east edge past 180° is shifted back by 360°.
pub fn geojson_to_bbox(geojson: &Value) -> Result<[f64; 4]> {
    let geometry = match geojson.get("type").and_then(Value::as_str) {
        Some("Feature") => geojson
            .get("geometry")
            .ok_or_else(|| StudioError::validation("feature has no geometry"))?,
        _ => geojson,
    };
    let coords = geometry
        .get("coordinates")
        .ok_or_else(|| StudioError::validation("geometry has no coordinates"))?;
    let rings: Vec<&Value> = match geometry.get("type").and_then(Value::as_str) {
        Some("Polygon") => coords.as_array().into_iter().flatten().collect(),
        Some("MultiPolygon") => coords
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_array)
            .flatten()
            .collect(),
        other => {
            return Err(StudioError::validation(format!(
                "unsupported geometry type {}",
                other.unwrap_or("<none>")
            ))
            .into());
        }
    };

    let mut bbox = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
    for point in rings.iter().filter_map(|r| r.as_array()).flatten() {
        let (Some(x), Some(y)) = (
            point.get(0).and_then(Value::as_f64),
            point.get(1).and_then(Value::as_f64),
        ) else {
            continue;
        };
        bbox[0] = bbox[0].min(x);
        bbox[1] = bbox[1].min(y);
        bbox[2] = bbox[2].max(x);
        bbox[3] = bbox[3].max(y);
    }
    if !bbox.iter().all(|v| v.is_finite()) {
        return Err(StudioError::validation("geometry has no coordinates").into());
    }

    let mut bbox = bbox.map(round5);
    for i in [0, 2] {
        if bbox[i] > 180.0 {
            bbox[i] = round5(bbox[i] - 360.0);
        }
    }
    Ok(bbox)
}

/// Entry names of a local ZIP archive, optionally only the `.tif` ones.
pub fn list_archive_files(path: &Path, just_tif: bool) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let archive = zip::ZipArchive::new(file).map_err(|e| anyhow!("Invalid ZIP file: {}", e))?;
    Ok(archive
        .file_names()
        .filter(|n| !just_tif || n.ends_with(".tif"))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn feature_polygon_bbox() {
        let f = json!({
            "type": "Feature",
            "properties": {},
            "geometry": {"type": "Polygon", "coordinates": [[
                [-121.812345678, 38.4], [-121.6, 38.4], [-121.6, 38.612345678], [-121.812345678, 38.4]
            ]]}
        });
        assert_eq!(geojson_to_bbox(&f).unwrap(), [-121.81235, 38.4, -121.6, 38.61235]);
    }

    #[test]
    fn longitudes_past_antimeridian_wrap() {
        let g = json!({"type": "Polygon", "coordinates": [[[190.0, 1.0], [200.0, 1.0], [200.0, 2.0], [190.0, 1.0]]]});
        assert_eq!(geojson_to_bbox(&g).unwrap(), [-170.0, 1.0, -160.0, 2.0]);
    }

    #[test]
    fn multipolygon_spans_all_parts() {
        let g = json!({"type": "MultiPolygon", "coordinates": [
            [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]],
            [[[5.0, 5.0], [6.0, 5.0], [6.0, 7.0], [5.0, 5.0]]]
        ]});
        assert_eq!(geojson_to_bbox(&g).unwrap(), [0.0, 0.0, 6.0, 7.0]);
    }

    #[test]
    fn points_are_rejected() {
        assert!(geojson_to_bbox(&json!({"type": "Point", "coordinates": [1.0, 2.0]})).is_err());
    }

    #[test]
    fn archive_listing_filters_tifs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.zip");
        let mut zw = zip::ZipWriter::new(File::create(&path).unwrap());
        let opts = zip::write::SimpleFileOptions::default();
        for name in ["a_pred.tif", "meta.json"] {
            zw.start_file(name, opts).unwrap();
            zw.write_all(b"x").unwrap();
        }
        zw.finish().unwrap();

        assert_eq!(list_archive_files(&path, true).unwrap(), vec!["a_pred.tif"]);
        assert_eq!(list_archive_files(&path, false).unwrap().len(), 2);
    }
}
