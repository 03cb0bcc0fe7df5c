// THEORY:
// The `renderer` module is the hand-off point between the engine and whatever turns its
// results into an artifact. The engine only knows the `Renderer` trait: give it every
// finalized record and the derived region, then ask it to save itself.
//
// `GeoJsonRenderer` is the built-in implementation. It writes a single FeatureCollection
// that any GIS tool or web map can load, one feature per cell plus one per region
// polygon. GeoJSON positions are `[lon, lat]`, the reverse of the journal's order.
// A colour scale turns each non-null value into a `fill_color` property and an optional
// label hook adds a `label` property, so web maps can style cells without recomputing.

use crate::core_modules::cell_value::ValueRecord;
use crate::core_modules::coordinate::Coordinate;
use crate::core_modules::region_builder::Region;
use crate::error::Result;
use serde_json::{Map, Value, json};
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Consumer of the engine's final records and region.
pub trait Renderer {
    /// File extension of the saved artifact, without the dot.
    fn extension(&self) -> &str;

    /// Takes in the finished records and the current region.
    fn render(&mut self, records: &[&ValueRecord], region: &Region) -> Result<()>;

    fn save_to_file(&self, path: &Path) -> Result<()>;
}

/// Maps a cell value to a CSS colour.
pub type ColorScale = Box<dyn Fn(f64) -> String + Send + Sync>;
/// Produces an optional label for a finished record.
pub type Label = Box<dyn Fn(&ValueRecord) -> Option<String> + Send + Sync>;

/// Green for 0, red for 1. Values outside `[0, 1]` are clamped.
pub fn default_color_scale(value: f64) -> String {
    let hue = 130.0 * (1.0 - value.clamp(0.0, 1.0));
    format!("hsl({hue:.2}, 75%, 50%)")
}

/// Renders cells and region polygons into a GeoJSON FeatureCollection.
pub struct GeoJsonRenderer {
    features: Vec<Value>,
    color_scale: ColorScale,
    label: Option<Label>,
}

impl Default for GeoJsonRenderer {
    fn default() -> Self {
        Self {
            features: Vec::new(),
            color_scale: Box::new(default_color_scale),
            label: None,
        }
    }
}

impl fmt::Debug for GeoJsonRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeoJsonRenderer")
            .field("features", &self.features.len())
            .field("label", &self.label.is_some())
            .finish_non_exhaustive()
    }
}

impl GeoJsonRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_color_scale(
        mut self,
        scale: impl Fn(f64) -> String + Send + Sync + 'static,
    ) -> Self {
        self.color_scale = Box::new(scale);
        self
    }

    pub fn with_label(
        mut self,
        label: impl Fn(&ValueRecord) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.label = Some(Box::new(label));
        self
    }

    pub fn features(&self) -> &[Value] {
        &self.features
    }

    /// Adds a point marker, e.g. from a `before_saving` hook.
    pub fn add_point(&mut self, at: Coordinate, properties: Map<String, Value>) {
        self.features.push(json!({
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [at.lon, at.lat] },
            "properties": properties,
        }));
    }

    pub fn to_geo_json(&self) -> Value {
        json!({
            "type": "FeatureCollection",
            "features": self.features,
        })
    }
}

impl Renderer for GeoJsonRenderer {
    fn extension(&self) -> &str {
        "geojson"
    }

    fn render(&mut self, records: &[&ValueRecord], region: &Region) -> Result<()> {
        self.features.clear();

        for record in records {
            let mut properties = record.extra.clone();
            properties.insert("idx".into(), json!(record.idx));
            properties.insert("value".into(), json!(record.value));
            if let Some(original) = record.original_value {
                properties.insert("original_value".into(), json!(original));
            }
            if record.failed {
                properties.insert("failed".into(), json!(true));
            }
            if let Some(value) = record.value {
                properties.insert("fill_color".into(), json!((self.color_scale)(value)));
            }
            if let Some(label) = self.label.as_ref().and_then(|label| label(*record)) {
                properties.insert("label".into(), json!(label));
            }
            self.features.push(feature(vec![ring_positions(&record.poly)], properties));
        }

        for rings in region.rings() {
            let mut properties = region.style.clone();
            properties.insert("kind".into(), json!("region"));
            let rings = rings.iter().map(|ring| ring_positions(ring)).collect();
            self.features.push(feature(rings, properties));
        }

        debug!(features = self.features.len(), "rendered geojson");
        Ok(())
    }

    fn save_to_file(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), &self.to_geo_json())?;
        Ok(())
    }
}

fn ring_positions(ring: &[Coordinate]) -> Value {
    Value::Array(ring.iter().map(|c| json!([c.lon, c.lat])).collect())
}

fn feature(rings: Vec<Value>, properties: Map<String, Value>) -> Value {
    json!({
        "type": "Feature",
        "geometry": { "type": "Polygon", "coordinates": rings },
        "properties": properties,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::cell_value::CellValue;
    use crate::core_modules::grid_builder::square_cell;
    use crate::core_modules::grid_builder::Cell;

    fn record(idx: usize) -> ValueRecord {
        let (polygon, _) = square_cell(Coordinate::new(48.0, 11.0), 1_000.0);
        let mut extra = Map::new();
        extra.insert("lin_value".into(), json!(1.5));
        ValueRecord::new(&Cell { idx, polygon }, CellValue::Structured { value: 0.25, extra })
    }

    #[test]
    fn cells_become_polygon_features_in_lon_lat_order() {
        let record = record(4);
        let mut renderer = GeoJsonRenderer::new();
        renderer.render(&[&record], &Region::default()).unwrap();

        let features = renderer.features();
        assert_eq!(features.len(), 1);
        let properties = &features[0]["properties"];
        assert_eq!(properties["idx"], 4);
        assert_eq!(properties["value"], 0.25);
        assert_eq!(properties["lin_value"], 1.5);
        assert_eq!(properties["fill_color"], "hsl(97.50, 75%, 50%)");
        assert!(properties.get("original_value").is_none());
        assert!(properties.get("label").is_none());

        let first = &features[0]["geometry"]["coordinates"][0][0];
        assert_eq!(first[0], 11.0);
        assert_eq!(first[1], 48.0);
    }

    #[test]
    fn color_scale_and_label_hooks_style_each_cell() {
        let valued = record(1);
        let mut missing = record(2);
        missing.value = None;
        missing.failed = true;

        let mut renderer = GeoJsonRenderer::new()
            .with_color_scale(|v| format!("hsla(180, 75%, 50%, {v:.3})"))
            .with_label(|r| r.extra_f64("lin_value").map(|km| format!("{km} km")));
        renderer.render(&[&valued, &missing], &Region::default()).unwrap();

        let valued = &renderer.features()[0]["properties"];
        assert_eq!(valued["fill_color"], "hsla(180, 75%, 50%, 0.250)");
        assert_eq!(valued["label"], "1.5 km");
        let missing = &renderer.features()[1]["properties"];
        assert!(missing.get("fill_color").is_none());
        assert_eq!(missing["failed"], true);
    }

    #[test]
    fn default_scale_runs_green_to_red() {
        assert_eq!(default_color_scale(0.0), "hsl(130.00, 75%, 50%)");
        assert_eq!(default_color_scale(1.0), "hsl(0.00, 75%, 50%)");
        assert_eq!(default_color_scale(-3.0), default_color_scale(0.0));
    }

    #[test]
    fn region_polygons_carry_style_options() {
        let (polygon, _) = square_cell(Coordinate::new(0.0, 0.0), 5_000.0);
        let mut style = Map::new();
        style.insert("color".into(), json!("#0ef"));
        let region = Region {
            polygons: vec![polygon],
            style,
        };

        let mut renderer = GeoJsonRenderer::new();
        renderer.render(&[], &region).unwrap();
        let properties = &renderer.features()[0]["properties"];
        assert_eq!(properties["kind"], "region");
        assert_eq!(properties["color"], "#0ef");
    }

    #[test]
    fn markers_are_added_after_rendering() {
        let record = record(0);
        let mut renderer = GeoJsonRenderer::new();
        renderer.render(&[&record], &Region::default()).unwrap();
        renderer.add_point(Coordinate::new(48.1, 11.5), Map::new());

        let marker = &renderer.features()[1];
        assert_eq!(marker["geometry"]["type"], "Point");
        assert_eq!(marker["geometry"]["coordinates"], json!([11.5, 48.1]));
    }

    #[test]
    fn saved_file_is_a_feature_collection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.geojson");
        let record = record(0);
        let mut renderer = GeoJsonRenderer::new();
        renderer.render(&[&record], &Region::default()).unwrap();
        renderer.save_to_file(&path).unwrap();

        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["type"], "FeatureCollection");
        assert_eq!(saved["features"].as_array().unwrap().len(), 1);
    }
}
