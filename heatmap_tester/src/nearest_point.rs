// THEORY:
// `NearestPointGetter` is a self-contained data source for exercising the engine
// without any network: the value of a cell is the distance to the nearest point of
// interest (public toilets, bike stations, ...) loaded from a GeoJSON file.
//
// Key architectural principles:
// 1.  **Cheap Prefilter**: A planar distance in degrees is wrong in absolute terms but
//     ranks nearby points well. Only the closest `PREFILTER_CANDIDATES` by that measure
//     get the exact great-circle distance.
// 2.  **Log-Like Scale**: The primary value is `d^(1/e)`, which spreads out short
//     distances and compresses long ones. The linear distance in kilometers rides
//     along as `lin_value` for region predicates.

use anyhow::{Context, bail};
use geo_heatmap::{CellValue, Coordinate, GetterResult};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::path::Path;
use tracing::{debug, info};

const PREFILTER_CANDIDATES: usize = 15;

#[derive(Debug, Deserialize)]
struct PointCollection {
    features: Vec<PointFeature>,
}

#[derive(Debug, Deserialize)]
struct PointFeature {
    geometry: Option<PointGeometry>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct PointGeometry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    coordinates: Value,
}

/// A point of interest and the properties it was loaded with.
#[derive(Debug, Clone)]
pub struct Landmark {
    pub at: Coordinate,
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct NearestPointGetter {
    landmarks: Vec<Landmark>,
}

impl NearestPointGetter {
    /// Reads every `Point` feature of a FeatureCollection. Other geometries are skipped.
    pub fn from_geo_json(data: &Value) -> anyhow::Result<Self> {
        let collection: PointCollection =
            serde_json::from_value(data.clone()).context("not a feature collection")?;

        let landmarks = collection
            .features
            .into_iter()
            .filter_map(|feature| {
                let geometry = feature.geometry.filter(|g| g.kind == "Point")?;
                let position: Vec<f64> = serde_json::from_value(geometry.coordinates).ok()?;
                let (lon, lat) = (*position.first()?, *position.get(1)?);
                Some(Landmark {
                    at: Coordinate::new(lat, lon),
                    properties: feature.properties.unwrap_or_default(),
                })
            })
            .collect::<Vec<_>>();

        if landmarks.is_empty() {
            bail!("points file contains no Point features");
        }
        info!(points = landmarks.len(), "landmarks loaded");
        Ok(Self { landmarks })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let data: Value =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Self::from_geo_json(&data)
    }

    pub fn landmarks(&self) -> &[Landmark] {
        &self.landmarks
    }

    /// Great-circle distance in kilometers to the nearest landmark.
    pub fn nearest_km(&self, point: Coordinate) -> Option<f64> {
        let mut by_planar = self
            .landmarks
            .iter()
            .map(|l| {
                let (d_lat, d_lon) = (l.at.lat - point.lat, l.at.lon - point.lon);
                (d_lat * d_lat + d_lon * d_lon, l.at)
            })
            .collect::<Vec<_>>();
        if by_planar.len() > PREFILTER_CANDIDATES {
            by_planar.select_nth_unstable_by(PREFILTER_CANDIDATES - 1, |a, b| a.0.total_cmp(&b.0));
            by_planar.truncate(PREFILTER_CANDIDATES);
        }

        by_planar
            .into_iter()
            .map(|(_, at)| at.haversine_distance(point) / 1_000.0)
            .min_by(f64::total_cmp)
    }

    pub fn value(&self, _origin: Option<Coordinate>, point: Coordinate) -> GetterResult {
        let Some(km) = self.nearest_km(point) else {
            return Ok(None);
        };
        debug!(%point, km, "nearest landmark");

        let mut extra = Map::new();
        extra.insert("lin_value".into(), json!(km));
        Ok(Some(CellValue::Structured {
            value: km.powf(std::f64::consts::E.recip()),
            extra,
        }))
    }
}
