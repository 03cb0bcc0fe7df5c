// THEORY:
// The `boundary` module turns the caller's region description, a GeoJSON
// FeatureCollection, into the list of polygons the grid is clipped against.
//
// Key architectural principles:
// 1.  **Fail Early**: A boundary that cannot be parsed, or that yields no polygon at
//     all, makes every later stage meaningless. Both are reported as errors here,
//     before any cell is generated.
// 2.  **Flat Polygon List**: `MultiPolygon` features are flattened into their member
//     polygons. A cell is kept when any single polygon fully contains it.
// 3.  **Cached Extent**: The bounding box over all polygons is computed once at
//     construction and never again.

use crate::core_modules::coordinate::{BoundingBox, Coordinate};
use crate::error::{HeatmapError, Result};
use geo::{BoundingRect, Contains, Coord, LineString, Polygon};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Option<Geometry>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    coordinates: Value,
}

/// GeoJSON positions are `[lon, lat, (alt)]`.
type Ring = Vec<Vec<f64>>;

/// The region a heatmap covers: one or more polygons plus their common extent.
#[derive(Debug, Clone)]
pub struct Boundary {
    polygons: Vec<Polygon<f64>>,
    bbox: BoundingBox,
}

impl Boundary {
    /// Parses a GeoJSON FeatureCollection. Every feature must carry a
    /// `Polygon` or `MultiPolygon` geometry.
    pub fn from_geo_json(data: &Value) -> Result<Self> {
        let collection: FeatureCollection = serde_json::from_value(data.clone())
            .map_err(|e| HeatmapError::InvalidBoundary(format!("not a feature collection: {e}")))?;

        let mut polygons = Vec::new();
        for (i, feature) in collection.features.into_iter().enumerate() {
            let geometry = feature.geometry.ok_or_else(|| {
                HeatmapError::InvalidBoundary(format!("feature {i} has no geometry"))
            })?;
            match geometry.kind.as_str() {
                "Polygon" => {
                    let rings: Vec<Ring> = parse_coordinates(geometry.coordinates, i)?;
                    polygons.push(polygon_from_rings(rings, i)?);
                }
                "MultiPolygon" => {
                    let parts: Vec<Vec<Ring>> = parse_coordinates(geometry.coordinates, i)?;
                    for rings in parts {
                        polygons.push(polygon_from_rings(rings, i)?);
                    }
                }
                other => {
                    return Err(HeatmapError::InvalidBoundary(format!(
                        "feature {i} has unsupported geometry type {other}"
                    )));
                }
            }
        }

        Self::from_polygons(polygons)
    }

    pub fn from_geo_json_str(data: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(data)?;
        Self::from_geo_json(&value)
    }

    /// Builds a boundary from polygons already in engine axes (x = lon, y = lat).
    pub fn from_polygons(polygons: Vec<Polygon<f64>>) -> Result<Self> {
        let bbox = polygons
            .iter()
            .filter_map(|p| p.bounding_rect())
            .map(|rect| {
                BoundingBox::new(Coordinate::from_geo(rect.min()), Coordinate::from_geo(rect.max()))
            })
            .reduce(BoundingBox::merge)
            .ok_or(HeatmapError::EmptyBoundary)?;
        Ok(Self { polygons, bbox })
    }

    pub fn polygons(&self) -> &[Polygon<f64>] {
        &self.polygons
    }

    pub fn bounding_box(&self) -> BoundingBox {
        self.bbox
    }

    /// True when at least one boundary polygon fully contains `cell`.
    pub fn contains(&self, cell: &Polygon<f64>) -> bool {
        self.polygons.iter().any(|p| p.contains(cell))
    }
}

fn parse_coordinates<T: DeserializeOwned>(coordinates: Value, feature: usize) -> Result<T> {
    serde_json::from_value(coordinates).map_err(|e| {
        HeatmapError::InvalidBoundary(format!("feature {feature} has malformed coordinates: {e}"))
    })
}

fn polygon_from_rings(rings: Vec<Ring>, feature: usize) -> Result<Polygon<f64>> {
    let mut rings = rings.into_iter().map(|ring| line_string_from_ring(ring, feature));
    let exterior = rings.next().ok_or_else(|| {
        HeatmapError::InvalidBoundary(format!("feature {feature} has a polygon without rings"))
    })??;
    let interiors = rings.collect::<Result<Vec<_>>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn line_string_from_ring(ring: Ring, feature: usize) -> Result<LineString<f64>> {
    let coords = ring
        .into_iter()
        .map(|position| match position.as_slice() {
            [lon, lat, ..] if lon.is_finite() && lat.is_finite() => Ok(Coord { x: *lon, y: *lat }),
            _ => Err(HeatmapError::InvalidBoundary(format!(
                "feature {feature} has an invalid position {position:?}"
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    let mut distinct = coords.clone();
    distinct.dedup();
    if distinct.first() == distinct.last() {
        distinct.pop();
    }
    if distinct.len() < 3 {
        return Err(HeatmapError::InvalidBoundary(format!(
            "feature {feature} has a ring with fewer than three distinct positions"
        )));
    }
    Ok(LineString::from(coords))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;
    use serde_json::json;

    fn unit_square() -> Value {
        json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {},
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[0.0, 0.0], [0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]]]
                }
            }]
        })
    }

    #[test]
    fn parses_polygon_feature() {
        let boundary = Boundary::from_geo_json(&unit_square()).unwrap();
        assert_eq!(boundary.polygons().len(), 1);
        let bbox = boundary.bounding_box();
        assert_eq!(bbox.min, Coordinate::new(0.0, 0.0));
        assert_eq!(bbox.max, Coordinate::new(1.0, 1.0));
    }

    #[test]
    fn flattens_multipolygons_and_merges_extent() {
        let data = json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": {
                    "type": "MultiPolygon",
                    "coordinates": [
                        [[[0.0, 0.0], [0.0, 1.0], [1.0, 1.0], [0.0, 0.0]]],
                        [[[5.0, 2.0, 30.0], [6.0, 2.0, 30.0], [6.0, 4.0, 30.0], [5.0, 2.0, 30.0]]]
                    ]
                }
            }]
        });
        let boundary = Boundary::from_geo_json(&data).unwrap();
        assert_eq!(boundary.polygons().len(), 2);
        let bbox = boundary.bounding_box();
        assert_eq!(bbox.min, Coordinate::new(0.0, 0.0));
        assert_eq!(bbox.max, Coordinate::new(4.0, 6.0));
    }

    #[test]
    fn contains_requires_full_containment() {
        let boundary = Boundary::from_geo_json(&unit_square()).unwrap();
        let inside = polygon![
            (x: 0.0, y: 0.0),
            (x: 0.5, y: 0.0),
            (x: 0.5, y: 0.5),
            (x: 0.0, y: 0.5),
        ];
        let straddling = polygon![
            (x: 0.8, y: 0.8),
            (x: 1.2, y: 0.8),
            (x: 1.2, y: 1.2),
            (x: 0.8, y: 1.2),
        ];
        assert!(boundary.contains(&inside));
        assert!(!boundary.contains(&straddling));
    }

    #[test]
    fn rejects_empty_collection() {
        let data = json!({ "type": "FeatureCollection", "features": [] });
        assert!(matches!(Boundary::from_geo_json(&data), Err(HeatmapError::EmptyBoundary)));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(
            Boundary::from_geo_json(&json!({ "type": "Feature" })),
            Err(HeatmapError::InvalidBoundary(_))
        ));

        let point = json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": { "type": "Point", "coordinates": [1.0, 2.0] }
            }]
        });
        assert!(matches!(Boundary::from_geo_json(&point), Err(HeatmapError::InvalidBoundary(_))));

        let degenerate = json!({
            "type": "FeatureCollection",
            "features": [{ "type": "Feature", "geometry": {
                "type": "Polygon", "coordinates": [[[0.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]
            } }]
        });
        assert!(matches!(
            Boundary::from_geo_json(&degenerate),
            Err(HeatmapError::InvalidBoundary(_))
        ));

        assert!(Boundary::from_geo_json_str("not json").is_err());
    }
}
