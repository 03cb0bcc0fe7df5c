// THEORY:
// The `coordinate` module holds the two tiny value types every other module speaks:
// a geographic `Coordinate` and the `BoundingBox` of a region. It also owns the one
// piece of spherical math the engine needs, the destination point reached by walking
// a distance along a fixed bearing.
//
// Key architectural principles:
// 1.  **Latitude First**: A `Coordinate` is always (latitude, longitude) and is
//     serialized as a `[lat, lon]` pair. Polygons inside the engine are `geo`
//     polygons with x = longitude and y = latitude; the helpers here are the only
//     place that swaps the axes.
// 2.  **Approximate Geodesy**: The destination point is computed on a sphere of mean
//     Earth radius. Cells are only ever an approximation of a square, so the
//     difference to an ellipsoidal geodesic is irrelevant at cell scale.

use geo::Coord;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mean Earth radius in meters (IUGG).
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// A geographic point in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Converts to a `geo` coordinate (x = longitude, y = latitude).
    pub fn to_geo(self) -> Coord<f64> {
        Coord {
            x: self.lon,
            y: self.lat,
        }
    }

    pub fn from_geo(coord: Coord<f64>) -> Self {
        Self {
            lat: coord.y,
            lon: coord.x,
        }
    }

    /// The point reached by travelling `distance_m` meters from `self` along the
    /// initial `bearing_deg` (clockwise from north), on a spherical Earth.
    pub fn destination(self, bearing_deg: f64, distance_m: f64) -> Coordinate {
        let lat1 = self.lat.to_radians();
        let lon1 = self.lon.to_radians();
        let bearing = bearing_deg.to_radians();
        let angular = distance_m / EARTH_RADIUS_METERS;

        let lat2 = (lat1.sin() * angular.cos() + lat1.cos() * angular.sin() * bearing.cos()).asin();
        let lon2 = lon1
            + (bearing.sin() * angular.sin() * lat1.cos())
                .atan2(angular.cos() - lat1.sin() * lat2.sin());

        Coordinate {
            lat: lat2.to_degrees(),
            lon: lon2.to_degrees(),
        }
    }

    /// Great-circle distance in meters.
    pub fn haversine_distance(self, other: Coordinate) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lon = (other.lon - self.lon).to_radians();
        let (lat_a, lat_b) = (self.lat.to_radians(), other.lat.to_radians());
        let a = (d_lat / 2.0).sin().powi(2)
            + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_METERS * a.sqrt().asin()
    }
}

impl From<[f64; 2]> for Coordinate {
    fn from([lat, lon]: [f64; 2]) -> Self {
        Self { lat, lon }
    }
}

impl From<Coordinate> for [f64; 2] {
    fn from(coord: Coordinate) -> Self {
        [coord.lat, coord.lon]
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lon)
    }
}

/// `[[minLat, minLon], [maxLat, maxLon]]` of a region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[Coordinate; 2]", into = "[Coordinate; 2]")]
pub struct BoundingBox {
    pub min: Coordinate,
    pub max: Coordinate,
}

impl BoundingBox {
    pub fn new(min: Coordinate, max: Coordinate) -> Self {
        Self { min, max }
    }

    /// Grows the box so that it also covers `other`.
    pub fn merge(self, other: BoundingBox) -> BoundingBox {
        BoundingBox {
            min: Coordinate::new(self.min.lat.min(other.min.lat), self.min.lon.min(other.min.lon)),
            max: Coordinate::new(self.max.lat.max(other.max.lat), self.max.lon.max(other.max.lon)),
        }
    }
}

impl From<[Coordinate; 2]> for BoundingBox {
    fn from([min, max]: [Coordinate; 2]) -> Self {
        Self { min, max }
    }
}

impl From<BoundingBox> for [Coordinate; 2] {
    fn from(bbox: BoundingBox) -> Self {
        [bbox.min, bbox.max]
    }
}
