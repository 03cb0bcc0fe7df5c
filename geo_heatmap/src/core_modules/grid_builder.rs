// THEORY:
// The `GridBuilder` tiles a region into the cells the heatmap is sampled on. It is the
// spatial counterpart of slicing an image into chunks: the bounding box is walked row by
// row, a square-ish cell is laid down at each step, and only cells lying completely
// inside the region survive.
//
// Key architectural principles:
// 1.  **Geodesic Cells**: A cell is not constructed in degree space. From its origin
//     corner, a destination point is computed `square_size` meters away along a fixed
//     35° bearing, and the cell is the lat/lon rectangle spanned by origin and
//     destination. Its shape therefore depends on latitude; downstream containment and
//     union work on these exact shapes.
// 2.  **Edge-to-Edge Walk**: Each next cell starts where the previous one ended in
//     longitude, and each next row starts at the far latitude edge of the previous row.
//     Cells share edges and never overlap.
// 3.  **Dense, Stable Indices**: Kept cells receive sequential indices in walk order.
//     The walk is deterministic, so the same boundary and square size always yield the
//     same indices, which is what makes journals resumable across runs.
// 4.  **Guaranteed Progress**: Every step must strictly advance; a walk that stops
//     moving (e.g. at a pole) is an error instead of an endless loop.

use crate::core_modules::boundary::Boundary;
use crate::core_modules::coordinate::{BoundingBox, Coordinate};
use crate::error::{HeatmapError, Result};
use geo::{Contains, LineString, Polygon};
use tracing::{debug, info};

/// Bearing (degrees clockwise from north) along which a cell's far corner is located.
pub const CELL_BEARING_DEG: f64 = 35.0;

/// One tile of the grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    /// Dense, unique index in `0..grid.len()`.
    pub idx: usize,
    /// Closed ring in engine axes (x = lon, y = lat):
    /// origin, (dest.lat, origin.lon), dest, (origin.lat, dest.lon), origin.
    pub polygon: Polygon<f64>,
}

impl Cell {
    /// The exterior ring as `[lat, lon]` coordinates, closing point included.
    pub fn ring(&self) -> Vec<Coordinate> {
        self.polygon
            .exterior()
            .coords()
            .map(|c| Coordinate::from_geo(*c))
            .collect()
    }

    /// Approximate centroid: the mean of the first four exterior vertices.
    pub fn representative_point(&self) -> Coordinate {
        let corners: Vec<Coordinate> = self.ring().into_iter().take(4).collect();
        let n = corners.len().max(1) as f64;
        let lat = corners.iter().map(|c| c.lat).sum::<f64>() / n;
        let lon = corners.iter().map(|c| c.lon).sum::<f64>() / n;
        Coordinate::new(lat, lon)
    }
}

/// Builds the cell whose origin corner is `origin` and whose far corner lies
/// `side_m` meters away at [`CELL_BEARING_DEG`]. Returns the cell polygon and that far corner.
pub fn square_cell(origin: Coordinate, side_m: f64) -> (Polygon<f64>, Coordinate) {
    let dest = origin.destination(CELL_BEARING_DEG, side_m);
    let ring = [
        origin,
        Coordinate::new(dest.lat, origin.lon),
        dest,
        Coordinate::new(origin.lat, dest.lon),
        origin,
    ];
    let polygon = Polygon::new(
        LineString::from(ring.iter().map(|c| c.to_geo()).collect::<Vec<_>>()),
        vec![],
    );
    (polygon, dest)
}

/// The generated cells of a region, indexed by `Cell::idx`.
#[derive(Debug, Clone, Default)]
pub struct Grid {
    cells: Vec<Cell>,
}

impl Grid {
    /// Tiles `bbox` with cells of `square_size_m` meters, keeping only cells fully
    /// contained in at least one of `boundaries`.
    pub fn generate(
        bbox: BoundingBox,
        boundaries: &[Polygon<f64>],
        square_size_m: f64,
    ) -> Result<Self> {
        if !(square_size_m.is_finite() && square_size_m > 0.0) {
            return Err(HeatmapError::InvalidSquareSize(square_size_m));
        }
        info!(square_size_m, "generating units");

        let mut cells = Vec::new();
        let mut lat = bbox.min.lat;
        while lat < bbox.max.lat {
            let mut lon = bbox.min.lon;
            let mut next_lat = lat;
            while lon < bbox.max.lon {
                let origin = Coordinate::new(lat, lon);
                let (polygon, dest) = square_cell(origin, square_size_m);
                next_lat = dest.lat.max(origin.lat);
                let next_lon = dest.lon.max(origin.lon);
                if next_lon <= lon {
                    return Err(HeatmapError::GridStalled { lat });
                }
                lon = next_lon;

                if boundaries.iter().any(|b| b.contains(&polygon)) {
                    cells.push(Cell {
                        idx: cells.len(),
                        polygon,
                    });
                }
            }
            if next_lat <= lat {
                return Err(HeatmapError::GridStalled { lat });
            }
            debug!(lat, kept = cells.len(), "row complete");
            lat = next_lat;
        }

        info!(cells = cells.len(), "units generated");
        Ok(Self { cells })
    }

    /// Convenience wrapper over [`Grid::generate`] using the boundary's cached extent.
    pub fn for_boundary(boundary: &Boundary, square_size_m: f64) -> Result<Self> {
        Self::generate(boundary.bounding_box(), boundary.polygons(), square_size_m)
    }

    pub fn get(&self, idx: usize) -> Option<&Cell> {
        self.cells.get(idx)
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.cells.iter().map(|c| c.idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use geo::{Area, BooleanOps, MultiPolygon, polygon};

    fn unit_square() -> Vec<Polygon<f64>> {
        vec![polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)]]
    }

    fn unit_bbox() -> BoundingBox {
        BoundingBox::new(Coordinate::new(0.0, 0.0), Coordinate::new(1.0, 1.0))
    }

    #[test]
    fn unit_square_yields_two_by_two_grid() {
        let grid = Grid::generate(unit_bbox(), &unit_square(), 66_000.0).unwrap();
        assert_eq!(grid.len(), 4);
        assert_eq!(grid.indices().collect::<Vec<_>>(), vec![0, 1, 2, 3]);

        // Walk order: the bottom row west to east, then the next row.
        let first = grid.get(0).unwrap().ring();
        assert_eq!(first[0], Coordinate::new(0.0, 0.0));
        assert_abs_diff_eq!(first[2].lat, 0.48620, epsilon = 1e-4);
        assert_abs_diff_eq!(first[2].lon, 0.34046, epsilon = 1e-4);
        let third = grid.get(2).unwrap().ring();
        assert_eq!(third[0].lon, 0.0);
        assert_abs_diff_eq!(third[0].lat, first[2].lat, epsilon = 1e-12);
    }

    #[test]
    fn cell_ring_follows_origin_destination_layout() {
        let (polygon, dest) = square_cell(Coordinate::new(48.0, 11.0), 250.0);
        let cell = Cell { idx: 0, polygon };
        let ring = cell.ring();
        assert_eq!(ring.len(), 5);
        assert_eq!(ring[0], Coordinate::new(48.0, 11.0));
        assert_eq!(ring[1], Coordinate::new(dest.lat, 11.0));
        assert_eq!(ring[2], dest);
        assert_eq!(ring[3], Coordinate::new(48.0, dest.lon));
        assert_eq!(ring[4], ring[0]);

        let center = cell.representative_point();
        assert_abs_diff_eq!(center.lat, (48.0 + dest.lat) / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(center.lon, (11.0 + dest.lon) / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn cells_tile_a_convex_region_without_overlap() {
        let boundary = vec![polygon![
            (x: 11.50, y: 48.10),
            (x: 11.60, y: 48.10),
            (x: 11.60, y: 48.16),
            (x: 11.50, y: 48.16),
        ]];
        let bbox = BoundingBox::new(Coordinate::new(48.10, 11.50), Coordinate::new(48.16, 11.60));
        let grid = Grid::generate(bbox, &boundary, 1_000.0).unwrap();
        assert!(grid.len() > 10);

        for (i, cell) in grid.cells().iter().enumerate() {
            assert_eq!(cell.idx, i);
            assert!(boundary[0].contains(&cell.polygon));
        }

        let total: f64 = grid.cells().iter().map(|c| c.polygon.unsigned_area()).sum();
        let union = grid
            .cells()
            .iter()
            .fold(MultiPolygon::new(vec![]), |acc, c| acc.union(&c.polygon));
        assert_abs_diff_eq!(union.unsigned_area(), total, epsilon = total * 1e-6);

        let tolerance = grid.cells()[0].polygon.unsigned_area() * 1e-6;
        for a in grid.cells() {
            for b in grid.cells().iter().filter(|b| b.idx > a.idx) {
                assert!(a.polygon.intersection(&b.polygon).unsigned_area() < tolerance);
            }
        }
    }

    #[test]
    fn generation_is_deterministic() {
        let a = Grid::generate(unit_bbox(), &unit_square(), 40_000.0).unwrap();
        let b = Grid::generate(unit_bbox(), &unit_square(), 40_000.0).unwrap();
        assert_eq!(a.cells(), b.cells());
    }

    #[test]
    fn cells_outside_the_boundary_are_dropped() {
        let triangle = vec![polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 0.0, y: 1.0)]];
        let square = Grid::generate(unit_bbox(), &unit_square(), 20_000.0).unwrap();
        let clipped = Grid::generate(unit_bbox(), &triangle, 20_000.0).unwrap();
        assert!(clipped.len() < square.len());
        assert!(clipped.cells().iter().all(|c| triangle[0].contains(&c.polygon)));
    }

    #[test]
    fn rejects_non_positive_square_size() {
        for size in [0.0, -5.0, f64::NAN] {
            assert!(matches!(
                Grid::generate(unit_bbox(), &unit_square(), size),
                Err(HeatmapError::InvalidSquareSize(_))
            ));
        }
    }
}
