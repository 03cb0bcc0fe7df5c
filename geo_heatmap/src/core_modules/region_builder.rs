// THEORY:
// The `RegionBuilder` turns a selection of cells into smooth, contiguous areas, such as
// "everywhere within 1 km of a public toilet". It works purely on the finalized records:
// select, union, smooth.
//
// Key architectural principles:
// 1.  **Predicate Selection**: The caller decides which records belong to the region
//     through a predicate over the whole record, extra fields included.
// 2.  **Union, Then Smooth**: The selected cell rings are unioned into one or more
//     polygons. A union of squares is jagged, so each polygon is buffered outwards,
//     inwards, and outwards again. The net width change is zero, but the staircase
//     edges are rounded off and hairline gaps between cells are closed.
// 3.  **Re-Merge Between Stages**: Whenever a buffering stage leaves several pieces,
//     they are unioned back together before the next stage runs. Pieces that vanish
//     entirely are dropped.
// 4.  **Opaque Styling**: Style options are carried alongside the polygons for the
//     renderer and never interpreted here.

use crate::core_modules::cell_value::ValueRecord;
use crate::core_modules::coordinate::Coordinate;
use geo::{Area, BooleanOps, Buffer, LineString, MultiPolygon, Polygon};
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Renderer-facing style options, passed through untouched.
pub type StyleOptions = Map<String, Value>;

/// Buffer distances (in coordinate units, i.e. degrees) of the smoothing pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothingParams {
    /// First outward buffer.
    pub expand: f64,
    /// Inward buffer; larger than `expand` so that isolated single cells can vanish.
    pub shrink: f64,
    /// Final outward buffer restoring the net width.
    pub expand_again: f64,
}

impl Default for SmoothingParams {
    fn default() -> Self {
        Self {
            expand: 0.005,
            shrink: 0.008,
            expand_again: 0.003,
        }
    }
}

/// Smoothed polygons plus the caller's style options.
#[derive(Debug, Clone, Default)]
pub struct Region {
    pub polygons: Vec<Polygon<f64>>,
    pub style: StyleOptions,
}

impl Region {
    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }

    /// Polygon rings as `[lat, lon]` coordinates: exterior first, then holes.
    pub fn rings(&self) -> Vec<Vec<Vec<Coordinate>>> {
        self.polygons
            .iter()
            .map(|polygon| {
                std::iter::once(polygon.exterior())
                    .chain(polygon.interiors())
                    .map(|ring| ring.coords().map(|c| Coordinate::from_geo(*c)).collect())
                    .collect()
            })
            .collect()
    }

    pub fn area(&self) -> f64 {
        self.polygons.iter().map(|p| p.unsigned_area()).sum()
    }
}

/// Selects the records matching `predicate`, unions their cells and smooths the result.
pub fn derive_region<'a, P>(
    records: impl IntoIterator<Item = &'a ValueRecord>,
    predicate: P,
    style: StyleOptions,
    params: &SmoothingParams,
) -> Region
where
    P: Fn(&ValueRecord) -> bool,
{
    info!("generating area polygon");
    let mut selected = records
        .into_iter()
        .filter(|r| predicate(r))
        .map(record_polygon);

    let Some(first) = selected.next() else {
        return Region {
            polygons: Vec::new(),
            style,
        };
    };
    let union = selected.fold(MultiPolygon::new(vec![first]), |acc, p| acc.union(&p));
    debug!(parts = union.0.len(), "selected cells unioned");

    let polygons = union
        .0
        .iter()
        .flat_map(|polygon| smooth(polygon, params))
        .collect::<Vec<_>>();
    debug!(polygons = polygons.len(), "region smoothed");

    Region { polygons, style }
}

fn record_polygon(record: &ValueRecord) -> Polygon<f64> {
    let ring = record.poly.iter().map(|c| c.to_geo()).collect::<Vec<_>>();
    Polygon::new(LineString::from(ring), vec![])
}

fn smooth(polygon: &Polygon<f64>, params: &SmoothingParams) -> Vec<Polygon<f64>> {
    let expanded = merge_parts(polygon.buffer(params.expand));
    let shrunk = merge_parts(expanded.buffer(-params.shrink));
    let smoothed = merge_parts(shrunk.buffer(params.expand_again));
    smoothed
        .0
        .into_iter()
        .filter(|p| !p.exterior().0.is_empty() && p.unsigned_area() > 0.0)
        .collect()
}

fn merge_parts(parts: MultiPolygon<f64>) -> MultiPolygon<f64> {
    if parts.0.len() <= 1 {
        return parts;
    }
    let mut iter = parts.0.into_iter();
    match iter.next() {
        Some(first) => iter.fold(MultiPolygon::new(vec![first]), |acc, p| acc.union(&p)),
        None => MultiPolygon::new(vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::cell_value::CellValue;
    use crate::core_modules::coordinate::BoundingBox;
    use crate::core_modules::grid_builder::Grid;
    use geo::polygon;
    use serde_json::json;

    fn records(square_size: f64) -> Vec<ValueRecord> {
        records_within(1.0, square_size)
    }

    /// Records for every cell of a square of `side` degrees anchored at the origin.
    fn records_within(side: f64, square_size: f64) -> Vec<ValueRecord> {
        let square = vec![polygon![
            (x: 0.0, y: 0.0),
            (x: side, y: 0.0),
            (x: side, y: side),
            (x: 0.0, y: side),
        ]];
        let bbox = BoundingBox::new(Coordinate::new(0.0, 0.0), Coordinate::new(side, side));
        let grid = Grid::generate(bbox, &square, square_size).unwrap();
        grid.cells()
            .iter()
            .map(|c| ValueRecord::new(c, CellValue::Number(c.idx as f64)))
            .collect()
    }

    fn select(records: &[ValueRecord], predicate: impl Fn(&ValueRecord) -> bool) -> Region {
        derive_region(records, predicate, StyleOptions::new(), &SmoothingParams::default())
    }

    fn union_area(records: &[ValueRecord]) -> f64 {
        merge_parts(MultiPolygon::new(records.iter().map(record_polygon).collect())).unsigned_area()
    }

    #[test]
    fn selecting_everything_yields_one_polygon_of_the_union_area() {
        let records = records(66_000.0);
        let region = select(&records, |_| true);
        assert_eq!(region.polygons.len(), 1);

        let expected = union_area(&records);
        assert!((region.area() - expected).abs() / expected < 0.01);
    }

    #[test]
    fn selecting_nothing_yields_no_polygons() {
        let records = records(66_000.0);
        let region = select(&records, |_| false);
        assert!(region.is_empty());
    }

    #[test]
    fn distant_selections_stay_separate() {
        let records = records(20_000.0);
        let west_or_east = |r: &ValueRecord| r.poly[0].lon < 0.15 || r.poly[2].lon > 0.8;
        let region = select(&records, west_or_east);
        assert_eq!(region.polygons.len(), 2);
    }

    #[test]
    fn cells_narrower_than_the_shrink_vanish() {
        let records = records_within(0.01, 250.0);
        assert!(!records.is_empty());
        let region = derive_region(
            records.iter().take(1),
            |_| true,
            StyleOptions::new(),
            &SmoothingParams::default(),
        );
        assert!(region.is_empty());
    }

    #[test]
    fn style_options_are_passed_through() {
        let records = records(66_000.0);
        let Value::Object(style) = json!({ "color": "#0ef", "dash_array": [5, 5] }) else {
            unreachable!()
        };
        let params = SmoothingParams::default();
        let region = derive_region(&records, |r| r.value == Some(0.0), style.clone(), &params);
        assert_eq!(region.style, style);
        assert_eq!(region.polygons.len(), 1);
        assert_eq!(region.rings()[0].len(), 1);
    }
}
