// THEORY:
// The `pipeline` module is the top-level API of the heatmap engine. `HeatMap` owns one
// run from boundary to rendered artifact and exposes each phase as a single call:
//
//   new -> generate(getter) -> normalize(transform) -> generate_polygon(predicate) -> render
//
// Phases never overlap. Only `generate` is async, because only fetching waits on the
// outside world; every other phase is a synchronous pass over data the previous phase
// left behind.

use crate::core_modules::boundary::Boundary;
use crate::core_modules::cell_value::{Getter, ValueRecord};
use crate::core_modules::coordinate::{BoundingBox, Coordinate};
use crate::core_modules::grid_builder::{Cell, Grid};
use crate::core_modules::normalizer;
use crate::core_modules::region_builder::{self, SmoothingParams};
use crate::core_modules::value_store::ValueStore;
use crate::error::Result;
use crate::parallel_fetcher::{FetchConfig, WorkerPool};
use crate::renderer::Renderer;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

// Re-export key data structures for the public API.
pub use crate::core_modules::normalizer::ValueRange;
pub use crate::core_modules::region_builder::{Region, StyleOptions};

const DEFAULT_SQUARE_SIZE_M: f64 = 250.0;
const DEFAULT_FILENAME: &str = "intermediate_result";
const JOURNAL_EXTENSION: &str = "jsonl";

/// Configuration for a `HeatMap` run.
#[derive(Debug, Clone)]
pub struct HeatMapConfig {
    /// Passed to every getter call unchanged, e.g. the start of a route.
    pub origin: Option<Coordinate>,
    /// Cell side length in meters.
    pub square_size: f64,
    /// Resume from `<filename>.jsonl` if it exists.
    pub load_intermediate_results: bool,
    /// Journal every finalized cell to `<filename>.jsonl`.
    pub save_intermediate_results: bool,
    /// Path stem of the journal and of rendered output.
    pub filename: String,
    /// Size of the fetch worker pool. Overrides `fetch.num_workers`.
    pub num_threads: usize,
    pub fetch: FetchConfig,
    pub smoothing: SmoothingParams,
}

impl Default for HeatMapConfig {
    fn default() -> Self {
        Self {
            origin: None,
            square_size: DEFAULT_SQUARE_SIZE_M,
            load_intermediate_results: false,
            save_intermediate_results: true,
            filename: DEFAULT_FILENAME.to_string(),
            num_threads: 1,
            fetch: FetchConfig::default(),
            smoothing: SmoothingParams::default(),
        }
    }
}

/// The main, top-level struct of the heatmap engine.
pub struct HeatMap {
    config: HeatMapConfig,
    boundary: Boundary,
    grid: Option<Arc<Grid>>,
    store: ValueStore,
    region: Region,
}

impl HeatMap {
    /// Parses the boundary FeatureCollection. Malformed or empty input is an error.
    pub fn new(config: HeatMapConfig, geo_json: &Value) -> Result<Self> {
        let boundary = Boundary::from_geo_json(geo_json)?;
        info!(polygons = boundary.polygons().len(), "boundary loaded");
        Ok(Self::with_boundary(config, boundary))
    }

    pub fn with_boundary(config: HeatMapConfig, boundary: Boundary) -> Self {
        Self {
            config,
            boundary,
            grid: None,
            store: ValueStore::in_memory(),
            region: Region::default(),
        }
    }

    pub fn config(&self) -> &HeatMapConfig {
        &self.config
    }

    pub fn boundary(&self) -> &Boundary {
        &self.boundary
    }

    pub fn bounding_box(&self) -> BoundingBox {
        self.boundary.bounding_box()
    }

    /// The generated cells; empty until the grid has been generated.
    pub fn cells(&self) -> &[Cell] {
        self.grid.as_deref().map(Grid::cells).unwrap_or(&[])
    }

    pub fn records(&self) -> impl Iterator<Item = &ValueRecord> {
        self.store.records()
    }

    pub fn store(&self) -> &ValueStore {
        &self.store
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn journal_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.{JOURNAL_EXTENSION}", self.config.filename))
    }

    /// Builds the grid on first use and returns it.
    pub fn generate_units(&mut self) -> Result<Arc<Grid>> {
        if let Some(grid) = &self.grid {
            return Ok(grid.clone());
        }
        let grid = Arc::new(Grid::for_boundary(&self.boundary, self.config.square_size)?);
        self.grid = Some(grid.clone());
        Ok(grid)
    }

    /// Generates the grid, opens the store and fetches a value for every missing cell.
    pub async fn generate<G: Getter>(&mut self, getter: G) -> Result<()> {
        // Stage 1: Units
        let grid = self.generate_units()?;

        // Stage 2: Store
        let path = self.journal_path();
        let (save, resume) = (
            self.config.save_intermediate_results,
            self.config.load_intermediate_results,
        );
        let mut store = match (save, resume) {
            (true, resume) => ValueStore::load(&path, resume)?,
            (false, true) => ValueStore::read_only(&path)?,
            (false, false) => ValueStore::in_memory(),
        };
        let dropped = store.retain_grid(&grid);
        if dropped > 0 {
            warn!(dropped, "ignoring journaled records outside the current grid");
        }

        // Stage 3: Fetch
        let fetch = FetchConfig {
            num_workers: self.config.num_threads,
            ..self.config.fetch.clone()
        };
        let store = WorkerPool::new(fetch)
            .fill(grid, store, Arc::new(getter), self.config.origin)
            .await?;
        info!(records = store.len(), "all units have values");
        self.store = store;
        Ok(())
    }

    /// Rescales every non-null value in place. See [`normalizer::normalize`].
    pub fn normalize(
        &mut self,
        transform: Option<&dyn Fn(f64, f64, f64) -> f64>,
    ) -> Option<ValueRange> {
        normalizer::normalize(&mut self.store, transform)
    }

    /// Derives the region of records matching `predicate`, replacing any earlier one.
    pub fn generate_polygon<P>(&mut self, predicate: P, style: StyleOptions) -> &Region
    where
        P: Fn(&ValueRecord) -> bool,
    {
        self.region = region_builder::derive_region(
            self.store.records(),
            predicate,
            style,
            &self.config.smoothing,
        );
        &self.region
    }

    /// Hands records and region to `renderer`, runs `before_saving` and saves to
    /// `<filename>.<extension>`. Returns the written path.
    pub fn render<R: Renderer>(
        &self,
        renderer: &mut R,
        before_saving: Option<&dyn Fn(&mut R, &HeatMap) -> Result<()>>,
    ) -> Result<PathBuf> {
        info!("rendering");
        let records = self.store.records().collect::<Vec<_>>();
        renderer.render(&records, &self.region)?;
        if let Some(hook) = before_saving {
            hook(renderer, self)?;
        }

        let path = PathBuf::from(format!("{}.{}", self.config.filename, renderer.extension()));
        renderer.save_to_file(&path)?;
        info!(path = %path.display(), "saved");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::cell_value::{CellValue, GetterResult};
    use crate::error::HeatmapError;
    use crate::renderer::GeoJsonRenderer;
    use serde_json::json;
    use std::time::Duration;

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

    fn config(dir: &tempfile::TempDir) -> HeatMapConfig {
        HeatMapConfig {
            square_size: 66_000.0,
            filename: dir.path().join("run").to_string_lossy().into_owned(),
            fetch: FetchConfig {
                retry_pause: Duration::from_millis(1),
                pass_backoff: Duration::from_millis(1),
                ..FetchConfig::default()
            },
            ..HeatMapConfig::default()
        }
    }

    fn by_latitude(_: Option<Coordinate>, point: Coordinate) -> GetterResult {
        Ok(Some(CellValue::Number(point.lat)))
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = HeatMapConfig::default();
        assert_eq!(config.square_size, 250.0);
        assert!(!config.load_intermediate_results);
        assert!(config.save_intermediate_results);
        assert_eq!(config.filename, "intermediate_result");
        assert_eq!(config.num_threads, 1);
        assert_eq!(config.fetch.attempts_per_pass, 5);
        assert_eq!(config.fetch.retry_pause, Duration::from_millis(500));
        assert_eq!(config.fetch.pass_backoff, Duration::from_secs(5));
        assert!(config.fetch.max_passes.is_none());
    }

    #[test]
    fn empty_or_malformed_boundaries_are_rejected() {
        let empty = json!({ "type": "FeatureCollection", "features": [] });
        assert!(matches!(
            HeatMap::new(HeatMapConfig::default(), &empty),
            Err(HeatmapError::EmptyBoundary)
        ));
        let malformed = json!({
            "features": [{ "geometry": { "type": "Polygon", "coordinates": "nope" } }]
        });
        assert!(matches!(
            HeatMap::new(HeatMapConfig::default(), &malformed),
            Err(HeatmapError::InvalidBoundary(_))
        ));
    }

    #[test]
    fn bounding_box_covers_the_boundary() {
        let heatmap = HeatMap::new(HeatMapConfig::default(), &unit_square()).unwrap();
        let bbox = heatmap.bounding_box();
        assert_eq!(bbox.min, Coordinate::new(0.0, 0.0));
        assert_eq!(bbox.max, Coordinate::new(1.0, 1.0));
        assert!(heatmap.cells().is_empty());
    }

    #[tokio::test]
    async fn generate_journals_every_cell() {
        let dir = tempfile::tempdir().unwrap();
        let mut heatmap = HeatMap::new(config(&dir), &unit_square()).unwrap();
        heatmap.generate(by_latitude).await.unwrap();

        assert_eq!(heatmap.cells().len(), 4);
        assert_eq!(heatmap.records().count(), 4);
        let journal = std::fs::read_to_string(heatmap.journal_path()).unwrap();
        assert_eq!(journal.lines().count(), 4);
    }

    #[tokio::test]
    async fn disabled_saving_keeps_everything_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let config = HeatMapConfig {
            save_intermediate_results: false,
            ..config(&dir)
        };
        let mut heatmap = HeatMap::new(config, &unit_square()).unwrap();
        heatmap.generate(by_latitude).await.unwrap();

        assert_eq!(heatmap.records().count(), 4);
        assert!(!heatmap.journal_path().exists());
    }

    #[tokio::test]
    async fn render_saves_next_to_the_journal() {
        let dir = tempfile::tempdir().unwrap();
        let mut heatmap = HeatMap::new(config(&dir), &unit_square()).unwrap();
        heatmap.generate(by_latitude).await.unwrap();
        heatmap.normalize(None);
        heatmap.generate_polygon(|r| r.value.is_some_and(|v| v < 0.5), StyleOptions::new());

        let mut renderer = GeoJsonRenderer::new();
        let hook: &dyn Fn(&mut GeoJsonRenderer, &HeatMap) -> Result<()> = &|renderer, heatmap| {
            let expected = heatmap.records().count() + heatmap.region().polygons.len();
            assert_eq!(renderer.features().len(), expected);
            Ok(())
        };
        let path = heatmap.render(&mut renderer, Some(hook)).unwrap();

        assert_eq!(path, dir.path().join("run.geojson"));
        assert!(path.is_file());
    }
}
