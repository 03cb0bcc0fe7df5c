// THEORY:
// This file is the main entry point for the `geo_heatmap` library crate.
// It exposes the `HeatMap` pipeline and its configuration as the high-level interface
// of the engine, together with the `Renderer` seam and the `Getter` seam through which
// callers plug in their own output and their own data source.
//
// The building blocks live in `core_modules` (boundary parsing, grid tiling, the
// value store, normalization, region derivation) and stay usable on their own for
// callers who want a single phase without the full pipeline.

pub mod core_modules;
pub mod error;
pub mod parallel_fetcher;
pub mod pipeline;
pub mod renderer;

pub use core_modules::cell_value::{CellValue, Getter, GetterResult, ValueRecord};
pub use core_modules::coordinate::{BoundingBox, Coordinate};
pub use error::{HeatmapError, Result};
pub use parallel_fetcher::FetchConfig;
pub use pipeline::{HeatMap, HeatMapConfig, Region, StyleOptions};
pub use renderer::{GeoJsonRenderer, Renderer, default_color_scale};
