use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeatmapError {
    #[error("io {0}")]
    Io(#[from] io::Error),
    #[error("json {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid boundary: {0}")]
    InvalidBoundary(String),
    #[error("boundary contains no polygons")]
    EmptyBoundary,
    #[error("square size must be a positive number of meters, got {0}")]
    InvalidSquareSize(f64),
    #[error("grid generation stalled at latitude {lat}")]
    GridStalled { lat: f64 },
    #[error("journal line {line} is corrupt: {source}")]
    CorruptJournal {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("cell {0} is not part of the grid")]
    UnknownCell(usize),
    #[error("worker pool {0}")]
    WorkerPool(String),
}

pub type Result<T, E = HeatmapError> = std::result::Result<T, E>;
