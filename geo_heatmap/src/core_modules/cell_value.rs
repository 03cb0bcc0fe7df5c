// THEORY:
// The `cell_value` module defines what flows between the external data source and the
// engine: the `Getter` seam that produces a value for a point, the `CellValue` it
// returns, and the `ValueRecord` that is finally stored and journaled for a cell.
//
// Key architectural principles:
// 1.  **Tagged Values**: A getter answers either with a bare number or with a number
//     plus arbitrary named fields. The extra fields travel unchanged into the record,
//     the journal, and the renderer.
// 2.  **Uniform Failure**: A getter error and an empty answer (`Ok(None)`) mean the
//     same thing to the engine: this attempt failed and may be retried.
// 3.  **Snapshot Records**: A record carries its own copy of the cell ring, so a
//     journal line is self-describing without the grid that produced it.

use crate::core_modules::coordinate::Coordinate;
use crate::core_modules::grid_builder::Cell;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

/// What a getter returns for one attempt. `Ok(None)` and `Err(_)` are both failed attempts.
pub type GetterResult = anyhow::Result<Option<CellValue>>;

/// Field names of a [`ValueRecord`] that structured extras may not reuse.
pub const RESERVED_FIELDS: [&str; 5] = ["idx", "poly", "value", "original_value", "failed"];

/// An external source of values, called once per attempt with the heatmap origin
/// (if any) and the cell's representative point.
///
/// Async sources implement this directly. Plain closures and functions are getters
/// too; they may block, so each call runs on tokio's blocking thread pool.
pub trait Getter: Send + Sync + 'static {
    fn get(
        self: Arc<Self>,
        origin: Option<Coordinate>,
        point: Coordinate,
    ) -> BoxFuture<'static, GetterResult>;
}

impl<F> Getter for F
where
    F: Fn(Option<Coordinate>, Coordinate) -> GetterResult + Send + Sync + 'static,
{
    fn get(
        self: Arc<Self>,
        origin: Option<Coordinate>,
        point: Coordinate,
    ) -> BoxFuture<'static, GetterResult> {
        tokio::task::spawn_blocking(move || (*self)(origin, point))
            .map(|joined| {
                joined.unwrap_or_else(|e| Err(anyhow::anyhow!("getter task failed: {e}")))
            })
            .boxed()
    }
}

/// A successful getter answer.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Number(f64),
    Structured { value: f64, extra: Map<String, Value> },
}

impl CellValue {
    pub fn value(&self) -> f64 {
        match self {
            CellValue::Number(value) | CellValue::Structured { value, .. } => *value,
        }
    }

    /// Builds a structured value from a JSON object with a numeric `value` field.
    /// Objects reusing any other [`RESERVED_FIELDS`] name are rejected.
    pub fn from_json(mut object: Map<String, Value>) -> Option<Self> {
        let value = object.remove("value")?.as_f64()?;
        if RESERVED_FIELDS.iter().any(|key| object.contains_key(*key)) {
            return None;
        }
        Some(CellValue::Structured { value, extra: object })
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

/// The finalized value of one cell, as held in memory and written to the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRecord {
    pub idx: usize,
    /// Cell ring as `[lat, lon]` pairs.
    pub poly: Vec<Coordinate>,
    pub value: Option<f64>,
    /// The raw value, set by the first normalization pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_value: Option<f64>,
    /// Set when the cell exhausted a bounded retry budget.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ValueRecord {
    /// Extras named like a record field are dropped so the journal line stays unambiguous.
    pub fn new(cell: &Cell, value: CellValue) -> Self {
        let (value, mut extra) = match value {
            CellValue::Number(value) => (value, Map::new()),
            CellValue::Structured { value, extra } => (value, extra),
        };
        for key in RESERVED_FIELDS {
            if extra.remove(key).is_some() {
                warn!(idx = cell.idx, key, "dropping extra field that shadows a record field");
            }
        }
        Self {
            idx: cell.idx,
            poly: cell.ring(),
            value: Some(value),
            original_value: None,
            failed: false,
            extra,
        }
    }

    /// Terminal record for a cell whose retries were exhausted.
    pub fn failed(cell: &Cell) -> Self {
        Self {
            idx: cell.idx,
            poly: cell.ring(),
            value: None,
            original_value: None,
            failed: true,
            extra: Map::new(),
        }
    }

    /// Looks up a numeric extra field by name.
    pub fn extra_f64(&self, key: &str) -> Option<f64> {
        self.extra.get(key).and_then(Value::as_f64)
    }
}
