// THEORY:
// The `Normalizer` brings raw getter values onto a comparable scale before regions and
// colors are derived from them. It is a single, stateless pass over the store.
//
// Key architectural principles:
// 1.  **Range First**: The minimum and maximum over all non-null values are computed
//     before any record is touched. Null values are skipped and stay null.
// 2.  **Raw Value Kept Once**: The first pass copies each raw value into
//     `original_value`. Later passes transform `value` further but leave
//     `original_value` alone, so the raw input is never lost.
// 3.  **Guarded Default**: The default rescale is `(v - min) / (max - min)`. When every
//     value is equal that ratio is undefined, and every value maps to 0.0 instead.
//     A custom transform receives min and max as they are and owns its own codomain.

use crate::core_modules::value_store::ValueStore;
use tracing::{debug, info};

/// The observed range of non-null values at normalization time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    /// Linear rescale onto `[0, 1]`; a degenerate range maps everything to 0.0.
    pub fn rescale(&self, value: f64) -> f64 {
        let span = self.max - self.min;
        if span > 0.0 { (value - self.min) / span } else { 0.0 }
    }
}

/// Rescales every non-null record value in place. With `transform` set, the new value
/// is `transform(value, min, max)`; otherwise the linear rescale of [`ValueRange`].
/// Returns the range used, or `None` when there was nothing to normalize.
pub fn normalize(
    store: &mut ValueStore,
    transform: Option<&dyn Fn(f64, f64, f64) -> f64>,
) -> Option<ValueRange> {
    info!("normalizing");
    let range = store
        .records()
        .filter_map(|r| r.value)
        .fold(None, |range: Option<ValueRange>, v| {
            Some(match range {
                Some(r) => ValueRange {
                    min: r.min.min(v),
                    max: r.max.max(v),
                },
                None => ValueRange { min: v, max: v },
            })
        })?;
    debug!(min = range.min, max = range.max, "value range");

    for record in store.records_mut() {
        let Some(value) = record.value else {
            continue;
        };
        record.original_value.get_or_insert(value);
        record.value = Some(match transform {
            Some(f) => f(value, range.min, range.max),
            None => range.rescale(value),
        });
    }
    Some(range)
}
