// THEORY:
// The `parallel_fetcher` is the only part of the engine that waits on the outside world.
// It fills every cell without a finalized record by calling the external getter, using a
// bounded pool of tokio workers that pull from one shared "missing" set.
//
// Key architectural principles:
// 1.  **One Lock, One Truth**: The value store, the missing set, the in-flight counter
//     and the per-cell failure counts live in a single `FetchState` behind one mutex.
//     Claiming a cell (pop from missing) and settling it (append, or re-insert) are each
//     one critical section, so no cell is ever fetched by two workers at once and no
//     finalized record is lost or written twice.
// 2.  **Retry in Two Tiers**: Within a pass a cell gets a fixed number of attempts with
//     a short pause between them. A cell that exhausts its pass goes back into the
//     missing set and the worker backs off before taking new work. By default there is
//     no limit on passes: a getter that never succeeds keeps the pool busy forever.
//     `max_passes` opts into a terminal, null-valued `failed` record instead.
// 3.  **Uniform Failure**: A getter error, an empty answer, a non-finite value and a
//     panic inside the getter are all one failed attempt. Non-finite values cannot be
//     journaled as numbers.
// 4.  **Clean Termination**: A worker only exits when the missing set is empty and no
//     other worker is still holding a cell that might be re-queued. Idle workers park on
//     a `Notify` until a settle wakes them.

use crate::core_modules::cell_value::{CellValue, Getter, ValueRecord};
use crate::core_modules::coordinate::Coordinate;
use crate::core_modules::grid_builder::Grid;
use crate::core_modules::value_store::ValueStore;
use crate::error::{HeatmapError, Result};
use futures::FutureExt;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const DEFAULT_ATTEMPTS_PER_PASS: u32 = 5;
const DEFAULT_RETRY_PAUSE: Duration = Duration::from_millis(500);
const DEFAULT_PASS_BACKOFF: Duration = Duration::from_secs(5);

/// Tuning of the fetch phase.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Number of concurrent workers.
    pub num_workers: usize,
    /// Getter calls per cell before the cell is re-queued.
    pub attempts_per_pass: u32,
    /// Pause after a failed attempt, before the next one.
    pub retry_pause: Duration,
    /// Pause a worker takes after re-queueing a cell.
    pub pass_backoff: Duration,
    /// Exhausted passes after which a cell is finalized as failed. `None` retries forever.
    pub max_passes: Option<u32>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            attempts_per_pass: DEFAULT_ATTEMPTS_PER_PASS,
            retry_pause: DEFAULT_RETRY_PAUSE,
            pass_backoff: DEFAULT_PASS_BACKOFF,
            max_passes: None,
        }
    }
}

struct FetchState {
    store: ValueStore,
    missing: BTreeSet<usize>,
    in_flight: usize,
    failed_passes: HashMap<usize, u32>,
    error: Option<HeatmapError>,
}

struct Shared {
    state: Mutex<FetchState>,
    wake: Notify,
    grid: Arc<Grid>,
    getter: Arc<dyn Getter>,
    origin: Option<Coordinate>,
    config: FetchConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FetchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What settling a cell asks of the worker afterwards.
enum Settled {
    Done,
    Requeued,
}

/// A bounded pool of workers filling a [`ValueStore`] from a [`Getter`].
pub struct WorkerPool {
    config: FetchConfig,
}

impl WorkerPool {
    pub fn new(config: FetchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetches a value for every cell of `grid` that `store` has no record for, and
    /// returns the store once nothing is missing.
    pub async fn fill(
        &self,
        grid: Arc<Grid>,
        store: ValueStore,
        getter: Arc<dyn Getter>,
        origin: Option<Coordinate>,
    ) -> Result<ValueStore> {
        let missing = store.missing(&grid);
        if missing.is_empty() {
            debug!("no missing cells");
            return Ok(store);
        }

        let num_workers = self.config.num_workers.max(1);
        info!(missing = missing.len(), total = grid.len(), num_workers, "fetching values");

        let shared = Arc::new(Shared {
            state: Mutex::new(FetchState {
                store,
                missing,
                in_flight: 0,
                failed_passes: HashMap::new(),
                error: None,
            }),
            wake: Notify::new(),
            grid,
            getter,
            origin,
            config: self.config.clone(),
        });

        let workers = (0..num_workers)
            .map(|worker_id| tokio::spawn(run_worker(worker_id, shared.clone())))
            .collect::<Vec<_>>();
        for joined in futures::future::join_all(workers).await {
            joined.map_err(|e| HeatmapError::WorkerPool(e.to_string()))?;
        }

        let shared = Arc::try_unwrap(shared)
            .map_err(|_| HeatmapError::WorkerPool("fetch state still shared after join".into()))?;
        let state = shared.state.into_inner().unwrap_or_else(PoisonError::into_inner);
        match state.error {
            Some(e) => Err(e),
            None => Ok(state.store),
        }
    }
}

async fn run_worker(worker_id: usize, shared: Arc<Shared>) {
    let total = shared.grid.len();
    loop {
        let wake = shared.wake.notified();
        tokio::pin!(wake);
        wake.as_mut().enable();

        let claimed = {
            let mut state = shared.lock();
            if state.error.is_some() {
                return;
            }
            match state.missing.pop_first() {
                Some(idx) => {
                    state.in_flight += 1;
                    Some((idx, state.store.len()))
                }
                None if state.in_flight == 0 => return,
                None => None,
            }
        };
        let Some((idx, finalized)) = claimed else {
            wake.await;
            continue;
        };

        if worker_id == 0 {
            info!(finalized, total, "{finalized} / {total}");
        }

        let outcome = match shared.grid.get(idx) {
            Some(cell) => Ok(fetch_with_retry(&shared, idx, cell.representative_point()).await),
            None => Err(HeatmapError::UnknownCell(idx)),
        };
        let settled = settle(&shared, idx, outcome);
        shared.wake.notify_waiters();

        if let Settled::Requeued = settled {
            tokio::time::sleep(shared.config.pass_backoff).await;
        }
    }
}

/// Records the outcome of one pass over cell `idx` under the state lock.
fn settle(shared: &Shared, idx: usize, outcome: Result<Option<CellValue>>) -> Settled {
    let mut guard = shared.lock();
    let state = &mut *guard;
    state.in_flight -= 1;

    let result = outcome.and_then(|value| {
        let cell = shared.grid.get(idx).ok_or(HeatmapError::UnknownCell(idx))?;
        if let Some(value) = value {
            state.store.append(ValueRecord::new(cell, value))?;
            return Ok(Settled::Done);
        }

        let passes = state.failed_passes.entry(idx).or_insert(0);
        *passes += 1;
        let passes = *passes;
        if shared.config.max_passes.is_some_and(|max| passes >= max) {
            warn!(idx, passes, "giving up on cell");
            state.store.append(ValueRecord::failed(cell))?;
            Ok(Settled::Done)
        } else {
            warn!(idx, passes, "attempts exhausted, re-queueing cell");
            state.missing.insert(idx);
            Ok(Settled::Requeued)
        }
    });

    result.unwrap_or_else(|e| {
        state.error.get_or_insert(e);
        Settled::Done
    })
}

/// One pass over a cell: up to `attempts_per_pass` getter calls.
async fn fetch_with_retry(shared: &Shared, idx: usize, point: Coordinate) -> Option<CellValue> {
    let attempts = shared.config.attempts_per_pass.max(1);
    for attempt in 1..=attempts {
        let getter = shared.getter.clone();
        let call = AssertUnwindSafe(async move { getter.get(shared.origin, point).await })
            .catch_unwind()
            .await;
        match call {
            Ok(Ok(Some(value))) if value.value().is_finite() => return Some(value),
            Ok(Ok(Some(value))) => {
                debug!(idx, attempt, value = value.value(), "getter returned a non-finite value")
            }
            Ok(Ok(None)) => debug!(idx, attempt, "getter returned no value"),
            Ok(Err(e)) => debug!(idx, attempt, error = %e, "getter failed"),
            Err(_) => warn!(idx, attempt, "getter panicked"),
        }
        if attempt < attempts {
            tokio::time::sleep(shared.config.retry_pause).await;
        }
    }
    None
}
