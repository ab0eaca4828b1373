use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ViewerConfig;
use crate::query_spec::QuerySpec;
use crate::table_view::{TableView, TravelDirection, ViewId};
use crate::value::{Page, RowCount, TableSchema};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PageBackendError {
    message: String,
}

impl PageBackendError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Read side of the driver layer: one window of rows, and a row-budgeted
/// count whose result may be only a lower bound.
#[async_trait]
pub trait PageBackend: Send + Sync {
    async fn fetch_page(
        &self,
        spec: &QuerySpec,
        schema: Arc<TableSchema>,
        offset: u64,
        limit: usize,
    ) -> Result<Page, PageBackendError>;

    async fn count_rows(&self, spec: &QuerySpec, budget: u64) -> Result<RowCount, PageBackendError>;
}

/// A load the trigger policy decided is needed, not yet stamped with a
/// generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedLoad {
    pub offset: u64,
    pub limit: usize,
    pub include_count: bool,
}

/// A dispatched load: everything a worker task needs, owned, plus the
/// generation stamp its completion will be checked against.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub view: ViewId,
    pub generation: u64,
    pub spec: QuerySpec,
    pub schema: Arc<TableSchema>,
    pub offset: u64,
    pub limit: usize,
    pub include_count: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadResult {
    Loaded {
        page: Page,
        count: Option<RowCount>,
        truncated: bool,
    },
    Failed {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadCompletion {
    pub view: ViewId,
    pub generation: u64,
    pub result: LoadResult,
}

#[must_use]
pub fn page_align(row: u64, page_size: u64) -> u64 {
    if page_size == 0 {
        return row;
    }
    (row / page_size) * page_size
}

/// Decide whether the view needs a load right now.
///
/// The first load after opening (or after a requested reload) fetches a
/// single page at the cursor's page boundary so the view paints fast.
/// After that, a prefetch fires when the cursor comes within one page of
/// the resident window's edge in the direction of travel, targeting the
/// page-aligned boundary one page ahead of the cursor and fetching
/// `page_size * (1 + prefetch_pages)` rows. A cursor that jumped clean out
/// of the window reloads around its own page.
///
/// Returns `None` while a load is outstanding for the view: a view never
/// has more than one load in flight, and re-planning happens on every
/// event-loop iteration anyway.
#[must_use]
pub fn plan_request(view: &TableView, config: &ViewerConfig) -> Option<PlannedLoad> {
    if view.is_loading() {
        return None;
    }

    let page_size = config.page_size as u64;
    let include_count = view.is_approximate();
    let (cursor_row, _) = view.cursor();

    if !view.has_loaded() {
        return Some(PlannedLoad {
            offset: page_align(cursor_row, page_size),
            limit: config.page_size,
            include_count,
        });
    }

    if view.loaded_len() == 0 {
        // A genuinely empty result; nothing to page over.
        return None;
    }

    let start = view.loaded_offset();
    let end = start + view.loaded_len() as u64;

    if cursor_row < start || cursor_row >= end {
        return Some(PlannedLoad {
            offset: page_align(cursor_row, page_size),
            limit: config.fetch_len(),
            include_count,
        });
    }

    match view.travel() {
        TravelDirection::Forward => {
            let remaining_ahead = end - cursor_row;
            let more_beyond = view.is_approximate() || end < view.total_rows();
            if remaining_ahead < page_size && more_beyond {
                let offset = page_align(cursor_row + page_size, page_size);
                if offset == start {
                    return None;
                }
                Some(PlannedLoad {
                    offset,
                    limit: config.fetch_len(),
                    include_count,
                })
            } else {
                None
            }
        }
        TravelDirection::Backward => {
            if start > 0 && cursor_row - start < page_size {
                Some(PlannedLoad {
                    offset: page_align(cursor_row.saturating_sub(page_size), page_size),
                    limit: config.fetch_len(),
                    include_count,
                })
            } else {
                None
            }
        }
    }
}

/// Stamp a planned load with a fresh generation and snapshot everything
/// the worker task needs. The view is loading from here until the
/// completion arrives.
pub fn dispatch_request(view: &mut TableView, planned: PlannedLoad) -> LoadRequest {
    let generation = view.begin_load();
    LoadRequest {
        view: view.id(),
        generation,
        spec: view.spec().clone(),
        schema: Arc::clone(view.schema()),
        offset: planned.offset,
        limit: planned.limit,
        include_count: planned.include_count,
    }
}

/// Execute one load on a worker task. Never touches the view; the result
/// travels back through the completion queue and is applied on the UI
/// loop, generation-checked. Rows past `max_result_rows` are never
/// fetched; a clamped request comes back marked truncated.
pub async fn run_load<B: PageBackend + ?Sized>(
    backend: &B,
    request: LoadRequest,
    max_result_rows: u64,
) -> LoadCompletion {
    let cap = max_result_rows;
    let mut limit = request.limit;
    let mut truncated = false;

    if request.offset >= cap {
        limit = 0;
        truncated = true;
    } else if request.offset + limit as u64 > cap {
        limit = usize::try_from(cap - request.offset).unwrap_or(0);
        truncated = true;
    }

    let fetched = if limit == 0 {
        Page::new(Arc::clone(&request.schema), request.offset, Vec::new())
            .map_err(|error| PageBackendError::new(error.to_string()))
    } else {
        backend
            .fetch_page(
                &request.spec,
                Arc::clone(&request.schema),
                request.offset,
                limit,
            )
            .await
    };

    let result = match fetched {
        Err(error) => LoadResult::Failed {
            message: error.to_string(),
        },
        Ok(page) => {
            let mut count = if truncated {
                Some(RowCount {
                    total: cap,
                    exact: false,
                })
            } else if request.include_count {
                // A failed count is not a failed load; the view just stays
                // approximate until a later attempt lands.
                backend.count_rows(&request.spec, cap).await.ok()
            } else {
                None
            };

            if let Some(counted) = count {
                if counted.total > cap {
                    count = Some(RowCount {
                        total: cap,
                        exact: false,
                    });
                    truncated = true;
                }
            }

            LoadResult::Loaded {
                page,
                count,
                truncated,
            }
        }
    };

    LoadCompletion {
        view: request.view,
        generation: request.generation,
        result,
    }
}

/// Route a drained completion to its view. Returns true when the result
/// actually applied (matching view, current generation).
pub fn apply_completion(view: &mut TableView, completion: LoadCompletion) -> bool {
    if completion.view != view.id() {
        return false;
    }
    match completion.result {
        LoadResult::Loaded {
            page,
            count,
            truncated,
        } => view.apply_loaded_page(completion.generation, page, count, truncated),
        LoadResult::Failed { message } => view.apply_load_failure(completion.generation, message),
    }
}

/// Thread-safe, non-blocking hand-off from worker tasks back to the UI
/// loop, drained once per iteration before redrawing.
#[derive(Debug)]
pub struct CompletionQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> CompletionQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver }
    }

    #[must_use]
    pub fn sender(&self) -> CompletionSender<T> {
        CompletionSender(self.sender.clone())
    }

    pub fn drain(&self) -> Vec<T> {
        self.receiver.try_iter().collect()
    }
}

impl<T> Default for CompletionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct CompletionSender<T>(Sender<T>);

impl<T> Clone for CompletionSender<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> CompletionSender<T> {
    /// Never blocks; a hung-up queue (UI loop gone) drops the result,
    /// which is exactly the discard-on-arrival contract.
    pub fn push(&self, item: T) {
        let _ = self.0.send(item);
    }
}
