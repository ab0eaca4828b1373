use std::sync::Arc;

use crate::query_spec::QuerySpec;
use crate::value::{Page, RowCount, TableSchema, Value};

/// Non-owning handle to an open view. The dirty registry and the
/// background loader refer to views exclusively through these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(u64);

impl ViewId {
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TravelDirection {
    Forward,
    Backward,
}

/// Per-view state for one open table tab: the resident page, cursor and
/// scroll position, the best total-row estimate, and the generation
/// counter that stale asynchronous results are checked against.
///
/// Everything here is synchronous; moving the cursor or scroll never
/// performs I/O. The background loader reads this state to decide what to
/// fetch and feeds results back through [`TableView::apply_loaded_page`].
#[derive(Debug)]
pub struct TableView {
    id: ViewId,
    connection: String,
    spec: QuerySpec,
    schema: Arc<TableSchema>,
    page: Page,
    cursor_row: u64,
    cursor_col: usize,
    scroll_row: u64,
    scroll_col: usize,
    total_rows: u64,
    approximate: bool,
    generation: u64,
    loaded: bool,
    loading: bool,
    dirty: bool,
    needs_redraw: bool,
    travel: TravelDirection,
    status: Option<String>,
    pending_cursor_key: Option<Vec<(usize, Value)>>,
}

impl TableView {
    #[must_use]
    pub fn new(
        id: ViewId,
        connection: impl Into<String>,
        spec: QuerySpec,
        schema: Arc<TableSchema>,
    ) -> Self {
        Self {
            id,
            connection: connection.into(),
            spec,
            page: Page::empty(Arc::clone(&schema)),
            schema,
            cursor_row: 0,
            cursor_col: 0,
            scroll_row: 0,
            scroll_col: 0,
            total_rows: 0,
            approximate: true,
            generation: 0,
            loaded: false,
            loading: false,
            dirty: false,
            needs_redraw: true,
            travel: TravelDirection::Forward,
            status: None,
            pending_cursor_key: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> ViewId {
        self.id
    }

    #[must_use]
    pub fn connection(&self) -> &str {
        &self.connection
    }

    #[must_use]
    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    #[must_use]
    pub fn page(&self) -> &Page {
        &self.page
    }

    #[must_use]
    pub fn loaded_offset(&self) -> u64 {
        self.page.loaded_offset()
    }

    #[must_use]
    pub fn loaded_len(&self) -> usize {
        self.page.len()
    }

    #[must_use]
    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    #[must_use]
    pub fn is_approximate(&self) -> bool {
        self.approximate
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn has_loaded(&self) -> bool {
        self.loaded
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn travel(&self) -> TravelDirection {
        self.travel
    }

    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn set_status(&mut self, message: impl Into<String>) {
        self.status = Some(message.into());
        self.needs_redraw = true;
    }

    pub fn clear_status(&mut self) {
        self.status = None;
    }

    #[must_use]
    pub fn cursor(&self) -> (u64, usize) {
        (self.cursor_row, self.cursor_col)
    }

    #[must_use]
    pub fn scroll(&self) -> (u64, usize) {
        (self.scroll_row, self.scroll_col)
    }

    /// Largest row index the cursor may sit on, from the best current
    /// knowledge. `total_rows` is advisory; the resident window extends it
    /// when a load has already proven more rows exist.
    #[must_use]
    pub fn max_known_row(&self) -> u64 {
        let extent = self.total_rows.max(self.page.end_offset());
        extent.saturating_sub(1)
    }

    pub fn set_cursor(&mut self, row: u64, col: usize) {
        let clamped_row = row.min(self.max_known_row());
        let max_col = self.schema.column_count().saturating_sub(1);
        let clamped_col = col.min(max_col);

        if clamped_row > self.cursor_row {
            self.travel = TravelDirection::Forward;
        } else if clamped_row < self.cursor_row {
            self.travel = TravelDirection::Backward;
        }

        if (clamped_row, clamped_col) != (self.cursor_row, self.cursor_col) {
            self.cursor_row = clamped_row;
            self.cursor_col = clamped_col;
            self.needs_redraw = true;
        }
    }

    pub fn move_cursor(&mut self, rows: i64, cols: i64) {
        let row = if rows.is_negative() {
            self.cursor_row.saturating_sub(rows.unsigned_abs())
        } else {
            self.cursor_row.saturating_add(rows.unsigned_abs())
        };
        let col = if cols.is_negative() {
            self.cursor_col.saturating_sub(usize::try_from(cols.unsigned_abs()).unwrap_or(0))
        } else {
            self.cursor_col.saturating_add(usize::try_from(cols.unsigned_abs()).unwrap_or(0))
        };
        self.set_cursor(row, col);
    }

    pub fn set_scroll(&mut self, row: u64, col: usize) {
        if (row, col) != (self.scroll_row, self.scroll_col) {
            self.scroll_row = row;
            self.scroll_col = col;
            self.needs_redraw = true;
        }
    }

    /// Cell at an absolute position; `None` outside the resident window.
    #[must_use]
    pub fn cell(&self, absolute_row: u64, column: usize) -> Option<&Value> {
        self.page.cell(absolute_row, column)
    }

    /// Patch a resident cell in place without replacing the page.
    pub fn patch_cell(&mut self, absolute_row: u64, column: usize, value: Value) -> bool {
        let patched = self.page.set_cell(absolute_row, column, value);
        if patched {
            self.needs_redraw = true;
        }
        patched
    }

    /// Absolute index of the first resident row matching every
    /// (column index, value) pair, if any.
    #[must_use]
    pub fn locate_by_key(&self, key: &[(usize, Value)]) -> Option<u64> {
        if key.is_empty() {
            return None;
        }
        let start = self.page.loaded_offset();
        self.page.rows().iter().position(|row| {
            key.iter()
                .all(|(column, value)| row.values.get(*column) == Some(value))
        })
        .map(|relative| start + relative as u64)
    }

    /// Owned primary-key snapshot of the cursor row, when the schema has a
    /// primary key and the row is resident.
    #[must_use]
    pub fn capture_cursor_key(&self) -> Option<Vec<(usize, Value)>> {
        let indices = self.schema.primary_key_indices();
        if indices.is_empty() {
            return None;
        }
        let row = self.page.row(self.cursor_row)?;
        indices
            .into_iter()
            .map(|index| row.values.get(index).map(|value| (index, value.clone())))
            .collect()
    }

    /// Replace the query specification. Bumps the generation so in-flight
    /// results for the old specification are discarded on arrival, and
    /// resets the view to an unloaded state at the origin. Returns false
    /// when the signature did not actually change.
    pub fn set_query_spec(&mut self, spec: QuerySpec) -> bool {
        if spec == self.spec {
            return false;
        }
        self.spec = spec;
        self.generation += 1;
        self.page = Page::empty(Arc::clone(&self.schema));
        self.loaded = false;
        self.cursor_row = 0;
        self.cursor_col = 0;
        self.scroll_row = 0;
        self.scroll_col = 0;
        self.total_rows = 0;
        self.approximate = true;
        self.pending_cursor_key = None;
        self.status = None;
        self.needs_redraw = true;
        true
    }

    /// Stamp a new generation for a load about to be dispatched. The
    /// caller must deliver exactly one completion per call, through
    /// [`TableView::apply_loaded_page`] or [`TableView::apply_load_failure`].
    pub fn begin_load(&mut self) -> u64 {
        self.generation += 1;
        self.loading = true;
        self.generation
    }

    /// Mark the view as needing a fresh load through the normal load path,
    /// keeping the current page on screen until the replacement arrives.
    pub fn request_reload(&mut self) {
        self.loaded = false;
        self.needs_redraw = true;
    }

    /// Capture the cursor's primary key (when possible) and schedule a
    /// reload; used when a dirty view regains focus so the cursor can be
    /// re-seated onto the same row at its new offset.
    pub fn prepare_dirty_reload(&mut self) {
        self.pending_cursor_key = self.capture_cursor_key();
        self.request_reload();
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.needs_redraw = true;
    }

    /// Install a completed load. The page replacement is a single
    /// assignment: readers only ever observe the old page or the new one.
    ///
    /// Returns false when the stamped generation is stale; the result is
    /// dropped without touching the resident page. Arrival of any
    /// completion ends the view's single outstanding load, so the loading
    /// flag clears either way.
    pub fn apply_loaded_page(
        &mut self,
        generation: u64,
        page: Page,
        count: Option<RowCount>,
        truncated: bool,
    ) -> bool {
        self.loading = false;
        if generation != self.generation {
            return false;
        }

        let page_end = page.end_offset();
        self.page = page;
        self.loaded = true;
        self.dirty = false;
        self.needs_redraw = true;

        match count {
            Some(count) if count.exact && !truncated => {
                self.total_rows = count.total;
                self.approximate = false;
            }
            Some(count) => {
                self.total_rows = self.total_rows.max(count.total).max(page_end);
                self.approximate = true;
            }
            None => {
                if self.approximate {
                    self.total_rows = self.total_rows.max(page_end);
                }
            }
        }
        if truncated {
            self.status = Some(format!(
                "result truncated; showing at most {} rows",
                self.total_rows
            ));
        }

        if let Some(key) = self.pending_cursor_key.take() {
            if let Some(row) = self.locate_by_key(&key) {
                self.cursor_row = row;
            } else {
                self.clamp_cursor_to_window();
            }
        } else if !self.approximate && self.cursor_row > self.max_known_row() {
            self.cursor_row = self.max_known_row();
        }

        true
    }

    /// Record a failed load. Stale failures are silently dropped; current
    /// ones surface as a view-scoped status message and leave the resident
    /// page untouched either way.
    pub fn apply_load_failure(&mut self, generation: u64, message: impl Into<String>) -> bool {
        self.loading = false;
        if generation != self.generation {
            return false;
        }
        self.loaded = true;
        self.status = Some(message.into());
        self.needs_redraw = true;
        true
    }

    /// Local bookkeeping for a confirmed delete: the one place an
    /// approximate total is allowed to go down.
    pub fn note_row_deleted(&mut self) {
        self.total_rows = self.total_rows.saturating_sub(1);
        if self.cursor_row > self.max_known_row() {
            self.cursor_row = self.max_known_row();
        }
        self.needs_redraw = true;
    }

    pub fn note_row_inserted(&mut self) {
        self.total_rows = self.total_rows.saturating_add(1);
        self.needs_redraw = true;
    }

    #[must_use]
    pub fn take_needs_redraw(&mut self) -> bool {
        std::mem::take(&mut self.needs_redraw)
    }

    fn clamp_cursor_to_window(&mut self) {
        if self.page.is_empty() {
            self.cursor_row = self.cursor_row.min(self.max_known_row());
            return;
        }
        self.cursor_row = self
            .cursor_row
            .clamp(self.page.loaded_offset(), self.page.end_offset() - 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{TableView, TravelDirection, ViewId};
    use crate::query_spec::QuerySpec;
    use crate::value::{Column, Page, Row, RowCount, TableSchema, Value};

    fn schema() -> Arc<TableSchema> {
        Arc::new(TableSchema::new(vec![
            Column::new("id", "bigint").primary_key(),
            Column::new("email", "varchar(255)"),
        ]))
    }

    fn view() -> TableView {
        TableView::new(
            ViewId::new(1),
            "local",
            QuerySpec::for_table(Some("app".to_string()), "users"),
            schema(),
        )
    }

    fn page(offset: u64, ids: &[i64]) -> Page {
        let rows = ids
            .iter()
            .map(|id| {
                Row::new(vec![
                    Value::Integer(*id),
                    Value::Text(format!("user{id}@x")),
                ])
            })
            .collect();
        Page::new(schema(), offset, rows).expect("page should build")
    }

    fn exact(total: u64) -> Option<RowCount> {
        Some(RowCount { total, exact: true })
    }

    fn lower_bound(total: u64) -> Option<RowCount> {
        Some(RowCount {
            total,
            exact: false,
        })
    }

    #[test]
    fn stale_generation_results_are_dropped() {
        let mut view = view();
        let g1 = view.begin_load();
        // The first request's completion is delayed; a newer load goes out.
        let g2 = view.begin_load();

        assert!(view.apply_loaded_page(g2, page(0, &[10, 11]), exact(2), false));
        let resident = view.page().clone();

        // g1 finally arrives, after g2 already applied.
        assert!(!view.apply_loaded_page(g1, page(0, &[1, 2]), exact(2), false));
        assert_eq!(view.page(), &resident);
        assert!(!view.is_loading());
    }

    #[test]
    fn changing_the_spec_invalidates_in_flight_loads() {
        let mut view = view();
        let g = view.begin_load();

        let changed = view.set_query_spec(
            QuerySpec::for_table(Some("app".to_string()), "users")
                .with_filter(Some("id > 5".to_string())),
        );
        assert!(changed);

        assert!(!view.apply_loaded_page(g, page(0, &[1]), exact(1), false));
        assert_eq!(view.loaded_len(), 0);
        assert!(!view.has_loaded());
    }

    #[test]
    fn setting_the_same_spec_is_a_no_op() {
        let mut view = view();
        let g = view.begin_load();
        assert!(view.apply_loaded_page(g, page(0, &[1]), exact(1), false));

        let same = QuerySpec::for_table(Some("app".to_string()), "users");
        assert!(!view.set_query_spec(same));
        assert_eq!(view.loaded_len(), 1);
    }

    #[test]
    fn approximate_totals_only_grow_until_an_exact_count_lands() {
        let mut view = view();
        let g = view.begin_load();
        assert!(view.apply_loaded_page(g, page(0, &[1, 2]), lower_bound(5_000), false));
        assert!(view.is_approximate());
        assert_eq!(view.total_rows(), 5_000);

        // A smaller lower bound must not shrink the estimate.
        let g = view.begin_load();
        assert!(view.apply_loaded_page(g, page(0, &[1, 2]), lower_bound(4_000), false));
        assert_eq!(view.total_rows(), 5_000);

        // A load without a count extends the estimate to the observed end.
        let g = view.begin_load();
        assert!(view.apply_loaded_page(g, page(6_000, &[1]), None, false));
        assert_eq!(view.total_rows(), 6_001);

        let g = view.begin_load();
        assert!(view.apply_loaded_page(g, page(0, &[1, 2]), exact(4_200), false));
        assert!(!view.is_approximate());
        assert_eq!(view.total_rows(), 4_200);
    }

    #[test]
    fn explicit_delete_lowers_the_total() {
        let mut view = view();
        let g = view.begin_load();
        assert!(view.apply_loaded_page(g, page(0, &[1, 2]), lower_bound(100), false));

        view.note_row_deleted();
        assert_eq!(view.total_rows(), 99);
    }

    #[test]
    fn truncated_loads_mark_the_view_approximate_with_a_notice() {
        let mut view = view();
        let g = view.begin_load();
        assert!(view.apply_loaded_page(g, page(0, &[1]), lower_bound(1_000), true));
        assert!(view.is_approximate());
        assert!(view
            .status()
            .is_some_and(|status| status.contains("truncated")));
    }

    #[test]
    fn cursor_clamps_to_known_extent_and_tracks_travel() {
        let mut view = view();
        let g = view.begin_load();
        assert!(view.apply_loaded_page(g, page(0, &[1, 2, 3]), exact(3), false));

        view.set_cursor(10, 5);
        assert_eq!(view.cursor(), (2, 1));
        assert_eq!(view.travel(), TravelDirection::Forward);

        view.move_cursor(-1, 0);
        assert_eq!(view.cursor(), (1, 1));
        assert_eq!(view.travel(), TravelDirection::Backward);
    }

    #[test]
    fn cell_access_outside_the_window_returns_none() {
        let mut view = view();
        let g = view.begin_load();
        assert!(view.apply_loaded_page(g, page(100, &[1, 2]), exact(500), false));

        assert!(view.cell(100, 0).is_some());
        assert!(view.cell(99, 0).is_none());
        assert!(view.cell(102, 0).is_none());

        assert!(view.patch_cell(101, 1, Value::Text("patched@x".to_string())));
        assert_eq!(
            view.cell(101, 1),
            Some(&Value::Text("patched@x".to_string()))
        );
        assert!(!view.patch_cell(99, 0, Value::Null));
    }

    #[test]
    fn dirty_reload_reseats_the_cursor_by_primary_key() {
        let mut view = view();
        let g = view.begin_load();
        assert!(view.apply_loaded_page(g, page(0, &[1, 2, 3]), exact(3), false));
        view.set_cursor(1, 0); // row with id 2

        view.mark_dirty();
        assert!(view.is_dirty());
        view.prepare_dirty_reload();
        assert!(!view.has_loaded());

        // After another view inserted rows, id 2 now lives at offset 4.
        let g = view.begin_load();
        assert!(view.apply_loaded_page(g, page(2, &[9, 8, 2, 7]), exact(6), false));
        assert!(!view.is_dirty());
        assert_eq!(view.cursor().0, 4);
    }

    #[test]
    fn dirty_reload_clamps_when_the_key_is_gone() {
        let mut view = view();
        let g = view.begin_load();
        assert!(view.apply_loaded_page(g, page(0, &[1, 2, 3]), exact(3), false));
        view.set_cursor(2, 0);

        view.prepare_dirty_reload();
        let g = view.begin_load();
        assert!(view.apply_loaded_page(g, page(0, &[7]), exact(1), false));
        assert_eq!(view.cursor().0, 0);
    }

    #[test]
    fn dirty_flag_survives_a_failed_reload() {
        let mut view = view();
        let g = view.begin_load();
        assert!(view.apply_loaded_page(g, page(0, &[1]), exact(1), false));

        view.mark_dirty();
        view.prepare_dirty_reload();
        let g = view.begin_load();
        assert!(view.apply_load_failure(g, "connection dropped"));
        assert!(view.is_dirty());
        assert_eq!(view.status(), Some("connection dropped"));
        // Last-known-good page is still resident.
        assert_eq!(view.loaded_len(), 1);
    }

    #[test]
    fn stale_failures_stay_silent() {
        let mut view = view();
        let g1 = view.begin_load();
        let g2 = view.begin_load();

        assert!(!view.apply_load_failure(g1, "old failure"));
        assert_eq!(view.status(), None);

        assert!(view.apply_loaded_page(g2, page(0, &[1]), exact(1), false));
    }
}
