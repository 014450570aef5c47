// Generic page windowing over ordered collections
use serde::Serialize;
use std::ops::Range;

pub const DEFAULT_PAGE_SIZE: usize = 8;

/// Page bounds for a collection of `total_items`.
///
/// `1 <= current_page <= total_pages` holds after every change. When the
/// collection shrinks the page is clamped down; it is never moved up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageWindow {
    current_page: usize,
    page_size: usize,
    total_items: usize,
}

impl PageWindow {
    /// A zero page size is treated as 1
    pub fn new(page_size: usize) -> Self {
        Self {
            current_page: 1,
            page_size: page_size.max(1),
            total_items: 0,
        }
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn total_items(&self) -> usize {
        self.total_items
    }

    pub fn total_pages(&self) -> usize {
        self.total_items.div_ceil(self.page_size).max(1)
    }

    /// Update the collection length, clamping the current page if needed
    pub fn set_total_items(&mut self, total_items: usize) {
        self.total_items = total_items;
        let total_pages = self.total_pages();
        if self.current_page > total_pages {
            self.current_page = total_pages;
        }
    }

    /// Move to `page`. Values outside `1..=total_pages` are ignored.
    pub fn set_current_page(&mut self, page: usize) -> bool {
        if (1..=self.total_pages()).contains(&page) {
            self.current_page = page;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.current_page = 1;
    }

    pub fn start_index(&self) -> usize {
        ((self.current_page - 1) * self.page_size).min(self.total_items)
    }

    /// Exclusive end of the current page
    pub fn end_index(&self) -> usize {
        (self.start_index() + self.page_size).min(self.total_items)
    }

    pub fn range(&self) -> Range<usize> {
        self.start_index()..self.end_index()
    }

    pub fn has_next(&self) -> bool {
        self.current_page < self.total_pages()
    }

    pub fn has_previous(&self) -> bool {
        self.current_page > 1
    }
}

impl Default for PageWindow {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

/// Owns a collection and exposes the current page of it.
///
/// Filtering happens upstream: callers hand in the already filtered
/// collection and call `reset` when their filter changes.
#[derive(Debug, Clone)]
pub struct FilterPaginationEngine<T> {
    items: Vec<T>,
    window: PageWindow,
}

impl<T> FilterPaginationEngine<T> {
    pub fn new(page_size: usize) -> Self {
        Self {
            items: Vec::new(),
            window: PageWindow::new(page_size),
        }
    }

    pub fn with_items(page_size: usize, items: Vec<T>) -> Self {
        let mut engine = Self::new(page_size);
        engine.set_items(items);
        engine
    }

    /// Replace the collection; the page is clamped if it no longer exists
    pub fn set_items(&mut self, items: Vec<T>) {
        self.window.set_total_items(items.len());
        self.items = items;
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn window(&self) -> PageWindow {
        self.window
    }

    pub fn current_page(&self) -> usize {
        self.window.current_page()
    }

    pub fn set_current_page(&mut self, page: usize) -> bool {
        self.window.set_current_page(page)
    }

    pub fn next_page(&mut self) -> bool {
        self.window.set_current_page(self.window.current_page() + 1)
    }

    pub fn previous_page(&mut self) -> bool {
        self.window.current_page() > 1
            && self.window.set_current_page(self.window.current_page() - 1)
    }

    pub fn reset(&mut self) {
        self.window.reset();
    }

    pub fn total_pages(&self) -> usize {
        self.window.total_pages()
    }

    pub fn total_items(&self) -> usize {
        self.items.len()
    }

    pub fn start_index(&self) -> usize {
        self.window.start_index()
    }

    pub fn end_index(&self) -> usize {
        self.window.end_index()
    }

    /// Slice for the current page, computed on each call
    pub fn paginated_items(&self) -> &[T] {
        &self.items[self.window.range()]
    }
}

impl<T> Default for FilterPaginationEngine<T> {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}
