use crate::error::SyncError;
use crate::models::{Cursor, Page, PageDirection, PageRequest};

/// Cursor bookkeeping for one scope.
///
/// The transitions are synchronous; the runtime performs the query between
/// `begin_*` and `complete_*`/`fail`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageState {
    /// Token for older entities; None once exhausted
    pub before: Option<Cursor>,
    /// Token for newer entities; None once exhausted
    pub after: Option<Cursor>,
    pub is_loading_initial: bool,
    pub is_loading_more: bool,
    pub last_error: Option<SyncError>,
    /// Set after the first successful initial load
    pub initialized: bool,
}

impl PageState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self, direction: PageDirection) -> Option<&Cursor> {
        match direction {
            PageDirection::Before => self.before.as_ref(),
            PageDirection::After => self.after.as_ref(),
        }
    }

    pub fn has_more(&self, direction: PageDirection) -> bool {
        self.cursor(direction).is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading_initial || self.is_loading_more
    }

    pub fn begin_initial(&mut self, limit: usize) -> PageRequest {
        self.is_loading_initial = true;
        self.last_error = None;
        PageRequest::initial(limit)
    }

    /// Returns None when the request must not be issued: a page is already in
    /// flight or `direction` is exhausted.
    pub fn begin_more(&mut self, direction: PageDirection, limit: usize) -> Option<PageRequest> {
        if self.is_loading() || !self.initialized {
            return None;
        }
        let cursor = self.cursor(direction)?.clone();
        self.is_loading_more = true;
        self.last_error = None;
        Some(PageRequest {
            cursor: Some(cursor),
            direction,
            limit,
        })
    }

    pub fn complete_initial(&mut self, page: &Page) {
        self.before = page.before.clone();
        self.after = page.after.clone();
        self.is_loading_initial = false;
        self.initialized = true;
    }

    /// Advances only the cursor of `direction`. An empty page is a normal
    /// outcome; a None cursor in it exhausts the direction.
    pub fn complete_more(&mut self, direction: PageDirection, page: &Page) {
        match direction {
            PageDirection::Before => self.before = page.before.clone(),
            PageDirection::After => self.after = page.after.clone(),
        }
        self.is_loading_more = false;
    }

    /// A failed initial load leaves any older-page request in flight untouched.
    pub fn fail_initial(&mut self, error: SyncError) {
        self.is_loading_initial = false;
        self.last_error = Some(error);
    }

    pub fn fail_more(&mut self, error: SyncError) {
        self.is_loading_more = false;
        self.last_error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with(before: Option<&str>, after: Option<&str>) -> Page {
        Page {
            entities: vec![],
            before: before.map(Cursor::new),
            after: after.map(Cursor::new),
        }
    }

    #[test]
    fn test_more_requires_initial_load() {
        let mut state = PageState::new();
        assert!(state.begin_more(PageDirection::Before, 10).is_none());

        let request = state.begin_initial(10);
        assert!(request.cursor.is_none());
        assert!(state.begin_more(PageDirection::Before, 10).is_none());

        state.complete_initial(&page_with(Some("b1"), None));
        let request = state.begin_more(PageDirection::Before, 10).unwrap();
        assert_eq!(request.cursor, Some(Cursor::new("b1")));
        assert!(state.is_loading_more);
    }

    #[test]
    fn test_no_duplicate_in_flight_request() {
        let mut state = PageState::new();
        state.begin_initial(10);
        state.complete_initial(&page_with(Some("b1"), Some("a1")));

        assert!(state.begin_more(PageDirection::Before, 10).is_some());
        assert!(state.begin_more(PageDirection::Before, 10).is_none());
        assert!(state.begin_more(PageDirection::After, 10).is_none());
    }

    #[test]
    fn test_empty_page_exhausts_direction() {
        let mut state = PageState::new();
        state.begin_initial(10);
        state.complete_initial(&page_with(Some("b1"), Some("a1")));

        state.begin_more(PageDirection::Before, 10).unwrap();
        state.complete_more(PageDirection::Before, &page_with(None, Some("ignored")));

        assert!(!state.is_loading_more);
        assert!(!state.has_more(PageDirection::Before));
        assert_eq!(state.after, Some(Cursor::new("a1")));
        assert!(state.begin_more(PageDirection::Before, 10).is_none());
    }

    #[test]
    fn test_fail_records_error_and_allows_retry() {
        let mut state = PageState::new();
        state.begin_initial(10);
        state.complete_initial(&page_with(Some("b1"), None));
        state.begin_more(PageDirection::Before, 10).unwrap();
        state.fail_more(SyncError::network("timeout"));

        assert!(!state.is_loading());
        assert_eq!(state.last_error, Some(SyncError::network("timeout")));
        assert!(state.begin_more(PageDirection::Before, 10).is_some());
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_failed_reload_keeps_more_request_in_flight() {
        let mut state = PageState::new();
        state.begin_initial(10);
        state.complete_initial(&page_with(Some("b1"), None));
        state.begin_more(PageDirection::Before, 10).unwrap();

        state.begin_initial(10);
        state.fail_initial(SyncError::network("offline"));

        assert!(state.is_loading_more);
        assert!(!state.is_loading_initial);
        assert!(state.begin_more(PageDirection::Before, 10).is_none());
    }
}
