//! Two pagination dialects behind one contract: Bitbucket's
//! offset/limit style and GitHub GraphQL's cursor style. Each adapter calls
//! the page-fetching closure itself (it knows the URL shape); this module
//! only owns the early-stop and exhaustion bookkeeping so both dialects
//! share identical semantics.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Default page sizes.
pub const OFFSET_PAGE_SIZE: u32 = 100;
pub const COMMIT_CURSOR_PAGE_SIZE: u32 = 100;
pub const PR_CURSOR_PAGE_SIZE_MIN: u32 = 25;
pub const PR_CURSOR_PAGE_SIZE_MAX: u32 = 50;

#[derive(Debug, Clone)]
pub struct OffsetPage {
    pub values: Vec<Value>,
    pub is_last_page: bool,
    pub next_page_start: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CursorPage {
    pub nodes: Vec<Value>,
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

/// How a pagination run ended: ran to completion, stopped at a watermark, or
/// was cancelled. `cancelled` and `stopped_early` are mutually exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaginationOutcome {
    pub pages: u32,
    pub stopped_early: bool,
    pub cancelled: bool,
}

/// Early-stop decision for a single record: compares the record's ordering
/// field (already extracted by the caller) against the watermark. Pagination
/// halts once a record's ordering field is strictly less than the
/// watermark, assuming newest-first ordering.
pub fn should_stop<T: PartialOrd>(record_key: &T, watermark: &Option<T>) -> bool {
    match watermark {
        Some(wm) => record_key < wm,
        None => false,
    }
}

/// Drains an offset/limit stream, calling `fetch_page(start)` for each page
/// and `on_record` for each value, stopping early when `stop_at` returns
/// true for a record or `cancel` is signalled. A cancellation observed
/// before a page fetch stops a new request from being issued; one observed
/// after a fetch completes discards that page's records without emitting
/// any of them.
pub async fn drive_offset_pagination<F, Fut, S>(
    page_size: u32,
    mut fetch_page: F,
    mut stop_at: S,
    mut on_record: impl FnMut(Value),
    cancel: &CancellationToken,
) -> anyhow::Result<PaginationOutcome>
where
    F: FnMut(u64, u32) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<OffsetPage>>,
    S: FnMut(&Value) -> bool,
{
    let mut start = 0u64;
    let mut pages = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Ok(PaginationOutcome { pages, stopped_early: false, cancelled: true });
        }
        let page = fetch_page(start, page_size).await?;
        pages += 1;
        if cancel.is_cancelled() {
            return Ok(PaginationOutcome { pages, stopped_early: false, cancelled: true });
        }
        for record in &page.values {
            if stop_at(record) {
                return Ok(PaginationOutcome { pages, stopped_early: true, cancelled: false });
            }
            on_record(record.clone());
        }
        if page.is_last_page {
            return Ok(PaginationOutcome { pages, stopped_early: false, cancelled: false });
        }
        start = match page.next_page_start {
            Some(n) => n,
            None => return Ok(PaginationOutcome { pages, stopped_early: false, cancelled: false }),
        };
    }
}

/// Drains a GraphQL cursor stream analogously.
pub async fn drive_cursor_pagination<F, Fut, S>(
    page_size: u32,
    mut fetch_page: F,
    mut stop_at: S,
    mut on_record: impl FnMut(Value),
    cancel: &CancellationToken,
) -> anyhow::Result<PaginationOutcome>
where
    F: FnMut(Option<String>, u32) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<CursorPage>>,
    S: FnMut(&Value) -> bool,
{
    let mut cursor: Option<String> = None;
    let mut pages = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Ok(PaginationOutcome { pages, stopped_early: false, cancelled: true });
        }
        let page = fetch_page(cursor.clone(), page_size).await?;
        pages += 1;
        if cancel.is_cancelled() {
            return Ok(PaginationOutcome { pages, stopped_early: false, cancelled: true });
        }
        for record in &page.nodes {
            if stop_at(record) {
                return Ok(PaginationOutcome { pages, stopped_early: true, cancelled: false });
            }
            on_record(record.clone());
        }
        if !page.has_next_page {
            return Ok(PaginationOutcome { pages, stopped_early: false, cancelled: false });
        }
        cursor = page.end_cursor;
        if cursor.is_none() {
            return Ok(PaginationOutcome { pages, stopped_early: false, cancelled: false });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn should_stop_is_false_without_a_watermark() {
        assert!(!should_stop(&1_500_000i64, &None));
    }

    #[test]
    fn should_stop_triggers_strictly_below_watermark() {
        assert!(should_stop(&1_000_000i64, &Some(1_500_000i64)));
        assert!(!should_stop(&1_500_000i64, &Some(1_500_000i64)));
        assert!(!should_stop(&2_000_000i64, &Some(1_500_000i64)));
    }

    #[tokio::test]
    async fn offset_pagination_terminates_on_is_last_page() {
        let pages = RefCell::new(vec![
            OffsetPage { values: vec![Value::from(1), Value::from(2)], is_last_page: false, next_page_start: Some(2) },
            OffsetPage { values: vec![Value::from(3)], is_last_page: true, next_page_start: None },
        ]);
        let collected = RefCell::new(Vec::new());
        let outcome = drive_offset_pagination(
            100,
            |_start, _limit| {
                let page = pages.borrow_mut().remove(0);
                async move { Ok(page) }
            },
            |_v| false,
            |v| collected.borrow_mut().push(v),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.pages, 2);
        assert!(!outcome.stopped_early);
        assert!(!outcome.cancelled);
        assert_eq!(collected.into_inner().len(), 3);
    }

    #[tokio::test]
    async fn offset_pagination_stops_early_at_watermark() {
        let watermark = 1_500_000i64;
        let pages = RefCell::new(vec![OffsetPage {
            values: vec![Value::from(2_000_000i64), Value::from(1_000_000i64)],
            is_last_page: false,
            next_page_start: Some(2),
        }]);
        let collected = RefCell::new(Vec::new());
        let outcome = drive_offset_pagination(
            100,
            |_start, _limit| {
                let page = pages.borrow_mut().remove(0);
                async move { Ok(page) }
            },
            |v| should_stop(&v.as_i64().unwrap(), &Some(watermark)),
            |v| collected.borrow_mut().push(v),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(outcome.stopped_early);
        assert!(!outcome.cancelled);
        assert_eq!(collected.into_inner(), vec![Value::from(2_000_000i64)]);
    }

    #[tokio::test]
    async fn offset_pagination_stops_before_next_page_once_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pages = RefCell::new(vec![OffsetPage {
            values: vec![Value::from(1), Value::from(2)],
            is_last_page: false,
            next_page_start: Some(2),
        }]);
        let collected = RefCell::new(Vec::new());
        let outcome = drive_offset_pagination(
            100,
            |_start, _limit| {
                let page = pages.borrow_mut().remove(0);
                async move { Ok(page) }
            },
            |_v| false,
            |v| collected.borrow_mut().push(v),
            &cancel,
        )
        .await
        .unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.stopped_early);
        assert_eq!(outcome.pages, 0);
        assert!(collected.into_inner().is_empty());
    }

    #[tokio::test]
    async fn offset_pagination_discards_the_in_flight_page_once_cancelled_mid_fetch() {
        let cancel = CancellationToken::new();
        let collected = RefCell::new(Vec::new());
        let outcome = drive_offset_pagination(
            100,
            |_start, _limit| {
                cancel.cancel();
                async move {
                    Ok(OffsetPage {
                        values: vec![Value::from(1), Value::from(2)],
                        is_last_page: false,
                        next_page_start: Some(2),
                    })
                }
            },
            |_v| false,
            |v| collected.borrow_mut().push(v),
            &cancel,
        )
        .await
        .unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.pages, 1, "the in-flight request still counts as an api call");
        assert!(collected.into_inner().is_empty(), "no records from the aborted page are emitted");
    }

    #[tokio::test]
    async fn cursor_pagination_terminates_on_has_next_page_false() {
        let pages = RefCell::new(vec![
            CursorPage { nodes: vec![Value::from(1)], has_next_page: true, end_cursor: Some("c1".to_string()) },
            CursorPage { nodes: vec![Value::from(2)], has_next_page: false, end_cursor: None },
        ]);
        let collected = RefCell::new(Vec::new());
        let outcome = drive_cursor_pagination(
            50,
            |_cursor, _size| {
                let page = pages.borrow_mut().remove(0);
                async move { Ok(page) }
            },
            |_v| false,
            |v| collected.borrow_mut().push(v),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.pages, 2);
        assert_eq!(collected.into_inner().len(), 2);
    }
}
