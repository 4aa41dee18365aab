// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pagination primitives.
//!
//! Pages are finite and single-use: a consumer walks `PageRequest::first`
//! through `Page::next_request` until `None`. Every summation path in the
//! workspace drives [`collect_all_pages`] to exhaustion so aggregate counts
//! always equal the underlying data.

use serde::{Deserialize, Serialize};

/// Default page size used when a caller does not specify one.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Hard upper bound on page size.
pub const MAX_PAGE_SIZE: usize = 1_000;

/// A request for one page of results. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: usize,
    /// Items per page; clamped to [1, MAX_PAGE_SIZE].
    pub size: usize,
}

impl PageRequest {
    /// The first page at the given size.
    #[must_use]
    pub fn first(size: usize) -> Self {
        Self {
            page: 1,
            size: size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Offset of the first item on this page.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1) * self.size
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::first(DEFAULT_PAGE_SIZE)
    }
}

/// One page of results plus enough metadata to fetch the next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    /// The items on this page.
    pub items: Vec<T>,
    /// 1-based page number of this page.
    pub page: usize,
    /// Page size requested.
    pub size: usize,
    /// Total matching items across all pages.
    pub total: usize,
}

impl<T> Page<T> {
    /// Whether more pages follow this one.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.page * self.size < self.total
    }

    /// The request for the following page, or `None` on the last page.
    #[must_use]
    pub fn next_request(&self) -> Option<PageRequest> {
        self.has_more().then(|| PageRequest {
            page: self.page + 1,
            size: self.size,
        })
    }
}

/// Drive a page-returning operation to exhaustion and collect every item.
///
/// The closure is called with successive page requests starting from page 1
/// until the returned page reports no successor. Used by every summary path
/// so that sums are never computed over a truncated scan.
pub async fn collect_all_pages<T, E, F, Fut>(size: usize, mut fetch: F) -> Result<Vec<T>, E>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = Result<Page<T>, E>>,
{
    let mut request = PageRequest::first(size);
    let mut items = Vec::new();
    loop {
        let page = fetch(request).await?;
        let next = page.next_request();
        items.extend(page.items);
        match next {
            Some(n) => request = n,
            None => return Ok(items),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn page_of(range: std::ops::Range<usize>, request: PageRequest, total: usize) -> Page<usize> {
        Page {
            items: range.collect(),
            page: request.page,
            size: request.size,
            total,
        }
    }

    #[test]
    fn first_clamps_size() {
        assert_eq!(PageRequest::first(0).size, 1);
        assert_eq!(PageRequest::first(5_000).size, MAX_PAGE_SIZE);
        assert_eq!(PageRequest::first(50).size, 50);
    }

    #[test]
    fn offsets() {
        assert_eq!(PageRequest { page: 1, size: 10 }.offset(), 0);
        assert_eq!(PageRequest { page: 3, size: 10 }.offset(), 20);
    }

    #[test]
    fn has_more_and_next() {
        let page = page_of(0..10, PageRequest { page: 1, size: 10 }, 25);
        assert!(page.has_more());
        assert_eq!(page.next_request(), Some(PageRequest { page: 2, size: 10 }));

        let last = page_of(20..25, PageRequest { page: 3, size: 10 }, 25);
        assert!(!last.has_more());
        assert!(last.next_request().is_none());
    }

    #[test]
    fn exact_boundary_has_no_next() {
        let page = page_of(0..10, PageRequest { page: 1, size: 10 }, 10);
        assert!(!page.has_more());
    }

    #[tokio::test]
    async fn collect_all_pages_walks_everything() {
        let data: Vec<usize> = (0..37).collect();
        let collected = collect_all_pages(10, |req| {
            let data = data.clone();
            async move {
                let start = req.offset().min(data.len());
                let end = (start + req.size).min(data.len());
                Ok::<_, Infallible>(Page {
                    items: data[start..end].to_vec(),
                    page: req.page,
                    size: req.size,
                    total: data.len(),
                })
            }
        })
        .await
        .unwrap();
        assert_eq!(collected, data);
    }

    #[tokio::test]
    async fn collect_all_pages_empty() {
        let collected = collect_all_pages(10, |req| async move {
            Ok::<_, Infallible>(Page::<usize> {
                items: vec![],
                page: req.page,
                size: req.size,
                total: 0,
            })
        })
        .await
        .unwrap();
        assert!(collected.is_empty());
    }
}
