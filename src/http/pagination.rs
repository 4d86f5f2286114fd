//! Pagination parameters and the list response envelope.

use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// Query parameters accepted by every list endpoint. `page` is 1-based.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageParams {
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

impl PageParams {
    pub fn page(&self) -> usize {
        self.page.unwrap_or(1).max(1)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> usize {
        (self.page() - 1) * self.page_size()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

/// Wraps a list under its entity name with the pagination object.
pub fn envelope<T: Serialize>(
    name: &str,
    items: &[T],
    params: &PageParams,
    total: usize,
) -> serde_json::Value {
    serde_json::json!({
        name: items,
        "pagination": Pagination {
            page: params.page(),
            page_size: params.page_size(),
            total,
        },
    })
}
