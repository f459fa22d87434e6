//! Pagination Planning
//!
//! Turns raw `page` / `limit` query values into a clamped paging plan, flags
//! deep or wasteful pagination, and lists pages worth prefetching.
//!
//! # Rules
//!
//! - `page` defaults to 1; values below 1 become 1
//! - `limit` defaults to `default_page_size`; numeric values are clamped to
//!   `[1, max_page_size]`
//! - `offset = (page - 1) * limit`
//! - Deep pagination (page, offset, or fraction of the result set past a
//!   threshold) and tiny pages are `poor`; pages past half the deep
//!   thresholds are `fair`

mod proptest;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cache::Efficiency;
use crate::error::{Error, Result};

/// Planner thresholds and defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationDefaults {
    pub default_page_size: u64,
    pub max_page_size: u64,
    /// Pages past the current one to prefetch
    pub prefetch_window: u64,
    /// Page numbers beyond this are deep
    pub deep_page_threshold: u64,
    /// Offsets beyond this are deep
    pub deep_offset_threshold: u64,
    /// Offsets beyond this fraction of the estimated total are deep
    pub deep_fraction: f64,
    /// Limits below this are wastefully small
    pub small_page_threshold: u64,
}

impl Default for PaginationDefaults {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
            prefetch_window: 2,
            deep_page_threshold: 100,
            deep_offset_threshold: 10_000,
            deep_fraction: 0.9,
            small_page_threshold: 10,
        }
    }
}

impl PaginationDefaults {
    pub fn validate(&self) -> Result<()> {
        if self.max_page_size == 0 {
            return Err(Error::Config("pagination.max_page_size must be positive".into()));
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(Error::Config(
                "pagination.default_page_size must be within [1, max_page_size]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.deep_fraction) {
            return Err(Error::Config(
                "pagination.deep_fraction must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Raw paging parameters as they arrive on the query string
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
}

impl PaginationQuery {
    pub fn new(page: impl Into<String>, limit: impl Into<String>) -> Self {
        Self {
            page: Some(page.into()),
            limit: Some(limit.into()),
        }
    }

    /// Pick `page` and `limit` out of a raw query string such as `page=2&limit=50`
    pub fn from_query_string(query: &str) -> Self {
        let params = parse_query_string(query);
        Self::from_params(&params)
    }

    /// Pick `page` and `limit` out of decoded query parameters
    pub fn from_params(params: &BTreeMap<String, String>) -> Self {
        Self {
            page: params.get("page").cloned(),
            limit: params.get("limit").cloned(),
        }
    }
}

/// Decode a query string into a sorted map; later duplicates win
pub fn parse_query_string(query: &str) -> BTreeMap<String, String> {
    let decode = |s: &str| {
        let s = s.replace('+', " ");
        match urlencoding::decode(&s) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => s.clone(),
        }
    };

    query
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode(k), decode(v)),
            None => (decode(pair), String::new()),
        })
        .collect()
}

/// Per-request planning inputs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaginationOptions {
    pub enable_prefetch: bool,
    pub estimated_total_count: Option<u64>,
}

/// Efficiency assessment of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginationOptimization {
    pub efficiency: Efficiency,
    pub suggestions: Vec<String>,
    pub use_cursor_pagination: bool,
}

/// Paging decision for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginationPlan {
    pub page: u64,
    pub limit: u64,
    pub offset: u64,
    pub should_prefetch: bool,
    pub prefetch_pages: Vec<u64>,
    pub optimization: PaginationOptimization,
}

/// Page description returned alongside the data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub page: u64,
    pub limit: u64,
    pub total_count: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PageInfo {
    pub fn new(total_count: u64, page: u64, limit: u64) -> Self {
        let page = page.max(1);
        let limit = limit.max(1);
        let total_pages = total_pages(total_count, limit);
        Self {
            page,
            limit,
            total_count,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub result_count: usize,
    /// Fraction of the page slots filled
    pub page_efficiency: f64,
}

/// A page of data with its paging envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub pagination: PageInfo,
    pub metadata: PageMetadata,
}

/// Pure pagination planner
#[derive(Debug, Clone, Default)]
pub struct PaginationPlanner {
    defaults: PaginationDefaults,
}

impl PaginationPlanner {
    pub fn new(defaults: PaginationDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &PaginationDefaults {
        &self.defaults
    }

    fn parse_page(&self, raw: Option<&str>) -> u64 {
        raw.and_then(|p| p.trim().parse::<i64>().ok())
            .map_or(1, |p| p.max(1) as u64)
    }

    fn parse_limit(&self, raw: Option<&str>) -> u64 {
        let max = self.defaults.max_page_size.max(1);
        let max_signed = i64::try_from(max).unwrap_or(i64::MAX);
        raw.and_then(|l| l.trim().parse::<i64>().ok())
            .map_or(self.defaults.default_page_size, |l| {
                l.clamp(1, max_signed) as u64
            })
            .clamp(1, max)
    }

    /// Build the paging plan for a request
    pub fn optimize_pagination(
        &self,
        query: &PaginationQuery,
        options: &PaginationOptions,
    ) -> PaginationPlan {
        let page = self.parse_page(query.page.as_deref());
        let limit = self.parse_limit(query.limit.as_deref());
        let offset = (page - 1).saturating_mul(limit);

        let prefetch_pages = match (options.enable_prefetch, options.estimated_total_count) {
            (true, Some(total)) => {
                let last = total_pages(total, limit);
                (page + 1..=page.saturating_add(self.defaults.prefetch_window))
                    .take_while(|p| *p <= last)
                    .collect()
            }
            _ => Vec::new(),
        };

        PaginationPlan {
            page,
            limit,
            offset,
            should_prefetch: !prefetch_pages.is_empty(),
            prefetch_pages,
            optimization: self.assess(page, limit, offset, options.estimated_total_count),
        }
    }

    fn assess(
        &self,
        page: u64,
        limit: u64,
        offset: u64,
        estimated_total: Option<u64>,
    ) -> PaginationOptimization {
        let d = &self.defaults;
        let mut suggestions = Vec::new();

        let deep_by_fraction = estimated_total
            .filter(|total| *total > 0)
            .is_some_and(|total| offset as f64 > total as f64 * d.deep_fraction);
        let deep = page > d.deep_page_threshold
            || offset > d.deep_offset_threshold
            || deep_by_fraction;
        let tiny = limit < d.small_page_threshold;
        let moderately_deep =
            page > d.deep_page_threshold / 2 || offset > d.deep_offset_threshold / 2;

        if deep {
            suggestions.push(format!(
                "Deep pagination (page {}, offset {}); switch to cursor-based pagination",
                page, offset
            ));
        }
        if let Some(total) = estimated_total {
            if offset >= total {
                suggestions.push(format!(
                    "Offset {} is past the estimated {} results; this page will be empty",
                    offset, total
                ));
            }
        }
        if tiny {
            suggestions.push(format!(
                "Page size {} is small; use at least {} items per page to cut round trips",
                limit, d.small_page_threshold
            ));
        }

        let efficiency = if deep || tiny {
            Efficiency::Poor
        } else if moderately_deep {
            suggestions.push(
                "Pages this deep get slower; consider cursor pagination or narrower filters"
                    .to_string(),
            );
            Efficiency::Fair
        } else {
            Efficiency::Good
        };

        PaginationOptimization {
            efficiency,
            suggestions,
            use_cursor_pagination: deep,
        }
    }

    /// Wrap a page of data with its paging envelope
    pub fn create_paginated_response<T>(
        &self,
        data: Vec<T>,
        total_count: u64,
        page: u64,
        limit: u64,
    ) -> PaginatedResponse<T> {
        create_paginated_response(data, total_count, page, limit)
    }
}

fn total_pages(total_count: u64, limit: u64) -> u64 {
    total_count.div_ceil(limit.max(1))
}

/// Wrap a page of data with its paging envelope
pub fn create_paginated_response<T>(
    data: Vec<T>,
    total_count: u64,
    page: u64,
    limit: u64,
) -> PaginatedResponse<T> {
    let pagination = PageInfo::new(total_count, page, limit);
    let result_count = data.len();

    PaginatedResponse {
        data,
        metadata: PageMetadata {
            result_count,
            page_efficiency: result_count as f64 / pagination.limit as f64,
        },
        pagination,
    }
}

// =============================================================================
// Tests
// =============================================================================
