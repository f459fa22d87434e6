//! Request descriptors handed to the optimizer by collaborators

use std::collections::BTreeMap;
use std::time::Duration;

use crate::pagination::{parse_query_string, PaginationQuery};

/// Query parameters owned by the pagination planner
const PAGING_PARAMS: [&str; 2] = ["page", "limit"];

/// An API request as seen by the optimizer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: String,
    pub path: String,
    /// Decoded query parameters
    pub query: BTreeMap<String, String>,
    pub accept_encoding: Option<String>,
    pub content_type: Option<String>,
}

impl ApiRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Merge a raw, percent-encoded query string into the parameters
    pub fn with_query_string(mut self, query: &str) -> Self {
        self.query.extend(parse_query_string(query));
        self
    }

    pub fn with_accept_encoding(mut self, header: impl Into<String>) -> Self {
        self.accept_encoding = Some(header.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn pagination_query(&self) -> PaginationQuery {
        PaginationQuery::from_params(&self.query)
    }

    /// Cache key for one page of this request
    ///
    /// `api:{METHOD}:{path}?{query}` with parameters sorted by name and the
    /// raw `page`/`limit` replaced by the planned values, so equivalent
    /// requests share a key.
    pub fn cache_key(&self, page: u64, limit: u64) -> String {
        let mut params: Vec<(String, String)> = self
            .query
            .iter()
            .filter(|(name, _)| !PAGING_PARAMS.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        params.push(("limit".to_string(), limit.to_string()));
        params.push(("page".to_string(), page.to_string()));
        params.sort();

        let query = params
            .iter()
            .map(|(name, value)| {
                format!("{}={}", urlencoding::encode(name), urlencoding::encode(value))
            })
            .collect::<Vec<_>>()
            .join("&");

        format!("api:{}:{}?{}", self.method.to_ascii_uppercase(), self.path, query)
    }

    /// Cache key for a request that is not paginated
    pub fn unpaged_cache_key(&self) -> String {
        let query = self
            .query
            .iter()
            .map(|(name, value)| {
                format!("{}={}", urlencoding::encode(name), urlencoding::encode(value))
            })
            .collect::<Vec<_>>()
            .join("&");

        format!("api:{}:{}?{}", self.method.to_ascii_uppercase(), self.path, query)
    }
}

/// Per-call pipeline switches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseOptions {
    pub enable_pagination: bool,
    pub enable_caching: bool,
    pub enable_compression: bool,
    /// Write the following pages to the cache in the background
    pub enable_prefetch: bool,
    /// Total row count when `data` is already the requested page.
    /// `None` means `data` is the full result set and is sliced here.
    pub total_count: Option<u64>,
    /// Overrides the cache's default TTL
    pub cache_ttl: Option<Duration>,
    /// Coordinate with other callers sharing this batch key
    pub batch_key: Option<String>,
}

impl Default for ResponseOptions {
    fn default() -> Self {
        Self {
            enable_pagination: true,
            enable_caching: true,
            enable_compression: true,
            enable_prefetch: false,
            total_count: None,
            cache_ttl: None,
            batch_key: None,
        }
    }
}

impl ResponseOptions {
    pub fn with_prefetch(mut self) -> Self {
        self.enable_prefetch = true;
        self
    }

    pub fn with_total_count(mut self, total: u64) -> Self {
        self.total_count = Some(total);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.enable_caching = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_is_normalized() {
        let a = ApiRequest::new("get", "/trips")
            .with_param("status", "open")
            .with_param("city", "Lagos")
            .with_param("page", "02")
            .with_param("limit", "abc");
        let b = ApiRequest::new("GET", "/trips").with_query_string("city=Lagos&status=open");

        assert_eq!(a.cache_key(2, 20), b.cache_key(2, 20));
        assert_eq!(
            a.cache_key(2, 20),
            "api:GET:/trips?city=Lagos&limit=20&page=2&status=open"
        );
        assert_ne!(a.cache_key(2, 20), a.cache_key(3, 20));
    }

    #[test]
    fn test_cache_key_encodes_values() {
        let request = ApiRequest::new("GET", "/search").with_query_string("q=a%26b+c");
        assert_eq!(request.query["q"], "a&b c");
        assert_eq!(
            request.cache_key(1, 20),
            "api:GET:/search?limit=20&page=1&q=a%26b%20c"
        );
        assert_eq!(request.unpaged_cache_key(), "api:GET:/search?q=a%26b%20c");
    }

    #[test]
    fn test_pagination_query_from_params() {
        let query = ApiRequest::new("GET", "/trips")
            .with_query_string("page=3&limit=50")
            .pagination_query();
        assert_eq!(query.page.as_deref(), Some("3"));
        assert_eq!(query.limit.as_deref(), Some("50"));
    }
}
