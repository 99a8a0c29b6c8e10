use serde::Serialize;
use url::form_urlencoded;

use crate::config::{RunConfig, SortMode};
use crate::plan::IterationIndex;

/// Path of the product search endpoint, appended to the base URL.
pub const SEARCH_PATH: &str = "/api/v1/products";

/// Grouping label attached to every request and its observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RequestLabel {
    pub page: u64,
    pub size: u32,
    pub brand_id: i64,
    pub sort: SortMode,
}

impl RequestLabel {
    pub fn new(config: &RunConfig, page: u64) -> Self {
        Self {
            page,
            size: config.size,
            brand_id: config.brand_id,
            sort: config.sort,
        }
    }

    /// Short request name, e.g. `page=3,size=20`.
    pub fn name(&self) -> String {
        format!("page={},size={}", self.page, self.size)
    }
}

/// A single search request. Built per iteration and dropped after dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub index: IterationIndex,
    pub url: String,
    pub label: RequestLabel,
}

impl SearchRequest {
    pub fn for_iteration(config: &RunConfig, index: IterationIndex) -> Self {
        Self {
            index,
            url: build_url(config, index.page),
            label: RequestLabel::new(config, index.page),
        }
    }
}

/// Build the search URL for `page`.
///
/// Parameters are always emitted as `brandId, page, size, sort`, followed by
/// `keyword` when one is configured. Values use form encoding, so spaces
/// become `+`.
pub fn build_url(config: &RunConfig, page: u64) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query
        .append_pair("brandId", &config.brand_id.to_string())
        .append_pair("page", &page.to_string())
        .append_pair("size", &config.size.to_string())
        .append_pair("sort", config.sort.as_str());
    if let Some(keyword) = config.keyword.as_deref().filter(|value| !value.is_empty()) {
        query.append_pair("keyword", keyword);
    }
    format!(
        "{}{SEARCH_PATH}?{}",
        config.base_url.trim_end_matches('/'),
        query.finish()
    )
}
