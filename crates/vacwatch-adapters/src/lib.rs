//! Filter resolution and listing source adapters.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use vacwatch_core::{
    FilterSet, ListingRecord, User, FILTER_AREA, FILTER_EMPLOYMENT, FILTER_EXPERIENCE,
    FILTER_KEYWORDS, FILTER_PROFESSION, FILTER_SALARY_MIN, FILTER_SCHEDULE,
};
use vacwatch_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "vacwatch-adapters";

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const HH_VACANCIES_URL: &str = "https://api.hh.ru/vacancies";

/// Upstream query parameters, ordered for stable request URLs and log output.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct SearchParams {
    params: BTreeMap<String, String>,
}

impl SearchParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl ToString) {
        self.params.insert(name.into(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Fixed paging: freshest first, title-only search, first page of `page_size`.
    pub fn with_paging(mut self, page_size: u32) -> Self {
        self.insert("per_page", page_size);
        self.insert("page", 0);
        self.insert("order_by", "publication_time");
        self.insert("search_field", "name");
        self
    }

    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Lookup tables translating stored filter values into upstream parameter values.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FilterRules {
    pub version: u32,
    pub areas: BTreeMap<String, u32>,
    pub experience: BTreeMap<String, String>,
    pub schedule: BTreeMap<String, String>,
    pub employment: BTreeMap<String, String>,
}

impl Default for FilterRules {
    fn default() -> Self {
        fn table(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        }

        Self {
            version: 1,
            areas: [("Москва", 1), ("Санкт-Петербург", 2), ("remote", 113)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            experience: table(&[
                ("noExperience", "noExperience"),
                ("junior", "between1And3"),
                ("middle", "between3And6"),
                ("senior", "moreThan6"),
                ("lead", "moreThan6"),
            ]),
            schedule: table(&[
                ("office", "fullDay"),
                ("remote", "remote"),
                ("hybrid", "flexible"),
            ]),
            employment: table(&[
                ("fullDay", "full"),
                ("partDay", "part"),
                ("project", "project"),
                ("internship", "probation"),
            ]),
        }
    }
}

impl FilterRules {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing filter rules")
    }

    /// Missing file means built-in tables; an unreadable or malformed file is an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "filter rules file missing, using built-in tables");
            return Ok(Self::default());
        }
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn area_code(&self, name: &str) -> Option<u32> {
        if let Some(code) = self.areas.get(name) {
            return Some(*code);
        }
        let lower = name.to_lowercase();
        self.areas
            .iter()
            .find(|(k, _)| k.to_lowercase() == lower)
            .map(|(_, v)| *v)
    }
}

/// Turns a user's stored criteria into upstream query parameters.
#[derive(Debug, Clone, Default)]
pub struct FilterResolver {
    rules: FilterRules,
    fallback_query: Option<String>,
}

impl FilterResolver {
    pub fn new(rules: FilterRules) -> Self {
        Self {
            rules,
            fallback_query: None,
        }
    }

    /// Query used only when a user has neither structured filters nor a legacy filter string.
    pub fn with_fallback_query(mut self, query: Option<String>) -> Self {
        self.fallback_query = query
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty());
        self
    }

    /// `None` means the user has nothing to search for this cycle.
    pub fn resolve(&self, user: &User, filters: Option<&FilterSet>) -> Option<SearchParams> {
        let params = filters
            .map(|f| self.resolve_structured(user, f))
            .unwrap_or_default();
        if !params.is_empty() {
            return Some(params);
        }

        let text = user
            .legacy_filter_text()
            .map(ToString::to_string)
            .or_else(|| self.fallback_query.clone())?;
        let mut params = SearchParams::new();
        params.insert("text", text);
        Some(params)
    }

    fn resolve_structured(&self, user: &User, filters: &FilterSet) -> SearchParams {
        let mut params = SearchParams::new();

        let mut text_parts = Vec::new();
        if let Some(profession) = filters.text(FILTER_PROFESSION) {
            text_parts.push(profession.to_string());
        }
        if let Some(value) = filters.get(FILTER_KEYWORDS) {
            match keyword_list(value) {
                Some(keywords) => text_parts.extend(keywords),
                None => dropped(user, FILTER_KEYWORDS, value),
            }
        }
        if !text_parts.is_empty() {
            params.insert("text", text_parts.join(" "));
        }

        if let Some(value) = filters.get(FILTER_AREA) {
            match self.area_param(value) {
                Some(code) => params.insert("area", code),
                None => dropped(user, FILTER_AREA, value),
            }
        }

        if let Some(value) = filters.get(FILTER_SALARY_MIN) {
            match positive_amount(value) {
                Some(amount) => params.insert("salary", amount),
                None => dropped(user, FILTER_SALARY_MIN, value),
            }
        }

        for (filter, param, table) in [
            (FILTER_EXPERIENCE, "experience", &self.rules.experience),
            (FILTER_SCHEDULE, "schedule", &self.rules.schedule),
            (FILTER_EMPLOYMENT, "employment", &self.rules.employment),
        ] {
            let Some(value) = filters.get(filter) else {
                continue;
            };
            match value.as_str().and_then(|v| table.get(v.trim())) {
                Some(mapped) => params.insert(param, mapped),
                None => dropped(user, filter, value),
            }
        }

        params
    }

    fn area_param(&self, value: &JsonValue) -> Option<u32> {
        match value {
            JsonValue::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            JsonValue::String(s) => {
                let s = s.trim();
                if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
                    s.parse().ok()
                } else {
                    self.rules.area_code(s)
                }
            }
            _ => None,
        }
    }
}

fn dropped(user: &User, filter: &str, value: &JsonValue) {
    debug!(user_id = %user.id, filter, %value, "dropping unusable filter value");
}

fn keyword_list(value: &JsonValue) -> Option<Vec<String>> {
    let words = match value {
        JsonValue::Array(items) => items
            .iter()
            .filter_map(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        JsonValue::String(s) => s
            .lines()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        _ => return None,
    };
    (!words.is_empty()).then_some(words)
}

fn positive_amount(value: &JsonValue) -> Option<u64> {
    let amount = match value {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f > 0.0).map(|f| f.round() as u64)),
        JsonValue::String(s) => {
            let s = s.trim();
            if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            s.parse().ok()
        }
        _ => None,
    };
    amount.filter(|amount| *amount > 0)
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed search response: {0}")]
    Malformed(String),
}

/// External listing search. Implementors provide `try_search`; callers use `search`,
/// which never fails and reports problems through the log.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn try_search(&self, params: &SearchParams) -> Result<Vec<ListingRecord>, SourceError>;

    async fn search(&self, params: &SearchParams) -> Vec<ListingRecord> {
        match self.try_search(params).await {
            Ok(records) => records,
            Err(err) => {
                error!(source_id = self.source_id(), error = %err, "listing search failed");
                Vec::new()
            }
        }
    }
}

/// Parse a `/vacancies` response body. Items that cannot be normalized are skipped.
pub fn parse_search_response(body: &JsonValue, page_size: u32) -> Result<Vec<ListingRecord>, SourceError> {
    let items = body
        .get("items")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| SourceError::Malformed("missing `items` array".to_string()))?;

    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match ListingRecord::from_source_payload(item) {
            Ok(record) => records.push(record),
            Err(err) => warn!(index, error = %err, "skipping unparseable listing"),
        }
    }
    records.truncate(page_size as usize);
    Ok(records)
}

/// HeadHunter public vacancies API.
#[derive(Debug, Clone)]
pub struct HhListingSource {
    http: Arc<HttpFetcher>,
    base_url: String,
    page_size: u32,
}

impl HhListingSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }
}

#[async_trait]
impl ListingSource for HhListingSource {
    fn source_id(&self) -> &'static str {
        "hh"
    }

    async fn try_search(&self, params: &SearchParams) -> Result<Vec<ListingRecord>, SourceError> {
        let query = params.clone().with_paging(self.page_size).to_query_pairs();
        let body = self.http.get_json(&self.base_url, &query).await?;
        let records = parse_search_response(&body, self.page_size)?;
        info!(source_id = self.source_id(), count = records.len(), "listing search complete");
        Ok(records)
    }
}
