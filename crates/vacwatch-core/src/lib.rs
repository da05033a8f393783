//! Core domain model for vacancy watching: users, filter sets, listings and delivery records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "vacwatch-core";

pub const FILTER_PROFESSION: &str = "profession";
pub const FILTER_SALARY_MIN: &str = "salary_min";
pub const FILTER_EXPERIENCE: &str = "experience";
pub const FILTER_SCHEDULE: &str = "schedule";
pub const FILTER_EMPLOYMENT: &str = "employment";
pub const FILTER_AREA: &str = "area";
pub const FILTER_KEYWORDS: &str = "keywords";

/// Longest listing id the store accepts as a key.
pub const MAX_LISTING_ID_CHARS: usize = 50;

/// Title used when the source omits a listing name.
pub const UNTITLED_LISTING: &str = "Untitled";

/// Opaque chat identity of a registered user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub username: Option<String>,
    pub is_active: bool,
    /// Old-format free-text search string, consulted only when no structured filters resolve.
    pub legacy_filter: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            username: None,
            is_active: true,
            legacy_filter: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_legacy_filter(mut self, filter: impl Into<String>) -> Self {
        self.legacy_filter = Some(filter.into());
        self
    }

    pub fn legacy_filter_text(&self) -> Option<&str> {
        self.legacy_filter
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Per-user search criteria keyed by filter name. Values stay loosely typed JSON because
/// configuration flows store whatever the user entered; the resolver decides what is usable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSet {
    entries: BTreeMap<String, JsonValue>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<JsonValue>) {
        self.entries.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<JsonValue> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.entries.get(name)
    }

    /// Trimmed, non-empty string value for `name`.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.entries.iter()
    }
}

impl FromIterator<(String, JsonValue)> for FilterSet {
    fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SalaryRange {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub currency: Option<String>,
}

impl SalaryRange {
    pub fn is_unspecified(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListingParseError {
    #[error("listing payload is not a JSON object")]
    NotAnObject,
    #[error("listing payload has no usable id")]
    MissingId,
    #[error("listing id is {chars} characters long, limit is {max}", max = MAX_LISTING_ID_CHARS)]
    IdTooLong { chars: usize },
}

/// Normalized listing as returned by the external source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub external_id: String,
    pub title: String,
    pub employer_name: String,
    pub salary: Option<SalaryRange>,
    pub area: String,
    pub experience: String,
    pub schedule: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub payload: JsonValue,
}

impl ListingRecord {
    /// Parse one item of a source search response.
    ///
    /// Defaults for missing fields: title falls back to [`UNTITLED_LISTING`]; employer, area,
    /// experience, schedule and url fall back to an empty string; a salary that is absent or
    /// not an object is `None`, and non-numeric bounds become `None`. A missing, empty or
    /// over-long id is an error because the id is the deduplication key and is never cut.
    pub fn from_source_payload(payload: &JsonValue) -> Result<Self, ListingParseError> {
        if !payload.is_object() {
            return Err(ListingParseError::NotAnObject);
        }

        let external_id = match payload.get("id") {
            Some(JsonValue::String(s)) => s.trim().to_string(),
            Some(JsonValue::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        if external_id.is_empty() {
            return Err(ListingParseError::MissingId);
        }
        let chars = external_id.chars().count();
        if chars > MAX_LISTING_ID_CHARS {
            return Err(ListingParseError::IdTooLong { chars });
        }

        let title = json_str(payload, &["name"])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNTITLED_LISTING)
            .to_string();

        let salary = payload
            .get("salary")
            .filter(|v| v.is_object())
            .map(|s| SalaryRange {
                from: json_whole_number(s.get("from")),
                to: json_whole_number(s.get("to")),
                currency: json_str(s, &["currency"]).map(ToString::to_string),
            });

        let published_at = json_str(payload, &["published_at"]).and_then(parse_source_timestamp);

        Ok(Self {
            external_id,
            title,
            employer_name: named_field(payload, "employer"),
            salary,
            area: named_field(payload, "area"),
            experience: named_field(payload, "experience"),
            schedule: named_field(payload, "schedule"),
            url: json_str(payload, &["alternate_url"])
                .unwrap_or_default()
                .to_string(),
            published_at,
            payload: payload.clone(),
        })
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_str()
}

fn json_whole_number(value: Option<&JsonValue>) -> Option<i64> {
    let value = value?;
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64))
}

/// The source nests display names as `{"name": ...}` objects but older payloads carry bare strings.
fn named_field(payload: &JsonValue, key: &str) -> String {
    match payload.get(key) {
        Some(JsonValue::Object(map)) => map
            .get("name")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string(),
        Some(JsonValue::String(s)) => s.clone(),
        _ => String::new(),
    }
}

/// HeadHunter emits offsets without a colon (`2026-02-24T12:00:00+0300`), which RFC 3339 rejects.
fn parse_source_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Per (user, listing) delivery state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub user_id: UserId,
    pub listing_id: String,
    pub notified: bool,
    pub cover_letter_sent: bool,
    pub interested: bool,
    pub created_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn new(user_id: UserId, listing_id: impl Into<String>) -> Self {
        Self {
            user_id,
            listing_id: listing_id.into(),
            notified: false,
            cover_letter_sent: false,
            interested: true,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn parses_full_source_item() {
        let item = json!({
            "id": "93353083",
            "name": "Python developer",
            "employer": {"name": "Acme"},
            "salary": {"from": 150000, "to": 200000, "currency": "RUR"},
            "area": {"name": "Москва"},
            "experience": {"name": "1–3 years"},
            "schedule": {"name": "Remote"},
            "alternate_url": "https://hh.ru/vacancy/93353083",
            "published_at": "2026-02-24T12:00:00+0300"
        });

        let record = ListingRecord::from_source_payload(&item).unwrap();
        assert_eq!(record.external_id, "93353083");
        assert_eq!(record.title, "Python developer");
        assert_eq!(record.employer_name, "Acme");
        assert_eq!(
            record.salary,
            Some(SalaryRange {
                from: Some(150000),
                to: Some(200000),
                currency: Some("RUR".into()),
            })
        );
        assert_eq!(record.area, "Москва");
        assert_eq!(record.schedule, "Remote");
        assert_eq!(
            record.published_at,
            Some(Utc.with_ymd_and_hms(2026, 2, 24, 9, 0, 0).single().unwrap())
        );
        assert_eq!(record.payload, item);
    }

    #[test]
    fn missing_fields_fall_back_to_documented_defaults() {
        let item = json!({"id": 42, "salary": null, "employer": "Plain Employer"});
        let record = ListingRecord::from_source_payload(&item).unwrap();
        assert_eq!(record.external_id, "42");
        assert_eq!(record.title, UNTITLED_LISTING);
        assert_eq!(record.employer_name, "Plain Employer");
        assert!(record.salary.is_none());
        assert_eq!(record.url, "");
        assert_eq!(record.area, "");
        assert!(record.published_at.is_none());
    }

    #[test]
    fn non_numeric_salary_bounds_are_dropped() {
        let item = json!({"id": "1", "salary": {"from": "lots", "to": 90000.4, "currency": "USD"}});
        let salary = ListingRecord::from_source_payload(&item).unwrap().salary.unwrap();
        assert_eq!(salary.from, None);
        assert_eq!(salary.to, Some(90000));
    }

    #[test]
    fn missing_or_blank_id_is_rejected() {
        assert_eq!(
            ListingRecord::from_source_payload(&json!({"name": "x"})),
            Err(ListingParseError::MissingId)
        );
        assert_eq!(
            ListingRecord::from_source_payload(&json!({"id": "  "})),
            Err(ListingParseError::MissingId)
        );
        assert_eq!(
            ListingRecord::from_source_payload(&json!(["id"])),
            Err(ListingParseError::NotAnObject)
        );
    }

    #[test]
    fn over_long_id_is_rejected_rather_than_cut() {
        let at_limit = "7".repeat(MAX_LISTING_ID_CHARS);
        let record = ListingRecord::from_source_payload(&json!({"id": at_limit})).unwrap();
        assert_eq!(record.external_id, at_limit);

        let too_long = "7".repeat(MAX_LISTING_ID_CHARS + 10);
        assert_eq!(
            ListingRecord::from_source_payload(&json!({"id": too_long})),
            Err(ListingParseError::IdTooLong { chars: 60 })
        );
    }

    #[test]
    fn filter_set_text_ignores_blank_and_non_string_values() {
        let filters = FilterSet::new()
            .with(FILTER_PROFESSION, "  Python ")
            .with(FILTER_AREA, "   ")
            .with(FILTER_SALARY_MIN, 100000);
        assert_eq!(filters.text(FILTER_PROFESSION), Some("Python"));
        assert_eq!(filters.text(FILTER_AREA), None);
        assert_eq!(filters.text(FILTER_SALARY_MIN), None);
        assert_eq!(filters.len(), 3);
    }

    #[test]
    fn legacy_filter_text_is_trimmed() {
        let user = User::new(UserId(7), "Ann").with_legacy_filter("  rust junior ");
        assert_eq!(user.legacy_filter_text(), Some("rust junior"));
        assert_eq!(User::new(UserId(8), "Bob").legacy_filter_text(), None);
    }
}
