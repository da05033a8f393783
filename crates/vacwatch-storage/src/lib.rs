//! Persistent store contracts, the delivery ledger and HTTP fetch utilities for vacwatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use vacwatch_core::{DeliveryRecord, FilterSet, ListingRecord, SalaryRange, User, UserId};

pub const CRATE_NAME: &str = "vacwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result of saving a listing keyed by its external id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredListing {
    pub record: ListingRecord,
    pub payload_hash: String,
    pub fetched_at: DateTime<Utc>,
}

/// Persistent state collaborator. Implementations own users, filter sets, listings and
/// per-user delivery state; callers hold no state across cycles.
#[async_trait]
pub trait Store: Send + Sync {
    /// Active users in retrieval order.
    async fn get_active_users(&self) -> Result<Vec<User>, StoreError>;

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StoreError>;

    /// Returns the existing user untouched, or inserts `user`.
    async fn get_or_create_user(&self, user: User) -> Result<User, StoreError>;

    /// Returns `false` when the user does not exist.
    async fn set_user_active(&self, user_id: UserId, active: bool) -> Result<bool, StoreError>;

    async fn set_legacy_filter(
        &self,
        user_id: UserId,
        filter: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// `None` when the user has no stored criteria at all.
    async fn get_filter_set(&self, user_id: UserId) -> Result<Option<FilterSet>, StoreError>;

    async fn save_filter(
        &self,
        user_id: UserId,
        name: &str,
        value: JsonValue,
    ) -> Result<(), StoreError>;

    async fn delete_filter(&self, user_id: UserId, name: &str) -> Result<bool, StoreError>;

    async fn clear_filters(&self, user_id: UserId) -> Result<u64, StoreError>;

    /// Insert or overwrite the listing row for `record.external_id`.
    async fn upsert_listing(&self, record: &ListingRecord) -> Result<UpsertOutcome, StoreError>;

    async fn get_listing(&self, external_id: &str) -> Result<Option<StoredListing>, StoreError>;

    async fn get_delivery(
        &self,
        user_id: UserId,
        listing_id: &str,
    ) -> Result<Option<DeliveryRecord>, StoreError>;

    /// Create the pair record if absent. `notified` only ever moves from false to true.
    async fn upsert_delivery(
        &self,
        user_id: UserId,
        listing_id: &str,
        notified: bool,
    ) -> Result<(), StoreError>;

    /// Atomically flip the pair to notified. `true` only for the single caller that made
    /// the flip; every concurrent or later caller gets `false`.
    async fn claim_delivery(&self, user_id: UserId, listing_id: &str) -> Result<bool, StoreError>;

    /// Undo a claim whose message was never delivered.
    async fn release_delivery(&self, user_id: UserId, listing_id: &str) -> Result<(), StoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable fingerprint of the raw source payload, used to tell updates from re-fetches.
pub fn payload_hash(payload: &JsonValue) -> String {
    sha256_hex(payload.to_string().as_bytes())
}

/// At-most-once bookkeeping over a [`Store`].
///
/// `has_been_notified` followed by `record_notified` is only race free while a pair is
/// handled by one caller at a time. `claim` is the atomic form and is what senders use.
#[derive(Clone)]
pub struct DeliveryLedger {
    store: Arc<dyn Store>,
}

impl DeliveryLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn has_been_notified(
        &self,
        user_id: UserId,
        listing_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get_delivery(user_id, listing_id)
            .await?
            .map(|d| d.notified)
            .unwrap_or(false))
    }

    pub async fn record_notified(&self, user_id: UserId, listing_id: &str) -> Result<(), StoreError> {
        self.store.upsert_delivery(user_id, listing_id, true).await
    }

    /// Check-and-set in one step. Callers send only when this returns `true`.
    pub async fn claim(&self, user_id: UserId, listing_id: &str) -> Result<bool, StoreError> {
        self.store.claim_delivery(user_id, listing_id).await
    }

    pub async fn release(&self, user_id: UserId, listing_id: &str) -> Result<(), StoreError> {
        self.store.release_delivery(user_id, listing_id).await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    users: Vec<User>,
    filters: HashMap<UserId, FilterSet>,
    listings: HashMap<String, StoredListing>,
    deliveries: HashMap<(UserId, String), DeliveryRecord>,
}

/// In-process store used by tests and dry runs. Users keep insertion order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn listing_count(&self) -> usize {
        self.state.lock().await.listings.len()
    }

    pub async fn deliveries_for(&self, user_id: UserId) -> Vec<DeliveryRecord> {
        let state = self.state.lock().await;
        let mut out = state
            .deliveries
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.listing_id.cmp(&b.listing_id));
        out
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_active_users(&self) -> Result<Vec<User>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.users.iter().filter(|u| u.is_active).cloned().collect())
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.users.iter().find(|u| u.id == user_id).cloned())
    }

    async fn get_or_create_user(&self, user: User) -> Result<User, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.users.iter().find(|u| u.id == user.id) {
            return Ok(existing.clone());
        }
        state.users.push(user.clone());
        Ok(user)
    }

    async fn set_user_active(&self, user_id: UserId, active: bool) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.users.iter_mut().find(|u| u.id == user_id) {
            Some(user) => {
                user.is_active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_legacy_filter(
        &self,
        user_id: UserId,
        filter: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.users.iter_mut().find(|u| u.id == user_id) {
            Some(user) => {
                user.legacy_filter = filter.map(ToString::to_string);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_filter_set(&self, user_id: UserId) -> Result<Option<FilterSet>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .filters
            .get(&user_id)
            .filter(|f| !f.is_empty())
            .cloned())
    }

    async fn save_filter(
        &self,
        user_id: UserId,
        name: &str,
        value: JsonValue,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.filters.entry(user_id).or_default().insert(name, value);
        Ok(())
    }

    async fn delete_filter(&self, user_id: UserId, name: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .filters
            .get_mut(&user_id)
            .and_then(|f| f.remove(name))
            .is_some())
    }

    async fn clear_filters(&self, user_id: UserId) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .filters
            .remove(&user_id)
            .map(|f| f.len() as u64)
            .unwrap_or(0))
    }

    async fn upsert_listing(&self, record: &ListingRecord) -> Result<UpsertOutcome, StoreError> {
        let hash = payload_hash(&record.payload);
        let mut state = self.state.lock().await;
        let outcome = match state.listings.get(&record.external_id) {
            None => UpsertOutcome::Inserted,
            Some(existing) if existing.payload_hash == hash => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
        };
        state.listings.insert(
            record.external_id.clone(),
            StoredListing {
                record: record.clone(),
                payload_hash: hash,
                fetched_at: Utc::now(),
            },
        );
        Ok(outcome)
    }

    async fn get_listing(&self, external_id: &str) -> Result<Option<StoredListing>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.listings.get(external_id).cloned())
    }

    async fn get_delivery(
        &self,
        user_id: UserId,
        listing_id: &str,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .deliveries
            .get(&(user_id, listing_id.to_string()))
            .cloned())
    }

    async fn upsert_delivery(
        &self,
        user_id: UserId,
        listing_id: &str,
        notified: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .deliveries
            .entry((user_id, listing_id.to_string()))
            .or_insert_with(|| DeliveryRecord::new(user_id, listing_id));
        record.notified |= notified;
        Ok(())
    }

    async fn claim_delivery(&self, user_id: UserId, listing_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .deliveries
            .entry((user_id, listing_id.to_string()))
            .or_insert_with(|| DeliveryRecord::new(user_id, listing_id));
        if record.notified {
            return Ok(false);
        }
        record.notified = true;
        Ok(true)
    }

    async fn release_delivery(&self, user_id: UserId, listing_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.deliveries.get_mut(&(user_id, listing_id.to_string())) {
            record.notified = false;
        }
        Ok(())
    }
}

/// Postgres-backed store. Schema lives in the workspace `migrations/` directory.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: UserId(row.try_get("telegram_id")?),
        display_name: row.try_get("first_name")?,
        username: row.try_get("username")?,
        is_active: row.try_get("is_active")?,
        legacy_filter: row.try_get("search_filters")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Column limits mirror the `vacancies` table definition.
pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn get_active_users(&self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT telegram_id, first_name, username, is_active, search_filters, created_at
              FROM users
             WHERE is_active = TRUE
             ORDER BY created_at, telegram_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let users = rows
            .iter()
            .map(user_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = users.len(), "loaded active users");
        Ok(users)
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT telegram_id, first_name, username, is_active, search_filters, created_at
              FROM users
             WHERE telegram_id = $1
            "#,
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    async fn get_or_create_user(&self, user: User) -> Result<User, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (telegram_id, first_name, username, search_filters, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (telegram_id) DO NOTHING
            "#,
        )
        .bind(user.id.0)
        .bind(truncate_chars(&user.display_name, 100))
        .bind(user.username.as_deref().map(|u| truncate_chars(u, 100)))
        .bind(user.legacy_filter.as_deref())
        .bind(user.is_active)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        let stored = self.get_user(user.id).await?;
        Ok(stored.unwrap_or(user))
    }

    async fn set_user_active(&self, user_id: UserId, active: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE users SET is_active = $2 WHERE telegram_id = $1")
            .bind(user_id.0)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_legacy_filter(
        &self,
        user_id: UserId,
        filter: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE users SET search_filters = $2 WHERE telegram_id = $1")
            .bind(user_id.0)
            .bind(filter)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_filter_set(&self, user_id: UserId) -> Result<Option<FilterSet>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT filter_name, filter_value
              FROM user_filters
             WHERE telegram_id = $1
            "#,
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut filters = FilterSet::new();
        for row in rows {
            let name: String = row.try_get("filter_name")?;
            let value: JsonValue = row.try_get("filter_value")?;
            filters.insert(name, value);
        }
        Ok(Some(filters))
    }

    async fn save_filter(
        &self,
        user_id: UserId,
        name: &str,
        value: JsonValue,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_filters (telegram_id, filter_name, filter_value)
            VALUES ($1, $2, $3)
            ON CONFLICT (telegram_id, filter_name)
            DO UPDATE SET filter_value = EXCLUDED.filter_value,
                          updated_at = NOW()
            "#,
        )
        .bind(user_id.0)
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_filter(&self, user_id: UserId, name: &str) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM user_filters WHERE telegram_id = $1 AND filter_name = $2")
                .bind(user_id.0)
                .bind(name)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_filters(&self, user_id: UserId) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM user_filters WHERE telegram_id = $1")
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_listing(&self, record: &ListingRecord) -> Result<UpsertOutcome, StoreError> {
        let hash = payload_hash(&record.payload);
        let salary = record.salary.clone().unwrap_or_default();
        let row = sqlx::query(
            r#"
            WITH previous AS (
                SELECT payload_hash FROM vacancies WHERE hh_id = $1
            )
            INSERT INTO vacancies (
                hh_id, title, employer_name, salary_from, salary_to, salary_currency,
                area, experience, schedule, url, raw_data, payload_hash, published_at, fetched_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
            ON CONFLICT (hh_id) DO UPDATE SET
                title = EXCLUDED.title,
                employer_name = EXCLUDED.employer_name,
                salary_from = EXCLUDED.salary_from,
                salary_to = EXCLUDED.salary_to,
                salary_currency = EXCLUDED.salary_currency,
                area = EXCLUDED.area,
                experience = EXCLUDED.experience,
                schedule = EXCLUDED.schedule,
                url = EXCLUDED.url,
                raw_data = EXCLUDED.raw_data,
                payload_hash = EXCLUDED.payload_hash,
                published_at = EXCLUDED.published_at,
                fetched_at = EXCLUDED.fetched_at
            RETURNING (SELECT payload_hash FROM previous) AS previous_hash
            "#,
        )
        .bind(&record.external_id)
        .bind(truncate_chars(&record.title, 500))
        .bind(truncate_chars(&record.employer_name, 500))
        .bind(salary.from)
        .bind(salary.to)
        .bind(salary.currency.as_deref().map(|c| truncate_chars(c, 10)))
        .bind(truncate_chars(&record.area, 100))
        .bind(truncate_chars(&record.experience, 50))
        .bind(truncate_chars(&record.schedule, 50))
        .bind(truncate_chars(&record.url, 500))
        .bind(&record.payload)
        .bind(&hash)
        .bind(record.published_at)
        .fetch_one(&self.pool)
        .await?;

        let previous: Option<String> = row.try_get("previous_hash")?;
        Ok(match previous {
            None => UpsertOutcome::Inserted,
            Some(prev) if prev == hash => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
        })
    }

    async fn get_listing(&self, external_id: &str) -> Result<Option<StoredListing>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT hh_id, title, employer_name, salary_from, salary_to, salary_currency,
                   area, experience, schedule, url, raw_data, payload_hash, published_at, fetched_at
              FROM vacancies
             WHERE hh_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let salary = SalaryRange {
            from: row.try_get("salary_from")?,
            to: row.try_get("salary_to")?,
            currency: row.try_get("salary_currency")?,
        };
        let record = ListingRecord {
            external_id: row.try_get("hh_id")?,
            title: row.try_get("title")?,
            employer_name: row.try_get("employer_name")?,
            salary: (!salary.is_unspecified() || salary.currency.is_some()).then_some(salary),
            area: row.try_get("area")?,
            experience: row.try_get("experience")?,
            schedule: row.try_get("schedule")?,
            url: row.try_get("url")?,
            published_at: row.try_get("published_at")?,
            payload: row.try_get("raw_data")?,
        };
        Ok(Some(StoredListing {
            record,
            payload_hash: row.try_get("payload_hash")?,
            fetched_at: row.try_get("fetched_at")?,
        }))
    }

    async fn get_delivery(
        &self,
        user_id: UserId,
        listing_id: &str,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT notified, cover_sent, interested, created_at
              FROM user_vacancies
             WHERE user_id = $1 AND vacancy_id = $2
            "#,
        )
        .bind(user_id.0)
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(DeliveryRecord {
            user_id,
            listing_id: listing_id.to_string(),
            notified: row.try_get("notified")?,
            cover_letter_sent: row.try_get("cover_sent")?,
            interested: row.try_get("interested")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    async fn upsert_delivery(
        &self,
        user_id: UserId,
        listing_id: &str,
        notified: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_vacancies (user_id, vacancy_id, notified)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, vacancy_id)
            DO UPDATE SET notified = user_vacancies.notified OR EXCLUDED.notified
            "#,
        )
        .bind(user_id.0)
        .bind(listing_id)
        .bind(notified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_delivery(&self, user_id: UserId, listing_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO user_vacancies (user_id, vacancy_id, notified)
            VALUES ($1, $2, TRUE)
            ON CONFLICT (user_id, vacancy_id)
            DO UPDATE SET notified = TRUE
                    WHERE user_vacancies.notified = FALSE
            RETURNING notified
            "#,
        )
        .bind(user_id.0)
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn release_delivery(&self, user_id: UserId, listing_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE user_vacancies SET notified = FALSE WHERE user_id = $1 AND vacancy_id = $2",
        )
        .bind(user_id.0)
        .bind(listing_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Fixed-delay retry for idempotent requests.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

const ERROR_BODY_MAX_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// `body` holds the (possibly truncated) error response; APIs often explain the failure there.
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("malformed json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http concurrency limiter closed")]
    LimiterClosed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            retry: config.retry,
        })
    }

    /// GET with query parameters, retried per the configured policy.
    pub async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", method = "GET", url);
        self.execute(|| self.client.get(url).query(query), self.retry.max_retries)
            .instrument(span)
            .await
    }

    pub async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<JsonValue, FetchError> {
        let response = self.get(url, query).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }

    /// POST a JSON body exactly once; message sends are not idempotent.
    pub async fn post_json(
        &self,
        url: &str,
        body: &JsonValue,
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(|| self.client.post(url).json(body), 0).await
    }

    async fn execute<F>(&self, make_request: F, max_retries: usize) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let mut attempt = 0usize;
        loop {
            match make_request().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && attempt < max_retries {
                        attempt += 1;
                        debug!(%status, attempt, "retrying after retryable status");
                        tokio::time::sleep(self.retry.delay).await;
                        continue;
                    }

                    let body = resp
                        .text()
                        .await
                        .map(|text| truncate_chars(&text, ERROR_BODY_MAX_CHARS))
                        .unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < max_retries
                    {
                        attempt += 1;
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.retry.delay).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
