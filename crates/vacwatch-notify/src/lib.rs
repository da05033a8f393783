//! Listing notifications: message formatting and chat transports.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};
use vacwatch_core::{ListingRecord, SalaryRange, UserId};
use vacwatch_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "vacwatch-notify";

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("chat send failed: {0}")]
    Send(String),
    #[error("chat api rejected message: {0}")]
    Rejected(String),
}

/// Outbound chat channel to a user's session.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, user_id: UserId, text: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Deserialize)]
struct TelegramApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram Bot API `sendMessage`, plain text.
#[derive(Debug, Clone)]
pub struct TelegramTransport {
    http: Arc<HttpFetcher>,
    token: String,
    api_base: String,
}

impl TelegramTransport {
    pub fn new(http: Arc<HttpFetcher>, token: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
            api_base: TELEGRAM_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }
}

/// Error text for transport failures; the request URL embeds the bot token and is left out.
fn describe_fetch_error(err: FetchError) -> TransportError {
    match err {
        FetchError::Request(err) => TransportError::Send(err.without_url().to_string()),
        FetchError::HttpStatus { status, body, .. } => {
            let description = serde_json::from_str::<TelegramApiResponse>(&body)
                .ok()
                .and_then(|parsed| parsed.description);
            match description {
                Some(description) => {
                    TransportError::Rejected(format!("http status {status}: {description}"))
                }
                None => TransportError::Rejected(format!("http status {status}")),
            }
        }
        FetchError::Decode { source, .. } => TransportError::Rejected(source.to_string()),
        FetchError::LimiterClosed => TransportError::Send("http limiter closed".to_string()),
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_message(&self, user_id: UserId, text: &str) -> Result<(), TransportError> {
        let body = json!({
            "chat_id": user_id.0,
            "text": text,
        });
        let response = self
            .http
            .post_json(&self.api_url("sendMessage"), &body)
            .await
            .map_err(describe_fetch_error)?;

        let parsed: TelegramApiResponse = serde_json::from_slice(&response.body)
            .map_err(|e| TransportError::Rejected(format!("invalid sendMessage response: {e}")))?;
        if !parsed.ok {
            return Err(TransportError::Rejected(
                parsed.description.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    Failed,
}

/// Formats listings and pushes them through a [`ChatTransport`]. Send failures are logged
/// and reported as [`NotifyOutcome::Failed`]; they never propagate.
#[derive(Clone)]
pub struct Notifier {
    transport: Arc<dyn ChatTransport>,
}

impl Notifier {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self { transport }
    }

    pub async fn notify(&self, user_id: UserId, listing: &ListingRecord) -> NotifyOutcome {
        let message = format_listing_message(listing);
        match self.transport.send_message(user_id, &message).await {
            Ok(()) => {
                debug!(%user_id, listing_id = %listing.external_id, "listing notification sent");
                NotifyOutcome::Sent
            }
            Err(err) => {
                error!(
                    %user_id,
                    listing_id = %listing.external_id,
                    error = %err,
                    "listing notification failed"
                );
                NotifyOutcome::Failed
            }
        }
    }
}

pub fn format_listing_message(listing: &ListingRecord) -> String {
    let employer = non_empty_or(&listing.employer_name, "not specified");
    let url = non_empty_or(&listing.url, "no link");
    let salary = listing
        .salary
        .as_ref()
        .map(format_salary)
        .unwrap_or_else(|| "not specified".to_string());

    format!(
        "New vacancy!\n\n\
         Position: {}\n\
         Company: {}\n\
         Salary: {}\n\
         Link: {}",
        listing.title, employer, salary, url
    )
}

pub fn format_salary(salary: &SalaryRange) -> String {
    let currency = salary
        .currency
        .as_deref()
        .map(|c| format!(" {c}"))
        .unwrap_or_default();
    match (salary.from, salary.to) {
        (Some(from), Some(to)) => format!(
            "{} - {}{}",
            group_thousands(from),
            group_thousands(to),
            currency
        ),
        (Some(from), None) => format!("from {}{}", group_thousands(from), currency),
        (None, Some(to)) => format!("up to {}{}", group_thousands(to), currency),
        (None, None) => "not specified".to_string(),
    }
}

/// `1234567` -> `1 234 567`.
pub fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(' ');
        }
        out.push(ch);
    }
    out
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn listing(salary: Option<SalaryRange>) -> ListingRecord {
        let mut record = ListingRecord::from_source_payload(&json!({
            "id": "77",
            "name": "Rust developer",
            "employer": {"name": "Ferris Ltd"},
            "alternate_url": "https://hh.ru/vacancy/77",
        }))
        .unwrap();
        record.salary = salary;
        record
    }

    fn salary(from: Option<i64>, to: Option<i64>) -> SalaryRange {
        SalaryRange {
            from,
            to,
            currency: Some("RUR".to_string()),
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(UserId, String)>>,
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send_message(&self, user_id: UserId, text: &str) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((user_id, text.to_string()));
            Ok(())
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl ChatTransport for FailingTransport {
        async fn send_message(&self, _user_id: UserId, _text: &str) -> Result<(), TransportError> {
            Err(TransportError::Send("connection reset".to_string()))
        }
    }

    #[test]
    fn salary_branches() {
        assert_eq!(
            format_salary(&salary(Some(100000), Some(150000))),
            "100 000 - 150 000 RUR"
        );
        assert_eq!(format_salary(&salary(Some(90000), None)), "from 90 000 RUR");
        assert_eq!(format_salary(&salary(None, Some(5000))), "up to 5 000 RUR");
        assert_eq!(format_salary(&salary(None, None)), "not specified");
        assert_eq!(
            format_salary(&SalaryRange {
                from: Some(700),
                to: None,
                currency: None
            }),
            "from 700"
        );
    }

    #[test]
    fn thousands_grouping() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1 000");
        assert_eq!(group_thousands(1234567), "1 234 567");
        assert_eq!(group_thousands(-25000), "-25 000");
    }

    #[test]
    fn message_has_fixed_structure() {
        let text = format_listing_message(&listing(Some(salary(Some(120000), None))));
        assert_eq!(
            text,
            "New vacancy!\n\nPosition: Rust developer\nCompany: Ferris Ltd\nSalary: from 120 000 RUR\nLink: https://hh.ru/vacancy/77"
        );
    }

    #[test]
    fn message_fills_missing_employer_link_and_salary() {
        let mut record = listing(None);
        record.employer_name.clear();
        record.url.clear();
        let text = format_listing_message(&record);
        assert!(text.contains("Company: not specified"));
        assert!(text.contains("Salary: not specified"));
        assert!(text.contains("Link: no link"));
    }

    #[tokio::test]
    async fn notifier_reports_sent_and_failed() {
        let recording = Arc::new(RecordingTransport::default());
        let notifier = Notifier::new(recording.clone());
        assert_eq!(
            notifier.notify(UserId(3), &listing(None)).await,
            NotifyOutcome::Sent
        );
        let sent = recording.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, UserId(3));
        assert!(sent[0].1.contains("Rust developer"));

        let failing = Notifier::new(Arc::new(FailingTransport));
        assert_eq!(
            failing.notify(UserId(3), &listing(None)).await,
            NotifyOutcome::Failed
        );
    }

    #[test]
    fn fetch_errors_do_not_leak_the_request_url() {
        let err = describe_fetch_error(FetchError::HttpStatus {
            status: 403,
            url: "https://api.telegram.org/botSECRET/sendMessage".to_string(),
            body: String::new(),
        });
        assert!(!err.to_string().contains("SECRET"));
    }

    #[test]
    fn api_error_description_survives_non_success_status() {
        let err = describe_fetch_error(FetchError::HttpStatus {
            status: 400,
            url: "https://api.telegram.org/botSECRET/sendMessage".to_string(),
            body: r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#
                .to_string(),
        });
        let text = err.to_string();
        assert!(text.contains("400"));
        assert!(text.contains("chat not found"));
        assert!(!text.contains("SECRET"));

        let err = describe_fetch_error(FetchError::HttpStatus {
            status: 502,
            url: String::new(),
            body: "<html>bad gateway</html>".to_string(),
        });
        assert_eq!(err.to_string(), "chat api rejected message: http status 502");
    }
}
