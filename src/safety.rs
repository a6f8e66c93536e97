//! URL safety scanning for link creation.
//!
//! Scanners are external and unreliable. Every failure (timeout, 403, 429,
//! network error) is treated as "safe" so a scanner outage can never block
//! link creation.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyVerdict {
    pub safe: bool,
    pub reason: Option<String>,
}

impl SafetyVerdict {
    pub fn safe() -> Self {
        Self {
            safe: true,
            reason: None,
        }
    }

    pub fn unsafe_because(reason: impl Into<String>) -> Self {
        Self {
            safe: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    #[error("scanner timed out after {0:?}")]
    Timeout(Duration),

    #[error("scanner unavailable (HTTP {0})")]
    Unavailable(StatusCode),

    #[error("scanner request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait UrlSafetyChecker: Send + Sync {
    async fn check(&self, url: &str) -> Result<SafetyVerdict, ScannerError>;
}

/// Used when no scanner is configured.
pub struct AllowAll;

#[async_trait]
impl UrlSafetyChecker for AllowAll {
    async fn check(&self, _url: &str) -> Result<SafetyVerdict, ScannerError> {
        Ok(SafetyVerdict::safe())
    }
}

// ── Google Safe Browsing (v4 Lookup API) ───────────────────────────────────

const SAFE_BROWSING_ENDPOINT: &str = "https://safebrowsing.googleapis.com/v4/threatMatches:find";

#[derive(Deserialize)]
struct FindResponse {
    #[serde(default)]
    matches: Vec<ThreatMatch>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreatMatch {
    threat_type: String,
}

pub struct SafeBrowsingChecker {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl SafeBrowsingChecker {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, ScannerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: SAFE_BROWSING_ENDPOINT.to_owned(),
        })
    }
}

fn verdict_from(response: FindResponse) -> SafetyVerdict {
    match response.matches.first() {
        None => SafetyVerdict::safe(),
        Some(found) => SafetyVerdict::unsafe_because(format!(
            "flagged by Safe Browsing as {}",
            found.threat_type
        )),
    }
}

#[async_trait]
impl UrlSafetyChecker for SafeBrowsingChecker {
    async fn check(&self, url: &str) -> Result<SafetyVerdict, ScannerError> {
        let body = json!({
            "client": {
                "clientId": env!("CARGO_PKG_NAME"),
                "clientVersion": env!("CARGO_PKG_VERSION"),
            },
            "threatInfo": {
                "threatTypes": [
                    "MALWARE",
                    "SOCIAL_ENGINEERING",
                    "UNWANTED_SOFTWARE",
                    "POTENTIALLY_HARMFUL_APPLICATION"
                ],
                "platformTypes": ["ANY_PLATFORM"],
                "threatEntryTypes": ["URL"],
                "threatEntries": [{ "url": url }],
            }
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
            return Err(ScannerError::Unavailable(status));
        }
        let resp = resp.error_for_status()?;
        Ok(verdict_from(resp.json::<FindResponse>().await?))
    }
}

// ── Fail-open wrapper ──────────────────────────────────────────────────────

/// Bounds a checker with a timeout and turns every error into a safe
/// verdict, logging why.
pub struct FailOpen {
    inner: Box<dyn UrlSafetyChecker>,
    timeout: Duration,
}

impl FailOpen {
    pub fn new(inner: impl UrlSafetyChecker + 'static, timeout: Duration) -> Self {
        Self {
            inner: Box::new(inner),
            timeout,
        }
    }

    /// Safe Browsing when a key is configured, otherwise no scanning.
    pub fn from_config(api_key: Option<&str>, timeout: Duration) -> Self {
        let Some(key) = api_key else {
            info!("SAFE_BROWSING_API_KEY not set; new links are not scanned");
            return Self::new(AllowAll, timeout);
        };
        match SafeBrowsingChecker::new(key, timeout) {
            Ok(checker) => Self::new(checker, timeout),
            Err(e) => {
                warn!("Safe Browsing client unavailable, links are not scanned: {}", e);
                Self::new(AllowAll, timeout)
            }
        }
    }

    pub async fn check(&self, url: &str) -> SafetyVerdict {
        let result = match tokio::time::timeout(self.timeout, self.inner.check(url)).await {
            Ok(result) => result,
            Err(_) => Err(ScannerError::Timeout(self.timeout)),
        };
        match result {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("URL safety check skipped for {}: {}", url, e);
                SafetyVerdict::safe()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flagging;

    #[async_trait]
    impl UrlSafetyChecker for Flagging {
        async fn check(&self, _url: &str) -> Result<SafetyVerdict, ScannerError> {
            Ok(SafetyVerdict::unsafe_because("malware"))
        }
    }

    struct RateLimited;

    #[async_trait]
    impl UrlSafetyChecker for RateLimited {
        async fn check(&self, _url: &str) -> Result<SafetyVerdict, ScannerError> {
            Err(ScannerError::Unavailable(StatusCode::TOO_MANY_REQUESTS))
        }
    }

    struct Hanging;

    #[async_trait]
    impl UrlSafetyChecker for Hanging {
        async fn check(&self, _url: &str) -> Result<SafetyVerdict, ScannerError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn verdicts_pass_through() {
        let checker = FailOpen::new(Flagging, Duration::from_secs(1));
        assert_eq!(
            checker.check("https://bad.example").await,
            SafetyVerdict::unsafe_because("malware")
        );
    }

    #[tokio::test]
    async fn rate_limited_scanner_fails_open() {
        let checker = FailOpen::new(RateLimited, Duration::from_secs(1));
        assert!(checker.check("https://example.com").await.safe);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_scanner_fails_open() {
        let checker = FailOpen::new(Hanging, Duration::from_secs(3));
        assert!(checker.check("https://example.com").await.safe);
    }

    #[tokio::test]
    async fn no_key_means_no_scanning() {
        let checker = FailOpen::from_config(None, Duration::from_secs(1));
        assert_eq!(checker.check("https://example.com").await, SafetyVerdict::safe());
    }

    #[test]
    fn safe_browsing_matches_become_reasons() {
        let clean: FindResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(verdict_from(clean), SafetyVerdict::safe());

        let flagged: FindResponse = serde_json::from_str(
            r#"{"matches":[{"threatType":"SOCIAL_ENGINEERING","platformType":"ANY_PLATFORM"}]}"#,
        )
        .unwrap();
        let verdict = verdict_from(flagged);
        assert!(!verdict.safe);
        assert_eq!(
            verdict.reason.as_deref(),
            Some("flagged by Safe Browsing as SOCIAL_ENGINEERING")
        );
    }
}
