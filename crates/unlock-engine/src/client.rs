//! The unlock request itself
//!
//! Builds the single authenticated POST and classifies the service's answer.
//! Authentication travels in the cookie header (service token, client
//! version fields, device identifier); the body is a fixed JSON retry
//! marker unless the caller supplies one. No retries here — retry policy
//! belongs to the engine.
//!
//! Response shape: `{"code": <top>, "data": {"apply_result": <nested>}}`.
//! A non-zero top-level code short-circuits; otherwise the nested result
//! decides the outcome (1 accepted, 3 rate limited, 4 temporarily blocked).

use std::time::Duration;

use reqwest::header;
use serde_json::Value;

use provider::TokenSet;

use crate::error::{Error, Result};

/// Body sent when the caller supplies none.
pub const DEFAULT_BODY: &str = r#"{"is_retry":true}"#;

const USER_AGENT: &str = "okhttp/4.12.0";
const VERSION_CODE: &str = "500411";
const VERSION_NAME: &str = "5.4.11";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Classified service answer for one unlock attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The unlock request was accepted for processing.
    Accepted,
    /// Daily attempt quota hit (nested result 3).
    RateLimited,
    /// The account is temporarily blocked from applying (nested result 4).
    TemporarilyBlocked,
    /// Nested result outside the known set, reported verbatim.
    UnknownResult(i64),
    /// Non-zero top-level code; the raw body is kept for reporting.
    UnexpectedCode { code: i64, body: String },
}

impl Outcome {
    /// Stable label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Accepted => "accepted",
            Outcome::RateLimited => "rate_limited",
            Outcome::TemporarilyBlocked => "temporarily_blocked",
            Outcome::UnknownResult(_) => "unknown_result",
            Outcome::UnexpectedCode { .. } => "unexpected_code",
        }
    }

    /// Human-readable line for the status notifier.
    pub fn describe(&self) -> String {
        match self {
            Outcome::Accepted => {
                "unlock request accepted, check the account status later".to_string()
            }
            Outcome::RateLimited => "attempt limit reached, try again later".to_string(),
            Outcome::TemporarilyBlocked => {
                "account is temporarily blocked, try again later".to_string()
            }
            Outcome::UnknownResult(value) => format!("unknown apply result: {value}"),
            Outcome::UnexpectedCode { code, body } => {
                format!("unexpected response code {code}: {body}")
            }
        }
    }
}

/// HTTP client for the unlock submission endpoint.
#[derive(Clone)]
pub struct UnlockClient {
    http: reqwest::Client,
    endpoint: String,
}

impl UnlockClient {
    /// Build a client for the given submission URL.
    pub fn new(endpoint: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(format!("building HTTP client: {e}")))?;
        Ok(Self { http, endpoint })
    }

    /// Fire one unlock request and classify the answer.
    pub async fn send(&self, tokens: &TokenSet, device_id: &str) -> Result<Outcome> {
        let cookie = format!(
            "new_bbs_serviceToken={};versionCode={VERSION_CODE};versionName={VERSION_NAME};deviceId={device_id};",
            tokens.service_token
        );

        let response = self
            .http
            .post(&self.endpoint)
            .header(header::COOKIE, cookie)
            .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::ACCEPT_ENCODING, "gzip, deflate, br")
            .body(DEFAULT_BODY)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("unlock request failed: {e}")))?;

        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("reading unlock response: {e}")))?;

        classify(&body)
    }
}

/// Classify a raw response body.
pub fn classify(body: &str) -> Result<Outcome> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| Error::Parse(format!("{e}: {body}")))?;

    let code = value
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Parse(format!("missing top-level code: {body}")))?;

    if code != 0 {
        return Ok(Outcome::UnexpectedCode {
            code,
            body: body.to_string(),
        });
    }

    let apply_result = value
        .pointer("/data/apply_result")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Parse(format!("missing data.apply_result: {body}")))?;

    Ok(match apply_result {
        1 => Outcome::Accepted,
        3 => Outcome::RateLimited,
        4 => Outcome::TemporarilyBlocked,
        other => Outcome::UnknownResult(other),
    })
}
