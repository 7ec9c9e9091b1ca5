//! HTTP retry for backend requests.
//!
//! Backend requests go through [`send_json`] so transient failures
//! (timeouts, connection resets, HTTP 429, HTTP 5xx) are retried with
//! exponential backoff before the registry gives up and serves the
//! fallback table.

use std::time::Duration;

use reqwest::StatusCode;

use crate::GeofenceError;

/// Maximum number of retries after the first attempt.
///
/// With exponential backoff (1s, 2s, 4s) a lookup gives up after about
/// 7 seconds of waiting plus the per-request timeouts.
const MAX_RETRIES: u32 = 3;

/// Sends the request built by `build_request` and parses the body as JSON.
///
/// The closure is called once per attempt because a
/// [`reqwest::RequestBuilder`] is consumed by `.send()`.
///
/// Does **not** retry HTTP 4xx other than 429; those are permanent.
///
/// # Errors
///
/// Returns [`GeofenceError`] if every attempt fails, the server returns a
/// non-retryable status, or the body is not JSON.
pub async fn send_json<F>(build_request: F) -> Result<serde_json::Value, GeofenceError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let response = send_inner(&build_request, MAX_RETRIES).await?;
    let text = response.text().await?;
    Ok(serde_json::from_str(&text)?)
}

/// Sends the request built by `build_request` and ignores the response
/// body. Retries like [`send_json`].
///
/// # Errors
///
/// Returns [`GeofenceError`] if every attempt fails or the server returns
/// a non-retryable status.
pub async fn send_ok<F>(build_request: F) -> Result<(), GeofenceError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    send_inner(&build_request, MAX_RETRIES).await.map(|_| ())
}

/// What to do with a response carrying a given status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusAction {
    Accept,
    Retry,
    Fail,
}

/// 429 and 5xx are retried while attempts remain. Any other 4xx fails at
/// once. Everything else is handed to the caller.
fn classify_status(status: StatusCode, attempt: u32, max_retries: u32) -> StatusAction {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        if attempt < max_retries {
            StatusAction::Retry
        } else {
            StatusAction::Fail
        }
    } else if status.is_client_error() {
        StatusAction::Fail
    } else {
        StatusAction::Accept
    }
}

/// Wait before retry number `attempt` (1-based): 1s, 2s, 4s, ...
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.saturating_sub(1).min(16))
}

async fn send_inner<F>(
    build_request: &F,
    max_retries: u32,
) -> Result<reqwest::Response, GeofenceError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_error: Option<GeofenceError> = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = backoff(attempt);
            log::warn!("  backend retry {attempt}/{max_retries} in {delay:?}...");
            tokio::time::sleep(delay).await;
        }

        match build_request().send().await {
            Err(e) => {
                if is_transient(&e) && attempt < max_retries {
                    log::warn!("  transient error: {e}");
                    last_error = Some(GeofenceError::Http(e));
                    continue;
                }
                return Err(GeofenceError::Http(e));
            }
            Ok(response) => {
                let status = response.status();
                match classify_status(status, attempt, max_retries) {
                    StatusAction::Accept => return Ok(response),
                    StatusAction::Retry => {
                        log::warn!("  HTTP {status}");
                        last_error = Some(GeofenceError::Status {
                            status: status.as_u16(),
                        });
                    }
                    StatusAction::Fail => {
                        return Err(GeofenceError::Status {
                            status: status.as_u16(),
                        });
                    }
                }
            }
        }
    }

    Err(last_error.unwrap_or(GeofenceError::Status { status: 0 }))
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_request()
}
