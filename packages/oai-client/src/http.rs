//! HTTP client wrapper for talking to OAI-PMH repositories.

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};

use crate::config::ClientConfig;
use crate::error::{OaiError, Result};

/// Create a configured HTTP client.
///
/// Connection pooling lives inside the returned client; share it between
/// requests instead of building one per call.
pub fn create_client(config: &ClientConfig) -> Result<Client> {
    let client = Client::builder()
        .timeout(config.timeout)
        .user_agent(config.user_agent.as_str())
        .build()?;
    Ok(client)
}

/// Download a response body as text with retry logic.
///
/// Uses exponential backoff for transient failures (network errors,
/// timeouts, 5xx and 429 responses). A `Retry-After` header on a 503 or 429
/// (OAI-PMH flow control) replaces the backoff delay, capped at
/// `max_retry_after`.
pub async fn fetch_text(client: &Client, url: &str, config: &ClientConfig) -> Result<String> {
    let mut last_error: Option<String> = None;
    let mut next_delay: Option<Duration> = None;

    for attempt in 0..config.max_retries {
        if attempt > 0 {
            let delay = next_delay.take().unwrap_or_else(|| {
                backoff_delay(config.retry_base_delay, attempt, config.max_retry_after)
            });
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying after delay");
            tokio::time::sleep(delay).await;
        }

        match client.get(url).send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    next_delay = retry_after(&response, config.max_retry_after);
                    tracing::warn!(
                        status = %status,
                        attempt = attempt + 1,
                        max_retries = config.max_retries,
                        retry_after_ms = next_delay.map(|d| d.as_millis() as u64),
                        "Server error, will retry"
                    );
                    last_error = Some(format!("Server error: {status}"));
                    continue;
                }

                // Client errors (4xx) won't succeed on retry
                if !status.is_success() {
                    return Err(OaiError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }

                match response.bytes().await {
                    Ok(bytes) => return Ok(bytes_to_string(&bytes, url)),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            attempt = attempt + 1,
                            max_retries = config.max_retries,
                            "Body read failed, will retry"
                        );
                        last_error = Some(e.to_string());
                        continue;
                    }
                }
            }
            Err(e) => {
                if e.is_connect() || e.is_timeout() {
                    tracing::warn!(
                        error = %e,
                        attempt = attempt + 1,
                        max_retries = config.max_retries,
                        "Connection error, will retry"
                    );
                    last_error = Some(e.to_string());
                    continue;
                }
                return Err(OaiError::Http(e));
            }
        }
    }

    Err(OaiError::RetriesExhausted {
        attempts: config.max_retries,
        message: last_error.unwrap_or_else(|| "Unknown error".to_string()),
    })
}

/// Read a `Retry-After` header given in seconds.
/// Exponential backoff: base, 2*base, 4*base, ... capped at `cap`.
fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(cap)
}

fn retry_after(response: &Response, cap: Duration) -> Option<Duration> {
    let secs: u64 = response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    Some(Duration::from_secs(secs).min(cap))
}

/// Decode bytes as UTF-8, replacing invalid sequences.
pub fn bytes_to_string(bytes: &[u8], context: &str) -> String {
    match String::from_utf8(bytes.to_vec()) {
        Ok(text) => text,
        Err(_) => {
            tracing::warn!(context, "Response is not valid UTF-8, replacing invalid bytes");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}
