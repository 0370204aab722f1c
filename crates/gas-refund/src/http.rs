//! Retrying JSON requests shared by the HTTP collaborators

use anyhow::{anyhow, Result};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::constants;

/// Send a request with exponential backoff, retrying on 429 and transport errors.
/// A 404 is an answer ("no data"), returned as `Ok(None)`.
pub async fn fetch_json<T, F>(build: F) -> Result<Option<T>>
where
    T: DeserializeOwned,
    F: Fn() -> RequestBuilder,
{
    let mut last_error = None;

    for attempt in 0..constants::MAX_HTTP_RETRIES {
        if attempt > 0 {
            let delay = Duration::from_secs(2u64.pow(attempt));
            sleep(delay).await;
        }

        match build().header("Accept", "application/json").send().await {
            Ok(response) => {
                let status = response.status();
                if status == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if status.is_success() {
                    match response.json::<T>().await {
                        Ok(data) => return Ok(Some(data)),
                        Err(e) => last_error = Some(anyhow!("Parse error: {}", e)),
                    }
                } else if status == StatusCode::TOO_MANY_REQUESTS {
                    last_error = Some(anyhow!("Rate limited (429)"));
                } else {
                    last_error = Some(anyhow!("API returned status: {}", status));
                }
            }
            Err(e) => {
                last_error = Some(anyhow!("Request failed: {}", e));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        anyhow!("Failed after {} retries", constants::MAX_HTTP_RETRIES)
    }))
}

/// Bound an external fetch by the run's per-call timeout
pub async fn with_timeout<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{} timed out after {:?}", what, limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let value = with_timeout(Duration::from_secs(1), "noop", async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_with_timeout_reports_elapsed_call() {
        let err = with_timeout(Duration::from_millis(10), "slow fetch", async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("slow fetch timed out"));
    }
}
