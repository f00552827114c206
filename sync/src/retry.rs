//! Fixed-delay retry for remote calls racing directory propagation

use backoff::{backoff::Constant, future::retry};
use o365_sync_core::api::GraphError;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Error codes meaning "the object exists but has not propagated yet"
pub const DEFAULT_RETRYABLE_CODES: [&str; 3] =
    ["Request_ResourceNotFound", "ResourceNotFound", "ErrorItemNotFound"];

/// Retries an operation only while it fails with a propagation-delay code
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub delay: Duration,
    pub retryable_codes: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(10),
            retryable_codes: DEFAULT_RETRYABLE_CODES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            ..Default::default()
        }
    }

    pub fn with_codes(mut self, codes: Vec<String>) -> Self {
        self.retryable_codes = codes;
        self
    }

    pub fn is_propagation_delay(&self, error: &GraphError) -> bool {
        error
            .code()
            .map(|code| self.retryable_codes.iter().any(|c| c == code))
            .unwrap_or(false)
    }

    /// Run `operation`, sleeping `delay` between attempts
    ///
    /// Any error other than a propagation delay is returned after its first
    /// occurrence.
    pub async fn run<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, GraphError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, GraphError>>,
    {
        let attempts = AtomicU32::new(0);

        retry(Constant::new(self.delay), || async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match f().await {
                Ok(value) => Ok(value),
                Err(error) if attempt < self.max_attempts && self.is_propagation_delay(&error) => {
                    warn!(
                        operation,
                        attempt,
                        delay_secs = self.delay.as_secs(),
                        "Remote object not found yet, retrying"
                    );
                    Err(backoff::Error::transient(error))
                }
                Err(error) => {
                    debug!(operation, attempt, "Giving up: {}", error);
                    Err(backoff::Error::permanent(error))
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use test_case::test_case;

    fn not_found() -> GraphError {
        GraphError::Api {
            status: 404,
            code: "Request_ResourceNotFound".to_string(),
            message: "Resource does not exist".to_string(),
        }
    }

    fn forbidden() -> GraphError {
        GraphError::Api {
            status: 403,
            code: "Authorization_RequestDenied".to_string(),
            message: "Insufficient privileges".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_twice_then_success_takes_three_attempts() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::default();

        let started = tokio::time::Instant::now();
        let result = policy
            .run("add_member", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(not_found())
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_failure_is_attempted_once() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run("add_member", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(forbidden())
            })
            .await;

        assert_eq!(result.unwrap_err().code(), Some("Authorization_RequestDenied"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_not_found_stops_at_limit() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run("get_group", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(not_found())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test_case("Request_ResourceNotFound", true ; "graph directory code")]
    #[test_case("ErrorItemNotFound", true ; "mailbox code")]
    #[test_case("Request_BadRequest", false ; "bad request")]
    fn test_codes_are_configurable(code: &str, expected: bool) {
        let error = GraphError::Api {
            status: 404,
            code: code.to_string(),
            message: String::new(),
        };
        assert_eq!(RetryPolicy::default().is_propagation_delay(&error), expected);

        let custom = RetryPolicy::default().with_codes(vec!["Request_BadRequest".to_string()]);
        assert_eq!(custom.is_propagation_delay(&error), code == "Request_BadRequest");
    }
}
