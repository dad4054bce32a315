// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retry, backoff and overload prevention for one collector endpoint.
//!
//! The machine has two states. In [`TransportState::Sending`] each request is attempted up
//! to `1 + delays.len()` times, sleeping between attempts while the collector answers with
//! anything other than 2xx or 429. A 429 moves the machine to
//! [`TransportState::OverloadPrevention`] for the collector's `Retry-After`, during which
//! calls never touch the network. Both overload and the calls it suppresses report a
//! synthetic success so that no session loses capture over a rate limit.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::constants::{DEFAULT_RETRY_AFTER, DEFAULT_RETRY_DELAYS};
use crate::response::StatusResponse;
use crate::transport::{HttpClient, HttpResponse};

const TOO_MANY_REQUESTS: u16 = 429;
const RETRY_AFTER_HEADER: &str = "retry-after";
/// Status reported for a request that never produced an HTTP response.
pub const NO_RESPONSE_STATUS: u16 = 0;

/// Delays slept between consecutive attempts of one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            delays: DEFAULT_RETRY_DELAYS.to_vec(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Sending,
    OverloadPrevention {
        retry_after: Duration,
        resume_at: Instant,
    },
}

#[derive(Clone, Copy)]
enum Request<'a> {
    Get(&'a str),
    Post(&'a str, &'a str),
}

pub struct TransportStateMachine {
    client: Arc<dyn HttpClient>,
    retry_policy: RetryPolicy,
    state: Mutex<TransportState>,
}

impl TransportStateMachine {
    #[must_use]
    pub fn new(client: Arc<dyn HttpClient>, retry_policy: RetryPolicy) -> Self {
        TransportStateMachine {
            client,
            retry_policy,
            state: Mutex::new(TransportState::Sending),
        }
    }

    /// Current state. An elapsed overload period is left here.
    pub fn state(&self) -> TransportState {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        if let TransportState::OverloadPrevention { resume_at, .. } = *state {
            if Instant::now() >= resume_at {
                debug!("Overload prevention elapsed, resuming sending");
                *state = TransportState::Sending;
            }
        }
        *state
    }

    pub async fn get(&self, url: &str) -> StatusResponse {
        self.execute(Request::Get(url)).await
    }

    pub async fn post(&self, url: &str, body: &str) -> StatusResponse {
        self.execute(Request::Post(url, body)).await
    }

    async fn execute(&self, request: Request<'_>) -> StatusResponse {
        if let TransportState::OverloadPrevention { resume_at, .. } = self.state() {
            debug!(
                "Overload prevention active for another {:?}, skipping request",
                resume_at.saturating_duration_since(Instant::now())
            );
            return StatusResponse::synthetic_success();
        }

        let mut delays = self.retry_policy.delays.iter();
        let mut attempt = 1;
        loop {
            let result = match request {
                Request::Get(url) => self.client.get(url).await,
                Request::Post(url, body) => self.client.post(url, body.to_string()).await,
            };

            let response = match result {
                Ok(http) if http.status == TOO_MANY_REQUESTS => {
                    self.enter_overload_prevention(retry_after(&http));
                    return StatusResponse::synthetic_success();
                }
                Ok(http) if is_success(http.status) => {
                    return StatusResponse::from_http(http.status, &http.body);
                }
                Ok(http) => {
                    debug!("Attempt {attempt} failed with status {}", http.status);
                    StatusResponse::unreachable(http.status)
                }
                Err(e) => {
                    warn!("Attempt {attempt} failed: {e}");
                    StatusResponse::unreachable(NO_RESPONSE_STATUS)
                }
            };

            match delays.next() {
                Some(delay) => {
                    tokio::time::sleep(*delay).await;
                    attempt += 1;
                }
                None => {
                    warn!(
                        "Giving up after {attempt} attempts, last status {}",
                        response.status_code
                    );
                    return response;
                }
            }
        }
    }

    fn enter_overload_prevention(&self, retry_after: Duration) {
        warn!("Collector is overloaded, pausing requests for {retry_after:?}");
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        *state = TransportState::OverloadPrevention {
            retry_after,
            resume_at: Instant::now() + retry_after,
        };
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// `Retry-After` in seconds. Absent or unparsable values use the default cooldown.
fn retry_after(response: &HttpResponse) -> Duration {
    response
        .header(RETRY_AFTER_HEADER)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::errors::TransportError;

    /// Replays scripted results and then a default response. Counts calls.
    #[derive(Default)]
    pub(crate) struct ScriptedClient {
        script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        pub(crate) fn new(
            script: impl IntoIterator<Item = Result<HttpResponse, TransportError>>,
        ) -> Self {
            ScriptedClient {
                script: Mutex::new(script.into_iter().collect()),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next(&self) -> Result<HttpResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::new(200, "type=m")))
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn get(&self, _url: &str) -> Result<HttpResponse, TransportError> {
            self.next()
        }

        async fn post(&self, _url: &str, _body: String) -> Result<HttpResponse, TransportError> {
            self.next()
        }
    }

    fn machine(client: &Arc<ScriptedClient>) -> TransportStateMachine {
        TransportStateMachine::new(client.clone(), RetryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_returned_on_first_attempt() {
        let client = Arc::new(ScriptedClient::new([Ok(HttpResponse::new(
            200,
            "type=m&id=3",
        ))]));
        let response = machine(&client).get("http://collector").await;
        assert!(response.valid);
        assert_eq!(response.server_id, Some(3));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_retried_with_backoff() {
        let client = Arc::new(ScriptedClient::new([
            Ok(HttpResponse::new(500, "")),
            Err(TransportError::Timeout),
            Ok(HttpResponse::new(200, "type=m")),
        ]));
        let start = Instant::now();
        let response = machine(&client).post("http://collector", "body").await;
        assert!(response.valid);
        assert_eq!(client.calls(), 3);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_last_failure() {
        let client = Arc::new(ScriptedClient::new([
            Ok(HttpResponse::new(500, "")),
            Ok(HttpResponse::new(502, "")),
            Ok(HttpResponse::new(503, "")),
            Ok(HttpResponse::new(200, "type=m")),
        ]));
        let start = Instant::now();
        let response = machine(&client).get("http://collector").await;
        assert!(!response.valid);
        assert!(response.transport_failed);
        assert_eq!(response.status_code, 503);
        assert_eq!(client.calls(), 3);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_becomes_unreachable_response() {
        let client = Arc::new(ScriptedClient::new([
            Err(TransportError::Io("refused".to_string())),
            Err(TransportError::Io("refused".to_string())),
            Err(TransportError::Io("refused".to_string())),
        ]));
        let response = machine(&client).get("http://collector").await;
        assert_eq!(response, StatusResponse::unreachable(NO_RESPONSE_STATUS));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_success_body_is_not_retried() {
        let client = Arc::new(ScriptedClient::new([Ok(HttpResponse::new(200, "nope"))]));
        let response = machine(&client).get("http://collector").await;
        assert!(!response.valid);
        assert!(!response.transport_failed);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overload_bypasses_network_until_retry_after_elapses() {
        let client = Arc::new(ScriptedClient::new([Ok(
            HttpResponse::new(429, "").with_header("Retry-After", "1")
        )]));
        let machine = machine(&client);

        let response = machine.get("http://collector").await;
        assert_eq!(response, StatusResponse::synthetic_success());
        assert!(matches!(
            machine.state(),
            TransportState::OverloadPrevention { retry_after, .. } if retry_after == Duration::from_secs(1)
        ));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(machine.get("http://collector").await.valid);
        assert_eq!(client.calls(), 1);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(machine.get("http://collector").await.valid);
        assert_eq!(client.calls(), 2);
        assert_eq!(machine.state(), TransportState::Sending);
    }

    #[test]
    fn retry_after_defaults_to_ten_minutes() {
        assert_eq!(
            retry_after(&HttpResponse::new(429, "")),
            Duration::from_secs(600)
        );
        assert_eq!(
            retry_after(&HttpResponse::new(429, "").with_header("retry-after", "soon")),
            Duration::from_secs(600)
        );
        assert_eq!(
            retry_after(&HttpResponse::new(429, "").with_header("retry-after", " 30 ")),
            Duration::from_secs(30)
        );
    }
}
