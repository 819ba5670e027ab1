//! Keeps the live feed running.
//!
//! States: `Connecting -> Streaming -> (Connecting | Backoff) -> ... -> Exhausted`.
//! A feed that ends cleanly resets the retry counter and reconnects at once.
//! A feed that fails (to open or mid-stream) counts one retry and waits a
//! fixed delay; after `max_attempts` consecutive failures the supervisor gives up.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info};

use crate::{
    config::{DEFAULT_STREAM_MAX_ATTEMPTS, DEFAULT_STREAM_RETRY_DELAY},
    dispatch::Dispatcher,
    errors::Error,
    ports::TransportClient,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Fixed, not exponential.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_STREAM_MAX_ATTEMPTS,
            delay: DEFAULT_STREAM_RETRY_DELAY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Connecting,
    Streaming,
    Backoff,
    Exhausted,
}

/// Advance the retry counter after a stream-level failure.
///
/// Returns the new counter and the state to move to.
pub fn after_failure(retries: u32, policy: &RetryPolicy) -> (u32, SupervisorState) {
    let retries = retries.saturating_add(1);
    if retries >= policy.max_attempts {
        (retries, SupervisorState::Exhausted)
    } else {
        (retries, SupervisorState::Backoff)
    }
}

/// What the supervisor did before it gave up.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub connect_attempts: u32,
    pub clean_completions: u32,
    pub stream_failures: u32,
    pub last_error: Option<String>,
}

pub struct StreamSupervisor {
    policy: RetryPolicy,
}

impl StreamSupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run until the retry budget is spent. Never returns an error: exhaustion
    /// is logged and reported.
    pub async fn run(
        &self,
        client: &dyn TransportClient,
        dispatcher: &Dispatcher,
    ) -> SupervisorReport {
        let max = self.policy.max_attempts;
        let mut report = SupervisorReport::default();
        let mut retries = 0u32;
        let mut state = SupervisorState::Connecting;
        let mut feed = None;

        loop {
            state = match state {
                SupervisorState::Connecting => {
                    report.connect_attempts += 1;
                    info!(attempt = retries + 1, max, "starting message stream");
                    match client.stream_all_messages().await {
                        Ok(f) => {
                            info!("message stream started; waiting for messages");
                            feed = Some(f);
                            SupervisorState::Streaming
                        }
                        Err(e) => {
                            let (r, next) = self.on_failure(retries, e, &mut report);
                            retries = r;
                            next
                        }
                    }
                }
                SupervisorState::Streaming => {
                    let Some(f) = feed.take() else {
                        state = SupervisorState::Connecting;
                        continue;
                    };
                    match dispatcher.run(f).await {
                        Ok(summary) => {
                            info!(
                                processed = summary.total(),
                                enrolled = summary.enrolled,
                                failed = summary.failed,
                                "message stream completed normally"
                            );
                            report.clean_completions += 1;
                            retries = 0;
                            SupervisorState::Connecting
                        }
                        Err(e) => {
                            let (r, next) = self.on_failure(retries, e, &mut report);
                            retries = r;
                            next
                        }
                    }
                }
                SupervisorState::Backoff => {
                    info!(
                        delay_ms = self.policy.delay.as_millis() as u64,
                        "waiting before retrying stream"
                    );
                    sleep(self.policy.delay).await;
                    SupervisorState::Connecting
                }
                SupervisorState::Exhausted => {
                    error!(
                        attempts = retries,
                        "maximum retry attempts reached for message stream; listener exiting"
                    );
                    return report;
                }
            };
        }
    }

    fn on_failure(
        &self,
        retries: u32,
        err: Error,
        report: &mut SupervisorReport,
    ) -> (u32, SupervisorState) {
        let (retries, next) = after_failure(retries, &self.policy);
        error!(
            attempt = retries,
            max = self.policy.max_attempts,
            error = %err,
            "stream error"
        );
        report.stream_failures += 1;
        report.last_error = Some(err.to_string());
        (retries, next)
    }
}
