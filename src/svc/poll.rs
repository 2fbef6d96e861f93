//! # Poll module
//!
//! This module provide the wait loop used to observe asynchronous status
//! transitions of clusters and instances. Waits are bounded by a deadline,
//! spaced by an exponential backoff with jitter and abort as soon as the
//! cancellation token is triggered.

use std::{future::Future, time::Duration};

use rand::Rng;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::svc::{
    cfg::Polling,
    rds::{self, Kind, Status},
};

// -----------------------------------------------------------------------------
// Observation enum

/// outcome of a single status check
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Observation<T> {
    /// the transition is still in progress, `None` if the resource is not
    /// visible yet
    Pending(Option<Status>),
    /// the resource reached the expected status
    Done(T),
    /// the resource reached a status from which it will never reach the
    /// expected one
    Rejected(Status),
}

// -----------------------------------------------------------------------------
// DescribeError structure

#[derive(thiserror::Error, Debug)]
#[error("failed to read status of {kind} '{id}' after {attempts} attempt(s), {source}")]
pub struct DescribeError {
    pub kind: Kind,
    pub id: String,
    pub attempts: u32,
    pub source: rds::Error,
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Describe(DescribeError),
    #[error("{kind} '{id}' reached status '{status}'")]
    Rejected {
        kind: Kind,
        id: String,
        status: Status,
    },
    #[error(
        "timed out after {elapsed:?} waiting for {kind} '{id}', last observed status is '{}'",
        status_or_none(.last_status)
    )]
    Timeout {
        kind: Kind,
        id: String,
        elapsed: Duration,
        last_status: Option<Status>,
    },
    #[error("cancelled while waiting for {kind} '{id}'")]
    Cancelled { kind: Kind, id: String },
}

impl From<DescribeError> for Error {
    fn from(err: DescribeError) -> Self {
        Self::Describe(err)
    }
}

fn status_or_none(status: &Option<Status>) -> String {
    status
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "<none>".to_string())
}

// -----------------------------------------------------------------------------
// Backoff structure

#[derive(PartialEq, Clone, Debug)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// ratio of the computed delay which is randomly added or removed
    pub jitter: f64,
}

impl From<&Polling> for Backoff {
    fn from(polling: &Polling) -> Self {
        Self {
            initial: polling.initial_interval(),
            max: polling.max_interval(),
            multiplier: polling.multiplier,
            jitter: polling.jitter,
        }
    }
}

impl Backoff {
    /// returns a backoff which always waits the same interval
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// returns the delay to wait before the given attempt (starting at zero)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = (self.initial.as_secs_f64() * self.multiplier.powi(exponent))
            .min(self.max.as_secs_f64());

        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(delay);
        }

        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_secs_f64(delay * factor)
    }
}

// -----------------------------------------------------------------------------
// Poller structure

#[derive(Clone, Debug)]
pub struct Poller {
    pub backoff: Backoff,
    pub timeout: Duration,
    /// number of consecutive failed status reads tolerated before giving up,
    /// zero aborts on the first failure
    pub describe_retries: u32,
    pub cancel: CancellationToken,
}

impl Poller {
    pub fn new(polling: &Polling, cancel: CancellationToken) -> Self {
        Self {
            backoff: Backoff::from(polling),
            timeout: polling.timeout(),
            describe_retries: polling.describe_retries,
            cancel,
        }
    }

    /// sleep for the given duration unless the token is cancelled first
    async fn pause(&self, kind: Kind, id: &str, duration: Duration) -> Result<(), Error> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled { kind, id: id.to_owned() }),
            _ = sleep(duration) => Ok(()),
        }
    }

    /// executes the given read, retrying up to `describe_retries` times on
    /// failure within the configured timeout
    pub async fn describe<T, F, Fut>(&self, kind: Kind, id: &str, f: &mut F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, rds::Error>>,
    {
        self.describe_until(kind, id, f, Instant::now() + self.timeout)
            .await
    }

    /// executes the given read, retries stop at the deadline even if some
    /// are left
    async fn describe_until<T, F, Fut>(
        &self,
        kind: Kind,
        id: &str,
        f: &mut F,
        deadline: Instant,
    ) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, rds::Error>>,
    {
        let mut attempts = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    kind,
                    id: id.to_owned(),
                });
            }

            attempts += 1;
            let now = match f().await {
                Ok(value) => return Ok(value),
                Err(err) if attempts > self.describe_retries || Instant::now() >= deadline => {
                    return Err(Error::Describe(DescribeError {
                        kind,
                        id: id.to_owned(),
                        attempts,
                        source: err,
                    }));
                }
                Err(err) => {
                    warn!(
                        kind = kind.to_string(),
                        id = id,
                        attempts = attempts,
                        error = err.to_string(),
                        "Failed to read status, retrying"
                    );

                    Instant::now()
                }
            };

            let delay = self
                .backoff
                .delay(attempts - 1)
                .min(deadline.saturating_duration_since(now));
            self.pause(kind, id, delay).await?;
        }
    }

    /// polls the given check until it is done, rejected, the deadline is
    /// reached or the token is cancelled
    pub async fn wait<T, F, Fut>(&self, kind: Kind, id: &str, mut check: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Observation<T>, rds::Error>>,
    {
        let begin = Instant::now();
        let deadline = begin + self.timeout;
        let mut attempt = 0;

        loop {
            let status = match self.describe_until(kind, id, &mut check, deadline).await? {
                Observation::Done(value) => return Ok(value),
                Observation::Rejected(status) => {
                    return Err(Error::Rejected {
                        kind,
                        id: id.to_owned(),
                        status,
                    });
                }
                Observation::Pending(status) => status,
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    kind,
                    id: id.to_owned(),
                    elapsed: now.duration_since(begin),
                    last_status: status,
                });
            }

            let delay = self.backoff.delay(attempt).min(deadline - now);
            debug!(
                kind = kind.to_string(),
                id = id,
                status = status_or_none(&status),
                delay = delay.as_millis() as u64,
                "Status is not the expected one yet, polling again"
            );

            attempt += 1;
            self.pause(kind, id, delay).await?;
        }
    }
}
