use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelFlag;
use crate::pool::{CredentialPool, Lease};
use crate::transport::{ApiOutcome, OutcomeKind};

/// Failure classification carried through progress records and summaries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    RateLimited,
    AuthExpired,
    Transport,
    Server,
    Protocol,
    /// Application-level refusal with an unrecognized code.
    Api,
    CredentialExhausted,
    Cancelled,
    Config,
    Storage,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::RateLimited => "rate limited",
            FailureKind::AuthExpired => "auth expired",
            FailureKind::Transport => "transport error",
            FailureKind::Server => "server error",
            FailureKind::Protocol => "protocol error",
            FailureKind::Api => "api error",
            FailureKind::CredentialExhausted => "credentials exhausted",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Config => "configuration error",
            FailureKind::Storage => "storage error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct CrawlFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl CrawlFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "cancelled")
    }
}

impl fmt::Display for CrawlFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

impl std::error::Error for CrawlFailure {}

/// Retry budgets. All of these are deliberate configuration parameters with
/// the defaults below.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per credential for transport-ish failures.
    pub per_credential_attempts: u32,
    /// Full-pool wait-and-retry rounds before giving up.
    pub max_wait_rounds: u32,
    /// Sleep per wait round when the whole pool is unavailable or limited.
    pub cooldown_wait: Duration,
    /// Base delay for short backoff; doubles per attempt.
    pub short_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            per_credential_attempts: 3,
            max_wait_rounds: 3,
            cooldown_wait: Duration::from_secs(10),
            short_backoff: Duration::from_secs(1),
        }
    }
}

/// Where one request currently stands against the budgets.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttemptState {
    /// Attempts made with the credential currently held (including this one).
    pub attempts_on_credential: u32,
    /// Distinct credentials tried so far (including the current one).
    pub distinct_tried: usize,
    /// Wait-and-retry rounds already consumed.
    pub wait_rounds: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Release the current credential (reported failed) and acquire another.
    Rotate,
    /// Sleep, clear the tried set, and retry with any eligible credential.
    Wait(Duration),
    /// Sleep briefly and retry with the same credential.
    Backoff(Duration),
    Fail(FailureKind),
}

/// Pure decision: `tryCurrent -> rotate -> waitRound -> fail`.
pub fn decide(
    kind: OutcomeKind,
    state: &AttemptState,
    pool_size: usize,
    policy: &RetryPolicy,
) -> RetryAction {
    match kind {
        OutcomeKind::Success => unreachable!("success never reaches the retry decision"),
        // Never retried on the same credential.
        OutcomeKind::RateLimited => {
            if state.distinct_tried < pool_size {
                RetryAction::Rotate
            } else if state.wait_rounds < policy.max_wait_rounds {
                RetryAction::Wait(policy.cooldown_wait)
            } else {
                RetryAction::Fail(FailureKind::RateLimited)
            }
        }
        // Rotating can help when one credential lacks permissions, but once
        // the pool is exhausted the signed token itself is the problem and
        // waiting will not heal it.
        OutcomeKind::AuthExpired => {
            if state.distinct_tried < pool_size {
                RetryAction::Rotate
            } else {
                RetryAction::Fail(FailureKind::AuthExpired)
            }
        }
        OutcomeKind::Transport | OutcomeKind::Server | OutcomeKind::Unknown => {
            if state.attempts_on_credential < policy.per_credential_attempts {
                let exp = state.attempts_on_credential.saturating_sub(1).min(16);
                RetryAction::Backoff(policy.short_backoff.saturating_mul(1 << exp))
            } else if state.distinct_tried < pool_size {
                RetryAction::Rotate
            } else {
                RetryAction::Fail(match kind {
                    OutcomeKind::Server => FailureKind::Server,
                    OutcomeKind::Unknown => FailureKind::Api,
                    _ => FailureKind::Transport,
                })
            }
        }
        // Neither of these is a credential problem; surface them to the
        // caller, which decides between a warning and an auth reclassification.
        OutcomeKind::EmptyData | OutcomeKind::Protocol => RetryAction::Fail(FailureKind::Protocol),
    }
}

/// Drive one logical request through the pool: acquire, call, report the
/// outcome, and follow the retry decision until success or a terminal
/// failure. Returns the value and the lease that produced it.
///
/// The operation closure receives an owned lease snapshot; no credential
/// reference is held across a wait (leases are reacquired after sleeps).
pub async fn call_with_rotation<T, F, Fut>(
    pool: &CredentialPool,
    policy: &RetryPolicy,
    cancel: &CancelFlag,
    what: &str,
    mut op: F,
) -> Result<(T, Lease), CrawlFailure>
where
    F: FnMut(Lease) -> Fut,
    Fut: Future<Output = ApiOutcome<T>>,
{
    let pool_size = pool.len();
    if pool_size == 0 {
        return Err(CrawlFailure::new(
            FailureKind::CredentialExhausted,
            "credential pool is empty",
        ));
    }

    let mut tried: BTreeSet<String> = BTreeSet::new();
    let mut wait_rounds = 0u32;

    'rotate: loop {
        if cancel.is_cancelled() {
            return Err(CrawlFailure::cancelled());
        }

        let Some(lease) = pool.acquire_excluding(&tried) else {
            if tried.len() >= pool_size || wait_rounds >= policy.max_wait_rounds {
                return Err(CrawlFailure::new(
                    FailureKind::CredentialExhausted,
                    format!(
                        "no eligible credential for {what} ({} of {} tried, {} wait rounds)",
                        tried.len(),
                        pool_size,
                        wait_rounds
                    ),
                ));
            }
            wait_rounds += 1;
            tracing::warn!(
                what,
                wait_round = wait_rounds,
                max = policy.max_wait_rounds,
                sleep_s = policy.cooldown_wait.as_secs(),
                "pool temporarily unavailable; waiting"
            );
            if !cancel.sleep(policy.cooldown_wait).await {
                return Err(CrawlFailure::cancelled());
            }
            continue;
        };

        tried.insert(lease.fingerprint.clone());
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(CrawlFailure::cancelled());
            }
            attempts += 1;

            let outcome = op(lease.clone()).await;
            if let ApiOutcome::Success(value) = outcome {
                pool.report_success(&lease.fingerprint);
                return Ok((value, lease));
            }

            let kind = outcome.kind();
            let detail = outcome.describe();
            pool.report_failure(&lease.fingerprint, &detail);

            let state = AttemptState {
                attempts_on_credential: attempts,
                distinct_tried: tried.len(),
                wait_rounds,
            };
            match decide(kind, &state, pool_size, policy) {
                RetryAction::Rotate => {
                    tracing::warn!(what, credential = %lease.name, %detail, "rotating credential");
                    continue 'rotate;
                }
                RetryAction::Wait(d) => {
                    wait_rounds += 1;
                    tried.clear();
                    tracing::warn!(
                        what,
                        wait_round = wait_rounds,
                        sleep_s = d.as_secs(),
                        "whole pool limited; waiting before retry"
                    );
                    if !cancel.sleep(d).await {
                        return Err(CrawlFailure::cancelled());
                    }
                    continue 'rotate;
                }
                RetryAction::Backoff(d) => {
                    tracing::warn!(
                        what,
                        credential = %lease.name,
                        attempt = attempts,
                        sleep_ms = d.as_millis() as u64,
                        %detail,
                        "transient failure; backing off"
                    );
                    if !cancel.sleep(d).await {
                        return Err(CrawlFailure::cancelled());
                    }
                    continue;
                }
                RetryAction::Fail(fail_kind) => {
                    return Err(CrawlFailure::new(
                        fail_kind,
                        format!("{what}: {detail} ({} credentials tried)", tried.len()),
                    ));
                }
            }
        }
    }
}
