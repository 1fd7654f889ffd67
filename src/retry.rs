//! Retry/backoff policy: a pure decision function over attempt count,
//! error kind, and an optional provider-supplied retry-after hint
//! (spec §4.2). Grounded on `sources/base/oauth_client.rs::calculate_backoff`,
//! rewritten to the exact jitter formulas in the spec rather than the
//! teacher's single exponential-only formula.

use std::time::Duration;

use rand::Rng;

use crate::providers::SyncError;

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry(Duration),
    RetryAsWindowSync,
    GiveUp,
}

/// Decide what to do after attempt `k` (0-based) failed with `error`.
///
/// `InvalidDeltaToken` never sleeps: it signals the engine to clear the
/// delta token and retry once as a window sync, without consuming the
/// retry budget (spec §4.2).
pub fn decide(k: u32, error: &SyncError, max_retries: u32) -> RetryDecision {
    match error {
        SyncError::RateLimited { retry_after } => {
            if k >= max_retries {
                return RetryDecision::GiveUp;
            }
            let base = retry_after.unwrap_or_else(|| 2u64.saturating_pow(k));
            let capped = base.min(300) as f64;
            let jitter = rand::rng().random_range(0.1..0.5);
            RetryDecision::Retry(Duration::from_secs_f64(capped + jitter))
        }
        SyncError::Transient(_) => {
            if k >= max_retries {
                return RetryDecision::GiveUp;
            }
            let base = 2u64.saturating_pow(k) as f64;
            let jitter = rand::rng().random_range(0.1..1.0);
            RetryDecision::Retry(Duration::from_secs_f64(base + jitter))
        }
        SyncError::InvalidDeltaToken => RetryDecision::RetryAsWindowSync,
        SyncError::AuthExpired
        | SyncError::Permanent(_)
        | SyncError::Unsupported(_)
        | SyncError::ConnectionMissing
        | SyncError::ConnectionDisabled
        | SyncError::ProviderUnknown(_) => RetryDecision::GiveUp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_retries_within_budget() {
        let err = SyncError::RateLimited { retry_after: Some(1) };
        match decide(0, &err, 3) {
            RetryDecision::Retry(d) => assert!(d.as_secs_f64() >= 1.0 && d.as_secs_f64() < 1.5),
            other => panic!("expected Retry, got {other:?}"),
        }
    }

    #[test]
    fn test_rate_limited_gives_up_when_exhausted() {
        let err = SyncError::RateLimited { retry_after: None };
        assert_eq!(decide(3, &err, 3), RetryDecision::GiveUp);
    }

    #[test]
    fn test_max_retries_zero_fails_immediately() {
        let err = SyncError::RateLimited { retry_after: Some(5) };
        assert_eq!(decide(0, &err, 0), RetryDecision::GiveUp);
    }

    #[test]
    fn test_transient_backs_off_exponentially() {
        let err = SyncError::Transient("boom".to_string());
        match decide(2, &err, 5) {
            RetryDecision::Retry(d) => assert!(d.as_secs_f64() >= 4.0 && d.as_secs_f64() < 5.0),
            other => panic!("expected Retry, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_delta_token_signals_window_retry_without_sleep() {
        assert_eq!(
            decide(0, &SyncError::InvalidDeltaToken, 3),
            RetryDecision::RetryAsWindowSync
        );
    }

    #[test]
    fn test_auth_expired_gives_up() {
        assert_eq!(decide(0, &SyncError::AuthExpired, 3), RetryDecision::GiveUp);
    }

    #[test]
    fn test_unsupported_gives_up() {
        assert_eq!(
            decide(0, &SyncError::Unsupported("x".into()), 3),
            RetryDecision::GiveUp
        );
    }
}
