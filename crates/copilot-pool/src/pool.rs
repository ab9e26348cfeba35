//! Pool state machine and credential rotation
//!
//! All mutable pool state (the rotation index, per-credential statuses,
//! and the cached access token) lives behind one mutex. The guard is held only
//! for in-memory bookkeeping and never across a network call; token exchange
//! happens between lock scopes. Two tasks that both observe an expired cache
//! may therefore both mint a token; the last writer wins the cache slot,
//! which is harmless because the exchange is idempotent.

use std::time::{SystemTime, UNIX_EPOCH};

use common::Secret;
use copilot_auth::AccessToken;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Penalty window applied on any rate limit. The window does not grow
/// with repeated failures, so a small pool is never starved.
const RATE_LIMIT_PENALTY_SECS: u64 = 60;

/// A cached token is considered usable only while it expires more than this
/// margin in the future.
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 300;

/// Mutable per-credential record. `rate_limited_until` is an absolute unix
/// timestamp in seconds; 0 means not limited.
#[derive(Debug, Default)]
struct CredentialStatus {
    rate_limited_until: u64,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// Cached access token tagged with the credential that minted it, so a 429
/// on an upstream call can be charged to the right credential.
struct CachedToken {
    token: AccessToken,
    credential_index: usize,
}

/// State guarded by the pool mutex.
struct PoolInner {
    current_index: usize,
    statuses: Vec<CredentialStatus>,
    cached: Option<CachedToken>,
}

/// An access token handed to the forwarding pipeline for one request.
///
/// Carries the index of the minting credential; the pipeline reports a 429
/// back against that index, never against "whatever is current now".
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: u64,
    pub credential_index: usize,
}

/// Snapshot of one credential's status, as exposed on `/tokens/status`.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialReport {
    pub index: usize,
    pub is_current: bool,
    pub is_rate_limited: bool,
    pub rate_limited_until: u64,
    pub consecutive_failures: u32,
}

/// Read-only pool view for diagnostics.
#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub current_index: usize,
    pub total_credentials: usize,
    pub credentials: Vec<CredentialReport>,
}

/// Result of a manual rotation, returned by `/tokens/cycle`.
#[derive(Debug, Serialize)]
pub struct RotationReport {
    pub previous_index: usize,
    pub current_index: usize,
    pub total_credentials: usize,
    pub current_status: CredentialReport,
}

/// Pool of refresh credentials with rotation, penalty tracking, and an
/// access-token cache.
pub struct CredentialPool {
    credentials: Vec<Secret>,
    inner: Mutex<PoolInner>,
    token_url: String,
    client: reqwest::Client,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl CredentialPool {
    /// Build a pool from the configured credential strings.
    ///
    /// Blank entries are dropped and duplicates collapsed (identity is the
    /// string value). Fails when nothing usable remains; the relay cannot
    /// start without at least one credential.
    pub fn new(
        credentials: Vec<String>,
        token_url: impl Into<String>,
        client: reqwest::Client,
    ) -> Result<Self> {
        let mut unique: Vec<Secret> = Vec::new();
        for cred in credentials {
            let cred = cred.trim();
            if cred.is_empty() {
                continue;
            }
            if unique.iter().any(|c| c.expose() == cred) {
                continue;
            }
            unique.push(Secret::new(cred));
        }
        if unique.is_empty() {
            return Err(Error::NoCredentials);
        }

        let statuses = unique.iter().map(|_| CredentialStatus::default()).collect();
        info!(credentials = unique.len(), "credential pool initialized");
        Ok(Self {
            credentials: unique,
            inner: Mutex::new(PoolInner {
                current_index: 0,
                statuses,
                cached: None,
            }),
            token_url: token_url.into(),
            client,
        })
    }

    /// Number of credentials in the pool.
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Select the next usable credential, returning its index.
    ///
    /// Scans circularly from the current index for at most one full cycle. A
    /// lapsed penalty window is healed on sight (window and failure count
    /// reset to zero). If every credential is limited, returns the one whose
    /// window ends soonest; the caller still gets to attempt a request, and
    /// upstream rejection simply extends the penalty. Never blocks on I/O.
    pub async fn select_usable_credential(&self) -> usize {
        let mut inner = self.inner.lock().await;
        self.select_locked(&mut inner, unix_now())
    }

    fn select_locked(&self, inner: &mut PoolInner, now: u64) -> usize {
        let n = self.credentials.len();
        for _ in 0..n {
            let idx = inner.current_index;
            let status = &mut inner.statuses[idx];
            if status.rate_limited_until <= now {
                if status.rate_limited_until > 0 {
                    info!(
                        credential = idx + 1,
                        total = n,
                        "penalty window lapsed, credential healthy again"
                    );
                    status.rate_limited_until = 0;
                    status.consecutive_failures = 0;
                }
                return idx;
            }
            debug!(
                credential = idx + 1,
                total = n,
                rate_limited_until = status.rate_limited_until,
                "credential still rate limited, trying next"
            );
            inner.current_index = (idx + 1) % n;
        }

        // Every credential is inside a window; pick the soonest to recover.
        let soonest = inner
            .statuses
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.rate_limited_until)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let wait = inner.statuses[soonest].rate_limited_until.saturating_sub(now);
        warn!(
            credential = soonest + 1,
            total = n,
            available_in_secs = wait,
            "all credentials rate limited, using soonest to recover"
        );
        soonest
    }

    /// Apply the flat 60-second penalty to a credential.
    pub async fn penalize(&self, index: usize, reason: &str) {
        let mut inner = self.inner.lock().await;
        self.penalize_locked(&mut inner, index, reason);
    }

    fn penalize_locked(&self, inner: &mut PoolInner, index: usize, reason: &str) {
        let now = unix_now();
        let status = &mut inner.statuses[index];
        status.consecutive_failures += 1;
        status.rate_limited_until = now + RATE_LIMIT_PENALTY_SECS;
        status.last_error = Some(reason.to_string());
        metrics::counter!("pool_penalties_total").increment(1);
        warn!(
            credential = index + 1,
            total = self.credentials.len(),
            rate_limited_until = status.rate_limited_until,
            consecutive_failures = status.consecutive_failures,
            reason,
            "credential penalized"
        );
    }

    /// Charge an upstream 429 to the credential that minted the token and
    /// discard the cached token, forcing the next attempt to mint from a
    /// different credential. One locked region so no request can observe the
    /// penalty without the cache invalidation.
    pub async fn report_rate_limited(&self, index: usize) {
        let mut inner = self.inner.lock().await;
        self.penalize_locked(&mut inner, index, "rate limit exceeded");
        inner.cached = None;
    }

    /// Manually rotate to the next credential.
    ///
    /// Always invalidates the cached token, so the next request mints a
    /// fresh one tied to the newly selected credential even if the previous
    /// token had not expired.
    pub async fn rotate(&self) -> RotationReport {
        let mut inner = self.inner.lock().await;
        let n = self.credentials.len();
        let previous_index = inner.current_index;
        inner.current_index = (previous_index + 1) % n;
        inner.cached = None;
        let current_index = inner.current_index;
        info!(
            credential = current_index + 1,
            total = n,
            "manual rotation"
        );
        RotationReport {
            previous_index,
            current_index,
            total_credentials: n,
            current_status: report_for(&inner, current_index, unix_now()),
        }
    }

    /// Read-only view of the rotation index and every credential's status.
    pub async fn status_snapshot(&self) -> PoolStatus {
        let inner = self.inner.lock().await;
        let now = unix_now();
        PoolStatus {
            current_index: inner.current_index,
            total_credentials: self.credentials.len(),
            credentials: (0..self.credentials.len())
                .map(|i| report_for(&inner, i, now))
                .collect(),
        }
    }

    /// Return the cached access token, minting a fresh one when the cache is
    /// empty or the token expires within the safety margin.
    ///
    /// Minting is not deduplicated across concurrent callers; the lock is
    /// released around the exchange and the last writer overwrites the
    /// cache slot.
    pub async fn get_valid_access_token(&self) -> Result<IssuedToken> {
        {
            let inner = self.inner.lock().await;
            if let Some(cached) = &inner.cached {
                let now = unix_now();
                if cached.token.expires_at > now + TOKEN_EXPIRY_MARGIN_SECS {
                    debug!(
                        expires_at = cached.token.expires_at,
                        valid_for_secs = cached.token.expires_at - now,
                        "using cached access token"
                    );
                    return Ok(IssuedToken {
                        token: cached.token.token.clone(),
                        expires_at: cached.token.expires_at,
                        credential_index: cached.credential_index,
                    });
                }
            }
        }

        info!("access token expired or missing, refreshing");
        let (token, credential_index) = self.refresh().await?;
        let issued = IssuedToken {
            token: token.token.clone(),
            expires_at: token.expires_at,
            credential_index,
        };
        let mut inner = self.inner.lock().await;
        inner.cached = Some(CachedToken {
            token,
            credential_index,
        });
        Ok(issued)
    }

    /// Mint a fresh access token, rotating credentials on rate limits.
    ///
    /// Bounded loop capped at the pool size: each pass selects a usable
    /// credential and attempts the exchange. A 429 penalizes the credential
    /// and moves on. Any other failure also penalizes it (the credential is
    /// suspect) and continues only while some other credential is usable.
    /// Exhaustion surfaces as `AuthExchange` carrying the last failure.
    pub async fn refresh(&self) -> Result<(AccessToken, usize)> {
        let mut last_error = String::from("no exchange attempted");

        for _ in 0..self.credentials.len() {
            let index = self.select_usable_credential().await;
            info!(
                credential = index + 1,
                total = self.credentials.len(),
                "attempting token exchange"
            );

            let credential = self.credentials[index].expose();
            match copilot_auth::exchange_token(&self.client, &self.token_url, credential).await
            {
                Ok(token) => {
                    metrics::counter!("pool_refresh_total", "outcome" => "ok").increment(1);
                    info!(
                        credential = index + 1,
                        expires_at = token.expires_at,
                        "token exchange succeeded"
                    );
                    return Ok((token, index));
                }
                Err(copilot_auth::Error::RateLimited(body)) => {
                    metrics::counter!("pool_refresh_total", "outcome" => "rate_limited")
                        .increment(1);
                    self.penalize(index, "rate limit exceeded").await;
                    last_error = format!("rate limited: {body}");
                }
                Err(e) => {
                    metrics::counter!("pool_refresh_total", "outcome" => "error").increment(1);
                    let msg = e.to_string();
                    self.penalize(index, &msg).await;
                    last_error = msg;
                    if !self.any_usable().await {
                        return Err(Error::AuthExchange(last_error));
                    }
                }
            }
        }

        Err(Error::AuthExchange(last_error))
    }

    async fn any_usable(&self) -> bool {
        let inner = self.inner.lock().await;
        let now = unix_now();
        inner.statuses.iter().any(|s| s.rate_limited_until <= now)
    }

    /// Place a penalty window directly, bypassing the 60-second default.
    #[cfg(test)]
    async fn force_window(&self, index: usize, until: u64) {
        let mut inner = self.inner.lock().await;
        inner.statuses[index].rate_limited_until = until;
        inner.statuses[index].consecutive_failures += 1;
    }

    /// Seed the token cache directly.
    #[cfg(test)]
    async fn seed_cache(&self, token: &str, expires_at: u64, credential_index: usize) {
        let mut inner = self.inner.lock().await;
        inner.cached = Some(CachedToken {
            token: AccessToken {
                token: token.to_string(),
                expires_at,
            },
            credential_index,
        });
    }
}

fn report_for(inner: &PoolInner, index: usize, now: u64) -> CredentialReport {
    let status = &inner.statuses[index];
    CredentialReport {
        index,
        is_current: index == inner.current_index,
        is_rate_limited: status.rate_limited_until > now,
        rate_limited_until: status.rate_limited_until,
        consecutive_failures: status.consecutive_failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Expiration far in the future (year 2100).
    fn future_expiry() -> u64 {
        4_102_444_800
    }

    fn token_body(name: &str) -> String {
        format!(r#"{{"token":"at_{name}","expires_at":{}}}"#, future_expiry())
    }

    /// Pool whose token URL points nowhere; fine for tests that never mint.
    fn offline_pool(creds: &[&str]) -> CredentialPool {
        CredentialPool::new(
            creds.iter().map(|s| s.to_string()).collect(),
            "http://127.0.0.1:9",
            reqwest::Client::new(),
        )
        .unwrap()
    }

    /// Mock token endpoint: `logic` maps the presented credential to a
    /// response. Returns the endpoint URL.
    async fn start_token_endpoint(
        logic: impl Fn(String) -> (StatusCode, String) + Clone + Send + Sync + 'static,
    ) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let app = Router::new().route(
            "/",
            get(move |headers: HeaderMap| {
                let logic = logic.clone();
                async move {
                    let credential = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.strip_prefix("token "))
                        .unwrap_or("")
                        .to_string();
                    logic(credential)
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        url
    }

    #[test]
    fn construction_rejects_empty_list() {
        let result = CredentialPool::new(vec![], "http://unused", reqwest::Client::new());
        assert!(matches!(result, Err(Error::NoCredentials)));
    }

    #[test]
    fn construction_rejects_blank_entries() {
        let result = CredentialPool::new(
            vec!["  ".into(), String::new()],
            "http://unused",
            reqwest::Client::new(),
        );
        assert!(matches!(result, Err(Error::NoCredentials)));
    }

    #[test]
    fn duplicates_collapse_preserving_order() {
        let pool = offline_pool(&["a", "b", "a", "c", "b"]);
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn selection_starts_at_first_credential() {
        let pool = offline_pool(&["a", "b", "c"]);
        assert_eq!(pool.select_usable_credential().await, 0);
    }

    #[tokio::test]
    async fn selection_skips_penalized_credentials_and_wraps() {
        let pool = offline_pool(&["a", "b", "c"]);
        pool.penalize(0, "rate limit exceeded").await;
        assert_eq!(pool.select_usable_credential().await, 1);

        pool.penalize(1, "rate limit exceeded").await;
        assert_eq!(pool.select_usable_credential().await, 2);

        // 2 is last; penalizing it wraps the scan back past 0 and 1
        pool.penalize(2, "rate limit exceeded").await;
        let now = unix_now();
        pool.force_window(0, now.saturating_sub(1)).await; // lapsed window
        assert_eq!(pool.select_usable_credential().await, 0);
    }

    #[tokio::test]
    async fn penalty_window_is_flat_sixty_seconds() {
        let pool = offline_pool(&["a"]);
        pool.penalize(0, "rate limit exceeded").await;
        let snapshot = pool.status_snapshot().await;
        let window = snapshot.credentials[0].rate_limited_until - unix_now();
        assert!((59..=61).contains(&window), "window was {window}s");
        assert_eq!(snapshot.credentials[0].consecutive_failures, 1);

        // Repeated penalties keep the same flat window but count up
        pool.penalize(0, "rate limit exceeded").await;
        let snapshot = pool.status_snapshot().await;
        let window = snapshot.credentials[0].rate_limited_until - unix_now();
        assert!((59..=61).contains(&window), "window was {window}s");
        assert_eq!(snapshot.credentials[0].consecutive_failures, 2);
    }

    #[tokio::test]
    async fn all_limited_selects_soonest_to_recover() {
        let pool = offline_pool(&["a", "b", "c"]);
        let now = unix_now();
        pool.force_window(0, now + 90).await;
        pool.force_window(1, now + 30).await;
        pool.force_window(2, now + 60).await;
        assert_eq!(pool.select_usable_credential().await, 1);
    }

    #[tokio::test]
    async fn lapsed_window_heals_on_selection() {
        let pool = offline_pool(&["a"]);
        pool.force_window(0, 1).await; // nonzero but long past
        assert_eq!(pool.select_usable_credential().await, 0);

        let snapshot = pool.status_snapshot().await;
        assert_eq!(snapshot.credentials[0].rate_limited_until, 0);
        assert_eq!(snapshot.credentials[0].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn rotate_advances_and_wraps() {
        let pool = offline_pool(&["a", "b"]);
        let report = pool.rotate().await;
        assert_eq!(report.previous_index, 0);
        assert_eq!(report.current_index, 1);
        assert_eq!(report.total_credentials, 2);
        assert!(report.current_status.is_current);

        let report = pool.rotate().await;
        assert_eq!(report.current_index, 0);
    }

    #[tokio::test]
    async fn cached_token_is_reused_until_margin() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let url = start_token_endpoint(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            (StatusCode::OK, token_body("fresh"))
        })
        .await;
        let pool =
            CredentialPool::new(vec!["a".into()], url, reqwest::Client::new()).unwrap();

        let first = pool.get_valid_access_token().await.unwrap();
        let second = pool.get_valid_access_token().await.unwrap();
        assert_eq!(first.token, "at_fresh");
        assert_eq!(second.token, "at_fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second call must hit the cache");
    }

    #[tokio::test]
    async fn token_inside_expiry_margin_is_replaced() {
        let url =
            start_token_endpoint(|_| (StatusCode::OK, token_body("replacement"))).await;
        let pool =
            CredentialPool::new(vec!["a".into()], url, reqwest::Client::new()).unwrap();

        // 100s of validity left is inside the 300s margin
        pool.seed_cache("at_stale", unix_now() + 100, 0).await;
        let issued = pool.get_valid_access_token().await.unwrap();
        assert_eq!(issued.token, "at_replacement");
    }

    #[tokio::test]
    async fn rotate_invalidates_cache_even_for_valid_token() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let url = start_token_endpoint(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            (StatusCode::OK, token_body("minted"))
        })
        .await;
        let pool = CredentialPool::new(vec!["a".into(), "b".into()], url, reqwest::Client::new())
            .unwrap();

        pool.seed_cache("at_valid", future_expiry(), 0).await;
        pool.rotate().await;

        let issued = pool.get_valid_access_token().await.unwrap();
        assert_eq!(issued.token, "at_minted");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "rotation must force a mint");
    }

    #[tokio::test]
    async fn report_rate_limited_penalizes_and_discards_cache() {
        let url = start_token_endpoint(|cred| {
            // Only "b" succeeds; "a" was the penalized one
            if cred == "b" {
                (StatusCode::OK, token_body("b"))
            } else {
                (StatusCode::TOO_MANY_REQUESTS, String::from("limited"))
            }
        })
        .await;
        let pool = CredentialPool::new(vec!["a".into(), "b".into()], url, reqwest::Client::new())
            .unwrap();

        pool.seed_cache("at_a", future_expiry(), 0).await;
        pool.report_rate_limited(0).await;

        let snapshot = pool.status_snapshot().await;
        assert!(snapshot.credentials[0].is_rate_limited);
        assert_eq!(snapshot.credentials[0].consecutive_failures, 1);

        // Cache is gone, and the refresh must come from credential "b"
        let issued = pool.get_valid_access_token().await.unwrap();
        assert_eq!(issued.token, "at_b");
        assert_eq!(issued.credential_index, 1);
    }

    #[tokio::test]
    async fn refresh_rotates_past_rate_limited_credential() {
        let url = start_token_endpoint(|cred| {
            if cred == "cred1" {
                (StatusCode::TOO_MANY_REQUESTS, String::from("slow down"))
            } else {
                (StatusCode::OK, token_body("cred2"))
            }
        })
        .await;
        let pool = CredentialPool::new(
            vec!["cred1".into(), "cred2".into()],
            url,
            reqwest::Client::new(),
        )
        .unwrap();

        let (token, index) = pool.refresh().await.unwrap();
        assert_eq!(token.token, "at_cred2");
        assert_eq!(index, 1);

        let snapshot = pool.status_snapshot().await;
        assert!(snapshot.credentials[0].is_rate_limited);
        assert!(!snapshot.credentials[1].is_rate_limited);
    }

    #[tokio::test]
    async fn refresh_exhaustion_returns_auth_exchange_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let url = start_token_endpoint(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            (StatusCode::TOO_MANY_REQUESTS, String::from("limited"))
        })
        .await;
        let pool = CredentialPool::new(vec!["a".into(), "b".into()], url, reqwest::Client::new())
            .unwrap();

        let err = pool.refresh().await.unwrap_err();
        assert!(matches!(err, Error::AuthExchange(_)), "got {err:?}");
        // One exchange attempt per credential, no more
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refresh_rejection_stops_when_no_alternative_usable() {
        let url = start_token_endpoint(|_| {
            (StatusCode::UNAUTHORIZED, String::from("bad credentials"))
        })
        .await;
        let pool =
            CredentialPool::new(vec!["only".into()], url, reqwest::Client::new()).unwrap();

        let err = pool.refresh().await.unwrap_err();
        match err {
            Error::AuthExchange(msg) => {
                assert!(msg.contains("401"), "message should carry the status: {msg}");
                assert!(msg.contains("bad credentials"), "message should carry the body: {msg}");
            }
            other => panic!("expected AuthExchange, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refresh_tries_next_credential_after_rejection() {
        let url = start_token_endpoint(|cred| {
            if cred == "revoked" {
                (StatusCode::UNAUTHORIZED, String::from("bad credentials"))
            } else {
                (StatusCode::OK, token_body("good"))
            }
        })
        .await;
        let pool = CredentialPool::new(
            vec!["revoked".into(), "good".into()],
            url,
            reqwest::Client::new(),
        )
        .unwrap();

        let (token, index) = pool.refresh().await.unwrap();
        assert_eq!(token.token, "at_good");
        assert_eq!(index, 1);
    }

    #[tokio::test]
    async fn status_snapshot_is_idempotent() {
        let pool = offline_pool(&["a", "b"]);
        pool.penalize(0, "rate limit exceeded").await;

        let first = serde_json::to_value(pool.status_snapshot().await).unwrap();
        let second = serde_json::to_value(pool.status_snapshot().await).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn snapshot_marks_current_credential() {
        let pool = offline_pool(&["a", "b", "c"]);
        pool.rotate().await;
        let snapshot = pool.status_snapshot().await;
        assert_eq!(snapshot.current_index, 1);
        assert_eq!(snapshot.total_credentials, 3);
        let current: Vec<bool> = snapshot.credentials.iter().map(|c| c.is_current).collect();
        assert_eq!(current, vec![false, true, false]);
    }
}
