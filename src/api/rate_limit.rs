//! Sliding-window-log rate limiter keyed by SHA-256 of the client
//! address. Two independently-configurable windows (per-second,
//! per-minute) per spec.md §4.6 — distinct from `tower`'s token-bucket
//! `RateLimitLayer`, which only expresses a single global budget.

use aws_lc_rs::digest::{digest, SHA256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const PER_MINUTE_WINDOW: Duration = Duration::from_secs(60);
const PER_SECOND_WINDOW: Duration = Duration::from_secs(1);
/// Idle entries older than this are evicted to bound memory.
const IDLE_EVICTION: Duration = Duration::from_secs(60);

type ClientKey = [u8; 32];

fn client_key(identifier: &str) -> ClientKey {
    let hash = digest(&SHA256, identifier.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(hash.as_ref());
    key
}

#[derive(Default)]
struct ClientWindow {
    /// Recent request instants, oldest first, pruned to the per-minute
    /// window on every access — a minute-wide log also bounds the
    /// per-second check since it's a subset of the same window.
    requests: Vec<Instant>,
}

impl ClientWindow {
    fn prune(&mut self, now: Instant) {
        self.requests
            .retain(|instant| now.duration_since(*instant) < PER_MINUTE_WINDOW);
    }

    fn last_activity(&self) -> Option<Instant> {
        self.requests.last().copied()
    }
}

pub struct RateLimiter {
    per_second: u32,
    per_minute: u32,
    clients: Mutex<HashMap<ClientKey, ClientWindow>>,
}

pub enum RateLimitDecision {
    Allowed,
    Limited,
}

impl RateLimiter {
    pub fn new(per_second: u32, per_minute: u32) -> Self {
        Self {
            per_second,
            per_minute,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Checks and, if allowed, records a request for `identifier`
    /// (first `X-Forwarded-For` entry or socket peer, per spec.md §4.6).
    pub async fn check(&self, identifier: &str) -> RateLimitDecision {
        let key = client_key(identifier);
        let now = Instant::now();
        let mut clients = self.clients.lock().await;

        clients.retain(|_, window| {
            window
                .last_activity()
                .is_none_or(|last| now.duration_since(last) < IDLE_EVICTION)
        });

        let window = clients.entry(key).or_default();
        window.prune(now);

        let within_second = window
            .requests
            .iter()
            .filter(|instant| now.duration_since(**instant) < PER_SECOND_WINDOW)
            .count();
        let within_minute = window.requests.len();

        if within_second as u32 >= self.per_second || within_minute as u32 >= self.per_minute {
            return RateLimitDecision::Limited;
        }

        window.requests.push(now);
        RateLimitDecision::Allowed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn allows_requests_under_the_per_second_budget() {
        let limiter = RateLimiter::new(2, 60);
        assert!(matches!(
            limiter.check("client-a").await,
            RateLimitDecision::Allowed
        ));
        assert!(matches!(
            limiter.check("client-a").await,
            RateLimitDecision::Allowed
        ));
    }

    #[tokio::test]
    async fn rejects_the_request_that_breaches_the_per_second_budget() {
        let limiter = RateLimiter::new(2, 60);
        limiter.check("client-a").await;
        limiter.check("client-a").await;
        assert!(matches!(
            limiter.check("client-a").await,
            RateLimitDecision::Limited
        ));
    }

    #[tokio::test]
    async fn different_clients_have_independent_budgets() {
        let limiter = RateLimiter::new(1, 60);
        assert!(matches!(
            limiter.check("client-a").await,
            RateLimitDecision::Allowed
        ));
        assert!(matches!(
            limiter.check("client-b").await,
            RateLimitDecision::Allowed
        ));
    }

    #[tokio::test]
    async fn per_minute_budget_blocks_even_under_per_second_budget() {
        let limiter = RateLimiter::new(100, 2);
        limiter.check("client-a").await;
        limiter.check("client-a").await;
        assert!(matches!(
            limiter.check("client-a").await,
            RateLimitDecision::Limited
        ));
    }
}
