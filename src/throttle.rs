use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Request gate shared by every call to the Reddit API: a per-minute quota plus a
/// cooldown window pushed out whenever Reddit tells us to back off.
#[derive(Clone)]
pub struct Throttle {
    limiter: Arc<DefaultDirectRateLimiter>,
    cooldown_until: Arc<AtomicU64>,
}

impl Throttle {
    pub fn per_minute(rpm: u32) -> Self {
        let q = Quota::per_minute(NonZeroU32::new(rpm.max(1)).unwrap_or(NonZeroU32::MIN));
        Self {
            limiter: Arc::new(RateLimiter::direct(q)),
            cooldown_until: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn gate(&self) {
        let now = now_secs();
        let until = self.cooldown_until.load(Ordering::Relaxed);
        if until > now {
            tracing::debug!(secs = until - now, "Waiting out rate-limit cooldown");
            tokio::time::sleep(Duration::from_secs(until - now)).await;
        }
        self.limiter.until_ready().await;
    }

    /// Extend the cooldown so no request leaves before `secs` from now.
    /// Never shortens an existing cooldown.
    pub fn cool_down(&self, secs: u64) {
        let until = now_secs() + secs;
        self.cooldown_until.fetch_max(until, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn cooldown_remaining(&self) -> u64 {
        self.cooldown_until
            .load(Ordering::Relaxed)
            .saturating_sub(now_secs())
    }
}

#[inline]
fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
