//! Fixed-window rate limiter on top of the counter store.
//!
//! Four independent windows gate every outbound send: per-contact minute,
//! per-contact hour, per-contact daily (capped by tier, rolling over at
//! local midnight) and a system-wide minute shared by all contacts.
//!
//! `check` and `increment` are separate calls. Two concurrent senders for
//! the same key can both pass `check` before either increments, so a window
//! may be exceeded by up to `concurrency - 1` sends. The next window starts
//! clean. Increment only after the send was accepted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::compliance::BusinessHours;
use crate::config::RateLimitConfig;
use crate::counter::{CounterStore, ResilientCounterStore};
use crate::model::{Contact, Tier};

/// Length of a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Minute,
    Hour,
    /// Local calendar day.
    Day,
}

/// A window length plus its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub kind: WindowKind,
    pub cap: u64,
}

impl WindowSpec {
    pub fn minute(cap: u64) -> Self {
        Self { kind: WindowKind::Minute, cap }
    }

    pub fn hour(cap: u64) -> Self {
        Self { kind: WindowKind::Hour, cap }
    }

    pub fn day(cap: u64) -> Self {
        Self { kind: WindowKind::Day, cap }
    }
}

/// Which window rejected a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitReason {
    ContactMinuteLimit,
    ContactHourlyLimit,
    DailyTierLimit,
    GlobalRateLimit,
}

impl LimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContactMinuteLimit => "contact_minute_limit",
            Self::ContactHourlyLimit => "contact_hourly_limit",
            Self::DailyTierLimit => "daily_tier_limit",
            Self::GlobalRateLimit => "global_rate_limit",
        }
    }
}

impl std::fmt::Display for LimitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of `check` for one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitCheck {
    /// Full counter key, window suffix included.
    pub key: String,
    pub allowed: bool,
    pub used: u64,
    pub cap: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

/// 429-equivalent rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitExceeded {
    pub reason: LimitReason,
    pub retry_after_secs: u64,
    pub reset_at: DateTime<Utc>,
}

/// Caller privileges for a limit check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverride {
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub emergency: bool,
}

impl LimitOverride {
    /// Only admin plus emergency skips the global window. Per-contact
    /// windows always apply.
    pub fn bypasses_global(&self) -> bool {
        self.admin && self.emergency
    }
}

/// Usage of one window, for the operator status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStatus {
    pub window: String,
    pub used: u64,
    pub cap: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub contact_id: String,
    pub tier: Tier,
    /// Counts come from the in-process fallback and are approximate.
    pub degraded: bool,
    pub windows: Vec<WindowStatus>,
}

/// Seconds until `reset_at`, rounded up, never negative.
pub fn retry_after_secs(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (reset_at - now).num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    (millis as u64).div_ceil(1000)
}

pub struct RateLimiter {
    store: Arc<ResilientCounterStore>,
    config: RateLimitConfig,
    /// Daily windows roll over at local midnight.
    hours: BusinessHours,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<ResilientCounterStore>,
        config: RateLimitConfig,
        hours: BusinessHours,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            hours,
            clock,
        }
    }

    /// Running on the in-process fallback.
    pub fn is_degraded(&self) -> bool {
        self.store.is_degraded()
    }

    /// Window key suffix and reset instant for `now`.
    fn window_bounds(&self, kind: WindowKind, now: DateTime<Utc>) -> (String, DateTime<Utc>) {
        match kind {
            WindowKind::Minute => {
                let minute = now.timestamp().div_euclid(60);
                (format!("minute:{minute}"), epoch(minute * 60 + 60))
            }
            WindowKind::Hour => {
                let hour = now.timestamp().div_euclid(3600);
                (format!("hour:{hour}"), epoch(hour * 3600 + 3600))
            }
            WindowKind::Day => {
                let date = self.hours.local_date(now);
                (format!("daily:{date}"), self.hours.next_local_midnight(now))
            }
        }
    }

    /// Read-only check of one window for `key`.
    pub async fn check(&self, key: &str, spec: WindowSpec) -> LimitCheck {
        let now = self.clock.now();
        let (suffix, reset_at) = self.window_bounds(spec.kind, now);
        let full_key = format!("{key}:{suffix}");

        let used = match self.store.get(&full_key, now).await {
            Ok(value) => value.map(|v| v.count).unwrap_or(0),
            Err(e) => {
                // The resilient store already fell back; only a fallback
                // failure lands here.
                error!(key = %full_key, error = %e, "Counter read failed, treating as unused");
                0
            }
        };

        LimitCheck {
            key: full_key,
            allowed: used < spec.cap,
            used,
            cap: spec.cap,
            remaining: spec.cap.saturating_sub(used),
            reset_at,
        }
    }

    /// Count one action against a window. Returns the new count.
    pub async fn increment(&self, key: &str, spec: WindowSpec) -> u64 {
        let now = self.clock.now();
        let (suffix, reset_at) = self.window_bounds(spec.kind, now);
        let full_key = format!("{key}:{suffix}");

        match self.store.increment(&full_key, reset_at, now).await {
            Ok(value) => value.count,
            Err(e) => {
                error!(key = %full_key, error = %e, "Counter increment failed");
                0
            }
        }
    }

    fn contact_windows(&self, contact: &Contact) -> [(String, WindowSpec, LimitReason); 3] {
        let prefix = contact_prefix(&contact.id);
        [
            (
                prefix.clone(),
                WindowSpec::minute(self.config.per_minute),
                LimitReason::ContactMinuteLimit,
            ),
            (
                prefix.clone(),
                WindowSpec::hour(self.config.per_hour),
                LimitReason::ContactHourlyLimit,
            ),
            (
                prefix,
                WindowSpec::day(self.config.daily_cap(contact.tier)),
                LimitReason::DailyTierLimit,
            ),
        ]
    }

    fn global_window(&self) -> WindowSpec {
        WindowSpec::minute(self.config.global_per_minute)
    }

    /// Check every window for a send to `contact`, in order: minute, hour,
    /// daily, global. Nothing is counted.
    pub async fn check_contact(
        &self,
        contact: &Contact,
        privileges: LimitOverride,
    ) -> Result<(), RateLimitExceeded> {
        for (key, spec, reason) in self.contact_windows(contact) {
            let check = self.check(&key, spec).await;
            if !check.allowed {
                return Err(self.exceeded(contact, reason, &check));
            }
        }

        if privileges.bypasses_global() {
            info!(contact = %contact.id, "Global rate limit bypassed (admin emergency)");
            return Ok(());
        }

        let check = self.check(GLOBAL_PREFIX, self.global_window()).await;
        if !check.allowed {
            return Err(self.exceeded(contact, LimitReason::GlobalRateLimit, &check));
        }
        Ok(())
    }

    /// Count an accepted send in every window, global included.
    pub async fn record(&self, contact: &Contact) {
        for (key, spec, _) in self.contact_windows(contact) {
            self.increment(&key, spec).await;
        }
        self.increment(GLOBAL_PREFIX, self.global_window()).await;
    }

    /// Current usage for a contact. Does not count anything.
    pub async fn status(&self, contact: &Contact) -> RateLimitStatus {
        let mut windows = Vec::with_capacity(4);
        for (key, spec, reason) in self.contact_windows(contact) {
            windows.push(window_status(reason, self.check(&key, spec).await));
        }
        let global = self.check(GLOBAL_PREFIX, self.global_window()).await;
        windows.push(window_status(LimitReason::GlobalRateLimit, global));

        RateLimitStatus {
            contact_id: contact.id.clone(),
            tier: contact.tier,
            degraded: self.is_degraded(),
            windows,
        }
    }

    /// Drop expired counters.
    pub async fn purge_expired(&self) -> usize {
        match self.store.purge_expired(self.clock.now()).await {
            Ok(removed) => removed,
            Err(e) => {
                error!(error = %e, "Counter purge failed");
                0
            }
        }
    }

    fn exceeded(&self, contact: &Contact, reason: LimitReason, check: &LimitCheck) -> RateLimitExceeded {
        let retry_after = retry_after_secs(check.reset_at, self.clock.now());
        debug!(
            contact = %contact.id,
            reason = reason.as_str(),
            used = check.used,
            cap = check.cap,
            retry_after,
            "Rate limit reached"
        );
        RateLimitExceeded {
            reason,
            retry_after_secs: retry_after,
            reset_at: check.reset_at,
        }
    }
}

const GLOBAL_PREFIX: &str = "global";

fn contact_prefix(contact_id: &str) -> String {
    format!("contact:{contact_id}")
}

fn epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn window_status(reason: LimitReason, check: LimitCheck) -> WindowStatus {
    let window = match reason {
        LimitReason::ContactMinuteLimit => "contact_minute",
        LimitReason::ContactHourlyLimit => "contact_hour",
        LimitReason::DailyTierLimit => "contact_daily",
        LimitReason::GlobalRateLimit => "global_minute",
    };
    WindowStatus {
        window: window.to_string(),
        used: check.used,
        cap: check.cap,
        remaining: check.remaining,
        reset_at: check.reset_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::clock::ManualClock;
    use crate::config::BusinessHoursConfig;
    use crate::counter::{CounterValue, InProcessCounterStore};
    use crate::error::CounterError;

    fn jakarta() -> BusinessHours {
        BusinessHours::from_config(&BusinessHoursConfig::default())
    }

    /// 2026-10-19 03:00:30 UTC, thirty seconds into a minute.
    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 3, 0, 30).unwrap()
    }

    fn limiter_with(
        store: Arc<ResilientCounterStore>,
        config: RateLimitConfig,
    ) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        (RateLimiter::new(store, config, jakarta(), clock.clone()), clock)
    }

    fn limiter() -> (RateLimiter, Arc<ManualClock>) {
        limiter_with(Arc::new(ResilientCounterStore::local()), RateLimitConfig::default())
    }

    #[test]
    fn retry_after_rounds_up_and_clamps() {
        let now = start();
        assert_eq!(retry_after_secs(now + Duration::milliseconds(1), now), 1);
        assert_eq!(retry_after_secs(now + Duration::milliseconds(30_000), now), 30);
        assert_eq!(retry_after_secs(now + Duration::milliseconds(30_001), now), 31);
        assert_eq!(retry_after_secs(now - Duration::seconds(5), now), 0);
    }

    #[tokio::test]
    async fn sixth_message_in_a_minute_is_rejected() {
        let (limiter, _) = limiter();
        let contact = Contact::new("6281", start());

        let mut rejections = Vec::new();
        for _ in 0..6 {
            match limiter.check_contact(&contact, LimitOverride::default()).await {
                Ok(()) => limiter.record(&contact).await,
                Err(e) => rejections.push(e),
            }
        }

        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].reason, LimitReason::ContactMinuteLimit);
        assert_eq!(rejections[0].retry_after_secs, 30);
    }

    #[tokio::test]
    async fn minute_window_resets() {
        let (limiter, clock) = limiter();
        let contact = Contact::new("6281", start());
        for _ in 0..5 {
            limiter.record(&contact).await;
        }
        assert!(limiter.check_contact(&contact, LimitOverride::default()).await.is_err());

        clock.advance(Duration::seconds(30));
        assert!(limiter.check_contact(&contact, LimitOverride::default()).await.is_ok());
    }

    #[tokio::test]
    async fn daily_cap_follows_tier() {
        let config = RateLimitConfig {
            per_minute: 1000,
            per_hour: 1000,
            daily_basic: 2,
            daily_premium: 3,
            ..Default::default()
        };
        let (limiter, _) = limiter_with(Arc::new(ResilientCounterStore::local()), config);
        let basic = Contact::new("6281", start());
        let premium = Contact::new("6282", start()).with_tier(Tier::Premium);

        for _ in 0..2 {
            limiter.record(&basic).await;
            limiter.record(&premium).await;
        }

        let err = limiter.check_contact(&basic, LimitOverride::default()).await.unwrap_err();
        assert_eq!(err.reason, LimitReason::DailyTierLimit);
        // 03:00:30 UTC is 10:00:30 WIB; the day ends at 17:00 UTC.
        assert_eq!(err.reset_at, Utc.with_ymd_and_hms(2026, 10, 19, 17, 0, 0).unwrap());
        assert!(limiter.check_contact(&premium, LimitOverride::default()).await.is_ok());
    }

    #[tokio::test]
    async fn global_limit_and_emergency_bypass() {
        let (limiter, _) = limiter();
        for _ in 0..100 {
            limiter.increment(GLOBAL_PREFIX, WindowSpec::minute(100)).await;
        }
        let contact = Contact::new("6281", start());

        let err = limiter.check_contact(&contact, LimitOverride::default()).await.unwrap_err();
        assert_eq!(err.reason, LimitReason::GlobalRateLimit);
        assert!(err.retry_after_secs > 0);

        // Admin alone is not enough.
        let admin = LimitOverride { admin: true, emergency: false };
        assert!(limiter.check_contact(&contact, admin).await.is_err());

        let emergency = LimitOverride { admin: true, emergency: true };
        assert!(limiter.check_contact(&contact, emergency).await.is_ok());
    }

    #[tokio::test]
    async fn emergency_does_not_bypass_contact_limits() {
        let (limiter, _) = limiter();
        let contact = Contact::new("6281", start());
        for _ in 0..5 {
            limiter.record(&contact).await;
        }
        let emergency = LimitOverride { admin: true, emergency: true };
        let err = limiter.check_contact(&contact, emergency).await.unwrap_err();
        assert_eq!(err.reason, LimitReason::ContactMinuteLimit);
    }

    #[tokio::test]
    async fn concurrent_checks_overshoot_by_at_most_concurrency_minus_one() {
        let (limiter, _) = limiter();
        let contact = Contact::new("6281", start());
        for _ in 0..4 {
            limiter.record(&contact).await;
        }

        // Four senders check before any of them records.
        let concurrency = 4;
        let checks = futures::future::join_all(
            (0..concurrency).map(|_| limiter.check_contact(&contact, LimitOverride::default())),
        )
        .await;
        assert!(checks.iter().all(|c| c.is_ok()));
        for _ in 0..concurrency {
            limiter.record(&contact).await;
        }

        let status = limiter.status(&contact).await;
        let minute = &status.windows[0];
        assert_eq!(minute.used, 8);
        assert_eq!(minute.used, minute.cap + concurrency - 1);
        // The next send is rejected again.
        assert!(limiter.check_contact(&contact, LimitOverride::default()).await.is_err());
    }

    #[tokio::test]
    async fn status_is_read_only() {
        let (limiter, _) = limiter();
        let contact = Contact::new("6281", start());
        limiter.record(&contact).await;

        let first = limiter.status(&contact).await;
        let second = limiter.status(&contact).await;
        assert_eq!(first, second);
        assert_eq!(first.windows.len(), 4);
        assert_eq!(first.windows[0].used, 1);
        assert_eq!(first.windows[0].remaining, 4);
        assert_eq!(first.windows[3].window, "global_minute");
        assert!(!first.degraded);
    }

    struct DownStore(AtomicBool);

    #[async_trait]
    impl CounterStore for DownStore {
        fn name(&self) -> &str {
            "down"
        }

        async fn get(&self, _: &str, _: DateTime<Utc>) -> Result<Option<CounterValue>, CounterError> {
            self.0.store(true, Ordering::SeqCst);
            Err(CounterError::Unavailable { store: "down".into(), reason: "refused".into() })
        }

        async fn increment(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<CounterValue, CounterError> {
            Err(CounterError::Unavailable { store: "down".into(), reason: "refused".into() })
        }

        async fn purge_expired(&self, _: DateTime<Utc>) -> Result<usize, CounterError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn degraded_mode_keeps_limiting_locally() {
        let primary = Arc::new(DownStore(AtomicBool::new(false)));
        let store = Arc::new(ResilientCounterStore::new(primary.clone()));
        let (limiter, _) = limiter_with(store, RateLimitConfig::default());
        let contact = Contact::new("6281", start());

        for _ in 0..5 {
            assert!(limiter.check_contact(&contact, LimitOverride::default()).await.is_ok());
            limiter.record(&contact).await;
        }
        assert!(primary.0.load(Ordering::SeqCst));
        assert!(limiter.is_degraded());

        let err = limiter.check_contact(&contact, LimitOverride::default()).await.unwrap_err();
        assert_eq!(err.reason, LimitReason::ContactMinuteLimit);
        assert!(limiter.status(&contact).await.degraded);
    }

    #[tokio::test]
    async fn purge_removes_elapsed_windows() {
        let store = Arc::new(InProcessCounterStore::new());
        let resilient = Arc::new(ResilientCounterStore::new(store.clone()));
        let (limiter, clock) = limiter_with(resilient, RateLimitConfig::default());
        limiter.record(&Contact::new("6281", start())).await;
        assert_eq!(store.len().await, 4);

        clock.advance(Duration::hours(2));
        // Minute, hour and global windows have passed; the daily one has not.
        assert_eq!(limiter.purge_expired().await, 3);
    }
}
