//! Duplicate suppression and prohibited-content screening.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use regex::{RegexSet, RegexSetBuilder};
use tokio::sync::Mutex;

use crate::error::ConfigError;

/// Upper bound of remembered bodies per contact.
const MAX_TRACKED_PER_CONTACT: usize = 32;

/// Remembers recent normalized bodies per contact.
///
/// Entries older than the window are evicted lazily on the next check for
/// the same contact, and `purge` drops contacts that went quiet.
pub struct DuplicateTracker {
    window: Duration,
    seen: Mutex<HashMap<String, VecDeque<(String, DateTime<Utc>)>>>,
}

impl DuplicateTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `normalized` was seen from `contact_id` within the
    /// window. Otherwise records it and returns `false`.
    pub async fn check_and_record(&self, contact_id: &str, normalized: &str, now: DateTime<Utc>) -> bool {
        let mut seen = self.seen.lock().await;
        let history = seen.entry(contact_id.to_string()).or_default();

        while let Some((_, at)) = history.front() {
            if now - *at >= self.window {
                history.pop_front();
            } else {
                break;
            }
        }

        if history.iter().any(|(body, _)| body == normalized) {
            return true;
        }

        if history.len() >= MAX_TRACKED_PER_CONTACT {
            history.pop_front();
        }
        history.push_back((normalized.to_string(), now));
        false
    }

    /// Forget contacts whose newest entry is outside the window.
    pub async fn purge(&self, now: DateTime<Utc>) -> usize {
        let mut seen = self.seen.lock().await;
        let before = seen.len();
        seen.retain(|_, history| history.back().is_some_and(|(_, at)| now - *at < self.window));
        before - seen.len()
    }
}

/// Case-insensitive set of prohibited-content patterns.
#[derive(Debug, Clone)]
pub struct ProhibitedContent {
    set: RegexSet,
}

impl ProhibitedContent {
    pub fn new(patterns: &[String]) -> Result<Self, ConfigError> {
        let set = RegexSetBuilder::new(patterns).case_insensitive(true).build()?;
        Ok(Self { set })
    }

    /// The first matching pattern, if any.
    pub fn first_match(&self, body: &str) -> Option<&str> {
        self.set
            .matches(body)
            .iter()
            .next()
            .map(|idx| self.set.patterns()[idx].as_str())
    }
}
