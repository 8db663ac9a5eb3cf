//! Foreground tracking for notification suppression.
//!
//! Visibility is recorded per UI session token, and suppression consults the
//! aggregate: any foregrounded UI silences passive notifications everywhere.
//! A visible report only counts for [`DEFAULT_VISIBILITY_TTL`]; the UI
//! re-reports while it stays in the foreground, so a tab that vanished
//! without saying so stops suppressing once its report goes stale.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_VISIBILITY_TTL: Duration = Duration::from_secs(90);

#[derive(Debug)]
pub struct VisibilityTracker {
    ttl: Duration,
    visible_since_report: Mutex<HashMap<String, Instant>>,
}

impl Default for VisibilityTracker {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_VISIBILITY_TTL)
    }
}

impl VisibilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            visible_since_report: Mutex::new(HashMap::new()),
        }
    }

    pub fn report(&self, token: &str, visible: bool) {
        let mut map = self
            .visible_since_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if visible {
            map.insert(token.to_string(), Instant::now());
        } else {
            map.remove(token);
        }
    }

    /// Process-wide "some UI is in the foreground" flag.
    pub fn any_visible(&self) -> bool {
        let now = Instant::now();
        let mut map = self
            .visible_since_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, reported| now.saturating_duration_since(*reported) <= self.ttl);
        !map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_background_tab_does_not_clear_another_foreground_tab() {
        let tracker = VisibilityTracker::new();
        assert!(!tracker.any_visible());

        tracker.report("laptop", true);
        tracker.report("phone", false);
        assert!(tracker.any_visible());

        tracker.report("laptop", false);
        assert!(!tracker.any_visible());
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_tab_stops_suppressing_after_ttl() {
        let tracker = VisibilityTracker::with_ttl(Duration::from_secs(90));
        tracker.report("closed-tab", true);
        tracker.report("live-tab", true);

        tokio::time::sleep(Duration::from_secs(60)).await;
        tracker.report("live-tab", true);
        tokio::time::sleep(Duration::from_secs(60)).await;
        // Only the tab that kept reporting still counts.
        assert!(tracker.any_visible());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!tracker.any_visible());
    }
}
