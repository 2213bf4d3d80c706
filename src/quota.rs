//! Daily quota accounting
//!
//! Gmail charges every call a number of quota units and caps the units a
//! project may spend per day. The tracker keeps one [`QuotaWindow`] per
//! calendar day (UTC) and hands out pessimistic reservations:
//!
//! 1. `reserve` before dispatch (fails with `QuotaExhausted` if the call
//!    cannot fit in the remaining window)
//! 2. `commit` once the call succeeded
//! 3. `rollback` if it failed for a reason unrelated to quota, so retried
//!    calls are not charged twice
//!
//! Once a reservation of some size is refused, every later reservation of
//! that size or larger is refused until the window rolls over.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QuotaConfig;
use crate::error::{GmailError, Result};

/// Units and call counts recorded for one API method
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodUsage {
    pub calls: u64,
    pub units: u64,
}

/// Quota consumption for a single day
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaWindow {
    pub date: NaiveDate,
    pub consumed: u64,
    pub ceiling: u64,
    #[serde(default)]
    pub total_calls: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub calls_by_method: BTreeMap<String, MethodUsage>,
}

impl QuotaWindow {
    pub fn new(date: NaiveDate, ceiling: u64) -> Self {
        Self {
            date,
            consumed: 0,
            ceiling,
            total_calls: 0,
            errors: 0,
            calls_by_method: BTreeMap::new(),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.ceiling.saturating_sub(self.consumed)
    }

    /// Save window to disk
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        debug!("Saved quota window to {:?}", path);
        Ok(())
    }

    /// Load a window from disk, if one was saved
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let json = tokio::fs::read_to_string(path).await?;
        let window: Self = serde_json::from_str(&json)?;
        Ok(Some(window))
    }
}

struct QuotaState {
    window: QuotaWindow,
    /// Units held by in-flight reservations
    reserved: u64,
    /// Smallest reservation refused in this window
    exhausted_from: Option<u64>,
    warned: bool,
}

/// Snapshot of the current window
#[derive(Debug, Clone)]
pub struct QuotaStats {
    pub date: NaiveDate,
    pub consumed: u64,
    pub reserved: u64,
    pub ceiling: u64,
    pub remaining: u64,
    pub usage_percent: f64,
    pub total_calls: u64,
    pub errors: u64,
    /// Up to five methods, most units first
    pub top_methods: Vec<(String, MethodUsage)>,
}

type DateSource = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// Shared daily quota tracker. Clones share state.
#[derive(Clone)]
pub struct QuotaTracker {
    state: Arc<Mutex<QuotaState>>,
    settled: Arc<Notify>,
    today: DateSource,
    warning_threshold: f64,
    state_path: Option<PathBuf>,
}

impl fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("warning_threshold", &self.warning_threshold)
            .field("state_path", &self.state_path)
            .finish_non_exhaustive()
    }
}

fn utc_today() -> NaiveDate {
    Utc::now().date_naive()
}

impl QuotaTracker {
    /// In-memory tracker with the given daily ceiling
    pub fn new(ceiling: u64) -> Self {
        Self::with_date_source(ceiling, Arc::new(utc_today))
    }

    /// Tracker whose notion of "today" comes from `today`
    pub fn with_date_source(ceiling: u64, today: DateSource) -> Self {
        let window = QuotaWindow::new(today(), ceiling);
        Self {
            state: Arc::new(Mutex::new(QuotaState {
                window,
                reserved: 0,
                exhausted_from: None,
                warned: false,
            })),
            settled: Arc::new(Notify::new()),
            today,
            warning_threshold: 0.8,
            state_path: None,
        }
    }

    /// In-memory tracker configured from `[quota]`, without touching disk
    pub fn from_config(config: &QuotaConfig) -> Self {
        let mut tracker = Self::new(config.daily_ceiling);
        tracker.warning_threshold = config.warning_threshold;
        tracker.state_path = config.state_path.clone();
        tracker
    }

    /// Tracker configured from `[quota]`, resuming today's persisted window if any
    pub async fn load(config: &QuotaConfig) -> Result<Self> {
        let tracker = Self::from_config(config);
        if let Some(path) = &config.state_path {
            tracker.restore_from(path).await?;
        }
        Ok(tracker)
    }

    async fn restore_from(&self, path: &Path) -> Result<()> {
        let Some(saved) = QuotaWindow::load(path).await? else {
            info!("No saved quota window found, starting fresh");
            return Ok(());
        };

        let mut state = self.state.lock().await;
        if saved.date != state.window.date {
            info!("Saved quota window is from {}, starting a new window", saved.date);
            return Ok(());
        }

        let ceiling = state.window.ceiling;
        state.window = QuotaWindow {
            consumed: saved.consumed.min(ceiling),
            ceiling,
            ..saved
        };
        info!(
            "Resumed quota window for {}: {}/{} units consumed",
            state.window.date, state.window.consumed, ceiling
        );
        Ok(())
    }

    fn roll_over_if_needed(&self, state: &mut QuotaState) {
        let today = (self.today)();
        if state.window.date != today {
            info!(
                "Quota window rolled over from {} to {} ({} units consumed)",
                state.window.date, today, state.window.consumed
            );
            state.window = QuotaWindow::new(today, state.window.ceiling);
            state.exhausted_from = None;
            state.warned = false;
        }
    }

    fn exhausted_error(state: &QuotaState, units: u64) -> GmailError {
        GmailError::QuotaExhausted(format!(
            "{} units requested, {}/{} consumed for {}",
            units, state.window.consumed, state.window.ceiling, state.window.date
        ))
    }

    /// Reserve `units` against today's window.
    ///
    /// Returns `QuotaExhausted` immediately if the units cannot fit even once
    /// in-flight reservations settle. If they only fail to fit because of
    /// in-flight reservations, waits for those to commit or roll back;
    /// `cancel` ends that wait with `RateLimitTimeout`.
    pub async fn reserve(&self, units: u64, cancel: &CancellationToken) -> Result<()> {
        loop {
            let settled = self.settled.notified();
            {
                let mut state = self.state.lock().await;
                self.roll_over_if_needed(&mut state);

                if state.exhausted_from.is_some_and(|from| units >= from) {
                    return Err(Self::exhausted_error(&state, units));
                }

                if state.window.consumed + units > state.window.ceiling {
                    state.exhausted_from = Some(state.exhausted_from.map_or(units, |f| f.min(units)));
                    warn!(
                        "Daily quota exhausted for {}-unit calls ({}/{} consumed)",
                        units, state.window.consumed, state.window.ceiling
                    );
                    return Err(Self::exhausted_error(&state, units));
                }

                if state.window.consumed + state.reserved + units <= state.window.ceiling {
                    state.reserved += units;
                    debug!(
                        "Reserved {} quota units ({} consumed, {} reserved)",
                        units, state.window.consumed, state.reserved
                    );
                    return Ok(());
                }

                debug!(
                    "Waiting for in-flight reservations before reserving {} units",
                    units
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(GmailError::RateLimitTimeout(format!(
                        "cancelled while waiting to reserve {} quota units",
                        units
                    )));
                }
                _ = settled => {}
            }
        }
    }

    /// Charge a reservation that resulted in a call
    pub async fn commit(&self, units: u64, method: &str) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock().await;
            self.roll_over_if_needed(&mut state);

            state.reserved = state.reserved.saturating_sub(units);
            state.window.consumed = (state.window.consumed + units).min(state.window.ceiling);
            state.window.total_calls += 1;
            let usage = state
                .window
                .calls_by_method
                .entry(method.to_string())
                .or_default();
            usage.calls += 1;
            usage.units += units;

            let ratio = state.window.consumed as f64 / state.window.ceiling as f64;
            if !state.warned && ratio >= self.warning_threshold {
                state.warned = true;
                warn!(
                    "API QUOTA WARNING: {:.1}% of daily quota used ({} / {})",
                    ratio * 100.0,
                    state.window.consumed,
                    state.window.ceiling
                );
            }

            self.state_path.as_ref().map(|_| state.window.clone())
        };
        self.settled.notify_waiters();

        if let (Some(path), Some(window)) = (&self.state_path, snapshot) {
            window.save(path).await?;
        }
        Ok(())
    }

    /// Release a reservation whose call failed for a reason unrelated to quota
    pub async fn rollback(&self, units: u64) {
        {
            let mut state = self.state.lock().await;
            state.reserved = state.reserved.saturating_sub(units);
            debug!("Rolled back {} quota units ({} still reserved)", units, state.reserved);
        }
        self.settled.notify_waiters();
    }

    /// Count a failed call against the window's error tally
    pub async fn record_error(&self) {
        let mut state = self.state.lock().await;
        self.roll_over_if_needed(&mut state);
        state.window.errors += 1;
    }

    /// The provider reported quota exhaustion for a call of `units`
    pub async fn mark_exhausted(&self, units: u64) {
        let mut state = self.state.lock().await;
        self.roll_over_if_needed(&mut state);
        state.exhausted_from = Some(state.exhausted_from.map_or(units, |f| f.min(units)));
        warn!("Provider reported daily quota exhausted; refusing calls of {}+ units", units);
    }

    /// Whether a reservation of `units` would be refused outright right now
    pub async fn is_exhausted_for(&self, units: u64) -> bool {
        let mut state = self.state.lock().await;
        self.roll_over_if_needed(&mut state);
        state.exhausted_from.is_some_and(|from| units >= from)
            || state.window.consumed + units > state.window.ceiling
    }

    pub async fn window(&self) -> QuotaWindow {
        let mut state = self.state.lock().await;
        self.roll_over_if_needed(&mut state);
        state.window.clone()
    }

    pub async fn stats(&self) -> QuotaStats {
        let mut state = self.state.lock().await;
        self.roll_over_if_needed(&mut state);

        let mut top_methods: Vec<(String, MethodUsage)> = state
            .window
            .calls_by_method
            .iter()
            .map(|(method, usage)| (method.clone(), usage.clone()))
            .collect();
        top_methods.sort_by(|a, b| b.1.units.cmp(&a.1.units).then_with(|| a.0.cmp(&b.0)));
        top_methods.truncate(5);

        QuotaStats {
            date: state.window.date,
            consumed: state.window.consumed,
            reserved: state.reserved,
            ceiling: state.window.ceiling,
            remaining: state.window.remaining(),
            usage_percent: state.window.consumed as f64 / state.window.ceiling as f64 * 100.0,
            total_calls: state.window.total_calls,
            errors: state.window.errors,
            top_methods,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, day).unwrap()
    }

    /// Tracker whose day is controlled by the returned counter
    fn tracker_with_clock(ceiling: u64) -> (QuotaTracker, Arc<AtomicI64>) {
        let offset = Arc::new(AtomicI64::new(0));
        let clock = Arc::clone(&offset);
        let tracker = QuotaTracker::with_date_source(
            ceiling,
            Arc::new(move || date(1) + chrono::Duration::days(clock.load(Ordering::SeqCst))),
        );
        (tracker, offset)
    }

    #[tokio::test]
    async fn test_reserve_commit_rollback() {
        let tracker = QuotaTracker::new(100);
        let cancel = CancellationToken::new();

        tracker.reserve(40, &cancel).await.unwrap();
        tracker.commit(40, "messages.get").await.unwrap();
        tracker.reserve(30, &cancel).await.unwrap();
        tracker.rollback(30).await;

        let stats = tracker.stats().await;
        assert_eq!(stats.consumed, 40);
        assert_eq!(stats.reserved, 0);
        assert_eq!(stats.remaining, 60);
        assert_eq!(stats.total_calls, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_is_sticky_for_cost_class() {
        let tracker = QuotaTracker::new(1000);
        let cancel = CancellationToken::new();

        for _ in 0..6 {
            tracker.reserve(150, &cancel).await.unwrap();
            tracker.commit(150, "messages.modify").await.unwrap();
        }

        let err = tracker.reserve(150, &cancel).await.unwrap_err();
        assert!(matches!(err, GmailError::QuotaExhausted(_)));
        assert!(tracker.is_exhausted_for(150).await);
        assert!(tracker.is_exhausted_for(500).await);

        // Smaller calls still fit in the remaining 100 units
        tracker.reserve(5, &cancel).await.unwrap();
        assert_eq!(tracker.stats().await.consumed, 900);
    }

    #[tokio::test]
    async fn test_rollover_resets_window() {
        let (tracker, day) = tracker_with_clock(100);
        let cancel = CancellationToken::new();

        tracker.reserve(100, &cancel).await.unwrap();
        tracker.commit(100, "messages.list").await.unwrap();
        assert!(tracker.reserve(1, &cancel).await.is_err());

        day.store(1, Ordering::SeqCst);
        tracker.reserve(100, &cancel).await.unwrap();

        let window = tracker.window().await;
        assert_eq!(window.date, date(2));
        assert_eq!(window.consumed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_waits_for_inflight_then_proceeds() {
        let tracker = QuotaTracker::new(100);
        let cancel = CancellationToken::new();
        tracker.reserve(80, &cancel).await.unwrap();

        let waiter = {
            let tracker = tracker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { tracker.reserve(50, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        tracker.rollback(80).await;
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(tracker.stats().await.reserved, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_wait_cancelled() {
        let tracker = QuotaTracker::new(100);
        let cancel = CancellationToken::new();
        tracker.reserve(80, &cancel).await.unwrap();

        let waiter = {
            let tracker = tracker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { tracker.reserve(50, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(GmailError::RateLimitTimeout(_))));
    }

    #[tokio::test]
    async fn test_provider_exhaustion_mark() {
        let tracker = QuotaTracker::new(1_000_000);
        tracker.mark_exhausted(50).await;
        assert!(tracker.reserve(50, &CancellationToken::new()).await.is_err());
        assert!(tracker.reserve(5, &CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_stats_top_methods() {
        let tracker = QuotaTracker::new(10_000);
        let cancel = CancellationToken::new();
        for (method, units) in [("messages.get", 5), ("messages.get", 5), ("messages.delete", 10), ("labels.list", 1)] {
            tracker.reserve(units, &cancel).await.unwrap();
            tracker.commit(units, method).await.unwrap();
        }
        tracker.record_error().await;

        let stats = tracker.stats().await;
        assert_eq!(stats.top_methods[0].0, "messages.delete");
        assert_eq!(stats.top_methods[1].0, "messages.get");
        assert_eq!(stats.top_methods[1].1, MethodUsage { calls: 2, units: 10 });
        assert_eq!(stats.errors, 1);
        assert!((stats.usage_percent - 0.21).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_persisted_window_resumes_same_day() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quota.json");
        let config = QuotaConfig {
            daily_ceiling: 1000,
            warning_threshold: 0.8,
            state_path: Some(path.clone()),
        };

        let tracker = QuotaTracker::load(&config).await.unwrap();
        let cancel = CancellationToken::new();
        tracker.reserve(250, &cancel).await.unwrap();
        tracker.commit(250, "messages.list").await.unwrap();
        assert!(path.exists());

        let resumed = QuotaTracker::load(&config).await.unwrap();
        let stats = resumed.stats().await;
        assert_eq!(stats.consumed, 250);
        assert_eq!(stats.top_methods[0].0, "messages.list");
    }

    #[tokio::test]
    async fn test_persisted_window_from_previous_day_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quota.json");

        let mut stale = QuotaWindow::new(utc_today() - chrono::Duration::days(1), 1000);
        stale.consumed = 999;
        stale.save(&path).await.unwrap();

        let config = QuotaConfig {
            daily_ceiling: 1000,
            warning_threshold: 0.8,
            state_path: Some(path),
        };
        let tracker = QuotaTracker::load(&config).await.unwrap();
        assert_eq!(tracker.stats().await.consumed, 0);
    }
}
