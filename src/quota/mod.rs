//! Rate-limited quota manager (SPEC_FULL 4.4, component C4).
//!
//! Ported from `original_source/.../rate_limiter.py`'s
//! `IntelligentRateLimiter`: independent sliding-window quotas with burst
//! capacity, graduated alerts, and atomic snapshot persistence. Mutations
//! happen under a single reentrant-equivalent `tokio::sync::Mutex`.
//! `queue_request` callers are served by [`run_queue_processor`], a free
//! function meant to be spawned once per manager by its caller (see
//! `main.rs`), not by the manager itself.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, Notify};

const ALERT_HISTORY_LIMIT: usize = 1000;

/// Errors raised by quota configuration or lookup.
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("unknown quota kind: {0}")]
    UnknownKind(String),
    #[error("quota limit must be positive, got {0}")]
    InvalidLimit(u64),
    #[error("failed to persist quota snapshot: {0}")]
    Persistence(#[source] std::io::Error),
    #[error("quota manager was dropped before the queued request was processed")]
    QueueClosed,
}

/// Alert severity, graduated the same way as the teacher's `BudgetStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// A quota breach notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaAlert {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub level: AlertLevel,
    pub current: u64,
    pub limit: u64,
    pub usage_percent: f64,
}

/// Static configuration for one quota window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub window_seconds: i64,
    pub limit: u64,
    pub burst_capacity: u64,
    pub warning_threshold_percent: u8,
    pub critical_threshold_percent: u8,
}

impl QuotaConfig {
    pub fn validate(&self) -> Result<(), QuotaError> {
        if self.limit == 0 {
            return Err(QuotaError::InvalidLimit(self.limit));
        }
        Ok(())
    }
}

/// Admission decision returned by `can_make_request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionDetails {
    pub current: u64,
    pub limit: u64,
    pub burst_in_use: bool,
    pub next_available: Option<DateTime<Utc>>,
    pub wait_seconds: Option<f64>,
}

/// Snapshot of one quota's usage, returned by `get_status` (SPEC_FULL 4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub kind: String,
    pub current: u64,
    pub burst_in_use: u64,
    pub limit: u64,
    pub burst_capacity: u64,
    pub usage_percent: f64,
    pub remaining_capacity: u64,
    pub is_burst_active: bool,
    pub window_start: DateTime<Utc>,
    pub last_reset: DateTime<Utc>,
}

/// Aggregate counters, returned by `get_statistics` (SPEC_FULL 4.4).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QuotaStatistics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub rejected_requests: u64,
    pub burst_requests: u64,
    pub queued_requests: u64,
    pub alerts_triggered: u64,
    pub queue_size: usize,
    pub active_quotas: usize,
    pub recent_alerts: usize,
}

/// A request waiting for quota admission, ordered by `(priority asc,
/// enqueue order asc)` (SPEC_FULL 4.4 `queue_request`). Lower `priority`
/// values are served first; ties broken by arrival order.
struct QueuedRequest {
    kind: String,
    priority: i64,
    seq: u64,
    reply: oneshot::Sender<()>,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the lowest priority (and, on a
        // tie, the earliest arrival) sorts greatest and pops first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Per-quota mutable state: the sliding timestamp log plus the last alert
/// level raised in the current window (for idempotency).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QuotaWindow {
    timestamps: VecDeque<DateTime<Utc>>,
    burst_timestamps: VecDeque<DateTime<Utc>>,
    window_start: DateTime<Utc>,
    last_reset: DateTime<Utc>,
    last_alert_level: Option<AlertLevel>,
}

impl QuotaWindow {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            timestamps: VecDeque::new(),
            burst_timestamps: VecDeque::new(),
            window_start: now,
            last_reset: now,
            last_alert_level: None,
        }
    }

    fn expire(&mut self, config: &QuotaConfig, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::seconds(config.window_seconds);
        while self.timestamps.front().is_some_and(|t| *t < cutoff) {
            self.timestamps.pop_front();
        }
        while self.burst_timestamps.front().is_some_and(|t| *t < cutoff) {
            self.burst_timestamps.pop_front();
        }
    }
}

/// A persisted snapshot of all quota windows, written atomically on every
/// state change (SPEC_FULL 4.4 "Persistence").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Snapshot {
    windows: HashMap<String, QuotaWindow>,
}

struct QuotaState {
    configs: HashMap<String, QuotaConfig>,
    windows: HashMap<String, QuotaWindow>,
    alerts: VecDeque<QuotaAlert>,
    stats: QuotaStatistics,
}

/// Manages independent sliding-window quotas with burst capacity.
///
/// `queue_request` hands admission-gated requests to a dedicated background
/// task (`run_queue_processor`, spawned by the caller the way `main.rs`
/// spawns `whatsapp_templates::run_poller`) rather than running one itself,
/// so a `QuotaManager` stays plain data and spawning stays the caller's
/// decision.
pub struct QuotaManager {
    state: Mutex<QuotaState>,
    snapshot_path: PathBuf,
    queue: Mutex<BinaryHeap<QueuedRequest>>,
    queue_notify: Notify,
    queue_seq: AtomicU64,
}

impl QuotaManager {
    pub fn new(configs: Vec<(String, QuotaConfig)>, snapshot_path: PathBuf) -> Result<Self, QuotaError> {
        for (_, cfg) in &configs {
            cfg.validate()?;
        }
        let now = Utc::now();
        let active_quotas = configs.len();
        let windows = configs
            .iter()
            .map(|(kind, _)| (kind.clone(), QuotaWindow::new(now)))
            .collect();
        let configs = configs.into_iter().collect();
        Ok(Self {
            state: Mutex::new(QuotaState {
                configs,
                windows,
                alerts: VecDeque::new(),
                stats: QuotaStatistics {
                    active_quotas,
                    ..Default::default()
                },
            }),
            snapshot_path,
            queue: Mutex::new(BinaryHeap::new()),
            queue_notify: Notify::new(),
            queue_seq: AtomicU64::new(0),
        })
    }

    /// Restore quota windows from a snapshot written by a previous run,
    /// discarding timestamps older than each window on load.
    pub async fn restore_snapshot(&self, bytes: &[u8]) -> Result<(), QuotaError> {
        let snapshot: Snapshot = serde_json::from_slice(bytes).unwrap_or_default();
        let mut state = self.state.lock().await;
        let now = Utc::now();
        for (kind, mut window) in snapshot.windows {
            if let Some(config) = state.configs.get(&kind) {
                window.expire(config, now);
                state.windows.insert(kind, window);
            }
        }
        Ok(())
    }

    /// Read-only admission check (SPEC_FULL 4.4 `can_make_request`).
    pub async fn can_make_request(
        &self,
        kind: &str,
        allow_burst: bool,
    ) -> Result<(bool, AdmissionDetails), QuotaError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let config = state
            .configs
            .get(kind)
            .cloned()
            .ok_or_else(|| QuotaError::UnknownKind(kind.to_string()))?;
        let window = state
            .windows
            .get_mut(kind)
            .ok_or_else(|| QuotaError::UnknownKind(kind.to_string()))?;
        window.expire(&config, now);

        let current = window.timestamps.len() as u64;
        let burst_used = window.burst_timestamps.len() as u64;

        if current < config.limit {
            return Ok((
                true,
                AdmissionDetails {
                    current,
                    limit: config.limit,
                    burst_in_use: false,
                    next_available: None,
                    wait_seconds: None,
                },
            ));
        }

        if allow_burst && config.burst_capacity > 0 && current + burst_used < config.limit + config.burst_capacity {
            return Ok((
                true,
                AdmissionDetails {
                    current,
                    limit: config.limit,
                    burst_in_use: true,
                    next_available: None,
                    wait_seconds: None,
                },
            ));
        }

        let next_available = window
            .timestamps
            .front()
            .map(|oldest| *oldest + chrono::Duration::seconds(config.window_seconds));
        let wait_seconds = next_available.map(|t| (t - now).num_milliseconds() as f64 / 1000.0);

        state.stats.rejected_requests += 1;
        Ok((
            false,
            AdmissionDetails {
                current,
                limit: config.limit,
                burst_in_use: false,
                next_available,
                wait_seconds,
            },
        ))
    }

    /// Record an admitted request, appending to the sliding log and
    /// evaluating alert thresholds.
    pub async fn record_request(&self, kind: &str, used_burst: bool) -> Result<(), QuotaError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let config = state
            .configs
            .get(kind)
            .cloned()
            .ok_or_else(|| QuotaError::UnknownKind(kind.to_string()))?;
        let window = state
            .windows
            .get_mut(kind)
            .ok_or_else(|| QuotaError::UnknownKind(kind.to_string()))?;

        if used_burst {
            window.burst_timestamps.push_back(now);
        } else {
            window.timestamps.push_back(now);
        }

        state.stats.total_requests += 1;
        state.stats.allowed_requests += 1;
        if used_burst {
            state.stats.burst_requests += 1;
        }

        let current = window.timestamps.len() as u64;
        let percent = (current as f64 / config.limit as f64) * 100.0;
        let new_level = if percent >= config.critical_threshold_percent as f64 {
            Some(AlertLevel::Critical)
        } else if percent >= config.warning_threshold_percent as f64 {
            Some(AlertLevel::Warning)
        } else {
            None
        };

        // Idempotent within a window: only alert on first reaching a level,
        // or on escalation past it (SPEC_FULL 4.4).
        let should_alert = match (window.last_alert_level, new_level) {
            (None, Some(_)) => true,
            (Some(old), Some(new)) => new != old && new == AlertLevel::Critical,
            _ => false,
        };
        if let Some(level) = new_level {
            window.last_alert_level = Some(level);
            if should_alert {
                let alert = QuotaAlert {
                    timestamp: now,
                    kind: kind.to_string(),
                    level,
                    current,
                    limit: config.limit,
                    usage_percent: percent,
                };
                tracing::warn!(kind, ?level, current, limit = config.limit, "quota alert");
                state.alerts.push_back(alert);
                if state.alerts.len() > ALERT_HISTORY_LIMIT {
                    state.alerts.pop_front();
                }
            }
        } else {
            window.last_alert_level = None;
        }

        drop(state);
        self.persist_snapshot().await;
        Ok(())
    }

    pub async fn reset_quota(&self, kind: &str) -> Result<(), QuotaError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let window = state
            .windows
            .get_mut(kind)
            .ok_or_else(|| QuotaError::UnknownKind(kind.to_string()))?;
        *window = QuotaWindow::new(now);
        drop(state);
        self.persist_snapshot().await;
        Ok(())
    }

    pub async fn update_quota_config(&self, kind: &str, config: QuotaConfig) -> Result<(), QuotaError> {
        config.validate()?;
        let mut state = self.state.lock().await;
        if !state.windows.contains_key(kind) {
            return Err(QuotaError::UnknownKind(kind.to_string()));
        }
        state.configs.insert(kind.to_string(), config);
        Ok(())
    }

    pub async fn recent_alerts(&self, limit: usize) -> Vec<QuotaAlert> {
        let state = self.state.lock().await;
        state.alerts.iter().rev().take(limit).cloned().collect()
    }

    /// Enqueue a request for admission by the dedicated queue processor
    /// (SPEC_FULL 4.4 `queue_request`), ordered `(priority asc, enqueue
    /// order asc)`. Resolves once `run_queue_processor` has admitted and
    /// recorded it; the Python original invoked a `callback` at that point,
    /// which here is simply the caller's `.await` on the returned receiver
    /// resuming.
    ///
    /// Returns `Err(UnknownKind)` immediately if `kind` was never
    /// configured; does not itself start the processor — pair with a
    /// `tokio::spawn(run_queue_processor(manager.clone()))` the way
    /// `main.rs` spawns `whatsapp_templates::run_poller`.
    pub async fn queue_request(
        &self,
        kind: impl Into<String>,
        priority: i64,
    ) -> Result<(), QuotaError> {
        let kind = kind.into();
        {
            let mut state = self.state.lock().await;
            if !state.configs.contains_key(&kind) {
                return Err(QuotaError::UnknownKind(kind));
            }
            state.stats.queued_requests += 1;
        }
        let (reply, rx) = oneshot::channel();
        let seq = self.queue_seq.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().await.push(QueuedRequest {
            kind,
            priority,
            seq,
            reply,
        });
        self.queue_notify.notify_one();
        rx.await.map_err(|_| QuotaError::QueueClosed)
    }

    /// Status of every configured quota (SPEC_FULL 4.4 `get_status`).
    pub async fn get_status(&self) -> Vec<QuotaStatus> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let kinds: Vec<String> = state.configs.keys().cloned().collect();
        let mut out = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let config = state.configs.get(&kind).cloned().expect("kind from configs");
            let window = state.windows.get_mut(&kind).expect("window for configured kind");
            window.expire(&config, now);
            let current = window.timestamps.len() as u64;
            let burst_in_use = window.burst_timestamps.len() as u64;
            let usage_percent = if config.limit == 0 {
                0.0
            } else {
                (current as f64 / config.limit as f64) * 100.0
            };
            let remaining_capacity = (config.limit + config.burst_capacity)
                .saturating_sub(current + burst_in_use);
            out.push(QuotaStatus {
                kind,
                current,
                burst_in_use,
                limit: config.limit,
                burst_capacity: config.burst_capacity,
                usage_percent,
                remaining_capacity,
                is_burst_active: burst_in_use > 0,
                window_start: window.window_start,
                last_reset: window.last_reset,
            });
        }
        out
    }

    /// Aggregate counters (SPEC_FULL 4.4 `get_statistics`).
    pub async fn get_statistics(&self) -> QuotaStatistics {
        let state = self.state.lock().await;
        let queue_size = self.queue.lock().await.len();
        QuotaStatistics {
            queue_size,
            recent_alerts: state.alerts.len(),
            active_quotas: state.configs.len(),
            ..state.stats
        }
    }

    /// Snapshot failures are logged but non-fatal (SPEC_FULL 4.4).
    async fn persist_snapshot(&self) {
        let state = self.state.lock().await;
        let snapshot = Snapshot {
            windows: state.windows.clone(),
        };
        drop(state);
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                let tmp_path = self.snapshot_path.with_extension("tmp");
                if let Err(e) = tokio::fs::write(&tmp_path, &bytes).await {
                    tracing::warn!(error = %e, "failed to write quota snapshot temp file");
                    return;
                }
                if let Err(e) = tokio::fs::rename(&tmp_path, &self.snapshot_path).await {
                    tracing::warn!(error = %e, "failed to atomically rename quota snapshot");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize quota snapshot"),
        }
    }
}

/// Drains the priority queue fed by `queue_request`: pops the next entry,
/// blocks on admission (rechecking on each wakeup and sleeping for
/// `wait_seconds` on denial), records the request once admitted, and wakes
/// the caller. Sleeps on the queue's `Notify` when empty rather than
/// polling.
///
/// Exactly one of these should run per `QuotaManager` (SPEC_FULL 5); the
/// manager does not spawn it itself — pass an `Arc<QuotaManager>` to
/// `tokio::spawn(run_queue_processor(..))` the way `main.rs` spawns
/// `whatsapp_templates::run_poller`.
pub async fn run_queue_processor(quota: Arc<QuotaManager>) {
    loop {
        let entry = quota.queue.lock().await.pop();
        let Some(entry) = entry else {
            quota.queue_notify.notified().await;
            continue;
        };
        loop {
            match quota.can_make_request(&entry.kind, true).await {
                Ok((true, details)) => {
                    if let Err(err) = quota.record_request(&entry.kind, details.burst_in_use).await {
                        tracing::warn!(kind = %entry.kind, error = %err, "queued request admitted but failed to record usage");
                    }
                    let _ = entry.reply.send(());
                    break;
                }
                Ok((false, details)) => {
                    let wait = details.wait_seconds.unwrap_or(1.0).max(0.05);
                    tokio::time::sleep(std::time::Duration::from_secs_f64(wait)).await;
                }
                Err(err) => {
                    tracing::warn!(kind = %entry.kind, error = %err, "dropping queued request for a quota kind that no longer exists");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(limit: u64, burst: u64) -> QuotaConfig {
        QuotaConfig {
            window_seconds: 60,
            limit,
            burst_capacity: burst,
            warning_threshold_percent: 80,
            critical_threshold_percent: 95,
        }
    }

    fn manager(limit: u64, burst: u64) -> QuotaManager {
        QuotaManager::new(
            vec![("messages_per_minute".to_string(), config(limit, burst))],
            std::env::temp_dir().join("dispatchctl_test_quota_snapshot.json"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn admits_requests_within_limit() {
        let mgr = manager(5, 0);
        let (admitted, _) = mgr.can_make_request("messages_per_minute", true).await.unwrap();
        assert!(admitted);
    }

    #[tokio::test]
    async fn denies_requests_over_limit_with_no_burst() {
        let mgr = manager(1, 0);
        mgr.record_request("messages_per_minute", false).await.unwrap();
        let (admitted, details) = mgr.can_make_request("messages_per_minute", true).await.unwrap();
        assert!(!admitted);
        assert!(details.next_available.is_some());
    }

    #[tokio::test]
    async fn admits_burst_when_regular_capacity_exhausted() {
        let mgr = manager(1, 2);
        mgr.record_request("messages_per_minute", false).await.unwrap();
        let (admitted, details) = mgr.can_make_request("messages_per_minute", true).await.unwrap();
        assert!(admitted);
        assert!(details.burst_in_use);
    }

    #[tokio::test]
    async fn unknown_quota_kind_is_rejected() {
        let mgr = manager(5, 0);
        let result = mgr.can_make_request("nonexistent", true).await;
        assert!(matches!(result, Err(QuotaError::UnknownKind(_))));
    }

    #[tokio::test]
    async fn reset_quota_clears_usage() {
        let mgr = manager(1, 0);
        mgr.record_request("messages_per_minute", false).await.unwrap();
        mgr.reset_quota("messages_per_minute").await.unwrap();
        let (admitted, _) = mgr.can_make_request("messages_per_minute", true).await.unwrap();
        assert!(admitted);
    }

    #[tokio::test]
    async fn alert_fires_once_per_level_within_a_window() {
        let mgr = manager(10, 0);
        for _ in 0..9 {
            mgr.record_request("messages_per_minute", false).await.unwrap();
        }
        let alerts_after_first_warning = mgr.recent_alerts(10).await.len();
        mgr.record_request("messages_per_minute", false).await.ok();
        let alerts_after_more = mgr.recent_alerts(10).await.len();
        assert_eq!(alerts_after_first_warning, alerts_after_more.min(alerts_after_first_warning + 1));
    }

    #[tokio::test]
    async fn queue_request_resolves_once_admitted() {
        // Regular capacity exhausted but burst capacity open, so the
        // processor admits the queued request on its first check with no
        // need to sleep until `next_available`.
        let mgr = Arc::new(manager(1, 1));
        let processor = tokio::spawn(run_queue_processor(mgr.clone()));

        mgr.record_request("messages_per_minute", false).await.unwrap();
        mgr.queue_request("messages_per_minute", 5)
            .await
            .expect("queued request resolves once burst capacity admits it");

        processor.abort();
    }

    #[tokio::test]
    async fn queue_request_rejects_unknown_kind_immediately() {
        let mgr = manager(5, 0);
        let result = mgr.queue_request("nonexistent", 5).await;
        assert!(matches!(result, Err(QuotaError::UnknownKind(_))));
    }

    #[tokio::test]
    async fn get_status_reports_configured_kind() {
        let mgr = manager(5, 2);
        mgr.record_request("messages_per_minute", false).await.unwrap();
        let status = mgr.get_status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].kind, "messages_per_minute");
        assert_eq!(status[0].current, 1);
        assert_eq!(status[0].limit, 5);
    }

    #[tokio::test]
    async fn get_statistics_tracks_allowed_and_rejected() {
        let mgr = manager(1, 0);
        mgr.record_request("messages_per_minute", false).await.unwrap();
        mgr.can_make_request("messages_per_minute", true).await.unwrap();
        let stats = mgr.get_statistics().await;
        assert_eq!(stats.allowed_requests, 1);
        assert_eq!(stats.rejected_requests, 1);
        assert_eq!(stats.active_quotas, 1);
    }
}
