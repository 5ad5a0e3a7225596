//! Per-procedure and lifetime execution statistics.
//!
//! Counters are updated on the request open/close path with atomics, under a
//! two-sided phase discipline: writers hold the shared side of a phase lock
//! for each update group, snapshots take the exclusive side. A snapshot
//! therefore never observes a half-applied close, and writers never starve a
//! snapshot for longer than one in-flight update.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::CallStatus;

/// Number of latency histogram buckets: eight 25 ms bands plus overflow.
pub const LATENCY_BUCKETS: usize = 9;
/// Width of one latency bucket in milliseconds.
pub const LATENCY_BUCKET_WIDTH_MS: u64 = 25;

const MIN_SENTINEL: u64 = u64::MAX;

/// Immutable copy of a statistics counter, captured under mutual exclusion
/// with writers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub start_tick: DateTime<Utc>,
    pub end_tick: Option<DateTime<Utc>>,
    pub request_count: u64,
    pub response_count: u64,
    pub failure_count: u64,
    pub timeout_count: u64,
    pub abort_count: u64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub total_latency_ms: u64,
    pub latency_buckets: [u64; LATENCY_BUCKETS],
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl StatisticsSnapshot {
    /// Responses that completed without failure, timeout or abort.
    pub fn success_count(&self) -> u64 {
        self.response_count
            .saturating_sub(self.failure_count)
            .saturating_sub(self.timeout_count)
            .saturating_sub(self.abort_count)
    }

    /// Mean latency over all responses, zero when there are none.
    pub fn average_latency_ms(&self) -> u64 {
        if self.response_count == 0 {
            0
        } else {
            self.total_latency_ms / self.response_count
        }
    }
}

/// Aggregate a collection of snapshots into one. Associative and commutative:
/// ticks merge by min/max, counts and buckets by sum, latency extrema by
/// min-of-minima / max-of-maxima (counters with no responses are skipped for
/// the extrema so their zero placeholders cannot pollute the merge).
pub fn summarize<I>(snapshots: I) -> Option<StatisticsSnapshot>
where
    I: IntoIterator<Item = StatisticsSnapshot>,
{
    let mut merged: Option<StatisticsSnapshot> = None;
    for s in snapshots {
        merged = Some(match merged {
            None => s,
            Some(mut acc) => {
                acc.start_tick = acc.start_tick.min(s.start_tick);
                acc.end_tick = match (acc.end_tick, s.end_tick) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
                if s.response_count > 0 {
                    if acc.response_count == 0 {
                        acc.min_latency_ms = s.min_latency_ms;
                        acc.max_latency_ms = s.max_latency_ms;
                    } else {
                        acc.min_latency_ms = acc.min_latency_ms.min(s.min_latency_ms);
                        acc.max_latency_ms = acc.max_latency_ms.max(s.max_latency_ms);
                    }
                }
                acc.request_count += s.request_count;
                acc.response_count += s.response_count;
                acc.failure_count += s.failure_count;
                acc.timeout_count += s.timeout_count;
                acc.abort_count += s.abort_count;
                acc.total_latency_ms += s.total_latency_ms;
                for (a, b) in acc.latency_buckets.iter_mut().zip(s.latency_buckets) {
                    *a += b;
                }
                acc.bytes_sent += s.bytes_sent;
                acc.bytes_received += s.bytes_received;
                acc
            }
        });
    }
    merged
}

/// Live statistics counter.
#[derive(Debug)]
pub struct Statistics {
    // Writers hold the read side per update group; snapshot/reset take the
    // write side.
    phase: RwLock<()>,
    start_tick: Mutex<DateTime<Utc>>,
    end_tick: Mutex<Option<DateTime<Utc>>>,
    request_count: AtomicU64,
    response_count: AtomicU64,
    failure_count: AtomicU64,
    timeout_count: AtomicU64,
    abort_count: AtomicU64,
    min_latency_ms: AtomicU64,
    max_latency_ms: AtomicU64,
    total_latency_ms: AtomicU64,
    latency_buckets: [AtomicU64; LATENCY_BUCKETS],
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    /// Closes whose execution id falls below this watermark are dropped
    /// (set by `reset(ignore_pending = true)`).
    drop_below_id: AtomicU64,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            phase: RwLock::new(()),
            start_tick: Mutex::new(Utc::now()),
            end_tick: Mutex::new(None),
            request_count: AtomicU64::new(0),
            response_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            abort_count: AtomicU64::new(0),
            min_latency_ms: AtomicU64::new(MIN_SENTINEL),
            max_latency_ms: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            latency_buckets: Default::default(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            drop_below_id: AtomicU64::new(0),
        }
    }

    fn lock_end_tick(&self) -> std::sync::MutexGuard<'_, Option<DateTime<Utc>>> {
        self.end_tick.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_start_tick(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        self.start_tick.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a request entering the wire. Ignored while a snapshot is in
    /// progress or after the counter has been closed.
    pub fn open_request(&self, bytes_sent: u64) {
        let Ok(_phase) = self.phase.try_read() else {
            return;
        };
        if self.lock_end_tick().is_some() {
            return;
        }
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes_sent, Ordering::Relaxed);
    }

    /// Record a completed request. Waits out any snapshot in progress.
    pub fn close_request(
        &self,
        execution_id: u64,
        duration_ms: i64,
        status: CallStatus,
        bytes_received: u64,
    ) {
        let _phase = self.phase.read().unwrap_or_else(|e| e.into_inner());
        if self.lock_end_tick().is_some() {
            return;
        }
        if execution_id < self.drop_below_id.load(Ordering::Acquire) {
            return;
        }
        let latency = duration_ms.max(0) as u64;

        self.response_count.fetch_add(1, Ordering::Relaxed);
        match status {
            CallStatus::Succeeded => {}
            CallStatus::Failed => {
                self.failure_count.fetch_add(1, Ordering::Relaxed);
            }
            CallStatus::TimedOut => {
                self.timeout_count.fetch_add(1, Ordering::Relaxed);
            }
            CallStatus::Aborted => {
                self.abort_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.min_latency_ms.fetch_min(latency, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(latency, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency, Ordering::Relaxed);
        let bucket = ((latency / LATENCY_BUCKET_WIDTH_MS) as usize).min(LATENCY_BUCKETS - 1);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes_received, Ordering::Relaxed);
    }

    /// Count bytes received for a frame with no pending request (late
    /// arrival after timeout or abort).
    pub fn note_discarded_bytes(&self, bytes_received: u64) {
        let _phase = self.phase.read().unwrap_or_else(|e| e.into_inner());
        self.bytes_received.fetch_add(bytes_received, Ordering::Relaxed);
    }

    /// Capture a frozen copy. Excludes writers for the duration.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let _phase = self.phase.write().unwrap_or_else(|e| e.into_inner());
        let response_count = self.response_count.load(Ordering::Relaxed);
        let raw_min = self.min_latency_ms.load(Ordering::Relaxed);
        let mut buckets = [0u64; LATENCY_BUCKETS];
        for (out, bucket) in buckets.iter_mut().zip(&self.latency_buckets) {
            *out = bucket.load(Ordering::Relaxed);
        }
        StatisticsSnapshot {
            start_tick: *self.lock_start_tick(),
            end_tick: *self.lock_end_tick(),
            request_count: self.request_count.load(Ordering::Relaxed),
            response_count,
            failure_count: self.failure_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
            abort_count: self.abort_count.load(Ordering::Relaxed),
            min_latency_ms: if raw_min == MIN_SENTINEL { 0 } else { raw_min },
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
            total_latency_ms: self.total_latency_ms.load(Ordering::Relaxed),
            latency_buckets: buckets,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter. With `ignore_pending`, closes for executions
    /// submitted before the reset (id below `watermark`) are dropped when
    /// they eventually arrive.
    pub fn reset(&self, ignore_pending: bool, watermark: u64) {
        let _phase = self.phase.write().unwrap_or_else(|e| e.into_inner());
        *self.lock_start_tick() = Utc::now();
        *self.lock_end_tick() = None;
        self.request_count.store(0, Ordering::Relaxed);
        self.response_count.store(0, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);
        self.timeout_count.store(0, Ordering::Relaxed);
        self.abort_count.store(0, Ordering::Relaxed);
        self.min_latency_ms.store(MIN_SENTINEL, Ordering::Relaxed);
        self.max_latency_ms.store(0, Ordering::Relaxed);
        self.total_latency_ms.store(0, Ordering::Relaxed);
        for bucket in &self.latency_buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        if ignore_pending {
            self.drop_below_id.store(watermark, Ordering::Release);
        }
    }

    /// Close the counter: stamp the end tick and stop accepting updates.
    pub fn seal(&self) {
        let _phase = self.phase.write().unwrap_or_else(|e| e.into_inner());
        let mut end = self.lock_end_tick();
        if end.is_none() {
            *end = Some(Utc::now());
        }
    }
}

/// Per-node statistics: one counter per procedure (case-insensitive) plus a
/// lifetime counter that survives reset and close.
#[derive(Debug)]
pub(crate) struct StatisticsRegistry {
    enabled: bool,
    per_procedure: Mutex<HashMap<String, Arc<Statistics>>>,
    lifetime: Arc<Statistics>,
}

impl StatisticsRegistry {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            per_procedure: Mutex::new(HashMap::new()),
            lifetime: Arc::new(Statistics::new()),
        }
    }

    fn procedures(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Statistics>>> {
        self.per_procedure.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn counter_for(&self, procedure: &str) -> Arc<Statistics> {
        let key = procedure.to_ascii_lowercase();
        Arc::clone(
            self.procedures()
                .entry(key)
                .or_insert_with(|| Arc::new(Statistics::new())),
        )
    }

    pub fn open_request(&self, procedure: &str, bytes_sent: u64) {
        if !self.enabled {
            return;
        }
        self.counter_for(procedure).open_request(bytes_sent);
        self.lifetime.open_request(bytes_sent);
    }

    pub fn close_request(
        &self,
        procedure: &str,
        execution_id: u64,
        duration_ms: i64,
        status: CallStatus,
        bytes_received: u64,
    ) {
        if !self.enabled {
            return;
        }
        self.counter_for(procedure)
            .close_request(execution_id, duration_ms, status, bytes_received);
        self.lifetime
            .close_request(execution_id, duration_ms, status, bytes_received);
    }

    pub fn note_discarded_bytes(&self, bytes_received: u64) {
        if !self.enabled {
            return;
        }
        self.lifetime.note_discarded_bytes(bytes_received);
    }

    /// Per-procedure snapshots keyed by the lower-cased procedure name.
    pub fn snapshot_procedures(&self) -> HashMap<String, StatisticsSnapshot> {
        self.procedures()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect()
    }

    pub fn snapshot_lifetime(&self) -> StatisticsSnapshot {
        self.lifetime.snapshot()
    }

    /// Reset the per-procedure counters. The lifetime counter is never
    /// cleared.
    pub fn reset(&self, ignore_pending: bool, watermark: u64) {
        for stats in self.procedures().values() {
            stats.reset(ignore_pending, watermark);
        }
    }

    /// Seal the per-procedure counters at connection close. The lifetime
    /// counter keeps accumulating across open/close cycles.
    pub fn seal(&self) {
        for stats in self.procedures().values() {
            stats.seal();
        }
    }
}
