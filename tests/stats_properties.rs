//! Property tests for statistics aggregation: summarize must be associative
//! and commutative over well-formed snapshots.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use pulse_client::stats::{summarize, StatisticsSnapshot, LATENCY_BUCKETS};

/// Build an internally-consistent snapshot from a latency sample and status
/// split, the way the live counters would have produced it.
fn snapshot_from(
    start_offset_secs: i64,
    end_offset_secs: Option<i64>,
    latencies: Vec<u64>,
    failures: usize,
    timeouts: usize,
    aborts: usize,
    extra_requests: u64,
    bytes_per_response: u64,
) -> StatisticsSnapshot {
    let response_count = latencies.len() as u64;
    let mut buckets = [0u64; LATENCY_BUCKETS];
    for &latency in &latencies {
        buckets[((latency / 25) as usize).min(LATENCY_BUCKETS - 1)] += 1;
    }
    let error_total = (failures + timeouts + aborts).min(latencies.len());
    StatisticsSnapshot {
        start_tick: Utc.timestamp_opt(1_700_000_000 + start_offset_secs, 0).unwrap(),
        end_tick: end_offset_secs
            .map(|o| Utc.timestamp_opt(1_700_100_000 + o, 0).unwrap()),
        request_count: response_count + extra_requests,
        response_count,
        failure_count: failures.min(error_total) as u64,
        timeout_count: timeouts.min(error_total.saturating_sub(failures)) as u64,
        abort_count: aborts.min(error_total.saturating_sub(failures + timeouts)) as u64,
        min_latency_ms: latencies.iter().copied().min().unwrap_or(0),
        max_latency_ms: latencies.iter().copied().max().unwrap_or(0),
        total_latency_ms: latencies.iter().sum(),
        latency_buckets: buckets,
        bytes_sent: response_count * 32,
        bytes_received: response_count * bytes_per_response,
    }
}

fn arb_snapshot() -> impl Strategy<Value = StatisticsSnapshot> {
    (
        0i64..10_000,
        proptest::option::of(0i64..10_000),
        proptest::collection::vec(0u64..400, 0..50),
        0usize..10,
        0usize..10,
        0usize..10,
        0u64..20,
        1u64..512,
    )
        .prop_map(
            |(start, end, latencies, failures, timeouts, aborts, extra, bytes)| {
                snapshot_from(start, end, latencies, failures, timeouts, aborts, extra, bytes)
            },
        )
}

proptest! {
    #[test]
    fn summarize_is_associative(
        a in arb_snapshot(),
        b in arb_snapshot(),
        c in arb_snapshot(),
    ) {
        let flat = summarize([a.clone(), b.clone(), c.clone()]).unwrap();
        let left = summarize([
            summarize([a.clone(), b.clone()]).unwrap(),
            c.clone(),
        ]).unwrap();
        let right = summarize([
            a,
            summarize([b, c]).unwrap(),
        ]).unwrap();
        prop_assert_eq!(&flat, &left);
        prop_assert_eq!(&flat, &right);
    }

    #[test]
    fn summarize_is_commutative(
        a in arb_snapshot(),
        b in arb_snapshot(),
        c in arb_snapshot(),
    ) {
        let forward = summarize([a.clone(), b.clone(), c.clone()]).unwrap();
        let rotated = summarize([b.clone(), c.clone(), a.clone()]).unwrap();
        let swapped = summarize([c, a, b]).unwrap();
        prop_assert_eq!(&forward, &rotated);
        prop_assert_eq!(&forward, &swapped);
    }

    #[test]
    fn summarize_preserves_counter_identities(
        snapshots in proptest::collection::vec(arb_snapshot(), 1..6),
    ) {
        let expected_requests: u64 = snapshots.iter().map(|s| s.request_count).sum();
        let expected_responses: u64 = snapshots.iter().map(|s| s.response_count).sum();
        let merged = summarize(snapshots).unwrap();
        prop_assert_eq!(merged.request_count, expected_requests);
        prop_assert_eq!(merged.response_count, expected_responses);
        prop_assert!(merged.request_count >= merged.response_count);
        let errors = merged.failure_count + merged.timeout_count + merged.abort_count;
        prop_assert_eq!(merged.success_count(), merged.response_count - errors);
        if merged.response_count > 0 {
            prop_assert!(merged.min_latency_ms <= merged.max_latency_ms);
            prop_assert!(merged.min_latency_ms <= merged.average_latency_ms());
            prop_assert!(merged.average_latency_ms() <= merged.max_latency_ms);
        }
        let bucket_total: u64 = merged.latency_buckets.iter().sum();
        prop_assert_eq!(bucket_total, merged.response_count);
    }
}
