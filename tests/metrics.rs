#![cfg(feature = "metrics")]
//! Tests for `wireproxy` metrics helpers.
//!
//! Counters and gauges are checked with
//! `metrics_util::debugging::DebuggingRecorder`.
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use rstest::rstest;
use wireproxy::{
    Connection,
    ProxyConfig,
    metrics::{self as proxy_metrics, ExchangeOutcome, SessionKind},
};
use wireproxy_testing::MockPeer;

fn debugging_recorder_setup() -> (Snapshotter, DebuggingRecorder) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    (snapshotter, recorder)
}

fn counter(snapshotter: &Snapshotter, name: &str, label: Option<(&str, &str)>) -> u64 {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(key, _, _, _)| {
            key.key().name() == name
                && label.is_none_or(|(label_key, label_value)| {
                    key.key()
                        .labels()
                        .any(|l| l.key() == label_key && l.value() == label_value)
                })
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(count) => count,
            _ => 0,
        })
        .sum()
}

fn gauge(snapshotter: &Snapshotter, name: &str, label: Option<(&str, &str)>) -> f64 {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .find(|(key, _, _, _)| {
            key.key().name() == name
                && label.is_none_or(|(label_key, label_value)| {
                    key.key()
                        .labels()
                        .any(|l| l.key() == label_key && l.value() == label_value)
                })
        })
        .map_or(0.0, |(_, _, _, value)| match value {
            DebugValue::Gauge(level) => level.into_inner(),
            _ => 0.0,
        })
}

#[rstest]
#[case(ExchangeOutcome::Replied, "replied")]
#[case(ExchangeOutcome::Failed, "failed")]
fn exchange_outcome_is_labelled(#[case] outcome: ExchangeOutcome, #[case] label: &str) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || proxy_metrics::inc_exchanges(outcome));

    assert_eq!(
        counter(&snapshotter, proxy_metrics::EXCHANGES_TOTAL, Some(("outcome", label))),
        1
    );
}

#[test]
fn session_gauge_rises_and_falls_per_kind() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        proxy_metrics::inc_sessions(SessionKind::Browser);
        proxy_metrics::inc_sessions(SessionKind::Browser);
        proxy_metrics::dec_sessions(SessionKind::Browser);
    });

    let open = gauge(&snapshotter, proxy_metrics::SESSIONS_OPEN, Some(("kind", "browser")));
    assert!((open - 1.0).abs() < f64::EPSILON);
}

#[rstest]
#[case(2)]
#[case(5)]
fn chunk_counter_counts_each_chunk(#[case] chunks: u64) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        (0..chunks).for_each(|_| proxy_metrics::inc_chunks_sent());
    });

    assert_eq!(counter(&snapshotter, proxy_metrics::CHUNKS_SENT_TOTAL, None), chunks);
}

#[test]
fn clone_cache_activity_is_recorded_by_connections() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let _guard = metrics::set_default_local_recorder(&recorder);

    runtime.block_on(async {
        let peer = MockPeer::at_level(9);
        let parent = Connection::builder(peer.conversation())
            .config(ProxyConfig::default())
            .connect()
            .await
            .expect("connect");
        let clone = parent.clone_connection().await.expect("clone");
        clone.close(false).await.expect("close clone");
        let reused = parent.clone_connection().await.expect("clone from cache");
        reused.close(false).await.expect("close reused clone");
        parent.close(false).await.expect("close parent");
    });

    let cache = |label: &str| {
        counter(&snapshotter, proxy_metrics::CLONE_CACHE_TOTAL, Some(("result", label)))
    };
    assert_eq!(cache("miss"), 1);
    assert_eq!(cache("hit"), 1);
    assert_eq!(cache("cached"), 2);
    assert_eq!(cache("destroyed"), 1);
    let replied = counter(&snapshotter, proxy_metrics::EXCHANGES_TOTAL, Some(("outcome", "replied")));
    assert!(replied >= 3);
    let open = gauge(&snapshotter, proxy_metrics::CONNECTIONS_OPEN, None);
    assert!(open.abs() < f64::EPSILON);
}
