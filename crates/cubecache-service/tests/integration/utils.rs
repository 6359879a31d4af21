use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::channel::mpsc;

use cubecache_service::caching::{AggregatePayload, SpectralProfile};
use cubecache_service::compute::{PartialResult, StatsSummary};
use cubecache_service::config::Config;
use cubecache_service::services::{CubeService, Fill};
use cubecache_service::source::{MemoryOpener, MemorySource};
use cubecache_service::types::AggregateKey;
use cubecache_test as test;

/// Setup tests and create a test service reading from in-memory sources.
///
/// The `update_config` closure can modify any default configuration if needed before the
/// service is created. Sources are registered with the returned opener.
pub fn setup_service(update_config: impl FnOnce(&mut Config)) -> (CubeService, Arc<MemoryOpener>) {
    test::setup();

    let mut config = Config::default();
    update_config(&mut config);

    let opener = Arc::new(MemoryOpener::new());
    let handle = tokio::runtime::Handle::current();
    let service = CubeService::new(&config, opener.clone(), handle);

    (service, opener)
}

/// Creates a source holding a [`gradient_cube`](test::gradient_cube).
pub fn gradient_source(dims: &[usize]) -> MemorySource {
    MemorySource::new(dims, test::gradient_cube(dims)).unwrap()
}

/// Polls `key` until its aggregate is complete and up to date.
pub async fn wait_final(service: &CubeService, key: AggregateKey) -> Fill {
    let poll = async {
        loop {
            let fill = service.fill_aggregate(key).unwrap();
            if fill.is_final() {
                return fill;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(30), poll)
        .await
        .expect("aggregate was not computed in time")
}

/// Waits for the next result of a subscription.
pub async fn next(stream: &mut mpsc::UnboundedReceiver<PartialResult>) -> Option<PartialResult> {
    tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .expect("no result in time")
}

/// Collects the remaining results of a subscription.
pub async fn collect(stream: mpsc::UnboundedReceiver<PartialResult>) -> Vec<PartialResult> {
    tokio::time::timeout(Duration::from_secs(30), stream.collect())
        .await
        .expect("subscription did not end in time")
}

/// Waits until no job is in flight anymore.
pub async fn wait_idle(service: &CubeService) {
    let poll = async {
        while !service.running_jobs().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(30), poll)
        .await
        .expect("jobs did not finish in time")
}

#[track_caller]
pub fn stats(payload: &AggregatePayload) -> StatsSummary {
    match payload {
        AggregatePayload::Stats(stats) => *stats,
        other => panic!("expected statistics, got {other:?}"),
    }
}

#[track_caller]
pub fn spectral(payload: &AggregatePayload) -> SpectralProfile {
    match payload {
        AggregatePayload::Spectral(profile) => profile.clone(),
        other => panic!("expected a spectral profile, got {other:?}"),
    }
}

#[track_caller]
pub fn assert_close(actual: Option<f64>, expected: Option<f64>) {
    match (actual, expected) {
        (Some(a), Some(e)) => assert!(
            (a - e).abs() <= 1e-5 * a.abs().max(e.abs()).max(1e-12),
            "{a} != {e}"
        ),
        (a, e) => assert_eq!(a, e),
    }
}
