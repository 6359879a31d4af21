use std::time::Duration;

use cubecache_service::caching::{
    PolarizationSelector, Requirements, RequirementsChange, SpectralConfig, StatsConfig,
};
use cubecache_service::compute::StatsType;
use cubecache_service::error::CubeError;
use cubecache_service::region::RegionMask;
use cubecache_service::source::MemorySource;
use cubecache_service::types::{DataKind, RegionId, SourceId};
use cubecache_test as test;

use crate::{
    assert_close, collect, gradient_source, next, setup_service, spectral, stats, wait_final,
    wait_idle,
};

const SOURCE: SourceId = SourceId(0);
const REGION: RegionId = RegionId(1);

fn spectral_requirements(stats: &[StatsType]) -> Requirements {
    Requirements::Spectral(vec![SpectralConfig {
        polarization: PolarizationSelector::Current,
        stats: stats.to_vec(),
    }])
}

fn stats_requirements(stats: &[StatsType]) -> Requirements {
    Requirements::Stats(vec![StatsConfig {
        polarization: PolarizationSelector::Current,
        stats: stats.to_vec(),
    }])
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_flight() {
    // one row of all four channels per slice, 64 slices
    let (service, opener) = setup_service(|config| config.compute.max_slice_pixels = 64);
    let source = gradient_source(&[16, 64, 4]).with_read_delay(Duration::from_millis(2));
    opener.insert("cube", source.clone());
    service.open_source(SOURCE, "cube".into()).unwrap();
    service
        .set_region(REGION, SOURCE, RegionMask::rect(0, 0, 16, 64))
        .unwrap();
    let key = service
        .aggregate_key(SOURCE, REGION, DataKind::SpectralSeries)
        .unwrap();
    let reads = source.reads();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.fill_aggregate(key).unwrap() })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().computing);
    }
    assert_eq!(service.running_jobs(), vec![key]);

    let fill = wait_final(&service, key).await;
    assert!(!fill.computing);
    assert_eq!(source.reads() - reads, 64);

    let profile = spectral(fill.payload.as_deref().unwrap());
    assert_eq!(
        profile.series(StatsType::Mean),
        vec![Some(322.5), Some(1322.5), Some(2322.5), Some(3322.5)]
    );

    // served from the cache from now on
    assert!(service.fill_aggregate(key).unwrap().is_final());
    assert_eq!(source.reads() - reads, 64);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscription_progress() {
    let (service, opener) = setup_service(|config| config.compute.max_slice_pixels = 24);
    opener.insert(
        "cube",
        gradient_source(&[8, 40, 3]).with_read_delay(Duration::from_millis(1)),
    );
    service.open_source(SOURCE, "cube".into()).unwrap();
    service
        .set_region(REGION, SOURCE, RegionMask::rect(0, 0, 8, 40))
        .unwrap();
    let key = service
        .aggregate_key(SOURCE, REGION, DataKind::SpectralSeries)
        .unwrap();

    let results = collect(service.subscribe(key).unwrap()).await;
    assert!(!results.is_empty());
    assert!(results.windows(2).all(|w| w[0].progress <= w[1].progress));
    let (last, partials) = results.split_last().unwrap();
    assert!(last.complete);
    assert_eq!(last.progress, 1.0);
    assert!(partials.iter().all(|p| !p.complete && p.progress < 1.0));

    // subscribing to a complete aggregate replays it
    let replay = collect(service.subscribe(key).unwrap()).await;
    assert_eq!(replay.len(), 1);
    assert!(replay[0].complete);
    assert_eq!(replay[0].payload, last.payload);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resume_after_requirements_change() {
    let dims = [16, 64, 4];
    let data = test::noisy_cube(&dims, 3, 7);
    let mask = RegionMask::rect(2, 3, 12, 60);

    // 12 pixels of 4 channels per row, one row per slice
    let (service, opener) = setup_service(|config| config.compute.max_slice_pixels = 64);
    let source = MemorySource::new(&dims, data.clone())
        .unwrap()
        .with_read_delay(Duration::from_millis(5));
    opener.insert("cube", source.clone());
    service.open_source(SOURCE, "cube".into()).unwrap();
    service.set_region(REGION, SOURCE, mask.clone()).unwrap();
    service
        .set_requirements(SOURCE, REGION, spectral_requirements(&[StatsType::Mean]))
        .unwrap();
    let key = service
        .aggregate_key(SOURCE, REGION, DataKind::SpectralSeries)
        .unwrap();

    let mut stream = service.subscribe(key).unwrap();
    assert!(!next(&mut stream).await.unwrap().complete);
    let change = service
        .set_requirements(
            SOURCE,
            REGION,
            spectral_requirements(&[StatsType::Mean, StatsType::Sum]),
        )
        .unwrap();
    assert_eq!(change, RequirementsChange::Replaced);

    // the cancelled computation ends the stream without a final result
    assert!(collect(stream).await.iter().all(|p| !p.complete));
    wait_idle(&service).await;
    let suspended = service.computer().resumable(SOURCE, REGION, 0).unwrap();
    assert!(suspended > 0 && suspended < 60);

    let reads = source.reads();
    let resumed = wait_final(&service, key).await;
    assert_eq!(source.reads() - reads, 60 - suspended);
    let resumed = spectral(resumed.payload.as_deref().unwrap());

    // a single pass with a different slicing yields the same profile
    let (fresh, opener) = setup_service(|config| config.compute.max_slice_pixels = 64 * 7);
    opener.insert("cube", MemorySource::new(&dims, data).unwrap());
    fresh.open_source(SOURCE, "cube".into()).unwrap();
    fresh.set_region(REGION, SOURCE, mask).unwrap();
    let expected = wait_final(&fresh, key).await;
    let expected = spectral(expected.payload.as_deref().unwrap());

    assert_eq!(resumed.channels.len(), 4);
    for (actual, expected) in resumed.channels.iter().zip(&expected.channels) {
        assert_eq!(actual.count, expected.count);
        assert_eq!(actual.nan_count, expected.nan_count);
        assert_close(actual.sum, expected.sum);
        assert_close(actual.mean, expected.mean);
        assert_close(actual.rms, expected.rms);
        assert_close(actual.sigma, expected.sigma);
        assert_eq!(actual.min, expected.min);
        assert_eq!(actual.max, expected.max);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_by_region_change() {
    // one row of both channels per slice, 1000 slices
    let (service, opener) = setup_service(|config| config.compute.max_slice_pixels = 16);
    let source = gradient_source(&[8, 1000, 2]).with_read_delay(Duration::from_millis(20));
    opener.insert("cube", source.clone());
    service.open_source(SOURCE, "cube".into()).unwrap();
    service
        .set_region(REGION, SOURCE, RegionMask::rect(0, 0, 8, 1000))
        .unwrap();
    let key = service
        .aggregate_key(SOURCE, REGION, DataKind::SpectralSeries)
        .unwrap();
    let reads = source.reads();

    let mut stream = service.subscribe(key).unwrap();
    let mut progress = 0.0;
    while progress < 10.0 / 1000.0 {
        progress = next(&mut stream).await.unwrap().progress;
    }
    assert!(
        service
            .set_region(REGION, SOURCE, RegionMask::rect(0, 0, 8, 999))
            .unwrap()
    );

    assert!(collect(stream).await.iter().all(|p| !p.complete));
    wait_idle(&service).await;
    let reads = source.reads() - reads;
    assert!(reads <= 12, "read {reads} slices");

    // the partial result stays, but does not belong to the new region definition
    let stored = service.aggregates().peek(&key).unwrap();
    assert!(!stored.complete);
    assert!(stored.progress >= 0.01 && stored.progress < 0.0125);
    assert!(service.aggregates().lookup(&key).is_none());
    assert_eq!(service.computer().resumable(SOURCE, REGION, 0), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscribe_after_region_change() {
    // one row of both channels per slice
    let (service, opener) = setup_service(|config| config.compute.max_slice_pixels = 16);
    let source = gradient_source(&[8, 200, 2]).with_read_delay(Duration::from_millis(5));
    opener.insert("cube", source.clone());
    service.open_source(SOURCE, "cube".into()).unwrap();
    service
        .set_region(REGION, SOURCE, RegionMask::rect(0, 0, 8, 200))
        .unwrap();
    let key = service
        .aggregate_key(SOURCE, REGION, DataKind::SpectralSeries)
        .unwrap();

    let mut stream = service.subscribe(key).unwrap();
    assert!(!next(&mut stream).await.unwrap().complete);
    assert!(
        service
            .set_region(REGION, SOURCE, RegionMask::rect(0, 0, 8, 4))
            .unwrap()
    );

    // subscribing right away waits for the computation of the new definition
    let results = collect(service.subscribe(key).unwrap()).await;
    let last = results.last().expect("no result for the redefined region");
    assert!(last.complete);
    assert_eq!(last.progress, 1.0);
    let profile = spectral(&last.payload);
    assert_eq!(profile.channels[0].count, 32);
    assert_eq!(
        profile.series(StatsType::Mean),
        vec![Some(18.5), Some(1018.5)]
    );

    // the stream of the old definition ended without a final result
    assert!(collect(stream).await.iter().all(|p| !p.complete));
    wait_idle(&service).await;
    assert!(service.aggregates().lookup(&key).unwrap().complete);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stats_requirements_keep_last_payload() {
    let (service, opener) = setup_service(|_| {});
    opener.insert("cube", gradient_source(&[8, 8, 2]));
    service.open_source(SOURCE, "cube".into()).unwrap();
    service
        .set_region(REGION, SOURCE, RegionMask::rect(0, 0, 4, 4))
        .unwrap();
    service
        .set_requirements(SOURCE, REGION, stats_requirements(&[StatsType::Mean]))
        .unwrap();
    let key = service.aggregate_key(SOURCE, REGION, DataKind::Stats).unwrap();
    let first = wait_final(&service, key).await.payload.unwrap();
    assert_eq!(stats(&first).sum, Some(264.0));

    let change = service
        .set_requirements(
            SOURCE,
            REGION,
            stats_requirements(&[StatsType::Mean, StatsType::Sum]),
        )
        .unwrap();
    assert_eq!(change, RequirementsChange::Replaced);

    // answered right away with the previous payload
    let fill = service.fill_aggregate(key).unwrap();
    assert!(fill.stale);
    assert!(fill.computing);
    assert_eq!(fill.payload, Some(first));

    let change = service
        .set_requirements(SOURCE, REGION, stats_requirements(&[StatsType::Sum]))
        .unwrap();
    assert_eq!(change, RequirementsChange::Replaced);
    let stored = service.aggregates().peek(&key).unwrap();
    assert!(stored.invalidated);

    let fill = wait_final(&service, key).await;
    assert_eq!(stats(fill.payload.as_deref().unwrap()).sum, Some(264.0));

    let change = service
        .set_requirements(SOURCE, REGION, Requirements::Stats(vec![]))
        .unwrap();
    assert_eq!(change, RequirementsChange::Cleared);
    assert!(service.aggregates().peek(&key).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown() {
    let (service, opener) = setup_service(|config| config.compute.max_slice_pixels = 16);
    opener.insert(
        "cube",
        gradient_source(&[8, 200, 2]).with_read_delay(Duration::from_millis(10)),
    );
    service.open_source(SOURCE, "cube".into()).unwrap();
    service
        .set_region(REGION, SOURCE, RegionMask::rect(0, 0, 8, 200))
        .unwrap();
    let key = service
        .aggregate_key(SOURCE, REGION, DataKind::SpectralSeries)
        .unwrap();

    let mut stream = service.subscribe(key).unwrap();
    next(&mut stream).await.unwrap();

    assert!(service.shutdown().await);
    assert!(service.running_jobs().is_empty());
    assert!(collect(stream).await.iter().all(|p| !p.complete));

    // the progress is kept, new work is refused
    assert!(service.computer().resumable(SOURCE, REGION, 0).is_some());
    assert!(matches!(
        service.fill_aggregate(key),
        Err(CubeError::ShuttingDown)
    ));
    assert!(matches!(
        service.open_source(SourceId(1), "cube".into()),
        Err(CubeError::ShuttingDown)
    ));
}
