use cubecache_service::caching::{AggregatePayload, ChannelSelector, HistogramConfig, Requirements};
use cubecache_service::error::CubeError;
use cubecache_service::region::RegionMask;
use cubecache_service::tile::Tile;
use cubecache_service::types::{DataKind, RegionId, SourceId, SourceKey};

use crate::{gradient_source, setup_service, stats, wait_final};

const SOURCE: SourceId = SourceId(0);

#[tokio::test(flavor = "multi_thread")]
async fn test_source_handles_lru() {
    let (service, opener) = setup_service(|config| config.caches.source_handles = 2);
    for name in ["a", "b", "c"] {
        opener.insert(name, gradient_source(&[4, 4]));
    }

    service.open_source(SourceId(0), "a".into()).unwrap();
    service.open_source(SourceId(1), "b".into()).unwrap();
    // reading a tile touches the handle of `a`, leaving `b` least recently used
    service.tile(SourceId(0), Tile::new(0, 0, 0), 0, 0).unwrap();
    service.open_source(SourceId(2), "c".into()).unwrap();

    assert_eq!(
        service.handles().keys(),
        vec![SourceKey::from("c"), SourceKey::from("a")]
    );
    assert_eq!(opener.opens(), 3);

    // the evicted source is opened again on demand, evicting `a` in turn
    let key = service
        .aggregate_key(SourceId(1), RegionId::IMAGE, DataKind::Stats)
        .unwrap();
    wait_final(&service, key).await;
    assert_eq!(opener.opens(), 4);
    assert_eq!(
        service.handles().keys(),
        vec![SourceKey::from("b"), SourceKey::from("c")]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_changed_source_is_recomputed() {
    let (service, opener) = setup_service(|_| {});
    let source = gradient_source(&[8, 8, 2]);
    opener.insert("cube", source.clone());
    service.open_source(SOURCE, "cube".into()).unwrap();

    let key = service
        .aggregate_key(SOURCE, RegionId::IMAGE, DataKind::Stats)
        .unwrap();
    let fill = wait_final(&service, key).await;
    assert_eq!(stats(fill.payload.as_deref().unwrap()).sum, Some(2464.0));

    source.set_data(vec![1.0; 128]).unwrap();

    // the old payload is still served, but marked for recomputation
    let fill = service.fill_aggregate(key).unwrap();
    assert!(fill.stale);
    assert!(fill.computing);
    assert_eq!(stats(fill.payload.as_deref().unwrap()).sum, Some(2464.0));
    assert_eq!(opener.opens(), 2);

    let fill = wait_final(&service, key).await;
    assert_eq!(stats(fill.payload.as_deref().unwrap()).sum, Some(64.0));
    assert_eq!(opener.opens(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tiles() {
    let (service, opener) = setup_service(|_| {});
    let source = gradient_source(&[300, 300, 2]);
    opener.insert("cube", source.clone());
    service.open_source(SOURCE, "cube".into()).unwrap();
    let reads = source.reads();

    let tile = service.tile(SOURCE, Tile::new(1, 1, 1), 1, 0).unwrap();
    assert_eq!((tile.width, tile.height), (44, 44));
    assert_eq!(tile.pixels.len(), 44 * 44);
    assert_eq!(tile.pixels[0], (256 + 2560 + 1000) as f32);

    // the other tiles of the chunk came with the same read
    for (x, y) in [(0, 0), (1, 0), (0, 1)] {
        let tile = service.tile(SOURCE, Tile::new(x, y, 1), 1, 0).unwrap();
        assert_eq!(tile.pixels[0], (256 * x + 2560 * y + 1000) as f32);
    }
    assert_eq!(source.reads() - reads, 1);

    // only full resolution tiles are served
    assert!(matches!(
        service.tile(SOURCE, Tile::new(0, 0, 0), 1, 0),
        Err(CubeError::InvalidRange(_))
    ));
    assert!(matches!(
        service.tile(SOURCE, Tile::new(2, 0, 1), 1, 0),
        Err(CubeError::InvalidRange(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_precomputed_stats() {
    let (service, opener) = setup_service(|_| {});
    opener.insert("cube", gradient_source(&[8, 8, 2]).with_precomputed_stats());
    service.open_source(SOURCE, "cube".into()).unwrap();

    let key = service
        .aggregate_key(SOURCE, RegionId::IMAGE, DataKind::Stats)
        .unwrap();
    let fill = service.fill_aggregate(key).unwrap();
    assert!(fill.is_final());
    assert!(!fill.computing);
    assert_eq!(stats(fill.payload.as_deref().unwrap()).sum, Some(2464.0));

    service
        .set_requirements(
            SOURCE,
            RegionId::CUBE,
            Requirements::Histogram(vec![HistogramConfig {
                channel: ChannelSelector::All,
                num_bins: 4,
            }]),
        )
        .unwrap();
    let key = service
        .aggregate_key(SOURCE, RegionId::CUBE, DataKind::Histogram)
        .unwrap();
    let fill = service.fill_aggregate(key).unwrap();
    assert!(fill.is_final());
    match fill.payload.as_deref().unwrap() {
        AggregatePayload::Histogram(set) => {
            assert_eq!(set.stats.count, 128);
            assert_eq!(set.histograms.len(), 1);
            assert_eq!(set.get(4).unwrap().total(), 128);
        }
        other => panic!("expected a histogram, got {other:?}"),
    }
    assert!(service.running_jobs().is_empty());

    // regions drawn by the client are always computed
    service
        .set_region(RegionId(1), SOURCE, RegionMask::rect(0, 0, 2, 2))
        .unwrap();
    let key = service
        .aggregate_key(SOURCE, RegionId(1), DataKind::Stats)
        .unwrap();
    let fill = service.fill_aggregate(key).unwrap();
    assert!(fill.computing);
    assert!(fill.payload.is_none());
    let fill = wait_final(&service, key).await;
    assert_eq!(stats(fill.payload.as_deref().unwrap()).sum, Some(22.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_ids() {
    let (service, opener) = setup_service(|_| {});
    opener.insert("cube", gradient_source(&[8, 8]));
    service.open_source(SOURCE, "cube".into()).unwrap();

    assert!(matches!(
        service.aggregate_key(SourceId(7), RegionId::IMAGE, DataKind::Stats),
        Err(CubeError::UnknownSource(SourceId(7)))
    ));
    let key = service
        .aggregate_key(SOURCE, RegionId(3), DataKind::Stats)
        .unwrap();
    assert!(matches!(
        service.fill_aggregate(key),
        Err(CubeError::UnknownRegion(RegionId(3)))
    ));
    assert!(matches!(
        service.set_region(RegionId::IMAGE, SOURCE, RegionMask::point(1, 1)),
        Err(CubeError::InvalidRange(_))
    ));
    assert!(matches!(
        service.set_region(RegionId(3), SOURCE, RegionMask::rect(4, 4, 8, 8)),
        Err(CubeError::InvalidRange(_))
    ));

    assert!(service.close_source(SOURCE));
    assert!(!service.close_source(SOURCE));
    assert!(service.handles().is_empty());
}
