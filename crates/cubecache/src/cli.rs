//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;

use cubecache_service::caching::{ChannelSelector, HistogramConfig, Requirements};
use cubecache_service::compute::AUTO_BINS;
use cubecache_service::config::Config;
use cubecache_service::metrics;
use cubecache_service::region::RegionMask;
use cubecache_service::services::CubeService;
use cubecache_service::source::{CubeShape, RawFileOpener};
use cubecache_service::types::{ChannelOrAll, DataKind, RegionId, SourceId, SourceKey};

use crate::logging;
use crate::output::{self, OutputFormat, Report};

const SOURCE: SourceId = SourceId(0);
const REGION: RegionId = RegionId(1);

/// Computes statistics, spectral profiles and histograms of data cubes.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// How to print the result.
    #[arg(long, short, global = true, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

/// CubeCache commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Print the shape of a cube.
    Info {
        /// The raw cube file.
        path: PathBuf,
    },

    /// Compute statistics of a region of one channel.
    Stats(RegionArgs),

    /// Compute statistics of a region for every channel.
    Spectrum(RegionArgs),

    /// Compute a histogram of a region.
    Histogram(HistogramArgs),
}

#[derive(Args, Debug)]
struct RegionArgs {
    /// The raw cube file.
    path: PathBuf,

    /// The rectangle `x,y,width,height` to reduce. Defaults to the whole image.
    #[arg(long, value_parser = parse_rect)]
    region: Option<Rect>,

    /// The channel to reduce.
    #[arg(long, default_value_t = 0)]
    channel: u32,

    /// The polarization to reduce.
    #[arg(long, default_value_t = 0)]
    polarization: u32,

    /// Report partial results on stderr while computing.
    #[arg(long)]
    progress: bool,
}

#[derive(Args, Debug)]
struct HistogramArgs {
    #[command(flatten)]
    region: RegionArgs,

    /// The number of bins. Sized by the region when omitted.
    #[arg(long)]
    bins: Option<u32>,

    /// Bin every channel instead of the selected one.
    #[arg(long)]
    cube: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Rect {
    x: usize,
    y: usize,
    width: usize,
    height: usize,
}

fn parse_rect(value: &str) -> Result<Rect, String> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| format!("invalid rectangle {value:?}: {err}"))?;
    match parts[..] {
        [x, y, width, height] if width > 0 && height > 0 => Ok(Rect {
            x,
            y,
            width,
            height,
        }),
        _ => Err(format!(
            "invalid rectangle {value:?}, expected `x,y,width,height` with a positive size"
        )),
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime was not started yet, so this is still single-threaded.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("cubecache-worker")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;
    let report = runtime.block_on(run(&config, cli.command))?;

    output::print(&report, cli.format)
}

async fn run(config: &Config, command: Command) -> Result<Report> {
    let service = CubeService::new(
        config,
        Arc::new(RawFileOpener),
        tokio::runtime::Handle::current(),
    );

    let report = match command {
        Command::Info { path } => {
            let shape = open(&service, &path)?;
            Ok(Report::info(path, shape))
        }
        Command::Stats(args) => compute(&service, args, DataKind::Stats, None).await,
        Command::Spectrum(args) => compute(&service, args, DataKind::SpectralSeries, None).await,
        Command::Histogram(args) => {
            let histogram = Some((args.bins, args.cube));
            compute(&service, args.region, DataKind::Histogram, histogram).await
        }
    };

    service.shutdown().await;
    report
}

fn open(service: &CubeService, path: &Path) -> Result<CubeShape> {
    let key = SourceKey::new(&path.to_string_lossy(), None);
    service
        .open_source(SOURCE, key)
        .with_context(|| format!("failed to open {}", path.display()))
}

async fn compute(
    service: &CubeService,
    args: RegionArgs,
    kind: DataKind,
    histogram: Option<(Option<u32>, bool)>,
) -> Result<Report> {
    let shape = open(service, &args.path)?;
    service
        .set_image_channel(SOURCE, args.channel, args.polarization)
        .context("invalid channel selection")?;

    let mut region = match args.region {
        Some(Rect {
            x,
            y,
            width,
            height,
        }) => {
            let mask = RegionMask::rect(x, y, width, height);
            service
                .set_region(REGION, SOURCE, mask)
                .context("invalid region")?;
            REGION
        }
        None => RegionId::IMAGE,
    };

    let mut whole_cube = false;
    if let Some((bins, cube)) = histogram {
        whole_cube = cube;
        if cube && region == RegionId::IMAGE {
            region = RegionId::CUBE;
        }
        let config = HistogramConfig {
            channel: if cube {
                ChannelSelector::All
            } else {
                ChannelSelector::Current
            },
            num_bins: bins.map_or(AUTO_BINS, |bins| bins as i32),
        };
        service.set_requirements(SOURCE, region, Requirements::Histogram(vec![config]))?;
    }

    let mut key = service.aggregate_key(SOURCE, region, kind)?;
    if whole_cube {
        key.channel = ChannelOrAll::All;
    }
    tracing::info!(%key, "computing");
    let started = Instant::now();

    let mut results = service.subscribe(key)?;
    let mut last = None;
    while let Some(partial) = results.next().await {
        if args.progress {
            output::print_progress(&partial);
        }
        last = Some(partial);
    }

    match last {
        Some(result) if result.complete => {
            let elapsed = humantime::format_duration(started.elapsed());
            tracing::info!(%key, %elapsed, "computed");
            Ok(Report::aggregate(args.path, shape, key, result.payload))
        }
        _ => bail!("computing {key} did not complete"),
    }
}

#[cfg(test)]
mod tests {
    use cubecache_service::caching::AggregatePayload;
    use cubecache_service::compute::StatsType;
    use cubecache_service::source::RawFileSource;
    use cubecache_test as test_utils;

    use super::*;

    fn write_cube(dir: &Path, dims: &[usize]) -> PathBuf {
        let path = dir.join("cube.raw");
        RawFileSource::write(&path, dims, &test_utils::gradient_cube(dims), None).unwrap();
        path
    }

    fn region_args(path: PathBuf, region: Option<Rect>) -> RegionArgs {
        RegionArgs {
            path,
            region,
            channel: 1,
            polarization: 0,
            progress: false,
        }
    }

    #[test]
    fn test_parse_rect() {
        assert_eq!(
            parse_rect("1, 2,3,4"),
            Ok(Rect {
                x: 1,
                y: 2,
                width: 3,
                height: 4
            })
        );
        assert!(parse_rect("1,2,3").is_err());
        assert!(parse_rect("1,2,0,4").is_err());
        assert!(parse_rect("a,b,c,d").is_err());
    }

    #[test]
    fn test_parse_cli() {
        let cli = Cli::try_parse_from([
            "cubecache",
            "histogram",
            "cube.raw",
            "--region",
            "0,0,2,2",
            "--bins",
            "16",
            "--cube",
            "--format",
            "table",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Table);
        let Command::Histogram(args) = cli.command else {
            panic!("expected the histogram command");
        };
        assert_eq!(args.bins, Some(16));
        assert!(args.cube);
        assert_eq!(args.region.channel, 0);

        assert!(Cli::try_parse_from(["cubecache", "stats", "cube.raw", "--region", "1,2"]).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stats() {
        test_utils::setup();
        let dir = test_utils::tempdir();
        let path = write_cube(dir.path(), &[8, 8, 2]);

        let command = Command::Stats(region_args(path, None));
        let report = run(&Config::default(), command).await.unwrap();
        assert_eq!(report.shape, vec![8, 8, 2]);
        match report.result.as_deref() {
            // 64 pixels of 1000 plus the channel 0 gradient
            Some(AggregatePayload::Stats(stats)) => assert_eq!(stats.sum, Some(66464.0)),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_spectrum() {
        test_utils::setup();
        let dir = test_utils::tempdir();
        let path = write_cube(dir.path(), &[8, 8, 2]);

        let rect = Rect {
            x: 2,
            y: 2,
            width: 2,
            height: 2,
        };
        let command = Command::Spectrum(region_args(path, Some(rect)));
        let report = run(&Config::default(), command).await.unwrap();
        match report.result.as_deref() {
            Some(AggregatePayload::Spectral(profile)) => assert_eq!(
                profile.series(StatsType::Mean),
                vec![Some(27.5), Some(1027.5)]
            ),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cube_histogram() {
        test_utils::setup();
        let dir = test_utils::tempdir();
        let path = write_cube(dir.path(), &[8, 8, 2]);

        let command = Command::Histogram(HistogramArgs {
            region: region_args(path, None),
            bins: Some(4),
            cube: true,
        });
        let report = run(&Config::default(), command).await.unwrap();
        match report.result.as_deref() {
            Some(AggregatePayload::Histogram(set)) => {
                assert_eq!(set.stats.count, 128);
                assert_eq!(set.get(4).unwrap().total(), 128);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_file() {
        test_utils::setup();
        let dir = test_utils::tempdir();
        let command = Command::Info {
            path: dir.path().join("missing.raw"),
        };
        assert!(run(&Config::default(), command).await.is_err());
    }
}
