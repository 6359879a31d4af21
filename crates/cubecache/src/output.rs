use std::path::PathBuf;
use std::sync::Arc;

use clap::ValueEnum;
use console::style;
use prettytable::format::consts::FORMAT_CLEAN;
use prettytable::{Cell, Table, row};
use serde::Serialize;

use cubecache_service::caching::AggregatePayload;
use cubecache_service::compute::{PartialResult, StatsSummary, StatsType};
use cubecache_service::source::CubeShape;
use cubecache_service::types::AggregateKey;

/// The statistics shown per channel of a spectral profile.
const SPECTRAL_COLUMNS: [StatsType; 5] = [
    StatsType::NumPixels,
    StatsType::Mean,
    StatsType::Sigma,
    StatsType::Min,
    StatsType::Max,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Outputs the entire result as JSON.
    Json,
    /// Outputs the result as a table.
    Table,
}

/// What a command produced.
#[derive(Debug, Serialize)]
pub struct Report {
    pub path: PathBuf,
    pub shape: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Arc<AggregatePayload>>,
}

impl Report {
    pub fn info(path: PathBuf, shape: CubeShape) -> Self {
        Self {
            path,
            shape: shape.dims(),
            key: None,
            result: None,
        }
    }

    pub fn aggregate(path: PathBuf, shape: CubeShape, key: AggregateKey, payload: Arc<AggregatePayload>) -> Self {
        Self {
            path,
            shape: shape.dims(),
            key: Some(key.to_string()),
            result: Some(payload),
        }
    }
}

pub fn print(report: &Report, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Table => print!("{}", render_table(report)),
    }
    Ok(())
}

/// Reports the progress of a running computation on `stderr`.
pub fn print_progress(partial: &PartialResult) {
    let percent = format!("{:>5.1}%", partial.progress * 100.0);
    if partial.complete {
        eprintln!("{} {}", style(partial.key).dim(), style(percent).green());
    } else {
        eprintln!("{} {}", style(partial.key).dim(), style(percent).yellow());
    }
}

pub fn render_table(report: &Report) -> String {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);

    match report.result.as_deref() {
        None => {
            table.add_row(row!["path", report.path.display()]);
            let shape: Vec<_> = report.shape.iter().map(ToString::to_string).collect();
            table.add_row(row!["shape", shape.join(" x ")]);
        }
        Some(AggregatePayload::Stats(stats)) => stats_rows(&mut table, stats),
        Some(AggregatePayload::Spectral(profile)) => {
            let mut titles = row!["channel"];
            for stat in SPECTRAL_COLUMNS {
                titles.add_cell(Cell::new(stat_name(stat)));
            }
            table.set_titles(titles);
            for (channel, stats) in profile.channels.iter().enumerate() {
                let mut cells = row![channel];
                for stat in SPECTRAL_COLUMNS {
                    cells.add_cell(Cell::new(&value(stats.get(stat))));
                }
                table.add_row(cells);
            }
        }
        Some(AggregatePayload::Histogram(set)) => {
            stats_rows(&mut table, &set.stats);
            for histogram in &set.histograms {
                table.add_empty_row();
                table.add_row(row!["bins", histogram.num_bins]);
                for (index, count) in histogram.bins.iter().enumerate() {
                    let center = histogram.bin_center + index as f64 * histogram.bin_width;
                    table.add_row(row![value(Some(center)), count]);
                }
            }
        }
    }

    table.to_string()
}

fn stats_rows(table: &mut Table, stats: &StatsSummary) {
    for stat in StatsType::ALL {
        table.add_row(row![stat_name(stat), value(stats.get(stat))]);
    }
}

fn stat_name(stat: StatsType) -> &'static str {
    match stat {
        StatsType::NumPixels => "pixels",
        StatsType::NanCount => "nan",
        StatsType::Sum => "sum",
        StatsType::FluxDensity => "flux",
        StatsType::Mean => "mean",
        StatsType::Rms => "rms",
        StatsType::Sigma => "sigma",
        StatsType::SumSq => "sum_sq",
        StatsType::Min => "min",
        StatsType::Max => "max",
        StatsType::Extrema => "extrema",
    }
}

fn value(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{value:.6}"),
        None => "-".into(),
    }
}
