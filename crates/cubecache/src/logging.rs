use std::env;

use cubecache_service::config::{Config, LogFormat};
use sentry::integrations::tracing::EventFilter;
use tracing::{Level, Subscriber};
use tracing::level_filters::{LevelFilter, STATIC_MAX_LEVEL};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Crates whose verbose output is wanted at `debug` and `trace`. Dependencies stay at `info`.
const OWN_CRATES: &[&str] = &["cubecache", "cubecache_service"];

fn default_filter(level: LevelFilter) -> String {
    let own = match level {
        LevelFilter::OFF => return String::new(),
        LevelFilter::ERROR => return "ERROR".into(),
        LevelFilter::WARN => return "WARN".into(),
        LevelFilter::INFO => return "INFO".into(),
        LevelFilter::DEBUG => "DEBUG",
        LevelFilter::TRACE => "TRACE",
    };
    let mut filter = String::from("INFO");
    for krate in OWN_CRATES {
        filter.push_str(&format!(",{krate}={own}"));
    }
    filter
}

/// Initializes logging for the command line tool.
///
/// `RUST_LOG` takes precedence over the configured level. With
/// [`enable_backtraces`](cubecache_service::config::Logging::enable_backtraces), this also sets
/// `RUST_BACKTRACE`.
///
/// Logs go to `stderr` in every format, keeping `stdout` free for the computed results.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That function is only safe
/// to call in single-threaded contexts to prevent unsynchronized concurrent access to the environment.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let filter = env::var("RUST_LOG").unwrap_or_else(|_| default_filter(config.logging.level));

    let attended = console::user_attended_stderr();
    let fmt_layer = fmt_layer(config.logging.format, attended, std::io::stderr);

    // progress of long jobs is logged at info, which makes for useful breadcrumbs
    let sentry_layer = sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
        Level::ERROR => EventFilter::Event,
        Level::WARN | Level::INFO => EventFilter::Breadcrumb,
        Level::DEBUG | Level::TRACE => EventFilter::Ignore,
    });

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(EnvFilter::new(&filter)))
        .with(sentry_layer)
        .init();
}

/// The formatting layer for `format`, writing to `make_writer`.
fn fmt_layer<S, W>(format: LogFormat, attended: bool, make_writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_writer(make_writer);
    match format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Auto if attended => layer.pretty().boxed(),
        LogFormat::Auto | LogFormat::Simplified => layer.compact().with_ansi(false).boxed(),
        // the computation span carries the aggregate key, so each line names its job
        LogFormat::Json => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
    }
}

/// Logs a fatal error, falling back to `stderr` when no logger would show it.
pub fn ensure_log_error(error: &anyhow::Error) {
    let logged = Level::ERROR <= STATIC_MAX_LEVEL && Level::ERROR <= LevelFilter::current();
    if logged {
        tracing::error!("{error:?}");
    } else {
        eprintln!("{error:?}");
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            io::Write::write(&mut *self.0.lock().unwrap(), buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_json_lines_name_the_job() {
        let captured = Captured::default();
        let writer = captured.clone();
        let layer = fmt_layer(LogFormat::Json, true, move || writer.clone());
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            let _span = tracing::info_span!("aggregate", key = "0/1/stats").entered();
            tracing::info!(progress = 0.5, "published");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(line["message"], "published");
        assert_eq!(line["progress"], 0.5);
        assert_eq!(line["span"]["name"], "aggregate");
        assert_eq!(line["span"]["key"], "0/1/stats");
    }

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter(LevelFilter::OFF), "");
        assert_eq!(default_filter(LevelFilter::WARN), "WARN");
        assert_eq!(
            default_filter(LevelFilter::DEBUG),
            "INFO,cubecache=DEBUG,cubecache_service=DEBUG"
        );
    }
}
