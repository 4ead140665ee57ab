use prometheus::{Encoder, TextEncoder};
use tracing::metadata::LevelFilter;
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_log::LogTracer;
use tracing_logfmt::{EventsFormatter, FieldsFormatter};
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::format::{FmtSpan, Format};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;

use weir_types::config::{config, LogConfig, LogFormat};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn init_logging(name: &str) -> Option<WorkerGuard> {
    init_logging_with_filter(
        name,
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    )
}

macro_rules! register_log {
    ($e: expr, $nonblocking: expr, $filter: expr) => {{
        let layer = $e;
        let result = if let Some(nonblocking) = $nonblocking {
            tracing::subscriber::set_global_default(
                Registry::default().with(layer.with_writer(nonblocking).with_filter($filter)),
            )
        } else {
            tracing::subscriber::set_global_default(
                Registry::default().with(layer.with_writer(std::io::stderr).with_filter($filter)),
            )
        };

        if let Err(e) = result {
            eprintln!("Unable to set global log subscriber: {}", e);
        }
    }};
}

/// Installs the global subscriber in the format chosen by the `logging` config section, and a
/// panic hook that reports panics through it. Hold on to the returned guard when logging is
/// non-blocking; dropping it flushes and stops the writer thread.
pub fn init_logging_with_filter(name: &str, filter: EnvFilter) -> Option<WorkerGuard> {
    if let Err(e) = LogTracer::init() {
        eprintln!("Failed to initialize log tracer {:?}", e);
    }

    let filter = match "aws_config::profile::credentials=warn".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };

    let config = config();
    let logging = &config.logging;

    let (nonblocking, guard) = if logging.nonblocking {
        let (nonblocking, guard) = NonBlockingBuilder::default()
            .buffered_lines_limit(logging.buffered_lines_limit)
            .thread_name(name)
            .finish(std::io::stderr());
        (Some(nonblocking), Some(guard))
    } else {
        (None, None)
    };

    match logging.format {
        LogFormat::Plaintext => {
            register_log!(
                tracing_subscriber::fmt::layer()
                    .with_line_number(logging.enable_file_line)
                    .with_file(logging.enable_file_name)
                    .with_span_events(FmtSpan::NONE),
                nonblocking,
                filter
            )
        }
        LogFormat::Logfmt => {
            register_log!(logfmt_layer(logging), nonblocking, filter)
        }
        LogFormat::Json => {
            register_log!(
                tracing_subscriber::fmt::layer()
                    .with_line_number(logging.enable_file_line)
                    .with_file(logging.enable_file_name)
                    .event_format(Format::default().json()),
                nonblocking,
                filter
            )
        }
    }

    std::panic::set_hook(Box::new(|panic| {
        if let Some(location) = panic.location() {
            tracing::error!(
                message = %panic,
                panic.file = location.file(),
                panic.line = location.line(),
                panic.column = location.column(),
            );
        } else {
            tracing::error!(message = %panic);
        }
    }));

    guard
}

fn logfmt_layer<S>(logging: &LogConfig) -> fmt::Layer<S, FieldsFormatter, EventsFormatter>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_line_number(logging.enable_file_line)
        .with_file(logging.enable_file_name)
        .event_format(EventsFormatter::default())
        .fmt_fields(FieldsFormatter::default())
}

/// Renders everything in the default prometheus registry in the text exposition format.
pub fn encode_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let registry = prometheus::default_registry();
    Ok(encoder.encode_to_string(&registry.gather())?)
}
