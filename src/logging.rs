use std::io;
/// Structured logging utilities for pkgimage
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Initialize structured logging with optional JSON output
pub fn init_logging(json_output: bool) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pkgimage=info,tower_http=info"));

    let registry = Registry::default().with(env_filter);

    if json_output {
        // JSON output for structured logging aggregation
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_current_span(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    }

    Ok(())
}

#[macro_export]
macro_rules! log_blob_hit {
    ($digest:expr, $size:expr) => {
        tracing::debug!(digest = %$digest.short(), size_bytes = $size, "Blob hit");
    };
}

#[macro_export]
macro_rules! log_blob_miss {
    ($digest:expr) => {
        tracing::debug!(digest = %$digest.short(), "Blob miss");
    };
}

#[macro_export]
macro_rules! log_blob_store {
    ($digest:expr, $size:expr) => {
        tracing::debug!(digest = %$digest.short(), size_bytes = $size, "Storing blob");
    };
}

#[macro_export]
macro_rules! log_build_start {
    ($image:expr, $tag:expr, $packages:expr) => {
        tracing::info!(image = %$image, tag = %$tag, packages = $packages, "Image build started");
    };
}

#[macro_export]
macro_rules! log_build_complete {
    ($image:expr, $tag:expr, $digest:expr, $duration_ms:expr) => {
        tracing::info!(
            image = %$image,
            tag = %$tag,
            manifest = %$digest,
            duration_ms = $duration_ms,
            "Image build completed"
        );
    };
}

#[macro_export]
macro_rules! log_digest_mismatch {
    ($expected:expr, $actual:expr, $size:expr) => {
        tracing::error!(
            expected = %$expected.short(),
            actual = %$actual.short(),
            size = $size,
            "Blob verification failed, purging"
        );
    };
}
