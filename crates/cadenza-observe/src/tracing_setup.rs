//! Tracing initialization for the orchestration CLI and services.
//!
//! Owns the mapping from CLI verbosity flags to filter directives (an
//! explicit `RUST_LOG` always wins), installs a compact fmt layer, and
//! optionally bridges spans to OpenTelemetry through the stdout exporter.
//! Engine and store logs carry their context as structured fields
//! (`workflow_id`, `issue`, `step_num`), so the fmt layer drops targets
//! to keep lines short.
//!
//! `init_tracing` returns a guard; dropping it flushes the OTel pipeline,
//! so callers keep it alive for the life of the process:
//!
//! ```no_run
//! let filter = cadenza_observe::tracing_setup::verbosity_filter(1, false);
//! let _guard = cadenza_observe::tracing_setup::init_tracing(filter, false).unwrap();
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Filter directives for a `-v`/`-q` verbosity level.
///
/// The orchestration crates get one extra level of detail before the
/// rest of the dependency tree does: `-v` surfaces engine transition
/// debugging without drowning it in sqlx noise.
fn verbosity_directives(verbose: u8, quiet: bool) -> &'static str {
    match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info,cadenza_core=debug,cadenza_infra=debug",
        (false, _) => "trace",
    }
}

/// Build the log filter for the given CLI flags. A `RUST_LOG` value in
/// the environment overrides the flags entirely.
pub fn verbosity_filter(verbose: u8, quiet: bool) -> EnvFilter {
    if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(verbosity_directives(verbose, quiet))
    }
}

/// Keeps the OTel pipeline alive; dropping it flushes buffered spans.
#[must_use = "dropping the guard immediately would shut tracing export down"]
pub struct TracingGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("warning: failed to flush OTel spans on shutdown: {e}");
            }
        }
    }
}

/// Install the global tracing subscriber.
///
/// Always installs the compact fmt layer with the supplied filter. With
/// `enable_otel`, spans are additionally exported through OpenTelemetry's
/// stdout exporter (swap for OTLP when wiring a collector).
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(
    filter: EnvFilter,
    enable_otel: bool,
) -> Result<TracingGuard, Box<dyn std::error::Error + Send + Sync>> {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);

    if enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer("cadenza"));

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;

        Ok(TracingGuard {
            provider: Some(provider),
        })
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()?;

        Ok(TracingGuard { provider: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_follow_flag_precedence() {
        // quiet beats any verbosity
        assert_eq!(verbosity_directives(0, true), "error");
        assert_eq!(verbosity_directives(3, true), "error");

        assert_eq!(verbosity_directives(0, false), "warn");
        assert!(verbosity_directives(1, false).contains("cadenza_core=debug"));
        assert_eq!(verbosity_directives(2, false), "trace");
    }
}
