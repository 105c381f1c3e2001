use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "VMHOST_LOG";

pub const DEFAULT_FILTER: &str = "warn,vmhost=info";
pub const TRACE_LOADING_FILTER: &str = "warn,vmhost=debug";

/// Picks the filter directive: `VMHOST_LOG`, then `RUST_LOG`, then the default for
/// the requested verbosity.
pub fn filter_directive(
    vmhost_log: Option<String>,
    rust_log: Option<String>,
    trace_loading: bool,
) -> String {
    vmhost_log
        .filter(|s| !s.trim().is_empty())
        .or_else(|| rust_log.filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| {
            if trace_loading {
                TRACE_LOADING_FILTER
            } else {
                DEFAULT_FILTER
            }
            .to_string()
        })
}

/// Initialize logging to stderr. Safe to call more than once; later calls are no-ops.
pub fn init_logging(trace_loading: bool) {
    let directive = filter_directive(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
        trace_loading,
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
