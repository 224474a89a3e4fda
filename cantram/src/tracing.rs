//! Logging setup for the tram bus.
//!
//! Binaries call [`init_journald_or_stdout`] once at startup. Library code
//! logs through `use crate::tracing::prelude::*`.
//!
//! Frame-level traffic is logged at TRACE under `cantram::tram`, module
//! and resource lifecycle at DEBUG and INFO. To watch the wire without the
//! rest of the noise, run with `CANTRAM_LOG=info,cantram::tram=trace`.
//! `CANTRAM_LOG` takes precedence over `RUST_LOG`.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Filter variable specific to this crate.
pub const LOG_ENV: &str = "CANTRAM_LOG";

/// Install the global subscriber: journald under systemd, stdout
/// otherwise.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => tracing_subscriber::registry()
                .with(env_filter())
                .with(layer)
                .init(),
            Err(e) => {
                use_stdout();
                error!(error = %e, "Failed to initialize journald logging, using stdout.");
            }
        }
    } else {
        use_stdout();
    }
}

/// Which variable the filter is read from.
fn filter_var() -> &'static str {
    if env::var_os(LOG_ENV).is_some() {
        LOG_ENV
    } else {
        "RUST_LOG"
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(filter_var())
        .from_env_lossy()
}

fn use_stdout() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_timer(BusClock))
        .init();
}

// Local wall time to the millisecond, so request and response lines of one
// exchange can be told apart.
struct BusClock;

impl FormatTime for BusClock {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second].[subsecond digits:3]"
            ))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
