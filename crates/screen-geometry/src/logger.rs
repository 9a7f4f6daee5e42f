//! Logging setup for demos and tests.
//!
//! The solver reports through the `log` facade (and `tracing` spans with the
//! `tracing` feature), so any logger works. [`init_with_level`] installs a
//! small stderr logger that shows this crate's records as
//! `LEVEL module: message` and only warnings and errors from other crates.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};

const CRATE_TARGET: &str = "screen_geometry";

struct SolverLogger;

static LOGGER: SolverLogger = SolverLogger;
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Records shown at `max`: everything enabled from this crate, warnings and
/// errors from elsewhere.
fn shows(level: Level, target: &str, max: LevelFilter) -> bool {
    level <= max && (target.starts_with(CRATE_TARGET) || level <= Level::Warn)
}

/// `screen_geometry::mesh_builder` prints as `mesh_builder`.
fn short_target(target: &str) -> &str {
    match target.strip_prefix(CRATE_TARGET) {
        Some("") => CRATE_TARGET,
        Some(rest) => rest.trim_start_matches("::"),
        None => target,
    }
}

impl Log for SolverLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        shows(metadata.level(), metadata.target(), log::max_level())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = writeln!(
            std::io::stderr().lock(),
            "{:<5} {}: {}",
            record.level(),
            short_target(record.target()),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the stderr logger, or change its level if it is already in
/// place. Fails only when a different logger was installed first.
pub fn init_with_level(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    if INSTALLED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        if let Err(e) = log::set_logger(&LOGGER) {
            INSTALLED.store(false, Ordering::Release);
            return Err(e);
        }
    }
    log::set_max_level(level);
    Ok(())
}

/// Install a `tracing` subscriber honoring `RUST_LOG`, defaulting to
/// `screen_geometry=info`. Span close events carry solver timings. Does
/// nothing if a global subscriber already exists.
#[cfg(feature = "tracing")]
pub fn init_tracing(json: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{CRATE_TARGET}=info")));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    if let Err(e) = installed {
        log::debug!("tracing subscriber not installed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_records_need_warn() {
        let max = LevelFilter::Debug;
        assert!(shows(Level::Debug, "screen_geometry::ransac", max));
        assert!(!shows(Level::Trace, "screen_geometry::ransac", max));
        assert!(!shows(Level::Info, "rayon_core", max));
        assert!(shows(Level::Warn, "rayon_core", max));
        assert!(!shows(Level::Error, "screen_geometry", LevelFilter::Off));
    }

    #[test]
    fn targets_drop_the_crate_prefix() {
        assert_eq!(short_target("screen_geometry::mesh_builder"), "mesh_builder");
        assert_eq!(short_target("screen_geometry"), "screen_geometry");
        assert_eq!(short_target("kiddo::float"), "kiddo::float");
    }

    #[test]
    fn repeated_init_updates_the_level() {
        init_with_level(LevelFilter::Warn).expect("install");
        assert_eq!(log::max_level(), LevelFilter::Warn);
        init_with_level(LevelFilter::Debug).expect("level change");
        assert_eq!(log::max_level(), LevelFilter::Debug);
        assert!(LOGGER.enabled(
            &Metadata::builder()
                .level(Level::Debug)
                .target("screen_geometry::solver")
                .build()
        ));
    }
}
