//! Log subscriber setup driven by [`Options`].

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::KeywardError;
use crate::options::Options;

/// Map the 0 to 4 debug level onto a `tracing` filter directive.
#[must_use]
pub const fn level_directive(debug_level: u8) -> &'static str {
    match debug_level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `debug_level`. When `debug_file` is
/// set, events go to that file through a non-blocking writer; the
/// returned guard must be kept alive to flush it.
///
/// # Errors
///
/// Returns [`KeywardError::Validation`] for an out-of-range level and
/// [`KeywardError::Io`] if a subscriber is already installed.
pub fn init_logging(options: &Options) -> Result<Option<WorkerGuard>, KeywardError> {
    options.validate()?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(options.debug_level)));
    let registry = tracing_subscriber::registry().with(env_filter);

    let init_err = |e: tracing_subscriber::util::TryInitError| {
        KeywardError::Io(std::io::Error::other(e.to_string()))
    };

    match &options.debug_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| {
                    KeywardError::Io(std::io::Error::other("debug file path has no file name"))
                })?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_target(true).with_writer(writer))
                .try_init()
                .map_err(init_err)?;
            Ok(Some(guard))
        }
        None => {
            registry
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .map_err(init_err)?;
            Ok(None)
        }
    }
}
