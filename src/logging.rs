//! Tracing setup for the `tn` binary.
//!
//! Events go to stderr (plain or JSON lines) and, when a log directory is
//! given, to a daily rolling `thinknode.log` there. `RUST_LOG` overrides the
//! default filter.

use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// File name prefix of the rolling application log.
pub const LOG_FILE_NAME: &str = "thinknode.log";

/// Install the global subscriber.
///
/// `default_level` applies when `RUST_LOG` is unset. The returned guard
/// flushes the file writer on drop and must be held for the life of the
/// process. Calling this twice leaves the first subscriber in place.
pub fn init_tracing(default_level: &str, log_dir: Option<&Path>, json: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},hyper=warn,reqwest=warn", default_level))
    });

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(if json {
        fmt::layer().json().with_writer(io::stderr).boxed()
    } else {
        fmt::layer().with_target(false).with_writer(io::stderr).boxed()
    });

    let mut guard = None;
    let mut file_error = None;
    if let Some(dir) = log_dir {
        match fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
                let (writer, worker) = tracing_appender::non_blocking(appender);
                layers.push(fmt::layer().with_ansi(false).with_writer(writer).boxed());
                guard = Some(worker);
            }
            Err(e) => file_error = Some(e),
        }
    }

    if tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .is_err()
    {
        return None;
    }

    if let (Some(dir), Some(e)) = (log_dir, file_error) {
        tracing::warn!(dir = %dir.display(), error = %e, "file logging disabled");
    }
    guard
}
