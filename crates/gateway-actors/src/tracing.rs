//! # Observability & Tracing
//!
//! Structured logging setup shared by every binary built on this crate.
//!
//! Worker actors log with a `program` field instead of module paths, so the
//! subscriber hides targets (`with_target(false)`) and uses the compact format
//! by default:
//!
//! ```text
//! INFO Worker started program="collector"
//! INFO Started program="collector"
//! WARN Cycle failed program="sender" error=aggregator returned 503
//! ```
//!
//! Verbosity follows `RUST_LOG` when set, otherwise the default directive
//! passed in [`TracingOptions`]:
//!
//! ```bash
//! RUST_LOG=debug plantlink run
//! RUST_LOG=plantlink::sender=debug,info plantlink run
//! ```

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Output options for [`setup_tracing_with`].
#[derive(Debug, Clone)]
pub struct TracingOptions {
    /// Filter used when `RUST_LOG` is not set.
    pub default_directive: String,
    /// Append to this file instead of writing to stdout.
    pub log_file: Option<PathBuf>,
    /// Multi-line-free compact lines (default) or the full format with spans.
    pub compact: bool,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            log_file: None,
            compact: true,
        }
    }
}

/// Initializes stdout logging with the default options.
pub fn setup_tracing() {
    // stdout needs no file handle, so this cannot fail
    let _ = setup_tracing_with(&TracingOptions::default());
}

/// Initializes the global subscriber.
///
/// Fails only when the log file cannot be opened. A subscriber that is
/// already installed (e.g. by a test harness) is left in place.
pub fn setup_tracing_with(options: &TracingOptions) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_directive));

    let (writer, ansi) = match &options.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(io::stdout), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false);

    let _ = if options.compact {
        builder.compact().try_init()
    } else {
        builder.try_init()
    };
    Ok(())
}
