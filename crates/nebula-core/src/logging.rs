//! Tracing integration for structured logging.
//!
//! Provides logging setup for both agent and master with:
//! - Configurable verbosity levels
//! - Optional file output with size-capped rotation
//! - JSON or text format

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::Result;
use crate::constants::LOG_ROTATE_BYTES;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

/// Initialize the logging system.
///
/// # Arguments
///
/// * `verbosity` - Verbosity level (0=error, 1=warn, 2=info, 3=debug, 4+=trace)
/// * `log_file` - Optional path to write logs to file
/// * `format` - Output format (text or JSON)
pub fn init_logging(verbosity: u8, log_file: Option<&Path>, format: LogFormat) -> Result<()> {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };

    // Build filter with level and allow RUST_LOG override
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "nebula_core={},nebula_agent={},nebula_master={}",
            level, level, level
        ))
    });

    match (log_file, format) {
        (None, LogFormat::Text) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_file(verbosity >= 3)
                        .with_line_number(verbosity >= 3),
                )
                .try_init()
                .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?;
        }
        (None, LogFormat::Json) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .try_init()
                .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?;
        }
        (Some(path), LogFormat::Text) => {
            let file = open_log_file(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(file)
                        .with_ansi(false)
                        .with_target(true),
                )
                .try_init()
                .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?;
        }
        (Some(path), LogFormat::Json) => {
            let file = open_log_file(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(file))
                .try_init()
                .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?;
        }
    }

    Ok(())
}

/// Open a log file for appending, rotating it aside first if oversized.
///
/// A file over [`LOG_ROTATE_BYTES`] is renamed to `<name>.old`, replacing
/// any previous rotation. Only one generation is kept.
fn open_log_file(path: &Path) -> Result<std::fs::File> {
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.len() > LOG_ROTATE_BYTES {
            let mut rotated = path.as_os_str().to_owned();
            rotated.push(".old");
            std::fs::rename(path, &rotated)?;
        }
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(file)
}

/// Initialize logging with defaults for testing.
///
/// Silently ignores errors (logging may already be initialized).
pub fn init_test_logging() {
    let _ = init_logging(2, None, LogFormat::Text);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn log_format_default() {
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }

    #[test]
    fn oversized_log_is_rotated_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");

        let mut f = std::fs::File::create(&path).unwrap();
        let block = vec![b'x'; 1024 * 1024];
        for _ in 0..11 {
            f.write_all(&block).unwrap();
        }
        drop(f);

        let file = open_log_file(&path).unwrap();
        drop(file);

        let rotated = dir.path().join("agent.log.old");
        assert!(rotated.exists());
        assert!(std::fs::metadata(&path).unwrap().len() < LOG_ROTATE_BYTES);
    }

    #[test]
    fn small_log_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        std::fs::write(&path, b"hello\n").unwrap();

        let file = open_log_file(&path).unwrap();
        drop(file);

        assert!(!dir.path().join("agent.log.old").exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 6);
    }
}
