//! Logging setup

use std::fs;
use std::path::Path;

use eyre::{Context, Result};
use tracing::{debug, info};

/// Map a level name to a tracing level; unknown names fall back to INFO
pub fn parse_level(level: Option<&str>) -> tracing::Level {
    let Some(s) = level else {
        debug!("parse_level: level is None, defaulting to INFO");
        return tracing::Level::INFO;
    };
    match s.to_uppercase().as_str() {
        "TRACE" => tracing::Level::TRACE,
        "DEBUG" => tracing::Level::DEBUG,
        "INFO" => tracing::Level::INFO,
        "WARN" | "WARNING" => tracing::Level::WARN,
        "ERROR" => tracing::Level::ERROR,
        _ => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
            tracing::Level::INFO
        }
    }
}

/// Install the global subscriber
///
/// Writes to `log_file` without ANSI colours when given, else to stderr.
/// `RUST_LOG` directives are honoured alongside the level.
pub fn setup_logging(level: Option<&str>, log_file: Option<&Path>) -> Result<()> {
    let level = parse_level(level);
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    match log_file {
        Some(path) => {
            if let Some(dir) = path.parent()
                && !dir.as_os_str().is_empty()
            {
                fs::create_dir_all(dir).context("Failed to create log directory")?;
            }
            let file = fs::File::create(path).context("Failed to create log file")?;
            tracing_subscriber::fmt()
                .with_writer(file)
                .with_ansi(false)
                .with_env_filter(filter)
                .try_init()
                .map_err(|e| eyre::eyre!("Failed to install subscriber: {}", e))?;
        }
        None => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .try_init()
                .map_err(|e| eyre::eyre!("Failed to install subscriber: {}", e))?;
        }
    }

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level(Some("debug")), tracing::Level::DEBUG);
        assert_eq!(parse_level(Some("Warning")), tracing::Level::WARN);
        assert_eq!(parse_level(Some("ERROR")), tracing::Level::ERROR);
        assert_eq!(parse_level(None), tracing::Level::INFO);
        assert_eq!(parse_level(Some("chatty")), tracing::Level::INFO);
    }

    #[test]
    fn test_setup_logging_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("scanqueue.log");

        // Another test may already own the global subscriber; the file is created either way
        let _ = setup_logging(Some("debug"), Some(&path));
        assert!(path.exists());
    }
}
