//! Logger setup
//!
//! One `env_logger` instance per process. Peers forked in master mode log
//! to the same destination, so `log_pid` tags every line with its process.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(config: &LoggingConfig, debug: bool) -> String {
    if debug {
        "debug".to_string()
    } else {
        config.level.clone()
    }
}

/// Build the logger without installing it.
pub fn builder(config: &LoggingConfig, debug: bool) -> Result<env_logger::Builder> {
    let filter = default_filter(config, debug);
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter));

    let pid = config.log_pid.then(std::process::id);
    builder.format(move |buf, record| {
        let ts = buf.timestamp();
        match pid {
            Some(pid) => writeln!(
                buf,
                "[{}] [{} {:5} {}] {}",
                pid,
                ts,
                record.level(),
                record.target(),
                record.args()
            ),
            None => writeln!(
                buf,
                "[{} {:5} {}] {}",
                ts,
                record.level(),
                record.target(),
                record.args()
            ),
        }
    });

    if let Some(path) = &config.file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    Ok(builder)
}

/// Install the process-wide logger.
pub fn init(config: &LoggingConfig, debug: bool) -> Result<()> {
    builder(config, debug)?
        .try_init()
        .context("Logger already initialised")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_flag_overrides_level() {
        let config = LoggingConfig {
            level: "warn".into(),
            ..LoggingConfig::default()
        };
        assert_eq!(default_filter(&config, false), "warn");
        assert_eq!(default_filter(&config, true), "debug");
    }

    #[test]
    fn test_file_target_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crossway.log");
        let config = LoggingConfig {
            file: Some(path.clone()),
            log_pid: true,
            ..LoggingConfig::default()
        };
        builder(&config, false).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_unwritable_log_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            file: Some(dir.path().join("missing").join("crossway.log")),
            ..LoggingConfig::default()
        };
        let err = builder(&config, false).err().unwrap();
        assert!(err.to_string().contains("log file"));
    }
}
