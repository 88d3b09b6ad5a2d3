//! Environment-driven configuration.
//!
//! An optional `.env` file (via `dotenvy`) is loaded first so local
//! development doesn't need variables exported in the shell, then each
//! setting falls back to its documented default if the environment doesn't
//! override it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const DEFAULT_PORT_RANGE: (u16, u16) = (3100, 3199);
const DEFAULT_LEASE_TIMEOUT_HOURS: u64 = 24;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub port_range: (u16, u16),
    pub lease_timeout_hours: u64,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // Best-effort: a missing .env file is not an error.
        let _ = dotenvy::dotenv();

        let data_dir = std::env::var("CONDUCTOR_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        let db_path = std::env::var("CONDUCTOR_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("conductor.sqlite3"));

        let port_range = match std::env::var("CONDUCTOR_PORT_RANGE") {
            Ok(raw) => parse_port_range(&raw)
                .with_context(|| format!("invalid CONDUCTOR_PORT_RANGE: {raw}"))?,
            Err(_) => DEFAULT_PORT_RANGE,
        };

        let lease_timeout_hours = std::env::var("CONDUCTOR_LEASE_TIMEOUT_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_LEASE_TIMEOUT_HOURS);

        let log_format = match std::env::var("CONDUCTOR_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let config = Self {
            data_dir,
            db_path,
            port_range,
            lease_timeout_hours,
            log_format,
        };
        config.ensure_directories()?;
        Ok(config)
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.data_dir.join("repos")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.data_dir.join("worktrees")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }

    fn ensure_directories(&self) -> Result<()> {
        for dir in [self.repos_dir(), self.worktrees_dir(), self.locks_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|home| Path::new(&home).join(".conductor"))
        .unwrap_or_else(|_| PathBuf::from(".conductor"))
}

fn parse_port_range(raw: &str) -> Result<(u16, u16)> {
    let (start, end) = raw
        .split_once('-')
        .context("expected '<start>-<end>' format")?;
    let start: u16 = start.trim().parse().context("invalid range start")?;
    let end: u16 = end.trim().parse().context("invalid range end")?;
    anyhow::ensure!(start <= end, "range start must not exceed end");
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_a_port_range() {
        assert_eq!(parse_port_range("3100-3199").unwrap(), (3100, 3199));
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(parse_port_range("200-100").is_err());
    }

    fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
        for (k, v) in vars {
            unsafe { std::env::set_var(k, v) };
        }
        let result = f();
        for (k, _) in vars {
            unsafe { std::env::remove_var(k) };
        }
        result
    }

    #[test]
    fn from_env_creates_directories() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let config = with_env(
            &[("CONDUCTOR_DATA_DIR", data_dir.to_str().unwrap())],
            Config::from_env,
        )
        .unwrap();
        assert!(config.repos_dir().exists());
        assert!(config.worktrees_dir().exists());
        assert!(config.locks_dir().exists());
    }
}
