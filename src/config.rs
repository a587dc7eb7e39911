//! Runtime Configuration
//!
//! TigerStyle: Validate everything up front, fail before mounting.

use crate::control::CONTROL_BIND_ADDRESS_DEFAULT;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Validated process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Where the hooked filesystem is mounted
    pub mountpoint: PathBuf,
    /// Real backing directory
    pub original: PathBuf,
    /// Control plane address
    pub bind: SocketAddr,
    /// Directory for the log file; stderr when unset
    pub log_dir: Option<PathBuf>,
    /// Allow other users to access the mount
    pub allow_other: bool,
}

impl Config {
    /// Build from raw arguments. `~` is expanded in paths.
    pub fn new(mountpoint: &str, original: &str, bind: &str) -> Result<Self, ConfigError> {
        let mountpoint = expand(mountpoint);
        let original = expand(original);
        ensure_dir("mountpoint", &mountpoint)?;
        ensure_dir("original", &original)?;

        if same_dir(&mountpoint, &original) {
            return Err(ConfigError::SameDirectory(mountpoint));
        }

        let bind = bind.parse().map_err(|source| ConfigError::InvalidBind {
            addr: bind.to_string(),
            source,
        })?;

        Ok(Self {
            mountpoint,
            original,
            bind,
            log_dir: None,
            allow_other: false,
        })
    }

    /// Build with the default control plane address.
    pub fn with_default_bind(mountpoint: &str, original: &str) -> Result<Self, ConfigError> {
        Self::new(mountpoint, original, CONTROL_BIND_ADDRESS_DEFAULT)
    }

    /// Log into `dir` instead of stderr.
    #[must_use]
    pub fn log_dir(mut self, dir: Option<&str>) -> Self {
        self.log_dir = dir.map(expand);
        self
    }

    #[must_use]
    pub fn allow_other(mut self, allow: bool) -> Self {
        self.allow_other = allow;
        self
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

fn ensure_dir(role: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(ConfigError::NotADirectory {
            role,
            path: path.to_path_buf(),
        })
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{role} is not a directory: {}", .path.display())]
    NotADirectory { role: &'static str, path: PathBuf },

    #[error("mountpoint and original are the same directory: {}", .0.display())]
    SameDirectory(PathBuf),

    #[error("invalid bind address {addr}: {source}")]
    InvalidBind {
        addr: String,
        source: std::net::AddrParseError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_valid_config() {
        let mnt = tempdir().unwrap();
        let orig = tempdir().unwrap();

        let config = Config::with_default_bind(
            mnt.path().to_str().unwrap(),
            orig.path().to_str().unwrap(),
        )
        .unwrap()
        .log_dir(Some("/tmp/qfs-logs"))
        .allow_other(true);

        assert_eq!(config.mountpoint, mnt.path());
        assert_eq!(config.original, orig.path());
        assert_eq!(config.bind.port(), 32768);
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/qfs-logs")));
        assert!(config.allow_other);
    }

    #[test]
    fn test_missing_directory() {
        let mnt = tempdir().unwrap();
        let missing = mnt.path().join("missing");

        let err = Config::with_default_bind(
            mnt.path().to_str().unwrap(),
            missing.to_str().unwrap(),
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::NotADirectory { role: "original", .. }));
    }

    #[test]
    fn test_same_directory_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        let err = Config::with_default_bind(path, path).unwrap_err();
        assert!(matches!(err, ConfigError::SameDirectory(_)));
    }

    #[test]
    fn test_bad_bind() {
        let mnt = tempdir().unwrap();
        let orig = tempdir().unwrap();
        let err = Config::new(
            mnt.path().to_str().unwrap(),
            orig.path().to_str().unwrap(),
            "not-an-addr",
        )
        .unwrap_err();
        assert!(err.to_string().contains("not-an-addr"));
    }
}
