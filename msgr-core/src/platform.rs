//! Per-user directories for configuration and logs.

use std::path::PathBuf;
use crate::constants;
use crate::error::{MsgrError, MsgrResult};

/// Overrides both directories, mostly for tests and containers.
pub const HOME_ENV: &str = "MSGR_HOME";

pub struct Platform;

impl Platform {
    fn home_override() -> Option<PathBuf> {
        std::env::var_os(HOME_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }

    /// Application data directory (logs live here).
    pub fn data_dir() -> MsgrResult<PathBuf> {
        if let Some(home) = Self::home_override() {
            return Ok(home.join("data"));
        }
        let base = dirs::data_dir()
            .ok_or_else(|| MsgrError::Config("could not determine data directory".into()))?;
        Ok(base.join(constants::APP_NAME))
    }

    pub fn config_dir() -> MsgrResult<PathBuf> {
        if let Some(home) = Self::home_override() {
            return Ok(home);
        }
        let base = dirs::config_dir()
            .ok_or_else(|| MsgrError::Config("could not determine config directory".into()))?;
        Ok(base.join(constants::APP_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_are_namespaced() {
        if std::env::var_os(HOME_ENV).is_some() {
            return;
        }
        if let Ok(dir) = Platform::config_dir() {
            assert!(dir.ends_with("msgr"));
        }
        if let Ok(dir) = Platform::data_dir() {
            assert!(dir.ends_with("msgr"));
        }
    }
}
