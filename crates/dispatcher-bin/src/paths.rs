//! File system paths for the dispatcher.

use anyhow::{anyhow, Result};
use std::path::PathBuf;

/// Manages file system paths for the dispatcher.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory for runtime files (~/.outbox-dispatcher)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.outbox-dispatcher`.
    pub fn new() -> Result<Self> {
        let home =
            dirs::home_dir().ok_or_else(|| anyhow!("Could not determine home directory"))?;
        Ok(Self {
            base_dir: home.join(".outbox-dispatcher"),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory.
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (base_dir/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the database file path (base_dir/outbox.db).
    pub fn database_file(&self) -> PathBuf {
        self.base_dir.join("outbox.db")
    }

    /// Ensure the base directory exists.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_with_base_dir() {
        let paths = Paths::with_base_dir(PathBuf::from("/tmp/dispatcher-test"));
        assert_eq!(
            paths.config_file(),
            PathBuf::from("/tmp/dispatcher-test/config.json")
        );
        assert_eq!(
            paths.database_file(),
            PathBuf::from("/tmp/dispatcher-test/outbox.db")
        );
    }
}
