//! Centralized path configuration for Stardeck.
//!
//! All data paths should go through this module so the daemon and tests agree on
//! where stacks, backups and the database live.

use std::path::{Path, PathBuf};

/// Get the Stardeck data directory.
///
/// Resolution order:
/// 1. `STARDECK_DATA_DIR` environment variable
/// 2. `/var/lib/stardeck` if it exists (system install)
/// 3. `~/.stardeck` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STARDECK_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/stardeck");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".stardeck")).unwrap_or(system_dir)
}

/// Get the configuration directory.
///
/// `STARDECK_CONFIG_DIR` overrides; otherwise the platform config dir.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STARDECK_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::config_dir().map(|c| c.join("stardeck")).unwrap_or_else(data_dir)
}

/// Get the database path under a data directory.
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("stardeck.db")
}

/// Root directory holding one subdirectory per rendered stack.
pub fn stacks_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("stacks")
}

/// Root directory holding one subdirectory per backup.
pub fn backups_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("backups")
}

/// Compose file name inside a stack directory.
pub const COMPOSE_FILE: &str = "compose.yaml";

/// Environment file name inside a stack directory.
pub const ENV_FILE: &str = ".env";

/// Manifest file name inside a backup directory.
pub const BACKUP_MANIFEST: &str = "manifest.json";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_from_env() {
        std::env::set_var("STARDECK_DATA_DIR", "/tmp/stardeck-test");
        assert_eq!(data_dir(), PathBuf::from("/tmp/stardeck-test"));
        std::env::remove_var("STARDECK_DATA_DIR");
    }

    #[test]
    fn test_paths_consistency() {
        let base = PathBuf::from("/srv/stardeck");
        assert!(db_path(&base).starts_with(&base));
        assert!(stacks_dir(&base).starts_with(&base));
        assert!(backups_dir(&base).starts_with(&base));
        assert_ne!(stacks_dir(&base), backups_dir(&base));
    }
}
