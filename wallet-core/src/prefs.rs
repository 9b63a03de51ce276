//! Local preferences kept next to the wallet cache

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::balance::DisplaySettings;
use crate::error::{Result, WalletError};
use crate::storage::write_private;

const PREFS_FILE: &str = "preferences.json";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Remote payload version seen by the last successful pull or push
    pub last_known_version: Option<u64>,
    pub display: DisplaySettings,
    /// Label for the first account, applied once after wallet creation
    pub pending_label: Option<String>,
}

impl Preferences {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(PREFS_FILE)
    }

    /// Defaults when the file does not exist yet
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| WalletError::Validation(format!("unreadable preferences {}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| WalletError::Io(format!("cannot serialize preferences: {}", e)))?;
        write_private(path, json.as_bytes())?;
        debug!("Saved preferences to {}", path.display());
        Ok(())
    }

    /// One-shot: the label is gone after the first call
    pub fn take_pending_label(&mut self) -> Option<String> {
        self.pending_label.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::{Denomination, DisplayMode};
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let prefs = Preferences::load(&Preferences::path_in(dir.path())).unwrap();
        assert_eq!(prefs, Preferences::default());
        assert_eq!(prefs.display.currency, "USD");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = Preferences::path_in(dir.path());

        let prefs = Preferences {
            last_known_version: Some(7),
            display: DisplaySettings {
                mode: DisplayMode::Fiat,
                denomination: Denomination::Bits,
                currency: "EUR".into(),
            },
            pending_label: Some("Daily".into()),
        };
        prefs.save(&path).unwrap();

        assert_eq!(Preferences::load(&path).unwrap(), prefs);
    }

    #[cfg(unix)]
    #[test]
    fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = Preferences::path_in(dir.path());
        Preferences::default().save(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_pending_label_is_one_shot() {
        let mut prefs = Preferences {
            pending_label: Some("Daily".into()),
            ..Default::default()
        };
        assert_eq!(prefs.take_pending_label().as_deref(), Some("Daily"));
        assert_eq!(prefs.take_pending_label(), None);
    }
}
