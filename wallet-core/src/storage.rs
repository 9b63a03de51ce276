//! Local Encrypted Cache
//!
//! Keeps the last pulled or pushed [`Envelope`] on disk together with the
//! remote version it corresponds to, so a wallet can be unlocked offline.
//! Files are written with owner-only permissions.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, WalletError};
use crate::payload::Envelope;

const CACHE_FILE: &str = "wallet.json";

/// Cached envelope with the remote version it was saved at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedPayload {
    pub version: u64,
    pub envelope: Envelope,
}

/// On-disk cache of the encrypted payload
#[derive(Debug, Clone)]
pub struct LocalCache {
    path: PathBuf,
}

impl LocalCache {
    /// Cache stored inside a data directory
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(CACHE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn save(&self, envelope: &Envelope, version: u64) -> Result<()> {
        let cached = CachedPayload {
            version,
            envelope: envelope.clone(),
        };
        let json = serde_json::to_string_pretty(&cached)
            .map_err(|e| WalletError::Io(format!("cannot serialize cache: {}", e)))?;
        write_private(&self.path, json.as_bytes())?;
        debug!("Cached payload version {} at {}", version, self.path.display());
        Ok(())
    }

    /// `None` when nothing has been cached yet
    pub fn load(&self) -> Result<Option<CachedPayload>> {
        if !self.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.path)?;
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| WalletError::Corruption(format!("unreadable wallet cache: {}", e)))
    }

    pub fn remove(&self) -> Result<()> {
        if self.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Write a file readable only by its owner, replacing it atomically
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    #[cfg(not(unix))]
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    fs::rename(&tmp, path)?;
    Ok(())
}
