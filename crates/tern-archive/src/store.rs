//! Per-bundle version tokens.
//!
//! The host build pipeline assigns every bundle a short version token (a
//! content hash). The store keeps the last-seen token per bundle name in a
//! small JSON file; the overlay compares tokens at open time and wipes the
//! extraction root when any bundle changed, so cached files from two
//! different bundle versions can never coexist.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::{fs, io};

use serde::{Deserialize, Serialize};

/// On-disk shape of the token file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StampFile {
    /// Bundle name → version token.
    assets: BTreeMap<String, String>,
}

/// Errors that can occur reading or writing the token file.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Last-seen version token per bundle name, persisted as JSON.
#[derive(Debug, Clone)]
pub struct VersionStore {
    path: PathBuf,
    tokens: BTreeMap<String, String>,
}

impl VersionStore {
    /// Load the store from `path`, starting empty when the file is absent.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let stamps: StampFile = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => StampFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            tokens: stamps.assets,
        })
    }

    /// Last-seen token for a bundle, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.tokens.get(name).map(String::as_str)
    }

    /// Record a bundle's token. Takes effect on disk at the next [`save`].
    ///
    /// [`save`]: VersionStore::save
    pub fn set(&mut self, name: &str, token: &str) {
        self.tokens.insert(name.to_string(), token.to_string());
    }

    /// Write the store back to its file, atomically.
    pub fn save(&self) -> Result<(), StoreError> {
        let dir = self.path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;
        let stamps = StampFile {
            assets: self.tokens.clone(),
        };
        let json = serde_json::to_string_pretty(&stamps)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    /// Delete extraction roots left behind by bundles that no longer exist,
    /// e.g. after they were renamed or removed in an app upgrade.
    ///
    /// Missing paths are not an error.
    pub fn purge_obsolete(base_dir: &Path, names: &[&str]) -> io::Result<()> {
        for name in names {
            let target = base_dir.join(name);
            let result = if target.is_dir() {
                fs::remove_dir_all(&target)
            } else {
                fs::remove_file(&target)
            };
            match result {
                Ok(()) => log::info!("purged obsolete path {}", target.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
