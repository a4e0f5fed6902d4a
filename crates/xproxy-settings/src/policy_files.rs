//! JSON policy files.
//!
//! - Blocklist: a JSON array of domain strings.
//! - Redirects: a JSON object mapping source hostname to destination hostname.
//!
//! A missing file is created with sample entries and read as empty for that
//! load, so the operator can edit it and reload.

use crate::{PolicySettings, SettingsError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Sample entries written to a new blocklist file.
pub const DEFAULT_BLOCKLIST: &[&str] = &[
    "example-blocked.com",
    "malicious-site.net",
    "ad-tracker.com",
    "facebook.com",
    "twitter.com",
];

/// Sample entries written to a new redirects file.
pub const DEFAULT_REDIRECTS: &[(&str, &str)] = &[
    ("google.de", "google.com"),
    ("www.google.de", "www.google.com"),
    ("youtube.de", "youtube.com"),
    ("www.youtube.de", "www.youtube.com"),
    ("amazon.de", "amazon.com"),
    ("www.amazon.de", "www.amazon.com"),
];

/// Locations of the blocklist and redirect files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyFiles {
    pub blocklist_path: PathBuf,
    pub redirects_path: PathBuf,
}

impl PolicyFiles {
    pub fn new(blocklist_path: impl Into<PathBuf>, redirects_path: impl Into<PathBuf>) -> Self {
        Self {
            blocklist_path: blocklist_path.into(),
            redirects_path: redirects_path.into(),
        }
    }

    /// Paths named by a `[policy]` section, with defaults filled in.
    pub fn from_settings(settings: &PolicySettings) -> Self {
        Self::new(settings.blocklist_path(), settings.redirects_path())
    }

    /// Read the blocklist.
    ///
    /// If the file does not exist it is created with [`DEFAULT_BLOCKLIST`]
    /// and an empty list is returned.
    ///
    /// # Errors
    /// * `SettingsError::Json` - The file is not a JSON array of strings.
    /// * `SettingsError::Io` - The file could not be read or created.
    pub fn load_blocklist(&self) -> Result<Vec<String>, SettingsError> {
        let path = &self.blocklist_path;
        if !path.exists() {
            write_blocklist_defaults(path)?;
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|source| SettingsError::Json {
            path: path.clone(),
            source,
        })
    }

    /// Read the redirect table.
    ///
    /// If the file does not exist it is created with [`DEFAULT_REDIRECTS`]
    /// and an empty table is returned.
    ///
    /// # Errors
    /// * `SettingsError::Json` - The file is not a JSON object of strings.
    /// * `SettingsError::Io` - The file could not be read or created.
    pub fn load_redirects(&self) -> Result<Vec<(String, String)>, SettingsError> {
        let path = &self.redirects_path;
        if !path.exists() {
            write_redirects_defaults(path)?;
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(path)?;
        let table: BTreeMap<String, String> =
            serde_json::from_str(&contents).map_err(|source| SettingsError::Json {
                path: path.clone(),
                source,
            })?;
        Ok(table.into_iter().collect())
    }

    /// Write the sample files, leaving existing ones untouched.
    ///
    /// Returns the paths that were created.
    ///
    /// # Errors
    /// * `SettingsError::Io` - A file or its parent directory could not be written.
    pub fn write_defaults(&self) -> Result<Vec<PathBuf>, SettingsError> {
        let mut created = Vec::new();
        if !self.blocklist_path.exists() {
            write_blocklist_defaults(&self.blocklist_path)?;
            created.push(self.blocklist_path.clone());
        }
        if !self.redirects_path.exists() {
            write_redirects_defaults(&self.redirects_path)?;
            created.push(self.redirects_path.clone());
        }
        Ok(created)
    }
}

fn write_blocklist_defaults(path: &Path) -> Result<(), SettingsError> {
    write_json(path, &DEFAULT_BLOCKLIST)?;
    info!(path = %path.display(), "Created default blocklist file");
    Ok(())
}

fn write_redirects_defaults(path: &Path) -> Result<(), SettingsError> {
    let table: BTreeMap<&str, &str> = DEFAULT_REDIRECTS.iter().copied().collect();
    write_json(path, &table)?;
    info!(path = %path.display(), "Created default redirects file");
    Ok(())
}

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(value).map_err(|source| SettingsError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, contents)?;
    Ok(())
}
