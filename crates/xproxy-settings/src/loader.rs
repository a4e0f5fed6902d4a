//! Layered configuration loading.
//!
//! Loads and merges configuration from, in increasing priority:
//! 1. Global: `~/.config/xproxy/xproxy.toml`
//! 2. Project: `<workspace>/.xproxy/xproxy.toml`
//! 3. An explicit file passed on the command line
//!
//! Missing global and project files are skipped. A file that exists but does
//! not parse is an error.

use crate::{SettingsError, XProxyConfig};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Loads and merges `XProxyConfig` from global, project and explicit files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged configuration for the given workspace.
    ///
    /// # Errors
    /// * `SettingsError::ParseError` - A present file is malformed.
    /// * `SettingsError::Io` - A present file could not be read, or `extra`
    ///   does not exist.
    pub fn load(workspace: &Path, extra: Option<&Path>) -> Result<XProxyConfig, SettingsError> {
        let global = Self::load_optional(&Self::global_config_path())?;
        let project = Self::load_optional(&Self::project_config_path(workspace))?;
        let mut merged = global.merge(project);
        if let Some(path) = extra {
            debug!(path = %path.display(), "Loading config");
            merged = merged.merge(XProxyConfig::load(path)?);
        }
        Ok(merged)
    }

    /// Absolute path to the global config file.
    pub fn global_config_path() -> PathBuf {
        Self::global_config_dir()
            .unwrap_or_else(|| PathBuf::from(".xproxy"))
            .join("xproxy.toml")
    }

    /// Absolute path to the project config file for the given workspace.
    pub fn project_config_path(workspace: &Path) -> PathBuf {
        Self::project_config_dir(workspace).join("xproxy.toml")
    }

    fn global_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("xproxy"))
    }

    fn project_config_dir(workspace: &Path) -> PathBuf {
        workspace.join(".xproxy")
    }

    fn load_optional(path: &Path) -> Result<XProxyConfig, SettingsError> {
        if !path.exists() {
            return Ok(XProxyConfig::default());
        }
        debug!(path = %path.display(), "Loading config");
        XProxyConfig::load(path)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_project_config_only() {
        let dir = tempfile::tempdir().unwrap();
        let xproxy_dir = dir.path().join(".xproxy");
        fs::create_dir_all(&xproxy_dir).unwrap();
        fs::write(
            xproxy_dir.join("xproxy.toml"),
            "[proxy]\nport = 3128\n[policy]\nblocklist_path = \"block.json\"\n",
        )
        .unwrap();

        let project = ConfigLoader::load_optional(&ConfigLoader::project_config_path(dir.path()))
            .unwrap();
        assert_eq!(project.proxy.port(), 3128);
        assert_eq!(project.policy.blocklist_path(), PathBuf::from("block.json"));
    }

    #[test]
    fn test_load_optional_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::load_optional(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, XProxyConfig::default());
    }

    #[test]
    fn test_project_config_path() {
        let path = ConfigLoader::project_config_path(Path::new("/workspace"));
        assert_eq!(path, PathBuf::from("/workspace/.xproxy/xproxy.toml"));
    }

    #[test]
    fn test_global_config_path_ends_with_xproxy_toml() {
        let path = ConfigLoader::global_config_path();
        assert!(path.ends_with("xproxy.toml"));
        assert!(path.to_string_lossy().contains("xproxy"));
    }

    #[test]
    fn test_load_malformed_project_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let xproxy_dir = dir.path().join(".xproxy");
        fs::create_dir_all(&xproxy_dir).unwrap();
        fs::write(xproxy_dir.join("xproxy.toml"), "not valid toml :::").unwrap();

        let result = ConfigLoader::load(dir.path(), None);
        assert!(matches!(result, Err(SettingsError::ParseError(_))));
    }

    #[test]
    fn test_load_extra_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let xproxy_dir = dir.path().join(".xproxy");
        fs::create_dir_all(&xproxy_dir).unwrap();
        fs::write(
            xproxy_dir.join("xproxy.toml"),
            "[proxy]\nport = 3128\nbacklog = 64\n",
        )
        .unwrap();
        let extra = dir.path().join("override.toml");
        fs::write(&extra, "[proxy]\nport = 9999\n").unwrap();

        // Project settings beat any global file, and the explicit file beats both.
        let merged = ConfigLoader::load(dir.path(), Some(&extra)).unwrap();

        assert_eq!(merged.proxy.port(), 9999);
        assert_eq!(merged.proxy.backlog(), 64);
    }

    #[test]
    fn test_load_missing_extra_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigLoader::load(dir.path(), Some(&dir.path().join("missing.toml")));
        assert!(matches!(result, Err(SettingsError::Io(_))));
    }
}
