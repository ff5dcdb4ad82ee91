//! Secrets store.
//!
//! Private keys and explorer API keys are kept out of the project configuration, in a
//! per-user TOML file. Any entry can be overridden for a single run with a
//! `SILENS_VAR_<NAME>` environment variable.

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

/// Prefix of environment variables overriding stored vars.
pub const VAR_ENV_PREFIX: &str = "SILENS_VAR_";

const VARS_FILENAME: &str = "vars.toml";

/// Named secrets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vars {
    values: BTreeMap<String, String>,
}

impl Vars {
    /// `<config dir>/silens/vars.toml`.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine the user config directory")?;
        Ok(config_dir.join("silens").join(VARS_FILENAME))
    }

    /// Load the store at `path`. A missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vars from {}", path.display()))?;
        let values = toml::from_str(&content)
            .with_context(|| format!("Failed to parse vars file {}", path.display()))?;

        Ok(Self { values })
    }

    /// Write the store to `path`, readable by the owner only.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let content = toml::to_string(&self.values).context("Failed to serialize vars")?;
        let mut file = open_private(path)
            .with_context(|| format!("Failed to open vars file {}", path.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("Failed to write vars to {}", path.display()))?;

        Ok(())
    }

    /// Overlay `SILENS_VAR_*` entries of `env` on top of the stored values.
    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        for (key, value) in env {
            if let Some(name) = key.strip_prefix(VAR_ENV_PREFIX) {
                if !name.is_empty() {
                    self.values.insert(name.to_string(), value);
                }
            }
        }
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Like [`Vars::get`], failing with a hint on how to set a missing var.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name).with_context(|| {
            format!(
                "Var {} is not set. Set it with `silens vars set {}` or the {}{} environment variable",
                name, name, VAR_ENV_PREFIX, name
            )
        })
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Remove a var, returning whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        self.values.remove(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// Open `path` for writing with owner-only permissions, before any secret reaches it.
#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    // The mode only applies to files created by this call.
    if path.exists() {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new("silens-vars").expect("Failed to create temp dir");
        let path = temp_dir.path().join("silens").join(VARS_FILENAME);

        let mut vars = Vars::default();
        vars.set("PRIVATE_KEY", "0x01");
        vars.set("ETHERSCAN_API_KEY", "key");
        vars.save(&path).unwrap();

        let loaded = Vars::load(&path).unwrap();
        assert_eq!(loaded, vars);
        assert_eq!(
            loaded.names().collect::<Vec<_>>(),
            vec!["ETHERSCAN_API_KEY", "PRIVATE_KEY"]
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_save_restricts_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new("silens-vars").expect("Failed to create temp dir");
        let path = temp_dir.path().join(VARS_FILENAME);
        std::fs::write(&path, "").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        Vars::default().with("PRIVATE_KEY", "0x01").save(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(Vars::load(&path).unwrap().get("PRIVATE_KEY"), Some("0x01"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new("silens-vars").expect("Failed to create temp dir");
        let vars = Vars::load(&temp_dir.path().join(VARS_FILENAME)).unwrap();
        assert_eq!(vars.names().count(), 0);
    }

    #[test]
    fn test_env_overrides_stored_values() {
        let vars = Vars::default()
            .with("PRIVATE_KEY", "0xstored")
            .with_env([
                ("SILENS_VAR_PRIVATE_KEY".to_string(), "0xenv".to_string()),
                ("SILENS_VERBOSITY".to_string(), "debug".to_string()),
                ("SILENS_VAR_".to_string(), "ignored".to_string()),
            ]);

        assert_eq!(vars.get("PRIVATE_KEY"), Some("0xenv"));
        assert_eq!(vars.names().count(), 1);
    }

    #[test]
    fn test_require_and_remove() {
        let mut vars = Vars::default().with("PRIVATE_KEY", "0x01");
        assert_eq!(vars.require("PRIVATE_KEY").unwrap(), "0x01");

        assert!(vars.remove("PRIVATE_KEY"));
        assert!(!vars.remove("PRIVATE_KEY"));

        let err = vars.require("PRIVATE_KEY").unwrap_err();
        assert!(err.to_string().contains("SILENS_VAR_PRIVATE_KEY"));
    }
}
