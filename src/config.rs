use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compression::Compression;
use crate::error::{Error, IoResultExt, Result};
use crate::types::ManifestType;

/// store configuration stored in config.toml
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// defaults applied to commit and push when the caller doesn't override them
    #[serde(default)]
    pub defaults: Defaults,
    /// named export destinations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remotes: Vec<Remote>,
}

impl Config {
    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    /// add a remote
    pub fn add_remote(
        &mut self,
        name: impl Into<String>,
        destination: impl Into<String>,
    ) -> Result<()> {
        let name = name.into();
        if self.remotes.iter().any(|r| r.name == name) {
            return Err(Error::RemoteExists(name));
        }
        self.remotes.push(Remote {
            name,
            destination: destination.into(),
        });
        Ok(())
    }

    /// remove a remote
    pub fn remove_remote(&mut self, name: &str) -> Result<()> {
        let pos = self
            .remotes
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| Error::RemoteNotFound(name.to_string()))?;
        self.remotes.remove(pos);
        Ok(())
    }

    /// get remote by name
    pub fn get_remote(&self, name: &str) -> Option<&Remote> {
        self.remotes.iter().find(|r| r.name == name)
    }

    /// expand a remote name into its destination, passing anything else through
    pub fn resolve_destination<'a>(&'a self, dest: &'a str) -> &'a str {
        self.get_remote(dest)
            .map(|r| r.destination.as_str())
            .unwrap_or(dest)
    }
}

/// commit/push defaults
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    /// signature policy used instead of the system-wide one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_policy_path: Option<PathBuf>,
    #[serde(default)]
    pub manifest_type: ManifestType,
    #[serde(default)]
    pub compression: Compression,
}

/// a named export destination, e.g. `docker://registry.example/app`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub name: String,
    pub destination: String,
}

impl Remote {
    pub fn new(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
        }
    }
}
