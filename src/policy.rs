//! signature policy: which images may be copied where

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{repository, ImageReference};

/// system-wide policy used when nothing else is configured
pub const DEFAULT_POLICY_PATH: &str = "/etc/containers/policy.json";

/// a parsed `policy.json`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub default: Vec<Requirement>,
    /// transport name -> scope -> requirements
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub transports: BTreeMap<String, BTreeMap<String, Vec<Requirement>>>,
}

impl Policy {
    /// a policy accepting everything
    pub fn insecure_accept_anything() -> Self {
        Self {
            default: vec![Requirement::InsecureAcceptAnything],
            transports: BTreeMap::new(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let invalid = |message: String| Error::InvalidPolicy {
            path: path.to_path_buf(),
            message,
        };

        let data = std::fs::read(path).map_err(|e| invalid(e.to_string()))?;
        let policy: Policy = serde_json::from_slice(&data).map_err(|e| invalid(e.to_string()))?;
        if policy.default.is_empty() {
            return Err(invalid("default policy is empty".to_string()));
        }
        Ok(policy)
    }

    /// requirements for a reference: the most specific scope wins, then the
    /// transport-wide `""` scope, then the default
    fn requirements_for(&self, reference: &ImageReference) -> &[Requirement] {
        if let Some(scopes) = self.transports.get(reference.transport().name()) {
            for scope in candidate_scopes(reference) {
                if let Some(requirements) = scopes.get(&scope) {
                    return requirements;
                }
            }
        }
        &self.default
    }
}

fn candidate_scopes(reference: &ImageReference) -> Vec<String> {
    let mut scopes = Vec::new();
    if let Some(name) = reference.name() {
        scopes.push(name.to_string());
        let mut repo = repository(name);
        scopes.push(repo.to_string());
        while let Some((parent, _)) = repo.rsplit_once('/') {
            scopes.push(parent.to_string());
            repo = parent;
        }
    }
    if let Some(path) = reference.path() {
        let mut path = Some(path);
        while let Some(p) = path {
            scopes.push(p.display().to_string());
            path = p.parent();
        }
    }
    scopes.push(String::new());
    scopes.dedup();
    scopes
}

/// one policy requirement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Requirement {
    InsecureAcceptAnything,
    Reject,
    /// accepted syntactically; signatures are not verified
    SignedBy {
        #[serde(default, rename = "keyType", skip_serializing_if = "Option::is_none")]
        key_type: Option<String>,
        #[serde(default, rename = "keyPath", skip_serializing_if = "Option::is_none")]
        key_path: Option<PathBuf>,
    },
    #[serde(other)]
    Unknown,
}

/// builds policies and the contexts that evaluate them
pub trait PolicyEngine {
    /// load the policy at `path`, or the default one
    fn default_policy(&self, path: Option<&Path>) -> Result<Policy>;

    fn new_context(&self, policy: Policy) -> Result<PolicyContext>;
}

impl<T: PolicyEngine + ?Sized> PolicyEngine for &T {
    fn default_policy(&self, path: Option<&Path>) -> Result<Policy> {
        (**self).default_policy(path)
    }

    fn new_context(&self, policy: Policy) -> Result<PolicyContext> {
        (**self).new_context(policy)
    }
}

/// reads containers-style `policy.json` files.
///
/// without an explicit path, `$HOME/.config/containers/policy.json` is used if
/// present, otherwise [`DEFAULT_POLICY_PATH`]
#[derive(Clone, Debug, Default)]
pub struct FilePolicyEngine {
    system_path: Option<PathBuf>,
}

impl FilePolicyEngine {
    /// use a different system-wide policy file
    pub fn with_system_path(path: impl Into<PathBuf>) -> Self {
        Self {
            system_path: Some(path.into()),
        }
    }

    fn default_path(&self) -> PathBuf {
        if let Some(path) = &self.system_path {
            return path.clone();
        }
        if let Some(home) = std::env::var_os("HOME") {
            let user = Path::new(&home).join(".config/containers/policy.json");
            if user.exists() {
                return user;
            }
        }
        PathBuf::from(DEFAULT_POLICY_PATH)
    }
}

impl PolicyEngine for FilePolicyEngine {
    fn default_policy(&self, path: Option<&Path>) -> Result<Policy> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_path());
        debug!(path = %path.display(), "loading signature policy");
        Policy::from_file(&path)
    }

    fn new_context(&self, policy: Policy) -> Result<PolicyContext> {
        Ok(PolicyContext { policy })
    }
}

/// evaluates a policy for individual copies
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyContext {
    policy: Policy,
}

impl PolicyContext {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// may an image from `source` be copied
    pub fn check(&self, source: &ImageReference) -> Result<()> {
        let requirements = self.policy.requirements_for(source);
        if requirements.is_empty()
            || requirements
                .iter()
                .any(|r| matches!(r, Requirement::Reject | Requirement::Unknown))
        {
            return Err(Error::PolicyRejected(source.to_string()));
        }
        Ok(())
    }
}
