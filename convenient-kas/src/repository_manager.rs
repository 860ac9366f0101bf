//! Repository handles for kas configurations
//!
//! Turns the `repos` section of a (possibly partially) resolved
//! configuration into [`Repo`] handles and defines how repositories are
//! made available locally ([`RepoFetcher`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DISABLED_LAYER_VALUES: &[&str] = &["disabled", "excluded", "n", "no", "0", "false"];

/// Repository configuration as written in `repos.<name>`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RepoSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub repo_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Legacy single reference, superseded by commit/tag/branch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refspec: Option<String>,
    /// Local path, relative paths start at the work directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub signed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_signers: Option<Vec<String>>,
    /// Layer name → enable flag, `None` means the repository root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layers: Option<Mapping>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patches: Option<BTreeMap<String, Option<PatchSpec>>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PatchSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    pub path: String,
}

/// `defaults.repos`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RepoDefaults {
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub refspec: Option<String>,
    #[serde(default)]
    pub patches: PatchDefaults,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PatchDefaults {
    pub repo: Option<String>,
}

/// `overrides.repos.<name>`, written by lockfiles
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RepoOverride {
    pub commit: Option<String>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RepoType {
    Git,
    Mercurial,
}

/// A patch to apply on top of a repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub id: String,
    pub repo: String,
    pub path: String,
}

/// A repository of the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Repo {
    /// Key under `repos`, the name includes refer to
    pub key: String,
    pub name: String,
    pub url: Option<String>,
    pub path: PathBuf,
    pub repo_type: RepoType,
    pub commit: Option<String>,
    pub tag: Option<String>,
    pub branch: Option<String>,
    pub refspec: Option<String>,
    pub layers: Vec<String>,
    pub patches: Vec<Patch>,
    pub allowed_signers: Option<Vec<String>>,
    /// No VCS operation is performed on repositories without url
    pub operations_disabled: bool,
}

impl Repo {
    /// Absolute paths of the enabled layers
    pub fn layer_paths(&self) -> Vec<PathBuf> {
        self.layers
            .iter()
            .map(|layer| {
                if layer.is_empty() || layer == "." {
                    self.path.clone()
                } else {
                    self.path.join(layer)
                }
            })
            .collect()
    }

    /// The reference the repository should be checked out at
    pub fn revision(&self) -> Option<&str> {
        self.commit
            .as_deref()
            .or(self.tag.as_deref())
            .or(self.branch.as_deref())
            .or(self.refspec.as_deref())
    }

    /// Whether the checkout may move without a configuration change
    pub fn is_floating(&self) -> bool {
        !self.operations_disabled && self.commit.is_none()
    }
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Invalid configuration for repository {0}: {1}")]
    InvalidSpec(String, String),

    #[error(
        "No commit, tag or branch specified for repository \"{0}\". This is only allowed for local repositories."
    )]
    MissingReference(String),

    #[error("Unsupported mixture of legacy refspec and commit/tag/branch for repository \"{0}\"")]
    MixedRefspec(String),

    #[error("Repo type \"{0}\" not supported.")]
    UnsupportedType(String),

    #[error("Repository \"{0}\" is signed but no allowed signers specified.")]
    MissingSigners(String),

    #[error("No repo specified for patch entry \"{0}\" and no default repo specified.")]
    PatchMapping(String),

    #[error("Repository {0} is not available at {1}")]
    NotAvailable(String, PathBuf),

    #[error("Fetching repository {0} failed: {1}")]
    FetchFailed(String, String),
}

/// Makes repositories available on the local file system
///
/// Implementations may be called concurrently for different repositories
/// and repeatedly for the same one.
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    /// Make `repo` available and return its local path
    async fn fetch(&self, repo: &Repo) -> Result<PathBuf, RepoError>;
}

/// Uses checkouts that already exist in the work directory
///
/// Never talks to a remote; useful for offline resolution and for
/// re-resolving a configuration whose repositories were checked out before.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkdirFetcher;

#[async_trait]
impl RepoFetcher for WorkdirFetcher {
    async fn fetch(&self, repo: &Repo) -> Result<PathBuf, RepoError> {
        match tokio::fs::metadata(&repo.path).await {
            Ok(meta) if meta.is_dir() => {
                debug!("Using existing checkout of {} at {}", repo.name, repo.path.display());
                Ok(repo.path.clone())
            }
            _ => Err(RepoError::NotAvailable(repo.name.clone(), repo.path.clone())),
        }
    }
}

/// Inputs of [`Repo`] construction, serialized to key the registry cache
#[derive(Serialize)]
struct RepoKey<'a> {
    name: &'a str,
    spec: &'a RepoSpec,
    defaults: &'a RepoDefaults,
    overrides: &'a RepoOverride,
    top_repo_path: &'a Path,
    work_dir: &'a Path,
}

/// Session-scoped factory for [`Repo`] handles
///
/// Identical inputs yield the same shared handle. One-time warnings are
/// remembered per repository name.
#[derive(Debug, Default)]
pub struct RepoRegistry {
    cache: HashMap<String, Arc<Repo>>,
    warned: HashSet<(String, &'static str)>,
}

impl RepoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct handles created so far
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// All repositories of `config`, in declaration order
    pub fn repos_from_config(
        &mut self,
        config: &Mapping,
        top_repo_path: &Path,
        work_dir: &Path,
    ) -> Result<Vec<Arc<Repo>>, RepoError> {
        let defaults: RepoDefaults = section(config, &["defaults", "repos"], "defaults")?;
        let overrides: BTreeMap<String, RepoOverride> =
            section(config, &["overrides", "repos"], "overrides")?;

        let Some(repos) = config.get("repos").and_then(Value::as_mapping) else {
            return Ok(Vec::new());
        };

        let mut result = Vec::with_capacity(repos.len());
        for (name, spec) in repos {
            let Some(name) = name.as_str() else {
                continue;
            };
            let spec: RepoSpec = match spec {
                Value::Null => RepoSpec::default(),
                other => serde_yaml::from_value(other.clone())
                    .map_err(|e| RepoError::InvalidSpec(name.to_string(), e.to_string()))?,
            };
            let repo_override = overrides.get(name).cloned().unwrap_or_default();
            result.push(self.get_or_create(name, &spec, &defaults, &repo_override, top_repo_path, work_dir)?);
        }
        Ok(result)
    }

    /// Create the handle for one repository, or return the cached one
    pub fn get_or_create(
        &mut self,
        name: &str,
        spec: &RepoSpec,
        defaults: &RepoDefaults,
        overrides: &RepoOverride,
        top_repo_path: &Path,
        work_dir: &Path,
    ) -> Result<Arc<Repo>, RepoError> {
        let key = RepoKey {
            name,
            spec,
            defaults,
            overrides,
            top_repo_path,
            work_dir,
        };
        let digest = cache_key(&key).map_err(|e| RepoError::InvalidSpec(name.to_string(), e))?;
        if let Some(repo) = self.cache.get(&digest) {
            return Ok(Arc::clone(repo));
        }

        let repo = Arc::new(self.build(name, spec, defaults, overrides, top_repo_path, work_dir)?);
        self.cache.insert(digest, Arc::clone(&repo));
        Ok(repo)
    }

    fn build(
        &mut self,
        key_name: &str,
        spec: &RepoSpec,
        defaults: &RepoDefaults,
        overrides: &RepoOverride,
        top_repo_path: &Path,
        work_dir: &Path,
    ) -> Result<Repo, RepoError> {
        let layers = self.enabled_layers(key_name, spec.layers.as_ref());

        let mut patches = Vec::new();
        for (id, patch) in spec.patches.iter().flatten() {
            let Some(patch) = patch else {
                continue;
            };
            let repo = patch
                .repo
                .clone()
                .or_else(|| defaults.patches.repo.clone())
                .ok_or_else(|| RepoError::PatchMapping(id.clone()))?;
            patches.push(Patch {
                id: id.clone(),
                repo,
                path: patch.path.clone(),
            });
        }

        let name = spec.name.clone().unwrap_or_else(|| key_name.to_string());
        let url = spec.url.clone();
        let mut commit = spec.commit.clone();
        let tag = spec.tag.clone().or_else(|| defaults.tag.clone());
        let mut branch = spec.branch.clone().or_else(|| defaults.branch.clone());
        let mut refspec = spec.refspec.clone().or_else(|| defaults.refspec.clone());

        if commit.is_none() && tag.is_none() && branch.is_none() && refspec.is_none() && url.is_some() {
            return Err(RepoError::MissingReference(name));
        }

        if refspec.is_none() {
            commit = overrides.commit.clone().or(commit);
            branch = overrides.branch.clone().or(branch);
        } else {
            if self.warn_once(&name, "legacy-refspec") {
                warn!(
                    "Using deprecated refspec for repository \"{}\". You should migrate to commit/tag/branch.",
                    name
                );
            }
            if commit.is_some() || tag.is_some() || branch.is_some() {
                return Err(RepoError::MixedRefspec(name));
            }
            if let Some(pinned) = &overrides.commit {
                refspec = Some(pinned.clone());
            }
        }

        if tag.is_some() && commit.is_none() && self.warn_once(&name, "tag-without-commit") {
            warn!(
                "Using tag without commit for repository \"{}\" is unsafe as tags are mutable.",
                name
            );
        }

        let allowed_signers = if spec.signed {
            match &spec.allowed_signers {
                Some(signers) if !signers.is_empty() => Some(signers.clone()),
                _ => return Err(RepoError::MissingSigners(name)),
            }
        } else {
            None
        };

        let path = match (&spec.path, &url) {
            (None, None) => {
                info!("Using {} as root for repository {}", top_repo_path.display(), name);
                top_repo_path.to_path_buf()
            }
            (None, Some(_)) => work_dir.join(&name),
            (Some(path), _) if Path::new(path).is_absolute() => PathBuf::from(path),
            (Some(path), _) => work_dir.join(path),
        };

        let repo_type = match spec.repo_type.as_deref().unwrap_or("git") {
            "git" => RepoType::Git,
            "hg" => RepoType::Mercurial,
            other => return Err(RepoError::UnsupportedType(other.to_string())),
        };

        if repo_type == RepoType::Git {
            if let Some(commit) = &commit {
                if !is_full_hash(commit) {
                    warn!(
                        "{} is not a full-length hash for repo \"{}\". This will be an error in future versions.",
                        commit, name
                    );
                }
            }
        }

        Ok(Repo {
            key: key_name.to_string(),
            name,
            operations_disabled: url.is_none(),
            url,
            path,
            repo_type,
            commit,
            tag,
            branch,
            refspec,
            layers,
            patches,
            allowed_signers,
        })
    }

    fn enabled_layers(&mut self, name: &str, layers: Option<&Mapping>) -> Vec<String> {
        let Some(layers) = layers else {
            return vec![String::new()];
        };
        let mut enabled = Vec::new();
        for (layer, flag) in layers {
            let Some(layer) = layer.as_str() else {
                continue;
            };
            let flag_text = match flag {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                Value::Bool(b) => Some(b.to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => Some(String::new()),
            };
            if let Some(text) = &flag_text {
                if text != "disabled" && self.warn_once(&format!("{name}/{layer}"), "layer-value") {
                    warn!(
                        "Use of deprecated value \"{}\" for repo \"{}\", layer \"{}\". Replace with \"disabled\".",
                        text, name, layer
                    );
                }
                if DISABLED_LAYER_VALUES.contains(&text.to_lowercase().as_str()) {
                    continue;
                }
            }
            enabled.push(layer.to_string());
        }
        enabled
    }

    fn warn_once(&mut self, name: &str, what: &'static str) -> bool {
        self.warned.insert((name.to_string(), what))
    }
}

fn section<T: for<'de> Deserialize<'de> + Default>(
    config: &Mapping,
    path: &[&str],
    label: &str,
) -> Result<T, RepoError> {
    let mut value = config.get(path[0]);
    for key in &path[1..] {
        value = value.and_then(|v| v.get(*key));
    }
    match value {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_yaml::from_value(value.clone())
            .map_err(|e| RepoError::InvalidSpec(label.to_string(), e.to_string())),
    }
}

fn cache_key(key: &RepoKey<'_>) -> Result<String, String> {
    let canonical = serde_json::to_string(key).map_err(|e| e.to_string())?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

fn is_full_hash(commit: &str) -> bool {
    matches!(commit.len(), 40 | 64) && commit.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
