//! Configuration session
//!
//! [`KasConfig::load`] drives include resolution to a fixed point: every
//! pass may name repositories that are not available yet, those are made
//! available through a [`RepoFetcher`] and the pass is repeated.

use crate::include_graph::{
    absolute, IncludeError, IncludeHandler, IncludeOptions, MissingRepos, RepoPaths, SourceDirPolicy,
};
use crate::repository_manager::{Repo, RepoError, RepoFetcher, RepoRegistry};
use crate::schema::ConfigSchema;
use futures::future::try_join_all;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT_MACHINE: &str = "qemux86-64";
const DEFAULT_DISTRO: &str = "poky";
const DEFAULT_TARGET: &str = "core-image-minimal";
const DEFAULT_TASK: &str = "build";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Include(#[from] IncludeError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error("All concatenated config files must belong to the same repository or all must be outside of versioning control")]
    MixedRepositories,

    #[error("Failed to serialize configuration: {0}")]
    Serialize(String),
}

/// Output format of [`KasConfig::dump`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DumpFormat {
    #[default]
    Yaml,
    Json,
}

/// Options of a configuration session
#[derive(Debug, Clone)]
pub struct ConfigOptions<'s> {
    /// Directory below which remote repositories live, the current
    /// directory if unset
    pub work_dir: Option<PathBuf>,
    pub include: IncludeOptions<'s>,
    /// Replaces `target` of the configuration when not empty
    pub target: Vec<String>,
    /// Replaces `task` of the configuration
    pub task: Option<String>,
}

impl Default for ConfigOptions<'static> {
    fn default() -> Self {
        Self {
            work_dir: None,
            include: IncludeOptions::default(),
            target: Vec::new(),
            task: None,
        }
    }
}

impl<'s> ConfigOptions<'s> {
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    pub fn with_lock(mut self, use_lock: bool) -> Self {
        self.include = self.include.with_lock(use_lock);
        self
    }

    pub fn with_source_dir_policy(mut self, policy: SourceDirPolicy) -> Self {
        self.include = self.include.with_source_dir_policy(policy);
        self
    }

    pub fn with_schema<'t>(self, schema: &'t ConfigSchema) -> ConfigOptions<'t> {
        ConfigOptions {
            work_dir: self.work_dir,
            include: self.include.with_schema(schema),
            target: self.target,
            task: self.task,
        }
    }

    pub fn with_target<I, S>(mut self, target: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target = target.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }
}

/// A fully resolved configuration
#[derive(Debug)]
pub struct KasConfig {
    config: Mapping,
    top_files: Vec<PathBuf>,
    top_repo_path: PathBuf,
    work_dir: PathBuf,
    repos: Vec<Arc<Repo>>,
    repo_paths: RepoPaths,
    lockfiles: Vec<PathBuf>,
}

impl KasConfig {
    /// Resolve `files` (merged in the given order) into one configuration
    pub async fn load(
        files: &[PathBuf],
        options: &ConfigOptions<'_>,
        fetcher: &dyn RepoFetcher,
    ) -> Result<Self, ConfigError> {
        let top_files: Vec<PathBuf> = files.iter().map(|f| absolute(f)).collect();
        let top_repo_path = find_top_repo_path(&top_files)?;
        let work_dir = match &options.work_dir {
            Some(dir) => absolute(dir),
            None => absolute(Path::new(".")),
        };
        info!("Using {} as top repository", top_repo_path.display());

        let mut handler = IncludeHandler::new(top_files.clone(), &top_repo_path, options.include);
        let mut registry = RepoRegistry::new();
        let mut repo_paths = RepoPaths::new();
        let mut previous: Option<MissingRepos> = None;

        let (mut config, repos) = loop {
            let (config, missing) = handler.get_config(&repo_paths)?;
            let repos = registry.repos_from_config(&config, &top_repo_path, &work_dir)?;
            if missing.is_empty() {
                break (config, repos);
            }
            if previous.as_ref() == Some(&missing) {
                return Err(IncludeError::UnresolvedRepos(missing).into());
            }
            debug!("Missing repos for complete config: {}", missing);

            let mut to_fetch = Vec::new();
            for name in missing.iter() {
                let Some(repo) = repos.iter().find(|r| r.key == name) else {
                    debug!("Repo {} is referenced by an include but not declared yet", name);
                    continue;
                };
                if repo.operations_disabled {
                    repo_paths.insert(repo.key.clone(), repo.path.clone());
                } else {
                    to_fetch.push(Arc::clone(repo));
                }
            }

            let fetched = try_join_all(to_fetch.iter().map(|repo| fetcher.fetch(repo))).await?;
            for (repo, path) in to_fetch.iter().zip(fetched) {
                repo_paths.insert(repo.key.clone(), path);
            }
            previous = Some(missing);
        };

        if !options.target.is_empty() {
            let target = match options.target.as_slice() {
                [single] => Value::from(single.as_str()),
                many => Value::Sequence(many.iter().map(|t| Value::from(t.as_str())).collect()),
            };
            config.insert("target".into(), target);
        }
        if let Some(task) = &options.task {
            config.insert("task".into(), task.as_str().into());
        }

        let lockfiles = handler.lockfiles().into_iter().map(Path::to_path_buf).collect();
        Ok(Self {
            config,
            top_files,
            top_repo_path,
            work_dir,
            repos,
            repo_paths,
            lockfiles,
        })
    }

    /// The flattened configuration
    pub fn config(&self) -> &Mapping {
        &self.config
    }

    pub fn top_files(&self) -> &[PathBuf] {
        &self.top_files
    }

    pub fn top_repo_path(&self) -> &Path {
        &self.top_repo_path
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn build_dir(&self) -> PathBuf {
        self.work_dir.join("build")
    }

    /// Repositories declared by the configuration, in declaration order
    pub fn repos(&self) -> &[Arc<Repo>] {
        &self.repos
    }

    /// Local paths of the repositories that were needed for includes
    pub fn repo_paths(&self) -> &RepoPaths {
        &self.repo_paths
    }

    /// Lockfiles that took part in the resolution
    pub fn lockfiles(&self) -> &[PathBuf] {
        &self.lockfiles
    }

    pub fn machine(&self) -> &str {
        self.str_entry("machine").unwrap_or(DEFAULT_MACHINE)
    }

    pub fn distro(&self) -> &str {
        self.str_entry("distro").unwrap_or(DEFAULT_DISTRO)
    }

    /// Build targets, `target` may be a single name or a list
    pub fn targets(&self) -> Vec<String> {
        match self.config.get("target") {
            Some(Value::String(target)) => vec![target.clone()],
            Some(Value::Sequence(targets)) => targets
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => vec![DEFAULT_TARGET.to_string()],
        }
    }

    pub fn task(&self) -> &str {
        self.str_entry("task").unwrap_or(DEFAULT_TASK)
    }

    /// Variables of the `env` section, `None` means "take from the host"
    pub fn env(&self) -> BTreeMap<String, Option<String>> {
        let mut env = BTreeMap::new();
        for (key, value) in self.section("env") {
            let Some(key) = key.as_str() else {
                continue;
            };
            let value = match value {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => continue,
            };
            env.insert(key.to_string(), value);
        }
        env
    }

    pub fn local_conf_header(&self) -> String {
        self.conf_header("local_conf_header")
    }

    pub fn bblayers_conf_header(&self) -> String {
        self.conf_header("bblayers_conf_header")
    }

    /// Serialize the flattened configuration
    pub fn dump(&self, format: DumpFormat) -> Result<String, ConfigError> {
        match format {
            DumpFormat::Yaml => {
                serde_yaml::to_string(&self.config).map_err(|e| ConfigError::Serialize(e.to_string()))
            }
            DumpFormat::Json => serde_json::to_string_pretty(&self.config)
                .map(|mut out| {
                    out.push('\n');
                    out
                })
                .map_err(|e| ConfigError::Serialize(e.to_string())),
        }
    }

    fn str_entry(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    fn section(&self, key: &str) -> impl Iterator<Item = (&Value, &Value)> {
        self.config
            .get(key)
            .and_then(Value::as_mapping)
            .into_iter()
            .flat_map(|m| m.iter())
    }

    // Fragments are concatenated in key order, each under a "# <key>" line.
    fn conf_header(&self, key: &str) -> String {
        let mut fragments: Vec<(&str, &str)> = self
            .section(key)
            .filter_map(|(k, v)| Some((k.as_str()?, v.as_str()?)))
            .collect();
        fragments.sort_by(|a, b| a.0.cmp(b.0));

        let mut header = String::new();
        for (name, content) in fragments {
            header.push_str("# ");
            header.push_str(name);
            header.push('\n');
            header.push_str(content);
            if !content.ends_with('\n') {
                header.push('\n');
            }
        }
        header
    }
}

/// Root of the repository the top files live in
///
/// The git work tree containing the first file, or its directory when the
/// file is not under version control.
pub fn find_top_repo_path(files: &[PathBuf]) -> Result<PathBuf, ConfigError> {
    let first = files.first().ok_or(IncludeError::NoConfiguration)?;
    let root = repo_root_of(first);
    if files[1..].iter().any(|f| repo_root_of(f) != root) {
        return Err(ConfigError::MixedRepositories);
    }
    Ok(root)
}

fn repo_root_of(file: &Path) -> PathBuf {
    let dir = file.parent().unwrap_or_else(|| Path::new("."));
    match git2::Repository::discover(dir) {
        Ok(repo) => match repo.workdir() {
            Some(workdir) => absolute(workdir),
            None => absolute(dir),
        },
        Err(e) => {
            debug!("{} is not in a git repository: {}", dir.display(), e.message());
            absolute(dir)
        }
    }
}
