//! Include resolution for kas configuration files
//!
//! Configuration files name other files in `header.includes`, either by path
//! (relative to the root of the repository they live in) or as
//! `{repo: <name>, file: <path>}` pairs pointing into other repositories.
//! Those repositories may not be available yet, so a single resolution pass
//! returns the merged configuration together with the names of every
//! repository it could not look into. The caller makes them available and
//! asks again until nothing is missing (see [`crate::config`]).
//!
//! For a top file
//!
//! ```yaml
//! header:
//!   includes:
//!     - include1.yml
//!     - repo: repo1
//!       file: include-repo1.yml
//!     - include2.yml
//! ```
//!
//! the merge order is `include1.yml`, `include-repo1.yml`, `include2.yml`,
//! the sibling lockfile `topfile.lock.yml` (if present) and finally
//! `topfile.yml` itself. Includes are expanded depth first, later files win.

use crate::config_file::{ConfigFile, IncludeRef, LoadConfigError, parse_include};
use crate::lockfile;
use crate::merge::{MergeError, merge};
use crate::schema::ConfigSchema;
use serde_yaml::{Mapping, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Repository name → absolute local path, used for `{repo, file}` includes
pub type RepoPaths = HashMap<String, PathBuf>;

/// Errors of the include mechanism
#[derive(Debug, thiserror::Error)]
pub enum IncludeError {
    #[error(transparent)]
    Load(#[from] LoadConfigError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("Configuration file does not contain a dictionary as base type: {0}")]
    NotAMapping(PathBuf),

    #[error("\"repo\" is not specified: {0}")]
    MissingRepoKey(String),

    #[error("\"file\" is not specified: {0}")]
    MissingFileKey(String),

    #[error("Invalid include entry: {0}")]
    InvalidInclude(String),

    #[error("Circular include detected: {0}")]
    CircularInclude(String),

    #[error("_source_dir is only allowed in generated configuration files: {0}")]
    SourceDirNotAllowed(PathBuf),

    #[error("Could not fetch all repos needed by includes: {0}")]
    UnresolvedRepos(MissingRepos),

    #[error("No configuration file given")]
    NoConfiguration,
}

/// Names of repositories referenced by includes but not in [`RepoPaths`]
///
/// Insertion ordered and free of duplicates, so two passes can be compared
/// directly to detect a lack of progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingRepos(Vec<String>);

impl MissingRepos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `name` unless it is already present
    pub fn push(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.0.contains(&name) {
            self.0.push(name);
        }
    }

    pub fn extend(&mut self, other: MissingRepos) {
        for name in other.0 {
            self.push(name);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for MissingRepos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(", "))
    }
}

impl<S: Into<String>> FromIterator<S> for MissingRepos {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut missing = MissingRepos::new();
        for name in iter {
            missing.push(name);
        }
        missing
    }
}

/// What to do with `_source_dir` in a configuration file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceDirPolicy {
    /// Treat the declared directory as the repository root from here on
    Honor,
    /// Warn and keep the current repository root
    #[default]
    Ignore,
    /// Fail the resolution
    Reject,
}

/// Options of an [`IncludeHandler`]
#[derive(Debug, Clone, Copy)]
pub struct IncludeOptions<'s> {
    /// Merge lockfiles into the result (they are always traversed)
    pub use_lock: bool,
    pub source_dir_policy: SourceDirPolicy,
    pub schema: &'s ConfigSchema,
}

impl Default for IncludeOptions<'static> {
    fn default() -> Self {
        Self {
            use_lock: true,
            source_dir_policy: SourceDirPolicy::default(),
            schema: ConfigSchema::kas(),
        }
    }
}

impl<'s> IncludeOptions<'s> {
    pub fn with_lock(mut self, use_lock: bool) -> Self {
        self.use_lock = use_lock;
        self
    }

    pub fn with_source_dir_policy(mut self, policy: SourceDirPolicy) -> Self {
        self.source_dir_policy = policy;
        self
    }

    pub fn with_schema<'t>(self, schema: &'t ConfigSchema) -> IncludeOptions<'t> {
        IncludeOptions {
            use_lock: self.use_lock,
            source_dir_policy: self.source_dir_policy,
            schema,
        }
    }
}

/// Resolves the includes of a set of top-level configuration files
///
/// One handler lives for a whole configuration session: it remembers which
/// deprecation warnings were already shown and which files took part in
/// the last resolution pass.
#[derive(Debug)]
pub struct IncludeHandler<'s> {
    top_files: Vec<PathBuf>,
    top_repo_path: PathBuf,
    options: IncludeOptions<'s>,
    warned: HashSet<String>,
    configs: Vec<ConfigFile>,
}

impl<'s> IncludeHandler<'s> {
    pub fn new(
        top_files: impl IntoIterator<Item = impl Into<PathBuf>>,
        top_repo_path: impl Into<PathBuf>,
        options: IncludeOptions<'s>,
    ) -> Self {
        Self {
            top_files: top_files.into_iter().map(|f| absolute(&f.into())).collect(),
            top_repo_path: absolute(&top_repo_path.into()),
            options,
            warned: HashSet::new(),
            configs: Vec::new(),
        }
    }

    pub fn top_files(&self) -> &[PathBuf] {
        &self.top_files
    }

    pub fn top_repo_path(&self) -> &Path {
        &self.top_repo_path
    }

    /// Lockfile belonging to the first top file
    pub fn lockfile_path(&self, ext: Option<&str>) -> Option<PathBuf> {
        self.top_files
            .first()
            .map(|f| lockfile::lockfile_path(f, ext))
    }

    /// Every file loaded by the last pass, in merge order
    pub fn configs(&self) -> &[ConfigFile] {
        &self.configs
    }

    /// Lockfiles encountered by the last pass
    pub fn lockfiles(&self) -> Vec<&Path> {
        self.configs
            .iter()
            .filter(|c| c.is_lockfile)
            .map(|c| c.filename.as_path())
            .collect()
    }

    /// Run one resolution pass
    ///
    /// Returns the merged configuration and the repositories that are
    /// referenced by includes but missing from `repos`.
    pub fn get_config(&mut self, repos: &RepoPaths) -> Result<(Mapping, MissingRepos), IncludeError> {
        if self.top_files.is_empty() {
            return Err(IncludeError::NoConfiguration);
        }

        let mut configs = Vec::new();
        let mut missing = MissingRepos::new();
        let top_files = self.top_files.clone();
        let top_repo_path = self.top_repo_path.clone();
        for file in &top_files {
            let mut stack = Vec::new();
            let (cfgs, reps) = self.include_recursive(file, &top_repo_path, false, false, repos, &mut stack)?;
            configs.extend(cfgs);
            missing.extend(reps);
        }

        let selected: Vec<&ConfigFile> = configs
            .iter()
            .filter(|c| self.options.use_lock || !c.is_lockfile)
            .collect();

        let mut merged = Value::Mapping(Mapping::new());
        for file in &selected {
            merged = merge(&merged, &file.config)?;
        }
        let mut config = match merged {
            Value::Mapping(config) => config,
            _ => Mapping::new(),
        };

        let version = selected.iter().filter_map(|c| c.version).max();
        finish_header(&mut config, version);

        debug!(
            "Resolved {} config file(s), {} missing repo(s)",
            selected.len(),
            missing.len()
        );
        self.configs = configs;
        Ok((config, missing))
    }

    fn include_recursive(
        &mut self,
        filename: &Path,
        repo_path: &Path,
        is_external: bool,
        is_lockfile: bool,
        repos: &RepoPaths,
        stack: &mut Vec<PathBuf>,
    ) -> Result<(Vec<ConfigFile>, MissingRepos), IncludeError> {
        if stack.iter().any(|p| p == filename) {
            let chain: Vec<String> = stack
                .iter()
                .chain(std::iter::once(&filename.to_path_buf()))
                .map(|p| p.display().to_string())
                .collect();
            return Err(IncludeError::CircularInclude(chain.join(" -> ")));
        }

        let is_lockfile = is_lockfile || lockfile::is_lockfile(filename);
        let current = ConfigFile::load(filename, is_external, is_lockfile, self.options.schema)?;
        if current.mapping().is_none() {
            return Err(IncludeError::NotAMapping(filename.to_path_buf()));
        }

        let repo_path = self.effective_repo_path(&current, repo_path)?;

        stack.push(filename.to_path_buf());
        let mut configs = Vec::new();
        let mut missing = MissingRepos::new();

        for value in current.include_values() {
            match parse_include(value)? {
                IncludeRef::Path(include) => {
                    let include_file = self.resolve_local_include(filename, &repo_path, &include);
                    let (cfgs, reps) =
                        self.include_recursive(&include_file, &repo_path, is_external, false, repos, stack)?;
                    configs.extend(cfgs);
                    missing.extend(reps);
                }
                IncludeRef::Repo { repo, file } => match repos.get(&repo) {
                    Some(include_dir) => {
                        let include_dir = absolute(include_dir);
                        let include_file = normalize(&include_dir.join(&file));
                        let external = include_dir != self.top_repo_path;
                        let (cfgs, reps) =
                            self.include_recursive(&include_file, &include_dir, external, false, repos, stack)?;
                        configs.extend(cfgs);
                        missing.extend(reps);
                    }
                    None => {
                        debug!("Include {} needs repo {} which is not available yet", file, repo);
                        missing.push(repo);
                    }
                },
            }
        }

        if !current.is_lockfile {
            let lockfile = current.lockfile_path(None);
            if lockfile.exists() {
                debug!("Using lockfile {}", lockfile.display());
                let (cfgs, reps) = self.include_recursive(&lockfile, &repo_path, is_external, true, repos, stack)?;
                configs.extend(cfgs);
                missing.extend(reps);
            }
        }

        stack.pop();
        configs.push(current);
        Ok((configs, missing))
    }

    fn effective_repo_path(&mut self, current: &ConfigFile, repo_path: &Path) -> Result<PathBuf, IncludeError> {
        let Some(source_dir) = &current.source_dir else {
            return Ok(repo_path.to_path_buf());
        };
        match self.options.source_dir_policy {
            SourceDirPolicy::Honor => {
                debug!(
                    "Using {} as repository root for includes of {}",
                    source_dir.display(),
                    current.filename.display()
                );
                Ok(absolute(source_dir))
            }
            SourceDirPolicy::Ignore => {
                if self.warned.insert(format!("source-dir:{}", current.filename.display())) {
                    warn!(
                        "Ignoring {} in {}: only generated configuration files may relocate the repository root",
                        crate::config_file::SOURCE_DIR_KEY,
                        current.filename.display()
                    );
                }
                Ok(repo_path.to_path_buf())
            }
            SourceDirPolicy::Reject => Err(IncludeError::SourceDirNotAllowed(current.filename.clone())),
        }
    }

    fn resolve_local_include(&mut self, filename: &Path, repo_path: &Path, include: &str) -> PathBuf {
        let include_path = Path::new(include);
        if include_path.is_absolute() {
            return normalize(include_path);
        }

        let repo_relative = normalize(&repo_path.join(include_path));
        if repo_relative.exists() {
            return repo_relative;
        }

        let base = filename.parent().unwrap_or_else(|| Path::new("."));
        let file_relative = normalize(&base.join(include_path));
        if file_relative.exists() {
            if self.warned.insert(format!("file-relative:{}", repo_path.display())) {
                warn!(
                    "Falling back to file-relative addressing of local include \"{}\" in {}",
                    include,
                    filename.display()
                );
                warn!("Update your layer to repo-relative addressing to avoid this warning");
            }
            return file_relative;
        }

        // Neither exists; report the primary location.
        repo_relative
    }
}

fn finish_header(config: &mut Mapping, version: Option<i64>) {
    let header = config
        .entry("header".into())
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if !header.is_mapping() {
        *header = Value::Mapping(Mapping::new());
    }
    if let Value::Mapping(header) = header {
        header.shift_remove("includes");
        if let Some(version) = version {
            header.insert("version".into(), version.into());
        }
    }
}

/// Make `path` absolute against the current directory, lexically
pub(crate) fn absolute(path: &Path) -> PathBuf {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    normalize(&path)
}

/// Collapse `.` and `..` without touching the file system
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
