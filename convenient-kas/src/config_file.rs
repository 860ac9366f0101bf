//! Loading of single configuration files
//!
//! A [`ConfigFile`] is one parsed, schema-validated configuration fragment.
//! Loading never follows includes; that is the job of
//! [`IncludeHandler`](crate::include_graph::IncludeHandler).

use crate::lockfile;
use crate::schema::ConfigSchema;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Reserved key naming the relocated repository root (repository path)
pub const SOURCE_DIR_KEY: &str = "_source_dir";

/// Reserved key naming the relocated repository root (host path)
pub const SOURCE_DIR_HOST_KEY: &str = "_source_dir_host";

const LEGACY_VERSION: &str = "0.10";
const DEPRECATED_KEYS: &[&str] = &["proxy_config"];

/// Errors raised while loading a single configuration file
#[derive(Debug, thiserror::Error)]
pub enum LoadConfigError {
    #[error("Config file extension not recognized: {0}")]
    UnknownExtension(PathBuf),

    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error reading {0}: {1}")]
    Io(PathBuf, String),

    #[error("Parse error in {0}: {1}")]
    Parse(PathBuf, String),

    #[error("Error(s) occurred while validating the config file {path}:\n{}", .errors.join("\n"))]
    Validation { path: PathBuf, errors: Vec<String> },

    #[error("Missing header.version in {0}")]
    MissingVersion(PathBuf),

    #[error("Invalid header.version {value:?} in {path}")]
    InvalidVersion { path: PathBuf, value: String },

    #[error(
        "This version of kas is compatible with version {min} to {max}, file has version {version}: {path}"
    )]
    IncompatibleVersion {
        path: PathBuf,
        version: i64,
        min: i64,
        max: i64,
    },
}

/// Serialization format of a configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Yaml,
    Json,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => Some(Self::Yaml),
            Some("json") => Some(Self::Json),
            _ => None,
        }
    }
}

/// One entry of `header.includes`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncludeRef {
    /// Path relative to the repository root, or absolute
    Path(String),
    /// File inside another repository
    Repo { repo: String, file: String },
}

/// A loaded configuration fragment
#[derive(Debug, Clone)]
pub struct ConfigFile {
    /// Absolute path of the file
    pub filename: PathBuf,
    /// Document root, a mapping for every well-formed file
    pub config: Value,
    /// Normalized `header.version`, `None` if the root is not a mapping
    pub version: Option<i64>,
    /// Loaded from a repository other than the top-level one
    pub is_external: bool,
    pub is_lockfile: bool,
    /// Value of `_source_dir`, resolved against the file's directory
    pub source_dir: Option<PathBuf>,
    /// Value of `_source_dir_host`
    pub source_dir_host: Option<PathBuf>,
}

impl ConfigFile {
    /// Load, validate and version-check a configuration file
    pub fn load(
        filename: impl AsRef<Path>,
        is_external: bool,
        is_lockfile: bool,
        schema: &ConfigSchema,
    ) -> Result<Self, LoadConfigError> {
        let filename = filename.as_ref();
        let format = FileFormat::from_path(filename)
            .ok_or_else(|| LoadConfigError::UnknownExtension(filename.to_path_buf()))?;

        let content = std::fs::read_to_string(filename).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LoadConfigError::NotFound(filename.to_path_buf()),
            _ => LoadConfigError::Io(filename.to_path_buf(), e.to_string()),
        })?;
        debug!("Loading config file {}", filename.display());

        let config = parse_document(filename, format, &content)?;

        let instance = serde_json::to_value(&config)
            .map_err(|e| LoadConfigError::Parse(filename.to_path_buf(), e.to_string()))?;
        let errors = schema.validate(&instance);
        if !errors.is_empty() {
            for error in &errors {
                debug!("Config file validation error in {}: {}", filename.display(), error);
            }
            return Err(LoadConfigError::Validation {
                path: filename.to_path_buf(),
                errors,
            });
        }

        let (version, source_dir, source_dir_host) = match config.as_mapping() {
            Some(root) => {
                let version = parse_version(filename, root)?;
                let range = schema.versions();
                if !range.contains(version) {
                    return Err(LoadConfigError::IncompatibleVersion {
                        path: filename.to_path_buf(),
                        version,
                        min: range.min,
                        max: range.max,
                    });
                }
                warn_deprecated_keys(filename, root);
                (
                    Some(version),
                    path_entry(filename, root, SOURCE_DIR_KEY),
                    path_entry(filename, root, SOURCE_DIR_HOST_KEY),
                )
            }
            None => (None, None, None),
        };

        Ok(Self {
            filename: filename.to_path_buf(),
            config,
            version,
            is_external,
            is_lockfile,
            source_dir,
            source_dir_host,
        })
    }

    /// Document root as a mapping
    pub fn mapping(&self) -> Option<&Mapping> {
        self.config.as_mapping()
    }

    /// Raw `header.includes` entries
    pub fn include_values(&self) -> &[Value] {
        self.config
            .get("header")
            .and_then(|h| h.get("includes"))
            .and_then(Value::as_sequence)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Sibling lockfile of this file
    pub fn lockfile_path(&self, ext: Option<&str>) -> PathBuf {
        lockfile::lockfile_path(&self.filename, ext)
    }
}

fn parse_document(filename: &Path, format: FileFormat, content: &str) -> Result<Value, LoadConfigError> {
    let parse_error = |e: String| LoadConfigError::Parse(filename.to_path_buf(), e);
    match format {
        FileFormat::Json => serde_json::from_str::<Value>(content).map_err(|e| parse_error(e.to_string())),
        FileFormat::Yaml => {
            let mut value: Value =
                serde_yaml::from_str(content).map_err(|e| parse_error(e.to_string()))?;
            value.apply_merge().map_err(|e| parse_error(e.to_string()))?;
            Ok(value)
        }
    }
}

/// Extract and normalize `header.version`
///
/// Integers and integer strings are taken as-is, the legacy `"0.10"`
/// counts as version 1.
pub fn parse_version(filename: &Path, root: &Mapping) -> Result<i64, LoadConfigError> {
    let version = root
        .get("header")
        .and_then(|h| h.get("version"))
        .ok_or_else(|| LoadConfigError::MissingVersion(filename.to_path_buf()))?;

    let invalid = || LoadConfigError::InvalidVersion {
        path: filename.to_path_buf(),
        value: serde_yaml::to_string(version)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    };

    match version {
        Value::Number(n) => n.as_i64().ok_or_else(invalid),
        Value::String(s) if s == LEGACY_VERSION => Ok(1),
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

/// Parse one raw `header.includes` entry
pub fn parse_include(value: &Value) -> Result<IncludeRef, crate::include_graph::IncludeError> {
    use crate::include_graph::IncludeError;

    match value {
        Value::String(path) => Ok(IncludeRef::Path(path.clone())),
        Value::Mapping(entry) => {
            let repo = entry
                .get("repo")
                .and_then(Value::as_str)
                .ok_or_else(|| IncludeError::MissingRepoKey(describe(value)))?;
            let file = entry
                .get("file")
                .and_then(Value::as_str)
                .filter(|f| !f.is_empty())
                .ok_or_else(|| IncludeError::MissingFileKey(describe(value)))?;
            Ok(IncludeRef::Repo {
                repo: repo.to_string(),
                file: file.to_string(),
            })
        }
        other => Err(IncludeError::InvalidInclude(describe(other))),
    }
}

fn describe(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{value:?}"))
}

fn warn_deprecated_keys(filename: &Path, root: &Mapping) {
    for key in DEPRECATED_KEYS {
        if root.contains_key(*key) {
            warn!(
                "Obsolete '{}' detected in {}. This has no effect and will be rejected soon.",
                key,
                filename.display()
            );
        }
    }
}

fn path_entry(filename: &Path, root: &Mapping, key: &str) -> Option<PathBuf> {
    let value = root.get(key)?.as_str()?;
    let path = Path::new(value);
    if path.is_absolute() {
        Some(path.to_path_buf())
    } else {
        let base = filename.parent().unwrap_or_else(|| Path::new("."));
        Some(base.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::VersionRange;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn schema() -> ConfigSchema {
        ConfigSchema::new(&serde_json::json!({}), VersionRange::new(4, 5)).unwrap()
    }

    #[test]
    fn legacy_version_string() {
        let root: Mapping = serde_yaml::from_str("header: {version: '0.10'}").unwrap();
        assert_eq!(parse_version(Path::new("x.yml"), &root).unwrap(), 1);
    }

    #[test]
    fn integer_string_version() {
        let root: Mapping = serde_yaml::from_str("header: {version: '7'}").unwrap();
        assert_eq!(parse_version(Path::new("x.yml"), &root).unwrap(), 7);
    }

    #[test]
    fn garbage_version_string() {
        let root: Mapping = serde_yaml::from_str("header: {version: 'x'}").unwrap();
        assert!(matches!(
            parse_version(Path::new("x.yml"), &root),
            Err(LoadConfigError::InvalidVersion { .. })
        ));
    }

    #[test]
    fn include_forms() {
        let plain: Value = serde_yaml::from_str("base.yml").unwrap();
        assert_eq!(parse_include(&plain).unwrap(), IncludeRef::Path("base.yml".into()));

        let structured: Value = serde_yaml::from_str("{repo: meta, file: kas/x.yml}").unwrap();
        assert_eq!(
            parse_include(&structured).unwrap(),
            IncludeRef::Repo {
                repo: "meta".into(),
                file: "kas/x.yml".into()
            }
        );
    }

    #[test]
    fn json_files_keep_key_order() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "x.json", r#"{"header": {"version": 5}, "z": 1, "a": 2}"#);
        let file = ConfigFile::load(&path, false, false, &schema()).unwrap();
        let keys: Vec<&str> = file
            .mapping()
            .unwrap()
            .keys()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(keys, ["header", "z", "a"]);
        assert_eq!(file.version, Some(5));
    }

    #[test]
    fn source_dir_is_resolved_against_file() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "x.yml",
            "header: {version: 5}\n_source_dir: src\n_source_dir_host: /host/src\n",
        );
        let file = ConfigFile::load(&path, false, false, &schema()).unwrap();
        assert_eq!(file.source_dir, Some(dir.path().join("src")));
        assert_eq!(file.source_dir_host, Some(PathBuf::from("/host/src")));
    }

    #[test]
    fn yaml_merge_keys_are_applied() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "x.yml",
            "header: {version: 5}\nbase: &base {a: 1}\nderived:\n  <<: *base\n  b: 2\n",
        );
        let file = ConfigFile::load(&path, false, false, &schema()).unwrap();
        assert_eq!(file.config["derived"]["a"], Value::from(1));
        assert_eq!(file.config["derived"]["b"], Value::from(2));
    }

    #[traced_test]
    #[test]
    fn obsolete_proxy_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "x.yml",
            "header: {version: 5}\nproxy_config:\n  http_proxy: http://proxy:3128\n",
        );
        let file = ConfigFile::load(&path, false, false, &schema()).unwrap();
        assert!(file.mapping().unwrap().contains_key("proxy_config"));
        assert!(logs_contain("Obsolete 'proxy_config'"));
    }
}
