//! Lockfile naming and content
//!
//! A lockfile lives next to the configuration file it pins and is named
//! `<stem>.lock<ext>`, e.g. `kas-project.yml` → `kas-project.lock.yml`.
//! Its content only carries `overrides.repos.<name>.commit` entries.

use crate::schema::FILE_VERSION;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

const LOCK_MARKER: &str = ".lock";

/// Lockfile path for `file`, optionally with a different extension
///
/// `ext` includes the leading dot (`".json"`).
pub fn lockfile_path(file: &Path, ext: Option<&str>) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = match ext {
        Some(ext) => ext.to_string(),
        None => file
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default(),
    };
    file.with_file_name(format!("{stem}{LOCK_MARKER}{ext}"))
}

/// Whether `file` follows the lockfile naming convention
pub fn is_lockfile(file: &Path) -> bool {
    file.file_stem()
        .map(|s| s.to_string_lossy().ends_with(LOCK_MARKER))
        .unwrap_or(false)
}

/// Build the document written to a lockfile
///
/// `revisions` maps repository names to the exact revision they were
/// resolved to; iteration order is kept in the output.
pub fn render_lockfile<'a, I>(revisions: I) -> Value
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut repos = Mapping::new();
    for (name, revision) in revisions {
        let mut pin = Mapping::new();
        pin.insert("commit".into(), revision.into());
        repos.insert(name.into(), Value::Mapping(pin));
    }

    let mut header = Mapping::new();
    header.insert("version".into(), FILE_VERSION.into());
    let mut overrides = Mapping::new();
    overrides.insert("repos".into(), Value::Mapping(repos));

    let mut doc = Mapping::new();
    doc.insert("header".into(), Value::Mapping(header));
    doc.insert("overrides".into(), Value::Mapping(overrides));
    Value::Mapping(doc)
}
