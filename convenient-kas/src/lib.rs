//! kas project configuration handling
//!
//! Loads kas configuration files, follows their `header.includes` across
//! repositories, overlays lockfiles and merges everything into a single
//! configuration tree.
//!
//! ```no_run
//! use convenient_kas::{ConfigOptions, KasConfig, WorkdirFetcher};
//! use std::path::PathBuf;
//!
//! # async fn run() -> Result<(), convenient_kas::ConfigError> {
//! let files = vec![PathBuf::from("kas-project.yml")];
//! let config = KasConfig::load(&files, &ConfigOptions::default(), &WorkdirFetcher).await?;
//! println!("{}", config.machine());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod config_file;
pub mod include_graph;
pub mod lockfile;
pub mod merge;
pub mod repository_manager;
pub mod schema;

pub use config::{ConfigError, ConfigOptions, DumpFormat, KasConfig};
pub use config_file::{ConfigFile, IncludeRef, LoadConfigError};
pub use include_graph::{IncludeError, IncludeHandler, IncludeOptions, MissingRepos, RepoPaths, SourceDirPolicy};
pub use merge::{MergeError, merge};
pub use repository_manager::{Repo, RepoError, RepoFetcher, RepoRegistry, WorkdirFetcher};
pub use schema::{COMPATIBLE_FILE_VERSION, ConfigSchema, FILE_VERSION, VersionRange};
