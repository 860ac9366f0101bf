//! End-to-end tests of the configuration session
//!
//! Repositories are "fetched" by a fake fetcher that materializes files
//! below the work directory, so the whole include fixed point can be
//! exercised without any VCS.

use async_trait::async_trait;
use convenient_kas::config::{ConfigError, ConfigOptions, DumpFormat, KasConfig};
use convenient_kas::include_graph::IncludeError;
use convenient_kas::repository_manager::{Repo, RepoError, RepoFetcher, WorkdirFetcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::TempDir;
use tokio::fs;

/// Creates the files of a repository when it is fetched
#[derive(Default)]
struct FakeFetcher {
    contents: HashMap<String, Vec<(&'static str, String)>>,
    fetched: Mutex<Vec<String>>,
}

impl FakeFetcher {
    fn with_repo(mut self, name: &str, files: Vec<(&'static str, String)>) -> Self {
        self.contents.insert(name.to_string(), files);
        self
    }

    fn fetched(&self) -> Vec<String> {
        let mut fetched = self.fetched.lock().unwrap().clone();
        fetched.sort();
        fetched
    }
}

#[async_trait]
impl RepoFetcher for FakeFetcher {
    async fn fetch(&self, repo: &Repo) -> Result<PathBuf, RepoError> {
        let files = self
            .contents
            .get(&repo.name)
            .ok_or_else(|| RepoError::FetchFailed(repo.name.clone(), "unknown remote".into()))?;
        for (name, content) in files {
            let path = repo.path.join(name);
            fs::create_dir_all(path.parent().unwrap()).await.unwrap();
            fs::write(&path, content).await.unwrap();
        }
        self.fetched.lock().unwrap().push(repo.name.clone());
        Ok(repo.path.clone())
    }
}

/// Fails the test when any repository is fetched
struct NoFetch;

#[async_trait]
impl RepoFetcher for NoFetch {
    async fn fetch(&self, repo: &Repo) -> Result<PathBuf, RepoError> {
        panic!("unexpected fetch of {}", repo.name);
    }
}

struct Project {
    _temp: TempDir,
    top: PathBuf,
    work: PathBuf,
}

impl Project {
    async fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let top = temp.path().join("project");
        let work = temp.path().join("work");
        fs::create_dir_all(&top).await.unwrap();
        fs::create_dir_all(&work).await.unwrap();
        Self { _temp: temp, top, work }
    }

    async fn file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.top.join(name);
        fs::write(&path, content).await.unwrap();
        path
    }

    fn options(&self) -> ConfigOptions<'static> {
        ConfigOptions::default().with_work_dir(&self.work)
    }
}

const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

#[tokio::test]
async fn test_transitive_repo_includes_reach_fixed_point() {
    let project = Project::new().await;
    let top = project
        .file(
            "kas.yml",
            &format!(
                "header:\n  version: 14\n  includes:\n    - repo: meta-a\n      file: kas/a.yml\nrepos:\n  meta-a:\n    url: https://example.com/meta-a.git\n    commit: {COMMIT}\nmachine: top\n"
            ),
        )
        .await;

    let fetcher = FakeFetcher::default()
        .with_repo(
            "meta-a",
            vec![(
                "kas/a.yml",
                format!(
                    "header:\n  version: 14\n  includes:\n    - repo: meta-b\n      file: b.yml\nrepos:\n  meta-b:\n    url: https://example.com/meta-b.git\n    commit: {COMMIT}\ndistro: from-a\n"
                ),
            )],
        )
        .with_repo(
            "meta-b",
            vec![("b.yml", "header:\n  version: 13\ntarget: from-b\nmachine: from-b\n".to_string())],
        );

    let config = KasConfig::load(&[top], &project.options(), &fetcher).await.unwrap();

    assert_eq!(fetcher.fetched(), ["meta-a", "meta-b"]);
    assert_eq!(config.machine(), "top");
    assert_eq!(config.distro(), "from-a");
    assert_eq!(config.targets(), ["from-b"]);
    assert_eq!(config.repo_paths()["meta-b"], project.work.join("meta-b"));

    let names: Vec<&str> = config.repos().iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["meta-b", "meta-a"]);
}

#[tokio::test]
async fn test_renamed_repo_is_included_by_key() {
    let project = Project::new().await;
    let top = project
        .file(
            "kas.yml",
            &format!(
                "header:\n  version: 14\n  includes:\n    - repo: meta-key\n      file: x.yml\nrepos:\n  meta-key:\n    name: meta-real\n    url: https://example.com/meta.git\n    commit: {COMMIT}\n"
            ),
        )
        .await;

    let fetcher = FakeFetcher::default().with_repo(
        "meta-real",
        vec![("x.yml", "header:\n  version: 14\ndistro: renamed\n".to_string())],
    );

    let config = KasConfig::load(&[top], &project.options(), &fetcher).await.unwrap();

    assert_eq!(fetcher.fetched(), ["meta-real"]);
    assert_eq!(config.distro(), "renamed");
    assert_eq!(config.repo_paths()["meta-key"], project.work.join("meta-real"));
    assert_eq!(config.repos()[0].key, "meta-key");
    assert_eq!(config.repos()[0].name, "meta-real");
}

#[tokio::test]
async fn test_undeclared_repo_does_not_converge() {
    let project = Project::new().await;
    let top = project
        .file(
            "kas.yml",
            "header:\n  version: 14\n  includes:\n    - repo: ghost\n      file: x.yml\n",
        )
        .await;

    let result = KasConfig::load(&[top], &project.options(), &NoFetch).await;
    match result {
        Err(ConfigError::Include(IncludeError::UnresolvedRepos(missing))) => {
            assert_eq!(missing.as_slice(), ["ghost"]);
        }
        other => panic!("expected unresolved repos, got {other:?}"),
    }
}

#[tokio::test]
async fn test_fetch_failure_is_reported() {
    let project = Project::new().await;
    let top = project
        .file(
            "kas.yml",
            &format!(
                "header:\n  version: 14\n  includes:\n    - repo: remote\n      file: x.yml\nrepos:\n  remote:\n    url: https://example.com/remote.git\n    commit: {COMMIT}\n"
            ),
        )
        .await;

    let result = KasConfig::load(&[top], &project.options(), &FakeFetcher::default()).await;
    assert!(matches!(
        result,
        Err(ConfigError::Repo(RepoError::FetchFailed(name, _))) if name == "remote"
    ));
}

#[tokio::test]
async fn test_local_repo_is_used_without_fetching() {
    let project = Project::new().await;
    let local = project.work.join("local-layer");
    fs::create_dir_all(&local).await.unwrap();
    fs::write(local.join("extra.yml"), "header:\n  version: 14\ndistro: local\n")
        .await
        .unwrap();
    let top = project
        .file(
            "kas.yml",
            "header:\n  version: 14\n  includes:\n    - repo: local\n      file: extra.yml\nrepos:\n  local:\n    path: local-layer\n",
        )
        .await;

    let config = KasConfig::load(&[top], &project.options(), &NoFetch).await.unwrap();
    assert_eq!(config.distro(), "local");
    assert!(config.repos()[0].operations_disabled);
    assert_eq!(config.repos()[0].path, local);
}

#[tokio::test]
async fn test_workdir_fetcher_finds_existing_checkouts() {
    let project = Project::new().await;
    let checkout = project.work.join("poky");
    fs::create_dir_all(checkout.join("kas")).await.unwrap();
    fs::write(checkout.join("kas/poky.yml"), "header:\n  version: 14\ndistro: poky-tiny\n")
        .await
        .unwrap();
    let top = project
        .file(
            "kas.yml",
            "header:\n  version: 14\n  includes:\n    - repo: poky\n      file: kas/poky.yml\nrepos:\n  poky:\n    url: https://git.yoctoproject.org/poky\n    branch: master\n",
        )
        .await;

    let config = KasConfig::load(&[top], &project.options(), &WorkdirFetcher).await.unwrap();
    assert_eq!(config.distro(), "poky-tiny");
}

#[tokio::test]
async fn test_lockfile_pins_repo() {
    let project = Project::new().await;
    let top = project
        .file(
            "kas.yml",
            "header:\n  version: 14\nrepos:\n  poky:\n    url: https://git.yoctoproject.org/poky\n    branch: master\n",
        )
        .await;
    let lock = convenient_kas::lockfile::render_lockfile([("poky", COMMIT)]);
    project
        .file("kas.lock.yml", &serde_yaml::to_string(&lock).unwrap())
        .await;

    let locked = KasConfig::load(&[top.clone()], &project.options(), &NoFetch).await.unwrap();
    assert_eq!(locked.repos()[0].commit.as_deref(), Some(COMMIT));
    assert_eq!(locked.lockfiles(), [project.top.join("kas.lock.yml")]);

    let unlocked = KasConfig::load(&[top], &project.options().with_lock(false), &NoFetch)
        .await
        .unwrap();
    assert_eq!(unlocked.repos()[0].commit, None);
    assert_eq!(unlocked.repos()[0].branch.as_deref(), Some("master"));
}

#[tokio::test]
async fn test_target_and_task_overrides() {
    let project = Project::new().await;
    let top = project
        .file("kas.yml", "header:\n  version: 14\ntarget: core-image-minimal\ntask: build\n")
        .await;

    let options = project
        .options()
        .with_target(["core-image-sato", "core-image-weston"])
        .with_task("populate_sdk");
    let config = KasConfig::load(&[top], &options, &NoFetch).await.unwrap();
    assert_eq!(config.targets(), ["core-image-sato", "core-image-weston"]);
    assert_eq!(config.task(), "populate_sdk");
}

#[tokio::test]
async fn test_dump_is_stable() {
    let project = Project::new().await;
    project
        .file("base.yml", "header:\n  version: 12\nlocal_conf_header:\n  b: B\n  a: A\n")
        .await;
    let top = project
        .file(
            "kas.yml",
            "header:\n  version: 14\n  includes: [base.yml]\nmachine: qemuarm64\nrepos:\n  this:\n",
        )
        .await;

    let first = KasConfig::load(&[top.clone()], &project.options(), &NoFetch).await.unwrap();
    let second = KasConfig::load(&[top], &project.options(), &NoFetch).await.unwrap();

    let dump = first.dump(DumpFormat::Yaml).unwrap();
    assert_eq!(dump, second.dump(DumpFormat::Yaml).unwrap());
    assert_eq!(
        dump,
        "header:\n  version: 14\nlocal_conf_header:\n  b: B\n  a: A\nmachine: qemuarm64\nrepos:\n  this: null\n"
    );
    assert_eq!(first.top_repo_path(), project.top.as_path());
    assert_eq!(first.build_dir(), project.work.join("build"));
}

#[tokio::test]
async fn test_top_files_from_different_repositories() {
    let project = Project::new().await;
    git2::Repository::init(&project.top).unwrap();
    let inside = project.file("kas.yml", "header:\n  version: 14\n").await;
    let outside = project.work.join("other.yml");
    fs::write(&outside, "header:\n  version: 14\n").await.unwrap();

    let result = KasConfig::load(&[inside, outside], &project.options(), &NoFetch).await;
    assert!(matches!(result, Err(ConfigError::MixedRepositories)));
}
