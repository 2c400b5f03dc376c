//! Repository generation via external indexing tools.
//!
//! Debian-family repos are fed one binary at a time to reprepro; RPM-family
//! repos get their binaries copied into per-arch directories and indexed
//! with createrepo. The external tools are not safe for concurrent
//! invocation against one repository directory, so callers must hold the
//! store-level building flag (see [`crate::scheduler`]).

use std::collections::BTreeSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::BuilderConfig;
use crate::error::{ArchiveError, ArchiveResult};
use crate::models::{Binary, Repo, RepoFamily};
use crate::paths::{self, RepoPaths};
use crate::store::{BinaryQuery, HierarchyStore};

/// Captured result of one external tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ToolOutput {
    /// Whether the tool exited zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external commands. Tests substitute a recording fake.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a program with arguments, capturing its output.
    async fn run(&self, program: &str, args: &[String]) -> ArchiveResult<ToolOutput>;
}

/// The real [`CommandRunner`], backed by `tokio::process`.
#[derive(Debug, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> ArchiveResult<ToolOutput> {
        debug!("running {} {:?}", program, args);
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        Ok(ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Builds the on-disk repository for a repo key.
#[async_trait]
pub trait RepoBuilder: Send + Sync {
    /// Rebuild the repository from the binaries currently attached to it.
    async fn build(&self, repo: &Repo) -> ArchiveResult<()>;
}

/// Extension to reprepro include-mode mapping. Files with any other
/// extension may legitimately sit in a repository directory and are skipped.
fn include_flag(extension: &str) -> Option<&'static str> {
    match extension {
        "deb" => Some("includedeb"),
        "dsc" => Some("includedsc"),
        "changes" => Some("include"),
        _ => None,
    }
}

/// Warning classes that reprepro reports with a non-zero exit but that are
/// expected under re-runs and concurrent re-ingestion: the file is already
/// included at this version.
const BENIGN_MARKERS: &[&str] = &[
    "already registered with the same checksums",
    "skipping already existing version",
    "has already been included",
];

fn is_benign(stderr: &str) -> bool {
    BENIGN_MARKERS.iter().any(|marker| stderr.contains(marker))
}

/// Arguments for including one binary into a Debian repository.
///
/// `.dsc` and `.changes` files need different include modes than `.deb`
/// files, hence the flag parameter.
fn reprepro_args(
    confdir: &Path,
    repository_path: &Path,
    flag: &str,
    distro_version: &str,
    binary_path: &str,
) -> Vec<String> {
    vec![
        "--confdir".to_string(),
        confdir.to_string_lossy().into_owned(),
        "-b".to_string(),
        repository_path.to_string_lossy().into_owned(),
        "-C".to_string(),
        "main".to_string(),
        "--ignore=wrongdistribution".to_string(),
        "--ignore=wrongversion".to_string(),
        "--ignore=undefinedtarget".to_string(),
        flag.to_string(),
        distro_version.to_string(),
        binary_path.to_string(),
    ]
}

/// The repository builder service.
pub struct RepositoryBuilder {
    store: Arc<dyn HierarchyStore>,
    runner: Arc<dyn CommandRunner>,
    repos_root: std::path::PathBuf,
    config: BuilderConfig,
}

impl RepositoryBuilder {
    /// Create a new builder.
    pub fn new(
        store: Arc<dyn HierarchyStore>,
        runner: Arc<dyn CommandRunner>,
        repos_root: std::path::PathBuf,
        config: BuilderConfig,
    ) -> Self {
        Self {
            store,
            runner,
            repos_root,
            config,
        }
    }

    /// The repo's own binaries plus anything pulled in by the composition
    /// rules: configured extra source projects, and for Debian repos the
    /// sibling distro versions of a combined set.
    async fn composed_binaries(&self, repo: &Repo) -> ArchiveResult<Vec<Binary>> {
        let key = &repo.key;
        let mut binaries = self.store.repo_binaries(key).await?;

        for (source, extra) in self.config.extra_sources(&key.project, &key.ref_name) {
            let distro_versions = if extra.distro_versions.is_empty() {
                vec![key.distro_version.clone()]
            } else {
                extra.distro_versions.clone()
            };
            let matched = self
                .store
                .matching_binaries(&BinaryQuery {
                    project: source.clone(),
                    distro: Some(key.distro.clone()),
                    distro_versions,
                    ref_name: extra.ref_name.clone(),
                })
                .await?;
            if matched.is_empty() {
                warn!("extra source {} matched no binaries for {}", source, key);
            } else {
                debug!(
                    "pulling {} extra binaries from {} into {}",
                    matched.len(),
                    source,
                    key
                );
            }
            binaries.extend(matched);
        }

        if key.family() == RepoFamily::Debian {
            let combined = self
                .config
                .combined_versions(&key.project, &key.distro_version);
            if !combined.is_empty() {
                let siblings = self
                    .store
                    .matching_binaries(&BinaryQuery {
                        project: key.project.clone(),
                        distro: Some(key.distro.clone()),
                        distro_versions: combined,
                        ref_name: Some(key.ref_name.clone()),
                    })
                    .await?;
                debug!(
                    "combining {} binaries from sibling versions into {}",
                    siblings.len(),
                    key
                );
                binaries.extend(siblings);
            }
        }

        Ok(binaries)
    }

    async fn build_debian(&self, paths: &RepoPaths, binaries: &[Binary]) -> ArchiveResult<()> {
        for binary in binaries {
            let flag = match include_flag(binary.extension()) {
                Some(flag) => flag,
                None => {
                    // Not an error: repository directories can hold
                    // incidental files.
                    debug!(
                        "skipping {}: no include mode for extension '{}'",
                        binary.name,
                        binary.extension()
                    );
                    continue;
                }
            };

            let path = match &binary.path {
                Some(path) => path,
                None => {
                    warn!("skipping {}: no stored file", binary.name);
                    continue;
                }
            };

            // Each binary targets its own distribution, so a combined
            // repository carries several distributions in one tree.
            let args = reprepro_args(
                &self.config.confdir,
                &paths.absolute,
                flag,
                &binary.distro_version,
                path,
            );
            let output = self.runner.run(&self.config.reprepro_command, &args).await?;

            if !output.success() {
                if is_benign(&output.stderr) {
                    debug!("{} already included, continuing", binary.name);
                } else {
                    return Err(ArchiveError::ToolFailure {
                        command: self.config.reprepro_command.clone(),
                        code: output.code,
                        stderr: output.stderr,
                    });
                }
            }
        }
        Ok(())
    }

    async fn build_rpm(&self, paths: &RepoPaths, binaries: &[Binary]) -> ArchiveResult<()> {
        let mut touched: BTreeSet<std::path::PathBuf> = BTreeSet::new();

        for binary in binaries {
            let source = match &binary.path {
                Some(path) => path,
                None => {
                    warn!("skipping {}: no stored file", binary.name);
                    continue;
                }
            };

            let arch_dir = paths::infer_arch_directory(&binary.name);
            let destination_dir = paths.absolute.join(arch_dir);
            tokio::fs::create_dir_all(&destination_dir).await?;

            match tokio::fs::copy(source, destination_dir.join(&binary.name)).await {
                Ok(_) => {
                    touched.insert(destination_dir);
                }
                Err(e) => {
                    // Degraded records (size 0, missing file) must not block
                    // the rest of the rebuild.
                    warn!("could not copy {} into repository: {}", binary.name, e);
                }
            }
        }

        for directory in touched {
            let args = vec![
                "--update".to_string(),
                directory.to_string_lossy().into_owned(),
            ];
            let output = self
                .runner
                .run(&self.config.createrepo_command, &args)
                .await?;

            if !output.success() {
                return Err(ArchiveError::ToolFailure {
                    command: self.config.createrepo_command.clone(),
                    code: output.code,
                    stderr: output.stderr,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RepoBuilder for RepositoryBuilder {
    async fn build(&self, repo: &Repo) -> ArchiveResult<()> {
        let paths = paths::repo_paths(&self.repos_root, &repo.key);
        tokio::fs::create_dir_all(&paths.absolute).await?;

        let binaries = self.composed_binaries(repo).await?;
        info!(
            "rebuilding {} with {} binaries at {}",
            repo.key,
            binaries.len(),
            paths.absolute.display()
        );

        match repo.key.family() {
            RepoFamily::Debian => self.build_debian(&paths, &binaries).await,
            RepoFamily::Rpm => self.build_rpm(&paths, &binaries).await,
        }
    }
}
