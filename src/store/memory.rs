//! In-memory hierarchy store.
//!
//! Backs tests and single-process setups. A single mutex stands in for the
//! relational store's transaction isolation, which trivially satisfies the
//! no-partial-chain and single-writer guarantees.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{ArchiveError, ArchiveResult};
use crate::models::{
    Binary, BinaryAddress, Distro, DistroArch, DistroVersion, Id, Project, Repo, RepoKey,
};

use super::{BinaryQuery, BinaryUpdate, HierarchyStore, NewBinary};

#[derive(Debug, Default)]
struct Inner {
    next_id: Id,
    projects: Vec<Project>,
    distros: Vec<Distro>,
    versions: Vec<DistroVersion>,
    archs: Vec<DistroArch>,
    binaries: Vec<Binary>,
    repos: Vec<Repo>,
}

impl Inner {
    fn next_id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }
}

/// An in-memory implementation of [`HierarchyStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HierarchyStore for MemoryStore {
    async fn ensure_chain(
        &self,
        project: &str,
        distro: &str,
        distro_version: &str,
        arch: &str,
    ) -> ArchiveResult<DistroArch> {
        let mut inner = self.inner.lock().await;

        let project_id = match inner.projects.iter().find(|p| p.name == project) {
            Some(p) => p.id,
            None => {
                let id = inner.next_id();
                inner.projects.push(Project {
                    id,
                    name: project.to_string(),
                });
                id
            }
        };

        let distro_id = match inner
            .distros
            .iter()
            .find(|d| d.project_id == project_id && d.name == distro)
        {
            Some(d) => d.id,
            None => {
                let id = inner.next_id();
                inner.distros.push(Distro {
                    id,
                    project_id,
                    name: distro.to_string(),
                });
                id
            }
        };

        let version_id = match inner
            .versions
            .iter()
            .find(|v| v.distro_id == distro_id && v.name == distro_version)
        {
            Some(v) => v.id,
            None => {
                let id = inner.next_id();
                inner.versions.push(DistroVersion {
                    id,
                    distro_id,
                    name: distro_version.to_string(),
                });
                id
            }
        };

        if let Some(existing) = inner
            .archs
            .iter()
            .find(|a| a.distro_version_id == version_id && a.name == arch)
        {
            return Ok(existing.clone());
        }

        let id = inner.next_id();
        let created = DistroArch {
            id,
            distro_version_id: version_id,
            name: arch.to_string(),
        };
        inner.archs.push(created.clone());
        Ok(created)
    }

    async fn find_binary(&self, address: &BinaryAddress) -> ArchiveResult<Option<Binary>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .binaries
            .iter()
            .find(|b| {
                b.name == address.name
                    && b.project == address.project
                    && b.ref_name == address.ref_name
                    && b.distro == address.distro
                    && b.distro_version == address.distro_version
            })
            .cloned())
    }

    async fn create_binary(&self, new: NewBinary) -> ArchiveResult<Binary> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let id = inner.next_id();
        let binary = Binary {
            id,
            name: new.address.name,
            project: new.address.project,
            distro: new.address.distro,
            distro_version: new.address.distro_version,
            arch: new.arch,
            ref_name: new.address.ref_name,
            size: new.size,
            checksum: new.checksum,
            path: new.path,
            created: now,
            modified: now,
        };
        inner.binaries.push(binary.clone());
        Ok(binary)
    }

    async fn update_binary(&self, id: Id, update: BinaryUpdate) -> ArchiveResult<Binary> {
        let mut inner = self.inner.lock().await;
        let binary = inner
            .binaries
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| ArchiveError::NotFound(format!("binary {}", id)))?;

        binary.size = update.size;
        if update.checksum.is_some() {
            binary.checksum = update.checksum;
        }
        if update.path.is_some() {
            binary.path = update.path;
        }
        binary.modified = Utc::now();
        Ok(binary.clone())
    }

    async fn get_or_create_repo(&self, key: &RepoKey) -> ArchiveResult<Repo> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.repos.iter().find(|r| &r.key == key) {
            return Ok(existing.clone());
        }
        let id = inner.next_id();
        let repo = Repo {
            id,
            key: key.clone(),
            needs_build: false,
            is_building: false,
            modified: Utc::now(),
        };
        inner.repos.push(repo.clone());
        Ok(repo)
    }

    async fn get_repo(&self, key: &RepoKey) -> ArchiveResult<Option<Repo>> {
        let inner = self.inner.lock().await;
        Ok(inner.repos.iter().find(|r| &r.key == key).cloned())
    }

    async fn mark_repo_pending(&self, key: &RepoKey) -> ArchiveResult<()> {
        let mut inner = self.inner.lock().await;
        let repo = inner
            .repos
            .iter_mut()
            .find(|r| &r.key == key)
            .ok_or_else(|| ArchiveError::NotFound(format!("repo {}", key)))?;
        repo.needs_build = true;
        repo.modified = Utc::now();
        Ok(())
    }

    async fn begin_build(&self, key: &RepoKey) -> ArchiveResult<bool> {
        let mut inner = self.inner.lock().await;
        let repo = match inner.repos.iter_mut().find(|r| &r.key == key) {
            Some(repo) => repo,
            None => return Ok(false),
        };
        if repo.needs_build && !repo.is_building {
            repo.needs_build = false;
            repo.is_building = true;
            repo.modified = Utc::now();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn finish_build(&self, key: &RepoKey, success: bool) -> ArchiveResult<()> {
        let mut inner = self.inner.lock().await;
        let repo = inner
            .repos
            .iter_mut()
            .find(|r| &r.key == key)
            .ok_or_else(|| ArchiveError::NotFound(format!("repo {}", key)))?;
        repo.is_building = false;
        if !success {
            repo.needs_build = true;
        }
        repo.modified = Utc::now();
        Ok(())
    }

    async fn pending_repos(&self) -> ArchiveResult<Vec<Repo>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .repos
            .iter()
            .filter(|r| r.needs_build && !r.is_building)
            .cloned()
            .collect())
    }

    async fn repo_binaries(&self, key: &RepoKey) -> ArchiveResult<Vec<Binary>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .binaries
            .iter()
            .filter(|b| {
                b.project == key.project
                    && b.ref_name == key.ref_name
                    && b.distro == key.distro
                    && b.distro_version == key.distro_version
            })
            .cloned()
            .collect())
    }

    async fn matching_binaries(&self, query: &BinaryQuery) -> ArchiveResult<Vec<Binary>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .binaries
            .iter()
            .filter(|b| {
                b.project == query.project
                    && query.distro_versions.iter().any(|v| v == &b.distro_version)
                    && query.distro.as_deref().map_or(true, |d| d == b.distro)
                    && query.ref_name.as_deref().map_or(true, |r| r == b.ref_name)
            })
            .cloned()
            .collect())
    }
}
