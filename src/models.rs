//! Entity types for the resource hierarchy.
//!
//! The hierarchy is Project -> Distro -> DistroVersion -> DistroArch ->
//! Binary, with Repo as the parallel entity that groups the binaries which
//! are indexed together as one on-disk package repository.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque numeric identifier, stable for the lifetime of an entity.
pub type Id = i64;

/// A named software product, the root of the hierarchy. Unique by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Entity id.
    pub id: Id,
    /// Project name.
    pub name: String,
}

/// An OS distribution family (e.g. "ubuntu") under a project.
/// Unique by (project, name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distro {
    /// Entity id.
    pub id: Id,
    /// Owning project id.
    pub project_id: Id,
    /// Distribution name.
    pub name: String,
}

/// A named release of a distro (e.g. "trusty"). Unique by (distro, name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistroVersion {
    /// Entity id.
    pub id: Id,
    /// Owning distro id.
    pub distro_id: Id,
    /// Version name.
    pub name: String,
}

/// An architecture bucket under a distro version (e.g. "x86_64", "noarch",
/// "SRPMS"). Unique by (distro_version, name).
///
/// The name is a repository-layout directory name, which is not necessarily
/// what the uploading client sent; see [`crate::paths::infer_arch_directory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistroArch {
    /// Entity id.
    pub id: Id,
    /// Owning distro version id.
    pub distro_version_id: Id,
    /// Architecture directory name.
    pub name: String,
}

/// One uploaded artifact.
///
/// Uniquely addressed by (name, ref, distro, distro_version, project);
/// re-uploading the same address updates the row in place rather than
/// creating a new entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binary {
    /// Entity id.
    pub id: Id,
    /// Filename of the artifact.
    pub name: String,
    /// Project name.
    pub project: String,
    /// Distro name.
    pub distro: String,
    /// Distro version name.
    pub distro_version: String,
    /// Architecture directory name.
    pub arch: String,
    /// Branch or release tag scoping this build.
    pub ref_name: String,
    /// Size in bytes; 0 when the size could not be determined.
    pub size: i64,
    /// SHA-512 checksum of the stored payload, hex-encoded.
    pub checksum: Option<String>,
    /// Absolute path of the stored file, if any bytes were stored.
    pub path: Option<String>,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
    /// Last modification timestamp.
    pub modified: DateTime<Utc>,
}

impl Binary {
    /// File extension of the artifact name (last dot-separated component),
    /// used to select the repository include mode.
    pub fn extension(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or("")
    }

    /// The key of the repo this binary belongs to.
    pub fn repo_key(&self) -> RepoKey {
        RepoKey {
            project: self.project.clone(),
            ref_name: self.ref_name.clone(),
            distro: self.distro.clone(),
            distro_version: self.distro_version.clone(),
        }
    }
}

/// The address tuple that uniquely identifies a binary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BinaryAddress {
    /// Filename.
    pub name: String,
    /// Project name.
    pub project: String,
    /// Ref (branch or tag) name.
    pub ref_name: String,
    /// Distro name.
    pub distro: String,
    /// Distro version name.
    pub distro_version: String,
}

/// Identifies the logical on-disk repository for a set of binaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoKey {
    /// Project name.
    pub project: String,
    /// Ref (branch or tag) name.
    pub ref_name: String,
    /// Distro name.
    pub distro: String,
    /// Distro version name.
    pub distro_version: String,
}

impl RepoKey {
    /// Create a repo key from its four components.
    pub fn new(project: &str, ref_name: &str, distro: &str, distro_version: &str) -> Self {
        Self {
            project: project.to_string(),
            ref_name: ref_name.to_string(),
            distro: distro.to_string(),
            distro_version: distro_version.to_string(),
        }
    }

    /// Which family of repository tooling this key requires.
    pub fn family(&self) -> RepoFamily {
        match self.distro.as_str() {
            "debian" | "ubuntu" => RepoFamily::Debian,
            _ => RepoFamily::Rpm,
        }
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.project, self.ref_name, self.distro, self.distro_version
        )
    }
}

/// Repository tooling family, selecting the external indexing command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoFamily {
    /// Debian-style repositories, indexed with reprepro.
    Debian,
    /// RPM-style repositories, indexed with createrepo.
    Rpm,
}

/// The logical on-disk repository for a (project, ref, distro,
/// distro_version) tuple.
///
/// `needs_build` and `is_building` are persisted so the rebuild state
/// machine survives process restarts: CLEAN is neither flag set, PENDING is
/// `needs_build`, BUILDING is `is_building`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    /// Entity id.
    pub id: Id,
    /// Repo key.
    pub key: RepoKey,
    /// Set on every binary create/update; cleared only by a successful build.
    pub needs_build: bool,
    /// Set while a build task runs against this repo's directory.
    pub is_building: bool,
    /// Last modification timestamp.
    pub modified: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_extension() {
        let mut binary = sample_binary("ceph_10.2.0-1_amd64.deb");
        assert_eq!(binary.extension(), "deb");

        binary.name = "ceph-10.2.0-0.el7.src.rpm".to_string();
        assert_eq!(binary.extension(), "rpm");

        binary.name = "ceph_10.2.0-1.dsc".to_string();
        assert_eq!(binary.extension(), "dsc");

        binary.name = "no-extension".to_string();
        assert_eq!(binary.extension(), "no-extension");
    }

    #[test]
    fn test_repo_key_display() {
        let key = RepoKey::new("ceph", "master", "centos", "7");
        assert_eq!(key.to_string(), "ceph/master/centos/7");
    }

    #[test]
    fn test_repo_family() {
        assert_eq!(
            RepoKey::new("p", "master", "ubuntu", "trusty").family(),
            RepoFamily::Debian
        );
        assert_eq!(
            RepoKey::new("p", "master", "debian", "jessie").family(),
            RepoFamily::Debian
        );
        assert_eq!(
            RepoKey::new("p", "master", "centos", "7").family(),
            RepoFamily::Rpm
        );
    }

    #[test]
    fn test_binary_repo_key() {
        let binary = sample_binary("ceph_10.2.0-1_amd64.deb");
        let key = binary.repo_key();
        assert_eq!(key, RepoKey::new("ceph", "master", "ubuntu", "trusty"));
    }

    fn sample_binary(name: &str) -> Binary {
        Binary {
            id: 1,
            name: name.to_string(),
            project: "ceph".to_string(),
            distro: "ubuntu".to_string(),
            distro_version: "trusty".to_string(),
            arch: "amd64".to_string(),
            ref_name: "master".to_string(),
            size: 0,
            checksum: None,
            path: None,
            created: Utc::now(),
            modified: Utc::now(),
        }
    }
}
