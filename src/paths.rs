//! Filesystem path resolution for repositories and stored binaries.
//!
//! This module is the single place where repository layout is decided. All
//! functions are pure; callers do the I/O.

use std::path::{Path, PathBuf};

use crate::models::RepoKey;

/// The set of paths relevant to one on-disk repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoPaths {
    /// Path relative to the project root, e.g. `master/ubuntu/trusty`.
    pub relative: PathBuf,
    /// Project root, e.g. `/opt/repos/ceph-deploy`.
    pub root: PathBuf,
    /// Absolute repository path, `root` joined with `relative`.
    pub absolute: PathBuf,
}

/// Construct all the paths that are useful when working with a repository.
pub fn repo_paths(repos_root: &Path, key: &RepoKey) -> RepoPaths {
    let relative = PathBuf::from(&key.ref_name)
        .join(&key.distro)
        .join(&key.distro_version);
    let root = repos_root.join(&key.project);
    let absolute = root.join(&relative);
    RepoPaths {
        relative,
        root,
        absolute,
    }
}

/// Infer the repository-layout directory name for an architecture bucket
/// from a binary's filename.
///
/// Upload URLs are up to the client to define, so the client-supplied
/// architecture cannot be trusted as a directory name: a client may POST an
/// RPM under "amd64" while the correct repository directory is "x86_64".
/// Convention also wants architecture-independent binaries under "noarch",
/// which doubles as the fallback for anything that cannot be classified.
/// Ambiguous input must never abort ingestion.
pub fn infer_arch_directory(filename: &str) -> &'static str {
    let name = filename.to_lowercase();
    if name.ends_with("src.rpm") {
        "SRPMS"
    } else if name.ends_with("x86_64.rpm") {
        "x86_64"
    } else {
        // Covers names containing "noarch" and anything unclassifiable.
        "noarch"
    }
}

/// Directory where an uploaded binary's bytes land, mirroring the published
/// repository structure under `binary_root`.
pub fn binary_directory(binary_root: &Path, key: &RepoKey, arch_dir: &str) -> PathBuf {
    binary_root
        .join(&key.project)
        .join(&key.ref_name)
        .join(&key.distro)
        .join(&key.distro_version)
        .join(arch_dir)
}

/// The arch directory a binary is stored under.
///
/// RPM filenames carry their own layout conventions, so those are inferred
/// from the filename; everything else keeps the client-supplied name (Debian
/// arch names are already layout names, and reprepro reads the real
/// architecture from the package itself).
pub fn storage_arch(filename: &str, client_arch: &str) -> String {
    if filename.to_lowercase().ends_with(".rpm") {
        infer_arch_directory(filename).to_string()
    } else {
        client_arch.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_paths_layout() {
        let key = RepoKey::new("ceph-deploy", "master", "ubuntu", "trusty");
        let paths = repo_paths(Path::new("/opt/repos"), &key);

        assert_eq!(paths.relative, PathBuf::from("master/ubuntu/trusty"));
        assert_eq!(paths.root, PathBuf::from("/opt/repos/ceph-deploy"));
        assert_eq!(
            paths.absolute,
            PathBuf::from("/opt/repos/ceph-deploy/master/ubuntu/trusty")
        );
    }

    #[test]
    fn test_infer_source_packages() {
        assert_eq!(infer_arch_directory("ceph-10.2.0-0.el7.src.rpm"), "SRPMS");
        assert_eq!(infer_arch_directory("CEPH-10.2.0-0.EL7.SRC.RPM"), "SRPMS");
    }

    #[test]
    fn test_infer_x86_64() {
        assert_eq!(infer_arch_directory("ceph-10.2.0-0.el7.x86_64.rpm"), "x86_64");
        assert_eq!(infer_arch_directory("CEPH-10.2.0-0.EL7.X86_64.RPM"), "x86_64");
    }

    #[test]
    fn test_infer_noarch() {
        assert_eq!(infer_arch_directory("ceph-release-1-0.noarch.rpm"), "noarch");
    }

    #[test]
    fn test_infer_fallback_is_noarch() {
        assert_eq!(infer_arch_directory("mystery-file"), "noarch");
        assert_eq!(infer_arch_directory("ceph_10.2.0-1_amd64.deb"), "noarch");
        assert_eq!(infer_arch_directory(""), "noarch");
    }

    #[test]
    fn test_source_suffix_takes_precedence() {
        // A source RPM that also mentions noarch is still a source package.
        assert_eq!(infer_arch_directory("weird-noarch-1.0.src.rpm"), "SRPMS");
    }

    #[test]
    fn test_binary_directory_layout() {
        let key = RepoKey::new("ceph", "master", "centos", "7");
        let dir = binary_directory(Path::new("/opt/binaries"), &key, "x86_64");
        assert_eq!(
            dir,
            PathBuf::from("/opt/binaries/ceph/master/centos/7/x86_64")
        );
    }

    #[test]
    fn test_storage_arch() {
        // RPM names carry their own convention, client arch is ignored.
        assert_eq!(storage_arch("ceph-10.2.0-0.el7.x86_64.rpm", "amd64"), "x86_64");
        assert_eq!(storage_arch("ceph-10.2.0-0.el7.src.rpm", "amd64"), "SRPMS");
        // Anything else keeps the client-supplied name.
        assert_eq!(storage_arch("ceph_10.2.0-1_amd64.deb", "amd64"), "amd64");
    }
}
