//! Configuration management for the archive service.
//!
//! Configuration is a JSON file with defaults suitable for development;
//! every section can be overridden independently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, ArchiveResult};

/// Archive service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Root directory for uploaded binary storage.
    pub binary_root: PathBuf,
    /// Root directory for generated package repositories.
    pub repos_root: PathBuf,
    /// When true, downloads only resolve paths and a reverse proxy serves
    /// the bytes.
    pub delegate_downloads: bool,
    /// Seconds to wait after the last ingestion event before a repository
    /// rebuild is dispatched.
    pub quiet_time_seconds: u64,
    /// Seconds between sweeps for repositories flagged as needing a rebuild.
    pub polling_cycle_seconds: u64,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// External indexing tool configuration.
    pub builder: BuilderConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL.
    pub url: String,
    /// Maximum number of connections in pool.
    pub max_connections: u32,
    /// Connection timeout (seconds).
    pub connection_timeout: u64,
}

/// External indexing tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Command used to index Debian-family repositories.
    pub reprepro_command: String,
    /// Command used to index RPM-family repositories.
    pub createrepo_command: String,
    /// Configuration directory passed to reprepro via `--confdir`.
    pub confdir: PathBuf,
    /// Per-project repository composition rules, keyed by project name.
    #[serde(default)]
    pub repos: HashMap<String, ProjectRepos>,
}

/// Composition rules for one project's repositories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectRepos {
    /// Extra source projects per ref. The `"all"` entry applies to any ref
    /// that has no entry of its own.
    #[serde(default)]
    pub extras: HashMap<String, HashMap<String, ExtraSource>>,
    /// Distro versions whose Debian repositories are indexed together:
    /// building any of them also includes binaries from the sibling
    /// versions listed here.
    #[serde(default)]
    pub combined: Vec<String>,
}

/// One extra source project feeding binaries into another project's builds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtraSource {
    /// Restrict to one ref of the source project; all refs when unset.
    #[serde(default)]
    pub ref_name: Option<String>,
    /// Distro versions to pull from the source project, overriding the
    /// version of the repo under build.
    #[serde(default)]
    pub distro_versions: Vec<String>,
}

impl BuilderConfig {
    /// Extra source projects configured for a project and ref, falling back
    /// to the project's `"all"` entry.
    pub fn extra_sources(&self, project: &str, ref_name: &str) -> HashMap<String, ExtraSource> {
        let Some(repos) = self.repos.get(project) else {
            return HashMap::new();
        };
        repos
            .extras
            .get(ref_name)
            .or_else(|| repos.extras.get("all"))
            .cloned()
            .unwrap_or_default()
    }

    /// Distro versions combined with `distro_version` for a project, not
    /// including `distro_version` itself. Empty when the version is not part
    /// of a combined set.
    pub fn combined_versions(&self, project: &str, distro_version: &str) -> Vec<String> {
        let Some(repos) = self.repos.get(project) else {
            return Vec::new();
        };
        if !repos.combined.iter().any(|v| v == distro_version) {
            return Vec::new();
        }
        repos
            .combined
            .iter()
            .filter(|v| v.as_str() != distro_version)
            .cloned()
            .collect()
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            binary_root: PathBuf::from("/opt/binaries"),
            repos_root: PathBuf::from("/opt/repos"),
            delegate_downloads: false,
            quiet_time_seconds: 30,
            polling_cycle_seconds: 15,
            database: DatabaseConfig::default(),
            builder: BuilderConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/binary_archive".to_string(),
            max_connections: 10,
            connection_timeout: 30,
        }
    }
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            reprepro_command: "reprepro".to_string(),
            createrepo_command: "createrepo_c".to_string(),
            confdir: PathBuf::from("/etc"),
            repos: HashMap::new(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> ArchiveResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ArchiveError::Configuration(format!("Failed to read config file: {}", e))
        })?;

        let config: ServiceConfig = serde_json::from_str(&content)
            .map_err(|e| ArchiveError::Configuration(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn to_file(&self, path: &Path) -> ArchiveResult<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            ArchiveError::Configuration(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, content).map_err(|e| {
            ArchiveError::Configuration(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ArchiveResult<()> {
        if self.binary_root.as_os_str().is_empty() {
            return Err(ArchiveError::Configuration(
                "binary_root cannot be empty".to_string(),
            ));
        }

        if self.repos_root.as_os_str().is_empty() {
            return Err(ArchiveError::Configuration(
                "repos_root cannot be empty".to_string(),
            ));
        }

        if self.quiet_time_seconds == 0 {
            return Err(ArchiveError::Configuration(
                "quiet_time_seconds must be greater than zero".to_string(),
            ));
        }

        if self.polling_cycle_seconds == 0 {
            return Err(ArchiveError::Configuration(
                "polling_cycle_seconds must be greater than zero".to_string(),
            ));
        }

        if self.builder.reprepro_command.is_empty() || self.builder.createrepo_command.is_empty() {
            return Err(ArchiveError::Configuration(
                "indexing tool commands cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quiet_time_seconds, 30);
        assert_eq!(config.polling_cycle_seconds, 15);
        assert!(!config.delegate_downloads);
    }

    #[test]
    fn test_zero_quiet_time_rejected() {
        let config = ServiceConfig {
            quiet_time_seconds: 0,
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_tool_command_rejected() {
        let mut config = ServiceConfig::default();
        config.builder.reprepro_command = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_extra_sources_ref_beats_all() {
        let mut config = BuilderConfig::default();
        let mut extras = HashMap::new();
        extras.insert(
            "master".to_string(),
            HashMap::from([(
                "ceph-deploy".to_string(),
                ExtraSource {
                    ref_name: Some("master".to_string()),
                    distro_versions: Vec::new(),
                },
            )]),
        );
        extras.insert(
            "all".to_string(),
            HashMap::from([("radosgw-agent".to_string(), ExtraSource::default())]),
        );
        config.repos.insert(
            "ceph".to_string(),
            ProjectRepos {
                extras,
                combined: Vec::new(),
            },
        );

        let matched = config.extra_sources("ceph", "master");
        assert!(matched.contains_key("ceph-deploy"));
        assert!(!matched.contains_key("radosgw-agent"));

        // Refs without their own entry fall back to "all".
        let fallback = config.extra_sources("ceph", "jewel");
        assert!(fallback.contains_key("radosgw-agent"));

        assert!(config.extra_sources("unconfigured", "master").is_empty());
    }

    #[test]
    fn test_combined_versions_excludes_own() {
        let mut config = BuilderConfig::default();
        config.repos.insert(
            "ceph".to_string(),
            ProjectRepos {
                extras: HashMap::new(),
                combined: vec!["trusty".to_string(), "xenial".to_string()],
            },
        );

        assert_eq!(config.combined_versions("ceph", "trusty"), vec!["xenial"]);
        // Versions outside the combined set stay standalone.
        assert!(config.combined_versions("ceph", "wheezy").is_empty());
        assert!(config.combined_versions("other", "trusty").is_empty());
    }

    #[test]
    fn test_config_file_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");

        let config = ServiceConfig {
            binary_root: PathBuf::from("/srv/binaries"),
            delegate_downloads: true,
            ..ServiceConfig::default()
        };

        config.to_file(&config_path).unwrap();
        let loaded = ServiceConfig::from_file(&config_path).unwrap();

        assert_eq!(loaded.binary_root, PathBuf::from("/srv/binaries"));
        assert!(loaded.delegate_downloads);
        assert_eq!(loaded.database.max_connections, 10);
    }
}
