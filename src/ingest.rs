//! Artifact ingestion.
//!
//! Accepts a new or updated binary's metadata and bytes, records it against
//! the resource hierarchy, and flags the owning repo for a rebuild. The
//! uploader never waits on the rebuild; that happens asynchronously through
//! the scheduler.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha512};
use tracing::{debug, warn};

use crate::error::{ArchiveError, ArchiveResult};
use crate::models::{Binary, BinaryAddress, RepoKey};
use crate::paths;
use crate::scheduler::RebuildHandle;
use crate::store::{BinaryUpdate, HierarchyStore, NewBinary};

/// How many times a unique-key race on ancestor creation is retried before
/// giving up. Races resolve on the first retry in practice.
const CHAIN_RETRIES: usize = 3;

/// The resolved per-request context handed in by the HTTP boundary.
///
/// Carried explicitly through the call chain; there is no ambient request
/// state anywhere in this crate.
#[derive(Debug, Clone)]
pub struct IngestContext {
    /// Project name.
    pub project: String,
    /// Distro name.
    pub distro: String,
    /// Distro version name.
    pub distro_version: String,
    /// Client-supplied architecture string.
    pub arch: String,
    /// Ref (branch or tag) name.
    pub ref_name: String,
    /// Filename of the binary.
    pub name: String,
}

impl IngestContext {
    /// The repo key this context addresses.
    pub fn repo_key(&self) -> RepoKey {
        RepoKey::new(&self.project, &self.ref_name, &self.distro, &self.distro_version)
    }

    /// The binary address tuple this context addresses.
    pub fn address(&self) -> BinaryAddress {
        BinaryAddress {
            name: self.name.clone(),
            project: self.project.clone(),
            ref_name: self.ref_name.clone(),
            distro: self.distro.clone(),
            distro_version: self.distro_version.clone(),
        }
    }

    fn validate(&self) -> ArchiveResult<()> {
        for (field, value) in [
            ("name", &self.name),
            ("project", &self.project),
            ("distro", &self.distro),
            ("distro_version", &self.distro_version),
            ("arch", &self.arch),
            ("ref", &self.ref_name),
        ] {
            if value.is_empty() {
                return Err(ArchiveError::Invalid(format!(
                    "could not find required key: '{}'",
                    field
                )));
            }
        }
        Ok(())
    }
}

/// Where the binary's content comes from.
#[derive(Debug, Clone)]
pub enum BinarySource {
    /// Uploaded bytes, to be written under the binary root.
    Payload(Bytes),
    /// A trusted local path to an already existing file.
    LocalPath(PathBuf),
}

/// Whether ingestion created a fresh resource or replaced an existing one.
/// The boundary layer maps this to the status it reports to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new binary record and file.
    Created,
    /// An existing record or file was replaced.
    Updated,
}

/// A resolved download: the boundary layer either streams the file itself
/// or emits reverse-proxy headers, depending on `delegate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    /// Absolute path of the stored binary.
    pub path: PathBuf,
    /// When true, serving is delegated to the reverse proxy.
    pub delegate: bool,
}

/// The artifact ingestion service.
pub struct Ingestor {
    store: Arc<dyn HierarchyStore>,
    binary_root: PathBuf,
    delegate_downloads: bool,
    scheduler: RebuildHandle,
}

impl Ingestor {
    /// Create a new ingestor.
    pub fn new(
        store: Arc<dyn HierarchyStore>,
        binary_root: PathBuf,
        delegate_downloads: bool,
        scheduler: RebuildHandle,
    ) -> Self {
        Self {
            store,
            binary_root,
            delegate_downloads,
            scheduler,
        }
    }

    /// Ingest a binary.
    ///
    /// A binary that already exists at the address fails with
    /// [`ArchiveError::Conflict`] unless `force` is set, in which case only
    /// its size, checksum, path, and modified time are updated. Every
    /// successful call flags the owning repo for a rebuild.
    pub async fn ingest(
        &self,
        ctx: &IngestContext,
        source: BinarySource,
        force: bool,
    ) -> ArchiveResult<(Binary, IngestOutcome)> {
        ctx.validate()?;

        let address = ctx.address();
        let existing = self.store.find_binary(&address).await?;

        if existing.is_some() && !force {
            return Err(ArchiveError::Conflict(
                "file already exists and 'force' flag was not used".to_string(),
            ));
        }

        let key = ctx.repo_key();
        let arch_dir = paths::storage_arch(&ctx.name, &ctx.arch);
        let stored = self.store_source(ctx, &key, &arch_dir, source).await?;

        let (binary, outcome) = match existing {
            Some(binary) => {
                let updated = self
                    .store
                    .update_binary(
                        binary.id,
                        BinaryUpdate {
                            size: stored.size,
                            checksum: stored.checksum,
                            path: stored.path,
                        },
                    )
                    .await?;
                (updated, IngestOutcome::Updated)
            }
            None => {
                self.ensure_chain_retrying(ctx, &arch_dir).await?;
                let created = self
                    .store
                    .create_binary(NewBinary {
                        address,
                        arch: arch_dir.clone(),
                        size: stored.size,
                        checksum: stored.checksum,
                        path: stored.path,
                    })
                    .await
                    .map_err(|e| {
                        if e.is_store_conflict() {
                            // Someone else created the same address between our
                            // lookup and insert; to this caller that is a
                            // duplicate create.
                            ArchiveError::Conflict(
                                "file already exists and 'force' flag was not used".to_string(),
                            )
                        } else {
                            e
                        }
                    })?;
                let outcome = if stored.overwrote_file {
                    IngestOutcome::Updated
                } else {
                    IngestOutcome::Created
                };
                (created, outcome)
            }
        };

        self.store.get_or_create_repo(&key).await?;
        self.store.mark_repo_pending(&key).await?;
        self.scheduler.schedule_rebuild(key);

        Ok((binary, outcome))
    }

    /// Resolve a download request to a path plus delegation flag.
    pub async fn resolve_download(&self, ctx: &IngestContext) -> ArchiveResult<Download> {
        let binary = self
            .store
            .find_binary(&ctx.address())
            .await?
            .ok_or_else(|| ArchiveError::NotFound(format!("binary {}", ctx.name)))?;

        let path = binary
            .path
            .ok_or_else(|| ArchiveError::NotFound(format!("{} has no stored file", ctx.name)))?;

        Ok(Download {
            path: PathBuf::from(path),
            delegate: self.delegate_downloads,
        })
    }

    async fn ensure_chain_retrying(&self, ctx: &IngestContext, arch_dir: &str) -> ArchiveResult<()> {
        let mut last = None;
        for attempt in 0..CHAIN_RETRIES {
            match self
                .store
                .ensure_chain(&ctx.project, &ctx.distro, &ctx.distro_version, arch_dir)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.is_store_conflict() => {
                    debug!("chain creation raced (attempt {}), retrying lookup", attempt + 1);
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.expect("retry loop ran at least once"))
    }

    async fn store_source(
        &self,
        ctx: &IngestContext,
        key: &RepoKey,
        arch_dir: &str,
        source: BinarySource,
    ) -> ArchiveResult<StoredSource> {
        match source {
            BinarySource::Payload(bytes) => {
                let dir = paths::binary_directory(&self.binary_root, key, arch_dir);
                tokio::fs::create_dir_all(&dir).await?;

                let destination = dir.join(&ctx.name);
                let overwrote_file = tokio::fs::try_exists(&destination).await.unwrap_or(false);

                tokio::fs::write(&destination, &bytes).await?;
                debug!("stored {} bytes at {}", bytes.len(), destination.display());

                Ok(StoredSource {
                    size: bytes.len() as i64,
                    checksum: Some(sha512_hex(&bytes)),
                    path: Some(destination.to_string_lossy().into_owned()),
                    overwrote_file,
                })
            }
            BinarySource::LocalPath(path) => {
                // A stat failure degrades to size 0 rather than rejecting the
                // upload; the binary record is never lost over imprecise
                // metadata.
                let size = match tokio::fs::metadata(&path).await {
                    Ok(metadata) => metadata.len() as i64,
                    Err(e) => {
                        warn!("could not retrieve size from {}: {}", path.display(), e);
                        0
                    }
                };

                Ok(StoredSource {
                    size,
                    checksum: None,
                    path: Some(path.to_string_lossy().into_owned()),
                    overwrote_file: false,
                })
            }
        }
    }
}

struct StoredSource {
    size: i64,
    checksum: Option<String>,
    path: Option<String>,
    overwrote_file: bool,
}

fn sha512_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
