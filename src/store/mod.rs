//! Resource hierarchy storage.
//!
//! The [`HierarchyStore`] trait is the single place that owns the
//! idempotent get-or-create contract for the Project -> Distro ->
//! DistroVersion -> DistroArch chain, binary upserts, and the persisted
//! repo rebuild flags. Two implementations are provided: a PostgreSQL
//! store for deployments and an in-memory store for tests and small
//! setups.

use async_trait::async_trait;

use crate::error::ArchiveResult;
use crate::models::{Binary, BinaryAddress, DistroArch, Id, Repo, RepoKey};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Fields for creating a new binary row.
#[derive(Debug, Clone)]
pub struct NewBinary {
    /// Address tuple of the binary.
    pub address: BinaryAddress,
    /// Architecture directory name recorded in the hierarchy.
    pub arch: String,
    /// Size in bytes.
    pub size: i64,
    /// SHA-512 checksum, hex-encoded, if bytes passed through ingestion.
    pub checksum: Option<String>,
    /// Absolute path of the stored file, if any.
    pub path: Option<String>,
}

/// Selection of binaries across repos, used for repository composition:
/// pulling a source project's binaries into another project's build.
#[derive(Debug, Clone)]
pub struct BinaryQuery {
    /// Source project name.
    pub project: String,
    /// Restrict to one distro; any distro when unset.
    pub distro: Option<String>,
    /// Distro versions to match; must not be empty.
    pub distro_versions: Vec<String>,
    /// Restrict to one ref of the source project; any ref when unset.
    pub ref_name: Option<String>,
}

/// Mutable fields of an existing binary; identity fields never change.
#[derive(Debug, Clone)]
pub struct BinaryUpdate {
    /// New size in bytes.
    pub size: i64,
    /// New checksum, if recomputed.
    pub checksum: Option<String>,
    /// New stored path, if the payload moved.
    pub path: Option<String>,
}

/// Transactional storage for the resource hierarchy and repo rebuild flags.
///
/// Implementations must make [`ensure_chain`](Self::ensure_chain) safe to
/// call concurrently for the same chain: a unique-key race is absorbed by
/// re-reading the winning row, never surfaced to callers, and no partially
/// created chain may be visible outside the transaction.
#[async_trait]
pub trait HierarchyStore: Send + Sync {
    /// Get or create the full ancestor chain, returning the leaf arch.
    ///
    /// Creation happens top to bottom inside one atomic unit of work.
    async fn ensure_chain(
        &self,
        project: &str,
        distro: &str,
        distro_version: &str,
        arch: &str,
    ) -> ArchiveResult<DistroArch>;

    /// Look up a binary by its address tuple.
    async fn find_binary(&self, address: &BinaryAddress) -> ArchiveResult<Option<Binary>>;

    /// Create a binary row. The ancestor chain must already exist.
    async fn create_binary(&self, new: NewBinary) -> ArchiveResult<Binary>;

    /// Update the mutable fields of a binary, bumping its modified time.
    async fn update_binary(&self, id: Id, update: BinaryUpdate) -> ArchiveResult<Binary>;

    /// Get or create the repo row for a key.
    async fn get_or_create_repo(&self, key: &RepoKey) -> ArchiveResult<Repo>;

    /// Look up a repo by key.
    async fn get_repo(&self, key: &RepoKey) -> ArchiveResult<Option<Repo>>;

    /// Flag a repo as needing a rebuild.
    async fn mark_repo_pending(&self, key: &RepoKey) -> ArchiveResult<()>;

    /// Attempt the PENDING -> BUILDING transition.
    ///
    /// Returns true when this caller won the transition: the rebuild flag is
    /// cleared and the building flag set in one atomic step. Returns false
    /// when the repo is not pending or another build is already running, so
    /// at most one build runs per repo key at any instant.
    async fn begin_build(&self, key: &RepoKey) -> ArchiveResult<bool>;

    /// Finish a build, clearing the building flag.
    ///
    /// A failed build re-flags the repo as pending so a later sweep or
    /// event retries it.
    async fn finish_build(&self, key: &RepoKey, success: bool) -> ArchiveResult<()>;

    /// All repos flagged pending with no build currently running.
    async fn pending_repos(&self) -> ArchiveResult<Vec<Repo>>;

    /// All binaries attached to a repo key.
    async fn repo_binaries(&self, key: &RepoKey) -> ArchiveResult<Vec<Binary>>;

    /// All binaries matching a cross-repo query. A project that does not
    /// exist simply matches nothing.
    async fn matching_binaries(&self, query: &BinaryQuery) -> ArchiveResult<Vec<Binary>>;
}
