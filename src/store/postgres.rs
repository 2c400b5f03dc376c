//! PostgreSQL hierarchy store.
//!
//! Ancestor-chain creation runs inside a single transaction; unique-key
//! races between concurrent ingestion requests are absorbed by
//! `INSERT ... ON CONFLICT DO NOTHING` followed by a re-read of the row the
//! other writer committed. The rebuild flag transitions are single
//! conditional UPDATE statements so the single-writer-per-repo guarantee
//! holds across processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::error::{ArchiveError, ArchiveResult};
use crate::models::{Binary, BinaryAddress, DistroArch, Id, Repo, RepoKey};

use super::{BinaryQuery, BinaryUpdate, HierarchyStore, NewBinary};

/// A PostgreSQL-backed implementation of [`HierarchyStore`].
pub struct PgStore {
    pool: PgPool,
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS distros (
        id BIGSERIAL PRIMARY KEY,
        project_id BIGINT NOT NULL REFERENCES projects(id),
        name TEXT NOT NULL,
        UNIQUE (project_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS distro_versions (
        id BIGSERIAL PRIMARY KEY,
        distro_id BIGINT NOT NULL REFERENCES distros(id),
        name TEXT NOT NULL,
        UNIQUE (distro_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS distro_archs (
        id BIGSERIAL PRIMARY KEY,
        distro_version_id BIGINT NOT NULL REFERENCES distro_versions(id),
        name TEXT NOT NULL,
        UNIQUE (distro_version_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS binaries (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        project TEXT NOT NULL,
        distro TEXT NOT NULL,
        distro_version TEXT NOT NULL,
        arch TEXT NOT NULL,
        ref_name TEXT NOT NULL,
        size BIGINT NOT NULL DEFAULT 0,
        checksum TEXT,
        path TEXT,
        created TIMESTAMPTZ NOT NULL DEFAULT now(),
        modified TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (name, ref_name, distro, distro_version, project)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS repos (
        id BIGSERIAL PRIMARY KEY,
        project TEXT NOT NULL,
        ref_name TEXT NOT NULL,
        distro TEXT NOT NULL,
        distro_version TEXT NOT NULL,
        needs_build BOOLEAN NOT NULL DEFAULT FALSE,
        is_building BOOLEAN NOT NULL DEFAULT FALSE,
        modified TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (project, ref_name, distro, distro_version)
    )
    "#,
];

impl PgStore {
    /// Create a new store on an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema if it does not exist yet.
    pub async fn migrate(&self) -> ArchiveResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("schema ensured");
        Ok(())
    }

    /// Get-or-create one level of the chain inside the transaction.
    ///
    /// The insert-then-reselect dance turns a unique-key race into a read of
    /// the row the concurrent writer created.
    async fn ensure_row(
        tx: &mut Transaction<'_, Postgres>,
        insert: &str,
        select: &str,
        parent_id: Option<Id>,
        name: &str,
    ) -> ArchiveResult<Id> {
        let inserted: Option<PgRow> = match parent_id {
            Some(parent) => {
                sqlx::query(insert)
                    .bind(parent)
                    .bind(name)
                    .fetch_optional(&mut **tx)
                    .await?
            }
            None => sqlx::query(insert).bind(name).fetch_optional(&mut **tx).await?,
        };

        if let Some(row) = inserted {
            return Ok(row.get("id"));
        }

        let row = match parent_id {
            Some(parent) => {
                sqlx::query(select)
                    .bind(parent)
                    .bind(name)
                    .fetch_one(&mut **tx)
                    .await?
            }
            None => sqlx::query(select).bind(name).fetch_one(&mut **tx).await?,
        };
        Ok(row.get("id"))
    }
}

fn row_to_binary(row: &PgRow) -> Binary {
    Binary {
        id: row.get("id"),
        name: row.get("name"),
        project: row.get("project"),
        distro: row.get("distro"),
        distro_version: row.get("distro_version"),
        arch: row.get("arch"),
        ref_name: row.get("ref_name"),
        size: row.get("size"),
        checksum: row.get("checksum"),
        path: row.get("path"),
        created: row.get::<DateTime<Utc>, _>("created"),
        modified: row.get::<DateTime<Utc>, _>("modified"),
    }
}

fn row_to_repo(row: &PgRow) -> Repo {
    Repo {
        id: row.get("id"),
        key: RepoKey {
            project: row.get("project"),
            ref_name: row.get("ref_name"),
            distro: row.get("distro"),
            distro_version: row.get("distro_version"),
        },
        needs_build: row.get("needs_build"),
        is_building: row.get("is_building"),
        modified: row.get::<DateTime<Utc>, _>("modified"),
    }
}

#[async_trait]
impl HierarchyStore for PgStore {
    async fn ensure_chain(
        &self,
        project: &str,
        distro: &str,
        distro_version: &str,
        arch: &str,
    ) -> ArchiveResult<DistroArch> {
        let mut tx = self.pool.begin().await?;

        let project_id = Self::ensure_row(
            &mut tx,
            "INSERT INTO projects (name) VALUES ($1) ON CONFLICT (name) DO NOTHING RETURNING id",
            "SELECT id FROM projects WHERE name = $1",
            None,
            project,
        )
        .await?;

        let distro_id = Self::ensure_row(
            &mut tx,
            "INSERT INTO distros (project_id, name) VALUES ($1, $2) \
             ON CONFLICT (project_id, name) DO NOTHING RETURNING id",
            "SELECT id FROM distros WHERE project_id = $1 AND name = $2",
            Some(project_id),
            distro,
        )
        .await?;

        let version_id = Self::ensure_row(
            &mut tx,
            "INSERT INTO distro_versions (distro_id, name) VALUES ($1, $2) \
             ON CONFLICT (distro_id, name) DO NOTHING RETURNING id",
            "SELECT id FROM distro_versions WHERE distro_id = $1 AND name = $2",
            Some(distro_id),
            distro_version,
        )
        .await?;

        let arch_id = Self::ensure_row(
            &mut tx,
            "INSERT INTO distro_archs (distro_version_id, name) VALUES ($1, $2) \
             ON CONFLICT (distro_version_id, name) DO NOTHING RETURNING id",
            "SELECT id FROM distro_archs WHERE distro_version_id = $1 AND name = $2",
            Some(version_id),
            arch,
        )
        .await?;

        tx.commit().await?;

        Ok(DistroArch {
            id: arch_id,
            distro_version_id: version_id,
            name: arch.to_string(),
        })
    }

    async fn find_binary(&self, address: &BinaryAddress) -> ArchiveResult<Option<Binary>> {
        let row = sqlx::query(
            "SELECT * FROM binaries WHERE name = $1 AND ref_name = $2 AND distro = $3 \
             AND distro_version = $4 AND project = $5",
        )
        .bind(&address.name)
        .bind(&address.ref_name)
        .bind(&address.distro)
        .bind(&address.distro_version)
        .bind(&address.project)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_binary))
    }

    async fn create_binary(&self, new: NewBinary) -> ArchiveResult<Binary> {
        let row = sqlx::query(
            "INSERT INTO binaries (name, project, distro, distro_version, arch, ref_name, \
             size, checksum, path) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING *",
        )
        .bind(&new.address.name)
        .bind(&new.address.project)
        .bind(&new.address.distro)
        .bind(&new.address.distro_version)
        .bind(&new.arch)
        .bind(&new.address.ref_name)
        .bind(new.size)
        .bind(&new.checksum)
        .bind(&new.path)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &new.address))?;

        Ok(row_to_binary(&row))
    }

    async fn update_binary(&self, id: Id, update: BinaryUpdate) -> ArchiveResult<Binary> {
        let row = sqlx::query(
            "UPDATE binaries SET size = $2, checksum = COALESCE($3, checksum), \
             path = COALESCE($4, path), modified = now() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(update.size)
        .bind(&update.checksum)
        .bind(&update.path)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ArchiveError::NotFound(format!("binary {}", id)))?;

        Ok(row_to_binary(&row))
    }

    async fn get_or_create_repo(&self, key: &RepoKey) -> ArchiveResult<Repo> {
        let inserted = sqlx::query(
            "INSERT INTO repos (project, ref_name, distro, distro_version) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (project, ref_name, distro, distro_version) DO NOTHING RETURNING *",
        )
        .bind(&key.project)
        .bind(&key.ref_name)
        .bind(&key.distro)
        .bind(&key.distro_version)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(row_to_repo(&row));
        }

        let row = sqlx::query(
            "SELECT * FROM repos WHERE project = $1 AND ref_name = $2 AND distro = $3 \
             AND distro_version = $4",
        )
        .bind(&key.project)
        .bind(&key.ref_name)
        .bind(&key.distro)
        .bind(&key.distro_version)
        .fetch_one(&self.pool)
        .await?;

        Ok(row_to_repo(&row))
    }

    async fn get_repo(&self, key: &RepoKey) -> ArchiveResult<Option<Repo>> {
        let row = sqlx::query(
            "SELECT * FROM repos WHERE project = $1 AND ref_name = $2 AND distro = $3 \
             AND distro_version = $4",
        )
        .bind(&key.project)
        .bind(&key.ref_name)
        .bind(&key.distro)
        .bind(&key.distro_version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_repo))
    }

    async fn mark_repo_pending(&self, key: &RepoKey) -> ArchiveResult<()> {
        let updated = sqlx::query(
            "UPDATE repos SET needs_build = TRUE, modified = now() \
             WHERE project = $1 AND ref_name = $2 AND distro = $3 AND distro_version = $4 \
             RETURNING id",
        )
        .bind(&key.project)
        .bind(&key.ref_name)
        .bind(&key.distro)
        .bind(&key.distro_version)
        .fetch_optional(&self.pool)
        .await?;

        updated
            .map(|_| ())
            .ok_or_else(|| ArchiveError::NotFound(format!("repo {}", key)))
    }

    async fn begin_build(&self, key: &RepoKey) -> ArchiveResult<bool> {
        let updated = sqlx::query(
            "UPDATE repos SET needs_build = FALSE, is_building = TRUE, modified = now() \
             WHERE project = $1 AND ref_name = $2 AND distro = $3 AND distro_version = $4 \
             AND needs_build AND NOT is_building RETURNING id",
        )
        .bind(&key.project)
        .bind(&key.ref_name)
        .bind(&key.distro)
        .bind(&key.distro_version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(updated.is_some())
    }

    async fn finish_build(&self, key: &RepoKey, success: bool) -> ArchiveResult<()> {
        let updated = sqlx::query(
            "UPDATE repos SET is_building = FALSE, needs_build = needs_build OR $5, \
             modified = now() \
             WHERE project = $1 AND ref_name = $2 AND distro = $3 AND distro_version = $4 \
             RETURNING id",
        )
        .bind(&key.project)
        .bind(&key.ref_name)
        .bind(&key.distro)
        .bind(&key.distro_version)
        .bind(!success)
        .fetch_optional(&self.pool)
        .await?;

        updated
            .map(|_| ())
            .ok_or_else(|| ArchiveError::NotFound(format!("repo {}", key)))
    }

    async fn pending_repos(&self) -> ArchiveResult<Vec<Repo>> {
        let rows = sqlx::query("SELECT * FROM repos WHERE needs_build AND NOT is_building")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(row_to_repo).collect())
    }

    async fn repo_binaries(&self, key: &RepoKey) -> ArchiveResult<Vec<Binary>> {
        let rows = sqlx::query(
            "SELECT * FROM binaries WHERE project = $1 AND ref_name = $2 AND distro = $3 \
             AND distro_version = $4 ORDER BY name",
        )
        .bind(&key.project)
        .bind(&key.ref_name)
        .bind(&key.distro)
        .bind(&key.distro_version)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_binary).collect())
    }

    async fn matching_binaries(&self, query: &BinaryQuery) -> ArchiveResult<Vec<Binary>> {
        let rows = sqlx::query(
            "SELECT * FROM binaries WHERE project = $1 \
             AND distro_version = ANY($2) \
             AND ($3::text IS NULL OR distro = $3) \
             AND ($4::text IS NULL OR ref_name = $4) \
             ORDER BY name",
        )
        .bind(&query.project)
        .bind(&query.distro_versions)
        .bind(&query.distro)
        .bind(&query.ref_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_binary).collect())
    }
}

fn map_unique_violation(e: sqlx::Error, address: &BinaryAddress) -> ArchiveError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("23505") {
            return ArchiveError::StoreConflict(format!(
                "binary {} created concurrently",
                address.name
            ));
        }
    }
    ArchiveError::Database(e)
}
