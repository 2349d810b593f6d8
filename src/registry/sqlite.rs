//! SQLite-backed version store.
//!
//! Durable implementation of [`VersionStore`] used by the CLI so that a
//! pipeline can be resumed across process restarts. Writes go through a
//! single async mutex and run inside a transaction; the
//! `UNIQUE(pipeline_id, stage, version_number)` constraint backs that up at
//! the database level.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    schema, validate_lineage, NewVersion, Pipeline, PipelineStage, PipelineUpdate, SourceFile,
    Stage, StageStatus, StageVersion, VersionOutcome, VersionStatus, VersionStore,
};
use crate::error::StoreError;

const VERSION_COLUMNS: &str = "id, pipeline_id, stage, version_number, batch, source, status, \
     error, output_path, checksum, created_at, finished_at";

const PIPELINE_COLUMNS: &str =
    "id, domain, domain_version, stage, status, error, created_at, updated_at";

/// Version store persisted in a SQLite database.
pub struct SqliteVersionStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteVersionStore {
    /// Opens (creating if needed) the database at `database_url` and applies
    /// the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite://forge.db")
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let in_memory = database_url.contains(":memory:");

        // Each in-memory connection is its own database, so keep exactly one
        // connection alive for the lifetime of the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Opens a fresh private in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Applies every schema statement not yet recorded in `_migrations`.
    ///
    /// Idempotent: statements use IF NOT EXISTS and applied names are skipped.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(schema::CREATE_MIGRATIONS_TABLE)
            .execute(&self.pool)
            .await?;

        for (idx, statement) in schema::all_schema_statements().iter().enumerate() {
            let name = format!("schema_v1_part_{}", idx);
            let applied: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM _migrations WHERE name = ?")
                    .bind(&name)
                    .fetch_optional(&self.pool)
                    .await?;
            if applied.is_some() {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            sqlx::query(statement).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO _migrations (name, applied_at) VALUES (?, ?)")
                .bind(&name)
                .bind(timestamp(&Utc::now()))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::debug!(migration = %name, "Applied schema migration");
        }

        Ok(())
    }
}

#[async_trait]
impl VersionStore for SqliteVersionStore {
    async fn create_pipeline(
        &self,
        domain: &str,
        domain_version: u32,
    ) -> Result<Pipeline, StoreError> {
        let _guard = self.write_lock.lock().await;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT id FROM pipelines WHERE domain = ? AND domain_version = ?")
                .bind(domain)
                .bind(i64::from(domain_version))
                .fetch_optional(&self.pool)
                .await?;
        if let Some((id,)) = existing {
            return Err(StoreError::DuplicatePipeline {
                domain: domain.to_string(),
                domain_version,
                existing: parse_uuid(&id)?,
            });
        }

        let pipeline = Pipeline::new(domain, domain_version);
        sqlx::query(
            r#"
            INSERT INTO pipelines (id, domain, domain_version, stage, status, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(pipeline.id.to_string())
        .bind(&pipeline.domain)
        .bind(i64::from(pipeline.domain_version))
        .bind(pipeline.stage.as_str())
        .bind(pipeline.status.as_str())
        .bind(pipeline.error.as_deref())
        .bind(timestamp(&pipeline.created_at))
        .bind(timestamp(&pipeline.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(pipeline)
    }

    async fn get_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_pipeline(&mut *conn, id).await
    }

    async fn list_pipelines(&self) -> Result<Vec<Pipeline>, StoreError> {
        let sql = format!(
            "SELECT {} FROM pipelines ORDER BY created_at, id",
            PIPELINE_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(pipeline_from_row).collect()
    }

    async fn update_pipeline(
        &self,
        id: Uuid,
        update: PipelineUpdate,
    ) -> Result<Pipeline, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut pipeline = fetch_pipeline(&mut *tx, id)
            .await?
            .ok_or(StoreError::PipelineNotFound(id))?;
        pipeline.stage = update.stage;
        pipeline.status = update.status;
        pipeline.error = update.error;
        pipeline.updated_at = Utc::now();

        sqlx::query("UPDATE pipelines SET stage = ?, status = ?, error = ?, updated_at = ? WHERE id = ?")
            .bind(pipeline.stage.as_str())
            .bind(pipeline.status.as_str())
            .bind(pipeline.error.as_deref())
            .bind(timestamp(&pipeline.updated_at))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(pipeline)
    }

    async fn allocate_batch(&self, pipeline_id: Uuid, stage: Stage) -> Result<u32, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        if fetch_pipeline(&mut *tx, pipeline_id).await?.is_none() {
            return Err(StoreError::PipelineNotFound(pipeline_id));
        }

        let recorded: Option<(i64,)> = sqlx::query_as(
            "SELECT last_batch FROM stage_batches WHERE pipeline_id = ? AND stage = ?",
        )
        .bind(pipeline_id.to_string())
        .bind(stage.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let (from_versions,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(batch), 0) FROM stage_versions WHERE pipeline_id = ? AND stage = ?",
        )
        .bind(pipeline_id.to_string())
        .bind(stage.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let next = recorded.map_or(0, |(n,)| n).max(from_versions) + 1;
        sqlx::query(
            r#"
            INSERT INTO stage_batches (pipeline_id, stage, last_batch) VALUES (?, ?, ?)
            ON CONFLICT (pipeline_id, stage) DO UPDATE SET last_batch = excluded.last_batch
            "#,
        )
        .bind(pipeline_id.to_string())
        .bind(stage.as_str())
        .bind(next)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        to_u32(next, "batch")
    }

    async fn begin_version(&self, new: NewVersion) -> Result<StageVersion, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        if fetch_pipeline(&mut *tx, new.pipeline_id).await?.is_none() {
            return Err(StoreError::PipelineNotFound(new.pipeline_id));
        }

        let mut inputs = Vec::with_capacity(new.inputs.len());
        for id in &new.inputs {
            if let Some(input) = fetch_version(&mut *tx, *id).await? {
                inputs.push(input);
            }
        }
        validate_lineage(&new, &inputs)?;

        let (max_number,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version_number), 0) FROM stage_versions WHERE pipeline_id = ? AND stage = ?",
        )
        .bind(new.pipeline_id.to_string())
        .bind(new.stage.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let version = new.into_version(to_u32(max_number + 1, "version_number")?);
        let source = version
            .source
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO stage_versions (
                id, pipeline_id, stage, version_number, batch, source, status,
                error, output_path, checksum, created_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, ?, NULL)
            "#,
        )
        .bind(version.id.to_string())
        .bind(version.pipeline_id.to_string())
        .bind(version.stage.as_str())
        .bind(i64::from(version.version_number))
        .bind(i64::from(version.batch))
        .bind(source)
        .bind(version.status.as_str())
        .bind(timestamp(&version.created_at))
        .execute(&mut *tx)
        .await?;

        for (position, input_id) in version.inputs.iter().enumerate() {
            sqlx::query("INSERT INTO version_inputs (version_id, input_id, position) VALUES (?, ?, ?)")
                .bind(version.id.to_string())
                .bind(input_id.to_string())
                .bind(position as i64)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(version)
    }

    async fn finish_version(
        &self,
        id: Uuid,
        outcome: VersionOutcome,
    ) -> Result<StageVersion, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut version = fetch_version(&mut *tx, id)
            .await?
            .ok_or(StoreError::VersionNotFound(id))?;
        version.finalize(outcome)?;

        sqlx::query(
            r#"
            UPDATE stage_versions
            SET status = ?, error = ?, output_path = ?, checksum = ?, finished_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(version.status.as_str())
        .bind(version.error.as_deref())
        .bind(
            version
                .output_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        )
        .bind(version.checksum.as_deref())
        .bind(version.finished_at.as_ref().map(timestamp))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(version)
    }

    async fn get_version(&self, id: Uuid) -> Result<Option<StageVersion>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_version(&mut *conn, id).await
    }

    async fn list_versions(
        &self,
        pipeline_id: Uuid,
        stage: Option<Stage>,
    ) -> Result<Vec<StageVersion>, StoreError> {
        let mut conn = self.pool.acquire().await?;

        let rows = match stage {
            Some(stage) => {
                let sql = format!(
                    "SELECT {} FROM stage_versions WHERE pipeline_id = ? AND stage = ? ORDER BY version_number",
                    VERSION_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(pipeline_id.to_string())
                    .bind(stage.as_str())
                    .fetch_all(&mut *conn)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM stage_versions WHERE pipeline_id = ?",
                    VERSION_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(pipeline_id.to_string())
                    .fetch_all(&mut *conn)
                    .await?
            }
        };

        let mut versions = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut version = version_from_row(row)?;
            version.inputs = fetch_inputs(&mut *conn, version.id).await?;
            versions.push(version);
        }
        versions.sort_by_key(|v| (v.stage, v.version_number));
        Ok(versions)
    }
}

async fn fetch_pipeline(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<Option<Pipeline>, StoreError> {
    let sql = format!("SELECT {} FROM pipelines WHERE id = ?", PIPELINE_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(pipeline_from_row).transpose()
}

async fn fetch_version(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<Option<StageVersion>, StoreError> {
    let sql = format!("SELECT {} FROM stage_versions WHERE id = ?", VERSION_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => {
            let mut version = version_from_row(&row)?;
            version.inputs = fetch_inputs(conn, id).await?;
            Ok(Some(version))
        }
        None => Ok(None),
    }
}

async fn fetch_inputs(conn: &mut SqliteConnection, id: Uuid) -> Result<Vec<Uuid>, StoreError> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT input_id FROM version_inputs WHERE version_id = ? ORDER BY position")
            .bind(id.to_string())
            .fetch_all(&mut *conn)
            .await?;
    rows.iter().map(|(s,)| parse_uuid(s)).collect()
}

fn pipeline_from_row(row: &SqliteRow) -> Result<Pipeline, StoreError> {
    let stage: String = row.try_get("stage")?;
    let status: String = row.try_get("status")?;
    let domain_version: i64 = row.try_get("domain_version")?;

    Ok(Pipeline {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        domain: row.try_get("domain")?,
        domain_version: to_u32(domain_version, "domain_version")?,
        stage: PipelineStage::parse(&stage)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown pipeline stage '{}'", stage)))?,
        status: StageStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown pipeline status '{}'", status)))?,
        error: row.try_get("error")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn version_from_row(row: &SqliteRow) -> Result<StageVersion, StoreError> {
    let stage: String = row.try_get("stage")?;
    let status: String = row.try_get("status")?;
    let source: Option<String> = row.try_get("source")?;
    let output_path: Option<String> = row.try_get("output_path")?;
    let finished_at: Option<String> = row.try_get("finished_at")?;

    Ok(StageVersion {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        pipeline_id: parse_uuid(&row.try_get::<String, _>("pipeline_id")?)?,
        stage: Stage::parse(&stage)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown stage '{}'", stage)))?,
        version_number: to_u32(row.try_get("version_number")?, "version_number")?,
        batch: to_u32(row.try_get("batch")?, "batch")?,
        inputs: Vec::new(),
        source: source
            .map(|s| serde_json::from_str::<SourceFile>(&s))
            .transpose()?,
        status: VersionStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown version status '{}'", status)))?,
        error: row.try_get("error")?,
        output_path: output_path.map(PathBuf::from),
        checksum: row.try_get("checksum")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn timestamp(at: &DateTime<Utc>) -> String {
    // Fixed-width so lexical order matches chronological order.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid timestamp '{}': {}", s, e)))
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("invalid id '{}': {}", s, e)))
}

fn to_u32(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("{} out of range: {}", column, value)))
}
