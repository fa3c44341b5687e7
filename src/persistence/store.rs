//! SQLite-based state store

use crate::core::{
    DependencyGraph, DispatchMarker, GoodArtifact, Invocation, Run, RunStatus, StepError,
    StepKind, StepResult, StepStatus,
};
use crate::error::{ErrorClass, PipelineError, PipelineResult};
use crate::persistence::{StateStore, DEFAULT_RETENTION};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        pipeline_name TEXT NOT NULL,
        idempotency_key TEXT,
        status TEXT NOT NULL,
        variables TEXT NOT NULL,
        graph TEXT NOT NULL,
        created_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT,
        rollback_error TEXT,
        heartbeat_at TEXT NOT NULL,
        abort_requested INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)",
    "CREATE INDEX IF NOT EXISTS idx_runs_key ON runs(idempotency_key)",
    r#"
    CREATE TABLE IF NOT EXISTS step_results (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        target TEXT,
        status TEXT NOT NULL,
        artifact TEXT,
        output TEXT NOT NULL,
        exit_code INTEGER,
        error_class TEXT,
        error_message TEXT,
        attempts INTEGER NOT NULL,
        invocation TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_results_run ON step_results(run_id)",
    r#"
    CREATE TABLE IF NOT EXISTS dispatches (
        run_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        target TEXT,
        invocation TEXT NOT NULL,
        dispatched_at TEXT NOT NULL,
        PRIMARY KEY (run_id, step_id, attempt)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS last_good (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        target TEXT NOT NULL,
        artifact TEXT NOT NULL,
        run_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        invocation TEXT NOT NULL,
        recorded_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_last_good_target ON last_good(target)",
];

const RUN_COLUMNS: &str = "id, pipeline_name, idempotency_key, status, variables, graph, \
                           created_at, started_at, finished_at, rollback_error, heartbeat_at";

/// SQLite state store
pub struct SqliteStore {
    pool: SqlitePool,
    retention: usize,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`; `:memory:` gives a private database
    pub async fn new(db_path: &str) -> PipelineResult<Self> {
        let url = if db_path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}", db_path)
        };
        let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

        // A single connection keeps in-memory databases alive and writes ordered
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            retention: DEFAULT_RETENTION,
        };
        store.init().await?;

        debug!("Opened state store at {}", db_path);
        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> PipelineResult<Self> {
        Self::open(&Self::default_path()).await
    }

    /// `<data dir>/deployline/state.db`
    pub fn default_path() -> std::path::PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("deployline")
            .join("state.db")
    }

    /// Open the database at a path, creating parent directories
    pub async fn open(path: &Path) -> PipelineResult<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                PipelineError::persistence(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }
        Self::new(&path.to_string_lossy()).await
    }

    /// Keep at most `retention` good artifacts per target
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    /// Initialize database schema
    async fn init(&self) -> PipelineResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn parse_uuid(value: &str) -> PipelineResult<Uuid> {
        Uuid::parse_str(value)
            .map_err(|e| PipelineError::persistence(format!("bad uuid '{}': {}", value, e)))
    }

    fn corrupt(column: &str, value: &str) -> PipelineError {
        PipelineError::persistence(format!("unrecognized {} '{}'", column, value))
    }

    fn run_from_row(row: &SqliteRow) -> PipelineResult<Run> {
        let status: String = row.try_get("status")?;
        let variables: String = row.try_get("variables")?;
        let graph: String = row.try_get("graph")?;

        Ok(Run {
            id: Self::parse_uuid(&row.try_get::<String, _>("id")?)?,
            pipeline_name: row.try_get("pipeline_name")?,
            idempotency_key: row.try_get("idempotency_key")?,
            status: RunStatus::parse(&status).ok_or_else(|| Self::corrupt("run status", &status))?,
            variables: serde_json::from_str::<HashMap<String, String>>(&variables)?,
            graph: serde_json::from_str::<DependencyGraph>(&graph)?,
            created_at: Self::from_naive(row.try_get("created_at")?),
            started_at: row.try_get::<Option<NaiveDateTime>, _>("started_at")?.map(Self::from_naive),
            finished_at: row.try_get::<Option<NaiveDateTime>, _>("finished_at")?.map(Self::from_naive),
            rollback_error: row.try_get("rollback_error")?,
            heartbeat_at: Self::from_naive(row.try_get("heartbeat_at")?),
        })
    }

    fn result_from_row(row: &SqliteRow) -> PipelineResult<StepResult> {
        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;
        let invocation: String = row.try_get("invocation")?;
        let error_class: Option<String> = row.try_get("error_class")?;

        let error = match error_class {
            Some(class) => Some(StepError {
                class: ErrorClass::parse(&class).ok_or_else(|| Self::corrupt("error class", &class))?,
                message: row.try_get::<Option<String>, _>("error_message")?.unwrap_or_default(),
            }),
            None => None,
        };

        Ok(StepResult {
            run_id: Self::parse_uuid(&row.try_get::<String, _>("run_id")?)?,
            step_id: row.try_get("step_id")?,
            kind: StepKind::parse(&kind).ok_or_else(|| Self::corrupt("step kind", &kind))?,
            target: row.try_get("target")?,
            status: StepStatus::parse(&status).ok_or_else(|| Self::corrupt("step status", &status))?,
            artifact: row.try_get("artifact")?,
            output: row.try_get("output")?,
            exit_code: row.try_get::<Option<i64>, _>("exit_code")?.map(|code| code as i32),
            error,
            attempts: row.try_get::<i64, _>("attempts")? as u32,
            invocation: serde_json::from_str::<Invocation>(&invocation)?,
            started_at: Self::from_naive(row.try_get("started_at")?),
            finished_at: Self::from_naive(row.try_get("finished_at")?),
        })
    }

    fn marker_from_row(row: &SqliteRow) -> PipelineResult<DispatchMarker> {
        let invocation: String = row.try_get("invocation")?;
        Ok(DispatchMarker {
            run_id: Self::parse_uuid(&row.try_get::<String, _>("run_id")?)?,
            step_id: row.try_get("step_id")?,
            attempt: row.try_get::<i64, _>("attempt")? as u32,
            target: row.try_get("target")?,
            invocation: serde_json::from_str(&invocation)?,
            dispatched_at: Self::from_naive(row.try_get("dispatched_at")?),
        })
    }

    fn good_from_row(row: &SqliteRow) -> PipelineResult<GoodArtifact> {
        let invocation: String = row.try_get("invocation")?;
        Ok(GoodArtifact {
            target: row.try_get("target")?,
            artifact: row.try_get("artifact")?,
            run_id: Self::parse_uuid(&row.try_get::<String, _>("run_id")?)?,
            step_id: row.try_get("step_id")?,
            invocation: serde_json::from_str(&invocation)?,
            recorded_at: Self::from_naive(row.try_get("recorded_at")?),
        })
    }

    async fn query_runs(&self, sql: &str, bind: Option<&str>) -> PipelineResult<Vec<Run>> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value.to_string());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::run_from_row).collect()
    }
}

#[async_trait::async_trait]
impl StateStore for SqliteStore {
    async fn create_run(&self, run: &Run) -> PipelineResult<()> {
        sqlx::query(&format!(
            "INSERT INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            RUN_COLUMNS
        ))
        .bind(run.id.to_string())
        .bind(&run.pipeline_name)
        .bind(&run.idempotency_key)
        .bind(run.status.as_str())
        .bind(serde_json::to_string(&run.variables)?)
        .bind(serde_json::to_string(&run.graph)?)
        .bind(Self::to_naive(run.created_at))
        .bind(run.started_at.map(Self::to_naive))
        .bind(run.finished_at.map(Self::to_naive))
        .bind(&run.rollback_error)
        .bind(Self::to_naive(run.heartbeat_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_run_status(&self, run: &Run) -> PipelineResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?2, started_at = ?3, finished_at = ?4, rollback_error = ?5
            WHERE id = ?1
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.status.as_str())
        .bind(run.started_at.map(Self::to_naive))
        .bind(run.finished_at.map(Self::to_naive))
        .bind(&run.rollback_error)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(PipelineError::RunNotFound(run.id));
        }
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> PipelineResult<Option<Run>> {
        let row = sqlx::query(&format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn heartbeat(&self, run_id: Uuid, at: DateTime<Utc>) -> PipelineResult<()> {
        sqlx::query("UPDATE runs SET heartbeat_at = ?2 WHERE id = ?1")
            .bind(run_id.to_string())
            .bind(Self::to_naive(at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_runs(&self, limit: usize) -> PipelineResult<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            RUN_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::run_from_row).collect()
    }

    async fn active_runs(&self) -> PipelineResult<Vec<Run>> {
        self.query_runs(
            &format!(
                "SELECT {} FROM runs WHERE status IN ('pending', 'running') ORDER BY created_at ASC",
                RUN_COLUMNS
            ),
            None,
        )
        .await
    }

    async fn find_active_by_key(&self, key: &str) -> PipelineResult<Option<Run>> {
        let runs = self
            .query_runs(
                &format!(
                    "SELECT {} FROM runs WHERE idempotency_key = ?1 \
                     AND status IN ('pending', 'running') LIMIT 1",
                    RUN_COLUMNS
                ),
                Some(key),
            )
            .await?;
        Ok(runs.into_iter().next())
    }

    async fn mark_dispatched(&self, marker: &DispatchMarker) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO dispatches
            (run_id, step_id, attempt, target, invocation, dispatched_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(marker.run_id.to_string())
        .bind(&marker.step_id)
        .bind(marker.attempt as i64)
        .bind(&marker.target)
        .bind(serde_json::to_string(&marker.invocation)?)
        .bind(Self::to_naive(marker.dispatched_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn unresolved_dispatches(&self) -> PipelineResult<Vec<DispatchMarker>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, step_id, attempt, target, invocation, dispatched_at
            FROM dispatches
            ORDER BY dispatched_at ASC, attempt ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::marker_from_row).collect()
    }

    async fn record(&self, result: &StepResult) -> PipelineResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO step_results
            (run_id, step_id, kind, target, status, artifact, output, exit_code, error_class,
             error_message, attempts, invocation, started_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(result.run_id.to_string())
        .bind(&result.step_id)
        .bind(result.kind.as_str())
        .bind(&result.target)
        .bind(result.status.as_str())
        .bind(&result.artifact)
        .bind(&result.output)
        .bind(result.exit_code.map(i64::from))
        .bind(result.error.as_ref().map(|e| e.class.as_str()))
        .bind(result.error.as_ref().map(|e| e.message.clone()))
        .bind(result.attempts as i64)
        .bind(serde_json::to_string(&result.invocation)?)
        .bind(Self::to_naive(result.started_at))
        .bind(Self::to_naive(result.finished_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM dispatches WHERE run_id = ?1 AND step_id = ?2")
            .bind(result.run_id.to_string())
            .bind(&result.step_id)
            .execute(&mut *tx)
            .await?;

        if let Some(good) = GoodArtifact::from_result(result) {
            sqlx::query(
                r#"
                INSERT INTO last_good (target, artifact, run_id, step_id, invocation, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(&good.target)
            .bind(&good.artifact)
            .bind(good.run_id.to_string())
            .bind(&good.step_id)
            .bind(serde_json::to_string(&good.invocation)?)
            .bind(Self::to_naive(good.recorded_at))
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                DELETE FROM last_good
                WHERE target = ?1 AND seq NOT IN (
                    SELECT seq FROM last_good WHERE target = ?1 ORDER BY seq DESC LIMIT ?2
                )
                "#,
            )
            .bind(&good.target)
            .bind(self.retention as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn results_for_run(&self, run_id: Uuid) -> PipelineResult<Vec<StepResult>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, step_id, kind, target, status, artifact, output, exit_code, error_class,
                   error_message, attempts, invocation, started_at, finished_at
            FROM step_results
            WHERE run_id = ?1
            ORDER BY seq ASC
            "#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::result_from_row).collect()
    }

    async fn latest_deploy(&self, target: &str) -> PipelineResult<Option<StepResult>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, step_id, kind, target, status, artifact, output, exit_code, error_class,
                   error_message, attempts, invocation, started_at, finished_at
            FROM step_results
            WHERE target = ?1 AND kind IN ('deploy', 'rollback')
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(target)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::result_from_row).transpose()
    }

    async fn last_good(&self, target: &str) -> PipelineResult<Option<GoodArtifact>> {
        Ok(self.good_history(target).await?.into_iter().next())
    }

    async fn good_history(&self, target: &str) -> PipelineResult<Vec<GoodArtifact>> {
        let rows = sqlx::query(
            r#"
            SELECT target, artifact, run_id, step_id, invocation, recorded_at
            FROM last_good
            WHERE target = ?1
            ORDER BY seq DESC
            "#,
        )
        .bind(target)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::good_from_row).collect()
    }

    async fn request_abort(&self, run_id: Uuid) -> PipelineResult<()> {
        let updated = sqlx::query("UPDATE runs SET abort_requested = 1 WHERE id = ?1")
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            return Err(PipelineError::RunNotFound(run_id));
        }
        Ok(())
    }

    async fn abort_requested(&self, run_id: Uuid) -> PipelineResult<bool> {
        let row = sqlx::query("SELECT abort_requested FROM runs WHERE id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.try_get::<i64, _>("abort_requested")? != 0),
            None => Ok(false),
        }
    }
}
