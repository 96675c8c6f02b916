//! Storage layer for Apparatus
//!
//! One SQLite database holds experiments, runs, parameters, metrics and
//! artifact metadata. Artifact bytes live in the [`crate::blob`] store.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::hierarchy::RunLookup;
use crate::tree::conflicting_path;
use crate::{
    ArtifactRecord, Error, Experiment, MetricPoint, MetricSeries, ParamValue, Parameter, Result,
    Run, RunId, DEFAULT_EXPERIMENT_UUID, MAX_NESTING_LEVEL,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS experiments (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid        TEXT NOT NULL UNIQUE,
    name        TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid            TEXT NOT NULL UNIQUE,
    name            TEXT NOT NULL,
    notes           TEXT NOT NULL DEFAULT '',
    experiment_id   INTEGER NOT NULL REFERENCES experiments(id),
    parent_run_id   INTEGER REFERENCES runs(id),
    nesting_level   INTEGER NOT NULL DEFAULT 0 CHECK (nesting_level BETWEEN 0 AND 2),
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_experiment ON runs(experiment_id, nesting_level);
CREATE INDEX IF NOT EXISTS idx_runs_parent ON runs(parent_run_id);

CREATE TABLE IF NOT EXISTS parameters (
    run_id        INTEGER NOT NULL REFERENCES runs(id),
    key           TEXT NOT NULL,
    value_type    TEXT NOT NULL,
    value_string  TEXT,
    value_bool    INTEGER,
    value_float   REAL,
    value_int     INTEGER,
    PRIMARY KEY (run_id, key)
);

CREATE TABLE IF NOT EXISTS metrics (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id     INTEGER NOT NULL REFERENCES runs(id),
    key        TEXT NOT NULL,
    x_value    REAL NOT NULL,
    y_value    REAL NOT NULL,
    logged_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_run_key ON metrics(run_id, key);

CREATE TABLE IF NOT EXISTS artifacts (
    run_id  INTEGER NOT NULL REFERENCES runs(id),
    path    TEXT NOT NULL,
    uri     TEXT NOT NULL,
    type    TEXT NOT NULL,
    PRIMARY KEY (run_id, path)
);
";

const RUN_COLUMNS: &str =
    "id, uuid, name, notes, experiment_id, parent_run_id, nesting_level, created_at";

const EXPERIMENT_SELECT: &str = "
    SELECT e.id, e.uuid, e.name, e.created_at,
           (SELECT MAX(created_at) FROM runs WHERE experiment_id = e.id),
           (SELECT COUNT(*) FROM runs WHERE experiment_id = e.id)
    FROM experiments e";

/// SQLite-backed tracking database
pub struct Database {
    db: Connection,
}

impl Database {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let db = Connection::open(path)?;
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        let database = Self::init(db)?;
        info!("Opened database at {:?}", path);
        Ok(database)
    }

    /// Private in-memory database, used by tests and one-off tooling
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self> {
        db.execute_batch("PRAGMA foreign_keys=ON;")?;
        db.execute_batch(SCHEMA)?;
        db.execute(
            "INSERT OR IGNORE INTO experiments (uuid, name, created_at) VALUES (?1, 'Default', ?2)",
            params![DEFAULT_EXPERIMENT_UUID, now_ts()],
        )?;
        Ok(Self { db })
    }

    // -----------------------------------------------------------------------
    // Experiments
    // -----------------------------------------------------------------------

    pub fn insert_experiment(&self, name: &str) -> Result<Experiment> {
        let uuid = uuid::Uuid::new_v4().to_string();
        self.db.execute(
            "INSERT INTO experiments (uuid, name, created_at) VALUES (?1, ?2, ?3)",
            params![uuid, name, now_ts()],
        )?;
        debug!("Created experiment {} ({})", name, uuid);
        self.experiment_by_uuid(&uuid)?
            .ok_or_else(|| Error::NotFound(format!("experiment {}", uuid)))
    }

    pub fn experiment_by_uuid(&self, uuid: &str) -> Result<Option<Experiment>> {
        self.db
            .query_row(
                &format!("{} WHERE e.uuid = ?1", EXPERIMENT_SELECT),
                params![uuid],
                row_to_experiment,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn experiment_id_by_uuid(&self, uuid: &str) -> Result<Option<i64>> {
        self.db
            .query_row("SELECT id FROM experiments WHERE uuid = ?1", params![uuid], |row| row.get(0))
            .optional()
            .map_err(Into::into)
    }

    pub fn default_experiment_id(&self) -> Result<i64> {
        self.experiment_id_by_uuid(DEFAULT_EXPERIMENT_UUID)?
            .ok_or_else(|| Error::NotFound("default experiment".into()))
    }

    /// All experiments, most recently active first
    pub fn all_experiments(&self) -> Result<Vec<Experiment>> {
        let sql = format!(
            "{} ORDER BY COALESCE((SELECT MAX(created_at) FROM runs WHERE experiment_id = e.id), e.created_at) DESC, e.id DESC",
            EXPERIMENT_SELECT
        );
        let mut stmt = self.db.prepare(&sql)?;
        let experiments = stmt
            .query_map([], row_to_experiment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(experiments)
    }

    pub fn experiment_for_run(&self, run_uuid: &str) -> Result<Option<Experiment>> {
        self.db
            .query_row(
                &format!(
                    "{} JOIN runs r ON r.experiment_id = e.id WHERE r.uuid = ?1",
                    EXPERIMENT_SELECT
                ),
                params![run_uuid],
                row_to_experiment,
            )
            .optional()
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a run, optionally nested under `parent`.
    ///
    /// The nesting level is derived from the parent inside one transaction; a
    /// run that would sit deeper than [`MAX_NESTING_LEVEL`] is rejected and
    /// nothing is written.
    pub fn insert_run(
        &mut self,
        name: &str,
        experiment_id: i64,
        parent: Option<RunId>,
    ) -> Result<Run> {
        let tx = self.db.transaction()?;

        let nesting_level = match parent {
            None => 0,
            Some(parent_id) => {
                let parent_level: i64 = tx
                    .query_row(
                        "SELECT nesting_level FROM runs WHERE id = ?1",
                        params![parent_id.0],
                        |row| row.get(0),
                    )
                    .optional()?
                    .ok_or_else(|| Error::NotFound(format!("parent run {}", parent_id.0)))?;
                if parent_level >= MAX_NESTING_LEVEL {
                    warn!("Rejected run {:?}: parent {} is at level {}", name, parent_id.0, parent_level);
                    return Err(Error::NestingLimitExceeded {
                        parent_level,
                        max: MAX_NESTING_LEVEL,
                    });
                }
                parent_level + 1
            }
        };

        let uuid = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        tx.execute(
            "INSERT INTO runs (uuid, name, experiment_id, parent_run_id, nesting_level, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                uuid,
                name,
                experiment_id,
                parent.map(|p| p.0),
                nesting_level,
                format_ts(created_at),
            ],
        )?;
        let id = RunId(tx.last_insert_rowid());
        tx.commit()?;

        debug!("Created run {} ({}) at level {}", name, uuid, nesting_level);

        Ok(Run {
            id,
            uuid,
            name: name.to_string(),
            notes: String::new(),
            experiment_id,
            parent_run_id: parent,
            nesting_level,
            created_at,
        })
    }

    pub fn run_by_uuid(&self, uuid: &str) -> Result<Option<Run>> {
        self.db
            .query_row(
                &format!("SELECT {} FROM runs WHERE uuid = ?1", RUN_COLUMNS),
                params![uuid],
                row_to_run,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn run_by_id(&self, id: RunId) -> Result<Option<Run>> {
        self.db
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![id.0],
                row_to_run,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn run_id_by_uuid(&self, uuid: &str) -> Result<Option<RunId>> {
        self.db
            .query_row("SELECT id FROM runs WHERE uuid = ?1", params![uuid], |row| {
                row.get(0).map(RunId)
            })
            .optional()
            .map_err(Into::into)
    }

    /// Like [`Database::run_by_uuid`] but an unknown run is an error
    pub fn require_run(&self, uuid: &str) -> Result<Run> {
        self.run_by_uuid(uuid)?
            .ok_or_else(|| Error::NotFound(format!("run {}", uuid)))
    }

    /// Runs of an experiment at one nesting level, most recent first
    pub fn runs_by_experiment_and_level(&self, experiment_id: i64, level: i64) -> Result<Vec<Run>> {
        let mut stmt = self.db.prepare(&format!(
            "SELECT {} FROM runs WHERE experiment_id = ?1 AND nesting_level = ?2
             ORDER BY created_at DESC, id DESC",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map(params![experiment_id, level], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    pub fn update_run_notes(&self, id: RunId, notes: &str) -> Result<()> {
        let changed = self
            .db
            .execute("UPDATE runs SET notes = ?1 WHERE id = ?2", params![notes, id.0])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("run {}", id.0)));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Parameters
    // -----------------------------------------------------------------------

    /// Insert or replace a parameter by `(run, key)`
    pub fn upsert_parameter(&self, run_id: RunId, key: &str, value: &ParamValue) -> Result<()> {
        let (s, b, f, i) = match value {
            ParamValue::String(v) => (Some(v.as_str()), None, None, None),
            ParamValue::Bool(v) => (None, Some(*v), None, None),
            ParamValue::Float(v) => (None, None, Some(*v), None),
            ParamValue::Int(v) => (None, None, None, Some(*v)),
        };
        self.db.execute(
            "INSERT OR REPLACE INTO parameters
             (run_id, key, value_type, value_string, value_bool, value_float, value_int)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![run_id.0, key, value.type_name(), s, b, f, i],
        )?;
        Ok(())
    }

    /// Parameters of a run, ordered by key
    pub fn parameters(&self, run_id: RunId) -> Result<Vec<Parameter>> {
        let mut stmt = self.db.prepare(
            "SELECT key, value_type, value_string, value_bool, value_float, value_int
             FROM parameters WHERE run_id = ?1 ORDER BY key",
        )?;
        let params = stmt
            .query_map(params![run_id.0], |row| {
                let key: String = row.get(0)?;
                let kind: String = row.get(1)?;
                let value = match kind.as_str() {
                    "bool" => ParamValue::Bool(row.get::<_, Option<bool>>(3)?.unwrap_or(false)),
                    "float" => ParamValue::Float(row.get::<_, Option<f64>>(4)?.unwrap_or(0.0)),
                    "int" => ParamValue::Int(row.get::<_, Option<i64>>(5)?.unwrap_or(0)),
                    _ => ParamValue::String(row.get::<_, Option<String>>(2)?.unwrap_or_default()),
                };
                Ok(Parameter { key, value })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(params)
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    /// Append `(x, y)` samples to a metric series in one transaction
    pub fn insert_metrics(
        &mut self,
        run_id: RunId,
        key: &str,
        values: &[(f64, f64)],
        logged_at: DateTime<Utc>,
    ) -> Result<usize> {
        let tx = self.db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO metrics (run_id, key, x_value, y_value, logged_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let logged_at = format_ts(logged_at);
            for (x, y) in values {
                stmt.execute(params![run_id.0, key, x, y, logged_at])?;
            }
        }
        tx.commit()?;
        debug!("Logged {} values for metric {} of run {}", values.len(), key, run_id.0);
        Ok(values.len())
    }

    /// Metric series of a run, grouped by key and ordered by x
    pub fn metrics(&self, run_id: RunId) -> Result<Vec<MetricSeries>> {
        let mut stmt = self.db.prepare(
            "SELECT key, x_value, y_value, logged_at FROM metrics
             WHERE run_id = ?1 ORDER BY key, x_value, id",
        )?;
        let rows = stmt.query_map(params![run_id.0], |row| {
            let key: String = row.get(0)?;
            let point = MetricPoint {
                x: row.get(1)?,
                y: row.get(2)?,
                logged_at: parse_ts(row.get(3)?, 3)?,
            };
            Ok((key, point))
        })?;

        let mut series: Vec<MetricSeries> = Vec::new();
        for row in rows {
            let (key, point) = row?;
            match series.last_mut() {
                Some(last) if last.key == key => last.points.push(point),
                _ => series.push(MetricSeries {
                    key,
                    points: vec![point],
                }),
            }
        }
        Ok(series)
    }

    // -----------------------------------------------------------------------
    // Artifacts
    // -----------------------------------------------------------------------

    /// Fail if `path` would make an existing artifact of the run a directory,
    /// or sit below an existing artifact
    pub fn check_artifact_path(&self, run_id: RunId, path: &str) -> Result<()> {
        check_artifact_conflict(&self.db, run_id, path)
    }

    /// Insert or replace artifact metadata by `(run, path)`
    pub fn upsert_artifact(&mut self, run_id: RunId, record: &ArtifactRecord) -> Result<()> {
        let tx = self.db.transaction()?;
        check_artifact_conflict(&tx, run_id, &record.path)?;
        tx.execute(
            "INSERT OR REPLACE INTO artifacts (run_id, path, uri, type) VALUES (?1, ?2, ?3, ?4)",
            params![run_id.0, record.path, record.uri, record.kind],
        )?;
        tx.commit()?;
        debug!("Recorded artifact {} for run {}", record.path, run_id.0);
        Ok(())
    }

    /// Artifacts of a run, ordered by path
    pub fn artifacts(&self, run_id: RunId) -> Result<Vec<ArtifactRecord>> {
        let mut stmt = self
            .db
            .prepare("SELECT path, uri, type FROM artifacts WHERE run_id = ?1 ORDER BY path")?;
        let artifacts = stmt
            .query_map(params![run_id.0], row_to_artifact)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(artifacts)
    }

    pub fn artifact_by_path(&self, run_id: RunId, path: &str) -> Result<Option<ArtifactRecord>> {
        self.db
            .query_row(
                "SELECT path, uri, type FROM artifacts WHERE run_id = ?1 AND path = ?2",
                params![run_id.0, path],
                row_to_artifact,
            )
            .optional()
            .map_err(Into::into)
    }
}

impl RunLookup for Database {
    fn child_runs(&self, parent: RunId) -> Result<Vec<Run>> {
        let mut stmt = self.db.prepare(&format!(
            "SELECT {} FROM runs WHERE parent_run_id = ?1 ORDER BY created_at DESC, id DESC",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map(params![parent.0], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn child_run_count(&self, parent: RunId) -> Result<u64> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM runs WHERE parent_run_id = ?1",
            params![parent.0],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn children_with_counts(&self, parent: RunId) -> Result<Vec<(Run, u64)>> {
        let mut stmt = self.db.prepare(
            "SELECT r.id, r.uuid, r.name, r.notes, r.experiment_id, r.parent_run_id,
                    r.nesting_level, r.created_at,
                    (SELECT COUNT(*) FROM runs c WHERE c.parent_run_id = r.id)
             FROM runs r WHERE r.parent_run_id = ?1
             ORDER BY r.created_at DESC, r.id DESC",
        )?;
        let rows = stmt
            .query_map(params![parent.0], |row| {
                let run = row_to_run(row)?;
                let count: i64 = row.get(8)?;
                Ok((run, count as u64))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn check_artifact_conflict(db: &Connection, run_id: RunId, path: &str) -> Result<()> {
    let mut stmt = db.prepare("SELECT path FROM artifacts WHERE run_id = ?1")?;
    let existing = stmt
        .query_map(params![run_id.0], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if let Some(conflict) = conflicting_path(existing.iter().map(String::as_str), path) {
        warn!("Rejected artifact {} for run {}: conflicts with {}", path, run_id.0, conflict);
        return Err(Error::ArtifactPathConflict {
            path: path.to_string(),
            existing: conflict.to_string(),
        });
    }
    Ok(())
}

fn now_ts() -> String {
    format_ts(Utc::now())
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<Run> {
    Ok(Run {
        id: RunId(row.get(0)?),
        uuid: row.get(1)?,
        name: row.get(2)?,
        notes: row.get(3)?,
        experiment_id: row.get(4)?,
        parent_run_id: row.get::<_, Option<i64>>(5)?.map(RunId),
        nesting_level: row.get(6)?,
        created_at: parse_ts(row.get(7)?, 7)?,
    })
}

fn row_to_experiment(row: &rusqlite::Row) -> rusqlite::Result<Experiment> {
    let most_recent: Option<String> = row.get(4)?;
    Ok(Experiment {
        id: row.get(0)?,
        uuid: row.get(1)?,
        name: row.get(2)?,
        created_at: parse_ts(row.get(3)?, 3)?,
        most_recent_run_at: most_recent.map(|s| parse_ts(s, 4)).transpose()?,
        run_count: row.get::<_, i64>(5)? as u64,
    })
}

fn row_to_artifact(row: &rusqlite::Row) -> rusqlite::Result<ArtifactRecord> {
    Ok(ArtifactRecord {
        path: row.get(0)?,
        uri: row.get(1)?,
        kind: row.get(2)?,
    })
}
