use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use revision_kernel_core::{
    decode_changes, ChangeSet, ItemId, NewRevision, Revision, RevisionEvent, RevisionId,
};
use rusqlite::{params, Connection, DatabaseName};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

const LATEST_SCHEMA_VERSION: i64 = 2;

// Fixed-width UTC text so lexicographic order in SQL matches chronological
// order, fractional seconds included.
const SQL_TS_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  table_name TEXT NOT NULL,
  version INTEGER NOT NULL,
  applied_at TEXT NOT NULL,
  PRIMARY KEY (table_name, version)
);
";

/// Deployment-level store parameters: the revision table name (host types may
/// opt into a dedicated table), the ordering-timestamp column name, and
/// whether the optional update-diff column exists at all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreOptions {
    pub table: String,
    pub timestamp_column: String,
    pub track_changes: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            table: "revisions".to_string(),
            timestamp_column: "recorded_at".to_string(),
            track_changes: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub table: String,
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub table: String,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_revisions: usize,
    pub skipped_existing_revisions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Append-only, per-item-ordered revision store. Revisions are never deleted
/// and never mutated after append, with one exception: correcting the
/// ordering timestamp.
pub struct RevisionStore {
    conn: Connection,
    options: StoreOptions,
    has_changes_column: bool,
}

impl RevisionStore {
    /// Open a store with default options.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or configured.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    /// Open a store with deployment-specific table and timestamp options.
    ///
    /// # Errors
    /// Returns an error when the options carry invalid identifiers or the
    /// database cannot be opened or configured.
    pub fn open_with(path: &Path, options: StoreOptions) -> Result<Self> {
        validate_identifier(&options.table)?;
        validate_identifier(&options.timestamp_column)?;

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        let has_changes_column = table_has_column(&conn, &options.table, "object_changes")?;
        Ok(Self { conn, options, has_changes_column })
    }

    #[must_use]
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Whether the optional `object_changes` column exists in this deployment.
    #[must_use]
    pub fn has_changes_column(&self) -> bool {
        self.has_changes_column
    }

    fn target_version(&self) -> i64 {
        if self.options.track_changes {
            LATEST_SCHEMA_VERSION
        } else {
            1
        }
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = self.detect_effective_schema_version()?;
        let target_version = self.target_version();
        let pending_versions = if current_version < target_version {
            ((current_version + 1)..=target_version).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            table: self.options.table.clone(),
            current_version,
            target_version,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to this deployment's target version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = self.current_schema_version()?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 && self.options.track_changes {
            self.apply_migration_2()?;
            version = self.current_schema_version()?;
        }

        let target = self.target_version();
        if version < 1 || version > LATEST_SCHEMA_VERSION || version < target {
            return Err(anyhow!("unsupported schema version {version}; expected {target}"));
        }

        self.has_changes_column =
            table_has_column(&self.conn, &self.options.table, "object_changes")?;
        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, &self.options.table)? {
            self.apply_migration_1()?;
            return Ok(1);
        }

        if table_has_column(&self.conn, &self.options.table, "object_changes")? {
            // Table already carries the diff column (created by an older
            // scaffold) but has no migration records.
            self.record_schema_version(1)?;
            self.record_schema_version(2)?;
            return Ok(2);
        }

        self.record_schema_version(1)?;
        Ok(1)
    }

    fn apply_migration_1(&self) -> Result<()> {
        let table = &self.options.table;
        let ts = &self.options.timestamp_column;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               item_type TEXT NOT NULL,
               item_id TEXT NOT NULL,
               event TEXT NOT NULL CHECK (event IN ('create','update','destroy')),
               {ts} TEXT NOT NULL,
               object TEXT,
               whodunnit TEXT,
               metadata_json TEXT NOT NULL DEFAULT '{{}}'
             );
             CREATE INDEX IF NOT EXISTS idx_{table}_item ON {table}(item_type, item_id);
             CREATE INDEX IF NOT EXISTS idx_{table}_{ts} ON {table}({ts});
             CREATE INDEX IF NOT EXISTS idx_{table}_event ON {table}(event);"
        );
        self.conn.execute_batch(&sql).context("failed to apply migration v1")?;
        self.record_schema_version(1)?;
        Ok(())
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        if table_has_column(&self.conn, &self.options.table, "object_changes")? {
            self.record_schema_version(2)?;
            return Ok(());
        }

        let sql = format!("ALTER TABLE {} ADD COLUMN object_changes TEXT", self.options.table);
        self.conn.execute(&sql, []).context("failed to apply migration v2")?;
        self.record_schema_version(2)?;
        Ok(())
    }

    /// Append one revision and return it with its store-assigned id.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails; the caller's
    /// lifecycle event must fail with it.
    pub fn append(&mut self, revision: &NewRevision) -> Result<Revision> {
        let metadata_json = serde_json::to_string(&revision.metadata)
            .context("failed to serialize revision metadata")?;
        let recorded_at = ts_to_sql(revision.recorded_at)?;
        let table = self.options.table.clone();
        let ts = self.options.timestamp_column.clone();

        let tx = self.conn.transaction().context("failed to start append transaction")?;
        if self.has_changes_column {
            let sql = format!(
                "INSERT INTO {table}(item_type, item_id, event, {ts}, object, object_changes, whodunnit, metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            );
            tx.execute(
                &sql,
                params![
                    revision.item_type,
                    revision.item_id.as_str(),
                    revision.event.as_str(),
                    recorded_at,
                    revision.object,
                    revision.object_changes,
                    revision.whodunnit,
                    metadata_json,
                ],
            )
            .context("failed to insert revision")?;
        } else {
            let sql = format!(
                "INSERT INTO {table}(item_type, item_id, event, {ts}, object, whodunnit, metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            );
            tx.execute(
                &sql,
                params![
                    revision.item_type,
                    revision.item_id.as_str(),
                    revision.event.as_str(),
                    recorded_at,
                    revision.object,
                    revision.whodunnit,
                    metadata_json,
                ],
            )
            .context("failed to insert revision")?;
        }

        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit append transaction")?;

        Ok(Revision {
            id: RevisionId(id),
            item_type: revision.item_type.clone(),
            item_id: revision.item_id.clone(),
            event: revision.event,
            recorded_at: revision.recorded_at,
            object: revision.object.clone(),
            object_changes: if self.has_changes_column {
                revision.object_changes.clone()
            } else {
                None
            },
            whodunnit: revision.whodunnit.clone(),
            metadata: revision.metadata.clone(),
        })
    }

    fn select_columns(&self) -> String {
        let ts = &self.options.timestamp_column;
        if self.has_changes_column {
            format!("id, item_type, item_id, event, {ts}, object, object_changes, whodunnit, metadata_json")
        } else {
            format!("id, item_type, item_id, event, {ts}, object, NULL, whodunnit, metadata_json")
        }
    }

    fn query_revisions(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Revision>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut revisions = Vec::new();
        while let Some(row) = rows.next()? {
            revisions.push(revision_from_row(row)?);
        }
        Ok(revisions)
    }

    /// All revisions for one item, ordered `(timestamp, id)` ascending.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn for_item(&self, item_type: &str, item_id: &ItemId) -> Result<Vec<Revision>> {
        let sql = format!(
            "SELECT {columns} FROM {table}
             WHERE item_type = ?1 AND item_id = ?2
             ORDER BY {ts} ASC, id ASC",
            columns = self.select_columns(),
            table = self.options.table,
            ts = self.options.timestamp_column,
        );
        self.query_revisions(&sql, &[&item_type, &item_id.as_str()])
    }

    /// All revisions of one event kind across every item, ordered ascending.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn with_event(&self, event: RevisionEvent) -> Result<Vec<Revision>> {
        let sql = format!(
            "SELECT {columns} FROM {table}
             WHERE event = ?1
             ORDER BY {ts} ASC, id ASC",
            columns = self.select_columns(),
            table = self.options.table,
            ts = self.options.timestamp_column,
        );
        self.query_revisions(&sql, &[&event.as_str()])
    }

    /// Fetch one revision by id.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get(&self, id: RevisionId) -> Result<Option<Revision>> {
        let sql = format!(
            "SELECT {columns} FROM {table} WHERE id = ?1",
            columns = self.select_columns(),
            table = self.options.table,
        );
        Ok(self.query_revisions(&sql, &[&id.0])?.into_iter().next())
    }

    /// Sibling revisions strictly after `revision` in `(timestamp, id)`
    /// order, ascending.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn subsequent(&self, revision: &Revision) -> Result<Vec<Revision>> {
        let pivot = ts_to_sql(revision.recorded_at)?;
        let sql = format!(
            "SELECT {columns} FROM {table}
             WHERE item_type = ?1 AND item_id = ?2
               AND ({ts} > ?3 OR ({ts} = ?3 AND id > ?4))
             ORDER BY {ts} ASC, id ASC",
            columns = self.select_columns(),
            table = self.options.table,
            ts = self.options.timestamp_column,
        );
        self.query_revisions(
            &sql,
            &[&revision.item_type, &revision.item_id.as_str(), &pivot, &revision.id.0],
        )
    }

    /// Sibling revisions strictly before `revision`, descending.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn preceding(&self, revision: &Revision) -> Result<Vec<Revision>> {
        let pivot = ts_to_sql(revision.recorded_at)?;
        let sql = format!(
            "SELECT {columns} FROM {table}
             WHERE item_type = ?1 AND item_id = ?2
               AND ({ts} < ?3 OR ({ts} = ?3 AND id < ?4))
             ORDER BY {ts} DESC, id DESC",
            columns = self.select_columns(),
            table = self.options.table,
            ts = self.options.timestamp_column,
        );
        self.query_revisions(
            &sql,
            &[&revision.item_type, &revision.item_id.as_str(), &pivot, &revision.id.0],
        )
    }

    /// The immediate successor of `revision`, if any.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn next(&self, revision: &Revision) -> Result<Option<Revision>> {
        Ok(self.subsequent(revision)?.into_iter().next())
    }

    /// The immediate predecessor of `revision`, if any.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn previous(&self, revision: &Revision) -> Result<Option<Revision>> {
        Ok(self.preceding(revision)?.into_iter().next())
    }

    /// Revisions of one item with a timestamp strictly greater than `at`,
    /// ascending. Because a revision stores the state *before* its change,
    /// the first revision after `at` holds the state as of `at`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn following(
        &self,
        item_type: &str,
        item_id: &ItemId,
        at: OffsetDateTime,
    ) -> Result<Vec<Revision>> {
        let pivot = ts_to_sql(at)?;
        let sql = format!(
            "SELECT {columns} FROM {table}
             WHERE item_type = ?1 AND item_id = ?2 AND {ts} > ?3
             ORDER BY {ts} ASC, id ASC",
            columns = self.select_columns(),
            table = self.options.table,
            ts = self.options.timestamp_column,
        );
        self.query_revisions(&sql, &[&item_type, &item_id.as_str(), &pivot])
    }

    /// Revisions of one item inside the exclusive `(start, end)` range,
    /// ascending.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn between(
        &self,
        item_type: &str,
        item_id: &ItemId,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<Revision>> {
        let start = ts_to_sql(start)?;
        let end = ts_to_sql(end)?;
        let sql = format!(
            "SELECT {columns} FROM {table}
             WHERE item_type = ?1 AND item_id = ?2 AND {ts} > ?3 AND {ts} < ?4
             ORDER BY {ts} ASC, id ASC",
            columns = self.select_columns(),
            table = self.options.table,
            ts = self.options.timestamp_column,
        );
        self.query_revisions(&sql, &[&item_type, &item_id.as_str(), &start, &end])
    }

    /// The latest revision of one item, if any.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn last_for_item(&self, item_type: &str, item_id: &ItemId) -> Result<Option<Revision>> {
        let sql = format!(
            "SELECT {columns} FROM {table}
             WHERE item_type = ?1 AND item_id = ?2
             ORDER BY {ts} DESC, id DESC
             LIMIT 1",
            columns = self.select_columns(),
            table = self.options.table,
            ts = self.options.timestamp_column,
        );
        Ok(self.query_revisions(&sql, &[&item_type, &item_id.as_str()])?.into_iter().next())
    }

    /// Zero-based ordinal of `revision` among its siblings, by ascending id.
    ///
    /// # Errors
    /// Returns an error when the sibling scan fails.
    pub fn index_of(&self, revision: &Revision) -> Result<Option<usize>> {
        let sql = format!(
            "SELECT id FROM {table} WHERE item_type = ?1 AND item_id = ?2 ORDER BY id ASC",
            table = self.options.table,
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![revision.item_type, revision.item_id.as_str()],
            |row| row.get::<_, i64>(0),
        )?;

        for (index, row) in rows.enumerate() {
            if RevisionId(row?) == revision.id {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Correct the ordering timestamp of one revision. This is the only
    /// permitted post-append mutation.
    ///
    /// # Errors
    /// Returns an error when the revision does not exist or the write fails.
    pub fn set_recorded_at(&mut self, id: RevisionId, at: OffsetDateTime) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET {ts} = ?1 WHERE id = ?2",
            table = self.options.table,
            ts = self.options.timestamp_column,
        );
        let updated = self
            .conn
            .execute(&sql, params![ts_to_sql(at)?, id.0])
            .context("failed to correct revision timestamp")?;
        if updated == 0 {
            return Err(anyhow!("revision not found: {id}"));
        }
        Ok(())
    }

    /// Decode the update diff of one revision. Returns `None` when this
    /// deployment has no `object_changes` column, and an empty set when the
    /// column exists but the revision carries no diff.
    ///
    /// # Errors
    /// Returns an error when the stored diff is malformed.
    pub fn changeset(&self, revision: &Revision) -> Result<Option<ChangeSet>> {
        if !self.has_changes_column {
            return Ok(None);
        }
        match &revision.object_changes {
            Some(raw) => Ok(Some(decode_changes(raw)?)),
            None => Ok(Some(ChangeSet::new())),
        }
    }

    fn revision_exists(&self, id: RevisionId) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)",
            table = self.options.table
        );
        let exists = self.conn.query_row(&sql, params![id.0], |row| row.get::<_, i64>(0))?;
        Ok(exists == 1)
    }

    fn insert_with_id(&mut self, revision: &Revision) -> Result<()> {
        let metadata_json = serde_json::to_string(&revision.metadata)
            .context("failed to serialize revision metadata")?;
        let recorded_at = ts_to_sql(revision.recorded_at)?;
        let table = &self.options.table;
        let ts = &self.options.timestamp_column;

        if self.has_changes_column {
            let sql = format!(
                "INSERT INTO {table}(id, item_type, item_id, event, {ts}, object, object_changes, whodunnit, metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            );
            self.conn
                .execute(
                    &sql,
                    params![
                        revision.id.0,
                        revision.item_type,
                        revision.item_id.as_str(),
                        revision.event.as_str(),
                        recorded_at,
                        revision.object,
                        revision.object_changes,
                        revision.whodunnit,
                        metadata_json,
                    ],
                )
                .context("failed to insert imported revision")?;
        } else {
            let sql = format!(
                "INSERT INTO {table}(id, item_type, item_id, event, {ts}, object, whodunnit, metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            );
            self.conn
                .execute(
                    &sql,
                    params![
                        revision.id.0,
                        revision.item_type,
                        revision.item_id.as_str(),
                        revision.event.as_str(),
                        recorded_at,
                        revision.object,
                        revision.whodunnit,
                        metadata_json,
                    ],
                )
                .context("failed to insert imported revision")?;
        }
        Ok(())
    }

    /// Export the trail as deterministic NDJSON plus a digest manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created or written.
    pub fn export_trail(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let sql = format!(
            "SELECT {columns} FROM {table} ORDER BY id ASC",
            columns = self.select_columns(),
            table = self.options.table,
        );
        let revisions = self.query_revisions(&sql, &[])?;

        let revisions_path = out_dir.join("revisions.ndjson");
        let digest = write_ndjson_file(&revisions_path, &revisions)?;

        let manifest = ExportManifest {
            schema_version: self.current_schema_version()?,
            table: self.options.table.clone(),
            exported_at: now_rfc3339()?,
            files: vec![ExportFileDigest {
                path: "revisions.ndjson".to_string(),
                sha256: digest.0,
                records: digest.1,
            }],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported trail directory into this database, preserving
    /// revision ids.
    ///
    /// # Errors
    /// Returns an error when migration, manifest verification, or writes fail.
    pub fn import_trail(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest_path = in_dir.join("manifest.json");
        let manifest = read_export_manifest(&manifest_path)?;
        validate_import_manifest(in_dir, &manifest)?;

        let revisions_path = in_dir.join("revisions.ndjson");
        let mut summary = ImportSummary { imported_revisions: 0, skipped_existing_revisions: 0 };

        for revision in read_ndjson_file::<Revision>(&revisions_path)? {
            if self.revision_exists(revision.id)? {
                if skip_existing {
                    summary.skipped_existing_revisions += 1;
                    continue;
                }

                return Err(anyhow!("revision already exists: {}", revision.id));
            }
            self.insert_with_id(&revision)?;
            summary.imported_revisions += 1;
        }

        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or the
    /// backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing or restore fails.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn current_schema_version(&self) -> Result<i64> {
        let version = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations WHERE table_name = ?1",
                params![self.options.table],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to read current schema version")?;
        Ok(version)
    }

    fn detect_effective_schema_version(&self) -> Result<(i64, bool)> {
        let recorded = self.current_schema_version()?;
        if recorded > 0 {
            return Ok((recorded, false));
        }

        if !table_exists(&self.conn, &self.options.table)? {
            return Ok((0, false));
        }

        if table_has_column(&self.conn, &self.options.table, "object_changes")? {
            return Ok((2, true));
        }

        Ok((1, true))
    }

    fn record_schema_version(&self, version: i64) -> Result<()> {
        let now = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(table_name, version, applied_at)
                 VALUES (?1, ?2, ?3)",
                params![self.options.table, version, now],
            )
            .with_context(|| format!("failed to record migration version {version}"))?;
        Ok(())
    }
}

fn revision_from_row(row: &rusqlite::Row<'_>) -> Result<Revision> {
    let event_raw: String = row.get(3)?;
    let recorded_at_raw: String = row.get(4)?;
    let metadata_json: String = row.get(8)?;

    Ok(Revision {
        id: RevisionId(row.get(0)?),
        item_type: row.get(1)?,
        item_id: ItemId(row.get(2)?),
        event: RevisionEvent::parse(&event_raw)
            .ok_or_else(|| anyhow!("unknown revision event: {event_raw}"))?,
        recorded_at: ts_from_sql(&recorded_at_raw)?,
        object: row.get(5)?,
        object_changes: row.get(6)?,
        whodunnit: row.get(7)?,
        metadata: serde_json::from_str(&metadata_json)
            .context("failed to deserialize revision metadata")?,
    })
}

fn validate_identifier(value: &str) -> Result<()> {
    let mut chars = value.chars();
    let starts_well = chars.next().is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_');
    if starts_well && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return Ok(());
    }
    Err(anyhow!("invalid sql identifier in store options: {value}"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn ts_to_sql(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(SQL_TS_FORMAT)
        .context("failed to format ordering timestamp")
}

fn ts_from_sql(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .with_context(|| format!("invalid stored timestamp: {raw}"))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).context("failed to format RFC3339 timestamp")
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    let Some(expected) = by_path.get("revisions.ndjson") else {
        return Err(anyhow!("manifest is missing required file entry: revisions.ndjson"));
    };
    let file_path = in_dir.join("revisions.ndjson");
    if !file_path.exists() {
        return Err(anyhow!("manifest references missing file {}", file_path.display()));
    }

    let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
    if actual_sha256 != expected.sha256 {
        return Err(anyhow!(
            "manifest digest mismatch for revisions.ndjson: expected {}, got {}",
            expected.sha256,
            actual_sha256
        ));
    }
    if actual_records != expected.records {
        return Err(anyhow!(
            "manifest record count mismatch for revisions.ndjson: expected {}, got {}",
            expected.records,
            actual_records
        ));
    }

    Ok(())
}
