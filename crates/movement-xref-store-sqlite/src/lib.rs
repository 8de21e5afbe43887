use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use movement_xref_core::{
    CrossReferenceQuery, MovementRecord, MovementSource, Table, XrefError, VACANCY_SENTINEL,
};
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS movimentacao (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  orgao TEXT NOT NULL,
  cod_orgao TEXT,
  mes TEXT,
  membro TEXT,
  designacao TEXT,
  observacao TEXT
);

CREATE INDEX IF NOT EXISTS idx_movimentacao_orgao ON movimentacao(orgao);
CREATE INDEX IF NOT EXISTS idx_movimentacao_membro ON movimentacao(membro);
CREATE INDEX IF NOT EXISTS idx_movimentacao_mes ON movimentacao(mes);
";

const MIGRATION_002_ADD_YEAR_SQL: &str = r"
ALTER TABLE movimentacao ADD COLUMN ano INTEGER;
";

const MIGRATION_002_VIEW_SQL: &str = r"
CREATE VIEW IF NOT EXISTS orgaos_distintos AS
  SELECT DISTINCT orgao FROM movimentacao
  WHERE orgao IS NOT NULL AND orgao <> '';
";

const PRIMARY_SELECT_SQL: &str =
    "SELECT ano, mes, membro, designacao, observacao FROM movimentacao WHERE orgao = ?1 ORDER BY rowid ASC";

const CROSS_REFERENCE_SELECT_SQL: &str =
    "SELECT mes, ano, orgao, cod_orgao, membro, designacao, observacao FROM movimentacao";

/// Local copy of the movement table.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub source_path: String,
    pub imported_records: usize,
    pub imported_at: String,
}

impl SqliteStore {
    /// Open a SQLite-backed movement store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn)
    }

    /// Open a database that must already exist; a missing file is an error
    /// instead of a new empty database.
    ///
    /// # Errors
    /// Returns an error when the file does not exist, cannot be opened, or
    /// pragmas cannot be applied.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("sqlite database not found at {}", path.display()))?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "movimentacao")? {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        if !table_has_column(&self.conn, "movimentacao", "orgao")? {
            return Err(anyhow!("database schema is invalid: movimentacao has no orgao column"));
        }

        if table_has_column(&self.conn, "movimentacao", "ano")? {
            // Table already carries the later schema variant but was never
            // migrated by this store.
            self.conn
                .execute_batch(MIGRATION_002_VIEW_SQL)
                .context("failed to create orgaos_distintos view")?;
            record_schema_version(&self.conn, 1)?;
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        record_schema_version(&self.conn, 1)?;
        Ok(1)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;

        if !table_has_column(&tx, "movimentacao", "ano")? {
            tx.execute_batch(MIGRATION_002_ADD_YEAR_SQL)
                .context("failed to add movimentacao.ano column")?;
        }
        tx.execute_batch(MIGRATION_002_VIEW_SQL)
            .context("failed to create orgaos_distintos view")?;
        record_schema_version(&tx, 2)?;

        tx.commit().context("failed to commit migration v2 transaction")?;
        Ok(())
    }

    /// Insert records in one transaction. Every record needs a unit.
    ///
    /// # Errors
    /// Returns an error when a record has no unit or an insert fails; nothing is
    /// written in that case.
    pub fn insert_records(&mut self, records: &[MovementRecord]) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start insert transaction")?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO movimentacao(orgao, cod_orgao, mes, ano, membro, designacao, observacao)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .context("failed to prepare movimentacao insert")?;

            for (index, record) in records.iter().enumerate() {
                let unit = record
                    .unit
                    .as_deref()
                    .filter(|unit| !unit.trim().is_empty())
                    .ok_or_else(|| anyhow!("record {} has no orgao", index + 1))?;
                stmt.execute(params![
                    unit,
                    record.unit_code,
                    record.period,
                    record.year,
                    record.member,
                    record.assignment_category,
                    record.note,
                ])
                .with_context(|| format!("failed to insert record {}", index + 1))?;
            }
        }

        tx.commit().context("failed to commit insert transaction")?;
        tracing::info!(rows = records.len(), "inserted movement records");
        Ok(records.len())
    }

    /// Load a header-named CSV file (column names as in the movement table).
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, is not valid CSV, lacks
    /// an `orgao` column, or any row fails to insert.
    pub fn import_csv(&mut self, path: &Path) -> Result<ImportSummary> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read csv file {}", path.display()))?;
        let table = Table::from_csv(&raw)
            .with_context(|| format!("failed to parse csv file {}", path.display()))?;
        if table.column_index("orgao").is_none() {
            return Err(anyhow!("csv file {} has no orgao column", path.display()));
        }

        let records = table.to_records().context("failed to decode csv rows")?;
        let imported_records = self.insert_records(&records)?;

        Ok(ImportSummary {
            source_path: path.display().to_string(),
            imported_records,
            imported_at: now_rfc3339()?,
        })
    }

    /// Distinct, sorted, non-empty units from the `orgaos_distintos` view.
    ///
    /// # Errors
    /// Returns an error when the view cannot be queried.
    pub fn units(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT orgao FROM orgaos_distintos ORDER BY orgao ASC")
            .context("failed to prepare unit listing")?;
        let rows = stmt.query_map([], |row| text_at(row, 0))?;

        let mut units = Vec::new();
        for row in rows {
            if let Some(unit) = row? {
                units.push(unit);
            }
        }
        Ok(units)
    }

    /// Rows of one unit, projected to the primary columns.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn records_for_unit(&self, unit: &str) -> Result<Vec<MovementRecord>> {
        let mut stmt =
            self.conn.prepare(PRIMARY_SELECT_SQL).context("failed to prepare primary lookup")?;
        let rows = stmt.query_map(params![unit], |row| {
            Ok(MovementRecord {
                year: year_at(row, 0)?,
                period: text_at(row, 1)?,
                member: text_at(row, 2)?,
                assignment_category: text_at(row, 3)?,
                note: text_at(row, 4)?,
                ..MovementRecord::default()
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Coarse member/period lookup for the cross-reference engine.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn records_for_query(&self, query: &CrossReferenceQuery) -> Result<Vec<MovementRecord>> {
        if query.members.is_empty() || query.periods.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "{CROSS_REFERENCE_SELECT_SQL} WHERE membro IN ({}) AND mes IN ({}) AND orgao <> ?",
            placeholders(query.members.len()),
            placeholders(query.periods.len()),
        );
        if query.exclude_vacant {
            sql.push_str(" AND membro <> ?");
        }
        sql.push_str(" ORDER BY rowid ASC");

        let mut values: Vec<&str> = Vec::new();
        values.extend(query.members.iter().map(String::as_str));
        values.extend(query.periods.iter().map(String::as_str));
        values.push(query.exclude_unit.as_str());
        if query.exclude_vacant {
            values.push(VACANCY_SENTINEL);
        }

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare cross-reference lookup")?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok(MovementRecord {
                period: text_at(row, 0)?,
                year: year_at(row, 1)?,
                unit: text_at(row, 2)?,
                unit_code: text_at(row, 3)?,
                member: text_at(row, 4)?,
                assignment_category: text_at(row, 5)?,
                note: text_at(row, 6)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

impl MovementSource for SqliteStore {
    fn list_units(&self) -> Result<Vec<String>, XrefError> {
        self.units().map_err(data_access)
    }

    fn query_by_unit(&self, unit: &str) -> Result<Vec<MovementRecord>, XrefError> {
        self.records_for_unit(unit).map_err(data_access)
    }

    fn query_by_members_and_periods(
        &self,
        query: &CrossReferenceQuery,
    ) -> Result<Vec<MovementRecord>, XrefError> {
        self.records_for_query(query).map_err(data_access)
    }
}

/// A [`MovementSource`] that opens and migrates the database on every call,
/// so it can be shared across threads without holding a connection. The
/// database must exist; `db migrate` or `db import-csv` creates it.
#[derive(Debug, Clone)]
pub struct SqliteSource {
    db_path: PathBuf,
}

impl SqliteSource {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open_existing(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }
}

impl MovementSource for SqliteSource {
    fn list_units(&self) -> Result<Vec<String>, XrefError> {
        self.open_store().and_then(|store| store.units()).map_err(data_access)
    }

    fn query_by_unit(&self, unit: &str) -> Result<Vec<MovementRecord>, XrefError> {
        self.open_store().and_then(|store| store.records_for_unit(unit)).map_err(data_access)
    }

    fn query_by_members_and_periods(
        &self,
        query: &CrossReferenceQuery,
    ) -> Result<Vec<MovementRecord>, XrefError> {
        self.open_store().and_then(|store| store.records_for_query(query)).map_err(data_access)
    }
}

fn data_access(err: anyhow::Error) -> XrefError {
    tracing::warn!(error = %format!("{err:#}"), "sqlite read failed");
    XrefError::DataAccess(format!("{err:#}"))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Read a cell as text whatever storage class the row used.
fn text_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(index)? {
        ValueRef::Null => None,
        ValueRef::Integer(value) => Some(value.to_string()),
        ValueRef::Real(value) => Some(value.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    })
}

#[allow(clippy::cast_possible_truncation)]
fn year_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<i64>> {
    Ok(match row.get_ref(index)? {
        ValueRef::Integer(value) => Some(value),
        ValueRef::Real(value) if value.fract() == 0.0 => Some(value as i64),
        ValueRef::Text(bytes) => {
            std::str::from_utf8(bytes).ok().and_then(|text| text.trim().parse::<i64>().ok())
        }
        _ => None,
    })
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

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "movimentacao")? {
        return Ok((0, false));
    }

    if !table_has_column(conn, "movimentacao", "orgao")? {
        return Err(anyhow!("database schema is invalid: movimentacao has no orgao column"));
    }

    if table_has_column(conn, "movimentacao", "ano")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
