use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use movement_xref_core::{
    cross_reference, fetch_by_unit, ConsultationReport, MovementSource, Table, XrefError,
};
use movement_xref_store_postgrest::{PostgrestConfig, PostgrestSource};
use movement_xref_store_sqlite::{ImportSummary, SchemaStatus, SqliteSource, SqliteStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod cache;
pub mod export;

pub use cache::{CacheSettings, CachedSource};
pub use export::{ExportArtifact, ExportFormat};

pub const API_CONTRACT_VERSION: &str = "api.v1";

pub type SharedSource = Arc<dyn MovementSource + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Sqlite { db_path: PathBuf },
    Postgrest(PostgrestConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsultationRequest {
    pub unit: String,
}

#[derive(Clone)]
pub struct MovementXrefApi {
    source: SharedSource,
    db_path: Option<PathBuf>,
}

impl std::fmt::Debug for MovementXrefApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MovementXrefApi").field("db_path", &self.db_path).finish_non_exhaustive()
    }
}

impl MovementXrefApi {
    #[must_use]
    pub fn new(source: SharedSource) -> Self {
        Self { source, db_path: None }
    }

    /// Build the facade for a configured backend, wrapped in a TTL cache when enabled.
    #[must_use]
    pub fn from_config(backend: BackendConfig, cache: CacheSettings) -> Self {
        let api = match backend {
            BackendConfig::Sqlite { db_path } => Self {
                source: Arc::new(SqliteSource::new(db_path.clone())),
                db_path: Some(db_path),
            },
            BackendConfig::Postgrest(config) => Self::new(Arc::new(PostgrestSource::new(config))),
        };
        api.with_cache(cache)
    }

    #[must_use]
    pub fn with_cache(self, settings: CacheSettings) -> Self {
        if !settings.is_enabled() {
            return self;
        }
        Self { source: Arc::new(CachedSource::new(self.source, settings)), db_path: self.db_path }
    }

    fn local_database(&self) -> Result<&Path> {
        self.db_path.as_deref().ok_or_else(|| {
            XrefError::InvalidInput(
                "database commands require the sqlite backend".to_string(),
            )
            .into()
        })
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(self.local_database()?)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the backend is not SQLite or the database cannot be queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Load a CSV file into the local database.
    ///
    /// # Errors
    /// Returns an error when the backend is not SQLite or the import fails.
    pub fn import_csv(&self, path: &Path) -> Result<ImportSummary> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.import_csv(path)
    }

    /// # Errors
    /// Returns [`XrefError::DataAccess`] when the source cannot be read.
    pub fn list_units(&self) -> Result<Vec<String>> {
        Ok(self.source.list_units()?)
    }

    /// Run one consultation: primary lookup, cross-reference, monthly summaries.
    ///
    /// # Errors
    /// Returns [`XrefError::InvalidInput`] for a blank unit and
    /// [`XrefError::DataAccess`] when the source cannot be read.
    pub fn consult(&self, unit: &str) -> Result<ConsultationReport> {
        if unit.trim().is_empty() {
            return Err(XrefError::InvalidInput("unit MUST be non-empty".to_string()).into());
        }

        let primary = fetch_by_unit(self.source.as_ref(), unit)?;
        let others = cross_reference(self.source.as_ref(), &primary, unit)?;
        let mut report = ConsultationReport::assemble_for_schema(
            unit,
            String::new(),
            &primary,
            &others,
            self.source.has_year_column(),
        );
        report.consultation_id =
            compute_consultation_id(unit, &report.primary, &report.cross_reference);

        tracing::info!(
            unit,
            consultation_id = %report.consultation_id,
            primary_rows = primary.len(),
            cross_reference_rows = others.len(),
            "consultation assembled"
        );
        Ok(report)
    }

    /// Run a consultation and render it as a downloadable file.
    ///
    /// # Errors
    /// Returns the consultation errors, or [`XrefError::Export`] when rendering fails.
    pub fn export(&self, unit: &str, format: ExportFormat) -> Result<ExportArtifact> {
        let report = self.consult(unit)?;
        let bytes = match format {
            ExportFormat::Csv => export::consolidated_csv(&report).into_bytes(),
            ExportFormat::Xlsx => export::workbook_bytes(&report)?,
        };

        Ok(ExportArtifact {
            file_name: format!("{}.{}", export::export_file_stem(unit), format.as_str()),
            content_type: format.content_type(),
            bytes,
        })
    }
}

fn compute_consultation_id(unit: &str, primary: &Table, cross_reference: &Table) -> String {
    let mut hasher = Sha256::new();
    hasher.update(unit.as_bytes());
    hasher.update(b"\n");
    hasher.update(primary.to_csv().as_bytes());
    hasher.update(b"\n");
    hasher.update(cross_reference.to_csv().as_bytes());

    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("cons_{}", &digest_hex[..16])
}

#[cfg(test)]
mod tests {
    use movement_xref_core::{ConsultationStatus, InMemorySource, MovementRecord, PRIMARY_COLUMNS};

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("movement-xref-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn mk(unit: &str, period: &str, member: &str, category: &str) -> MovementRecord {
        MovementRecord {
            unit: Some(unit.to_string()),
            period: Some(period.to_string()),
            member: Some(member.to_string()),
            assignment_category: Some(category.to_string()),
            ..MovementRecord::default()
        }
    }

    fn in_memory_api() -> MovementXrefApi {
        MovementXrefApi::new(Arc::new(InMemorySource::new(vec![
            mk("PJ 1", "JANEIRO", "Ana", "TITULAR"),
            mk("PJ 1", "JANEIRO", "VAGO", "TITULAR"),
            mk("PJ 1", "FEVEREIRO", "Bruno", "AUXÍLIO"),
            mk("PJ 2", "JANEIRO", "Ana", "AUXÍLIO"),
            mk("PJ 2", "JANEIRO", "Bruno", "AUXÍLIO"),
        ])))
    }

    #[test]
    fn consult_assembles_both_tables_and_summaries() -> Result<()> {
        let api = in_memory_api();
        let report = api.consult("PJ 1")?;

        assert_eq!(report.status, ConsultationStatus::Records);
        assert_eq!(report.primary.len(), 3);
        assert_eq!(report.cross_reference.len(), 1);
        assert_eq!(report.assistance.total, 1);
        assert_eq!(report.vacancy.total, 1);
        assert!(report.consultation_id.starts_with("cons_"));
        assert_eq!(report.consultation_id.len(), 21);

        let again = api.consult("PJ 1")?;
        assert_eq!(again.consultation_id, report.consultation_id);
        Ok(())
    }

    struct WithoutYearColumn(InMemorySource);

    impl MovementSource for WithoutYearColumn {
        fn list_units(&self) -> Result<Vec<String>, XrefError> {
            self.0.list_units()
        }

        fn query_by_unit(&self, unit: &str) -> Result<Vec<MovementRecord>, XrefError> {
            self.0.query_by_unit(unit)
        }

        fn query_by_members_and_periods(
            &self,
            query: &movement_xref_core::CrossReferenceQuery,
        ) -> Result<Vec<MovementRecord>, XrefError> {
            self.0.query_by_members_and_periods(query)
        }

        fn has_year_column(&self) -> bool {
            false
        }
    }

    #[test]
    fn report_columns_follow_the_source_schema() -> Result<()> {
        let report = in_memory_api().consult("PJ 1")?;
        assert_eq!(report.primary.columns, vec!["ano", "mes", "membro", "designacao", "observacao"]);
        assert_eq!(report.cross_reference.columns.len(), 7);

        let records = vec![
            mk("PJ 1", "JANEIRO", "Ana", "TITULAR"),
            mk("PJ 2", "JANEIRO", "Ana", "AUXÍLIO"),
        ];
        let legacy = MovementXrefApi::new(Arc::new(WithoutYearColumn(InMemorySource::new(records))))
            .with_cache(CacheSettings::default());
        let report = legacy.consult("PJ 1")?;
        assert_eq!(report.primary.column_index("ano"), None);
        assert_eq!(report.cross_reference.column_index("ano"), None);
        assert_eq!(report.cross_reference.column_index("observacao"), Some(5));
        Ok(())
    }

    #[test]
    fn unknown_unit_reports_no_records() -> Result<()> {
        let report = in_memory_api().consult("PJ 404")?;
        assert_eq!(report.status, ConsultationStatus::NoRecords);
        assert_eq!(report.primary.columns.len(), PRIMARY_COLUMNS.len());
        assert!(report.cross_reference.is_empty());
        Ok(())
    }

    #[test]
    fn blank_unit_is_invalid_input() {
        let err = match in_memory_api().consult("   ") {
            Ok(_) => panic!("blank unit should be rejected"),
            Err(err) => err,
        };
        assert!(matches!(err.downcast_ref::<XrefError>(), Some(XrefError::InvalidInput(_))));
    }

    #[test]
    fn export_names_files_after_the_unit() -> Result<()> {
        let api = in_memory_api();
        let csv = api.export("PJ 1", ExportFormat::Csv)?;
        assert_eq!(csv.file_name, "consolidado_PJ_1.csv");
        assert!(String::from_utf8_lossy(&csv.bytes).contains("Tabela 2 - Outros Órgãos"));

        let xlsx = api.export("PJ 1", ExportFormat::Xlsx)?;
        assert_eq!(xlsx.file_name, "consolidado_PJ_1.xlsx");
        assert!(xlsx.bytes.starts_with(b"PK"));
        Ok(())
    }

    #[test]
    fn database_commands_need_the_sqlite_backend() {
        let err = match in_memory_api().schema_status() {
            Ok(_) => panic!("schema status should need a database"),
            Err(err) => err,
        };
        assert!(matches!(err.downcast_ref::<XrefError>(), Some(XrefError::InvalidInput(_))));
    }

    #[test]
    fn sqlite_backend_migrates_imports_and_consults() -> Result<()> {
        let db_path = unique_temp_db_path();
        let csv_path = db_path.with_extension("csv");
        std::fs::write(
            &csv_path,
            "orgao,mes,membro,designacao\nPJ 1,JANEIRO,Ana,TITULAR\nPJ 2,JANEIRO,Ana,AUXÍLIO\n",
        )?;

        let api = MovementXrefApi::from_config(
            BackendConfig::Sqlite { db_path: db_path.clone() },
            CacheSettings::default(),
        );

        let plan = api.migrate(true)?;
        assert_eq!(plan.would_apply_versions, vec![1, 2]);
        let applied = api.migrate(false)?;
        assert_eq!(applied.up_to_date, Some(true));

        assert_eq!(api.import_csv(&csv_path)?.imported_records, 2);
        assert_eq!(api.list_units()?, vec!["PJ 1", "PJ 2"]);

        let report = api.consult("PJ 1")?;
        assert_eq!(report.cross_reference.len(), 1);

        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(&csv_path);
        Ok(())
    }
}
