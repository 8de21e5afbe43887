use movement_xref_core::{ConsultationReport, Table, XrefError};
use rust_xlsxwriter::{Format, Workbook, Worksheet, XlsxError};
use serde::{Deserialize, Serialize};

pub const PRIMARY_SHEET_NAME: &str = "Órgão Selecionado";
pub const CROSS_REFERENCE_SHEET_NAME: &str = "Outros Órgãos";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

impl ExportFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "csv" => Some(Self::Csv),
            "xlsx" => Some(Self::Xlsx),
            _ => None,
        }
    }

    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Csv => "text/csv; charset=utf-8",
            Self::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ExportArtifact {
    pub file_name: String,
    pub content_type: &'static str,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

/// `consolidado_<unit>` with every character outside `[A-Za-z0-9_-]` replaced by `_`.
#[must_use]
pub fn export_file_stem(unit: &str) -> String {
    let sanitized = unit
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' { ch } else { '_' })
        .collect::<String>();
    format!("consolidado_{sanitized}")
}

#[must_use]
pub fn consolidated_csv(report: &ConsultationReport) -> String {
    report.consolidated_table().to_csv()
}

/// Two-sheet workbook: the selected unit and the other units.
///
/// # Errors
/// Returns [`XrefError::Export`] when the workbook cannot be written.
pub fn workbook_bytes(report: &ConsultationReport) -> Result<Vec<u8>, XrefError> {
    build_workbook(report).map_err(|err| XrefError::Export(format!("xlsx export failed: {err}")))
}

fn build_workbook(report: &ConsultationReport) -> Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();

    {
        let sheet = workbook.add_worksheet();
        sheet.set_name(PRIMARY_SHEET_NAME)?;
        write_table(sheet, &report.primary, &header_format)?;
    }

    {
        let sheet = workbook.add_worksheet();
        sheet.set_name(CROSS_REFERENCE_SHEET_NAME)?;
        write_table(sheet, &report.cross_reference, &header_format)?;
    }

    workbook.save_to_buffer()
}

#[allow(clippy::cast_precision_loss)]
fn write_table(sheet: &mut Worksheet, table: &Table, header: &Format) -> Result<(), XlsxError> {
    let year_index = table.column_index("ano");

    for (col, name) in (0_u16..).zip(&table.columns) {
        sheet.write_string_with_format(0, col, name, header)?;
    }

    for (row, cells) in (1_u32..).zip(&table.rows) {
        for (col, (index, cell)) in (0_u16..).zip(cells.iter().enumerate()) {
            let Some(value) = cell else {
                continue;
            };
            match value.parse::<i64>() {
                Ok(year) if Some(index) == year_index => {
                    sheet.write_number(row, col, year as f64)?;
                }
                _ => {
                    sheet.write_string(row, col, value)?;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use movement_xref_core::{
        MovementRecord, CROSS_REFERENCE_TABLE_LABEL, ORIGIN_COLUMN, PRIMARY_TABLE_LABEL,
    };

    use super::*;

    fn report() -> ConsultationReport {
        let primary = vec![MovementRecord {
            year: Some(2024),
            period: Some("JANEIRO".to_string()),
            member: Some("Ana".to_string()),
            assignment_category: Some("TITULAR".to_string()),
            ..MovementRecord::default()
        }];
        let others = vec![MovementRecord {
            unit: Some("PJ 2".to_string()),
            unit_code: Some("202".to_string()),
            year: Some(2024),
            period: Some("JANEIRO".to_string()),
            member: Some("Ana".to_string()),
            assignment_category: Some("AUXÍLIO".to_string()),
            note: Some("acumula, com vírgula".to_string()),
        }];
        ConsultationReport::assemble("PJ 1", "cons_test".to_string(), &primary, &others)
    }

    #[test]
    fn file_stem_replaces_unsafe_characters() {
        assert_eq!(export_file_stem("PJ 1/Cível"), "consolidado_PJ_1_C_vel");
        assert_eq!(export_file_stem("pj-2_a"), "consolidado_pj-2_a");
    }

    #[test]
    fn consolidated_csv_tags_each_row_with_its_table() -> Result<(), XrefError> {
        let csv = consolidated_csv(&report());
        let table = Table::from_csv(&csv)?;

        assert_eq!(
            table.columns,
            vec![
                "ano",
                "mes",
                "membro",
                "designacao",
                "observacao",
                "orgao",
                "cod_orgao",
                ORIGIN_COLUMN
            ]
        );
        let origin = table.column_index(ORIGIN_COLUMN).unwrap_or_default();
        assert_eq!(table.rows[0][origin].as_deref(), Some(PRIMARY_TABLE_LABEL));
        assert_eq!(table.rows[1][origin].as_deref(), Some(CROSS_REFERENCE_TABLE_LABEL));
        assert_eq!(table.rows[0][4], None);
        assert_eq!(table.rows[1][4].as_deref(), Some("acumula, com vírgula"));
        Ok(())
    }

    #[test]
    fn workbook_is_a_zip_container() -> Result<(), XrefError> {
        let bytes = workbook_bytes(&report())?;
        assert!(bytes.starts_with(b"PK"));

        let empty = ConsultationReport::assemble("PJ 9", "cons_empty".to_string(), &[], &[]);
        assert!(workbook_bytes(&empty)?.starts_with(b"PK"));
        Ok(())
    }

    #[test]
    fn format_names_round_trip() {
        for format in [ExportFormat::Csv, ExportFormat::Xlsx] {
            assert_eq!(ExportFormat::parse(format.as_str()), Some(format));
        }
        assert_eq!(ExportFormat::parse("pdf"), None);
    }
}
