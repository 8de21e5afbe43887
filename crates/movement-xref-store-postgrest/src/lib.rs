use std::collections::BTreeSet;
use std::time::Duration;

use movement_xref_core::{
    schema_projection, Column, CrossReferenceQuery, MovementRecord, MovementSource, XrefError,
    CROSS_REFERENCE_COLUMNS, PRIMARY_COLUMNS, VACANCY_SENTINEL,
};
use serde_json::Value;

pub const DEFAULT_TABLE: &str = "movimentacao";
/// View with one row per distinct non-empty `orgao`.
pub const DEFAULT_UNITS_RELATION: &str = "orgaos_distintos";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Connection settings for a PostgREST endpoint (for example a Supabase project).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgrestConfig {
    pub base_url: String,
    pub api_key: String,
    /// User session token; the anonymous key is sent as bearer when absent.
    pub access_token: Option<String>,
    pub table: String,
    /// Relation read by the unit listing, one row per unit.
    pub units_relation: String,
    pub timeout: Duration,
    /// Whether the table has the `ano` column.
    pub year_column: bool,
}

impl PostgrestConfig {
    /// # Errors
    /// Returns [`XrefError::InvalidInput`] when the URL or key is blank.
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, XrefError> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(XrefError::InvalidInput("supabase url MUST be provided".to_string()));
        }
        if api_key.trim().is_empty() {
            return Err(XrefError::InvalidInput("supabase anon key MUST be provided".to_string()));
        }

        Ok(Self {
            base_url: base_url.to_string(),
            api_key: api_key.trim().to_string(),
            access_token: None,
            table: DEFAULT_TABLE.to_string(),
            units_relation: DEFAULT_UNITS_RELATION.to_string(),
            timeout: DEFAULT_TIMEOUT,
            year_column: true,
        })
    }

    #[must_use]
    pub fn with_access_token(mut self, access_token: Option<String>) -> Self {
        self.access_token = access_token.filter(|token| !token.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    #[must_use]
    pub fn with_units_relation(mut self, relation: &str) -> Self {
        self.units_relation = relation.to_string();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_year_column(mut self, year_column: bool) -> Self {
        self.year_column = year_column;
        self
    }

    #[must_use]
    pub fn table_url(&self) -> String {
        self.relation_url(&self.table)
    }

    #[must_use]
    pub fn units_url(&self) -> String {
        self.relation_url(&self.units_relation)
    }

    fn relation_url(&self, relation: &str) -> String {
        format!("{}/rest/v1/{relation}", self.base_url)
    }

    fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }
}

pub struct PostgrestSource {
    config: PostgrestConfig,
    http: ureq::Agent,
}

impl std::fmt::Debug for PostgrestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgrestSource")
            .field("table_url", &self.config.table_url())
            .field("timeout", &self.config.timeout)
            .finish_non_exhaustive()
    }
}

impl PostgrestSource {
    #[must_use]
    pub fn new(config: PostgrestConfig) -> Self {
        let http = ureq::AgentBuilder::new()
            .timeout_read(config.timeout)
            .timeout_write(config.timeout)
            .timeout_connect(config.timeout)
            .build();
        Self { config, http }
    }

    #[must_use]
    pub fn config(&self) -> &PostgrestConfig {
        &self.config
    }

    fn fetch(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<Vec<MovementRecord>, XrefError> {
        let mut request = self
            .http
            .get(url)
            .set("apikey", &self.config.api_key)
            .set("Authorization", &format!("Bearer {}", self.config.bearer()))
            .set("Accept", "application/json");
        for (name, value) in params {
            request = request.query(name, value);
        }

        let response = request.call().map_err(|err| {
            let message = match err {
                ureq::Error::Status(code, response) => {
                    let body = response.into_string().unwrap_or_default();
                    format!("postgrest returned status {code} for {url}: {}", body.trim())
                }
                ureq::Error::Transport(transport) => {
                    format!("postgrest request to {url} failed: {transport}")
                }
            };
            tracing::warn!(error = %message, "postgrest read failed");
            XrefError::DataAccess(message)
        })?;

        let body: Value = response.into_json().map_err(|err| {
            XrefError::DataAccess(format!("postgrest response from {url} is not JSON: {err}"))
        })?;
        decode_rows(&body)
    }
}

impl MovementSource for PostgrestSource {
    fn list_units(&self) -> Result<Vec<String>, XrefError> {
        let rows = self.fetch(&self.config.units_url(), &units_query_params())?;
        let units = rows
            .into_iter()
            .filter_map(|record| record.unit)
            .filter(|unit| !unit.is_empty())
            .collect::<BTreeSet<_>>();
        Ok(units.into_iter().collect())
    }

    fn query_by_unit(&self, unit: &str) -> Result<Vec<MovementRecord>, XrefError> {
        self.fetch(&self.config.table_url(), &unit_query_params(unit, self.config.year_column))
    }

    fn query_by_members_and_periods(
        &self,
        query: &CrossReferenceQuery,
    ) -> Result<Vec<MovementRecord>, XrefError> {
        if query.members.is_empty() || query.periods.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch(
            &self.config.table_url(),
            &cross_reference_query_params(query, self.config.year_column),
        )
    }

    fn has_year_column(&self) -> bool {
        self.config.year_column
    }
}

/// Quote a value for a PostgREST `in.(...)` list.
#[must_use]
pub fn quote_filter_value(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[must_use]
pub fn in_filter(values: &[String]) -> String {
    let quoted = values.iter().map(|value| quote_filter_value(value)).collect::<Vec<_>>();
    format!("in.({})", quoted.join(","))
}

fn select_list(columns: &[Column], year_column: bool) -> String {
    schema_projection(columns, year_column)
        .iter()
        .map(|column| column.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parameters for the distinct-units relation.
#[must_use]
pub fn units_query_params() -> Vec<(String, String)> {
    vec![
        ("select".to_string(), Column::Unit.as_str().to_string()),
        ("order".to_string(), "orgao.asc".to_string()),
    ]
}

#[must_use]
pub fn unit_query_params(unit: &str, year_column: bool) -> Vec<(String, String)> {
    vec![
        ("select".to_string(), select_list(&PRIMARY_COLUMNS, year_column)),
        (Column::Unit.as_str().to_string(), format!("eq.{unit}")),
    ]
}

#[must_use]
pub fn cross_reference_query_params(
    query: &CrossReferenceQuery,
    year_column: bool,
) -> Vec<(String, String)> {
    let mut params = vec![
        ("select".to_string(), select_list(&CROSS_REFERENCE_COLUMNS, year_column)),
        (Column::Member.as_str().to_string(), in_filter(&query.members)),
        (Column::Period.as_str().to_string(), in_filter(&query.periods)),
        (Column::Unit.as_str().to_string(), format!("neq.{}", query.exclude_unit)),
    ];
    if query.exclude_vacant {
        params.push((Column::Member.as_str().to_string(), format!("neq.{VACANCY_SENTINEL}")));
    }
    params
}

/// Decode a PostgREST JSON array. Numbers and booleans in text columns are
/// rendered as text; `ano` accepts integers or integer strings.
///
/// # Errors
/// Returns [`XrefError::DataAccess`] when the body is not an array of objects.
pub fn decode_rows(body: &Value) -> Result<Vec<MovementRecord>, XrefError> {
    let rows = body.as_array().ok_or_else(|| {
        XrefError::DataAccess("postgrest response is not a JSON array".to_string())
    })?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let object = row.as_object().ok_or_else(|| {
            XrefError::DataAccess("postgrest row is not a JSON object".to_string())
        })?;
        let text = |column: Column| object.get(column.as_str()).and_then(json_text);
        records.push(MovementRecord {
            unit: text(Column::Unit),
            unit_code: text(Column::UnitCode),
            period: text(Column::Period),
            year: object.get(Column::Year.as_str()).and_then(json_year),
            member: text(Column::Member),
            assignment_category: text(Column::AssignmentCategory),
            note: text(Column::Note),
        });
    }
    Ok(records)
}

fn json_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn json_year(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|year| year.fract() == 0.0).map(|year| year as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}
