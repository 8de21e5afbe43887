use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::ser::{SerializeMap, SerializeSeq, SerializeStruct};
use serde::{Deserialize, Serialize, Serializer};
use time::parsing::Parsed;

/// Member value that marks a position with nobody assigned.
pub const VACANCY_SENTINEL: &str = "VAGO";

/// Rank given to period and category labels outside the fixed tables.
pub const UNRANKED: u16 = 999;

pub const ORIGIN_COLUMN: &str = "_tabela";
pub const PRIMARY_TABLE_LABEL: &str = "Tabela 1 - Órgão Selecionado";
pub const CROSS_REFERENCE_TABLE_LABEL: &str = "Tabela 2 - Outros Órgãos";

pub const MONTH_RANKS: [(&str, u16); 12] = [
    ("JANEIRO", 1),
    ("FEVEREIRO", 2),
    ("MARÇO", 3),
    ("ABRIL", 4),
    ("MAIO", 5),
    ("JUNHO", 6),
    ("JULHO", 7),
    ("AGOSTO", 8),
    ("SETEMBRO", 9),
    ("OUTUBRO", 10),
    ("NOVEMBRO", 11),
    ("DEZEMBRO", 12),
];

pub const CATEGORY_RANKS: [(&str, u16); 5] = [
    ("TITULAR", 1),
    ("DESIGNAÇÃO", 2),
    ("DESIGNAÇÃO TEMPORÁRIA", 3),
    ("AUXÍLIO", 4),
    ("AUXÍLIO TEMPORÁRIO", 5),
];

const YEAR_MONTH_FORMATS: [&str; 6] = [
    "[year]-[month padding:none]",
    "[year]/[month padding:none]",
    "[year]-[month padding:none]-[day padding:none]",
    "[year]/[month padding:none]/[day padding:none]",
    "[day padding:none]/[month padding:none]/[year]",
    "[day padding:none]-[month padding:none]-[year]",
];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum XrefError {
    #[error("data access error: {0}")]
    DataAccess(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("export error: {0}")]
    Export(String),
}

/// One row of the movement table. Every field is optional so that the older
/// schema (no `ano`) and narrow projections decode into the same shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MovementRecord {
    #[serde(rename = "orgao", default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(rename = "cod_orgao", default, skip_serializing_if = "Option::is_none")]
    pub unit_code: Option<String>,
    #[serde(rename = "mes", default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    #[serde(rename = "ano", default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i64>,
    #[serde(rename = "membro", default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(rename = "designacao", default, skip_serializing_if = "Option::is_none")]
    pub assignment_category: Option<String>,
    #[serde(rename = "observacao", default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Column {
    Unit,
    UnitCode,
    Period,
    Year,
    Member,
    AssignmentCategory,
    Note,
}

/// Columns shown for the selected unit, in display order.
pub const PRIMARY_COLUMNS: [Column; 5] =
    [Column::Year, Column::Period, Column::Member, Column::AssignmentCategory, Column::Note];

/// Columns shown for occurrences in other units, in display order.
pub const CROSS_REFERENCE_COLUMNS: [Column; 7] = [
    Column::Unit,
    Column::UnitCode,
    Column::Period,
    Column::Year,
    Column::Member,
    Column::AssignmentCategory,
    Column::Note,
];

/// `projection` without `ano` when the source table predates the year column.
#[must_use]
pub fn schema_projection(projection: &[Column], year_column: bool) -> Vec<Column> {
    projection.iter().copied().filter(|column| year_column || *column != Column::Year).collect()
}

impl Column {
    pub const ALL: [Self; 7] = [
        Self::Unit,
        Self::UnitCode,
        Self::Period,
        Self::Year,
        Self::Member,
        Self::AssignmentCategory,
        Self::Note,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unit => "orgao",
            Self::UnitCode => "cod_orgao",
            Self::Period => "mes",
            Self::Year => "ano",
            Self::Member => "membro",
            Self::AssignmentCategory => "designacao",
            Self::Note => "observacao",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "orgao" => Some(Self::Unit),
            "cod_orgao" => Some(Self::UnitCode),
            "mes" => Some(Self::Period),
            "ano" => Some(Self::Year),
            "membro" => Some(Self::Member),
            "designacao" => Some(Self::AssignmentCategory),
            "observacao" => Some(Self::Note),
            _ => None,
        }
    }

    /// Text rendering of this column for one record.
    #[must_use]
    pub fn cell(self, record: &MovementRecord) -> Option<String> {
        match self {
            Self::Unit => record.unit.clone(),
            Self::UnitCode => record.unit_code.clone(),
            Self::Period => record.period.clone(),
            Self::Year => record.year.map(|year| year.to_string()),
            Self::Member => record.member.clone(),
            Self::AssignmentCategory => record.assignment_category.clone(),
            Self::Note => record.note.clone(),
        }
    }

    fn assign(self, record: &mut MovementRecord, value: Option<String>) -> Result<(), XrefError> {
        match self {
            Self::Unit => record.unit = value,
            Self::UnitCode => record.unit_code = value,
            Self::Period => record.period = value,
            Self::Year => {
                record.year = value
                    .filter(|raw| !raw.trim().is_empty())
                    .map(|raw| {
                        raw.trim().parse::<i64>().map_err(|err| {
                            XrefError::InvalidInput(format!(
                                "ano MUST be an integer, got {raw:?}: {err}"
                            ))
                        })
                    })
                    .transpose()?;
            }
            Self::Member => record.member = value,
            Self::AssignmentCategory => record.assignment_category = value,
            Self::Note => record.note = value,
        }
        Ok(())
    }
}

impl Display for Column {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[must_use]
pub fn normalize(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}

#[must_use]
pub fn is_vacant(value: Option<&str>) -> bool {
    value.is_some_and(|raw| raw.trim().to_uppercase() == VACANCY_SENTINEL)
}

#[must_use]
pub fn period_rank(period: Option<&str>) -> u16 {
    lookup_rank(&MONTH_RANKS, period)
}

#[must_use]
pub fn category_rank(category: Option<&str>) -> u16 {
    lookup_rank(&CATEGORY_RANKS, category)
}

fn lookup_rank(table: &[(&str, u16)], label: Option<&str>) -> u16 {
    label
        .and_then(|value| table.iter().find(|(known, _)| *known == value))
        .map_or(UNRANKED, |(_, rank)| *rank)
}

fn cmp_present_first(lhs: Option<&str>, rhs: Option<&str>) -> Ordering {
    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => lhs.cmp(rhs),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[must_use]
pub fn compare_records(lhs: &MovementRecord, rhs: &MovementRecord) -> Ordering {
    period_rank(lhs.period.as_deref())
        .cmp(&period_rank(rhs.period.as_deref()))
        .then_with(|| {
            category_rank(lhs.assignment_category.as_deref())
                .cmp(&category_rank(rhs.assignment_category.as_deref()))
        })
        .then_with(|| cmp_present_first(lhs.member.as_deref(), rhs.member.as_deref()))
        .then_with(|| cmp_present_first(lhs.unit.as_deref(), rhs.unit.as_deref()))
}

/// Stable sort by month rank, category rank, member, then unit.
#[must_use]
pub fn order_records(mut records: Vec<MovementRecord>) -> Vec<MovementRecord> {
    records.sort_by(compare_records);
    records
}

#[must_use]
pub fn default_sort_keys() -> Vec<String> {
    vec![
        "mes_rank asc".to_string(),
        "designacao_rank asc".to_string(),
        "membro asc".to_string(),
        "orgao asc".to_string(),
    ]
}

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PairKey {
    pub member: String,
    pub period: String,
}

impl PairKey {
    /// Normalized (member, period) of a record, or `None` when either side is blank.
    #[must_use]
    pub fn of(record: &MovementRecord) -> Option<Self> {
        let member = normalize(record.member.as_deref());
        let period = normalize(record.period.as_deref());
        if member.is_empty() || period.is_empty() {
            return None;
        }
        Some(Self { member, period })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct CrossReferenceQuery {
    pub members: Vec<String>,
    pub periods: Vec<String>,
    pub exclude_unit: String,
    pub exclude_vacant: bool,
}

/// The exact (member, period) pairs of a primary result, plus the member and
/// period sets used for the coarse source query.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct CandidatePairs {
    members: BTreeSet<String>,
    periods: BTreeSet<String>,
    pairs: BTreeSet<PairKey>,
}

impl CandidatePairs {
    #[must_use]
    pub fn from_primary(primary: &[MovementRecord]) -> Self {
        let mut candidates = Self::default();
        for record in primary {
            if is_vacant(record.member.as_deref()) {
                continue;
            }
            let Some(key) = PairKey::of(record) else {
                continue;
            };
            candidates.members.insert(key.member.clone());
            candidates.periods.insert(key.period.clone());
            candidates.pairs.insert(key);
        }
        candidates
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty() || self.periods.is_empty()
    }

    #[must_use]
    pub fn members(&self) -> &BTreeSet<String> {
        &self.members
    }

    #[must_use]
    pub fn periods(&self) -> &BTreeSet<String> {
        &self.periods
    }

    #[must_use]
    pub fn pairs(&self) -> &BTreeSet<PairKey> {
        &self.pairs
    }

    #[must_use]
    pub fn contains(&self, record: &MovementRecord) -> bool {
        PairKey::of(record).is_some_and(|key| self.pairs.contains(&key))
    }

    #[must_use]
    pub fn query(&self, excluded_unit: &str) -> CrossReferenceQuery {
        CrossReferenceQuery {
            members: self.members.iter().cloned().collect(),
            periods: self.periods.iter().cloned().collect(),
            exclude_unit: excluded_unit.to_string(),
            exclude_vacant: true,
        }
    }

    /// Keep only rows whose exact pair was present in the primary result.
    ///
    /// The coarse query filters members and periods independently, so a member
    /// seen in January and another seen in February can both come back for the
    /// other's month. Those rows are dropped here, together with any row of
    /// the excluded unit or with a vacant member.
    #[must_use]
    pub fn retain_matching(
        &self,
        raw: Vec<MovementRecord>,
        excluded_unit: &str,
    ) -> Vec<MovementRecord> {
        raw.into_iter()
            .filter(|record| record.unit.as_deref() != Some(excluded_unit))
            .filter(|record| !is_vacant(record.member.as_deref()))
            .filter(|record| self.contains(record))
            .collect()
    }
}

/// Read access to the movement table.
pub trait MovementSource {
    /// Distinct, sorted, non-empty unit identifiers.
    ///
    /// # Errors
    /// Returns [`XrefError::DataAccess`] when the source cannot be read.
    fn list_units(&self) -> Result<Vec<String>, XrefError>;

    /// Rows whose unit equals `unit`, projected to the primary columns.
    ///
    /// # Errors
    /// Returns [`XrefError::DataAccess`] when the source cannot be read.
    fn query_by_unit(&self, unit: &str) -> Result<Vec<MovementRecord>, XrefError>;

    /// Rows with member in `members`, period in `periods`, unit distinct from
    /// `exclude_unit`, optionally without the vacancy sentinel.
    ///
    /// # Errors
    /// Returns [`XrefError::DataAccess`] when the source cannot be read.
    fn query_by_members_and_periods(
        &self,
        query: &CrossReferenceQuery,
    ) -> Result<Vec<MovementRecord>, XrefError>;

    /// Whether the underlying table carries `ano`.
    fn has_year_column(&self) -> bool {
        true
    }
}

/// Fetch and order the records of one unit.
///
/// # Errors
/// Propagates [`XrefError::DataAccess`] from the source unchanged.
pub fn fetch_by_unit<S>(source: &S, unit: &str) -> Result<Vec<MovementRecord>, XrefError>
where
    S: MovementSource + ?Sized,
{
    let records = source.query_by_unit(unit)?;
    tracing::debug!(unit, rows = records.len(), "primary lookup fetched");
    Ok(order_records(records))
}

/// Occurrences of the primary result's exact (member, period) pairs in other units.
///
/// # Errors
/// Propagates [`XrefError::DataAccess`] from the source unchanged. An empty or
/// all-vacant primary result is not an error and issues no query.
pub fn cross_reference<S>(
    source: &S,
    primary: &[MovementRecord],
    excluded_unit: &str,
) -> Result<Vec<MovementRecord>, XrefError>
where
    S: MovementSource + ?Sized,
{
    let candidates = CandidatePairs::from_primary(primary);
    if candidates.is_empty() {
        tracing::debug!(unit = excluded_unit, "no candidate pairs; skipping cross-reference query");
        return Ok(Vec::new());
    }

    let raw = source.query_by_members_and_periods(&candidates.query(excluded_unit))?;
    let fetched = raw.len();
    let matched = candidates.retain_matching(raw, excluded_unit);
    if matched.len() < fetched {
        tracing::debug!(
            unit = excluded_unit,
            fetched,
            discarded = fetched - matched.len(),
            "discarded rows outside the candidate pairs"
        );
    }
    Ok(order_records(matched))
}

/// A `Vec`-backed source that applies the same filters as the SQL backends.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    records: Vec<MovementRecord>,
}

impl InMemorySource {
    #[must_use]
    pub fn new(records: Vec<MovementRecord>) -> Self {
        Self { records }
    }

    #[must_use]
    pub fn records(&self) -> &[MovementRecord] {
        &self.records
    }
}

impl MovementSource for InMemorySource {
    fn list_units(&self) -> Result<Vec<String>, XrefError> {
        let units = self
            .records
            .iter()
            .filter_map(|record| record.unit.as_deref())
            .filter(|unit| !unit.is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<_>>();
        Ok(units.into_iter().collect())
    }

    fn query_by_unit(&self, unit: &str) -> Result<Vec<MovementRecord>, XrefError> {
        Ok(self
            .records
            .iter()
            .filter(|record| record.unit.as_deref() == Some(unit))
            .map(|record| MovementRecord { unit: None, unit_code: None, ..record.clone() })
            .collect())
    }

    fn query_by_members_and_periods(
        &self,
        query: &CrossReferenceQuery,
    ) -> Result<Vec<MovementRecord>, XrefError> {
        let contains = |values: &[String], value: Option<&str>| {
            value.is_some_and(|value| values.iter().any(|candidate| candidate == value))
        };

        Ok(self
            .records
            .iter()
            .filter(|record| contains(&query.members, record.member.as_deref()))
            .filter(|record| contains(&query.periods, record.period.as_deref()))
            .filter(|record| {
                record.unit.as_deref().is_some_and(|unit| unit != query.exclude_unit)
            })
            .filter(|record| {
                !query.exclude_vacant || record.member.as_deref() != Some(VACANCY_SENTINEL)
            })
            .cloned()
            .collect())
    }
}

/// Canonical `YYYY-MM` from a period label, when it is a recognizable date.
///
/// Dates with the year last are read day-first, as written in Brazilian
/// records: `05/03/2024` is March, not May.
#[must_use]
pub fn parse_year_month(period: &str) -> Option<(i32, u8)> {
    let trimmed = period.trim();
    YEAR_MONTH_FORMATS.iter().find_map(|spec| {
        let items = time::format_description::parse(spec).ok()?;
        let mut parsed = Parsed::new();
        let remaining = parsed.parse_items(trimmed.as_bytes(), &items).ok()?;
        if !remaining.is_empty() {
            return None;
        }
        let year = parsed.year()?;
        let month = parsed.month()?;
        if let Some(day) = parsed.day() {
            time::Date::from_calendar_date(year, month, day.get()).ok()?;
        }
        Some((year, u8::from(month)))
    })
}

/// Grouping key for monthly counts. Parsed months order before raw labels.
/// A record without a period has no key.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BucketKey {
    YearMonth { year: i32, month: u8 },
    Raw(String),
}

impl BucketKey {
    #[must_use]
    pub fn from_period(period: Option<&str>) -> Option<Self> {
        let period = period?;
        Some(match parse_year_month(period) {
            Some((year, month)) => Self::YearMonth { year, month },
            None => Self::Raw(period.to_string()),
        })
    }
}

impl Display for BucketKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::YearMonth { year, month } => write!(f, "{year:04}-{month:02}"),
            Self::Raw(label) => f.write_str(label),
        }
    }
}

impl Serialize for BucketKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct MonthBucket {
    pub period: BucketKey,
    pub count: usize,
}

/// Counts for one slice. `total` includes rows without a period, which
/// appear in no bucket. `distinct_members` compares trimmed names, so
/// `"Ana"` and `" Ana "` are one member.
#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct MonthlySummary {
    pub total: usize,
    pub distinct_buckets: usize,
    pub distinct_members: usize,
    pub buckets: Vec<MonthBucket>,
}

#[must_use]
pub fn bucket_by_month<P>(records: &[MovementRecord], predicate: P) -> MonthlySummary
where
    P: Fn(&MovementRecord) -> bool,
{
    let mut counts: BTreeMap<BucketKey, usize> = BTreeMap::new();
    let mut members: BTreeSet<String> = BTreeSet::new();
    let mut total = 0_usize;

    for record in records.iter().filter(|record| predicate(record)) {
        total += 1;
        if let Some(key) = BucketKey::from_period(record.period.as_deref()) {
            *counts.entry(key).or_insert(0) += 1;
        }
        let member = normalize(record.member.as_deref());
        if !member.is_empty() {
            members.insert(member);
        }
    }

    let buckets = counts
        .into_iter()
        .map(|(period, count)| MonthBucket { period, count })
        .collect::<Vec<_>>();

    MonthlySummary {
        total,
        distinct_buckets: buckets.len(),
        distinct_members: members.len(),
        buckets,
    }
}

/// Report slices over the primary result.
///
/// `Assistance` matches `auxílio`/`auxilio` anywhere in the category, while
/// the ordering rank table only knows the exact accented spellings. The two
/// policies are intentionally left as they are.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Slice {
    Assistance,
    Designation,
    Vacancy,
}

impl Slice {
    #[must_use]
    pub fn matches(self, record: &MovementRecord) -> bool {
        match self {
            Self::Assistance => record.assignment_category.as_deref().is_some_and(|category| {
                let lowered = category.to_lowercase();
                lowered.contains("auxílio") || lowered.contains("auxilio")
            }),
            Self::Designation => record
                .assignment_category
                .as_deref()
                .is_some_and(|category| category.trim().to_uppercase() == "DESIGNAÇÃO"),
            Self::Vacancy => is_vacant(record.member.as_deref()),
        }
    }
}

#[must_use]
pub fn slice_summary(records: &[MovementRecord], slice: Slice) -> MonthlySummary {
    bucket_by_month(records, |record| slice.matches(record))
}

/// Rows of text cells under named columns; column order is display order.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl Table {
    /// Project records onto `projection`. Every projected column is kept,
    /// unfilled cells included.
    #[must_use]
    pub fn from_records(records: &[MovementRecord], projection: &[Column]) -> Self {
        Self {
            columns: projection.iter().map(|column| column.as_str().to_string()).collect(),
            rows: records
                .iter()
                .map(|record| projection.iter().map(|column| column.cell(record)).collect())
                .collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Decode rows back into records; unknown columns are ignored.
    ///
    /// # Errors
    /// Returns [`XrefError::InvalidInput`] when an `ano` cell is not an integer.
    pub fn to_records(&self) -> Result<Vec<MovementRecord>, XrefError> {
        let mapping = self
            .columns
            .iter()
            .enumerate()
            .filter_map(|(index, name)| Column::parse(name).map(|column| (index, column)))
            .collect::<Vec<_>>();

        let mut records = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let mut record = MovementRecord::default();
            for (index, column) in &mapping {
                column.assign(&mut record, row.get(*index).cloned().flatten())?;
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Delimited text with a header row. Absent cells are empty fields; empty
    /// strings are written as `""` so the two stay distinguishable.
    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        write_csv_record(&mut out, self.columns.iter().map(|name| Some(name.as_str())));
        for row in &self.rows {
            write_csv_record(&mut out, row.iter().map(Option::as_deref));
        }
        out
    }

    /// Parse text produced by [`Table::to_csv`] (or any RFC 4180 file with a header).
    ///
    /// # Errors
    /// Returns [`XrefError::InvalidInput`] for a missing header, an unterminated
    /// quoted field, or a row whose width differs from the header.
    pub fn from_csv(input: &str) -> Result<Self, XrefError> {
        let input = input.strip_prefix('\u{feff}').unwrap_or(input);
        let mut records = parse_csv_records(input)?.into_iter();
        let header = records
            .next()
            .ok_or_else(|| XrefError::InvalidInput("csv header row is missing".to_string()))?;
        let columns = header.into_iter().map(Option::unwrap_or_default).collect::<Vec<_>>();

        let mut rows = Vec::new();
        for (index, row) in records.enumerate() {
            if row.len() != columns.len() {
                return Err(XrefError::InvalidInput(format!(
                    "csv row {} has {} fields, expected {}",
                    index + 2,
                    row.len(),
                    columns.len()
                )));
            }
            rows.push(row);
        }

        Ok(Self { columns, rows })
    }

    /// Stack labeled tables under the union of their columns (first-seen order)
    /// plus a trailing [`ORIGIN_COLUMN`] naming each row's table.
    #[must_use]
    pub fn stack_with_origin(parts: &[(&str, &Table)]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for (_, table) in parts {
            for column in &table.columns {
                if !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
        }

        let mut rows = Vec::new();
        for (label, table) in parts {
            let positions =
                columns.iter().map(|column| table.column_index(column)).collect::<Vec<_>>();
            for row in &table.rows {
                let mut stacked = positions
                    .iter()
                    .map(|position| position.and_then(|index| row.get(index).cloned().flatten()))
                    .collect::<Vec<_>>();
                stacked.push(Some((*label).to_string()));
                rows.push(stacked);
            }
        }

        columns.push(ORIGIN_COLUMN.to_string());
        Self { columns, rows }
    }
}

impl Serialize for Table {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Table", 2)?;
        state.serialize_field("columns", &self.columns)?;
        state.serialize_field("rows", &RowObjects(self))?;
        state.end()
    }
}

struct RowObjects<'a>(&'a Table);

impl Serialize for RowObjects<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.0.rows.len()))?;
        for row in &self.0.rows {
            seq.serialize_element(&RowObject { columns: &self.0.columns, cells: row })?;
        }
        seq.end()
    }
}

struct RowObject<'a> {
    columns: &'a [String],
    cells: &'a [Option<String>],
}

impl Serialize for RowObject<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (index, column) in self.columns.iter().enumerate() {
            map.serialize_entry(column, &self.cells.get(index).cloned().flatten())?;
        }
        map.end()
    }
}

fn write_csv_record<'a, I>(out: &mut String, fields: I)
where
    I: Iterator<Item = Option<&'a str>>,
{
    for (index, field) in fields.enumerate() {
        if index > 0 {
            out.push(',');
        }
        match field {
            None => {}
            Some(value) if value.is_empty() || value.contains([',', '"', '\n', '\r']) => {
                out.push('"');
                out.push_str(&value.replace('"', "\"\""));
                out.push('"');
            }
            Some(value) => out.push_str(value),
        }
    }
    out.push('\n');
}

fn finish_field(field: &mut String, quoted: &mut bool) -> Option<String> {
    let value = std::mem::take(field);
    let was_quoted = std::mem::replace(quoted, false);
    if value.is_empty() && !was_quoted {
        None
    } else {
        Some(value)
    }
}

fn parse_csv_records(input: &str) -> Result<Vec<Vec<Option<String>>>, XrefError> {
    let mut records = Vec::new();
    let mut record: Vec<Option<String>> = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut at_record_start = true;
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        at_record_start = false;
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(ch);
            }
            continue;
        }

        match ch {
            '"' if field.is_empty() && !quoted => {
                in_quotes = true;
                quoted = true;
            }
            ',' => record.push(finish_field(&mut field, &mut quoted)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(finish_field(&mut field, &mut quoted));
                records.push(std::mem::take(&mut record));
                at_record_start = true;
            }
            _ => field.push(ch),
        }
    }

    if in_quotes {
        return Err(XrefError::InvalidInput("csv input ends inside a quoted field".to_string()));
    }
    if !at_record_start {
        record.push(finish_field(&mut field, &mut quoted));
        records.push(record);
    }

    Ok(records)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConsultationStatus {
    Records,
    NoRecords,
}

impl ConsultationStatus {
    #[must_use]
    pub fn of(records: &[MovementRecord]) -> Self {
        if records.is_empty() {
            Self::NoRecords
        } else {
            Self::Records
        }
    }
}

/// Everything the presentation layer needs for one selected unit.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ConsultationReport {
    pub consultation_id: String,
    pub unit: String,
    pub status: ConsultationStatus,
    pub cross_reference_status: ConsultationStatus,
    pub sort_keys: Vec<String>,
    pub primary: Table,
    pub cross_reference: Table,
    pub assistance: MonthlySummary,
    pub designation: MonthlySummary,
    pub vacancy: MonthlySummary,
}

impl ConsultationReport {
    #[must_use]
    pub fn assemble(
        unit: &str,
        consultation_id: String,
        primary: &[MovementRecord],
        cross_reference: &[MovementRecord],
    ) -> Self {
        Self::assemble_for_schema(unit, consultation_id, primary, cross_reference, true)
    }

    /// Like [`ConsultationReport::assemble`], leaving `ano` out of both tables
    /// when the source has no year column.
    #[must_use]
    pub fn assemble_for_schema(
        unit: &str,
        consultation_id: String,
        primary: &[MovementRecord],
        cross_reference: &[MovementRecord],
        year_column: bool,
    ) -> Self {
        Self {
            consultation_id,
            unit: unit.to_string(),
            status: ConsultationStatus::of(primary),
            cross_reference_status: ConsultationStatus::of(cross_reference),
            sort_keys: default_sort_keys(),
            primary: Table::from_records(
                primary,
                &schema_projection(&PRIMARY_COLUMNS, year_column),
            ),
            cross_reference: Table::from_records(
                cross_reference,
                &schema_projection(&CROSS_REFERENCE_COLUMNS, year_column),
            ),
            assistance: slice_summary(primary, Slice::Assistance),
            designation: slice_summary(primary, Slice::Designation),
            vacancy: slice_summary(primary, Slice::Vacancy),
        }
    }

    /// Both tables stacked with a `_tabela` origin column.
    #[must_use]
    pub fn consolidated_table(&self) -> Table {
        Table::stack_with_origin(&[
            (PRIMARY_TABLE_LABEL, &self.primary),
            (CROSS_REFERENCE_TABLE_LABEL, &self.cross_reference),
        ])
    }
}
