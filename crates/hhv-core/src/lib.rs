//! Core data model and table schema declarations for HHV.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hhv-core";

pub const EMPLOYER_HEADER: &[&str] = &["employer_id", "name", "website", "count_open_vacancies"];

pub const VACANCY_HEADER: &[&str] = &[
    "vacancy name",
    "vacancy id",
    "vacancy location",
    "salary",
    "url",
    "employer id",
    "employer name",
    "job requirement",
    "responsibility",
    "experience",
];

pub const VACANCY_IDENTITY_FIELD: &str = "vacancy id";

pub const EMPLOYERS_TABLE: &str = "employers";
pub const VACANCIES_TABLE: &str = "vacancies";

/// A record that can be written as one CSV line under a fixed header.
///
/// `values()` must return exactly `HEADER.len()` cells in header order; null
/// fields are rendered as empty strings.
pub trait CsvRow {
    const HEADER: &'static [&'static str];

    fn values(&self) -> Vec<String>;
}

/// One employer search result, flattened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Employer {
    pub employer_id: Option<String>,
    pub name: Option<String>,
    pub website: Option<String>,
    pub count_open_vacancies: Option<i64>,
}

impl CsvRow for Employer {
    const HEADER: &'static [&'static str] = EMPLOYER_HEADER;

    fn values(&self) -> Vec<String> {
        vec![
            cell(&self.employer_id),
            cell(&self.name),
            cell(&self.website),
            self.count_open_vacancies
                .map(|n| n.to_string())
                .unwrap_or_default(),
        ]
    }
}

/// One vacancy, flattened from the nested API representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Vacancy {
    pub name: Option<String>,
    pub id: String,
    pub location: Option<String>,
    pub salary: Option<f64>,
    pub url: Option<String>,
    pub employer_id: Option<String>,
    pub employer_name: Option<String>,
    pub requirement: Option<String>,
    pub responsibility: Option<String>,
    pub experience: Option<String>,
}

impl CsvRow for Vacancy {
    const HEADER: &'static [&'static str] = VACANCY_HEADER;

    fn values(&self) -> Vec<String> {
        vec![
            cell(&self.name),
            self.id.clone(),
            cell(&self.location),
            self.salary.map(format_salary).unwrap_or_default(),
            cell(&self.url),
            cell(&self.employer_id),
            cell(&self.employer_name),
            cell(&self.requirement),
            cell(&self.responsibility),
            cell(&self.experience),
        ]
    }
}

fn cell(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

/// Renders whole salaries without a fractional part so the CSV stays castable
/// to `numeric` and reads like the API value.
pub fn format_salary(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

pub const BOUNDED_TEXT_LIMIT: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    /// Unbounded `TEXT`.
    FreeText,
    /// `VARCHAR(n)`.
    BoundedText(usize),
}

impl ColumnKind {
    pub fn sql_type(&self) -> String {
        match self {
            ColumnKind::FreeText => "TEXT".to_string(),
            ColumnKind::BoundedText(limit) => format!("VARCHAR({limit})"),
        }
    }
}

/// Columns with an explicit kind. Anything not listed is bounded text.
pub const COLUMN_KINDS: &[(&str, ColumnKind)] = &[
    ("vacancy name", ColumnKind::FreeText),
    ("vacancy id", ColumnKind::FreeText),
    ("vacancy location", ColumnKind::FreeText),
];

pub fn column_kind(name: &str) -> ColumnKind {
    COLUMN_KINDS
        .iter()
        .find(|(column, _)| *column == name)
        .map(|(_, kind)| *kind)
        .unwrap_or(ColumnKind::BoundedText(BOUNDED_TEXT_LIMIT))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowViolation {
    #[error("expected {expected} columns, found {found}")]
    ColumnCount { expected: usize, found: usize },
    #[error("column \"{column}\" holds {length} characters, limit is {limit}")]
    TooLong {
        column: String,
        length: usize,
        limit: usize,
    },
}

/// Table layout derived from a CSV header: column order is header order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn from_header<S: AsRef<str>>(table: &str, header: &[S]) -> Self {
        Self {
            table: table.to_string(),
            columns: header
                .iter()
                .map(|name| ColumnDef {
                    name: name.as_ref().to_string(),
                    kind: column_kind(name.as_ref()),
                })
                .collect(),
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn create_table_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.kind.sql_type()))
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE {} ({columns})", quote_ident(&self.table))
    }

    pub fn insert_sql(&self) -> String {
        let placeholders = (1..=self.columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} VALUES ({placeholders})",
            quote_ident(&self.table)
        )
    }

    pub fn validate_row<S: AsRef<str>>(&self, row: &[S]) -> Result<(), RowViolation> {
        if row.len() != self.columns.len() {
            return Err(RowViolation::ColumnCount {
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        for (column, value) in self.columns.iter().zip(row) {
            if let ColumnKind::BoundedText(limit) = column.kind {
                let length = value.as_ref().chars().count();
                if length > limit {
                    return Err(RowViolation::TooLong {
                        column: column.name.clone(),
                        length,
                        limit,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Double-quotes an identifier so case and spaces survive in PostgreSQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
