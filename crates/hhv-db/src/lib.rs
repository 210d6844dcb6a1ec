//! PostgreSQL side of HHV: CSV-driven table loading and the report queries.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hhv_core::{
    quote_ident, RowViolation, TableSchema, EMPLOYERS_TABLE, VACANCIES_TABLE, VACANCY_HEADER,
};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Connection, Row};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "hhv-db";

pub type DbError = sqlx::Error;

/// Connection settings. `database_url` wins over the individual parts when set.
#[derive(Clone)]
pub struct DbConfig {
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: String,
    pub database: Option<String>,
    pub schema: Option<String>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            host: "localhost".to_string(),
            port: 5432,
            user: None,
            password: String::new(),
            database: None,
            schema: None,
        }
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("schema", &self.schema)
            .finish()
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl DbConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: non_empty_var("DATABASE_URL"),
            host: non_empty_var("DB_HOST").unwrap_or(defaults.host),
            port: non_empty_var("DB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            user: non_empty_var("DB_USER"),
            password: std::env::var("DB_PASSWORD").unwrap_or_default(),
            database: non_empty_var("DB_NAME"),
            schema: non_empty_var("DB_SCHEMA"),
        }
    }

    /// Without `database_url`, both `user` and `database` must be set.
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        let mut options = match &self.database_url {
            Some(url) => url.parse::<PgConnectOptions>()?,
            None => {
                let (Some(user), Some(database)) = (&self.user, &self.database) else {
                    return Err(sqlx::Error::Configuration(
                        "set DATABASE_URL, or DB_USER and DB_NAME".into(),
                    ));
                };
                let options = PgConnectOptions::new()
                    .host(&self.host)
                    .port(self.port)
                    .username(user)
                    .database(database);
                if self.password.is_empty() {
                    options
                } else {
                    options.password(&self.password)
                }
            }
        };
        if let Some(schema) = &self.schema {
            options = options.options([("search_path", schema.as_str())]);
        }
        Ok(options)
    }

    /// Open a dedicated connection. Callers own it for one logical operation.
    pub async fn connect(&self) -> Result<PgConnection, sqlx::Error> {
        PgConnection::connect_with(&self.connect_options()?).await
    }
}

const TABLE_EXISTS_SQL: &str = r#"
    SELECT EXISTS (
        SELECT 1
          FROM information_schema.tables
         WHERE table_name = $1
           AND table_schema = current_schema()
    )
"#;

async fn table_exists_on(conn: &mut PgConnection, table: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(TABLE_EXISTS_SQL)
        .bind(table)
        .fetch_one(&mut *conn)
        .await?;
    row.try_get(0)
}

/// Yes/no gate in front of schema-changing work.
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&str) -> bool,
{
    fn confirm(&self, prompt: &str) -> bool {
        self(prompt)
    }
}

/// Confirms everything; used for non-interactive runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

/// Rows bound for one table in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBatch {
    pub schema: TableSchema,
    pub create: bool,
    pub rows: Vec<Vec<String>>,
}

#[async_trait]
pub trait TableStore: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool, sqlx::Error>;

    async fn existing_identities(&self, table: &str, column: &str) -> Result<HashSet<String>, sqlx::Error>;

    /// Create the table when `batch.create` is set, insert every row, commit.
    async fn write_batch(&self, batch: &LoadBatch) -> Result<(), sqlx::Error>;
}

/// `TableStore` backed by PostgreSQL, one fresh connection per call.
#[derive(Debug, Clone)]
pub struct PgTableStore {
    config: DbConfig,
}

impl PgTableStore {
    pub fn new(config: DbConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn table_exists(&self, table: &str) -> Result<bool, sqlx::Error> {
        let mut conn = self.config.connect().await?;
        let exists = table_exists_on(&mut conn, table).await?;
        conn.close().await?;
        Ok(exists)
    }

    async fn existing_identities(&self, table: &str, column: &str) -> Result<HashSet<String>, sqlx::Error> {
        let mut conn = self.config.connect().await?;
        let sql = format!(
            "SELECT {}::text AS identity FROM {}",
            quote_ident(column),
            quote_ident(table)
        );
        let rows = sqlx::query(&sql).fetch_all(&mut conn).await?;
        conn.close().await?;

        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            let identity: Option<String> = row.try_get("identity")?;
            out.extend(identity);
        }
        Ok(out)
    }

    async fn write_batch(&self, batch: &LoadBatch) -> Result<(), sqlx::Error> {
        let mut conn = self.config.connect().await?;
        let mut tx = conn.begin().await?;

        if batch.create {
            sqlx::query(&batch.schema.create_table_sql())
                .execute(&mut *tx)
                .await?;
        }

        let insert = batch.schema.insert_sql();
        for row in &batch.rows {
            let mut query = sqlx::query(&insert);
            for value in row {
                query = query.bind(value.as_str());
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        conn.close().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Zero-based CSV column used for de-duplication.
    pub identity_column: usize,
    /// Seed the de-duplication set from the identities already in the table.
    pub skip_existing: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            identity_column: 1,
            skip_existing: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadOutcome {
    Declined,
    Created { inserted: usize, skipped: usize },
    Appended { inserted: usize, skipped: usize },
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("reading {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{} has no header row", .path.display())]
    EmptyHeader { path: PathBuf },
    #[error("identity column {index} is outside the {width}-column header")]
    IdentityColumn { index: usize, width: usize },
    #[error("line {line} of {}: {violation}", .path.display())]
    InvalidRow {
        path: PathBuf,
        line: u64,
        #[source]
        violation: RowViolation,
    },
}

struct CsvTable {
    header: Vec<String>,
    records: Vec<(u64, Vec<String>)>,
}

fn read_csv_table(path: &Path) -> Result<CsvTable, LoadError> {
    let csv_err = |source| LoadError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;
    let header = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(String::from)
        .collect::<Vec<_>>();
    if header.is_empty() || header.iter().all(|h| h.is_empty()) {
        return Err(LoadError::EmptyHeader {
            path: path.to_path_buf(),
        });
    }

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        records.push((line, record.iter().map(String::from).collect()));
    }
    Ok(CsvTable { header, records })
}

/// Loads a CSV file into a same-named table, creating it from the header when
/// missing. Both paths are gated on confirmation.
#[derive(Debug, Clone, Default)]
pub struct TableLoader {
    options: LoadOptions,
}

impl TableLoader {
    pub fn new(options: LoadOptions) -> Self {
        Self { options }
    }

    pub async fn ensure_loaded<S, C>(
        &self,
        store: &S,
        confirm: &C,
        table: &str,
        csv_path: impl AsRef<Path>,
    ) -> Result<LoadOutcome, LoadError>
    where
        S: TableStore + ?Sized,
        C: Confirm + ?Sized,
    {
        let csv_path = csv_path.as_ref();
        let span = info_span!("table_load", table, csv = %csv_path.display());
        async move {
            let exists = store.table_exists(table).await?;
            let prompt = if exists {
                format!("Table {table} already exists. Load new data into it?")
            } else {
                format!("Table {table} does not exist. Create it and load the data?")
            };
            if !confirm.confirm(&prompt) {
                info!("load declined");
                return Ok(LoadOutcome::Declined);
            }

            let csv = read_csv_table(csv_path)?;
            let index = self.options.identity_column;
            if index >= csv.header.len() {
                return Err(LoadError::IdentityColumn {
                    index,
                    width: csv.header.len(),
                });
            }
            let schema = TableSchema::from_header(table, &csv.header);

            let mut seen = if exists && self.options.skip_existing {
                store.existing_identities(table, &csv.header[index]).await?
            } else {
                HashSet::new()
            };

            let mut rows = Vec::with_capacity(csv.records.len());
            let mut skipped = 0usize;
            for (line, record) in csv.records {
                if record.get(index).is_some_and(|id| seen.contains(id)) {
                    skipped += 1;
                    continue;
                }
                schema
                    .validate_row(&record)
                    .map_err(|violation| LoadError::InvalidRow {
                        path: csv_path.to_path_buf(),
                        line,
                        violation,
                    })?;
                seen.insert(record[index].clone());
                rows.push(record);
            }

            let inserted = rows.len();
            store
                .write_batch(&LoadBatch {
                    schema,
                    create: !exists,
                    rows,
                })
                .await?;

            if exists {
                info!(inserted, skipped, "appended rows to existing table");
                Ok(LoadOutcome::Appended { inserted, skipped })
            } else {
                info!(inserted, skipped, "created table and loaded rows");
                Ok(LoadOutcome::Created { inserted, skipped })
            }
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompanyVacancyCount {
    pub employer_id: Option<String>,
    pub name: Option<String>,
    pub website: Option<String>,
    pub vacancy_count: i64,
}

/// One `vacancies` row as stored: every column is text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VacancyRow {
    pub name: Option<String>,
    pub id: Option<String>,
    pub location: Option<String>,
    pub salary: Option<String>,
    pub url: Option<String>,
    pub employer_id: Option<String>,
    pub employer_name: Option<String>,
    pub requirement: Option<String>,
    pub responsibility: Option<String>,
    pub experience: Option<String>,
}

impl VacancyRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            name: row.try_get("vacancy name")?,
            id: row.try_get("vacancy id")?,
            location: row.try_get("vacancy location")?,
            salary: row.try_get("salary")?,
            url: row.try_get("url")?,
            employer_id: row.try_get("employer id")?,
            employer_name: row.try_get("employer name")?,
            requirement: row.try_get("job requirement")?,
            responsibility: row.try_get("responsibility")?,
            experience: row.try_get("experience")?,
        })
    }
}

fn vacancy_columns() -> String {
    VACANCY_HEADER
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// ILIKE pattern matching `keyword` anywhere, with LIKE wildcards escaped.
pub fn like_pattern(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len() + 2);
    escaped.push('%');
    for ch in keyword.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

/// The fixed report queries over `employers` and `vacancies`. Result order is
/// whatever the database returns.
#[derive(Debug, Clone)]
pub struct VacancyQueries {
    config: DbConfig,
}

impl VacancyQueries {
    pub fn new(config: DbConfig) -> Self {
        Self { config }
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool, sqlx::Error> {
        let mut conn = self.config.connect().await?;
        let exists = table_exists_on(&mut conn, table).await?;
        conn.close().await?;
        Ok(exists)
    }

    pub async fn companies_and_vacancy_counts(&self) -> Result<Vec<CompanyVacancyCount>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT e.employer_id, e.name, e.website, COUNT(v."vacancy id") AS vacancy_count
              FROM {employers} e
              LEFT JOIN {vacancies} v ON e.employer_id = v."employer id"
             GROUP BY e.employer_id, e.name, e.website
            "#,
            employers = quote_ident(EMPLOYERS_TABLE),
            vacancies = quote_ident(VACANCIES_TABLE),
        );
        let mut conn = self.config.connect().await?;
        let rows = sqlx::query(&sql).fetch_all(&mut conn).await?;
        conn.close().await?;

        rows.iter()
            .map(|row| {
                Ok(CompanyVacancyCount {
                    employer_id: row.try_get("employer_id")?,
                    name: row.try_get("name")?,
                    website: row.try_get("website")?,
                    vacancy_count: row.try_get("vacancy_count")?,
                })
            })
            .collect()
    }

    pub async fn total_vacancy_count(&self) -> Result<i64, sqlx::Error> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(VACANCIES_TABLE));
        let mut conn = self.config.connect().await?;
        let row = sqlx::query(&sql).fetch_one(&mut conn).await?;
        conn.close().await?;
        row.try_get(0)
    }

    /// Mean of the non-empty salaries rounded to an integer, `None` when there
    /// are none.
    pub async fn average_salary(&self) -> Result<Option<i64>, sqlx::Error> {
        let sql = format!(
            "SELECT ROUND(AVG(CAST(salary AS numeric)), 0)::BIGINT FROM {} WHERE salary <> ''",
            quote_ident(VACANCIES_TABLE)
        );
        let mut conn = self.config.connect().await?;
        let row = sqlx::query(&sql).fetch_one(&mut conn).await?;
        conn.close().await?;
        row.try_get(0)
    }

    pub async fn above_average_salary_vacancies(&self) -> Result<Vec<VacancyRow>, sqlx::Error> {
        let Some(average) = self.average_salary().await? else {
            warn!("no salaries recorded; nothing is above average");
            return Ok(Vec::new());
        };
        let sql = format!(
            r#"
            SELECT {columns}
              FROM {vacancies}
             WHERE salary <> ''
               AND (CASE WHEN salary <> '' THEN CAST(salary AS numeric) END) > $1
            "#,
            columns = vacancy_columns(),
            vacancies = quote_ident(VACANCIES_TABLE),
        );
        let mut conn = self.config.connect().await?;
        let rows = sqlx::query(&sql).bind(average).fetch_all(&mut conn).await?;
        conn.close().await?;
        rows.iter().map(VacancyRow::from_row).collect()
    }

    pub async fn vacancies_matching_keyword(&self, keyword: &str) -> Result<Vec<VacancyRow>, sqlx::Error> {
        let sql = format!(
            r#"SELECT {columns} FROM {vacancies} WHERE "vacancy name" ILIKE $1"#,
            columns = vacancy_columns(),
            vacancies = quote_ident(VACANCIES_TABLE),
        );
        let mut conn = self.config.connect().await?;
        let rows = sqlx::query(&sql)
            .bind(like_pattern(keyword))
            .fetch_all(&mut conn)
            .await?;
        conn.close().await?;
        rows.iter().map(VacancyRow::from_row).collect()
    }
}
