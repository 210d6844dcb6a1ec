//! Run orchestration: fetch, normalize, persist to CSV, load into tables.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hhv_adapters::{
    normalize_employers, normalize_vacancies, EmployerSearch, VacancySearch, DEFAULT_EMPLOYERS_URL,
    DEFAULT_VACANCIES_URL,
};
use hhv_core::{EMPLOYERS_TABLE, VACANCIES_TABLE, VACANCY_IDENTITY_FIELD};
use hhv_db::{
    CompanyVacancyCount, Confirm, DbConfig, LoadOutcome, TableLoader, TableStore, VacancyQueries,
    VacancyRow,
};
use hhv_storage::{append_unique, write_snapshot, HttpClientConfig, HttpFetcher, JsonSource};
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hhv-sync";

pub const EMPLOYERS_CSV: &str = "data_employers.csv";
pub const VACANCIES_CSV: &str = "data_vacancies.csv";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub employers_url: String,
    pub vacancies_url: String,
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub db: DbConfig,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            employers_url: std::env::var("HHV_EMPLOYERS_URL")
                .unwrap_or_else(|_| DEFAULT_EMPLOYERS_URL.to_string()),
            vacancies_url: std::env::var("HHV_VACANCIES_URL")
                .unwrap_or_else(|_| DEFAULT_VACANCIES_URL.to_string()),
            data_dir: std::env::var("HHV_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data_file")),
            user_agent: std::env::var("HHV_USER_AGENT")
                .unwrap_or_else(|_| "hhv-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("HHV_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            db: DbConfig::from_env(),
        }
    }

    pub fn csv_path(&self, dataset: Dataset) -> PathBuf {
        self.data_dir.join(dataset.csv_file())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Dataset {
    Employers,
    Vacancies,
}

impl Dataset {
    pub fn table(&self) -> &'static str {
        match self {
            Dataset::Employers => EMPLOYERS_TABLE,
            Dataset::Vacancies => VACANCIES_TABLE,
        }
    }

    pub fn csv_file(&self) -> &'static str {
        match self {
            Dataset::Employers => EMPLOYERS_CSV,
            Dataset::Vacancies => VACANCIES_CSV,
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for Dataset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "employers" => Ok(Dataset::Employers),
            "vacancies" => Ok(Dataset::Vacancies),
            other => Err(format!("unknown dataset {other:?}; expected employers or vacancies")),
        }
    }
}

/// What one fetch-and-persist stage did.
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub run_id: Uuid,
    pub dataset: Dataset,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub normalized: usize,
    pub written: usize,
    pub skipped: usize,
    pub csv_path: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    run_id: Uuid,
    http: Box<dyn JsonSource>,
    employers: EmployerSearch,
    vacancies: VacancySearch,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self::with_source(config, Box::new(http)))
    }

    pub fn with_source(config: SyncConfig, http: Box<dyn JsonSource>) -> Self {
        let employers = EmployerSearch::new(config.employers_url.clone());
        let vacancies = VacancySearch::new(config.vacancies_url.clone());
        Self {
            config,
            run_id: Uuid::new_v4(),
            http,
            employers,
            vacancies,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Search employers and replace the employers CSV with the result.
    pub async fn fetch_employers(&self, query_text: &str) -> Result<StageSummary> {
        let span = info_span!("sync_employers", run_id = %self.run_id, query = query_text);
        async move {
            let started_at = Utc::now();
            let items = self
                .employers
                .fetch_all(&*self.http, query_text)
                .await
                .with_context(|| format!("searching employers for {query_text:?}"))?;
            let employers = normalize_employers(&items);
            let path = self.config.csv_path(Dataset::Employers);
            let report = write_snapshot(&employers, &path)
                .with_context(|| format!("writing {}", path.display()))?;
            info!(employers = employers.len(), path = %path.display(), "employer snapshot saved");

            Ok(StageSummary {
                run_id: self.run_id,
                dataset: Dataset::Employers,
                started_at,
                finished_at: Utc::now(),
                fetched: items.len(),
                normalized: employers.len(),
                written: report.written,
                skipped: report.skipped,
                csv_path: path.display().to_string(),
            })
        }
        .instrument(span)
        .await
    }

    /// Fetch one employer's vacancies and append the unseen ones to the
    /// vacancies CSV.
    pub async fn fetch_vacancies(&self, employer_id: &str) -> Result<StageSummary> {
        let span = info_span!("sync_vacancies", run_id = %self.run_id, employer_id);
        async move {
            let started_at = Utc::now();
            let items = self
                .vacancies
                .fetch_for_owner(&*self.http, employer_id)
                .await
                .with_context(|| format!("fetching vacancies for employer {employer_id}"))?;
            let vacancies = normalize_vacancies(&items);
            let path = self.config.csv_path(Dataset::Vacancies);
            let report = append_unique(&vacancies, &path, VACANCY_IDENTITY_FIELD)
                .with_context(|| format!("appending to {}", path.display()))?;
            info!(
                written = report.written,
                skipped = report.skipped,
                path = %path.display(),
                "vacancies saved"
            );

            Ok(StageSummary {
                run_id: self.run_id,
                dataset: Dataset::Vacancies,
                started_at,
                finished_at: Utc::now(),
                fetched: items.len(),
                normalized: vacancies.len(),
                written: report.written,
                skipped: report.skipped,
                csv_path: path.display().to_string(),
            })
        }
        .instrument(span)
        .await
    }

    pub async fn load_table<S, C>(
        &self,
        loader: &TableLoader,
        store: &S,
        confirm: &C,
        dataset: Dataset,
    ) -> Result<LoadOutcome>
    where
        S: TableStore + ?Sized,
        C: Confirm + ?Sized,
    {
        let path = self.config.csv_path(dataset);
        loader
            .ensure_loaded(store, confirm, dataset.table(), &path)
            .await
            .with_context(|| format!("loading {} into table {}", path.display(), dataset.table()))
    }
}

/// Everything printed after the tables are loaded, minus the keyword search.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub companies: Vec<CompanyVacancyCount>,
    pub total_vacancies: i64,
    pub average_salary: Option<i64>,
    pub above_average: Vec<VacancyRow>,
}

/// `None` when either table is missing.
pub async fn collect_report(queries: &VacancyQueries) -> Result<Option<Report>> {
    for table in [EMPLOYERS_TABLE, VACANCIES_TABLE] {
        if !queries
            .table_exists(table)
            .await
            .with_context(|| format!("checking table {table}"))?
        {
            return Ok(None);
        }
    }

    Ok(Some(Report {
        companies: queries
            .companies_and_vacancy_counts()
            .await
            .context("counting vacancies per company")?,
        total_vacancies: queries
            .total_vacancy_count()
            .await
            .context("counting vacancies")?,
        average_salary: queries
            .average_salary()
            .await
            .context("averaging salaries")?,
        above_average: queries
            .above_average_salary_vacancies()
            .await
            .context("selecting above-average vacancies")?,
    }))
}

const SEPARATOR: &str = "------------";

fn vacancy_lines(rows: &[VacancyRow], out: &mut Vec<String>) {
    for row in rows {
        out.push(format!("Vacancy: {}", row.name.as_deref().unwrap_or_default()));
        out.push(format!("Salary: {}", row.salary.as_deref().unwrap_or_default()));
        out.push(SEPARATOR.to_string());
    }
}

pub fn render_report(report: &Report) -> String {
    let mut lines = vec![String::new(), "Results:".to_string(), SEPARATOR.to_string()];
    for company in &report.companies {
        lines.push(format!("Company: {}", company.name.as_deref().unwrap_or_default()));
        lines.push(format!("Vacancies: {}", company.vacancy_count));
        lines.push(SEPARATOR.to_string());
    }
    lines.push(format!("Total vacancies: {}", report.total_vacancies));
    lines.push(SEPARATOR.to_string());
    lines.push(format!(
        "Average salary: {}",
        report
            .average_salary
            .map(|v| v.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    ));
    lines.push(SEPARATOR.to_string());
    vacancy_lines(&report.above_average, &mut lines);
    lines.join("\n")
}

pub fn render_keyword_matches(keyword: &str, rows: &[VacancyRow]) -> String {
    let mut lines = vec![format!("Vacancies matching {keyword:?}: {}", rows.len()), SEPARATOR.to_string()];
    vacancy_lines(rows, &mut lines);
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hhv_core::EMPLOYER_HEADER;
    use hhv_db::{AssumeYes, DbError, LoadBatch, LoadOptions};
    use hhv_storage::{read_identities, FetchError};
    use serde_json::{json, Value as JsonValue};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct CannedApi {
        vacancy_pages: Mutex<Vec<JsonValue>>,
    }

    #[async_trait]
    impl JsonSource for CannedApi {
        async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<JsonValue, FetchError> {
            if url.ends_with("/employers") {
                let page = query
                    .iter()
                    .find(|(k, _)| *k == "page")
                    .map(|(_, v)| v.as_str())
                    .unwrap_or("0");
                return Ok(json!({
                    "pages": 2,
                    "items": [{"id": format!("e{page}"), "name": format!("Employer {page}"), "open_vacancies": 1}]
                }));
            }
            let mut pages = self.vacancy_pages.lock().unwrap();
            if pages.is_empty() {
                return Err(FetchError::HttpStatus {
                    status: 500,
                    url: url.to_string(),
                });
            }
            Ok(pages.remove(0))
        }
    }

    fn config(dir: &std::path::Path) -> SyncConfig {
        SyncConfig {
            employers_url: "http://api.test/employers".into(),
            vacancies_url: "http://api.test/vacancies".into(),
            data_dir: dir.to_path_buf(),
            user_agent: "test".into(),
            http_timeout_secs: 1,
            db: DbConfig::default(),
        }
    }

    fn vacancy(id: &str) -> JsonValue {
        json!({"id": id, "name": format!("Vacancy {id}"), "salary": {"from": 100}})
    }

    fn pipeline(dir: &std::path::Path, vacancy_pages: Vec<JsonValue>) -> SyncPipeline {
        SyncPipeline::with_source(
            config(dir),
            Box::new(CannedApi {
                vacancy_pages: Mutex::new(vacancy_pages),
            }),
        )
    }

    #[tokio::test]
    async fn employer_snapshots_replace_and_vacancies_accumulate() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(
            dir.path(),
            vec![
                json!({"items": [vacancy("1"), vacancy("2")]}),
                json!({"items": [vacancy("2"), vacancy("3")]}),
            ],
        );

        let first = pipeline.fetch_employers("acme").await.unwrap();
        assert_eq!(first.fetched, 2);
        let second = pipeline.fetch_employers("acme").await.unwrap();
        assert_eq!(second.written, 2);
        let employer_ids = read_identities(dir.path().join(EMPLOYERS_CSV), EMPLOYER_HEADER[0]).unwrap();
        assert_eq!(employer_ids.len(), 2, "snapshot does not accumulate");

        let v1 = pipeline.fetch_vacancies("e0").await.unwrap();
        let v2 = pipeline.fetch_vacancies("e0").await.unwrap();
        assert_eq!((v1.written, v1.skipped), (2, 0));
        assert_eq!((v2.written, v2.skipped), (1, 1));
        let ids = read_identities(dir.path().join(VACANCIES_CSV), VACANCY_IDENTITY_FIELD).unwrap();
        assert_eq!(
            ids,
            ["1", "2", "3"].into_iter().map(String::from).collect::<HashSet<_>>()
        );
    }

    #[tokio::test]
    async fn failed_fetch_leaves_csv_untouched() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(dir.path(), vec![]);
        let err = pipeline.fetch_vacancies("e0").await.unwrap_err();
        assert!(format!("{err:#}").contains("http status 500"));
        assert!(!dir.path().join(VACANCIES_CSV).exists());
    }

    struct RecordingStore {
        batches: Mutex<Vec<LoadBatch>>,
    }

    #[async_trait]
    impl TableStore for RecordingStore {
        async fn table_exists(&self, _table: &str) -> Result<bool, DbError> {
            Ok(false)
        }

        async fn existing_identities(
            &self,
            _table: &str,
            _column: &str,
        ) -> Result<HashSet<String>, DbError> {
            Ok(HashSet::new())
        }

        async fn write_batch(&self, batch: &LoadBatch) -> Result<(), DbError> {
            self.batches.lock().unwrap().push(batch.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn load_table_reads_the_dataset_csv() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(dir.path(), vec![json!({"items": [vacancy("1")]})]);
        pipeline.fetch_vacancies("e0").await.unwrap();

        let store = RecordingStore {
            batches: Mutex::new(Vec::new()),
        };
        let outcome = pipeline
            .load_table(
                &TableLoader::new(LoadOptions::default()),
                &store,
                &AssumeYes,
                Dataset::Vacancies,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            LoadOutcome::Created {
                inserted: 1,
                skipped: 0
            }
        );
        let batches = store.batches.lock().unwrap();
        assert_eq!(batches[0].schema.table, VACANCIES_TABLE);
        assert_eq!(batches[0].rows[0][1], "1");
        assert_eq!(batches[0].rows[0][3], "100");
    }

    #[test]
    fn dataset_parses_case_insensitively() {
        assert_eq!("Employers".parse::<Dataset>(), Ok(Dataset::Employers));
        assert_eq!(" vacancies ".parse::<Dataset>(), Ok(Dataset::Vacancies));
        assert!("jobs".parse::<Dataset>().is_err());
    }

    #[test]
    fn report_renders_every_section() {
        let report = Report {
            companies: vec![CompanyVacancyCount {
                employer_id: Some("7".into()),
                name: Some("Acme".into()),
                website: None,
                vacancy_count: 2,
            }],
            total_vacancies: 2,
            average_salary: Some(55000),
            above_average: vec![VacancyRow {
                name: Some("Lead".into()),
                id: Some("2".into()),
                location: None,
                salary: Some("60000".into()),
                url: None,
                employer_id: Some("7".into()),
                employer_name: None,
                requirement: None,
                responsibility: None,
                experience: None,
            }],
        };
        let text = render_report(&report);
        assert!(text.contains("Company: Acme\nVacancies: 2"));
        assert!(text.contains("Total vacancies: 2"));
        assert!(text.contains("Average salary: 55000"));
        assert!(text.contains("Vacancy: Lead\nSalary: 60000"));

        let empty = Report {
            companies: vec![],
            total_vacancies: 0,
            average_salary: None,
            above_average: vec![],
        };
        assert!(render_report(&empty).contains("Average salary: n/a"));
    }
}
