//! HTTP JSON fetching and CSV persistence for HHV.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use hhv_core::CsvRow;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, info_span, Instrument};

pub const CRATE_NAME: &str = "hhv-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_transport(&self) -> bool {
        matches!(self, FetchError::Transport(_) | FetchError::HttpStatus { .. })
    }
}

/// Anything that can answer a GET with a JSON document.
#[async_trait]
pub trait JsonSource: Send + Sync {
    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<JsonValue, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl JsonSource for HttpFetcher {
    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", url);
        async move {
            let resp = self.client.get(url).query(query).send().await?;
            let status: StatusCode = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?;
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkReport {
    pub path: PathBuf,
    pub written: usize,
    pub skipped: usize,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("identity field {field:?} is not part of the header")]
    UnknownField { field: String },
    #[error("{} has no {field:?} column", .path.display())]
    MissingIdentityColumn { path: PathBuf, field: String },
    #[error("{} has header {found:?}, expected {expected:?}", .path.display())]
    HeaderMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SinkError + '_ {
    move |source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), SinkError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    Ok(())
}

fn has_content(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Replace the file with a header plus `rows`. Earlier contents are discarded.
pub fn write_snapshot<R: CsvRow>(rows: &[R], path: impl AsRef<Path>) -> Result<SinkReport, SinkError> {
    let path = path.as_ref();
    ensure_parent_dir(path)?;

    let file = File::create(path).map_err(io_err(path))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.write_record(R::HEADER)?;
    for row in rows {
        writer.write_record(&row.values())?;
    }
    writer.flush().map_err(io_err(path))?;

    info!(path = %path.display(), rows = rows.len(), "wrote csv snapshot");
    Ok(SinkReport {
        path: path.to_path_buf(),
        written: rows.len(),
        skipped: 0,
    })
}

/// Append the rows whose `identity_field` value is not already present in the
/// file (or earlier in `rows`). Writes the header when the file is new.
///
/// An existing file must carry exactly `R::HEADER`; rows are written in that
/// column order.
pub fn append_unique<R: CsvRow>(
    rows: &[R],
    path: impl AsRef<Path>,
    identity_field: &str,
) -> Result<SinkReport, SinkError> {
    let path = path.as_ref();
    let idx = R::HEADER
        .iter()
        .position(|h| *h == identity_field)
        .ok_or_else(|| SinkError::UnknownField {
            field: identity_field.to_string(),
        })?;
    ensure_parent_dir(path)?;

    let existed = has_content(path);
    let mut known = if existed {
        check_header(path, R::HEADER)?;
        read_identities(path, identity_field)?
    } else {
        HashSet::new()
    };

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(io_err(path))?;
    if existed && !ends_with_newline(&mut file).map_err(io_err(path))? {
        file.write_all(b"\n").map_err(io_err(path))?;
    }
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if !existed {
        writer.write_record(R::HEADER)?;
    }

    let mut written = 0usize;
    let mut skipped = 0usize;
    for row in rows {
        let values = row.values();
        if known.insert(values[idx].clone()) {
            writer.write_record(&values)?;
            written += 1;
        } else {
            skipped += 1;
        }
    }
    writer.flush().map_err(io_err(path))?;

    info!(path = %path.display(), written, skipped, "appended csv rows");
    Ok(SinkReport {
        path: path.to_path_buf(),
        written,
        skipped,
    })
}

fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(matches!(last[0], b'\n' | b'\r'))
}

fn check_header(path: &Path, expected: &[&str]) -> Result<(), SinkError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let found = reader
        .headers()?
        .iter()
        .map(String::from)
        .collect::<Vec<_>>();
    if found != expected {
        return Err(SinkError::HeaderMismatch {
            path: path.to_path_buf(),
            expected: expected.iter().map(|h| h.to_string()).collect(),
            found,
        });
    }
    Ok(())
}

/// Collect every value of `identity_field` from an existing CSV file.
pub fn read_identities(path: impl AsRef<Path>, identity_field: &str) -> Result<HashSet<String>, SinkError> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let idx = reader
        .headers()?
        .iter()
        .position(|h| h == identity_field)
        .ok_or_else(|| SinkError::MissingIdentityColumn {
            path: path.to_path_buf(),
            field: identity_field.to_string(),
        })?;

    let mut out = HashSet::new();
    for record in reader.records() {
        let record = record?;
        if let Some(value) = record.get(idx) {
            out.insert(value.to_string());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hhv_core::{Employer, Vacancy, EMPLOYER_HEADER, VACANCY_HEADER, VACANCY_IDENTITY_FIELD};
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn vacancy(id: &str, name: &str) -> Vacancy {
        Vacancy {
            id: id.to_string(),
            name: Some(name.to_string()),
            salary: Some(1000.0),
            ..Default::default()
        }
    }

    fn employer(id: &str) -> Employer {
        Employer {
            employer_id: Some(id.to_string()),
            name: Some(format!("Employer {id}")),
            website: None,
            count_open_vacancies: Some(1),
        }
    }

    fn read_rows(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
        let mut reader = csv::Reader::from_path(path).unwrap();
        let header = reader.headers().unwrap().iter().map(String::from).collect();
        let rows = reader
            .records()
            .map(|r| r.unwrap().iter().map(String::from).collect())
            .collect();
        (header, rows)
    }

    #[test]
    fn append_unique_deduplicates_within_one_call() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data_vacancies.csv");
        let rows = vec![
            vacancy("A", "first"),
            vacancy("B", "second"),
            vacancy("A", "duplicate"),
            vacancy("C", "third"),
        ];

        let report = append_unique(&rows, &path, VACANCY_IDENTITY_FIELD).expect("append");
        assert_eq!(report.written, 3);
        assert_eq!(report.skipped, 1);

        let (header, body) = read_rows(&path);
        assert_eq!(header, VACANCY_HEADER);
        assert_eq!(body.len(), 3);
        let ids = read_identities(&path, VACANCY_IDENTITY_FIELD).unwrap();
        assert_eq!(
            ids,
            ["A", "B", "C"].into_iter().map(String::from).collect::<HashSet<_>>()
        );
        let first = body.iter().find(|r| r[1] == "A").unwrap();
        assert_eq!(first[0], "first");
    }

    #[test]
    fn append_unique_skips_identities_already_on_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("data_vacancies.csv");

        append_unique(&[vacancy("1", "one"), vacancy("2", "two")], &path, VACANCY_IDENTITY_FIELD)
            .expect("first append");
        let report = append_unique(
            &[vacancy("2", "two again"), vacancy("3", "three")],
            &path,
            VACANCY_IDENTITY_FIELD,
        )
        .expect("second append");

        assert_eq!(report.written, 1);
        assert_eq!(report.skipped, 1);
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("vacancy name").count(), 1, "header written once");
        let (_, body) = read_rows(&path);
        let ids = body.iter().map(|r| r[1].as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn append_starts_a_new_line_after_unterminated_last_record() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data_vacancies.csv");
        fs::write(&path, format!("{}\nold,1,,,,,,,,", VACANCY_HEADER.join(","))).unwrap();

        let report = append_unique(&[vacancy("2", "new")], &path, VACANCY_IDENTITY_FIELD).unwrap();
        assert_eq!(report.written, 1);

        let ids = read_identities(&path, VACANCY_IDENTITY_FIELD).unwrap();
        assert_eq!(
            ids,
            ["1", "2"].into_iter().map(String::from).collect::<HashSet<_>>()
        );
        let (_, body) = read_rows(&path);
        assert_eq!(body[0][0], "old");
        assert_eq!(body[0].len(), VACANCY_HEADER.len());
        assert_eq!(body[1][0], "new");
    }

    #[test]
    fn append_rejects_file_with_reordered_header() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data_vacancies.csv");
        let mut header = VACANCY_HEADER.to_vec();
        header.swap(0, 1);
        let original = format!("{}\n1,old,,,,,,,,\n", header.join(","));
        fs::write(&path, &original).unwrap();

        let err = append_unique(&[vacancy("2", "new")], &path, VACANCY_IDENTITY_FIELD).unwrap_err();
        assert!(matches!(err, SinkError::HeaderMismatch { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn append_unique_rejects_unknown_identity_field() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("v.csv");
        let err = append_unique(&[vacancy("1", "one")], &path, "nope").unwrap_err();
        assert!(matches!(err, SinkError::UnknownField { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn snapshot_replaces_previous_contents() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data_employers.csv");

        write_snapshot(&[employer("1"), employer("2")], &path).expect("first snapshot");
        let report = write_snapshot(&[employer("3")], &path).expect("second snapshot");
        assert_eq!(report.written, 1);

        let (header, body) = read_rows(&path);
        assert_eq!(header, EMPLOYER_HEADER);
        assert_eq!(body, vec![vec!["3", "Employer 3", "", "1"]]);
    }

    #[test]
    fn values_with_commas_and_quotes_survive() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("v.csv");
        let mut row = vacancy("9", "Lead, \"Platform\"");
        row.requirement = Some("line one\nline two".into());
        append_unique(&[row], &path, VACANCY_IDENTITY_FIELD).unwrap();

        let (_, body) = read_rows(&path);
        assert_eq!(body[0][0], "Lead, \"Platform\"");
        assert_eq!(body[0][7], "line one\nline two");
    }

    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/employers")
    }

    #[tokio::test]
    async fn get_json_decodes_successful_body() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 13\r\nConnection: close\r\n\r\n{\"items\": []}",
        )
        .await;
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let value = http.get_json(&url, &[("page", "0".to_string())]).await.unwrap();
        assert_eq!(value["items"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn get_json_maps_error_status_to_transport_error() {
        let url = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = http.get_json(&url, &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn get_json_reports_decode_errors() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 9\r\nConnection: close\r\n\r\nnot json!",
        )
        .await;
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = http.get_json(&url, &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
        assert!(!err.is_transport());
    }
}
