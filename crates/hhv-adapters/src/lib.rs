//! Job-search API adapters: paginated fetching and record normalization.

use hhv_core::{Employer, Vacancy};
use hhv_storage::{FetchError, JsonSource};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "hhv-adapters";

pub const DEFAULT_EMPLOYERS_URL: &str = "https://api.hh.ru/employers";
pub const DEFAULT_VACANCIES_URL: &str = "https://api.hh.ru/vacancies";
pub const PER_PAGE: u32 = 100;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("vacancy item has no id")]
    MissingIdentity,
}

/// Employer search over the paginated `/employers` endpoint.
#[derive(Debug, Clone)]
pub struct EmployerSearch {
    url: String,
}

impl Default for EmployerSearch {
    fn default() -> Self {
        Self::new(DEFAULT_EMPLOYERS_URL)
    }
}

impl EmployerSearch {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Fetch every page of employers matching `query_text` that have open
    /// vacancies. Stops once the server-reported page count is reached, or
    /// after the first page when the response carries no `pages` field.
    pub async fn fetch_all(
        &self,
        http: &dyn JsonSource,
        query_text: &str,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        info!(query = query_text, "searching employers");
        let mut items = Vec::new();
        let mut page: u64 = 0;

        loop {
            let params = [
                ("text", query_text.to_string()),
                ("only_with_vacancies", "true".to_string()),
                ("page", page.to_string()),
                ("per_page", PER_PAGE.to_string()),
            ];
            let mut data = http.get_json(&self.url, &params).await.map_err(|err| {
                error!(error = %err, page, "employer search request failed");
                err
            })?;

            if let Some(JsonValue::Array(batch)) = data.get_mut("items").map(JsonValue::take) {
                items.extend(batch);
            }

            match data.get("pages").and_then(JsonValue::as_u64) {
                Some(total_pages) if page + 1 < total_pages => page += 1,
                _ => break,
            }
        }

        info!(employers = items.len(), pages = page + 1, "employer search finished");
        Ok(items)
    }
}

/// Single-request vacancy listing for one employer.
#[derive(Debug, Clone)]
pub struct VacancySearch {
    url: String,
}

impl Default for VacancySearch {
    fn default() -> Self {
        Self::new(DEFAULT_VACANCIES_URL)
    }
}

impl VacancySearch {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub async fn fetch_for_owner(
        &self,
        http: &dyn JsonSource,
        owner_id: &str,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        info!(employer_id = owner_id, "fetching vacancies");
        let mut data = http
            .get_json(&self.url, &[("employer_id", owner_id.to_string())])
            .await
            .map_err(|err| {
                error!(error = %err, employer_id = owner_id, "vacancy request failed");
                err
            })?;

        match data.get_mut("items").map(JsonValue::take) {
            Some(JsonValue::Array(items)) => Ok(items),
            _ => Ok(Vec::new()),
        }
    }
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

/// Strings verbatim, numbers in decimal form, anything else is null.
fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_at(value, path)?.as_f64()
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    json_at(value, path)?.as_i64()
}

/// `salary.from` when present and non-zero, otherwise `salary.to`.
///
/// A zero lower bound counts as missing, so `{from: 0, to: 5000}` yields 5000.
pub fn resolve_salary(item: &JsonValue) -> Option<f64> {
    json_f64(item, &["salary", "from"])
        .filter(|from| *from != 0.0)
        .or_else(|| json_f64(item, &["salary", "to"]))
}

pub fn normalize_employer(item: &JsonValue) -> Employer {
    Employer {
        employer_id: json_text(item, &["id"]),
        name: json_text(item, &["name"]),
        website: json_text(item, &["alternate_url"]),
        count_open_vacancies: json_i64(item, &["open_vacancies"]),
    }
}

pub fn normalize_vacancy(item: &JsonValue) -> Result<Vacancy, AdapterError> {
    let id = json_text(item, &["id"]).ok_or(AdapterError::MissingIdentity)?;
    Ok(Vacancy {
        name: json_text(item, &["name"]),
        id,
        location: json_text(item, &["area", "name"]),
        salary: resolve_salary(item),
        url: json_text(item, &["alternate_url"]),
        employer_id: json_text(item, &["employer", "id"]),
        employer_name: json_text(item, &["employer", "name"]),
        requirement: json_text(item, &["snippet", "requirement"]),
        responsibility: json_text(item, &["snippet", "responsibility"]),
        experience: json_text(item, &["experience", "name"]),
    })
}

pub fn normalize_employers(items: &[JsonValue]) -> Vec<Employer> {
    items.iter().map(normalize_employer).collect()
}

/// Normalize a batch, dropping items that carry no vacancy id.
pub fn normalize_vacancies(items: &[JsonValue]) -> Vec<Vacancy> {
    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| match normalize_vacancy(item) {
            Ok(vacancy) => Some(vacancy),
            Err(err) => {
                warn!(index, error = %err, "skipping vacancy item");
                None
            }
        })
        .collect()
}
