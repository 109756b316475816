//! Google Sheets v4 REST client
//!
//! ## Endpoints
//!
//! - `GET /v4/spreadsheets/{id}?fields=...` - title, tab names, grid sizes
//! - `GET /v4/spreadsheets/{id}/values/{range}` - cell values (formatted strings)
//!
//! Authentication is either a bearer token (service account / OAuth) or an API
//! key for publicly readable sheets.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SheetClientError {
    #[error("Cannot access sheet. Please share with {service_account}")]
    NotAccessible { service_account: String },

    #[error("{0}")]
    NotFound(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetMetadata {
    pub title: String,
    pub sheets: Vec<String>,
}

/// Header row plus the first data rows as `{header: cell}` records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetPreview {
    pub headers: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
    pub total_rows: u64,
}

pub const MAX_PREVIEW_ROWS: usize = 50;

#[async_trait]
pub trait SheetClient: Send + Sync {
    /// `false` when the sheet is missing or not shared with us
    async fn check_access(&self, sheet_id: &str) -> Result<bool, SheetClientError>;

    async fn get_sheet_metadata(&self, sheet_id: &str) -> Result<SheetMetadata, SheetClientError>;

    async fn get_headers(
        &self,
        sheet_id: &str,
        sheet_name: &str,
        header_row: u32,
    ) -> Result<Vec<String>, SheetClientError>;

    /// Every row from `start_row` (1-based) to the end of the tab
    async fn get_sheet_values(
        &self,
        sheet_id: &str,
        sheet_name: &str,
        start_row: u64,
    ) -> Result<Vec<Vec<String>>, SheetClientError>;

    async fn get_preview(
        &self,
        sheet_id: &str,
        sheet_name: &str,
        header_row: u32,
        data_start_row: u32,
        num_rows: usize,
    ) -> Result<SheetPreview, SheetClientError>;
}

#[derive(Debug, Clone)]
pub enum SheetsAuth {
    BearerToken(String),
    ApiKey(String),
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetResponse {
    properties: SpreadsheetProperties,
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetProperties {
    title: String,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
    #[serde(rename = "gridProperties")]
    grid_properties: Option<GridProperties>,
}

#[derive(Debug, Deserialize)]
struct GridProperties {
    #[serde(rename = "rowCount", default)]
    row_count: u64,
}

pub struct GoogleSheetsClient {
    http: reqwest::Client,
    base_url: String,
    auth: Option<SheetsAuth>,
    service_account_email: String,
}

impl GoogleSheetsClient {
    pub fn new(
        base_url: &str,
        auth: Option<SheetsAuth>,
        service_account_email: &str,
    ) -> Result<Self, SheetClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            service_account_email: service_account_email.to_string(),
        })
    }

    pub fn from_config(config: &crate::config::SyncConfig) -> Result<Self, SheetClientError> {
        let auth = config
            .sheets_access_token
            .clone()
            .map(SheetsAuth::BearerToken)
            .or_else(|| config.sheets_api_key.clone().map(SheetsAuth::ApiKey));
        if auth.is_none() {
            log::warn!("⚠️  No Sheets credentials configured; only public sheets will be readable");
        }
        Self::new(&config.sheets_api_base_url, auth, &config.service_account_email)
    }

    fn spreadsheet_url(&self, sheet_id: &str, tail: &[&str]) -> Result<Url, SheetClientError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| SheetClientError::Api {
            status: 0,
            message: format!("invalid base url '{}': {}", self.base_url, e),
        })?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| SheetClientError::Api {
                status: 0,
                message: format!("base url '{}' cannot hold a path", self.base_url),
            })?;
            segments.pop_if_empty().extend(["v4", "spreadsheets", sheet_id]);
            segments.extend(tail);
        }
        Ok(url)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: Url,
        query: &[(&str, &str)],
        sheet_id: &str,
        sheet_name: Option<&str>,
    ) -> Result<T, SheetClientError> {
        let mut request = self.http.get(url).query(query);
        request = match &self.auth {
            Some(SheetsAuth::BearerToken(token)) => request.bearer_auth(token),
            Some(SheetsAuth::ApiKey(key)) => request.query(&[("key", key.as_str())]),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        Err(self.map_status(status, &body, sheet_id, sheet_name))
    }

    fn map_status(&self, status: StatusCode, body: &str, sheet_id: &str, sheet_name: Option<&str>) -> SheetClientError {
        match status {
            StatusCode::FORBIDDEN => SheetClientError::NotAccessible {
                service_account: self.service_account_email.clone(),
            },
            StatusCode::NOT_FOUND => SheetClientError::NotFound(format!("Sheet not found: {}", sheet_id)),
            StatusCode::BAD_REQUEST if body.contains("Unable to parse range") => {
                SheetClientError::NotFound(format!(
                    "Worksheet '{}' not found in sheet",
                    sheet_name.unwrap_or_default()
                ))
            }
            other => SheetClientError::Api {
                status: other.as_u16(),
                message: body.chars().take(500).collect(),
            },
        }
    }

    async fn get_range(
        &self,
        sheet_id: &str,
        sheet_name: &str,
        range: Option<&str>,
    ) -> Result<Vec<Vec<String>>, SheetClientError> {
        let a1 = match range {
            Some(range) => format!("{}!{}", quote_sheet_name(sheet_name), range),
            None => quote_sheet_name(sheet_name),
        };
        let url = self.spreadsheet_url(sheet_id, &["values", &a1])?;
        let body: ValueRange = self
            .get_json(url, &[("majorDimension", "ROWS")], sheet_id, Some(sheet_name))
            .await?;
        Ok(body.values.into_iter().map(stringify_row).collect())
    }

    async fn get_spreadsheet(&self, sheet_id: &str) -> Result<SpreadsheetResponse, SheetClientError> {
        let url = self.spreadsheet_url(sheet_id, &[])?;
        self.get_json(
            url,
            &[("fields", "properties.title,sheets.properties(title,gridProperties.rowCount)")],
            sheet_id,
            None,
        )
        .await
    }
}

/// `'Tab name'` with embedded quotes doubled
fn quote_sheet_name(name: &str) -> String {
    format!("'{}'", name.replace('\'', "''"))
}

fn stringify_row(row: Vec<Value>) -> Vec<String> {
    row.into_iter()
        .map(|cell| match cell {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect()
}

#[async_trait]
impl SheetClient for GoogleSheetsClient {
    async fn check_access(&self, sheet_id: &str) -> Result<bool, SheetClientError> {
        match self.get_spreadsheet(sheet_id).await {
            Ok(_) => Ok(true),
            Err(SheetClientError::NotAccessible { .. }) | Err(SheetClientError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_sheet_metadata(&self, sheet_id: &str) -> Result<SheetMetadata, SheetClientError> {
        let spreadsheet = self.get_spreadsheet(sheet_id).await?;
        Ok(SheetMetadata {
            title: spreadsheet.properties.title,
            sheets: spreadsheet
                .sheets
                .into_iter()
                .map(|entry| entry.properties.title)
                .collect(),
        })
    }

    async fn get_headers(
        &self,
        sheet_id: &str,
        sheet_name: &str,
        header_row: u32,
    ) -> Result<Vec<String>, SheetClientError> {
        let range = format!("{}:{}", header_row, header_row);
        let rows = self.get_range(sheet_id, sheet_name, Some(&range)).await?;
        Ok(rows.into_iter().next().unwrap_or_default())
    }

    async fn get_sheet_values(
        &self,
        sheet_id: &str,
        sheet_name: &str,
        start_row: u64,
    ) -> Result<Vec<Vec<String>>, SheetClientError> {
        let rows = self.get_range(sheet_id, sheet_name, None).await?;
        let skip = usize::try_from(start_row.saturating_sub(1)).unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(skip).collect())
    }

    async fn get_preview(
        &self,
        sheet_id: &str,
        sheet_name: &str,
        header_row: u32,
        data_start_row: u32,
        num_rows: usize,
    ) -> Result<SheetPreview, SheetClientError> {
        let num_rows = num_rows.min(MAX_PREVIEW_ROWS) as u64;

        let spreadsheet = self.get_spreadsheet(sheet_id).await?;
        let row_count = spreadsheet
            .sheets
            .iter()
            .find(|entry| entry.properties.title == sheet_name)
            .map(|entry| {
                entry
                    .properties
                    .grid_properties
                    .as_ref()
                    .map(|grid| grid.row_count)
                    .unwrap_or(0)
            })
            .ok_or_else(|| SheetClientError::NotFound(format!("Worksheet '{}' not found in sheet", sheet_name)))?;

        let headers = self.get_headers(sheet_id, sheet_name, header_row).await?;
        if headers.is_empty() {
            return Ok(SheetPreview {
                headers,
                rows: Vec::new(),
                total_rows: 0,
            });
        }

        let start = u64::from(data_start_row);
        let data_rows = if start <= row_count && num_rows > 0 {
            let end = (start + num_rows - 1).min(row_count);
            self.get_range(sheet_id, sheet_name, Some(&format!("{}:{}", start, end)))
                .await?
        } else {
            Vec::new()
        };

        let rows = data_rows
            .iter()
            .map(|row| crate::ingestion::column_mapper::get_raw_data(row, &headers))
            .collect();

        Ok(SheetPreview {
            headers,
            rows,
            total_rows: (row_count + 1).saturating_sub(start),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quote_sheet_name() {
        assert_eq!(quote_sheet_name("Orders"), "'Orders'");
        assert_eq!(quote_sheet_name("Bob's Sheet"), "'Bob''s Sheet'");
    }

    #[test]
    fn test_spreadsheet_url_encodes_ranges() {
        let client = GoogleSheetsClient::new("https://sheets.googleapis.com/", None, "svc@example.com").unwrap();
        let url = client
            .spreadsheet_url("abc123", &["values", "'Order Items'!2:2"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/abc123/values/'Order%20Items'!2:2"
        );
    }

    #[test]
    fn test_status_mapping() {
        let client = GoogleSheetsClient::new("https://sheets.googleapis.com", None, "svc@example.com").unwrap();

        let err = client.map_status(StatusCode::FORBIDDEN, "", "abc", None);
        assert_eq!(err.to_string(), "Cannot access sheet. Please share with svc@example.com");

        let err = client.map_status(StatusCode::NOT_FOUND, "", "abc", None);
        assert_eq!(err.to_string(), "Sheet not found: abc");

        let err = client.map_status(
            StatusCode::BAD_REQUEST,
            r#"{"error": {"message": "Unable to parse range: 'Nope'!1:1"}}"#,
            "abc",
            Some("Nope"),
        );
        assert!(matches!(err, SheetClientError::NotFound(ref m) if m == "Worksheet 'Nope' not found in sheet"));

        let err = client.map_status(StatusCode::TOO_MANY_REQUESTS, "quota", "abc", None);
        assert!(matches!(err, SheetClientError::Api { status: 429, .. }));
    }

    #[test]
    fn test_stringify_row() {
        let row = stringify_row(vec![json!("a"), json!(3), json!(null), json!(true)]);
        assert_eq!(row, vec!["a", "3", "", "true"]);
    }

    #[test]
    fn test_spreadsheet_response_parsing() {
        let body = json!({
            "properties": {"title": "Shop"},
            "sheets": [
                {"properties": {"title": "orders", "gridProperties": {"rowCount": 1000}}},
                {"properties": {"title": "products"}}
            ]
        });
        let parsed: SpreadsheetResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.properties.title, "Shop");
        assert_eq!(parsed.sheets[0].properties.grid_properties.as_ref().unwrap().row_count, 1000);
        assert!(parsed.sheets[1].properties.grid_properties.is_none());
    }
}
