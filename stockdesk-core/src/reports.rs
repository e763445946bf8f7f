//! Report library backed by a PostgREST-style document store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{NewReport, Report};

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Newest first.
    async fn list(&self) -> Result<Vec<Report>, ReportError>;

    async fn get(&self, id: Uuid) -> Result<Report, ReportError>;

    async fn insert(&self, report: NewReport) -> Result<Report, ReportError>;

    /// Case-insensitive match on title, description or stock symbol.
    async fn search(&self, query: &str) -> Result<Vec<Report>, ReportError>;

    async fn fetch_file(&self, url: &str) -> Result<Vec<u8>, ReportError>;
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Report not found: {0}")]
    NotFound(String),

    #[error("Missing API key")]
    MissingApiKey,
}

#[derive(Debug, Clone)]
pub struct RestReportConfig {
    pub api_key: String,
    pub base_url: String,
    pub table: String,
}

impl RestReportConfig {
    pub fn new(api_key: Option<String>, base_url: String, table: String) -> Self {
        let api_key = api_key
            .or_else(|| std::env::var("REPORTS_API_KEY").ok())
            .unwrap_or_default();
        Self {
            api_key,
            base_url,
            table,
        }
    }
}

#[derive(Clone)]
pub struct RestReportStore {
    client: Client,
    config: RestReportConfig,
}

/// Drop characters that carry meaning in a PostgREST filter expression.
fn sanitize_query(query: &str) -> String {
    query
        .chars()
        .filter(|c| !matches!(c, ',' | '(' | ')' | '*' | '%' | '"' | '\\'))
        .collect::<String>()
        .trim()
        .to_string()
}

impl RestReportStore {
    pub fn new(config: RestReportConfig) -> Result<Self, ReportError> {
        if config.api_key.is_empty() {
            return Err(ReportError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { client, config })
    }

    fn table_url(&self) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.table
        )
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
    }

    async fn send_checked(request: RequestBuilder) -> Result<reqwest::Response, ReportError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::error!(code = status.as_u16(), message = %message, "Report store error");
            return Err(ReportError::Api {
                code: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ReportStore for RestReportStore {
    async fn list(&self) -> Result<Vec<Report>, ReportError> {
        let request = self
            .authed(self.client.get(self.table_url()))
            .query(&[("select", "*"), ("order", "created_at.desc")]);
        Ok(Self::send_checked(request).await?.json().await?)
    }

    async fn get(&self, id: Uuid) -> Result<Report, ReportError> {
        let filter = format!("eq.{}", id);
        let request = self
            .authed(self.client.get(self.table_url()))
            .query(&[("select", "*"), ("id", filter.as_str())]);
        let mut rows: Vec<Report> = Self::send_checked(request).await?.json().await?;
        rows.pop().ok_or_else(|| ReportError::NotFound(id.to_string()))
    }

    async fn insert(&self, report: NewReport) -> Result<Report, ReportError> {
        let request = self
            .authed(self.client.post(self.table_url()))
            .header("Prefer", "return=representation")
            .json(&[&report]);
        let mut rows: Vec<Report> = Self::send_checked(request).await?.json().await?;
        let inserted = rows
            .pop()
            .ok_or_else(|| ReportError::NotFound(report.title.clone()))?;
        tracing::info!(id = %inserted.id, title = %inserted.title, "Report inserted");
        Ok(inserted)
    }

    async fn search(&self, query: &str) -> Result<Vec<Report>, ReportError> {
        let term = sanitize_query(query);
        if term.is_empty() {
            return self.list().await;
        }
        let filter = format!(
            "(title.ilike.*{t}*,description.ilike.*{t}*,stock_symbol.ilike.*{t}*)",
            t = term
        );
        let request = self.authed(self.client.get(self.table_url())).query(&[
            ("select", "*"),
            ("or", filter.as_str()),
            ("order", "created_at.desc"),
        ]);
        Ok(Self::send_checked(request).await?.json().await?)
    }

    async fn fetch_file(&self, url: &str) -> Result<Vec<u8>, ReportError> {
        let request = self.authed(self.client.get(url));
        let bytes = Self::send_checked(request).await?.bytes().await?;
        tracing::debug!(url = %url, bytes = bytes.len(), "Fetched report file");
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(base_url: String) -> RestReportStore {
        RestReportStore::new(RestReportConfig {
            api_key: "anon-key".to_string(),
            base_url,
            table: "reports".to_string(),
        })
        .unwrap()
    }

    fn report_json(title: &str, symbol: &str) -> serde_json::Value {
        json!({
            "id": uuid::Uuid::new_v4(),
            "title": title,
            "description": "Quarterly results",
            "stock_symbol": symbol,
            "report_type": "earnings",
            "file_url": format!("https://files.example.com/{}.pdf", symbol),
            "created_at": "2024-05-01T10:00:00.123456+00:00"
        })
    }

    #[test]
    fn test_sanitize_query() {
        assert_eq!(sanitize_query(" apple,(inc)* "), "appleinc");
        assert_eq!(sanitize_query("***"), "");
    }

    #[tokio::test]
    async fn test_list_orders_newest_first() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/reports"))
            .and(query_param("order", "created_at.desc"))
            .and(header("apikey", "anon-key"))
            .and(header("authorization", "Bearer anon-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                report_json("Apple Q2", "AAPL"),
                report_json("Tesla Q1", "TSLA"),
            ])))
            .mount(&mock_server)
            .await;

        let reports = store(mock_server.uri()).list().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].stock_symbol.as_deref(), Some("AAPL"));
    }

    #[tokio::test]
    async fn test_get_by_id() {
        let mock_server = MockServer::start().await;
        let id = uuid::Uuid::new_v4();
        let mut row = report_json("Apple Q2", "AAPL");
        row["id"] = json!(id);

        Mock::given(method("GET"))
            .and(path("/rest/v1/reports"))
            .and(query_param("id", format!("eq.{}", id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([row])))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/reports"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&mock_server)
            .await;

        let s = store(mock_server.uri());
        assert_eq!(s.get(id).await.unwrap().id, id);
        let err = s.get(uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ReportError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_search_builds_ilike_filter() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/reports"))
            .and(query_param(
                "or",
                "(title.ilike.*apple*,description.ilike.*apple*,stock_symbol.ilike.*apple*)",
            ))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([report_json("Apple Q2", "AAPL")])),
            )
            .mount(&mock_server)
            .await;

        let reports = store(mock_server.uri()).search("apple").await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].title, "Apple Q2");
    }

    #[tokio::test]
    async fn test_insert_returns_representation() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/reports"))
            .and(header("prefer", "return=representation"))
            .and(body_partial_json(json!([{ "title": "Nvidia FY24", "stock_symbol": "NVDA" }])))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!([report_json("Nvidia FY24", "NVDA")])),
            )
            .mount(&mock_server)
            .await;

        let inserted = store(mock_server.uri())
            .insert(NewReport {
                title: "Nvidia FY24".to_string(),
                description: None,
                stock_symbol: Some("NVDA".to_string()),
                report_type: Some("annual".to_string()),
                file_url: "https://files.example.com/NVDA.pdf".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(inserted.title, "Nvidia FY24");
    }

    #[tokio::test]
    async fn test_fetch_file_and_errors() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/a.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.7".to_vec()))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/missing.pdf"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&mock_server)
            .await;

        let s = store(mock_server.uri());
        let bytes = s
            .fetch_file(&format!("{}/files/a.pdf", mock_server.uri()))
            .await
            .unwrap();
        assert_eq!(bytes, b"%PDF-1.7");

        let err = s
            .fetch_file(&format!("{}/files/missing.pdf", mock_server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::Api { code: 404, .. }));
    }
}
