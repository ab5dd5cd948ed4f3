use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::debug;

use fitstat_core::remote::{RemoteError, RemoteStore, RemoteTable, RowQuery};

/// Remote tabular API spoken over HTTP, PostgREST style.
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "fitstat-cli/{} (health tracker)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn table_url(&self, table: RemoteTable) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.name())
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key).header("apikey", key),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), body = %body, "remote request failed");
        Err(status_error(status, &body))
    }

    async fn rows(response: reqwest::Response) -> Result<Vec<Value>, RemoteError> {
        response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

/// Gateway failures mean the backend is out of reach, not that it refused.
fn status_error(status: StatusCode, body: &str) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized,
        StatusCode::CONFLICT => RemoteError::Conflict,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            RemoteError::Unreachable(format!("gateway returned {status}"))
        }
        _ => RemoteError::Rejected {
            status: status.as_u16(),
            message: error_message(body),
        },
    }
}

/// Pull the `error` or `message` field out of a JSON error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn ping(&self) -> Result<(), RemoteError> {
        let url = format!("{}/health", self.base_url);
        match self.send(self.request(Method::GET, &url)).await {
            Ok(_) => Ok(()),
            // any answer short of a gateway failure proves the server is there
            Err(RemoteError::Unreachable(msg)) => Err(RemoteError::Unreachable(msg)),
            Err(_) => Ok(()),
        }
    }

    async fn select(&self, table: RemoteTable, query: &RowQuery) -> Result<Vec<Value>, RemoteError> {
        let builder = self
            .request(Method::GET, &self.table_url(table))
            .query(&query.to_query_pairs());
        Self::rows(self.send(builder).await?).await
    }

    async fn insert(&self, table: RemoteTable, row: Value) -> Result<Value, RemoteError> {
        let builder = self
            .request(Method::POST, &self.table_url(table))
            .header("prefer", "return=representation")
            .json(&row);
        let mut rows = Self::rows(self.send(builder).await?).await?;
        if rows.is_empty() {
            return Err(RemoteError::Decode("insert returned no row".to_string()));
        }
        Ok(rows.swap_remove(0))
    }

    async fn upsert(&self, table: RemoteTable, rows: Vec<Value>) -> Result<(), RemoteError> {
        let builder = self
            .request(Method::POST, &self.table_url(table))
            .query(&[("on_conflict", table.conflict_columns().join(","))])
            .header("prefer", "resolution=merge-duplicates,return=minimal")
            .json(&rows);
        self.send(builder).await?;
        Ok(())
    }

    async fn update(
        &self,
        table: RemoteTable,
        query: &RowQuery,
        patch: Value,
    ) -> Result<Vec<Value>, RemoteError> {
        let builder = self
            .request(Method::PATCH, &self.table_url(table))
            .query(&query.to_query_pairs())
            .header("prefer", "return=representation")
            .json(&patch);
        Self::rows(self.send(builder).await?).await
    }

    async fn delete(&self, table: RemoteTable, query: &RowQuery) -> Result<Vec<Value>, RemoteError> {
        let builder = self
            .request(Method::DELETE, &self.table_url(table))
            .query(&query.to_query_pairs())
            .header("prefer", "return=representation");
        Self::rows(self.send(builder).await?).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use fitstat_core::clock::FixedClock;
    use fitstat_core::models::{StrengthSet, parse_date, parse_timestamp};
    use fitstat_core::remote::RemoteClient;
    use fitstat_core::tables::TableStore;

    async fn serve(api_key: Option<&str>) -> String {
        let tables = Arc::new(Mutex::new(TableStore::open_in_memory().unwrap()));
        let clock = Arc::new(FixedClock::new(
            parse_timestamp("2026-01-05T12:00:00Z").unwrap(),
        ));
        let app = crate::server::app(tables, clock, api_key.map(str::to_string));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn set(id: &str, date: &str, updated_at: &str) -> StrengthSet {
        StrengthSet {
            id: id.to_string(),
            user_id: "u1".to_string(),
            date: parse_date(date).unwrap(),
            muscle_group: "back".to_string(),
            exercise: "Row".to_string(),
            planned_sets: 4,
            planned_reps: 10,
            actual_reps: vec![10, 10, 9, 8],
            rir: Some(1),
            tempo: None,
            avg_hr: Some(120),
            estimated_calories: None,
            notes: None,
            updated_at: parse_timestamp(updated_at).unwrap(),
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, ""),
            RemoteError::Unauthorized
        ));
        assert!(matches!(
            status_error(StatusCode::CONFLICT, ""),
            RemoteError::Conflict
        ));
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "").is_connectivity());
        match status_error(StatusCode::BAD_REQUEST, r#"{"error":"Invalid column"}"#) {
            RemoteError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Invalid column");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_message_falls_back_to_body() {
        assert_eq!(error_message("plain failure\n"), "plain failure");
        assert_eq!(error_message(r#"{"message":"nope"}"#), "nope");
    }

    #[tokio::test]
    async fn test_round_trip_through_server() {
        let url = serve(Some("k3y")).await;
        let client = RemoteClient::new(Arc::new(
            HttpRemote::new(&url, Some("k3y".to_string())).unwrap(),
        ));
        client.ping().await.unwrap();

        let sets = client.table::<StrengthSet>();
        sets.upsert_batch(&[
            set("s1", "2026-01-04", "2026-01-04T08:00:00Z"),
            set("s2", "2026-01-05", "2026-01-05T08:00:00Z"),
        ])
        .await
        .unwrap();

        let since = parse_timestamp("2026-01-05T00:00:00Z").unwrap();
        let delta = sets.get_since("u1", &since).await.unwrap();
        assert_eq!(delta, vec![set("s2", "2026-01-05", "2026-01-05T08:00:00Z")]);

        let created = sets
            .create(&set("s3", "2026-01-06", "2026-01-06T08:00:00Z"))
            .await
            .unwrap();
        assert_eq!(created.id, "s3");
        assert!(matches!(
            sets.create(&created).await,
            Err(RemoteError::Conflict)
        ));

        assert!(sets.delete("u1", "s1").await.unwrap());
        assert_eq!(sets.get_all("u1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_wrong_key_is_unauthorized_but_reachable() {
        let url = serve(Some("k3y")).await;
        let remote = HttpRemote::new(&url, Some("wrong".to_string())).unwrap();
        remote.ping().await.unwrap();

        let err = remote
            .select(RemoteTable::StrengthLogs, &RowQuery::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Unauthorized));
        assert!(!err.is_connectivity());
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let remote = HttpRemote::new(&format!("http://{addr}"), None).unwrap();
        let err = remote.ping().await.unwrap_err();
        assert!(err.is_connectivity());
    }
}
