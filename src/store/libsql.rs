//! Durable rate limit store on libSQL (Turso), over the HTTP pipeline API.
//!
//! Every operation is one `POST {url}/v2/pipeline` carrying a batch of
//! statements and a trailing `close`, so no stream state (baton) is kept
//! between calls.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use super::{RateLimitStore, StoreError};
use crate::ratelimit::{Decision, RateLimitPolicy, RateLimitRecord};

/// Rate limit records in a libSQL table.
pub struct LibsqlStore {
    client: reqwest::Client,
    pipeline_url: String,
    auth_token: String,
    table: String,
}

impl LibsqlStore {
    /// Create a store for the database at `url`.
    ///
    /// `libsql://` URLs are rewritten to `https://`, as the HTTP API expects.
    pub fn new(
        url: &str,
        auth_token: &str,
        table: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            pipeline_url: format!("{}/v2/pipeline", http_base_url(url)),
            auth_token: auth_token.to_string(),
            table: table.to_string(),
        })
    }

    /// Create the records table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.execute(vec![Stmt::new(schema_sql(&self.table), vec![])])
            .await?;
        Ok(())
    }

    /// Run `stmts` in order on one stream and return each statement's result.
    async fn execute(&self, stmts: Vec<Stmt>) -> Result<Vec<StmtResult>, StoreError> {
        let count = stmts.len();
        let mut requests: Vec<PipelineRequest> =
            stmts.into_iter().map(|stmt| PipelineRequest::Execute { stmt }).collect();
        requests.push(PipelineRequest::Close);

        let response = self
            .client
            .post(&self.pipeline_url)
            .bearer_auth(&self.auth_token)
            .json(&PipelineBody { baton: None, requests })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: PipelineResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        trace!(statements = count, results = body.results.len(), "Pipeline executed");

        body.results
            .into_iter()
            .take(count)
            .map(|result| match result {
                PipelineResult::Ok { response } => match response {
                    StreamResponse::Execute { result } => Ok(result),
                    StreamResponse::Close {} => {
                        Err(StoreError::Decode("close result in place of execute".to_string()))
                    }
                },
                PipelineResult::Error { error } => Err(StoreError::Backend(error.message)),
            })
            .collect()
    }
}

#[async_trait]
impl RateLimitStore for LibsqlStore {
    fn backend(&self) -> &'static str {
        "libsql"
    }

    async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>, StoreError> {
        let stmt = Stmt::new(select_sql(&self.table), vec![Arg::text(key)]);
        let mut results = self.execute(vec![stmt]).await?;
        let result = results
            .pop()
            .ok_or_else(|| StoreError::Decode("missing select result".to_string()))?;
        result.first_record()
    }

    async fn put(&self, key: &str, record: RateLimitRecord) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (ip, count, window_start) VALUES (?, ?, ?)",
            self.table
        );
        let args = vec![
            Arg::text(key),
            Arg::integer(record.count as i64),
            Arg::integer(record.window_start),
        ];
        self.execute(vec![Stmt::new(sql, args)]).await?;
        Ok(())
    }

    /// Compare-window-and-increment as one conditional upsert.
    ///
    /// The upsert only touches the row when the window has expired or the
    /// count is under the limit, and returns the row it wrote. No returned
    /// row means the request is over the limit; the follow-up select in the
    /// same pipeline supplies the window start for `retryAfter`.
    async fn hit(
        &self,
        key: &str,
        now: i64,
        policy: &RateLimitPolicy,
    ) -> Result<Decision, StoreError> {
        let upsert = hit_sql(&self.table);
        let select = select_sql(&self.table);

        let upsert_args = vec![
            Arg::text(key),
            Arg::integer(now),
            Arg::integer(policy.window_millis()),
            Arg::integer(i64::try_from(policy.limit).unwrap_or(i64::MAX)),
        ];

        let mut results = self
            .execute(vec![
                Stmt::new(upsert, upsert_args),
                Stmt::new(select, vec![Arg::text(key)]),
            ])
            .await?;

        if results.len() != 2 {
            return Err(StoreError::Decode(format!(
                "expected 2 results, got {}",
                results.len()
            )));
        }
        let current = results.pop().map(|r| r.first_record()).transpose()?.flatten();
        let written = results.pop().map(|r| r.first_record()).transpose()?.flatten();

        match (written, current) {
            (Some(next), _) => Ok(Decision::allowed(next)),
            (None, Some(record)) => {
                debug!(key = %key, count = record.count, "Conditional upsert skipped, over limit");
                Ok(Decision::denied(record, policy.retry_after_secs(&record, now)))
            }
            (None, None) => Err(StoreError::Decode(
                "upsert wrote nothing and no record exists".to_string(),
            )),
        }
    }

    async fn purge_expired(&self, now: i64, window: Duration) -> Result<u64, StoreError> {
        let sql = format!("DELETE FROM {} WHERE ? - window_start >= ?", self.table);
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let mut results = self
            .execute(vec![Stmt::new(sql, vec![Arg::integer(now), Arg::integer(window_ms)])])
            .await?;
        Ok(results.pop().map(|r| r.affected_row_count).unwrap_or(0))
    }
}

fn schema_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} \
         (ip TEXT PRIMARY KEY, count INTEGER NOT NULL, window_start INTEGER NOT NULL)",
        table
    )
}

fn select_sql(table: &str) -> String {
    format!("SELECT count, window_start FROM {} WHERE ip = ?", table)
}

/// Conditional upsert behind [`LibsqlStore::hit`].
///
/// Arguments: `?1` key, `?2` now, `?3` window in ms, `?4` limit. Returns the
/// written row, or nothing when the key is at the limit inside its window.
fn hit_sql(table: &str) -> String {
    format!(
        "INSERT INTO {t} (ip, count, window_start) VALUES (?1, 1, ?2) \
         ON CONFLICT(ip) DO UPDATE SET \
         count = CASE WHEN ?2 - {t}.window_start >= ?3 THEN 1 ELSE {t}.count + 1 END, \
         window_start = CASE WHEN ?2 - {t}.window_start >= ?3 THEN ?2 ELSE {t}.window_start END \
         WHERE ?2 - {t}.window_start >= ?3 OR {t}.count < ?4 \
         RETURNING count, window_start",
        t = table
    )
}

/// Map a libSQL database URL onto the HTTP endpoint serving it.
fn http_base_url(url: &str) -> String {
    let url = url.trim_end_matches('/');
    match url.strip_prefix("libsql://") {
        Some(rest) => format!("https://{}", rest),
        None => url.to_string(),
    }
}

#[derive(Debug, Serialize)]
struct PipelineBody {
    baton: Option<String>,
    requests: Vec<PipelineRequest>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum PipelineRequest {
    Execute { stmt: Stmt },
    Close,
}

#[derive(Debug, Serialize)]
struct Stmt {
    sql: String,
    args: Vec<Arg>,
}

impl Stmt {
    fn new(sql: String, args: Vec<Arg>) -> Self {
        Self { sql, args }
    }
}

/// A statement argument. Integers travel as strings to keep 64-bit precision.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Arg {
    Text { value: String },
    Integer { value: String },
}

impl Arg {
    fn text(value: &str) -> Self {
        Arg::Text {
            value: value.to_string(),
        }
    }

    fn integer(value: i64) -> Self {
        Arg::Integer {
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PipelineResponse {
    results: Vec<PipelineResult>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum PipelineResult {
    Ok { response: StreamResponse },
    Error { error: PipelineError },
}

#[derive(Debug, Deserialize)]
struct PipelineError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StreamResponse {
    Execute { result: StmtResult },
    Close {},
}

#[derive(Debug, Deserialize)]
struct StmtResult {
    #[serde(default)]
    rows: Vec<Vec<Value>>,
    #[serde(default)]
    affected_row_count: u64,
}

impl StmtResult {
    /// Read the first row as `(count, window_start)`.
    fn first_record(&self) -> Result<Option<RateLimitRecord>, StoreError> {
        let Some(row) = self.rows.first() else {
            return Ok(None);
        };
        if row.len() < 2 {
            return Err(StoreError::Decode(format!("expected 2 columns, got {}", row.len())));
        }
        let count = integer_value(&row[0])?;
        let window_start = integer_value(&row[1])?;
        Ok(Some(RateLimitRecord {
            count: u64::try_from(count).unwrap_or(0),
            window_start,
        }))
    }
}

/// Decode an integer cell, which the protocol sends as `{"type":"integer","value":"42"}`.
fn integer_value(cell: &Value) -> Result<i64, StoreError> {
    let value = cell
        .get("value")
        .ok_or_else(|| StoreError::Decode(format!("cell without value: {}", cell)))?;

    match value {
        Value::String(s) => s
            .parse()
            .map_err(|_| StoreError::Decode(format!("not an integer: {}", s))),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| StoreError::Decode(format!("not an integer: {}", n))),
        other => Err(StoreError::Decode(format!("not an integer: {}", other))),
    }
}
