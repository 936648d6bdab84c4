//! Network query backends: JSON over HTTP and Postgres.

use std::sync::Arc;
use std::time::Duration;

use analyst_coordination::data::{BackendKind, BackendLocator, BoundParam, Row};
use analyst_coordination::BackendError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

// ── HTTP ─────────────────────────────────────────────────────────

/// Calls `GET url?name=value…` and reads an array of row objects from the
/// body, optionally at a JSON pointer.
pub struct HttpJsonBackend {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpJsonBackend {
    pub fn new(timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Permanent(e.to_string()))?;
        Ok(Self { client, timeout })
    }
}

/// 408, 429 and 5xx are worth retrying; other failures are not.
pub fn http_status_error(status: StatusCode) -> BackendError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        BackendError::Transient(format!("HTTP {}", status))
    } else {
        BackendError::Permanent(format!("HTTP {}", status))
    }
}

/// Pull row objects out of a response body.
pub fn rows_from_json(body: &Value, pointer: Option<&str>) -> Result<Vec<Row>, BackendError> {
    let target = match pointer {
        Some(p) => body
            .pointer(p)
            .ok_or_else(|| BackendError::Permanent(format!("no value at pointer '{}'", p)))?,
        None => body,
    };
    let Value::Array(items) = target else {
        return Err(BackendError::Permanent(
            "response rows are not an array".to_string(),
        ));
    };
    items
        .iter()
        .map(|item| match item {
            Value::Object(row) => Ok(row.clone()),
            _ => Err(BackendError::Permanent(
                "response row is not an object".to_string(),
            )),
        })
        .collect()
}

#[async_trait]
impl analyst_coordination::QueryBackend for HttpJsonBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Http
    }

    async fn execute(
        &self,
        locator: &BackendLocator,
        params: &[BoundParam],
    ) -> Result<Vec<Row>, BackendError> {
        let BackendLocator::Http {
            url, rows_pointer, ..
        } = locator
        else {
            return Err(BackendError::Permanent(format!(
                "HTTP backend cannot run {}",
                locator.describe()
            )));
        };

        let query: Vec<(String, String)> = params
            .iter()
            .map(|p| (p.name.clone(), p.as_text()))
            .collect();
        let response = self
            .client
            .get(url)
            .query(&query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(self.timeout)
                } else {
                    BackendError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(http_status_error(status));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Permanent(format!("invalid JSON body: {}", e)))?;
        let rows = rows_from_json(&body, rows_pointer.as_deref())?;
        debug!(url = %url, rows = rows.len(), "HTTP source fetched");
        Ok(rows)
    }
}

// ── Postgres ─────────────────────────────────────────────────────

type SqlParam = Box<dyn ToSql + Sync + Send>;

/// Convert a bound JSON parameter to a typed SQL parameter.
///
/// Integers bind as `int8`, other numbers as `float8`; statements cast
/// placeholders where the column type differs (`$1::int4`).
pub fn sql_param(param: &BoundParam) -> SqlParam {
    match &param.value {
        Value::Bool(b) => Box::new(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Box::new(i),
            None => Box::new(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => Box::new(s.clone()),
        other => Box::new(other.to_string()),
    }
}

/// Postgres errors from the server about the statement are permanent;
/// connection loss and transient server states are not.
fn classify_pg_error(e: tokio_postgres::Error) -> BackendError {
    let transient_state = e
        .code()
        .map(|c| {
            let code = c.code();
            ["08", "40", "53", "57"]
                .iter()
                .any(|class| code.starts_with(class))
        })
        .unwrap_or(false);
    if e.as_db_error().is_none() || transient_state {
        BackendError::Transient(e.to_string())
    } else {
        BackendError::Permanent(e.to_string())
    }
}

fn cell_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Value {
    fn get<'a, T>(row: &'a tokio_postgres::Row, idx: usize) -> Option<T>
    where
        T: tokio_postgres::types::FromSql<'a>,
    {
        row.try_get::<_, Option<T>>(idx).ok().flatten()
    }

    let value = if *ty == Type::BOOL {
        get::<bool>(row, idx).map(Value::from)
    } else if *ty == Type::INT2 {
        get::<i16>(row, idx).map(Value::from)
    } else if *ty == Type::INT4 {
        get::<i32>(row, idx).map(Value::from)
    } else if *ty == Type::INT8 {
        get::<i64>(row, idx).map(Value::from)
    } else if *ty == Type::FLOAT4 {
        get::<f32>(row, idx).map(|v| Value::from(v as f64))
    } else if *ty == Type::FLOAT8 {
        get::<f64>(row, idx).map(Value::from)
    } else if [Type::TEXT, Type::VARCHAR, Type::BPCHAR, Type::NAME].contains(ty) {
        get::<String>(row, idx).map(Value::from)
    } else if *ty == Type::DATE {
        get::<chrono::NaiveDate>(row, idx).map(|d| Value::from(d.to_string()))
    } else if *ty == Type::TIMESTAMP {
        get::<chrono::NaiveDateTime>(row, idx).map(|d| Value::from(d.to_string()))
    } else if *ty == Type::TIMESTAMPTZ {
        get::<chrono::DateTime<chrono::Utc>>(row, idx).map(|d| Value::from(d.to_rfc3339()))
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        get::<Value>(row, idx)
    } else {
        debug!(column = idx, ty = %ty, "Unsupported column type; cast it in the statement");
        None
    };
    value.unwrap_or(Value::Null)
}

fn to_row(row: &tokio_postgres::Row) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| (column.name().to_string(), cell_value(row, idx, column.type_())))
        .collect()
}

/// Runs parameterized statements over one lazily (re)connected client.
pub struct PostgresBackend {
    url: String,
    client: Mutex<Option<Arc<Client>>>,
}

impl PostgresBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<Arc<Client>, BackendError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(Arc::clone(client));
            }
            warn!("Postgres connection closed; reconnecting");
        }

        let (client, connection) = tokio_postgres::connect(&self.url, NoTls)
            .await
            .map_err(classify_pg_error)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "Postgres connection ended");
            }
        });
        info!("Postgres connected");
        let client = Arc::new(client);
        *guard = Some(Arc::clone(&client));
        Ok(client)
    }
}

#[async_trait]
impl analyst_coordination::QueryBackend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sql
    }

    async fn execute(
        &self,
        locator: &BackendLocator,
        params: &[BoundParam],
    ) -> Result<Vec<Row>, BackendError> {
        let BackendLocator::Sql { statement, .. } = locator else {
            return Err(BackendError::Permanent(format!(
                "SQL backend cannot run {}",
                locator.describe()
            )));
        };

        let owned: Vec<SqlParam> = params.iter().map(sql_param).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = owned
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let client = self.client().await?;
        let rows = client
            .query(statement.as_str(), &refs)
            .await
            .map_err(classify_pg_error)?;
        Ok(rows.iter().map(to_row).collect())
    }
}
