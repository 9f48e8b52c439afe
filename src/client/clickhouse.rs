//! ClickHouse SQL client.
//!
//! Statements go over the ClickHouse HTTP interface: the SQL text is the
//! POST body and credentials travel as basic auth. Query results are read
//! in `TabSeparated` format.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// Statement that drops the server's cached DNS resolutions.
pub const DROP_DNS_CACHE_SQL: &str = "SYSTEM DROP DNS CACHE";

/// Errors returned by a SQL client.
#[derive(Error, Debug)]
pub enum SqlError {
    #[error("request to {host} failed: {message}")]
    Transport { host: String, message: String },

    #[error("request to {host} timed out")]
    Timeout { host: String },

    #[error("{host} rejected statement ({status}): {message}")]
    Server {
        host: String,
        status: u16,
        message: String,
    },
}

impl SqlError {
    pub fn host(&self) -> &str {
        match self {
            SqlError::Transport { host, .. }
            | SqlError::Timeout { host }
            | SqlError::Server { host, .. } => host,
        }
    }
}

/// Rows as returned by `query`: one `Vec` of column values per row.
pub type Rows = Vec<Vec<String>>;

/// Executes SQL against a single ClickHouse host.
#[async_trait]
pub trait SqlClient: Send + Sync {
    async fn execute(&self, host: &str, sql: &str, timeout: Duration) -> Result<(), SqlError>;

    async fn query(&self, host: &str, sql: &str, timeout: Duration) -> Result<Rows, SqlError>;

    /// Drop cached address resolutions on every host, trying all of them.
    async fn invalidate_address_cache(&self, hosts: &[String], timeout: Duration) -> Vec<SqlError> {
        let mut errors = Vec::new();
        for host in hosts {
            if let Err(e) = self.execute(host, DROP_DNS_CACHE_SQL, timeout).await {
                warn!(host = %host, error = %e, "Failed to drop DNS cache");
                errors.push(e);
            }
        }
        errors
    }
}

/// `SqlClient` over the ClickHouse HTTP interface.
#[derive(Clone)]
pub struct ClickHouseHttpClient {
    client: reqwest::Client,
    username: String,
    password: String,
    port: u16,
}

impl ClickHouseHttpClient {
    pub fn new(username: impl Into<String>, password: impl Into<String>, port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            username: username.into(),
            password: password.into(),
            port,
        }
    }

    fn url(&self, host: &str) -> String {
        format!("http://{}:{}/", host, self.port)
    }

    async fn post(&self, host: &str, sql: String, timeout: Duration) -> Result<String, SqlError> {
        let mut request = self.client.post(self.url(host)).timeout(timeout).body(sql);
        if !self.username.is_empty() {
            let password = (!self.password.is_empty()).then_some(&self.password);
            request = request.basic_auth(&self.username, password);
        }

        let response = request.send().await.map_err(|e| transport_error(host, e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| transport_error(host, e))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(SqlError::Server {
                host: host.to_string(),
                status: status.as_u16(),
                message: body.trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl SqlClient for ClickHouseHttpClient {
    async fn execute(&self, host: &str, sql: &str, timeout: Duration) -> Result<(), SqlError> {
        if sql.trim().is_empty() {
            return Ok(());
        }
        debug!(host = %host, sql = %sql, "Executing statement");
        self.post(host, sql.to_string(), timeout).await.map(|_| ())
    }

    async fn query(&self, host: &str, sql: &str, timeout: Duration) -> Result<Rows, SqlError> {
        if sql.trim().is_empty() {
            return Ok(Vec::new());
        }
        debug!(host = %host, sql = %sql, "Running query");
        let body = self
            .post(host, format!("{sql}\nFORMAT TabSeparated"), timeout)
            .await?;
        Ok(parse_tab_separated(&body))
    }
}

fn transport_error(host: &str, e: reqwest::Error) -> SqlError {
    if e.is_timeout() {
        SqlError::Timeout {
            host: host.to_string(),
        }
    } else {
        SqlError::Transport {
            host: host.to_string(),
            message: e.to_string(),
        }
    }
}

/// Split a `TabSeparated` body into rows, undoing the format's escaping.
pub fn parse_tab_separated(body: &str) -> Rows {
    body.lines()
        .filter(|line| !line.is_empty())
        .map(|line| line.split('\t').map(unescape).collect())
        .collect()
}

fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\'') => out.push('\''),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
