//! Control channel to the database server.
//!
//! The engine only needs to run a handful of SQL statements and read back
//! tabular text results. A channel is opened around each notification and
//! closed right after, never held across the copy pass.

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::transfer::copy::BLCKSZ;
use crate::wal::XLOG_BLCKSZ;
use crate::{BackupError, Result};

/// Server version this engine is built against (9.5).
pub const PG_VERSION_NUM: u32 = 90500;

/// Text result of one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub rows: Vec<Vec<String>>,
}

impl QueryResult {
    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    pub fn nfields(&self) -> usize {
        self.rows.first().map_or(0, |r| r.len())
    }

    /// The only value of a one-row, one-column result.
    pub fn single_value(&self, what: &str) -> Result<&str> {
        if self.ntuples() != 1 || self.nfields() != 1 {
            return Err(BackupError::Protocol(format!(
                "result of {} is invalid: {} rows, {} columns",
                what,
                self.ntuples(),
                self.nfields()
            )));
        }
        Ok(&self.rows[0][0])
    }
}

/// An open request/response channel.
#[allow(async_fn_in_trait)]
pub trait ControlChannel {
    async fn query(&mut self, sql: &str) -> Result<QueryResult>;

    async fn close(self) -> Result<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

/// Opens control channels.
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Channel: ControlChannel;

    async fn connect(&self) -> Result<Self::Channel>;
}

/// Quote a string as an SQL literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Connection settings for the `psql` client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsqlSettings {
    /// Path of the psql binary
    #[serde(default = "default_psql")]
    pub psql: String,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default = "default_database")]
    pub database: String,
}

fn default_psql() -> String {
    "psql".to_string()
}

fn default_database() -> String {
    "postgres".to_string()
}

impl Default for PsqlSettings {
    fn default() -> Self {
        Self {
            psql: default_psql(),
            host: None,
            port: None,
            user: None,
            database: default_database(),
        }
    }
}

/// Runs each query through a `psql` process.
#[derive(Debug, Clone)]
pub struct PsqlConnector {
    settings: PsqlSettings,
}

impl PsqlConnector {
    pub fn new(settings: PsqlSettings) -> Self {
        Self { settings }
    }
}

/// Field separator requested from psql (ASCII unit separator).
const FIELD_SEPARATOR: char = '\u{1f}';

pub struct PsqlChannel {
    settings: PsqlSettings,
}

impl Connector for PsqlConnector {
    type Channel = PsqlChannel;

    async fn connect(&self) -> Result<PsqlChannel> {
        let mut channel = PsqlChannel {
            settings: self.settings.clone(),
        };
        channel.query("SELECT 1").await?;
        Ok(channel)
    }
}

impl ControlChannel for PsqlChannel {
    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        let s = &self.settings;
        let mut cmd = Command::new(&s.psql);
        cmd.args(["-X", "-A", "-t", "-q", "-v", "ON_ERROR_STOP=1"])
            .arg("-F")
            .arg(FIELD_SEPARATOR.to_string())
            .arg("-d")
            .arg(&s.database);
        if let Some(host) = &s.host {
            cmd.arg("-h").arg(host);
        }
        if let Some(port) = s.port {
            cmd.arg("-p").arg(port.to_string());
        }
        if let Some(user) = &s.user {
            cmd.arg("-U").arg(user);
        }
        cmd.arg("-c").arg(sql).stdin(Stdio::null());

        debug!("Executing: {}", sql);
        let output = cmd
            .output()
            .await
            .map_err(|e| BackupError::Connection(format!("cannot run {}: {}", s.psql, e)))?;

        if !output.status.success() {
            return Err(BackupError::Connection(format!(
                "query \"{}\" failed: {}",
                sql,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(parse_psql_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse unaligned, tuples-only psql output.
pub fn parse_psql_output(stdout: &str) -> QueryResult {
    QueryResult {
        rows: stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| line.split(FIELD_SEPARATOR).map(str::to_string).collect())
            .collect(),
    }
}

/// Properties of the server this session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub version_num: u32,
    pub block_size: u32,
    pub wal_block_size: u32,
}

/// Confirm the server version and page sizes are compatible.
pub async fn check_server<C: Connector>(connector: &C) -> Result<ServerInfo> {
    let mut channel = connector.connect().await?;

    let version = channel.query("SHOW server_version_num").await?;
    let version_num: u32 = version
        .single_value("server_version_num")?
        .trim()
        .parse()
        .map_err(|_| BackupError::Protocol("server_version_num is not numeric".into()))?;
    if version_num / 100 != PG_VERSION_NUM / 100 {
        return Err(BackupError::Incompatible(format!(
            "server version is {}.{}.{}, must be {}.{}",
            version_num / 10000,
            (version_num / 100) % 100,
            version_num % 100,
            PG_VERSION_NUM / 10000,
            (PG_VERSION_NUM / 100) % 100
        )));
    }

    let block_size = confirm_block_size(&mut channel, "block_size", BLCKSZ as u32).await?;
    let wal_block_size = confirm_block_size(&mut channel, "wal_block_size", XLOG_BLCKSZ).await?;
    channel.close().await?;

    info!(
        "Server {} compatible: block_size={}, wal_block_size={}",
        version_num, block_size, wal_block_size
    );
    Ok(ServerInfo {
        version_num,
        block_size,
        wal_block_size,
    })
}

async fn confirm_block_size<Ch: ControlChannel>(
    channel: &mut Ch,
    name: &str,
    expected: u32,
) -> Result<u32> {
    let sql = format!("SELECT current_setting({})", quote_literal(name));
    let result = channel.query(&sql).await?;
    let raw = result.single_value(name)?;
    match raw.trim().parse::<u32>() {
        Ok(size) if size == expected => Ok(size),
        _ => Err(BackupError::Incompatible(format!(
            "{}({}) is not compatible({} expected)",
            name, raw, expected
        ))),
    }
}
