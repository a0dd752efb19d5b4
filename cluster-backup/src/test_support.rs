//! Scripted control channel for tests.
//!
//! Answers queries by substring match and mimics the server-side effects the
//! engine relies on: `pg_start_backup` creates `backup_label` in the data
//! directory and `pg_stop_backup` removes it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::server::{parse_psql_output, Connector, ControlChannel, QueryResult};
use crate::{BackupError, Result};

#[derive(Default)]
struct Script {
    /// `(pattern, raw psql output)`, first match wins.
    responses: Vec<(String, String)>,
    failures: Vec<String>,
    queries: Vec<String>,
    pgdata: Option<PathBuf>,
}

#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        let connector = Self::default();
        {
            let mut script = connector.script.lock().unwrap();
            script.responses = [
                ("SELECT 1", "1\n"),
                ("server_version_num", "90504\n"),
                ("'block_size'", "8192\n"),
                ("'wal_block_size'", "8192\n"),
                ("pg_start_backup", "0/3000028\n"),
                ("pg_switch_xlog", "0/3000150\n"),
                ("pg_stop_backup", "0/40000F8\n"),
                ("txid_current", "1843\n"),
            ]
            .into_iter()
            .map(|(p, r)| (p.to_string(), r.to_string()))
            .collect();
        }
        connector
    }

    /// Simulate server effects on this data directory.
    pub fn with_pgdata(self, pgdata: impl Into<PathBuf>) -> Self {
        self.script.lock().unwrap().pgdata = Some(pgdata.into());
        self
    }

    /// Answer queries containing `pattern` with `output`.
    pub fn respond(self, pattern: &str, output: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .responses
            .insert(0, (pattern.to_string(), output.to_string()));
        self
    }

    /// Fail queries containing `pattern`.
    pub fn fail_on(self, pattern: &str) -> Self {
        self.script.lock().unwrap().failures.push(pattern.to_string());
        self
    }

    /// Every query executed so far, `SELECT 1` probes excluded.
    pub fn queries(&self) -> Vec<String> {
        self.script
            .lock()
            .unwrap()
            .queries
            .iter()
            .filter(|q| q.as_str() != "SELECT 1")
            .cloned()
            .collect()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.queries().iter().filter(|q| q.contains(pattern)).count()
    }
}

pub struct ScriptedChannel {
    script: Arc<Mutex<Script>>,
}

impl Connector for ScriptedConnector {
    type Channel = ScriptedChannel;

    async fn connect(&self) -> Result<ScriptedChannel> {
        Ok(ScriptedChannel {
            script: Arc::clone(&self.script),
        })
    }
}

impl ControlChannel for ScriptedChannel {
    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        let mut script = self.script.lock().unwrap();
        script.queries.push(sql.to_string());

        if script.failures.iter().any(|p| sql.contains(p.as_str())) {
            return Err(BackupError::Connection(format!("scripted failure: {}", sql)));
        }

        if let Some(pgdata) = &script.pgdata {
            if sql.contains("pg_start_backup") {
                std::fs::write(pgdata.join("backup_label"), "START WAL LOCATION: 0/3000028\n")?;
            } else if sql.contains("pg_stop_backup") {
                let _ = std::fs::remove_file(pgdata.join("backup_label"));
            }
        }

        let output = script
            .responses
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default();
        Ok(parse_psql_output(&output))
    }
}
