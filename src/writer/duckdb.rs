use super::traits::{Writer, WriterError, WriterFactory};
use crate::batch::Batch;
use crate::config::types::{ColumnConfig, ColumnType, DuckDbWriterConfig};
use crate::delivery::DeliveryOutcome;
use crate::record::{Record, TopicPartition};
use async_trait::async_trait;
use duckdb::types::Value;
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        std::process::Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Extract PID from DuckDB lock error message
fn extract_pid_from_lock_error(error_msg: &str) -> Option<u32> {
    // Error format: "... (PID 12345) ..."
    let start = error_msg.find("(PID ")? + 5;
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

fn remove_lock_files(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["wal", "lock"] {
        let path = PathBuf::from(format!("{}.{}", db_path.display(), suffix));
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::info!("Removed stale {} file: {}", suffix, path.display());
        }
    }
    Ok(())
}

/// Open the database file, clearing a lock left behind by a dead process
fn open_database(path: &Path) -> Result<Connection, WriterError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    match Connection::open(path) {
        Ok(conn) => Ok(conn),
        Err(e) => {
            let error_msg = e.to_string();
            if !error_msg.contains("Could not set lock") {
                return Err(e.into());
            }

            tracing::warn!("Database lock detected: {}", error_msg);
            match extract_pid_from_lock_error(&error_msg) {
                Some(pid) if !is_process_running(pid) => {
                    tracing::warn!("Process {} is not running, removing stale lock files", pid);
                    remove_lock_files(path)?;
                    Ok(Connection::open(path)?)
                }
                Some(pid) => {
                    tracing::error!("Process {} is still running, cannot acquire lock", pid);
                    Err(e.into())
                }
                None => Err(e.into()),
            }
        }
    }
}

fn create_table_sql(config: &DuckDbWriterConfig) -> String {
    let mut columns = vec![
        "topic VARCHAR NOT NULL".to_string(),
        "\"partition\" UINTEGER NOT NULL".to_string(),
        "\"offset\" UBIGINT NOT NULL".to_string(),
        "record_key VARCHAR".to_string(),
        "payload JSON".to_string(),
        "written_at TIMESTAMPTZ NOT NULL".to_string(),
    ];
    for column in &config.columns {
        let not_null = if column.required { " NOT NULL" } else { "" };
        columns.push(format!("{} {}{}", column.name, column.column_type.sql_type(), not_null));
    }
    columns.push("PRIMARY KEY (topic, \"partition\", \"offset\")".to_string());

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        config.table,
        columns.join(",\n    ")
    )
}

fn insert_sql(config: &DuckDbWriterConfig) -> String {
    let mut names = vec![
        "topic".to_string(),
        "\"partition\"".to_string(),
        "\"offset\"".to_string(),
        "record_key".to_string(),
        "payload".to_string(),
        "written_at".to_string(),
    ];
    let mut placeholders = vec!["?", "?", "?", "?", "?", "now()"];
    for column in &config.columns {
        names.push(column.name.clone());
        placeholders.push("?");
    }

    format!(
        "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
        config.table,
        names.join(", "),
        placeholders.join(", ")
    )
}

/// Convert one payload field to the column's SQL value
fn column_value(column: &ColumnConfig, payload: Option<&serde_json::Value>) -> Result<Value, String> {
    let field = payload.and_then(|p| p.get(column.field()));

    let value = match field {
        None | Some(serde_json::Value::Null) => {
            if column.required {
                return Err(format!("required field '{}' is missing", column.field()));
            }
            return Ok(Value::Null);
        }
        Some(value) => value,
    };

    let mismatch = || {
        format!(
            "field '{}' value {} is not a valid {}",
            column.field(),
            value,
            column.column_type.sql_type()
        )
    };

    match column.column_type {
        ColumnType::Text => Ok(Value::Text(match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
        ColumnType::Double => match value {
            serde_json::Value::Number(n) => n.as_f64().map(Value::Double).ok_or_else(mismatch),
            serde_json::Value::String(s) => s.trim().parse().map(Value::Double).map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        ColumnType::Bigint => match value {
            serde_json::Value::Number(n) => n.as_i64().map(Value::BigInt).ok_or_else(mismatch),
            serde_json::Value::String(s) => s.trim().parse().map(Value::BigInt).map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        ColumnType::Boolean => match value {
            serde_json::Value::Bool(b) => Ok(Value::Boolean(*b)),
            serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Boolean(true)),
                "false" => Ok(Value::Boolean(false)),
                _ => Err(mismatch()),
            },
            _ => Err(mismatch()),
        },
    }
}

fn row_values(config: &DuckDbWriterConfig, record: &Record) -> Result<Vec<Value>, String> {
    let mut values = vec![
        Value::Text(record.position.topic.clone()),
        Value::UInt(record.position.partition),
        Value::UBigInt(record.position.offset),
        record.key.clone().map(Value::Text).unwrap_or(Value::Null),
        Value::Text(record.payload.to_json().to_string()),
    ];

    let payload = record.payload.as_json();
    for column in &config.columns {
        values.push(column_value(column, payload)?);
    }
    Ok(values)
}

/// Upserts batches into a DuckDB table keyed by stream position, so a retried
/// batch overwrites its earlier rows instead of duplicating them.
pub struct DuckDbWriter {
    conn: Arc<Mutex<Connection>>,
    config: Arc<DuckDbWriterConfig>,
    insert_sql: Arc<str>,
}

impl DuckDbWriter {
    pub fn new(conn: Connection, config: Arc<DuckDbWriterConfig>) -> Self {
        let insert_sql = insert_sql(&config).into();
        Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
            insert_sql,
        }
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, WriterError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, WriterError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| WriterError::Other("duckdb connection lock poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| WriterError::Other(format!("Task join error: {}", e)))?
    }
}

#[async_trait]
impl Writer for DuckDbWriter {
    async fn setup(&mut self) -> Result<(), WriterError> {
        let sql = create_table_sql(&self.config);
        self.run_blocking(move |conn| {
            conn.execute(&sql, [])?;
            Ok(())
        })
        .await
        .map_err(|e| WriterError::Connection(e.to_string()))
    }

    async fn attempt(&mut self, batch: &Batch) -> Result<DeliveryOutcome, WriterError> {
        let mut rows = Vec::with_capacity(batch.len());
        for (index, record) in batch.records().iter().enumerate() {
            match row_values(&self.config, record) {
                Ok(values) => rows.push(values),
                Err(reason) => {
                    return Ok(DeliveryOutcome::Fatal(format!(
                        "record {} (offset {}) cannot be mapped to table {}: {}",
                        index,
                        record.offset(),
                        self.config.table,
                        reason
                    )));
                }
            }
        }

        let sql = self.insert_sql.clone();
        let written = self
            .run_blocking(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(&sql)?;
                    for values in rows {
                        stmt.execute(duckdb::params_from_iter(values))?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await;

        match written {
            Ok(()) => Ok(DeliveryOutcome::Success),
            Err(WriterError::Database(e)) => {
                Ok(DeliveryOutcome::Retryable(format!("database error: {}", e)))
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        "duckdb"
    }
}

/// Opens the database once and hands every partition writer its own cloned
/// connection to it.
pub struct DuckDbWriterFactory {
    base: Mutex<Connection>,
    config: Arc<DuckDbWriterConfig>,
}

impl DuckDbWriterFactory {
    pub fn open(config: DuckDbWriterConfig) -> Result<Self, WriterError> {
        let conn = open_database(&config.path)?;
        tracing::info!(path = %config.path.display(), table = %config.table, "Opened DuckDB database");
        Ok(Self::with_connection(conn, config))
    }

    pub fn with_connection(conn: Connection, config: DuckDbWriterConfig) -> Self {
        Self {
            base: Mutex::new(conn),
            config: Arc::new(config),
        }
    }
}

impl WriterFactory for DuckDbWriterFactory {
    type Writer = DuckDbWriter;

    fn create(&self, _topic_partition: &TopicPartition) -> Result<DuckDbWriter, WriterError> {
        let conn = self
            .base
            .lock()
            .map_err(|_| WriterError::Other("duckdb connection lock poisoned".to_string()))?
            .try_clone()?;
        Ok(DuckDbWriter::new(conn, self.config.clone()))
    }
}
