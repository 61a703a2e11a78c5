use std::path::{Path, PathBuf};
use std::{
    sync::mpsc::{self, Receiver, Sender},
    thread,
    time::Duration,
};

use rusqlite::{
    Connection, params, params_from_iter,
    types::{Value, ValueRef},
};
use tokio::{sync::oneshot, task};
use tracing::info;

pub mod archive;
pub mod kv;

pub use archive::OfflineArchive;
pub use kv::{KeyValueStore, KvError, MemoryKeyValueStore, SqliteKeyValueStore, keys};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to open database at {path}: {reason}")]
    ConnectionFailed { path: PathBuf, reason: String },

    #[error("migration {version} failed: {reason}")]
    MigrationFailed { version: u32, reason: String },

    #[error("query failed: {0}")]
    QueryFailed(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SqlValue {
    #[default]
    Null,
    Integer(i64),
    Text(String),
    Blob(Vec<u8>),
}

pub trait ToSql: Send + Sync {
    fn to_sql_value(&self) -> SqlValue;
}

impl ToSql for String {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Text(self.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }
}

pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self, StorageError>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        Ok(row.clone())
    }
}

#[allow(async_fn_in_trait)]
pub trait Database: Send + Sync + 'static {
    async fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64, StorageError>;

    async fn query<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<T>, StorageError>;
}

/// SQLite database with a dedicated writer thread; reads open their own connection.
#[derive(Debug)]
pub struct NativeDatabase {
    path: PathBuf,
    writer: Sender<WriteCommand>,
}

enum WriteCommand {
    Execute {
        sql: String,
        params: Vec<SqlValue>,
        response: oneshot::Sender<Result<u64, StorageError>>,
    },
}

enum WriterState {
    Ready(Connection),
    Failed(String),
}

fn collect_params(params: &[&dyn ToSql]) -> Vec<SqlValue> {
    params.iter().map(|param| param.to_sql_value()).collect()
}

fn sql_value_to_rusqlite_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(integer) => Value::Integer(*integer),
        SqlValue::Text(text) => Value::Text(text.clone()),
        SqlValue::Blob(bytes) => Value::Blob(bytes.clone()),
    }
}

fn sql_values_to_rusqlite_values(values: &[SqlValue]) -> Vec<Value> {
    values.iter().map(sql_value_to_rusqlite_value).collect()
}

fn value_ref_to_sql_value(value_ref: ValueRef<'_>) -> SqlValue {
    match value_ref {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(integer) => SqlValue::Integer(integer),
        ValueRef::Real(real) => SqlValue::Text(real.to_string()),
        ValueRef::Text(text) => SqlValue::Text(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    }
}

fn connection_error(path: &Path, error: impl ToString) -> StorageError {
    StorageError::ConnectionFailed {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
}

fn open_native_connection(path: &Path) -> Result<Connection, StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|error| connection_error(path, error))?;
    }

    let connection = Connection::open(path).map_err(|error| connection_error(path, error))?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .map_err(|error| connection_error(path, error))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .map_err(|error| connection_error(path, error))?;
    Ok(connection)
}

fn execute_statement(
    connection: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<u64, StorageError> {
    let values = sql_values_to_rusqlite_values(params);

    connection
        .execute(sql, params_from_iter(values.iter()))
        .map(|rows_affected| rows_affected as u64)
        .map_err(|error| StorageError::QueryFailed(error.to_string()))
}

fn query_rows(
    connection: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<Row>, StorageError> {
    let mut statement = connection
        .prepare(sql)
        .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
    let values = sql_values_to_rusqlite_values(params);
    let column_count = statement.column_count();
    let mut rows = statement
        .query(params_from_iter(values.iter()))
        .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
    let mut output = Vec::new();

    while let Some(row) = rows
        .next()
        .map_err(|error| StorageError::QueryFailed(error.to_string()))?
    {
        let mut values = Vec::with_capacity(column_count);
        for index in 0..column_count {
            let value = row
                .get_ref(index)
                .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
            values.push(value_ref_to_sql_value(value));
        }
        output.push(Row::new(values));
    }

    Ok(output)
}

struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("../migrations/001_kv_store.sql"),
}];

fn run_migrations(connection: &Connection) -> Result<(), StorageError> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .map_err(|error| StorageError::MigrationFailed {
            version: 0,
            reason: format!("failed to create _migrations table: {error}"),
        })?;

    for migration in MIGRATIONS {
        let migration_error = |reason: String| StorageError::MigrationFailed {
            version: migration.version,
            reason,
        };

        let is_applied: i64 = connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM _migrations WHERE version = ?1)",
                params![migration.version],
                |row| row.get(0),
            )
            .map_err(|error| migration_error(format!("failed to query migration state: {error}")))?;

        if is_applied != 0 {
            continue;
        }

        let tx = connection
            .unchecked_transaction()
            .map_err(|error| migration_error(format!("failed to begin transaction: {error}")))?;
        tx.execute_batch(migration.sql)
            .map_err(|error| migration_error(error.to_string()))?;
        tx.execute(
            "INSERT INTO _migrations (version) VALUES (?1)",
            params![migration.version],
        )
        .map_err(|error| migration_error(format!("failed to record migration: {error}")))?;
        tx.commit()
            .map_err(|error| migration_error(format!("failed to commit migration: {error}")))?;

        info!(version = migration.version, "applied migration");
    }

    Ok(())
}

fn run_writer(path: PathBuf, receiver: Receiver<WriteCommand>) {
    let state = match open_native_connection(&path) {
        Ok(connection) => WriterState::Ready(connection),
        Err(error) => WriterState::Failed(error.to_string()),
    };

    while let Ok(command) = receiver.recv() {
        match command {
            WriteCommand::Execute {
                sql,
                params,
                response,
            } => {
                let result = match &state {
                    WriterState::Ready(connection) => execute_statement(connection, &sql, &params),
                    WriterState::Failed(reason) => Err(connection_error(&path, reason)),
                };

                let _ = response.send(result);
            }
        }
    }
}

impl NativeDatabase {
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let path = path.to_path_buf();
        let setup_path = path.clone();

        task::spawn_blocking(move || {
            let connection = open_native_connection(&setup_path)?;
            run_migrations(&connection)
        })
        .await
        .map_err(|error| {
            connection_error(&path, format!("failed to join storage setup task: {error}"))
        })??;

        let (writer, receiver) = mpsc::channel();
        let writer_path = path.clone();

        thread::Builder::new()
            .name("sabycom_storage_writer".to_string())
            .spawn(move || run_writer(writer_path, receiver))
            .map_err(|error| {
                connection_error(&path, format!("failed to spawn storage writer: {error}"))
            })?;

        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Database for NativeDatabase {
    async fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64, StorageError> {
        let (response_tx, response_rx) = oneshot::channel();
        let command = WriteCommand::Execute {
            sql: sql.to_string(),
            params: collect_params(params),
            response: response_tx,
        };

        self.writer.send(command).map_err(|_| {
            StorageError::QueryFailed("storage writer task is unavailable".to_string())
        })?;

        response_rx.await.map_err(|_| {
            StorageError::QueryFailed(
                "storage writer task terminated before responding".to_string(),
            )
        })?
    }

    async fn query<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<T>, StorageError> {
        let sql = sql.to_string();
        let params = collect_params(params);
        let path = self.path.clone();
        let rows = task::spawn_blocking(move || {
            let connection = open_native_connection(&path)?;
            query_rows(&connection, &sql, &params)
        })
        .await
        .map_err(|error| {
            StorageError::QueryFailed(format!("failed to join query task: {error}"))
        })??;

        rows.iter().map(T::from_row).collect()
    }
}

pub async fn open_database(path: &Path) -> Result<NativeDatabase, StorageError> {
    NativeDatabase::open(path).await
}
