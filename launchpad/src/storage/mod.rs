pub mod events;
pub mod sites;


use sqlx::{
    migrate,
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Sqlite, SqlitePool,
};
use std::time::Duration;

/// The maximum amount of rows that can be returned by any single query.
pub const MAX_ROW_LIMIT: u64 = 200;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("could not establish connection to database; {0}")]
    Connection(String),

    #[error("requested entity not found")]
    NotFound,

    #[error("entity already exists")]
    Exists,

    /// A guarded update found the record in a different status than the caller expected.
    #[error("record status is '{actual}' but expected '{expected}'")]
    StatusMismatch { expected: String, actual: String },

    #[error("no fields were given to update")]
    NoFieldsUpdated,

    #[error(
        "unexpected storage error occurred; code: {code:?}; message: {message}; query: {query}"
    )]
    GenericDBError {
        code: Option<String>,
        message: String,
        query: String,
    },
}

/// Sort sqlx errors into the handful of cases callers actually branch on.
pub fn map_sqlx_error(e: sqlx::Error, query: &str) -> StorageError {
    match e {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        sqlx::Error::Database(database_err) => {
            if database_err.is_unique_violation() {
                return StorageError::Exists;
            }

            StorageError::GenericDBError {
                code: database_err.code().map(|code| code.to_string()),
                message: database_err.message().to_string(),
                query: query.to_string(),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StorageError::Connection(e.to_string())
        }
        _ => StorageError::GenericDBError {
            code: None,
            message: e.to_string(),
            query: query.to_string(),
        },
    }
}

/// Sqlite only tolerates a single writer, so writes go through a pool of exactly one connection
/// while reads get their own wider pool.
#[derive(Debug, Clone)]
pub struct Db {
    read_pool: SqlitePool,
    write_pool: SqlitePool,
}

impl Db {
    pub async fn new(path: &str, max_read_connections: u32) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        migrate!("src/storage/migrations")
            .run(&write_pool)
            .await
            .map_err(|e| StorageError::Connection(format!("could not run migrations; {e}")))?;

        let read_pool = SqlitePoolOptions::new()
            .max_connections(max_read_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        Ok(Db {
            read_pool,
            write_pool,
        })
    }

    pub async fn read_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.read_pool
            .acquire()
            .await
            .map_err(|e| StorageError::Connection(format!("{:?}", e)))
    }

    /// Callers must not hold this connection across another call that needs to write, there is
    /// only one of them.
    pub async fn write_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.write_pool
            .acquire()
            .await
            .map_err(|e| StorageError::Connection(format!("{:?}", e)))
    }
}
