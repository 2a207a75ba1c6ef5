//! Storage Backends
//!
//! A uniform record interface over interchangeable backends. The contract is
//! intentionally small (existence check, point get, insert, conditional
//! update, delete, iteration) so that any tabular or document store can
//! implement it without leaking its query language into the lifecycle
//! engine. Backend selection happens once, at construction, through
//! [`BackendType`]; the engine only ever talks to the trait object.

use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::misc::AccountError;
use crate::user_record::{RecordFilter, RecordUpdate, UserRecord};

/// Implementation for an in-memory backend. No synchronization occurs.
/// This is useful for tests and environments without a durable store
pub mod memory;
#[cfg(feature = "redis")]
/// Implementation for the redis document backend
pub mod redis_backend;
#[cfg(feature = "sql")]
/// Implementation for the SQL backend
pub mod sql_backend;

/// Used when constructing the account manager
#[derive(Clone, Debug, Eq, PartialEq)]
#[allow(variant_size_differences)]
pub enum BackendType {
    /// No true synchronization will occur; data is lost between program
    /// executions. Ideal for tests
    InMemory,
    #[cfg(feature = "sql")]
    /// Synchronization will occur on a remote SQL database
    SQLDatabase(String, sql_backend::SqlConnectionOptions),
    #[cfg(feature = "redis")]
    /// Synchronization will occur on a remote redis database
    Redis(String, redis_backend::RedisConnectionOptions),
}

impl BackendType {
    /// Creates a new [`BackendType`] given the provided `url`. Returns an
    /// error if the URL could not be matched to an enabled backend
    pub fn new<T: Into<String>>(url: T) -> Result<Self, AccountError> {
        let addr = url.into();
        #[cfg(feature = "redis")]
        {
            if addr.starts_with("redis") {
                return Ok(BackendType::redis(addr));
            }
        }

        #[cfg(feature = "sql")]
        {
            if addr.starts_with("mysql")
                || addr.starts_with("postgres")
                || addr.starts_with("sqlite")
            {
                return Ok(BackendType::sql(addr));
            }
        }

        Err(AccountError::msg(format!("The addr '{addr}' is not a valid target (hint: ensure either 'redis' or 'sql' features are enabled when compiling)")))
    }

    #[cfg(feature = "redis")]
    /// For requesting the use of the redis backend driver.
    /// URL format: redis://[<username>][:<password>@]<hostname>[:port][/<db>]
    pub fn redis<T: Into<String>>(url: T) -> BackendType {
        Self::redis_with(url, Default::default())
    }

    #[cfg(feature = "redis")]
    /// Like [`Self::redis`], but with custom options
    pub fn redis_with<T: Into<String>>(
        url: T,
        opts: redis_backend::RedisConnectionOptions,
    ) -> BackendType {
        BackendType::Redis(url.into(), opts)
    }

    /// For requesting the use of the SqlBackend driver. Url should be in the form:
    /// "mysql://username:password@ip/database"
    /// "postgres:// [...]"
    /// "sqlite:/path/to/file.db"
    ///
    /// PostgreSQL, MySQL, SqLite supported
    #[cfg(feature = "sql")]
    pub fn sql<T: Into<String>>(url: T) -> BackendType {
        BackendType::SQLDatabase(url.into(), Default::default())
    }

    /// Like [`Self::sql`], but with custom options
    #[cfg(feature = "sql")]
    pub fn sql_with<T: Into<String>>(
        url: T,
        opts: sql_backend::SqlConnectionOptions,
    ) -> BackendType {
        BackendType::SQLDatabase(url.into(), opts)
    }
}

/// An interface for synchronizing account records to differing targets.
///
/// `update` and `delete` return the number of records they matched so that
/// callers can express conditional writes: an update filtered on the exact
/// stored token value that reports zero matches means a concurrent caller
/// already consumed the token.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// This should be run for handling any types of underlying connect
    /// operations, including schema/index setup
    async fn connect(&mut self) -> Result<(), AccountError>;
    /// Determines if connected or not
    async fn is_connected(&self) -> Result<bool, AccountError>;
    /// True if any record matches any of the given predicates (logical OR)
    async fn exists(&self, any_of: &[RecordFilter]) -> Result<bool, AccountError>;
    /// Returns at most one record matching all given predicates (logical AND)
    async fn get(&self, all_of: &[RecordFilter]) -> Result<Option<UserRecord>, AccountError>;
    /// Inserts one record. Uniqueness violations surface as
    /// [`AccountError::DetailsExist`]
    async fn insert(&self, record: &UserRecord) -> Result<(), AccountError>;
    /// Applies the changes to every record matching all predicates, returning
    /// the matched count. A no-op when nothing matches
    async fn update(
        &self,
        all_of: &[RecordFilter],
        changes: &[RecordUpdate],
    ) -> Result<u64, AccountError>;
    /// Removes every record matching all predicates, returning the removed count
    async fn delete(&self, all_of: &[RecordFilter]) -> Result<u64, AccountError>;
    /// A lazy, finite, single-pass sequence of the records matching all
    /// predicates. Whether the walk is a point-in-time snapshot or an
    /// eventually-consistent cursor depends on the backend; restarting
    /// requires a new call
    async fn iterate(
        &self,
        all_of: &[RecordFilter],
    ) -> Result<BoxStream<'static, Result<UserRecord, AccountError>>, AccountError>;
    /// Removes all records, returning the number removed
    async fn purge(&self) -> Result<usize, AccountError>;
}

/// This is what the account manager holds. This gets called before making
/// I/O operations
#[derive(Clone)]
pub struct PersistenceHandler {
    inner: Arc<dyn BackendConnection>,
}

impl PersistenceHandler {
    /// Creates a new persistence handler, connecting to the backend then
    /// returning self
    pub async fn create<T: BackendConnection + 'static>(
        mut inner: T,
    ) -> Result<Self, AccountError> {
        inner.connect().await?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }
}

impl Deref for PersistenceHandler {
    type Target = Arc<dyn BackendConnection>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
