//! SQL backend over the sqlx Any driver. One portable schema serves MySQL,
//! PostgreSQL, and SQLite; dialect differences (placeholder syntax, index
//! DDL) are handled here and never leak past the trait. `email_confirmed`
//! is stored as a nullable INT rather than BOOL, which does not decode
//! uniformly across drivers, and the reset timestamp is stored as RFC 3339
//! text. Uniqueness is enforced by the primary key and two unique indexes;
//! the driver's duplicate-key rejection maps to `DetailsExist`.

use std::convert::TryFrom;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyQueryResult, AnyRow};
use sqlx::{AnyPool, Arguments, Executor, Row};

use crate::backend::{BackendConnection, BackendType};
use crate::misc::AccountError;
use crate::user_record::{RecordFilter, RecordUpdate, UserRecord};

const SELECT_COLUMNS: &str = "user_id, name, email, email_validate_token, password_reset_code, password_reset_generated_at, email_confirmed, password";

/// A container for handling db conns
pub struct SqlBackend {
    url: String,
    conn: Option<AnyPool>,
    variant: SqlVariant,
    opts: SqlConnectionOptions,
}

#[derive(Eq, PartialEq)]
enum SqlVariant {
    MySQL,
    Postgre,
    Sqlite,
}

const CAR_MODE_DEFAULT: bool = false;

#[derive(Default, Debug, Clone, Eq, PartialEq)]
/// Custom connection options
pub struct SqlConnectionOptions {
    /// The maximum number of connections to keep
    pub max_connections: Option<usize>,
    /// The minimum connections to keep
    pub min_connections: Option<usize>,
    /// After the specified time during the connection process, times out
    pub connect_timeout: Option<Duration>,
    /// How long a connection can remain idle before being closed
    pub idle_timeout: Option<Duration>,
    /// How long a connection can exist (independent to idleness) before being closed
    pub max_lifetime: Option<Duration>,
    /// Create and release (CAR) mode. Holding connection pools may be
    /// undesirable for certain platforms with execution restrictions, thus,
    /// CAR mode does not keep connections
    pub car_mode: Option<bool>,
}

impl From<&'_ SqlConnectionOptions> for AnyPoolOptions {
    fn from(this: &'_ SqlConnectionOptions) -> AnyPoolOptions {
        let mut ret = AnyPoolOptions::default();

        if let Some(max_connections) = this.max_connections {
            ret = ret.max_connections(max_connections as _);
        }

        if let Some(min_connections) = this.min_connections {
            ret = ret.min_connections(min_connections as _);
        }

        if let Some(connect_timeout) = this.connect_timeout {
            ret = ret.acquire_timeout(connect_timeout);
        }

        ret = ret.idle_timeout(this.idle_timeout);
        ret = ret.max_lifetime(this.max_lifetime);

        if cfg!(feature = "localhost-testing")
            || std::env::var("LOCALHOST_TESTING").unwrap_or_default() == "1"
        {
            log::trace!(target: "bastion", "Reducing connection pool");
            ret = ret.max_connections(1);
            ret = ret.max_lifetime(Duration::from_secs(60));
        }

        ret
    }
}

/// A value bound into a parameterized query
enum Bind {
    Text(String),
    OptText(Option<String>),
    OptInt(Option<i64>),
}

impl Bind {
    fn add_to(self, args: &mut AnyArguments<'_>) {
        match self {
            Bind::Text(v) => args.add(v),
            Bind::OptText(v) => args.add(v),
            Bind::OptInt(v) => args.add(v),
        }
    }
}

fn column_of(filter: &RecordFilter) -> &'static str {
    match filter {
        RecordFilter::UserId(_) => "user_id",
        RecordFilter::Name(_) => "name",
        RecordFilter::Email(_) => "email",
        RecordFilter::EmailConfirmed(_) => "email_confirmed",
        RecordFilter::EmailValidateToken(_) => "email_validate_token",
        RecordFilter::PasswordResetCode(_) => "password_reset_code",
    }
}

fn push_filter(filter: &RecordFilter, clauses: &mut Vec<String>, binds: &mut Vec<Bind>) {
    match filter {
        RecordFilter::EmailConfirmed(None) => {
            clauses.push(format!("{} IS NULL", column_of(filter)));
        }
        RecordFilter::EmailConfirmed(Some(flag)) => {
            clauses.push(format!("{} = ?", column_of(filter)));
            binds.push(Bind::OptInt(Some(i64::from(*flag))));
        }
        RecordFilter::UserId(value)
        | RecordFilter::Name(value)
        | RecordFilter::Email(value)
        | RecordFilter::EmailValidateToken(value)
        | RecordFilter::PasswordResetCode(value) => {
            clauses.push(format!("{} = ?", column_of(filter)));
            binds.push(Bind::Text(value.clone()));
        }
    }
}

fn build_where(all_of: &[RecordFilter], joiner: &str) -> (String, Vec<Bind>) {
    if all_of.is_empty() {
        return (String::new(), Vec::new());
    }

    let mut clauses = Vec::with_capacity(all_of.len());
    let mut binds = Vec::with_capacity(all_of.len());
    for filter in all_of {
        push_filter(filter, &mut clauses, &mut binds);
    }

    (format!(" WHERE {}", clauses.join(joiner)), binds)
}

fn push_change(change: &RecordUpdate, sets: &mut Vec<String>, binds: &mut Vec<Bind>) {
    match change {
        RecordUpdate::Name(value) => {
            sets.push("name = ?".to_string());
            binds.push(Bind::Text(value.clone()));
        }
        RecordUpdate::Email(value) => {
            sets.push("email = ?".to_string());
            binds.push(Bind::Text(value.clone()));
        }
        RecordUpdate::EmailConfirmed(value) => {
            sets.push("email_confirmed = ?".to_string());
            binds.push(Bind::OptInt(value.map(i64::from)));
        }
        RecordUpdate::EmailValidateToken(value) => {
            sets.push("email_validate_token = ?".to_string());
            binds.push(Bind::OptText(value.clone()));
        }
        RecordUpdate::PasswordHash(value) => {
            sets.push("password = ?".to_string());
            binds.push(Bind::Text(value.clone()));
        }
        RecordUpdate::PasswordReset(value) => {
            sets.push("password_reset_code = ?".to_string());
            sets.push("password_reset_generated_at = ?".to_string());
            match value {
                Some((code, at)) => {
                    binds.push(Bind::OptText(Some(code.clone())));
                    binds.push(Bind::OptText(Some(at.to_rfc3339())));
                }
                None => {
                    binds.push(Bind::OptText(None));
                    binds.push(Bind::OptText(None));
                }
            }
        }
    }
}

fn row_to_record(row: &AnyRow) -> Result<UserRecord, AccountError> {
    let password_reset_generated_at = row
        .try_get::<Option<String>, _>("password_reset_generated_at")
        .map_err(AccountError::from)?
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw).map(|stamp| stamp.with_timezone(&Utc))
        })
        .transpose()?;

    Ok(UserRecord {
        user_id: row.try_get("user_id").map_err(AccountError::from)?,
        name: row.try_get("name").map_err(AccountError::from)?,
        email: row.try_get("email").map_err(AccountError::from)?,
        email_confirmed: get_tri_state(row, "email_confirmed")?,
        email_validate_token: row
            .try_get("email_validate_token")
            .map_err(AccountError::from)?,
        password_hash: row.try_get("password").map_err(AccountError::from)?,
        password_reset_code: row
            .try_get("password_reset_code")
            .map_err(AccountError::from)?,
        password_reset_generated_at,
    })
}

// nullable INT decodes as i32 or i64 depending on the driver
fn get_tri_state(row: &AnyRow, key: &str) -> Result<Option<bool>, AccountError> {
    if let Ok(value) = row.try_get::<Option<i32>, _>(key) {
        return Ok(value.map(|v| v != 0));
    }

    let value = row
        .try_get::<Option<i64>, _>(key)
        .map_err(AccountError::from)?;
    Ok(value.map(|v| v != 0))
}

#[async_trait]
impl BackendConnection for SqlBackend {
    async fn connect(&mut self) -> Result<(), AccountError> {
        // Setup the drivers
        sqlx::any::install_default_drivers();
        let conn = self.generate_conn().await?;

        if !self.opts.car_mode.unwrap_or(CAR_MODE_DEFAULT) {
            self.conn = Some(conn.clone());
        }

        let cmd = "CREATE TABLE IF NOT EXISTS users(user_id VARCHAR(32) NOT NULL, name VARCHAR(128), email VARCHAR(255), email_validate_token VARCHAR(43), password_reset_code VARCHAR(43), password_reset_generated_at VARCHAR(48), email_confirmed INT, password TEXT, PRIMARY KEY (user_id))";
        let _result = conn.execute(cmd).await.map_err(AccountError::from)?;

        // the unique indexes are the authoritative uniqueness check; MySQL has
        // no IF NOT EXISTS for indexes, so a duplicate-name rejection on
        // reconnect is expected there
        let idx_name = "CREATE UNIQUE INDEX users_name_idx ON users (name)";
        let idx_email = "CREATE UNIQUE INDEX users_email_idx ON users (email)";
        match self.variant {
            SqlVariant::MySQL => {
                for cmd in [idx_name, idx_email] {
                    if let Err(err) = conn.execute(cmd).await {
                        log::trace!(target: "bastion", "Index setup skipped: {err:?}");
                    }
                }
            }

            SqlVariant::Postgre | SqlVariant::Sqlite => {
                for cmd in [idx_name, idx_email] {
                    let cmd = cmd.replace("INDEX", "INDEX IF NOT EXISTS");
                    let _result = conn.execute(&*cmd).await.map_err(AccountError::from)?;
                }
            }
        }

        Ok(())
    }

    async fn is_connected(&self) -> Result<bool, AccountError> {
        let conn = &(self.get_conn().await?);
        Ok(!conn.is_closed())
    }

    async fn exists(&self, any_of: &[RecordFilter]) -> Result<bool, AccountError> {
        if any_of.is_empty() {
            return Ok(false);
        }

        let conn = &(self.get_conn().await?);
        let (where_sql, binds) = build_where(any_of, " OR ");
        let query = self.format(format!("SELECT COUNT(*) as count FROM users{where_sql}"));

        let mut args = AnyArguments::default();
        for bind in binds {
            bind.add_to(&mut args);
        }

        let row: AnyRow = sqlx::query_with(query.as_str(), args)
            .fetch_one(conn)
            .await
            .map_err(AccountError::from)?;

        Ok(row.try_get::<i64, _>("count").unwrap_or(0) != 0)
    }

    async fn get(&self, all_of: &[RecordFilter]) -> Result<Option<UserRecord>, AccountError> {
        let conn = &(self.get_conn().await?);
        let (where_sql, binds) = build_where(all_of, " AND ");
        let query = self.format(format!(
            "SELECT {SELECT_COLUMNS} FROM users{where_sql} LIMIT 1"
        ));

        let mut args = AnyArguments::default();
        for bind in binds {
            bind.add_to(&mut args);
        }

        let row: Option<AnyRow> = sqlx::query_with(query.as_str(), args)
            .fetch_optional(conn)
            .await
            .map_err(AccountError::from)?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn insert(&self, record: &UserRecord) -> Result<(), AccountError> {
        let conn = &(self.get_conn().await?);
        let query = self.format(format!(
            "INSERT INTO users ({SELECT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ));

        let mut args = AnyArguments::default();
        args.add(record.user_id.clone());
        args.add(record.name.clone());
        args.add(record.email.clone());
        args.add(record.email_validate_token.clone());
        args.add(record.password_reset_code.clone());
        args.add(record.password_reset_generated_at.map(|at| at.to_rfc3339()));
        args.add(record.email_confirmed.map(i64::from));
        args.add(record.password_hash.clone());

        let _result: AnyQueryResult = sqlx::query_with(query.as_str(), args)
            .execute(conn)
            .await
            .map_err(AccountError::from)?;

        Ok(())
    }

    async fn update(
        &self,
        all_of: &[RecordFilter],
        changes: &[RecordUpdate],
    ) -> Result<u64, AccountError> {
        if changes.is_empty() {
            return Ok(0);
        }

        let conn = &(self.get_conn().await?);

        let mut sets = Vec::with_capacity(changes.len());
        let mut binds = Vec::with_capacity(changes.len());
        for change in changes {
            push_change(change, &mut sets, &mut binds);
        }

        let (where_sql, where_binds) = build_where(all_of, " AND ");
        let query = self.format(format!(
            "UPDATE users SET {}{where_sql}",
            sets.join(", ")
        ));

        let mut args = AnyArguments::default();
        for bind in binds.into_iter().chain(where_binds) {
            bind.add_to(&mut args);
        }

        let result: AnyQueryResult = sqlx::query_with(query.as_str(), args)
            .execute(conn)
            .await
            .map_err(AccountError::from)?;

        Ok(result.rows_affected())
    }

    async fn delete(&self, all_of: &[RecordFilter]) -> Result<u64, AccountError> {
        let conn = &(self.get_conn().await?);
        let (where_sql, binds) = build_where(all_of, " AND ");
        let query = self.format(format!("DELETE FROM users{where_sql}"));

        let mut args = AnyArguments::default();
        for bind in binds {
            bind.add_to(&mut args);
        }

        let result: AnyQueryResult = sqlx::query_with(query.as_str(), args)
            .execute(conn)
            .await
            .map_err(AccountError::from)?;

        Ok(result.rows_affected())
    }

    async fn iterate(
        &self,
        all_of: &[RecordFilter],
    ) -> Result<BoxStream<'static, Result<UserRecord, AccountError>>, AccountError> {
        let conn = self.get_conn().await?;
        let (where_sql, binds) = build_where(all_of, " AND ");
        let query = self.format(format!("SELECT {SELECT_COLUMNS} FROM users{where_sql}"));

        let stream = async_stream::try_stream! {
            let mut args = AnyArguments::default();
            for bind in binds {
                bind.add_to(&mut args);
            }

            let mut rows = sqlx::query_with(query.as_str(), args).fetch(&conn);
            while let Some(row) = rows.try_next().await.map_err(AccountError::from)? {
                yield row_to_record(&row)?;
            }
        };

        Ok(Box::pin(stream))
    }

    async fn purge(&self) -> Result<usize, AccountError> {
        let conn = &(self.get_conn().await?);
        let query: AnyQueryResult = sqlx::query("DELETE FROM users")
            .execute(conn)
            .await
            .map_err(AccountError::from)?;
        Ok(query.rows_affected() as usize)
    }
}

impl SqlBackend {
    async fn get_conn(&self) -> Result<AnyPool, AccountError> {
        if self.opts.car_mode.unwrap_or(CAR_MODE_DEFAULT) {
            self.generate_conn().await
        } else {
            self.conn
                .clone()
                .ok_or_else(|| AccountError::Generic("Connection not loaded".to_string()))
        }
    }

    async fn generate_conn(&self) -> Result<AnyPool, AccountError> {
        let opts: AnyPoolOptions = (&self.opts).into();
        log::trace!(target: "bastion", "Generating new connection ...");
        opts.connect(&self.url).await.map_err(AccountError::from)
    }

    fn format<T: Into<String>>(&self, input: T) -> String {
        match self.variant {
            SqlVariant::MySQL | SqlVariant::Sqlite => input.into(),

            SqlVariant::Postgre => {
                let input = input.into();
                let mut output = String::new();
                let mut idx = 0;
                for char in input.chars() {
                    if char != '?' {
                        output.push(char);
                    } else {
                        idx += 1;
                        let val = format!("${idx}");
                        output.push_str(val.as_str());
                    }
                }

                output
            }
        }
    }
}

impl TryFrom<BackendType> for SqlBackend {
    type Error = ();

    fn try_from(t: BackendType) -> Result<Self, ()> {
        let variant = (&t).try_into()?;

        match t {
            BackendType::SQLDatabase(url, opts) => Ok(Self {
                url,
                conn: None,
                variant,
                opts,
            }),

            _ => Err(()),
        }
    }
}

impl TryFrom<&'_ BackendType> for SqlVariant {
    type Error = ();

    fn try_from(this: &BackendType) -> Result<Self, ()> {
        if let BackendType::SQLDatabase(url, ..) = this {
            if url.starts_with("mysql") {
                return Ok(SqlVariant::MySQL);
            }

            if url.starts_with("postgres") {
                return Ok(SqlVariant::Postgre);
            }

            if url.starts_with("sqlite") {
                return Ok(SqlVariant::Sqlite);
            }
        }

        Err(())
    }
}
