//! Redis document backend. Each account is one JSON document at
//! `account:id:{user_id}`, with unique secondary indexes
//! `account:name:{name}` and `account:email:{email}` holding the user id.
//! Inserts run as a Lua script so the NX check across all three keys is
//! atomic, making the backend (not the advisory pre-check) the authority
//! on uniqueness. Updates and deletes resolve the record first and then
//! apply one atomic pipeline; the read-then-write gap on token consumption
//! is covered by the engine's equality-filtered conditional update and is
//! exercised in the property tests.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use mobc::{async_trait as mobc_async_trait, Connection, Manager, Pool};
use redis_base::{AsyncCommands, Client, ErrorKind, Script};

use crate::backend::BackendConnection;
use crate::misc::AccountError;
use crate::user_record::{RecordFilter, RecordUpdate, UserRecord};

const RECORD_KEY_PREFIX: &str = "account:id:";
const NAME_KEY_PREFIX: &str = "account:name:";
const EMAIL_KEY_PREFIX: &str = "account:email:";

// KEYS[1] = record key, KEYS[2..] = unique index keys
const INSERT_SCRIPT: &str = r"
for i = 1, #KEYS do
    if redis.call('exists', KEYS[i]) == 1 then
        return 0
    end
end
redis.call('set', KEYS[1], ARGV[1])
for i = 2, #KEYS do
    redis.call('set', KEYS[i], ARGV[2])
end
return 1
";

/// Backend struct for redis
pub struct RedisBackend {
    url: String,
    conn_options: RedisConnectionOptions,
    conn: Option<RedisPool>,
}

pub type RedisPool = Pool<RedisConnectionManager>;
pub type RedisConn = Connection<RedisConnectionManager>;

#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct RedisConnectionOptions {
    /// Sets the number of connections. Default 10
    pub max_open: Option<u64>,
    pub max_idle: Option<u64>,
    pub max_lifetime: Option<Duration>,
    pub max_idle_lifetime: Option<Duration>,
    pub get_timeout: Option<Duration>,
    pub health_check_interval: Option<Duration>,
    pub health_check: Option<bool>,
}

pub struct RedisConnectionManager {
    client: Client,
}

impl RedisConnectionManager {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[mobc_async_trait]
impl Manager for RedisConnectionManager {
    type Connection = redis_base::aio::Connection;
    type Error = redis_base::RedisError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = self.client.get_async_connection().await?;
        Ok(conn)
    }

    async fn check(&self, mut conn: Self::Connection) -> Result<Self::Connection, Self::Error> {
        let pong: String = redis_base::cmd("PING").query_async(&mut conn).await?;
        if pong.as_str() != "PONG" {
            return Err((ErrorKind::ResponseError, "pong response error").into());
        }
        Ok(conn)
    }
}

impl RedisBackend {
    pub fn new(url: String, conn_options: RedisConnectionOptions) -> Self {
        Self {
            url,
            conn_options,
            conn: None,
        }
    }

    async fn get_conn(&self) -> Result<RedisConn, AccountError> {
        self.get_pool()?
            .get()
            .await
            .map_err(|err| AccountError::msg(err.to_string()))
    }

    fn get_pool(&self) -> Result<RedisPool, AccountError> {
        self.conn
            .clone()
            .ok_or_else(|| AccountError::Generic("Connection not loaded".to_string()))
    }

    // the key a filter can be answered from directly, if any
    fn direct_key(filter: &RecordFilter) -> Option<String> {
        match filter {
            RecordFilter::UserId(id) => Some(record_key(id)),
            RecordFilter::Name(name) => Some(name_key(name)),
            RecordFilter::Email(email) => Some(email_key(email)),
            _ => None,
        }
    }

    async fn fetch_by_key(
        &self,
        conn: &mut RedisConn,
        key: &str,
    ) -> Result<Option<UserRecord>, AccountError> {
        let json: Option<String> = (&mut **conn).get(key).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn fetch_by_index(
        &self,
        conn: &mut RedisConn,
        index_key: &str,
    ) -> Result<Option<UserRecord>, AccountError> {
        let user_id: Option<String> = (&mut **conn).get(index_key).await?;
        match user_id {
            Some(id) => self.fetch_by_key(conn, &record_key(&id)).await,
            None => Ok(None),
        }
    }

    async fn resolve(
        &self,
        conn: &mut RedisConn,
        all_of: &[RecordFilter],
    ) -> Result<Option<UserRecord>, AccountError> {
        let primary = all_of
            .iter()
            .find(|f| matches!(f, RecordFilter::UserId(_)))
            .or_else(|| {
                all_of
                    .iter()
                    .find(|f| matches!(f, RecordFilter::Name(_) | RecordFilter::Email(_)))
            });

        let record = match primary {
            Some(RecordFilter::UserId(id)) => {
                self.fetch_by_key(conn, &record_key(id)).await?
            }
            Some(RecordFilter::Name(name)) => {
                self.fetch_by_index(conn, &name_key(name)).await?
            }
            Some(RecordFilter::Email(email)) => {
                self.fetch_by_index(conn, &email_key(email)).await?
            }
            // no keyed predicate; fall back to a full walk
            _ => return self.scan_for(conn, all_of).await,
        };

        Ok(record.filter(|r| r.matches_all(all_of)))
    }

    async fn scan_for(
        &self,
        conn: &mut RedisConn,
        all_of: &[RecordFilter],
    ) -> Result<Option<UserRecord>, AccountError> {
        let keys = scan_keys(conn, &format!("{RECORD_KEY_PREFIX}*")).await?;
        for key in keys {
            if let Some(record) = self.fetch_by_key(conn, &key).await? {
                if record.matches_all(all_of) {
                    return Ok(Some(record));
                }
            }
        }

        Ok(None)
    }
}

async fn scan_keys(conn: &mut RedisConn, pattern: &str) -> Result<Vec<String>, AccountError> {
    let mut keys = Vec::new();
    let mut iter = (&mut **conn).scan_match::<_, String>(pattern).await?;
    while let Some(key) = iter.next_item().await {
        keys.push(key);
    }
    Ok(keys)
}

fn record_key(user_id: &str) -> String {
    format!("{RECORD_KEY_PREFIX}{user_id}")
}

fn name_key(name: &str) -> String {
    format!("{NAME_KEY_PREFIX}{name}")
}

fn email_key(email: &str) -> String {
    format!("{EMAIL_KEY_PREFIX}{email}")
}

fn index_keys(record: &UserRecord) -> Vec<String> {
    let mut keys = Vec::with_capacity(2);
    if let Some(name) = &record.name {
        keys.push(name_key(name));
    }
    if let Some(email) = &record.email {
        keys.push(email_key(email));
    }
    keys
}

#[async_trait]
impl BackendConnection for RedisBackend {
    async fn connect(&mut self) -> Result<(), AccountError> {
        let client = Client::open(self.url.as_str())?;
        let manager = RedisConnectionManager::new(client);
        let mut builder = Pool::builder();

        if let (Some(max_open), Some(max_idle)) = (
            self.conn_options.max_open.as_ref(),
            self.conn_options.max_idle.as_ref(),
        ) {
            if *max_idle > *max_open {
                return Err(AccountError::msg(
                    "Max open must be greater than or equal to max idle",
                ));
            }
        }

        if let Some(val) = self.conn_options.max_open.as_ref() {
            builder = builder.max_open(*val);
        }

        if let Some(val) = self.conn_options.max_idle.as_ref() {
            builder = builder.max_idle(*val);
        }

        if let Some(val) = self.conn_options.max_lifetime.as_ref() {
            builder = builder.max_lifetime(Some(*val));
        }

        if let Some(val) = self.conn_options.max_idle_lifetime.as_ref() {
            builder = builder.max_idle_lifetime(Some(*val));
        }

        if let Some(val) = self.conn_options.get_timeout.as_ref() {
            builder = builder.get_timeout(Some(*val));
        }

        if let Some(val) = self.conn_options.health_check_interval.as_ref() {
            builder = builder.health_check_interval(Some(*val));
        }

        if let Some(val) = self.conn_options.health_check.as_ref() {
            builder = builder.test_on_check_out(*val);
        }

        self.conn = Some(builder.build(manager));

        Ok(())
    }

    async fn is_connected(&self) -> Result<bool, AccountError> {
        self.get_conn().await.map(|_| true)
    }

    async fn exists(&self, any_of: &[RecordFilter]) -> Result<bool, AccountError> {
        let mut conn = self.get_conn().await?;

        for filter in any_of {
            let found = match Self::direct_key(filter) {
                Some(key) => (&mut *conn).exists::<_, bool>(key).await?,
                None => self
                    .resolve(&mut conn, std::slice::from_ref(filter))
                    .await?
                    .is_some(),
            };

            if found {
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn get(&self, all_of: &[RecordFilter]) -> Result<Option<UserRecord>, AccountError> {
        let mut conn = self.get_conn().await?;
        self.resolve(&mut conn, all_of).await
    }

    async fn insert(&self, record: &UserRecord) -> Result<(), AccountError> {
        let mut conn = self.get_conn().await?;
        let json = serde_json::to_string(record)?;

        let script = Script::new(INSERT_SCRIPT);
        let mut invocation = script.prepare_invoke();
        let _ = invocation.key(record_key(&record.user_id));
        for key in index_keys(record) {
            let _ = invocation.key(key);
        }
        let _ = invocation.arg(json).arg(record.user_id.clone());

        let inserted: i64 = invocation.invoke_async(&mut *conn).await?;
        if inserted == 0 {
            return Err(AccountError::DetailsExist);
        }

        Ok(())
    }

    async fn update(
        &self,
        all_of: &[RecordFilter],
        changes: &[RecordUpdate],
    ) -> Result<u64, AccountError> {
        let mut conn = self.get_conn().await?;

        let current = match self.resolve(&mut conn, all_of).await? {
            Some(record) => record,
            None => return Ok(0),
        };

        let mut next = current.clone();
        for change in changes {
            change.apply(&mut next);
        }

        // advisory check on re-pointed unique indexes; the engine pre-checks too
        if next.name != current.name {
            if let Some(name) = &next.name {
                if (&mut *conn).exists::<_, bool>(name_key(name)).await? {
                    return Err(AccountError::DetailsExist);
                }
            }
        }
        if next.email != current.email {
            if let Some(email) = &next.email {
                if (&mut *conn).exists::<_, bool>(email_key(email)).await? {
                    return Err(AccountError::DetailsExist);
                }
            }
        }

        let mut pipe = redis_base::pipe();
        let pipe_ref = pipe.atomic();
        let _ = pipe_ref
            .set(record_key(&next.user_id), serde_json::to_string(&next)?)
            .ignore();

        if next.name != current.name {
            if let Some(old) = &current.name {
                let _ = pipe_ref.del(name_key(old)).ignore();
            }
            if let Some(new) = &next.name {
                let _ = pipe_ref.set(name_key(new), next.user_id.clone()).ignore();
            }
        }

        if next.email != current.email {
            if let Some(old) = &current.email {
                let _ = pipe_ref.del(email_key(old)).ignore();
            }
            if let Some(new) = &next.email {
                let _ = pipe_ref.set(email_key(new), next.user_id.clone()).ignore();
            }
        }

        pipe_ref.query_async::<_, ()>(&mut *conn).await?;

        Ok(1)
    }

    async fn delete(&self, all_of: &[RecordFilter]) -> Result<u64, AccountError> {
        let mut conn = self.get_conn().await?;

        let current = match self.resolve(&mut conn, all_of).await? {
            Some(record) => record,
            None => return Ok(0),
        };

        let mut pipe = redis_base::pipe();
        let pipe_ref = pipe.atomic();
        let _ = pipe_ref.del(record_key(&current.user_id)).ignore();
        for key in index_keys(&current) {
            let _ = pipe_ref.del(key).ignore();
        }

        pipe_ref.query_async::<_, ()>(&mut *conn).await?;

        Ok(1)
    }

    async fn iterate(
        &self,
        all_of: &[RecordFilter],
    ) -> Result<BoxStream<'static, Result<UserRecord, AccountError>>, AccountError> {
        let pool = self.get_pool()?;
        let all_of = all_of.to_vec();

        let stream = async_stream::try_stream! {
            let mut conn = pool
                .get()
                .await
                .map_err(|err| AccountError::msg(err.to_string()))?;

            // SCAN walks an eventually-consistent view; records written after
            // this call begins may or may not appear
            let keys = scan_keys(&mut conn, &format!("{RECORD_KEY_PREFIX}*")).await?;

            for key in keys {
                let json: Option<String> = (&mut *conn).get(&key).await?;
                if let Some(json) = json {
                    let record: UserRecord = serde_json::from_str(&json)?;
                    if record.matches_all(&all_of) {
                        yield record;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn purge(&self) -> Result<usize, AccountError> {
        let mut conn = self.get_conn().await?;
        let keys = scan_keys(&mut conn, "account:*").await?;
        let count = keys
            .iter()
            .filter(|key| key.starts_with(RECORD_KEY_PREFIX))
            .count();

        if !keys.is_empty() {
            let mut pipe = redis_base::pipe();
            let pipe_ref = pipe.atomic();
            for key in &keys {
                let _ = pipe_ref.del(key).ignore();
            }
            pipe_ref.query_async::<_, ()>(&mut *conn).await?;
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(record_key("abc"), "account:id:abc");
        assert_eq!(name_key("ward"), "account:name:ward");
        assert_eq!(email_key("a@b.com"), "account:email:a@b.com");
    }

    #[test]
    fn index_keys_skip_absent_fields() {
        let record = UserRecord {
            user_id: "abc".to_string(),
            name: Some("ward".to_string()),
            email: None,
            email_confirmed: None,
            email_validate_token: None,
            password_hash: "$argon2id$stub".to_string(),
            password_reset_code: None,
            password_reset_generated_at: None,
        };
        assert_eq!(index_keys(&record), vec!["account:name:ward".to_string()]);
    }
}
