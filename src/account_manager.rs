//! # Account Manager
//!
//! The account manager is the lifecycle engine: it validates input, enforces
//! name/email uniqueness, drives the confirmation and reset state machines,
//! and coordinates with the notification dispatcher. It provides a unified
//! interface over whichever storage backend was selected at construction.
//!
//! ## Important Notes
//!
//! * The manager is stateless between calls; every operation reads the
//!   backend. Cloning is cheap and clones share the backend connection.
//! * The `exists` pre-check before inserts is an optimization. The backend
//!   unique constraint is the authoritative uniqueness check, and both paths
//!   report [`AccountError::DetailsExist`].
//! * Where error detail would let a caller enumerate accounts (login,
//!   confirmation, resets), failures are deliberately indistinguishable.

use lazy_static::lazy_static;
use regex::Regex;

use chrono::Duration;
use futures::stream::BoxStream;
use futures::StreamExt;
use uuid::Uuid;

use crate::auth;
use crate::auth::policy::PasswordPolicy;
use crate::auth::token;
use crate::backend::memory::MemoryBackend;
use crate::backend::{BackendType, PersistenceHandler};
use crate::misc::AccountError;
use crate::notifier::{MessageKind, NotificationDispatcher};
use crate::user_handle::UserHandle;
use crate::user_record::{
    ConfirmationFilter, RecordFilter, RecordUpdate, UserInfo, UserRecord, MAX_NAME_LEN,
    MIN_NAME_LEN,
};

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

/// Configuration for the account manager
#[derive(Clone)]
pub struct AccountSettings {
    /// Policy applied to every new password
    pub password_policy: PasswordPolicy,
    /// When present, confirmation/reset messages are dispatched through it
    /// and logins require a confirmed email by default
    pub dispatcher: Option<NotificationDispatcher>,
    /// Amount of time until a password reset code expires
    pub password_reset_expires: Duration,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            password_policy: PasswordPolicy::default(),
            dispatcher: None,
            password_reset_expires: Duration::hours(24),
        }
    }
}

/// The default manager for handling the list of users stored on the backend.
/// It also allows for user creation, login, and the confirmation/reset flows
#[derive(Clone)]
pub struct AccountManager {
    pub(crate) persistence_handler: PersistenceHandler,
    pub(crate) password_policy: PasswordPolicy,
    pub(crate) dispatcher: Option<NotificationDispatcher>,
    pub(crate) password_reset_expires: Duration,
    backend_ty: BackendType,
}

impl AccountManager {
    /// Connects the selected backend and verifies connectivity before
    /// returning self
    pub async fn new(
        backend_type: BackendType,
        settings: AccountSettings,
    ) -> Result<Self, AccountError> {
        let persistence_handler = match &backend_type {
            BackendType::InMemory => {
                let backend = MemoryBackend::default();
                PersistenceHandler::create(backend).await?
            }

            #[cfg(feature = "sql")]
            BackendType::SQLDatabase(..) => {
                use crate::backend::sql_backend::SqlBackend;
                let backend = SqlBackend::try_from(backend_type.clone()).map_err(|_| AccountError::Generic("Invalid database URL format. Please check documentation for preferred format".to_string()))?;
                PersistenceHandler::create(backend).await?
            }

            #[cfg(feature = "redis")]
            BackendType::Redis(url, opts) => {
                use crate::backend::redis_backend::RedisBackend;
                let backend = RedisBackend::new(url.clone(), opts.clone());
                PersistenceHandler::create(backend).await?
            }
        };

        if !persistence_handler.is_connected().await? {
            return Err(AccountError::msg(
                "Unable to connect to remote database via account manager",
            ));
        }

        log::info!(target: "bastion", "Successfully established connection to backend {:?}...", backend_type);

        let AccountSettings {
            password_policy,
            dispatcher,
            password_reset_expires,
        } = settings;

        Ok(Self {
            persistence_handler,
            password_policy,
            dispatcher,
            password_reset_expires,
            backend_ty: backend_type,
        })
    }

    /// Used to create a user account. At least one of `name`/`email` must be
    /// given. If a dispatcher is configured and an email is given, a
    /// confirmation token is minted and dispatched asynchronously after the
    /// record is durably inserted; the call never waits on delivery
    pub async fn create_account(
        &self,
        password: &str,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<(UserInfo, UserHandle), AccountError> {
        if name.is_none() && email.is_none() {
            return Err(AccountError::MissingIdentifier);
        }

        self.validate_details(name, Some(password))?;

        if let Some(email) = email {
            Self::validate_email(email)?;
        }

        let user_id = Uuid::new_v4().simple().to_string();

        let mut any_of = vec![RecordFilter::UserId(user_id.clone())];
        if let Some(name) = name {
            any_of.push(RecordFilter::Name(name.to_string()));
        }
        if let Some(email) = email {
            any_of.push(RecordFilter::Email(email.to_string()));
        }

        // advisory pre-check; the backend constraint still rejects racing inserts
        if self.persistence_handler.exists(&any_of).await? {
            return Err(AccountError::DetailsExist);
        }

        let confirmation = match (&self.dispatcher, email) {
            (Some(_), Some(_)) => Some(token::mint()),
            _ => None,
        };

        let record = UserRecord {
            user_id,
            name: name.map(str::to_string),
            email: email.map(str::to_string),
            email_confirmed: confirmation.as_ref().map(|_| false),
            email_validate_token: confirmation.clone(),
            password_hash: auth::hash_password(password)?,
            password_reset_code: None,
            password_reset_generated_at: None,
        };

        self.persistence_handler.insert(&record).await?;
        log::trace!(target: "bastion", "Created account {}", record.user_id);

        if let (Some(dispatcher), Some(email), Some(code)) =
            (&self.dispatcher, &record.email, &confirmation)
        {
            dispatcher.dispatch(email, code, MessageKind::Confirm);
        }

        Ok((UserInfo::from(&record), self.user(record.user_id)))
    }

    /// Used to validate a user's login. Exactly one of `name`/`email` must
    /// be given. A missing record and a wrong password are reported
    /// identically; when a dispatcher is configured and
    /// `require_email_confirmed` is set, an unconfirmed email is too
    pub async fn login(
        &self,
        password: &str,
        name: Option<&str>,
        email: Option<&str>,
        require_email_confirmed: bool,
    ) -> Result<(UserInfo, UserHandle), AccountError> {
        let search = match (name, email) {
            (Some(name), None) => RecordFilter::Name(name.to_string()),
            (None, Some(email)) => RecordFilter::Email(email.to_string()),
            _ => return Err(AccountError::MissingIdentifier),
        };

        let record = self
            .persistence_handler
            .get(std::slice::from_ref(&search))
            .await?
            .ok_or(AccountError::InvalidLogin)?;

        if require_email_confirmed
            && self.dispatcher.is_some()
            && record.email.is_some()
            && record.email_confirmed != Some(true)
        {
            return Err(AccountError::InvalidLogin);
        }

        if !auth::verify_password(password, &record.password_hash) {
            return Err(AccountError::InvalidLogin);
        }

        Ok((UserInfo::from(&record), self.user(record.user_id)))
    }

    /// Used to confirm an email from the code the user was sent. A wrong
    /// email and a wrong code fail identically. Success sets the confirmed
    /// flag and consumes the token in one conditional write, so a second
    /// confirmation with the same code always fails
    pub async fn confirm_email(
        &self,
        email: &str,
        given_code: &str,
    ) -> Result<UserHandle, AccountError> {
        let record = self
            .persistence_handler
            .get(&[RecordFilter::Email(email.to_string())])
            .await?
            .ok_or(AccountError::UnableToConfirmEmail)?;

        let stored = record
            .email_validate_token
            .ok_or(AccountError::UnableToConfirmEmail)?;

        if !token::verify(&stored, given_code) {
            return Err(AccountError::UnableToConfirmEmail);
        }

        let matched = self
            .persistence_handler
            .update(
                &[
                    RecordFilter::UserId(record.user_id.clone()),
                    RecordFilter::EmailValidateToken(stored),
                ],
                &[
                    RecordUpdate::EmailConfirmed(Some(true)),
                    RecordUpdate::EmailValidateToken(None),
                ],
            )
            .await?;

        // zero matches: a concurrent caller already consumed the token
        if matched == 0 {
            return Err(AccountError::UnableToConfirmEmail);
        }

        Ok(self.user(record.user_id))
    }

    /// Used to convert a name or email into a user. Exactly one of
    /// `name`/`email` must be given
    pub async fn to_user(
        &self,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<(UserInfo, UserHandle), AccountError> {
        let search = match (name, email) {
            (Some(name), None) => RecordFilter::Name(name.to_string()),
            (None, Some(email)) => RecordFilter::Email(email.to_string()),
            _ => return Err(AccountError::MissingIdentifier),
        };

        let record = self
            .persistence_handler
            .get(std::slice::from_ref(&search))
            .await?
            .ok_or(AccountError::NotFound)?;

        Ok((UserInfo::from(&record), self.user(record.user_id)))
    }

    /// Used to interact with a user by id. Performs no I/O; a stale id
    /// surfaces as [`AccountError::NotFound`] from the handle's operations
    pub fn user<T: Into<String>>(&self, user_id: T) -> UserHandle {
        UserHandle::new(self.clone(), user_id.into())
    }

    /// Used to list users as a lazy stream of (view, handle) pairs, optionally
    /// restricted by the email-confirmation tri-state
    pub async fn users(
        &self,
        filter: Option<ConfirmationFilter>,
    ) -> Result<BoxStream<'static, Result<(UserInfo, UserHandle), AccountError>>, AccountError>
    {
        let filters: Vec<RecordFilter> = filter.map(|f| vec![f.as_filter()]).unwrap_or_default();
        let stream = self.persistence_handler.iterate(&filters).await?;

        let this = self.clone();
        Ok(stream
            .map(move |result| {
                result.map(|record| {
                    let info = UserInfo::from(&record);
                    let handle = this.user(record.user_id);
                    (info, handle)
                })
            })
            .boxed())
    }

    /// Returns the number of accounts purged
    pub async fn purge(&self) -> Result<usize, AccountError> {
        self.persistence_handler.purge().await
    }

    /// Gets the backend type
    pub fn get_backend_type(&self) -> &BackendType {
        &self.backend_ty
    }

    /// Returns the persistence handler
    #[doc(hidden)]
    pub fn get_persistence_handler(&self) -> &PersistenceHandler {
        &self.persistence_handler
    }

    pub(crate) fn validate_details(
        &self,
        name: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), AccountError> {
        if let Some(name) = name {
            let name_len = name.chars().count();
            if !(MIN_NAME_LEN..=MAX_NAME_LEN).contains(&name_len) {
                return Err(AccountError::NameLengthInvalid);
            }

            if !name.chars().all(char::is_alphanumeric) {
                return Err(AccountError::NameInvalidCharacters);
            }
        }

        if let Some(password) = password {
            let fails = self.password_policy.test(password);
            if !fails.is_empty() {
                return Err(AccountError::PasswordPolicy(fails));
            }
        }

        Ok(())
    }

    pub(crate) fn validate_email(email: &str) -> Result<(), AccountError> {
        if email.len() > 255 || !EMAIL_RE.is_match(email) {
            return Err(AccountError::EmailInvalid(email.to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("example@example.com")]
    #[case("wardpearce@pm.me")]
    #[case("a@b.co")]
    fn accepts_valid_emails(#[case] email: &str) {
        AccountManager::validate_email(email).unwrap();
    }

    #[rstest]
    #[case("something@.com")]
    #[case("kkd@@pm.me")]
    #[case("doens'texist")]
    #[case("no at sign@x.com")]
    #[case("trailing@dot.")]
    #[case("")]
    fn rejects_invalid_emails(#[case] email: &str) {
        assert!(matches!(
            AccountManager::validate_email(email),
            Err(AccountError::EmailInvalid(_))
        ));
    }
}
