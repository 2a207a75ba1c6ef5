//! Account Records
//!
//! The persisted representation of one account, its public view, and the
//! typed field vocabulary the storage backends consume. Filters and updates
//! are expressed as enums rather than strings so that no backend query
//! syntax leaks into the lifecycle engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum permitted account-name length
pub const MAX_NAME_LEN: usize = 128;
/// Minimum permitted account-name length
pub const MIN_NAME_LEN: usize = 3;

/// The full persisted state of one account. Never handed to external
/// callers; the public projection is [`UserInfo`]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UserRecord {
    /// Immutable 32-char identifier assigned at creation
    pub user_id: String,
    /// Optional unique display name, 3-128 alphanumeric characters
    pub name: Option<String>,
    /// Optional unique email address
    pub email: Option<String>,
    /// Tri-state: `None` = no confirmation tracked, `Some(false)` = pending,
    /// `Some(true)` = confirmed
    pub email_confirmed: Option<bool>,
    /// Present only while an email confirmation is pending
    pub email_validate_token: Option<String>,
    /// Argon2id PHC string; replaced wholesale, never partially updated
    pub password_hash: String,
    /// Present only while a password reset is pending
    pub password_reset_code: Option<String>,
    /// Paired 1:1 with `password_reset_code`; drives reset expiry
    pub password_reset_generated_at: Option<DateTime<Utc>>,
}

impl UserRecord {
    /// True if this record satisfies the given equality filter
    pub(crate) fn matches(&self, filter: &RecordFilter) -> bool {
        match filter {
            RecordFilter::UserId(v) => self.user_id == *v,
            RecordFilter::Name(v) => self.name.as_deref() == Some(v.as_str()),
            RecordFilter::Email(v) => self.email.as_deref() == Some(v.as_str()),
            RecordFilter::EmailConfirmed(v) => self.email_confirmed == *v,
            RecordFilter::EmailValidateToken(v) => {
                self.email_validate_token.as_deref() == Some(v.as_str())
            }
            RecordFilter::PasswordResetCode(v) => {
                self.password_reset_code.as_deref() == Some(v.as_str())
            }
        }
    }

    pub(crate) fn matches_all(&self, filters: &[RecordFilter]) -> bool {
        filters.iter().all(|f| self.matches(f))
    }
}

/// For passing the public view of a record. Excludes the password hash and
/// every pending secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserInfo {
    /// Unique user ID
    pub user_id: String,
    /// Display name, if set
    pub name: Option<String>,
    /// Email address, if set
    pub email: Option<String>,
    /// Email confirmation tri-state
    pub email_confirmed: Option<bool>,
}

impl From<&UserRecord> for UserInfo {
    fn from(record: &UserRecord) -> Self {
        Self {
            user_id: record.user_id.clone(),
            name: record.name.clone(),
            email: record.email.clone(),
            email_confirmed: record.email_confirmed,
        }
    }
}

/// An equality predicate on a single record field
#[derive(Clone, Debug, PartialEq)]
pub enum RecordFilter {
    UserId(String),
    Name(String),
    Email(String),
    /// Tri-state match: `None` matches records with no confirmation tracked
    EmailConfirmed(Option<bool>),
    EmailValidateToken(String),
    PasswordResetCode(String),
}

/// A new value for a single record field. The reset code and its generation
/// timestamp travel as one unit so they can never drift apart
#[derive(Clone, Debug, PartialEq)]
pub enum RecordUpdate {
    Name(String),
    Email(String),
    EmailConfirmed(Option<bool>),
    EmailValidateToken(Option<String>),
    PasswordHash(String),
    PasswordReset(Option<(String, DateTime<Utc>)>),
}

impl RecordUpdate {
    /// Applies this change to an in-memory record
    pub(crate) fn apply(&self, record: &mut UserRecord) {
        match self {
            RecordUpdate::Name(v) => record.name = Some(v.clone()),
            RecordUpdate::Email(v) => record.email = Some(v.clone()),
            RecordUpdate::EmailConfirmed(v) => record.email_confirmed = *v,
            RecordUpdate::EmailValidateToken(v) => record.email_validate_token = v.clone(),
            RecordUpdate::PasswordHash(v) => record.password_hash = v.clone(),
            RecordUpdate::PasswordReset(v) => match v {
                Some((code, at)) => {
                    record.password_reset_code = Some(code.clone());
                    record.password_reset_generated_at = Some(*at);
                }
                None => {
                    record.password_reset_code = None;
                    record.password_reset_generated_at = None;
                }
            },
        }
    }
}

/// Restricts [`users`](crate::account_manager::AccountManager::users) by the
/// email-confirmation tri-state
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfirmationFilter {
    /// Accounts whose email has been confirmed
    Confirmed,
    /// Accounts with a confirmation still pending
    Unconfirmed,
    /// Accounts with no confirmation tracked (no email, or no dispatcher configured)
    Unset,
}

impl ConfirmationFilter {
    pub(crate) fn as_filter(self) -> RecordFilter {
        match self {
            ConfirmationFilter::Confirmed => RecordFilter::EmailConfirmed(Some(true)),
            ConfirmationFilter::Unconfirmed => RecordFilter::EmailConfirmed(Some(false)),
            ConfirmationFilter::Unset => RecordFilter::EmailConfirmed(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> UserRecord {
        UserRecord {
            user_id: "c6a1e1e2a3b14f6e8d2f9b3c4d5e6f70".to_string(),
            name: Some("ward".to_string()),
            email: Some("ward@example.com".to_string()),
            email_confirmed: Some(false),
            email_validate_token: Some("tok".to_string()),
            password_hash: "$argon2id$stub".to_string(),
            password_reset_code: None,
            password_reset_generated_at: None,
        }
    }

    #[test]
    fn filter_matching() {
        let record = record();
        assert!(record.matches(&RecordFilter::Name("ward".to_string())));
        assert!(!record.matches(&RecordFilter::Name("notward".to_string())));
        assert!(record.matches(&RecordFilter::EmailConfirmed(Some(false))));
        assert!(!record.matches(&RecordFilter::EmailConfirmed(None)));
        assert!(record.matches_all(&[
            RecordFilter::UserId(record.user_id.clone()),
            RecordFilter::EmailValidateToken("tok".to_string()),
        ]));
    }

    #[test]
    fn reset_fields_move_together() {
        let mut record = record();
        let at = chrono::Utc::now();
        RecordUpdate::PasswordReset(Some(("code".to_string(), at))).apply(&mut record);
        assert_eq!(record.password_reset_code.as_deref(), Some("code"));
        assert_eq!(record.password_reset_generated_at, Some(at));

        RecordUpdate::PasswordReset(None).apply(&mut record);
        assert!(record.password_reset_code.is_none());
        assert!(record.password_reset_generated_at.is_none());
    }

    #[test]
    fn info_projection_excludes_secrets() {
        let record = record();
        let info = UserInfo::from(&record);
        assert_eq!(info.user_id, record.user_id);
        assert_eq!(info.email_confirmed, Some(false));
    }
}
