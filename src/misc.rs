//! Error Handling
//!
//! The crate-wide error type. The taxonomy is deliberately coarse where error
//! differences would leak information to a caller probing for accounts
//! (login, email confirmation, password reset), and specific where detail
//! helps a legitimate caller fix its input (creation-time validation).

use crate::auth::policy::PolicyRule;

/// Default Error type for this crate
#[derive(Debug)]
#[allow(variant_size_differences)]
pub enum AccountError {
    /// Backend I/O error, including failed serialization of stored records
    Storage(String),
    /// Exactly one of name/email was required, but neither or both were given
    MissingIdentifier,
    /// Account name shorter than 3 or longer than 128 characters
    NameLengthInvalid,
    /// Account name contains non-alphanumeric characters
    NameInvalidCharacters,
    /// The password violated the listed policy rules
    PasswordPolicy(Vec<PolicyRule>),
    /// The email address is not syntactically valid
    EmailInvalid(String),
    /// Another account already uses the given name/email
    DetailsExist,
    /// Unknown identifier or wrong password; deliberately undifferentiated
    InvalidLogin,
    /// Unknown email, wrong code, or no confirmation pending; deliberately undifferentiated
    UnableToConfirmEmail,
    /// No reset pending, code expired, or code invalid; deliberately undifferentiated
    PasswordResetInvalid,
    /// The backing record no longer exists
    NotFound,
    /// Generic error
    Generic(String),
}

impl AccountError {
    pub(crate) fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Generic(msg.into())
    }

    /// Consumes self and returns the underlying error message
    pub fn into_string(self) -> String {
        match self {
            AccountError::Storage(e) => e,
            AccountError::Generic(e) => e,
            AccountError::MissingIdentifier => "Name or email must be provided".to_string(),
            AccountError::NameLengthInvalid => {
                "Name is over 128 or below 3 characters".to_string()
            }
            AccountError::NameInvalidCharacters => {
                "Account name can only contain alphanumeric characters".to_string()
            }
            AccountError::PasswordPolicy(fails) => {
                format!("Password doesn't meet password policy: {fails:?}")
            }
            AccountError::EmailInvalid(e) => format!("Email address invalid: {e}"),
            AccountError::DetailsExist => "Account details already used".to_string(),
            AccountError::InvalidLogin => "Provided details are incorrect".to_string(),
            AccountError::UnableToConfirmEmail => {
                "Unable to confirm email with given details".to_string()
            }
            AccountError::PasswordResetInvalid => "Password reset code is invalid".to_string(),
            AccountError::NotFound => "No user found with those details".to_string(),
        }
    }
}

impl std::fmt::Display for AccountError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for AccountError {}

impl From<std::io::Error> for AccountError {
    fn from(e: std::io::Error) -> Self {
        AccountError::Storage(format!("{e}"))
    }
}

impl From<serde_json::Error> for AccountError {
    fn from(e: serde_json::Error) -> Self {
        AccountError::Storage(format!("{e}"))
    }
}

impl From<chrono::ParseError> for AccountError {
    fn from(e: chrono::ParseError) -> Self {
        AccountError::Storage(format!("{e}"))
    }
}

#[cfg(feature = "sql")]
impl From<sqlx::Error> for AccountError {
    fn from(e: sqlx::Error) -> Self {
        // unique-index rejections are the authoritative uniqueness check, so
        // they surface as the same error as the advisory pre-check
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return AccountError::DetailsExist;
            }
        }

        AccountError::Storage(format!("{e:?}"))
    }
}

#[cfg(feature = "redis")]
impl From<redis_base::RedisError> for AccountError {
    fn from(e: redis_base::RedisError) -> Self {
        AccountError::Storage(format!("{e}"))
    }
}
