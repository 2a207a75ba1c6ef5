//! # Bastion Account Management
//!
//! An account lifecycle library: creation, authentication, email confirmation,
//! password resets, and mutation of user identity records over interchangeable
//! storage backends, with optional asynchronous email delivery.
//!
//! ## Features
//!
//! * **Account Lifecycle**
//!   - Account creation with name/email uniqueness enforcement
//!   - Login with deliberately undifferentiated failure reporting
//!   - Email confirmation and password-reset flows built on single-use tokens
//!   - Field updates (name, email, password) and irreversible deletion
//!
//! * **Backend Support**
//!   - In-memory storage (always available; ideal for tests)
//!   - SQL databases via the `sql` feature (MySQL, PostgreSQL, SQLite)
//!   - Redis document storage via the `redis` feature
//!
//! * **Security**
//!   - Argon2id password hashing with per-hash random salts
//!   - Rehash-and-compare token verification (timing-side-channel resistant)
//!   - Coarse error taxonomy where error differences would leak information
//!
//! * **Notifications**
//!   - Fire-and-forget confirmation/reset email dispatch
//!   - SMTP transport via the `smtp` feature, or any custom [`MailTransport`]
//!
//! ## Usage Example
//!
//! ```rust
//! use bastion_account::prelude::*;
//!
//! async fn example() -> Result<(), AccountError> {
//!     let manager =
//!         AccountManager::new(BackendType::InMemory, AccountSettings::default()).await?;
//!
//!     let (info, user) = manager
//!         .create_account("S]Q}67=uLetG{r,_8{", Some("ward"), None)
//!         .await?;
//!
//!     let (_info, _user) = manager
//!         .login("S]Q}67=uLetG{r,_8{", Some("ward"), None, true)
//!         .await?;
//!
//!     user.delete().await?;
//!     let _ = info;
//!     Ok(())
//! }
//! ```
//!
//! ## Important Notes
//!
//! * The uniqueness pre-check is advisory; the backend constraint is
//!   authoritative. Racing inserts surface as [`AccountError::DetailsExist`].
//! * No operation blocks on email delivery; delivery failures are logged by
//!   the dispatcher, never surfaced to lifecycle callers.
//! * Records are never cached in-process; every operation reads the backend.
//!
//! ## Feature Flags
//!
//! * `sql`: Enable the SQL backend (sqlx, all databases)
//! * `redis`: Enable the redis document backend
//! * `smtp`: Enable the lettre SMTP mail transport
//!
//! [`MailTransport`]: crate::notifier::MailTransport
//! [`AccountError::DetailsExist`]: crate::misc::AccountError
#![forbid(unsafe_code)]
#![deny(
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    variant_size_differences,
    unused_features,
    unused_results
)]

/// Standard imports for this library
pub mod prelude {
    pub use crate::account_manager::{AccountManager, AccountSettings};
    pub use crate::auth::policy::{PasswordPolicy, PolicyRule};
    pub use crate::backend::BackendType;
    pub use crate::misc::AccountError;
    pub use crate::notifier::{MessageKind, MessageLayouts, NotificationDispatcher};
    pub use crate::user_handle::UserHandle;
    pub use crate::user_record::{ConfirmationFilter, UserInfo};
}

/// The lifecycle engine: validates input, enforces uniqueness, and drives
/// account state transitions against the configured backend
pub mod account_manager;
/// Credential hashing, password policy, and the confirmation/reset token protocol
pub mod auth;
/// For handling the different storage backends
pub mod backend;
/// For errors
pub mod misc;
/// Fire-and-forget confirmation/reset message dispatch
pub mod notifier;
/// Per-user operation handle
pub mod user_handle;
/// The persisted account record, its public view, and the typed field vocabulary
pub mod user_record;
