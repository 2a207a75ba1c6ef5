//! Per-User Operations
//!
//! A [`UserHandle`] is a cheap, cloneable reference to one account. It holds
//! no record state and every operation reads the backend, so a handle whose
//! record was deleted by another caller simply starts failing with
//! [`AccountError::NotFound`].

use chrono::Utc;

use crate::account_manager::AccountManager;
use crate::auth;
use crate::auth::token;
use crate::misc::AccountError;
use crate::notifier::MessageKind;
use crate::user_record::{RecordFilter, RecordUpdate, UserInfo, UserRecord};

/// Used to interact with one user
#[derive(Clone)]
pub struct UserHandle {
    manager: AccountManager,
    user_id: String,
}

impl std::fmt::Debug for UserHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserHandle")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl UserHandle {
    pub(crate) fn new(manager: AccountManager, user_id: String) -> Self {
        Self { manager, user_id }
    }

    /// The id of the account this handle points at
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn id_filter(&self) -> RecordFilter {
        RecordFilter::UserId(self.user_id.clone())
    }

    async fn raw(&self) -> Result<Option<UserRecord>, AccountError> {
        self.manager
            .persistence_handler
            .get(&[self.id_filter()])
            .await
    }

    /// Used to get details on the user
    pub async fn get(&self) -> Result<UserInfo, AccountError> {
        self.raw()
            .await?
            .as_ref()
            .map(UserInfo::from)
            .ok_or(AccountError::NotFound)
    }

    /// Used to update the password when the current password is known. The
    /// current password must verify before the new one is accepted
    pub async fn update_password(
        &self,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AccountError> {
        let record = self.raw().await?.ok_or(AccountError::InvalidLogin)?;

        if !auth::verify_password(current_password, &record.password_hash) {
            return Err(AccountError::InvalidLogin);
        }

        self.manager.validate_details(None, Some(new_password))?;

        let hash = auth::hash_password(new_password)?;
        let matched = self
            .manager
            .persistence_handler
            .update(&[self.id_filter()], &[RecordUpdate::PasswordHash(hash)])
            .await?;

        if matched == 0 {
            return Err(AccountError::NotFound);
        }

        Ok(())
    }

    /// Used to change the display name. The new name is validated and
    /// checked for uniqueness before it is applied
    pub async fn update_name(&self, new_name: &str) -> Result<(), AccountError> {
        self.manager.validate_details(Some(new_name), None)?;

        if self
            .manager
            .persistence_handler
            .exists(&[RecordFilter::Name(new_name.to_string())])
            .await?
        {
            return Err(AccountError::DetailsExist);
        }

        let matched = self
            .manager
            .persistence_handler
            .update(
                &[self.id_filter()],
                &[RecordUpdate::Name(new_name.to_string())],
            )
            .await?;

        if matched == 0 {
            return Err(AccountError::NotFound);
        }

        Ok(())
    }

    /// Used to change the email address. With a dispatcher configured the
    /// account re-enters the unconfirmed state and a fresh confirmation
    /// token supersedes any pending one; without, the confirmation state is
    /// cleared entirely
    pub async fn update_email(&self, new_email: &str) -> Result<(), AccountError> {
        AccountManager::validate_email(new_email)?;

        if self
            .manager
            .persistence_handler
            .exists(&[RecordFilter::Email(new_email.to_string())])
            .await?
        {
            return Err(AccountError::DetailsExist);
        }

        match &self.manager.dispatcher {
            Some(dispatcher) => {
                let code = token::mint();
                let matched = self
                    .manager
                    .persistence_handler
                    .update(
                        &[self.id_filter()],
                        &[
                            RecordUpdate::Email(new_email.to_string()),
                            RecordUpdate::EmailConfirmed(Some(false)),
                            RecordUpdate::EmailValidateToken(Some(code.clone())),
                        ],
                    )
                    .await?;

                if matched == 0 {
                    return Err(AccountError::NotFound);
                }

                dispatcher.dispatch(new_email, &code, MessageKind::Confirm);
            }

            None => {
                let matched = self
                    .manager
                    .persistence_handler
                    .update(
                        &[self.id_filter()],
                        &[
                            RecordUpdate::Email(new_email.to_string()),
                            RecordUpdate::EmailConfirmed(None),
                            RecordUpdate::EmailValidateToken(None),
                        ],
                    )
                    .await?;

                if matched == 0 {
                    return Err(AccountError::NotFound);
                }
            }
        }

        Ok(())
    }

    /// Used to start a password reset. No current-password check, since the
    /// caller may have forgotten it. A new code unconditionally supersedes
    /// any pending reset. The code is dispatched to the account's email when
    /// possible and always returned for out-of-band delivery
    pub async fn reset_password(&self) -> Result<String, AccountError> {
        let record = self.raw().await?.ok_or(AccountError::NotFound)?;

        let code = token::mint();
        let matched = self
            .manager
            .persistence_handler
            .update(
                &[self.id_filter()],
                &[RecordUpdate::PasswordReset(Some((
                    code.clone(),
                    Utc::now(),
                )))],
            )
            .await?;

        if matched == 0 {
            return Err(AccountError::NotFound);
        }

        if let (Some(dispatcher), Some(email)) = (&self.manager.dispatcher, &record.email) {
            dispatcher.dispatch(email, &code, MessageKind::Reset);
        }

        Ok(code)
    }

    /// Used to complete a password reset. No reset pending, an elapsed TTL,
    /// and a wrong code all fail identically. Success replaces the hash and
    /// clears both reset fields in one conditional write
    pub async fn password_confirm(
        &self,
        new_password: &str,
        given_code: &str,
    ) -> Result<(), AccountError> {
        let record = self
            .raw()
            .await?
            .ok_or(AccountError::PasswordResetInvalid)?;

        let (stored, generated_at) = record
            .password_reset_code
            .zip(record.password_reset_generated_at)
            .ok_or(AccountError::PasswordResetInvalid)?;

        if token::is_expired(generated_at, self.manager.password_reset_expires) {
            return Err(AccountError::PasswordResetInvalid);
        }

        if !token::verify(&stored, given_code) {
            return Err(AccountError::PasswordResetInvalid);
        }

        self.manager.validate_details(None, Some(new_password))?;

        let hash = auth::hash_password(new_password)?;
        let matched = self
            .manager
            .persistence_handler
            .update(
                &[self.id_filter(), RecordFilter::PasswordResetCode(stored)],
                &[
                    RecordUpdate::PasswordHash(hash),
                    RecordUpdate::PasswordReset(None),
                ],
            )
            .await?;

        // zero matches: the code was consumed or superseded concurrently
        if matched == 0 {
            return Err(AccountError::PasswordResetInvalid);
        }

        Ok(())
    }

    /// Unconditional, immediate, irreversible removal. A second delete of
    /// the same account reports [`AccountError::NotFound`]
    pub async fn delete(&self) -> Result<(), AccountError> {
        let removed = self
            .manager
            .persistence_handler
            .delete(&[self.id_filter()])
            .await?;

        if removed == 0 {
            return Err(AccountError::NotFound);
        }

        log::trace!(target: "bastion", "Deleted account {}", self.user_id);

        Ok(())
    }
}
