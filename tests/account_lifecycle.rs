//! End-to-end lifecycle tests over the in-memory backend. A recording mail
//! transport stands in for SMTP so the confirmation and reset flows can be
//! driven with the codes that were actually dispatched.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use futures::StreamExt;
use parking_lot::Mutex;

use bastion_account::notifier::MailTransport;
use bastion_account::prelude::*;

const VALID_PASSWORD: &str = "S]Q}67=uLetG{r,_8{";
const OTHER_PASSWORD: &str = "#!K2&33?e%@Pv3_Q";
const NEW_PASSWORD: &str = "ZRvTP72g-VwX3@\\H";

#[derive(Clone, Default)]
struct RecordingTransport {
    sent: Arc<Mutex<Vec<(String, String, String)>>>,
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AccountError> {
        self.sent
            .lock()
            .push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }
}

type Outbox = Arc<Mutex<Vec<(String, String, String)>>>;

async fn manager() -> AccountManager {
    AccountManager::new(BackendType::InMemory, AccountSettings::default())
        .await
        .unwrap()
}

async fn manager_with_dispatcher() -> (AccountManager, Outbox) {
    manager_with_reset_expiry(Duration::hours(24)).await
}

async fn manager_with_reset_expiry(expires: Duration) -> (AccountManager, Outbox) {
    let transport = RecordingTransport::default();
    let outbox = transport.sent.clone();

    let settings = AccountSettings {
        dispatcher: Some(NotificationDispatcher::spawn(
            transport,
            MessageLayouts::default(),
        )),
        password_reset_expires: expires,
        ..Default::default()
    };

    let manager = AccountManager::new(BackendType::InMemory, settings)
        .await
        .unwrap();
    (manager, outbox)
}

/// Waits for the dispatcher worker to drain the queue, then returns the
/// message at `index`. The default layouts put the bare code on the last
/// line of the body
async fn sent_code(outbox: &Outbox, index: usize) -> String {
    for _ in 0..1000 {
        if outbox.lock().len() > index {
            break;
        }
        tokio::task::yield_now().await;
    }

    let sent = outbox.lock();
    let (_, _, body) = sent.get(index).expect("message was never dispatched");
    body.lines().last().unwrap().to_string()
}

#[tokio::test]
async fn create_then_login_round_trip() {
    let manager = manager().await;
    let (created, _) = manager
        .create_account(VALID_PASSWORD, Some("ward"), None)
        .await
        .unwrap();

    let (logged_in, handle) = manager
        .login(VALID_PASSWORD, Some("ward"), None, true)
        .await
        .unwrap();

    assert_eq!(created.user_id, logged_in.user_id);
    assert_eq!(handle.user_id(), created.user_id);
}

#[tokio::test]
async fn login_failures_are_indistinguishable() {
    let manager = manager().await;
    let _ = manager
        .create_account(VALID_PASSWORD, Some("somethingrllyc00l"), None)
        .await
        .unwrap();

    // wrong password on a real account
    let wrong_password = manager
        .login("1234", Some("somethingrllyc00l"), None, true)
        .await
        .unwrap_err();
    // no such account at all
    let unknown_name = manager
        .login(VALID_PASSWORD, Some("notarealname1231234"), None, true)
        .await
        .unwrap_err();
    // truncated name that almost matches
    let near_miss = manager
        .login(VALID_PASSWORD, Some("somethingrllyc"), None, true)
        .await
        .unwrap_err();

    for err in [wrong_password, unknown_name, near_miss] {
        assert!(matches!(err, AccountError::InvalidLogin));
    }
}

#[tokio::test]
async fn exactly_one_login_identifier_is_required() {
    let manager = manager().await;

    assert!(matches!(
        manager.login(VALID_PASSWORD, None, None, true).await,
        Err(AccountError::MissingIdentifier)
    ));
    assert!(matches!(
        manager
            .login(VALID_PASSWORD, Some("ward"), Some("ward@pm.me"), true)
            .await,
        Err(AccountError::MissingIdentifier)
    ));
}

#[tokio::test]
async fn create_account_requires_an_identifier() {
    let manager = manager().await;
    assert!(matches!(
        manager.create_account(VALID_PASSWORD, None, None).await,
        Err(AccountError::MissingIdentifier)
    ));
}

#[tokio::test]
async fn create_account_enforces_password_policy() {
    let manager = manager().await;
    match manager.create_account("1234hh$", Some("ward"), None).await {
        Err(AccountError::PasswordPolicy(fails)) => assert!(!fails.is_empty()),
        other => panic!("expected PasswordPolicy error, got {other:?}"),
    }
}

#[tokio::test]
async fn create_account_validates_names() {
    let manager = manager().await;

    assert!(matches!(
        manager.create_account(VALID_PASSWORD, Some("wa"), None).await,
        Err(AccountError::NameLengthInvalid)
    ));
    assert!(matches!(
        manager
            .create_account(VALID_PASSWORD, Some("x".repeat(129).as_str()), None)
            .await,
        Err(AccountError::NameLengthInvalid)
    ));
    assert!(matches!(
        manager
            .create_account(VALID_PASSWORD, Some("war$"), None)
            .await,
        Err(AccountError::NameInvalidCharacters)
    ));
}

#[tokio::test]
async fn create_account_validates_email_syntax() {
    let manager = manager().await;
    assert!(matches!(
        manager
            .create_account(VALID_PASSWORD, None, Some("something@.com"))
            .await,
        Err(AccountError::EmailInvalid(_))
    ));
}

#[tokio::test]
async fn duplicate_details_are_rejected() {
    let manager = manager().await;
    let _ = manager
        .create_account(VALID_PASSWORD, Some("oopwe"), None)
        .await
        .unwrap();
    let _ = manager
        .create_account(VALID_PASSWORD, None, Some("oopwe@example.com"))
        .await
        .unwrap();

    assert!(matches!(
        manager
            .create_account(VALID_PASSWORD, Some("oopwe"), None)
            .await,
        Err(AccountError::DetailsExist)
    ));
    assert!(matches!(
        manager
            .create_account(VALID_PASSWORD, None, Some("oopwe@example.com"))
            .await,
        Err(AccountError::DetailsExist)
    ));
}

#[tokio::test]
async fn concurrent_creates_with_one_name_yield_one_account() {
    let manager = manager().await;

    let (a, b) = tokio::join!(
        manager.create_account(VALID_PASSWORD, Some("race"), None),
        manager.create_account(VALID_PASSWORD, Some("race"), None)
    );

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(err, AccountError::DetailsExist));
}

#[tokio::test]
async fn email_confirmation_flow() {
    let (manager, outbox) = manager_with_dispatcher().await;

    let (info, user) = manager
        .create_account(VALID_PASSWORD, None, Some("lokiismorebae@gmail.com"))
        .await
        .unwrap();
    assert_eq!(info.email_confirmed, Some(false));

    let code = sent_code(&outbox, 0).await;
    assert_eq!(code.len(), 43);

    // wrong code and unknown email fail the same way
    assert!(matches!(
        manager
            .confirm_email("lokiismorebae@gmail.com", "competelymadeup")
            .await,
        Err(AccountError::UnableToConfirmEmail)
    ));
    assert!(matches!(
        manager
            .confirm_email("googleisnsasimp@gmail.com", &code)
            .await,
        Err(AccountError::UnableToConfirmEmail)
    ));

    let confirmed = manager
        .confirm_email("lokiismorebae@gmail.com", &code)
        .await
        .unwrap();
    assert_eq!(confirmed.user_id(), user.user_id());
    assert_eq!(user.get().await.unwrap().email_confirmed, Some(true));

    // the token was consumed with the confirmation; replaying it fails
    assert!(matches!(
        manager
            .confirm_email("lokiismorebae@gmail.com", &code)
            .await,
        Err(AccountError::UnableToConfirmEmail)
    ));
}

#[tokio::test]
async fn unconfirmed_email_cannot_login_while_dispatcher_configured() {
    let (manager, outbox) = manager_with_dispatcher().await;

    let _ = manager
        .create_account(VALID_PASSWORD, None, Some("newemail@gamil.com"))
        .await
        .unwrap();

    assert!(matches!(
        manager
            .login(VALID_PASSWORD, None, Some("newemail@gamil.com"), true)
            .await,
        Err(AccountError::InvalidLogin)
    ));

    // the caller can opt out of the confirmation requirement
    let _ = manager
        .login(VALID_PASSWORD, None, Some("newemail@gamil.com"), false)
        .await
        .unwrap();

    // and confirming unlocks the default path
    let code = sent_code(&outbox, 0).await;
    let _ = manager
        .confirm_email("newemail@gamil.com", &code)
        .await
        .unwrap();
    let _ = manager
        .login(VALID_PASSWORD, None, Some("newemail@gamil.com"), true)
        .await
        .unwrap();
}

#[tokio::test]
async fn unconfirmed_email_logs_in_without_dispatcher() {
    let manager = manager().await;

    let (info, _) = manager
        .create_account(VALID_PASSWORD, None, Some("newemail59@gamil.com"))
        .await
        .unwrap();
    assert_eq!(info.email_confirmed, None);

    let _ = manager
        .login(VALID_PASSWORD, None, Some("newemail59@gamil.com"), true)
        .await
        .unwrap();
}

#[tokio::test]
async fn update_password_flow() {
    let manager = manager().await;
    let (info, user) = manager
        .create_account(OTHER_PASSWORD, Some("ppez"), None)
        .await
        .unwrap();

    assert!(matches!(
        user.update_password("1234", NEW_PASSWORD).await,
        Err(AccountError::InvalidLogin)
    ));
    assert!(matches!(
        user.update_password(OTHER_PASSWORD, "123").await,
        Err(AccountError::PasswordPolicy(_))
    ));

    user.update_password(OTHER_PASSWORD, NEW_PASSWORD)
        .await
        .unwrap();

    assert!(matches!(
        manager
            .login(OTHER_PASSWORD, info.name.as_deref(), None, true)
            .await,
        Err(AccountError::InvalidLogin)
    ));
    let _ = manager
        .login(NEW_PASSWORD, info.name.as_deref(), None, true)
        .await
        .unwrap();
}

#[tokio::test]
async fn update_password_on_missing_record_is_an_invalid_login() {
    let manager = manager().await;
    assert!(matches!(
        manager
            .user("123")
            .update_password(OTHER_PASSWORD, NEW_PASSWORD)
            .await,
        Err(AccountError::InvalidLogin)
    ));
}

#[tokio::test]
async fn update_email_flow() {
    let (manager, outbox) = manager_with_dispatcher().await;
    let (info, user) = manager
        .create_account(VALID_PASSWORD, None, Some("llw3@pm.me"))
        .await
        .unwrap();

    assert!(matches!(
        user.update_email("kkd@@pm.me").await,
        Err(AccountError::EmailInvalid(_))
    ));
    // updating to an address that is already taken (including your own) conflicts
    assert!(matches!(
        user.update_email(info.email.as_deref().unwrap()).await,
        Err(AccountError::DetailsExist)
    ));

    user.update_email("h3h3@pm.me").await.unwrap();

    let updated = user.get().await.unwrap();
    assert_eq!(updated.email.as_deref(), Some("h3h3@pm.me"));
    assert_eq!(updated.email_confirmed, Some(false));

    // message 0 was the create-time confirmation; message 1 carries the
    // superseding token for the new address
    let code = sent_code(&outbox, 1).await;
    let _ = manager.confirm_email("h3h3@pm.me", &code).await.unwrap();
    assert_eq!(user.get().await.unwrap().email_confirmed, Some(true));
}

#[tokio::test]
async fn update_email_without_dispatcher_clears_confirmation_state() {
    let manager = manager().await;
    let (_, user) = manager
        .create_account(VALID_PASSWORD, None, Some("plain@pm.me"))
        .await
        .unwrap();

    user.update_email("plain2@pm.me").await.unwrap();

    let updated = user.get().await.unwrap();
    assert_eq!(updated.email.as_deref(), Some("plain2@pm.me"));
    assert_eq!(updated.email_confirmed, None);
}

#[tokio::test]
async fn update_name_flow() {
    let manager = manager().await;
    let (_, user) = manager
        .create_account(VALID_PASSWORD, Some("lloop"), None)
        .await
        .unwrap();
    let _ = manager
        .create_account(VALID_PASSWORD, Some("taken"), None)
        .await
        .unwrap();

    assert!(matches!(
        user.update_name("taken").await,
        Err(AccountError::DetailsExist)
    ));
    assert!(matches!(
        user.update_name("wa").await,
        Err(AccountError::NameLengthInvalid)
    ));

    user.update_name("renamed").await.unwrap();

    let (found, _) = manager.to_user(Some("renamed"), None).await.unwrap();
    assert_eq!(found.user_id, user.user_id());
}

#[tokio::test]
async fn password_reset_flow() {
    let (manager, outbox) = manager_with_dispatcher().await;
    let (info, user) = manager
        .create_account(VALID_PASSWORD, None, Some("resetme@pm.me"))
        .await
        .unwrap();

    let code = user.reset_password().await.unwrap();

    // the same code is dispatched to the account's email (message 1; the
    // create-time confirmation was message 0)
    assert_eq!(sent_code(&outbox, 1).await, code);
    assert_eq!(outbox.lock()[1].1, "Password reset request");

    assert!(matches!(
        user.password_confirm(NEW_PASSWORD, "ddd").await,
        Err(AccountError::PasswordResetInvalid)
    ));

    user.password_confirm(NEW_PASSWORD, &code).await.unwrap();

    assert!(matches!(
        manager
            .login(VALID_PASSWORD, None, info.email.as_deref(), false)
            .await,
        Err(AccountError::InvalidLogin)
    ));
    let _ = manager
        .login(NEW_PASSWORD, None, info.email.as_deref(), false)
        .await
        .unwrap();

    // the reset fields were cleared with the password swap
    assert!(matches!(
        user.password_confirm(OTHER_PASSWORD, &code).await,
        Err(AccountError::PasswordResetInvalid)
    ));
}

#[tokio::test]
async fn password_confirm_without_pending_reset_fails() {
    let manager = manager().await;
    let (_, user) = manager
        .create_account(VALID_PASSWORD, Some("hhd"), None)
        .await
        .unwrap();

    assert!(matches!(
        user.password_confirm(VALID_PASSWORD, "ddd").await,
        Err(AccountError::PasswordResetInvalid)
    ));
    assert!(matches!(
        manager.user("123").password_confirm(VALID_PASSWORD, "ddd").await,
        Err(AccountError::PasswordResetInvalid)
    ));
}

#[tokio::test]
async fn password_reset_returns_code_without_dispatcher() {
    let manager = manager().await;
    let (_, user) = manager
        .create_account(VALID_PASSWORD, Some("xxz"), None)
        .await
        .unwrap();

    // no email anywhere; the caller ferries the code out-of-band
    let code = user.reset_password().await.unwrap();
    user.password_confirm(NEW_PASSWORD, &code).await.unwrap();
}

#[tokio::test]
async fn expired_reset_code_is_rejected() {
    let (_, user) = {
        let (manager, _outbox) = manager_with_reset_expiry(Duration::zero()).await;
        manager
            .create_account(VALID_PASSWORD, Some("expired"), None)
            .await
            .unwrap()
    };

    let code = user.reset_password().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // even the correct code fails once the window has closed
    assert!(matches!(
        user.password_confirm(NEW_PASSWORD, &code).await,
        Err(AccountError::PasswordResetInvalid)
    ));
}

#[tokio::test]
async fn a_new_reset_supersedes_the_previous_code() {
    let manager = manager().await;
    let (_, user) = manager
        .create_account(VALID_PASSWORD, Some("superseded"), None)
        .await
        .unwrap();

    let first = user.reset_password().await.unwrap();
    let second = user.reset_password().await.unwrap();
    assert_ne!(first, second);

    assert!(matches!(
        user.password_confirm(NEW_PASSWORD, &first).await,
        Err(AccountError::PasswordResetInvalid)
    ));
    user.password_confirm(NEW_PASSWORD, &second).await.unwrap();
}

#[tokio::test]
async fn second_delete_reports_not_found() {
    let manager = manager().await;
    let (_, user) = manager
        .create_account(OTHER_PASSWORD, Some("deleteme"), None)
        .await
        .unwrap();

    user.delete().await.unwrap();

    assert!(matches!(user.get().await, Err(AccountError::NotFound)));
    // the second delete reports the record as gone rather than succeeding
    assert!(matches!(user.delete().await, Err(AccountError::NotFound)));
}

#[tokio::test]
async fn to_user_lookups() {
    let manager = manager().await;
    assert!(matches!(
        manager.to_user(None, None).await,
        Err(AccountError::MissingIdentifier)
    ));
    assert!(matches!(
        manager.to_user(None, Some("missing@pm.me")).await,
        Err(AccountError::NotFound)
    ));

    let (created, _) = manager
        .create_account(OTHER_PASSWORD, Some("epicgamer1"), Some("epicgamer@gmail.com"))
        .await
        .unwrap();

    let (by_name, _) = manager.to_user(Some("epicgamer1"), None).await.unwrap();
    let (by_email, _) = manager
        .to_user(None, Some("epicgamer@gmail.com"))
        .await
        .unwrap();
    assert_eq!(by_name.user_id, created.user_id);
    assert_eq!(by_email.user_id, created.user_id);
}

#[tokio::test]
async fn users_listing_respects_the_tri_state_filter() {
    let (manager, outbox) = manager_with_dispatcher().await;

    let _ = manager
        .create_account(VALID_PASSWORD, Some("nomail"), None)
        .await
        .unwrap();
    let _ = manager
        .create_account(VALID_PASSWORD, None, Some("pending@pm.me"))
        .await
        .unwrap();
    let _ = manager
        .create_account(VALID_PASSWORD, None, Some("done@pm.me"))
        .await
        .unwrap();

    let code = sent_code(&outbox, 1).await;
    let _ = manager.confirm_email("done@pm.me", &code).await.unwrap();

    let all: Vec<_> = manager.users(None).await.unwrap().collect().await;
    assert_eq!(all.len(), 3);

    let unset: Vec<_> = manager
        .users(Some(ConfirmationFilter::Unset))
        .await
        .unwrap()
        .collect()
        .await;
    let (info, handle) = unset[0].as_ref().unwrap();
    assert_eq!(unset.len(), 1);
    assert_eq!(info.name.as_deref(), Some("nomail"));
    assert_eq!(handle.user_id(), info.user_id);

    let pending: Vec<_> = manager
        .users(Some(ConfirmationFilter::Unconfirmed))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending[0].as_ref().unwrap().0.email.as_deref(),
        Some("pending@pm.me")
    );

    let confirmed: Vec<_> = manager
        .users(Some(ConfirmationFilter::Confirmed))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(confirmed.len(), 1);
    assert_eq!(
        confirmed[0].as_ref().unwrap().0.email.as_deref(),
        Some("done@pm.me")
    );
}

#[tokio::test]
async fn purge_empties_the_backend() {
    let manager = manager().await;
    let _ = manager
        .create_account(VALID_PASSWORD, Some("jjd"), None)
        .await
        .unwrap();

    assert_eq!(manager.purge().await.unwrap(), 1);
    let all: Vec<_> = manager.users(None).await.unwrap().collect().await;
    assert!(all.is_empty());
}
