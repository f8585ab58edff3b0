//! End-to-end lifecycle scenarios against a scripted auth endpoint.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use legitimi::api::AuthApi;
use legitimi::config::Config;
use legitimi::error::Error;
use legitimi::session::{SessionManager, SessionStatus};
use legitimi::store::{MemoryStorage, STORAGE_KEY, SecureTokenStore, StorageBackend};
use legitimi::token::Credentials;
use legitimi::TracingSink;
use secrecy::SecretString;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const SECRET: &str = "integration-secret";

/// Scripted stand-in for the remote auth endpoints.
#[derive(Clone, Default)]
struct ScriptedApi {
    inner: Arc<ScriptedState>,
}

#[derive(Default)]
struct ScriptedState {
    login_responses: Mutex<VecDeque<Result<Value, Error>>>,
    refresh_responses: Mutex<VecDeque<Result<Value, Error>>>,
    login_calls: AtomicU32,
    refresh_calls: AtomicU32,
    logout_calls: AtomicU32,
    refresh_hold: Mutex<Option<Duration>>,
}

impl ScriptedApi {
    fn new() -> Self {
        Self::default()
    }

    fn push_login(&self, response: Result<Value, Error>) {
        self.inner.login_responses.lock().unwrap().push_back(response);
    }

    fn push_refresh(&self, response: Result<Value, Error>) {
        self.inner
            .refresh_responses
            .lock()
            .unwrap()
            .push_back(response);
    }

    /// Delay every refresh response, simulating an in-flight call.
    fn hold_refresh(&self, delay: Duration) {
        *self.inner.refresh_hold.lock().unwrap() = Some(delay);
    }

    fn login_calls(&self) -> u32 {
        self.inner.login_calls.load(Ordering::SeqCst)
    }

    fn refresh_calls(&self) -> u32 {
        self.inner.refresh_calls.load(Ordering::SeqCst)
    }

    fn logout_calls(&self) -> u32 {
        self.inner.logout_calls.load(Ordering::SeqCst)
    }
}

impl AuthApi for ScriptedApi {
    async fn login(&self, _credentials: &Credentials) -> Result<Value, Error> {
        self.inner.login_calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .login_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Network("no scripted login response".to_string())))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<Value, Error> {
        self.inner.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let hold = *self.inner.refresh_hold.lock().unwrap();
        if let Some(delay) = hold {
            tokio::time::sleep(delay).await;
        }
        self.inner
            .refresh_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Network("no scripted refresh response".to_string())))
    }

    async fn logout(&self, _refresh_token: &str) -> Result<(), Error> {
        self.inner.logout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Build a JWT-shaped access token carrying the given claims.
fn access_token(label: &str, exp_offset_secs: i64) -> String {
    let claims = json!({
        "sub": "user-1",
        "role": "admin",
        "org": "org-9",
        "exp": Utc::now().timestamp() + exp_offset_secs,
        "label": label,
    });
    let header = Base64UrlUnpadded::encode_string(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = Base64UrlUnpadded::encode_string(&serde_json::to_vec(&claims).unwrap());
    format!("{header}.{payload}.sig")
}

fn auth_body(label: &str, expires_in_seconds: u64) -> Value {
    json!({
        "accessToken": access_token(label, 3600),
        "refreshToken": format!("refresh-{label}"),
        "expiresInSeconds": expires_in_seconds,
        "tokenType": "Bearer",
        "user": { "id": "user-1", "email": "alice@example.com", "name": "Alice" },
        "organization": { "id": "org-9", "name": "Acme" }
    })
}

fn test_config() -> Config {
    let mut config = Config::new("https://api.example.com", SecretString::from(SECRET));
    config.retry.base_delay = Duration::from_millis(1);
    config
}

fn manager_with(
    api: ScriptedApi,
    backend: Arc<MemoryStorage>,
    config: Config,
) -> SessionManager<ScriptedApi> {
    SessionManager::new(
        api,
        config,
        backend as Arc<dyn StorageBackend>,
        Arc::new(TracingSink),
    )
}

fn credentials() -> Credentials {
    Credentials::new("alice@example.com", SecretString::from("correct-horse"))
}

#[tokio::test]
async fn login_establishes_authenticated_session() {
    let api = ScriptedApi::new();
    api.push_login(Ok(auth_body("a", 3600)));
    let backend = Arc::new(MemoryStorage::new());
    let manager = manager_with(api.clone(), Arc::clone(&backend), test_config());

    let before = Utc::now();
    let snapshot = manager.login(credentials()).await.unwrap();

    assert_eq!(snapshot.status, SessionStatus::Authenticated);
    assert_eq!(
        snapshot.current_user.as_ref().map(|user| user.email.as_str()),
        Some("alice@example.com")
    );
    assert_eq!(
        snapshot.organization.as_ref().map(|org| org.id.as_str()),
        Some("org-9")
    );
    assert!(snapshot.last_error.is_none());

    // Session expiry tracks issued_at + expiresInSeconds.
    let expires_at = snapshot.session_expires_at.unwrap();
    let lifetime = (expires_at - before).num_seconds();
    assert!((3595..=3605).contains(&lifetime), "lifetime was {lifetime}s");

    // The token set is persisted, encrypted, under the namespaced key.
    let raw = backend.get(STORAGE_KEY).unwrap().unwrap();
    assert!(!String::from_utf8_lossy(&raw).contains("refresh-a"));
    let store = SecureTokenStore::new(
        Arc::clone(&backend) as Arc<dyn StorageBackend>,
        &SecretString::from(SECRET),
    );
    let persisted = store.load().unwrap().unwrap();
    assert_eq!(persisted.token_set.refresh_token, "refresh-a");
}

#[tokio::test]
async fn sixth_login_attempt_is_blocked_without_a_network_call() {
    let api = ScriptedApi::new();
    for _ in 0..5 {
        api.push_login(Err(Error::Auth {
            status: 401,
            message: "bad credentials".to_string(),
        }));
    }
    let manager = manager_with(api.clone(), Arc::new(MemoryStorage::new()), test_config());

    for _ in 0..5 {
        let err = manager.login(credentials()).await.unwrap_err();
        assert!(matches!(err, Error::Auth { status: 401, .. }));
    }
    assert_eq!(api.login_calls(), 5);

    match manager.login(credentials()).await {
        Err(Error::RateLimited { retry_after }) => {
            assert!(retry_after > Duration::ZERO);
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
    // The blocked attempt never reached the network.
    assert_eq!(api.login_calls(), 5);

    let snapshot = manager.snapshot().await;
    assert_eq!(
        snapshot.status,
        SessionStatus::Unauthenticated { expired: false }
    );
    assert!(snapshot.last_error.unwrap().contains("rate limited"));
}

#[tokio::test]
async fn malformed_login_response_is_a_validation_error() {
    let api = ScriptedApi::new();
    api.push_login(Ok(json!({
        "accessToken": access_token("a", 3600),
        "expiresInSeconds": 3600,
        "tokenType": "Bearer"
    })));
    let backend = Arc::new(MemoryStorage::new());
    let manager = manager_with(api, Arc::clone(&backend), test_config());

    match manager.login(credentials()).await {
        Err(Error::Validation { field, .. }) => assert_eq!(field, "refreshToken"),
        other => panic!("expected Validation, got {other:?}"),
    }
    assert!(backend.get(STORAGE_KEY).unwrap().is_none());
    let snapshot = manager.snapshot().await;
    assert_eq!(
        snapshot.status,
        SessionStatus::Unauthenticated { expired: false }
    );
}

#[tokio::test]
async fn expired_claims_fail_the_login_integrity_check() {
    let api = ScriptedApi::new();
    let mut body = auth_body("a", 3600);
    body["accessToken"] = Value::String(access_token("a", -60));
    api.push_login(Ok(body));
    let manager = manager_with(api, Arc::new(MemoryStorage::new()), test_config());

    assert!(matches!(
        manager.login(credentials()).await,
        Err(Error::Integrity(_))
    ));
}

#[tokio::test]
async fn transient_login_failures_are_retried_then_succeed() {
    let api = ScriptedApi::new();
    api.push_login(Err(Error::Network("connection reset".to_string())));
    api.push_login(Err(Error::Network("connection reset".to_string())));
    api.push_login(Ok(auth_body("a", 3600)));
    let manager = manager_with(api.clone(), Arc::new(MemoryStorage::new()), test_config());

    let snapshot = manager.login(credentials()).await.unwrap();
    assert_eq!(snapshot.status, SessionStatus::Authenticated);
    assert_eq!(api.login_calls(), 3);
}

#[tokio::test]
async fn refresh_replaces_the_token_set_and_keeps_the_user() {
    let api = ScriptedApi::new();
    api.push_login(Ok(auth_body("a", 3600)));
    let mut refresh_body = auth_body("b", 3600);
    // Refresh responses carry no profile data.
    refresh_body["user"] = Value::Null;
    refresh_body["organization"] = Value::Null;
    api.push_refresh(Ok(refresh_body));

    let backend = Arc::new(MemoryStorage::new());
    let manager = manager_with(api.clone(), Arc::clone(&backend), test_config());

    let login_snapshot = manager.login(credentials()).await.unwrap();
    let refresh_snapshot = manager.refresh().await.unwrap();

    assert_eq!(refresh_snapshot.status, SessionStatus::Authenticated);
    assert_eq!(
        refresh_snapshot.current_user, login_snapshot.current_user,
        "refresh must not change the current user"
    );

    let store = SecureTokenStore::new(
        Arc::clone(&backend) as Arc<dyn StorageBackend>,
        &SecretString::from(SECRET),
    );
    let persisted = store.load().unwrap().unwrap();
    assert_eq!(persisted.token_set.refresh_token, "refresh-b");
}

#[tokio::test]
async fn scheduled_refresh_fires_before_expiry() {
    let api = ScriptedApi::new();
    api.push_login(Ok(auth_body("a", 1)));
    api.push_refresh(Ok(auth_body("b", 3600)));

    let mut config = test_config();
    // 1s lifetime with an 800ms threshold arms the timer ~200ms out.
    config.refresh.threshold = Duration::from_millis(800);
    let manager = manager_with(api.clone(), Arc::new(MemoryStorage::new()), config);

    manager.login(credentials()).await.unwrap();
    assert_eq!(api.refresh_calls(), 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(api.refresh_calls(), 1);
    let snapshot = manager.snapshot().await;
    assert_eq!(snapshot.status, SessionStatus::Authenticated);
}

#[tokio::test]
async fn refresh_failure_ends_the_session() {
    let api = ScriptedApi::new();
    api.push_login(Ok(auth_body("a", 3600)));
    api.push_refresh(Err(Error::Auth {
        status: 401,
        message: "refresh token revoked".to_string(),
    }));
    let backend = Arc::new(MemoryStorage::new());
    let manager = manager_with(api, Arc::clone(&backend), test_config());

    manager.login(credentials()).await.unwrap();
    assert!(manager.refresh().await.is_err());

    let snapshot = manager.snapshot().await;
    assert_eq!(
        snapshot.status,
        SessionStatus::Unauthenticated { expired: true }
    );
    assert!(snapshot.current_user.is_none());
    assert!(snapshot.last_error.is_some());
    // Forced logout purges the persisted token.
    assert!(backend.get(STORAGE_KEY).unwrap().is_none());
}

#[tokio::test]
async fn logout_discards_an_in_flight_refresh() {
    let api = ScriptedApi::new();
    api.push_login(Ok(auth_body("a", 3600)));
    api.push_refresh(Ok(auth_body("b", 3600)));
    api.hold_refresh(Duration::from_millis(150));

    let backend = Arc::new(MemoryStorage::new());
    let manager = manager_with(api.clone(), Arc::clone(&backend), test_config());

    manager.login(credentials()).await.unwrap();

    let refresher = manager.clone();
    let in_flight = tokio::spawn(async move { refresher.refresh().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = manager.logout().await;
    assert_eq!(
        snapshot.status,
        SessionStatus::Unauthenticated { expired: false }
    );

    // The refresh completes after the logout and must be discarded.
    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(Error::InvalidState { .. })));

    let snapshot = manager.snapshot().await;
    assert_eq!(
        snapshot.status,
        SessionStatus::Unauthenticated { expired: false }
    );
    assert!(backend.get(STORAGE_KEY).unwrap().is_none());
}

#[tokio::test]
async fn concurrent_refreshes_resolve_to_one_network_call() {
    let api = ScriptedApi::new();
    api.push_login(Ok(auth_body("a", 3600)));
    api.push_refresh(Ok(auth_body("b", 3600)));
    api.hold_refresh(Duration::from_millis(50));

    let backend = Arc::new(MemoryStorage::new());
    let manager = manager_with(api.clone(), Arc::clone(&backend), test_config());
    manager.login(credentials()).await.unwrap();

    let (first, second) = tokio::join!(manager.refresh(), manager.refresh());
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(outcomes.iter().any(|result| matches!(
        result,
        Err(Error::InvalidState { operation: "refresh", .. })
    )));
    assert_eq!(api.refresh_calls(), 1);

    let store = SecureTokenStore::new(
        Arc::clone(&backend) as Arc<dyn StorageBackend>,
        &SecretString::from(SECRET),
    );
    assert_eq!(
        store.load().unwrap().unwrap().token_set.refresh_token,
        "refresh-b"
    );
}

#[tokio::test]
async fn logout_clears_everything_and_notifies_the_server() {
    let api = ScriptedApi::new();
    api.push_login(Ok(auth_body("a", 3600)));
    let backend = Arc::new(MemoryStorage::new());
    let manager = manager_with(api.clone(), Arc::clone(&backend), test_config());

    manager.login(credentials()).await.unwrap();
    let snapshot = manager.logout().await;

    assert_eq!(
        snapshot.status,
        SessionStatus::Unauthenticated { expired: false }
    );
    assert!(snapshot.current_user.is_none());
    assert!(backend.get(STORAGE_KEY).unwrap().is_none());

    // Remote invalidation is best-effort and async.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(api.logout_calls(), 1);
}

#[tokio::test]
async fn bootstrap_restores_a_persisted_session() {
    let backend = Arc::new(MemoryStorage::new());

    let api = ScriptedApi::new();
    api.push_login(Ok(auth_body("a", 3600)));
    let first = manager_with(api, Arc::clone(&backend), test_config());
    first.login(credentials()).await.unwrap();

    // A fresh process over the same storage and secret.
    let second = manager_with(ScriptedApi::new(), Arc::clone(&backend), test_config());
    let snapshot = second.bootstrap().await.unwrap();

    assert_eq!(snapshot.status, SessionStatus::Authenticated);
    assert_eq!(
        snapshot.current_user.map(|user| user.email),
        Some("alice@example.com".to_string())
    );
}

#[tokio::test]
async fn bootstrap_purges_a_corrupted_blob() {
    let backend = Arc::new(MemoryStorage::new());
    backend.put(STORAGE_KEY, b"tampered garbage").unwrap();

    let manager = manager_with(ScriptedApi::new(), Arc::clone(&backend), test_config());
    let snapshot = manager.bootstrap().await.unwrap();

    assert!(!snapshot.is_authenticated());
    assert!(snapshot.last_error.is_none(), "corruption is recovered quietly");
    assert!(backend.get(STORAGE_KEY).unwrap().is_none());
}

#[tokio::test]
async fn bootstrap_rejects_an_expired_token() {
    use legitimi::store::PersistedSession;
    use legitimi::token::TokenSet;

    let backend = Arc::new(MemoryStorage::new());
    let store = SecureTokenStore::new(
        Arc::clone(&backend) as Arc<dyn StorageBackend>,
        &SecretString::from(SECRET),
    );
    store
        .save(&PersistedSession {
            token_set: TokenSet {
                access_token: access_token("stale", -30),
                refresh_token: "refresh-stale".to_string(),
                token_type: "Bearer".to_string(),
                issued_at: Utc::now() - chrono::Duration::seconds(7200),
                expires_in_seconds: 3600,
            },
            user: None,
            organization: None,
        })
        .unwrap();

    let manager = manager_with(ScriptedApi::new(), Arc::clone(&backend), test_config());
    let snapshot = manager.bootstrap().await.unwrap();

    assert_eq!(
        snapshot.status,
        SessionStatus::Unauthenticated { expired: true }
    );
    assert!(backend.get(STORAGE_KEY).unwrap().is_none());
}

#[tokio::test]
async fn login_is_rejected_while_already_authenticated() {
    let api = ScriptedApi::new();
    api.push_login(Ok(auth_body("a", 3600)));
    let manager = manager_with(api, Arc::new(MemoryStorage::new()), test_config());

    manager.login(credentials()).await.unwrap();
    assert!(matches!(
        manager.login(credentials()).await,
        Err(Error::InvalidState { operation: "login", .. })
    ));
}

#[tokio::test]
async fn malformed_credentials_never_reach_the_network() {
    let api = ScriptedApi::new();
    let manager = manager_with(api.clone(), Arc::new(MemoryStorage::new()), test_config());

    let err = manager
        .login(Credentials::new("not-an-email", SecretString::from("pw")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert_eq!(api.login_calls(), 0);
}
