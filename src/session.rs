//! The session state machine: login, refresh, logout, bootstrap.
//!
//! One logical session per manager. All state mutation funnels through a
//! single mutex, and every operation that spans a suspension point captures
//! the generation counter at start and commits only if it is unchanged at
//! completion; results superseded by a logout or a newer login are
//! discarded.

use crate::api::{AuthApi, with_retry};
use crate::audit::{AuditEvent, AuditKind, AuditLogger, AuditSink};
use crate::config::Config;
use crate::error::Error;
use crate::rate_limit::RateLimiter;
use crate::scheduler::{RefreshScheduler, refresh_delay};
use crate::store::{PersistedSession, SecureTokenStore, StorageBackend};
use crate::token::{
    AuthOutcome, Credentials, OrganizationContext, TokenClaims, TokenSet, UserProfile,
    parse_auth_response, validate_integrity,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Where the session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No live session. `expired` marks the terminal sub-state reached when
    /// a refresh failed irrecoverably or a restored token was rejected.
    Unauthenticated { expired: bool },
    /// A login call is in flight.
    Authenticating,
    /// A valid token set is held and a refresh timer is armed.
    Authenticated,
    /// A refresh call is in flight.
    Refreshing,
}

impl SessionStatus {
    #[must_use]
    pub fn is_authenticated(self) -> bool {
        matches!(self, Self::Authenticated | Self::Refreshing)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthenticated { expired: false } => write!(f, "unauthenticated"),
            Self::Unauthenticated { expired: true } => write!(f, "unauthenticated (expired)"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::Authenticated => write!(f, "authenticated"),
            Self::Refreshing => write!(f, "refreshing"),
        }
    }
}

/// Read-only copy of the session state for the UI shell.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub current_user: Option<UserProfile>,
    pub organization: Option<OrganizationContext>,
    pub session_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub generation: u64,
}

impl SessionSnapshot {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.status.is_authenticated()
    }
}

/// Mutable session state. Owned exclusively by the manager's mutex; the
/// scheduler lives here so timer cancellation shares the same critical
/// section as the state transition that requires it.
struct SessionState {
    status: SessionStatus,
    token_set: Option<TokenSet>,
    current_user: Option<UserProfile>,
    organization: Option<OrganizationContext>,
    session_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    generation: u64,
    scheduler: RefreshScheduler,
}

impl SessionState {
    fn new() -> Self {
        Self {
            status: SessionStatus::Unauthenticated { expired: false },
            token_set: None,
            current_user: None,
            organization: None,
            session_expires_at: None,
            last_error: None,
            generation: 0,
            scheduler: RefreshScheduler::new(),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            current_user: self.current_user.clone(),
            organization: self.organization.clone(),
            session_expires_at: self.session_expires_at,
            last_error: self.last_error.clone(),
            generation: self.generation,
        }
    }

    /// Drop all session data and return to `Unauthenticated`.
    fn reset(&mut self, expired: bool, last_error: Option<String>) {
        self.scheduler.cancel();
        self.status = SessionStatus::Unauthenticated { expired };
        self.token_set = None;
        self.current_user = None;
        self.organization = None;
        self.session_expires_at = None;
        self.last_error = last_error;
    }
}

struct Inner<A> {
    api: A,
    config: Config,
    rate_limiter: RateLimiter,
    store: SecureTokenStore,
    audit: AuditLogger,
    state: Mutex<SessionState>,
}

/// The credential lifecycle manager. Cheap to clone; all clones share one
/// session.
pub struct SessionManager<A: AuthApi> {
    inner: Arc<Inner<A>>,
}

impl<A: AuthApi> Clone for SessionManager<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: AuthApi> SessionManager<A> {
    /// Build a manager over an API client, a storage backend, and an audit
    /// sink. Must be called inside a tokio runtime (the audit drain task is
    /// spawned here).
    #[must_use]
    pub fn new(
        api: A,
        config: Config,
        backend: Arc<dyn StorageBackend>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_limit.window, config.rate_limit.max_attempts);
        let store = SecureTokenStore::new(backend, &config.encryption_secret);
        let audit = AuditLogger::spawn(audit_sink);
        Self {
            inner: Arc::new(Inner {
                api,
                config,
                rate_limiter,
                store,
                audit,
                state: Mutex::new(SessionState::new()),
            }),
        }
    }

    /// Current session state, for rendering.
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.lock().await.snapshot()
    }

    /// Authenticate with the remote endpoint and establish a session.
    ///
    /// Valid only while unauthenticated. The rate limiter gates the network
    /// call; transient network failures are retried with bounded backoff,
    /// 4xx rejections are not.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`], [`Error::Validation`], [`Error::RateLimited`],
    /// [`Error::Network`], [`Error::Auth`], [`Error::Integrity`], or
    /// [`Error::Storage`]; the session returns to `Unauthenticated` on every
    /// failure path.
    pub async fn login(&self, credentials: Credentials) -> Result<SessionSnapshot, Error> {
        credentials.validate()?;

        let generation = {
            let mut state = self.inner.state.lock().await;
            if !matches!(state.status, SessionStatus::Unauthenticated { .. }) {
                return Err(Error::InvalidState {
                    operation: "login",
                    state: state.status.to_string(),
                });
            }
            state.status = SessionStatus::Authenticating;
            state.generation += 1;
            state.generation
        };

        if let Err(err) = self.inner.rate_limiter.check_and_record(&credentials.identity) {
            let mut state = self.inner.state.lock().await;
            if state.generation == generation {
                state.status = SessionStatus::Unauthenticated { expired: false };
                state.last_error = Some(err.to_string());
            }
            self.inner.audit.emit(
                AuditEvent::new(AuditKind::LoginRateLimited)
                    .with("identity", credentials.identity.trim().to_lowercase()),
            );
            info!(identity = %credentials.identity, "login blocked by rate limiter");
            return Err(err);
        }

        let attempt = async {
            let body = with_retry(&self.inner.config.retry, "login", || {
                self.inner.api.login(&credentials)
            })
            .await?;
            let outcome = parse_auth_response(&body)?;
            let claims = validate_integrity(&outcome.token_set, Utc::now())?;
            Ok::<_, Error>((outcome, claims))
        }
        .await;

        let (outcome, claims) = match attempt {
            Ok(parsed) => parsed,
            Err(err) => {
                let mut state = self.inner.state.lock().await;
                if state.generation == generation {
                    state.status = SessionStatus::Unauthenticated { expired: false };
                    state.last_error = Some(err.to_string());
                }
                self.inner.audit.emit(
                    AuditEvent::new(AuditKind::LoginFailed)
                        .with("identity", credentials.identity.trim().to_lowercase())
                        .with("reason", err.to_string()),
                );
                warn!("login failed: {err}");
                return Err(err);
            }
        };

        let mut state = self.inner.state.lock().await;
        if state.generation != generation {
            debug!("login result superseded; discarding");
            return Err(Error::InvalidState {
                operation: "commit login",
                state: "superseded".to_string(),
            });
        }

        let user = outcome.user.clone().unwrap_or_else(|| UserProfile {
            id: claims.subject.clone(),
            email: credentials.identity.trim().to_lowercase(),
            name: None,
        });
        let organization = outcome.organization.clone().or(Some(OrganizationContext {
            id: claims.organization_id.clone(),
            name: None,
        }));

        if let Err(err) = self.commit_session(&mut state, outcome.token_set, user, organization) {
            state.status = SessionStatus::Unauthenticated { expired: false };
            state.last_error = Some(err.to_string());
            let _ = self.inner.store.clear();
            self.inner.audit.emit(
                AuditEvent::new(AuditKind::LoginFailed)
                    .with("identity", credentials.identity.trim().to_lowercase())
                    .with("reason", err.to_string()),
            );
            return Err(err);
        }

        self.inner.audit.emit(
            AuditEvent::new(AuditKind::LoginSucceeded)
                .with("identity", credentials.identity.trim().to_lowercase())
                .with("subject", claims.subject),
        );
        info!(status = %state.status, "login succeeded");
        Ok(state.snapshot())
    }

    /// Exchange the stored refresh token for a new token set.
    ///
    /// Triggered by the scheduler or an explicit caller; valid only while
    /// authenticated. A failure is fatal to the session: continuing on a
    /// soon-to-expire token is unsafe, so the session is cleared and forced
    /// back to `Unauthenticated`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] when not authenticated or when the result was
    /// superseded; otherwise the error that ended the session.
    pub async fn refresh(&self) -> Result<SessionSnapshot, Error> {
        let (generation, refresh_token) = {
            let mut state = self.inner.state.lock().await;
            let SessionStatus::Authenticated = state.status else {
                return Err(Error::InvalidState {
                    operation: "refresh",
                    state: state.status.to_string(),
                });
            };
            let Some(token_set) = &state.token_set else {
                return Err(Error::InvalidState {
                    operation: "refresh",
                    state: "authenticated without token".to_string(),
                });
            };
            let refresh_token = token_set.refresh_token.clone();
            state.status = SessionStatus::Refreshing;
            (state.generation, refresh_token)
        };

        let attempt = async {
            let body = with_retry(&self.inner.config.retry, "refresh", || {
                self.inner.api.refresh(&refresh_token)
            })
            .await?;
            let outcome = parse_auth_response(&body)?;
            let claims = validate_integrity(&outcome.token_set, Utc::now())?;
            Ok::<_, Error>((outcome, claims))
        }
        .await;

        let mut state = self.inner.state.lock().await;
        if state.generation != generation {
            self.inner
                .audit
                .emit(AuditEvent::new(AuditKind::RefreshDiscarded));
            debug!("refresh result superseded; discarding");
            return Err(Error::InvalidState {
                operation: "commit refresh",
                state: "superseded".to_string(),
            });
        }

        let committed = attempt.and_then(|(outcome, _claims): (AuthOutcome, TokenClaims)| {
            // The user does not change across a refresh; keep the profile.
            let user = state.current_user.clone().unwrap_or_else(|| UserProfile {
                id: String::new(),
                email: String::new(),
                name: None,
            });
            let organization = state.organization.clone();
            self.commit_session(&mut state, outcome.token_set, user, organization)
        });

        match committed {
            Ok(()) => {
                self.inner
                    .audit
                    .emit(AuditEvent::new(AuditKind::RefreshSucceeded));
                debug!("refresh succeeded, timer re-armed");
                Ok(state.snapshot())
            }
            Err(err) => {
                // Fatal: never leave a "maybe still valid" session behind.
                if let Err(clear_err) = self.inner.store.clear() {
                    warn!("failed to clear token store: {clear_err}");
                }
                state.reset(true, Some(err.to_string()));
                state.generation += 1;
                self.inner.audit.emit(
                    AuditEvent::new(AuditKind::RefreshFailed).with("reason", err.to_string()),
                );
                warn!("refresh failed, session ended: {err}");
                Err(err)
            }
        }
    }

    /// End the session. Valid from any state and never fails.
    ///
    /// Cancels the refresh timer and bumps the generation before any await
    /// on the network, so no queued callback or in-flight refresh can
    /// resurrect the cleared session. The remote logout call is best-effort
    /// and does not block local cleanup.
    pub async fn logout(&self) -> SessionSnapshot {
        let (snapshot, refresh_token) = {
            let mut state = self.inner.state.lock().await;
            state.generation += 1;
            let refresh_token = state
                .token_set
                .as_ref()
                .map(|token_set| token_set.refresh_token.clone());
            if let Err(err) = self.inner.store.clear() {
                warn!("failed to clear token store on logout: {err}");
            }
            state.reset(false, None);
            (state.snapshot(), refresh_token)
        };

        self.inner.audit.emit(AuditEvent::new(AuditKind::LoggedOut));
        info!("logged out");

        if let Some(refresh_token) = refresh_token {
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(err) = manager.inner.api.logout(&refresh_token).await {
                    debug!("best-effort remote logout failed: {err}");
                }
            });
        }

        snapshot
    }

    /// Restore a persisted session at startup.
    ///
    /// An absent, corrupt, expired, or integrity-failing entry results in a
    /// cleared store and an unauthenticated session; corruption is recovered
    /// locally and never surfaced as an error on first load.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] when called on an already-active session, or
    /// [`Error::Storage`] when re-saving the restored record fails.
    pub async fn bootstrap(&self) -> Result<SessionSnapshot, Error> {
        let mut state = self.inner.state.lock().await;
        if !matches!(state.status, SessionStatus::Unauthenticated { .. }) {
            return Err(Error::InvalidState {
                operation: "bootstrap",
                state: state.status.to_string(),
            });
        }

        let session = match self.inner.store.load() {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!("no persisted session");
                return Ok(state.snapshot());
            }
            Err(err) => {
                // Corrupt blob: purge and start clean, no user-facing error.
                warn!("persisted session unreadable, purging: {err}");
                if let Err(clear_err) = self.inner.store.clear() {
                    warn!("failed to clear corrupt entry: {clear_err}");
                }
                self.inner.audit.emit(
                    AuditEvent::new(AuditKind::SessionRestoreRejected)
                        .with("reason", err.to_string()),
                );
                return Ok(state.snapshot());
            }
        };

        let now = Utc::now();
        let rejected = if session.token_set.is_expired(now) {
            Some("token expired".to_string())
        } else {
            validate_integrity(&session.token_set, now)
                .err()
                .map(|err| err.to_string())
        };

        if let Some(reason) = rejected {
            info!("persisted session rejected: {reason}");
            if let Err(clear_err) = self.inner.store.clear() {
                warn!("failed to clear rejected entry: {clear_err}");
            }
            state.reset(true, None);
            self.inner.audit.emit(
                AuditEvent::new(AuditKind::SessionRestoreRejected).with("reason", reason),
            );
            return Ok(state.snapshot());
        }

        state.generation += 1;
        let PersistedSession {
            token_set,
            user,
            organization,
        } = session;
        let user = user.unwrap_or_else(|| UserProfile {
            id: String::new(),
            email: String::new(),
            name: None,
        });
        // Re-arm from the existing issued_at/expires_in; commit re-saves the
        // same record, which is harmless.
        self.commit_session(&mut state, token_set, user, organization)?;

        self.inner
            .audit
            .emit(AuditEvent::new(AuditKind::SessionRestored));
        info!("session restored from storage");
        Ok(state.snapshot())
    }

    /// Persist the token set, arm the refresh timer, and enter
    /// `Authenticated`. Caller holds the state lock and has verified the
    /// generation.
    fn commit_session(
        &self,
        state: &mut SessionState,
        token_set: TokenSet,
        user: UserProfile,
        organization: Option<OrganizationContext>,
    ) -> Result<(), Error> {
        self.inner.store.save(&PersistedSession {
            token_set: token_set.clone(),
            user: Some(user.clone()),
            organization: organization.clone(),
        })?;

        let delay = refresh_delay(&token_set, self.inner.config.refresh.threshold, Utc::now());
        let manager = self.clone();
        state
            .scheduler
            .arm(delay, token_set.fingerprint(), manager.scheduled_refresh());

        state.session_expires_at = Some(token_set.expires_at());
        state.token_set = Some(token_set);
        state.current_user = Some(user);
        state.organization = organization;
        state.status = SessionStatus::Authenticated;
        state.last_error = None;
        Ok(())
    }

    /// Boxed so the timer callback can re-enter `refresh` without a
    /// recursive future type.
    fn scheduled_refresh(self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            if let Err(err) = self.refresh().await {
                debug!("scheduled refresh did not complete: {err}");
            }
        })
    }
}

impl<A: AuthApi> std::fmt::Debug for SessionManager<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}
