//! # Legitimi (Credential Lifecycle Manager)
//!
//! `legitimi` owns the security-critical slice of the portal frontend: it
//! authenticates a user, stores and proactively refreshes tokens, throttles
//! login attempts, validates token claims, and drives session state
//! transitions safely under concurrent and asynchronous conditions.
//!
//! ## Lifecycle
//!
//! `login(credentials)` runs the rate-limiter gate, the remote login call
//! (with bounded retries for transient failures), response validation, the
//! claims integrity check, encrypted persistence, and arms a single refresh
//! timer. The timer triggers the same pipeline minus the rate limiter; an
//! explicit `logout()` or a fatal refresh failure tears everything down.
//!
//! ## Consistency model
//!
//! One logical session per [`session::SessionManager`]. Every operation that
//! spans a suspension point captures the session's generation counter at
//! start and commits only if it is unchanged at completion, so a refresh
//! that lands after a logout (or a newer login) is discarded instead of
//! resurrecting a cleared session.
//!
//! ## Limits
//!
//! Token claims are decoded without signature verification; the client holds
//! no verification key, so the integrity check guards against stale or
//! truncated tokens, not forged ones. The login rate limiter is defense in
//! depth only; the server remains the authoritative throttle.

pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod rate_limit;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod token;

pub use api::{AuthApi, HttpAuthApi};
pub use audit::{AuditEvent, AuditKind, AuditLogger, AuditSink, TracingSink};
pub use config::Config;
pub use error::Error;
pub use session::{SessionManager, SessionSnapshot, SessionStatus};
pub use store::{FileStorage, MemoryStorage, SecureTokenStore, StorageBackend};
pub use token::{Credentials, TokenClaims, TokenSet};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
