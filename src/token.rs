//! Token data model: credentials, token sets, and claims.
//!
//! Claims are decoded without signature verification; the client holds no
//! verification key. The integrity check is a claims/expiry liveness check,
//! not a defense against forged tokens.

use crate::error::{Error, IntegrityReason};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Login input. Ephemeral: lives only for the duration of one login call and
/// is never persisted or logged.
pub struct Credentials {
    pub identity: String,
    pub secret: SecretString,
    pub mfa_code: Option<String>,
}

impl Credentials {
    #[must_use]
    pub fn new(identity: impl Into<String>, secret: SecretString) -> Self {
        Self {
            identity: identity.into(),
            secret,
            mfa_code: None,
        }
    }

    #[must_use]
    pub fn with_mfa_code(mut self, code: impl Into<String>) -> Self {
        self.mfa_code = Some(code.into());
        self
    }

    /// Cheap client-side pre-check before the rate limiter or network are
    /// touched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty secret or a malformed
    /// email identity.
    pub fn validate(&self) -> Result<(), Error> {
        use secrecy::ExposeSecret;

        let identity = self.identity.trim();
        if identity.is_empty() {
            return Err(Error::validation("identity", "must not be empty"));
        }
        if !valid_email(identity) {
            return Err(Error::validation("identity", "must be an email address"));
        }
        if self.secret.expose_secret().is_empty() {
            return Err(Error::validation("secret", "must not be empty"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("secret", &"***")
            .field("mfa_code", &self.mfa_code.as_deref().map(|_| "***"))
            .finish()
    }
}

/// Basic email format check on already-trimmed input.
fn valid_email(identity: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(identity))
}

/// The access/refresh token pair issued by the auth server.
///
/// Immutable: a refresh produces a new `TokenSet`, never mutates one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub issued_at: DateTime<Utc>,
    pub expires_in_seconds: u64,
}

impl TokenSet {
    /// `issued_at + expires_in_seconds`. Saturates on absurd lifetimes
    /// instead of panicking.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.expires_in_seconds)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .and_then(|lifetime| self.issued_at.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Short stable identifier for log and scheduler correlation. Derived
    /// from a hash so the token itself never appears in logs.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.access_token.as_bytes());
        digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
    }
}

/// Profile fields returned next to the token pair on login.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Organization scope the session operates under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrganizationContext {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Parsed login/refresh response: the token set plus optional profile data.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub token_set: TokenSet,
    pub user: Option<UserProfile>,
    pub organization: Option<OrganizationContext>,
}

/// Schema-check a raw login/refresh response body into a typed [`AuthOutcome`].
///
/// `issued_at` is stamped with the current wall clock; the server reports a
/// relative `expiresInSeconds` only.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming the first missing or mistyped field.
pub fn parse_auth_response(body: &serde_json::Value) -> Result<AuthOutcome, Error> {
    let access_token = require_string(body, "accessToken")?;
    let refresh_token = require_string(body, "refreshToken")?;
    let token_type = require_string(body, "tokenType")?;

    let expires_in_seconds = body
        .get("expiresInSeconds")
        .ok_or_else(|| Error::validation("expiresInSeconds", "missing"))?
        .as_u64()
        .filter(|&seconds| seconds > 0)
        .ok_or_else(|| Error::validation("expiresInSeconds", "must be a positive integer"))?;

    let user = body
        .get("user")
        .filter(|value| !value.is_null())
        .map(|value| {
            serde_json::from_value::<UserProfile>(value.clone())
                .map_err(|err| Error::validation("user", err.to_string()))
        })
        .transpose()?;

    let organization = body
        .get("organization")
        .filter(|value| !value.is_null())
        .map(|value| {
            serde_json::from_value::<OrganizationContext>(value.clone())
                .map_err(|err| Error::validation("organization", err.to_string()))
        })
        .transpose()?;

    Ok(AuthOutcome {
        token_set: TokenSet {
            access_token,
            refresh_token,
            token_type,
            issued_at: Utc::now(),
            expires_in_seconds,
        },
        user,
        organization,
    })
}

fn require_string(body: &serde_json::Value, field: &str) -> Result<String, Error> {
    let value = body
        .get(field)
        .ok_or_else(|| Error::validation(field, "missing"))?;
    let text = value
        .as_str()
        .ok_or_else(|| Error::validation(field, "must be a string"))?;
    if text.is_empty() {
        return Err(Error::validation(field, "must not be empty"));
    }
    Ok(text.to_string())
}

/// Claims embedded in the access token. Derived on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub subject: String,
    pub role: String,
    pub organization_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: Option<String>,
    role: Option<String>,
    org: Option<String>,
    exp: Option<i64>,
}

/// Decode the claims segment of a JWT-shaped access token.
///
/// No signature verification is attempted.
fn decode_claims(access_token: &str) -> Result<RawClaims, Error> {
    let mut segments = access_token.split('.');
    let payload = match (segments.next(), segments.next()) {
        (Some(_), Some(payload)) => payload,
        _ => return Err(Error::Integrity(IntegrityReason::Undecodable)),
    };

    let bytes = Base64UrlUnpadded::decode_vec(payload)
        .map_err(|_| Error::Integrity(IntegrityReason::Undecodable))?;
    serde_json::from_slice(&bytes).map_err(|_| Error::Integrity(IntegrityReason::Undecodable))
}

/// Validate a token set's claims: decodable, unexpired, and carrying the
/// required `sub`, `role`, and `org` claims.
///
/// Runs after login, after every refresh, and before trusting a token loaded
/// from storage at startup.
///
/// # Errors
///
/// Returns [`Error::Integrity`] with the failing reason.
pub fn validate_integrity(token_set: &TokenSet, now: DateTime<Utc>) -> Result<TokenClaims, Error> {
    let raw = decode_claims(&token_set.access_token)?;

    let exp = raw
        .exp
        .ok_or(Error::Integrity(IntegrityReason::Expired))?;
    let expires_at = DateTime::<Utc>::from_timestamp(exp, 0)
        .ok_or(Error::Integrity(IntegrityReason::Undecodable))?;
    if expires_at <= now {
        return Err(Error::Integrity(IntegrityReason::Expired));
    }

    let subject = raw
        .sub
        .filter(|claim| !claim.is_empty())
        .ok_or(Error::Integrity(IntegrityReason::MissingClaim("sub")))?;
    let role = raw
        .role
        .filter(|claim| !claim.is_empty())
        .ok_or(Error::Integrity(IntegrityReason::MissingClaim("role")))?;
    let organization_id = raw
        .org
        .filter(|claim| !claim.is_empty())
        .ok_or(Error::Integrity(IntegrityReason::MissingClaim("org")))?;

    Ok(TokenClaims {
        subject,
        role,
        organization_id,
        expires_at,
    })
}
