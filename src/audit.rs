//! Structured lifecycle audit events, delivered best-effort.
//!
//! Audit logging is observability, not a correctness dependency: `emit`
//! never blocks the calling flow and delivery failures are logged locally
//! and dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Lifecycle event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditKind {
    #[serde(rename = "LOGIN_SUCCEEDED")]
    LoginSucceeded,
    #[serde(rename = "LOGIN_FAILED")]
    LoginFailed,
    #[serde(rename = "LOGIN_RATE_LIMITED")]
    LoginRateLimited,
    #[serde(rename = "REFRESH_SUCCEEDED")]
    RefreshSucceeded,
    #[serde(rename = "REFRESH_FAILED")]
    RefreshFailed,
    /// A refresh completed after being superseded by a logout or a newer
    /// login; its result was discarded.
    #[serde(rename = "REFRESH_DISCARDED")]
    RefreshDiscarded,
    #[serde(rename = "LOGGED_OUT")]
    LoggedOut,
    #[serde(rename = "SESSION_RESTORED")]
    SessionRestored,
    #[serde(rename = "SESSION_RESTORE_REJECTED")]
    SessionRestoreRejected,
}

/// Write-once, append-only event record. Never read back by this crate.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    #[serde(rename = "type")]
    pub kind: AuditKind,
    pub timestamp: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(kind: AuditKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// External delivery target for audit events. Owned outside this crate.
pub trait AuditSink: Send + Sync {
    /// Deliver one event.
    ///
    /// # Errors
    ///
    /// Implementations may fail; failures are logged and dropped by the
    /// logger, never surfaced to the session flow.
    fn deliver(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

/// Default sink: structured `tracing` output.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn deliver(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        info!(target: "legitimi::audit", %payload, "audit event");
        Ok(())
    }
}

/// Buffered, non-blocking front-end over an [`AuditSink`].
///
/// A spawned drain task forwards events to the sink; dropping every clone of
/// the logger shuts the drain task down once the queue is empty.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    sender: mpsc::UnboundedSender<AuditEvent>,
}

impl AuditLogger {
    /// Spawn the drain task and return the logger handle.
    #[must_use]
    pub fn spawn(sink: Arc<dyn AuditSink>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<AuditEvent>();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(err) = sink.deliver(&event) {
                    warn!(kind = ?event.kind, "audit delivery failed: {err}");
                }
            }
        });
        Self { sender }
    }

    /// Queue an event. Never blocks and never fails the caller; if the drain
    /// task is gone the event is dropped with a local warning.
    pub fn emit(&self, event: AuditEvent) {
        if self.sender.send(event).is_err() {
            warn!("audit drain task is gone; event dropped");
        }
    }
}
